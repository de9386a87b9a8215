//! Remote Peer
//!
//! Client side of the agent-to-agent API and the bulk sync transport used
//! to copy backups between the two nodes.

pub mod sync;

pub use sync::{RsyncTransport, SyncTransport};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::AgentConfig;
use crate::designation::ClusterDesignation;
use crate::error::{Error, Result};
use crate::service::{Catalog, ServiceInfo};
use crate::status::ReplicationReport;

/// Path prefix of the authenticated agent API
pub const API_PREFIX: &str = "/api/v1";

/// Header carrying the shared secret
pub const API_KEY_HEADER: &str = "x-wolfha-key";

/// Query parameter carrying the shared secret
pub const API_KEY_QUERY: &str = "apiKey";

/// Remote agent address and credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTarget {
    pub host: String,
    pub secret: String,
}

impl PeerTarget {
    /// The remote member named by a designation
    pub fn remote_of(designation: &ClusterDesignation) -> Self {
        Self {
            host: designation.remote_host.clone(),
            secret: designation.sync_secret.clone(),
        }
    }
}

/// Response of a remote backup request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupResult {
    pub data_path: String,
}

/// Error body returned by the agent API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Calls served by the remote agent
#[async_trait::async_trait]
pub trait PeerApi: Send + Sync {
    /// Master and slave status of the remote instance of a service
    async fn query_status(&self, peer: &PeerTarget, service: &str) -> Result<ReplicationReport>;

    /// Have the remote back up a service; returns the backup location
    async fn request_backup(&self, peer: &PeerTarget, service: &str) -> Result<String>;

    /// Description of the remote instance of a service
    async fn query_service(&self, peer: &PeerTarget, service: &str, catalog: Catalog) -> Result<ServiceInfo>;
}

/// HTTP client for the remote agent API
pub struct PeerClient {
    client: reqwest::Client,
    port: u16,
    status_timeout: Duration,
    backup_timeout: Duration,
}

impl PeerClient {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.peer.connect_timeout_secs))
            .build()
            .map_err(|e| Error::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            port: config.peer_port(),
            status_timeout: Duration::from_secs(config.peer.status_timeout_secs),
            backup_timeout: Duration::from_secs(config.peer.backup_timeout_secs),
        })
    }

    fn url(&self, peer: &PeerTarget, path: &str) -> String {
        format!("http://{}:{}{}{}", peer.host, self.port, API_PREFIX, path)
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        peer: &PeerTarget,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = request
            .header(API_KEY_HEADER, &peer.secret)
            .query(&[(API_KEY_QUERY, &peer.secret)])
            .send()
            .await
            .map_err(|e| Error::remote(&peer.host, e))?;

        let status = response.status();
        if !status.is_success() {
            let reason = match response.json::<ErrorResponse>().await {
                Ok(body) => format!("{} ({}): {}", status, body.code, body.error),
                Err(_) => status.to_string(),
            };
            return Err(Error::remote(&peer.host, reason));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| Error::remote(&peer.host, format!("invalid response: {}", e)))
    }
}

#[async_trait::async_trait]
impl PeerApi for PeerClient {
    async fn query_status(&self, peer: &PeerTarget, service: &str) -> Result<ReplicationReport> {
        tracing::info!("Querying replication status of {} on {}", service, peer.host);
        let request = self
            .client
            .get(self.url(peer, &format!("/status/{}", service)))
            .timeout(self.status_timeout);
        self.send(peer, request).await
    }

    async fn request_backup(&self, peer: &PeerTarget, service: &str) -> Result<String> {
        tracing::info!("Requesting backup of {} from {}", service, peer.host);
        let request = self
            .client
            .get(self.url(peer, &format!("/backup/{}", service)))
            .timeout(self.backup_timeout);
        let result: BackupResult = self.send(peer, request).await?;
        Ok(result.data_path)
    }

    async fn query_service(&self, peer: &PeerTarget, service: &str, catalog: Catalog) -> Result<ServiceInfo> {
        let request = self
            .client
            .post(self.url(peer, &format!("/query/{}", service)))
            .query(&[("catalog", catalog.as_str())])
            .timeout(self.status_timeout);
        self.send(peer, request).await
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Peer answering from fixed records
    #[derive(Default)]
    pub struct FakePeer {
        pub report: Mutex<Option<ReplicationReport>>,
        pub backup_path: Mutex<Option<String>>,
        pub services: Mutex<HashMap<String, ServiceInfo>>,
        pub backups_requested: Mutex<u32>,
    }

    impl FakePeer {
        pub fn with_report(report: ReplicationReport) -> Self {
            let peer = Self::default();
            *peer.report.lock().unwrap() = Some(report);
            peer
        }

        pub fn add_service(&self, service: ServiceInfo) {
            self.services.lock().unwrap().insert(service.name.clone(), service);
        }
    }

    #[async_trait::async_trait]
    impl PeerApi for FakePeer {
        async fn query_status(&self, peer: &PeerTarget, _service: &str) -> Result<ReplicationReport> {
            self.report
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| Error::remote(&peer.host, "connection refused"))
        }

        async fn request_backup(&self, peer: &PeerTarget, _service: &str) -> Result<String> {
            *self.backups_requested.lock().unwrap() += 1;
            self.backup_path
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| Error::remote(&peer.host, "backup failed"))
        }

        async fn query_service(&self, peer: &PeerTarget, service: &str, _catalog: Catalog) -> Result<ServiceInfo> {
            self.services
                .lock()
                .unwrap()
                .get(service)
                .cloned()
                .ok_or_else(|| Error::remote(&peer.host, "404 Not Found"))
        }
    }
}
