//! MariaDB Catalog
//!
//! Master/slave MariaDB pairs: service lifecycle, probes, backups and the
//! role switch protocol.

mod command;
mod persist;
mod switch;

pub use command::MariaDbCommands;
pub use persist::{StateStore, StoredState};
pub use switch::check_remote_eligible;

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;

use super::{CatalogHandler, Role};
use crate::config::{AgentConfig, MariaDbConfig};
use crate::designation::ClusterDesignation;
use crate::driver::ComputeDriver;
use crate::error::{Error, Result};
use crate::peer::{PeerApi, SyncTransport};
use crate::service::{Catalog, Credentials, Endpoint, ServiceInfo, ServiceRegistry, Volumes};
use crate::status::{ReplicationReport, SlaveStatus};

/// Handler for the MariaDB catalog
pub struct MariaDbCatalog {
    driver: Arc<dyn ComputeDriver>,
    registry: Arc<ServiceRegistry>,
    peer: Arc<dyn PeerApi>,
    sync: Arc<dyn SyncTransport>,
    commands: MariaDbCommands,
    config: MariaDbConfig,
    resync_window: chrono::Duration,
    conf_dir: PathBuf,
    data_dir: PathBuf,
    backup_dir: PathBuf,
}

impl MariaDbCatalog {
    pub fn new(
        config: &AgentConfig,
        driver: Arc<dyn ComputeDriver>,
        registry: Arc<ServiceRegistry>,
        peer: Arc<dyn PeerApi>,
        sync: Arc<dyn SyncTransport>,
    ) -> Self {
        Self {
            commands: MariaDbCommands::new(driver.clone(), &config.mariadb),
            driver,
            registry,
            peer,
            sync,
            config: config.mariadb.clone(),
            resync_window: config.resync_window(),
            conf_dir: config.conf_dir(),
            data_dir: config.data_dir(),
            backup_dir: config.backup_dir(),
        }
    }

    /// Look a service up in the registry
    async fn resolve(&self, name: &str) -> Result<ServiceInfo> {
        self.registry
            .get(name)
            .await
            .filter(|s| s.catalog == Catalog::Mariadb)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    /// Default description of a new service.
    ///
    /// Backups live under the designation tmp path so the sync transport
    /// can reach them.
    fn default_service(&self, name: &str, designation: &ClusterDesignation) -> ServiceInfo {
        let back_path = if designation.tmp_path.is_empty() {
            self.backup_dir.join(name)
        } else {
            PathBuf::from(&designation.tmp_path).join(name)
        };

        ServiceInfo {
            image: self.config.image.clone(),
            volumes: Volumes {
                conf_path: self.conf_dir.join(name),
                data_path: self.data_dir.join(name),
                back_path,
            },
            credentials: Credentials {
                root: self.config.root_user.clone(),
                password: self.config.root_password.clone(),
            },
            endpoint: Endpoint {
                host: designation.local_host.clone(),
                port: self.config.port,
            },
            ..ServiceInfo::new(name, Catalog::Mariadb)
        }
    }
}

#[async_trait::async_trait]
impl CatalogHandler for MariaDbCatalog {
    fn catalog(&self) -> Catalog {
        Catalog::Mariadb
    }

    async fn create(&self, name: &str, designation: &ClusterDesignation) -> Result<ServiceInfo> {
        let service = self.default_service(name, designation);
        tracing::info!("Creating {} at {}", service, service.endpoint);
        self.driver.create_service(&service).await?;
        Ok(service)
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        let service = self.driver.query_service(name, Catalog::Mariadb).await?;
        self.driver.destroy_service(&service).await
    }

    async fn start(&self, name: &str) -> Result<()> {
        let service = self.driver.query_service(name, Catalog::Mariadb).await?;
        self.driver.start_service(&service).await
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let service = self.driver.query_service(name, Catalog::Mariadb).await?;
        self.driver.stop_service(&service).await
    }

    async fn switch_role(&self, name: &str, designation: &ClusterDesignation) -> Result<Role> {
        self.switch_role_at(name, designation, Utc::now()).await
    }

    async fn probe(&self, name: &str) -> Result<ReplicationReport> {
        let service = self.resolve(name).await?;
        let now = Utc::now();
        let master = self.commands.master_status(&service, now).await?;
        let slave = self.commands.slave_status(&service, now).await?;
        Ok(ReplicationReport {
            master_status: Some(master),
            slave_status: Some(slave),
        })
    }

    async fn probe_slave(&self, name: &str) -> Result<SlaveStatus> {
        let service = self.resolve(name).await?;
        self.commands.slave_status(&service, Utc::now()).await
    }

    async fn backup(&self, name: &str) -> Result<String> {
        let service = self.resolve(name).await?;
        tracing::info!("Backing up {}", service);
        self.commands.backup(&service).await?;
        Ok(service.volumes.back_path.display().to_string())
    }

    async fn restore(&self, name: &str, designation: &ClusterDesignation) -> Result<()> {
        let service = self.resolve(name).await?;
        self.resync(&service, designation).await
    }

    async fn stored_state(&self, name: &str) -> Result<StoredState> {
        let service = self.resolve(name).await?;
        StateStore::new(&service.volumes.back_path).load_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;
    use crate::peer::fake::FakePeer;
    use crate::peer::sync::fake::FakeSync;

    fn catalog(driver: Arc<MockDriver>, registry: Arc<ServiceRegistry>) -> MariaDbCatalog {
        let mut config = AgentConfig::default();
        config.node.workspace = PathBuf::from("/srv/wolfha");
        MariaDbCatalog::new(
            &config,
            driver,
            registry,
            Arc::new(FakePeer::default()),
            Arc::new(FakeSync::default()),
        )
    }

    #[tokio::test]
    async fn test_create_uses_defaults() {
        let driver = Arc::new(MockDriver::new());
        let registry = Arc::new(ServiceRegistry::new([Catalog::Mariadb]));
        let handler = catalog(driver.clone(), registry);

        let designation = ClusterDesignation::from_json(
            r#"{"localHost":"10.0.0.1","remoteHost":"10.0.0.2","tmpPath":"/var/tmp/wolfha"}"#,
        )
        .unwrap();
        let service = handler.create("mariadb-01", &designation).await.unwrap();

        assert_eq!(service.endpoint.to_string(), "10.0.0.1:3306");
        assert_eq!(service.credentials.root, "root");
        assert_eq!(service.volumes.data_path, PathBuf::from("/srv/wolfha/data/mariadb-01"));
        assert_eq!(service.volumes.back_path, PathBuf::from("/var/tmp/wolfha/mariadb-01"));
        assert!(driver.called("create mariadb-01"));

        handler.stop("mariadb-01").await.unwrap();
        handler.destroy("mariadb-01").await.unwrap();
        assert!(driver.called("stop mariadb-01"));
        assert!(driver.called("destroy mariadb-01"));
    }

    #[tokio::test]
    async fn test_unregistered_service() {
        let driver = Arc::new(MockDriver::new());
        let registry = Arc::new(ServiceRegistry::new([Catalog::Mariadb]));
        let handler = catalog(driver, registry);

        assert!(matches!(
            handler.probe("mariadb-09").await,
            Err(Error::ServiceNotFound(_))
        ));
        assert!(matches!(
            handler.backup("mariadb-09").await,
            Err(Error::ServiceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_probe_and_backup() {
        let driver = Arc::new(MockDriver::new());
        driver.respond("SHOW MASTER STATUS", "File: mysql-bin.000003\nPosition: 42\n");
        driver.respond("SHOW SLAVE STATUS", "");
        let registry = Arc::new(ServiceRegistry::new([Catalog::Mariadb]));
        let mut service = ServiceInfo::new("mariadb-01", Catalog::Mariadb);
        service.volumes.back_path = PathBuf::from("/var/tmp/wolfha/mariadb-01");
        registry.upsert(service).await;
        let handler = catalog(driver.clone(), registry);

        let report = handler.probe("mariadb-01").await.unwrap();
        assert_eq!(report.master_status.unwrap().log_pos, 42);
        assert!(!report.slave_status.unwrap().enabled);

        assert_eq!(
            handler.backup("mariadb-01").await.unwrap(),
            "/var/tmp/wolfha/mariadb-01"
        );
        assert!(driver.called("mariadb-01-backup"));
    }
}
