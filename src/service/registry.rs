//! Service Registry
//!
//! Tracks the local services of the managed catalogs, fed by the
//! compute driver's add/modify/remove notifications.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use tokio::sync::RwLock;

use super::{Catalog, ServiceInfo};
use crate::error::Result;
use crate::status::SlaveStatus;

/// Registry of local services, keyed by service name
pub struct ServiceRegistry {
    /// Catalogs tracked by this registry
    catalogs: HashSet<Catalog>,
    /// Known services
    services: RwLock<HashMap<String, ServiceInfo>>,
}

impl ServiceRegistry {
    /// Create a registry tracking the given catalogs
    pub fn new(catalogs: impl IntoIterator<Item = Catalog>) -> Self {
        Self {
            catalogs: catalogs.into_iter().collect(),
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Check whether a catalog is managed by this registry
    pub fn is_managed(&self, catalog: Catalog) -> bool {
        self.catalogs.contains(&catalog)
    }

    /// Add or update a service. Returns false if its catalog is not managed.
    pub async fn upsert(&self, service: ServiceInfo) -> bool {
        if !self.is_managed(service.catalog) {
            return false;
        }

        let mut services = self.services.write().await;
        services.insert(service.name.clone(), service);
        true
    }

    /// Remove a service
    pub async fn remove(&self, service: &ServiceInfo) -> Option<ServiceInfo> {
        if !self.is_managed(service.catalog) {
            return None;
        }

        let mut services = self.services.write().await;
        services.remove(&service.name)
    }

    /// Get a service by name
    pub async fn get(&self, name: &str) -> Option<ServiceInfo> {
        let services = self.services.read().await;
        services.get(name).cloned()
    }

    /// List services of a catalog, ordered by name
    pub async fn list(&self, catalog: Catalog) -> Vec<ServiceInfo> {
        let services = self.services.read().await;
        let mut list: Vec<ServiceInfo> = services
            .values()
            .filter(|s| s.catalog == catalog)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Snapshot of all tracked services, ordered by name
    pub async fn all(&self) -> Vec<ServiceInfo> {
        let services = self.services.read().await;
        let mut list: Vec<ServiceInfo> = services.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Number of tracked services
    pub async fn len(&self) -> usize {
        self.services.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.services.read().await.is_empty()
    }

    /// True iff every tracked service is available
    pub async fn health_status(&self) -> bool {
        let services = self.services.read().await;
        let mut healthy = true;
        for service in services.values() {
            if !service.available {
                tracing::warn!("Health check: {} is not available", service);
                healthy = false;
            }
        }
        healthy
    }

    /// True iff every tracked service that is an enabled slave has zero lag.
    ///
    /// Probes run on a snapshot, never while holding the registry lock.
    /// A probe error makes the node not ready.
    pub async fn ready_status<F, Fut>(&self, probe: F) -> bool
    where
        F: Fn(ServiceInfo) -> Fut,
        Fut: Future<Output = Result<SlaveStatus>>,
    {
        let snapshot = self.all().await;

        let mut ready = true;
        for service in snapshot {
            let name = service.to_string();
            match probe(service).await {
                Ok(status) => {
                    if status.enabled && status.behind_seconds > 0 {
                        tracing::warn!(
                            "Ready check: {} is {}s behind its master",
                            name,
                            status.behind_seconds
                        );
                        ready = false;
                    }
                }
                Err(e) => {
                    tracing::warn!("Ready check: probe of {} failed: {}", name, e);
                    ready = false;
                }
            }
        }

        ready
    }
}
