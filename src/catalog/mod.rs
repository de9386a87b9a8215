//! Catalog Handlers
//!
//! One handler per kind of managed database. The reconciler and the HTTP
//! layer only see the [`CatalogHandler`] capability and look handlers up
//! through a [`CatalogSet`].

pub mod mariadb;

pub use mariadb::{MariaDbCatalog, StateStore, StoredState};

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::designation::ClusterDesignation;
use crate::error::{Error, Result};
use crate::service::{Catalog, ServiceInfo};
use crate::status::{ReplicationReport, SlaveStatus};

/// Replication role of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Slave => write!(f, "slave"),
        }
    }
}

/// Operations a catalog supports on its services
#[async_trait::async_trait]
pub trait CatalogHandler: Send + Sync {
    /// Catalog served by this handler
    fn catalog(&self) -> Catalog;

    /// Create a service with default settings
    async fn create(&self, name: &str, designation: &ClusterDesignation) -> Result<ServiceInfo>;

    async fn destroy(&self, name: &str) -> Result<()>;

    async fn start(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;

    /// Bring the service into the role the designation asks of this node
    async fn switch_role(&self, name: &str, designation: &ClusterDesignation) -> Result<Role>;

    /// Current master and slave status
    async fn probe(&self, name: &str) -> Result<ReplicationReport>;

    /// Current slave status only
    async fn probe_slave(&self, name: &str) -> Result<SlaveStatus>;

    /// Take a full backup; returns its location on the host
    async fn backup(&self, name: &str) -> Result<String>;

    /// Replace the local data with a fresh backup of the peer's
    async fn restore(&self, name: &str, designation: &ClusterDesignation) -> Result<()>;

    /// Last persisted replication records
    async fn stored_state(&self, name: &str) -> Result<StoredState>;
}

/// Handlers by catalog
#[derive(Default, Clone)]
pub struct CatalogSet {
    handlers: BTreeMap<Catalog, Arc<dyn CatalogHandler>>,
}

impl CatalogSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for its catalog
    pub fn register(&mut self, handler: Arc<dyn CatalogHandler>) {
        self.handlers.insert(handler.catalog(), handler);
    }

    pub fn get(&self, catalog: Catalog) -> Result<Arc<dyn CatalogHandler>> {
        self.handlers
            .get(&catalog)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("no handler for catalog {}", catalog)))
    }

    pub fn catalogs(&self) -> Vec<Catalog> {
        self.handlers.keys().copied().collect()
    }
}
