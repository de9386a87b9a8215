//! Service Model
//!
//! Describes the local database services managed by the agent and
//! tracks which of them currently exist.

mod registry;

pub use registry::ServiceRegistry;

use std::collections::BTreeMap;
use std::path::PathBuf;
use serde::{Deserialize, Serialize};

/// Kind of managed service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Catalog {
    /// MariaDB master/slave pair
    Mariadb,
}

impl Catalog {
    pub fn as_str(&self) -> &'static str {
        match self {
            Catalog::Mariadb => "mariadb",
        }
    }
}

impl std::fmt::Display for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Catalog {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mariadb" => Ok(Catalog::Mariadb),
            other => Err(crate::Error::Config(format!("unknown catalog '{}'", other))),
        }
    }
}

/// Services grouped by catalog, ordered for deterministic draining
pub type CatalogServices = BTreeMap<Catalog, Vec<String>>;

/// Filesystem paths of a service, as seen from the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volumes {
    pub conf_path: PathBuf,
    pub data_path: PathBuf,
    pub back_path: PathBuf,
}

/// Database credentials
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub root: String,
    pub password: String,
}

/// Network endpoint of a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A managed service instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub name: String,
    pub catalog: Catalog,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Volumes,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub endpoint: Endpoint,
    #[serde(default)]
    pub available: bool,
}

impl ServiceInfo {
    /// Create a service description with empty paths and credentials
    pub fn new(name: impl Into<String>, catalog: Catalog) -> Self {
        Self {
            name: name.into(),
            catalog,
            image: String::new(),
            labels: BTreeMap::new(),
            volumes: Volumes::default(),
            credentials: Credentials::default(),
            endpoint: Endpoint::default(),
            available: false,
        }
    }
}

impl std::fmt::Display for ServiceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.catalog, self.name)
    }
}

/// Lifecycle notification emitted by the compute driver
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Added(ServiceInfo),
    Modified(ServiceInfo),
    Removed(ServiceInfo),
}

impl ServiceEvent {
    pub fn service(&self) -> &ServiceInfo {
        match self {
            ServiceEvent::Added(s) | ServiceEvent::Modified(s) | ServiceEvent::Removed(s) => s,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ServiceEvent::Added(_) => "added",
            ServiceEvent::Modified(_) => "modified",
            ServiceEvent::Removed(_) => "removed",
        }
    }
}

/// Backup directory transfer between peers, relative to the designation tmp path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncInfo {
    pub name: String,
    pub local: String,
    pub remote: String,
}

impl std::fmt::Display for SyncInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "local:{},remote:{}", self.local, self.remote)
    }
}
