//! Cluster Designation
//!
//! The designation document names which member of the pair should be the
//! master. It is written by an external tool; the agent only reads it and
//! takes detached snapshots for in-flight work.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Desired roles of the two cluster members
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesignationStatus {
    pub master: String,
    pub slave: String,
    #[serde(default)]
    pub update_time: String,
}

impl DesignationStatus {
    /// Same master and slave, update time ignored
    pub fn same_roles(&self, other: &DesignationStatus) -> bool {
        self.master == other.master && self.slave == other.slave
    }
}

impl std::fmt::Display for DesignationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Master:{}, Slave:{}, updateTime:{}",
            self.master, self.slave, self.update_time
        )
    }
}

/// Shared data location of the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPath {
    pub data: String,
}

/// Cluster designation document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDesignation {
    pub local_host: String,
    pub remote_host: String,
    #[serde(default)]
    pub sync_secret: String,
    #[serde(default)]
    pub data_path: Option<DataPath>,
    #[serde(default)]
    pub tmp_path: String,
    #[serde(default)]
    pub status: Option<DesignationStatus>,
}

impl ClusterDesignation {
    /// Parse a designation from JSON
    pub fn from_json(content: &str) -> Result<Self> {
        let mut designation: ClusterDesignation = serde_json::from_str(content)
            .map_err(|e| Error::Designation(format!("invalid designation: {}", e)))?;
        designation.tmp_path = designation.tmp_path.trim_end_matches('/').to_string();
        Ok(designation)
    }

    /// Load a designation from its file
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Designation(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Check whether two designations ask for the same roles.
    ///
    /// A designation without status is never role-equal to one with status;
    /// two without status are equal.
    pub fn role_equal(&self, other: &ClusterDesignation) -> bool {
        match (&self.status, &other.status) {
            (Some(a), Some(b)) => a.same_roles(b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Whether this node is designated master
    pub fn is_local_master(&self) -> Result<bool> {
        let status = self.status()?;
        Ok(self.local_host == status.master)
    }

    /// Desired roles, or an error when the document carries none
    pub fn status(&self) -> Result<&DesignationStatus> {
        self.status
            .as_ref()
            .ok_or_else(|| Error::Designation("designation has no status".into()))
    }

    /// Detached copy used by in-flight switches
    pub fn snapshot(&self) -> ClusterDesignation {
        self.clone()
    }

    /// Path relative to the tmp path, matched on whole components
    pub fn relative_to_tmp(&self, path: &str) -> Result<String> {
        let not_under = || {
            Error::Designation(format!(
                "path {} is not under tmp path '{}'",
                path, self.tmp_path
            ))
        };

        if self.tmp_path.is_empty() {
            return Err(not_under());
        }

        Path::new(path)
            .strip_prefix(&self.tmp_path)
            .ok()
            .and_then(|rest| rest.to_str())
            .filter(|rest| !rest.is_empty())
            .map(str::to_string)
            .ok_or_else(not_under)
    }
}
