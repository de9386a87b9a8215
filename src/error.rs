//! WolfHA Error Types

use thiserror::Error;

/// Result type alias for WolfHA operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfHA error types
#[derive(Error, Debug)]
pub enum Error {
    // Role switch errors
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Remote {host} is not eligible to be followed: {reason}")]
    RemoteNotEligible { host: String, reason: String },

    #[error("Promotion of {service} blocked: slave is {behind_seconds}s behind its master")]
    PromotionBlocked { service: String, behind_seconds: u64 },

    #[error("Corrupt binlog marker: {0}")]
    CorruptBinlogMarker(String),

    #[error("Probe failed on {service}: {reason}")]
    ProbeFailed { service: String, reason: String },

    #[error("Remote call to {host} failed: {reason}")]
    RemoteCallFailed { host: String, reason: String },

    #[error("Failed to persist {path}: {reason}")]
    PersistFailed { path: String, reason: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Designation error: {0}")]
    Designation(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Collaborator errors
    #[error("Compute driver error: {0}")]
    Driver(String),

    #[error("Sync failed: {0}")]
    SyncFailed(String),

    #[error("Alarm delivery failed: {0}")]
    Alarm(String),

    #[error("Network error: {0}")]
    Network(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            Error::ServiceNotFound(_) => "SERVICE_NOT_FOUND",
            Error::RemoteNotEligible { .. } => "REMOTE_NOT_ELIGIBLE",
            Error::PromotionBlocked { .. } => "PROMOTION_BLOCKED",
            Error::CorruptBinlogMarker(_) => "CORRUPT_BINLOG_MARKER",
            Error::ProbeFailed { .. } => "PROBE_FAILED",
            Error::RemoteCallFailed { .. } => "REMOTE_CALL_FAILED",
            Error::PersistFailed { .. } => "PERSIST_FAILED",
            Error::Config(_) | Error::ConfigParse(_) => "CONFIG_ERROR",
            Error::Designation(_) => "DESIGNATION_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Driver(_) => "DRIVER_ERROR",
            Error::SyncFailed(_) => "SYNC_FAILED",
            Error::Alarm(_) => "ALARM_FAILED",
            Error::Network(_) => "NETWORK_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Check if this error came from talking to the remote peer
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Error::RemoteCallFailed { .. } | Error::RemoteNotEligible { .. } | Error::Network(_)
        )
    }

    pub(crate) fn probe(service: &str, reason: impl std::fmt::Display) -> Self {
        Error::ProbeFailed {
            service: service.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn remote(host: &str, reason: impl std::fmt::Display) -> Self {
        Error::RemoteCallFailed {
            host: host.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = Error::PromotionBlocked {
            service: "mariadb-01".to_string(),
            behind_seconds: 5,
        };
        assert_eq!(err.code(), "PROMOTION_BLOCKED");
        assert!(err.to_string().contains("5s behind"));

        assert!(Error::remote("10.0.0.2", "timeout").is_remote());
        assert!(!Error::probe("mariadb-01", "exit 1").is_remote());
    }
}
