//! WolfHA Configuration
//!
//! This module provides configuration structures for the WolfHA
//! role agent. The cluster designation document is not part of this
//! file; see [`crate::designation`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::service::Catalog;

/// Environment variable overriding the port of the remote agent API
pub const NODE_PORT_ENV: &str = "WOLFHA_NODE_PORT";

/// Main WolfHA configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    /// Node-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Remote peer configuration
    #[serde(default)]
    pub peer: PeerConfig,

    /// Failover timing
    #[serde(default)]
    pub failover: FailoverConfig,

    /// Compute driver configuration
    #[serde(default)]
    pub driver: DriverConfig,

    /// MariaDB catalog configuration
    #[serde(default)]
    pub mariadb: MariaDbConfig,

    /// Bulk sync transport configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Alarm configuration
    #[serde(default)]
    pub alarm: AlarmConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Shared cluster designation file
    #[serde(default = "default_designation_file")]
    pub designation_file: PathBuf,

    /// Workspace for service data, backups and route overrides
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,

    /// Reconciliation tick interval in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Catalogs managed by this agent
    #[serde(default = "default_catalogs")]
    pub catalogs: Vec<Catalog>,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Remote peer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Port of the remote agent API
    #[serde(default = "default_peer_port")]
    pub port: u16,

    /// Timeout for status and query calls
    #[serde(default = "default_status_timeout")]
    pub status_timeout_secs: u64,

    /// Timeout for remote backups (these run a full mariabackup)
    #[serde(default = "default_backup_timeout")]
    pub backup_timeout_secs: u64,

    /// Connection timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Failover timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Age after which a failing pending switch is dropped
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling_secs: u64,

    /// Maximum age of the local master record before a full resync is required
    #[serde(default = "default_resync_window")]
    pub resync_window_hours: u64,
}

/// Compute driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Driver backend (only "docker" is supported)
    #[serde(default = "default_driver_kind")]
    pub kind: String,

    /// Path to the docker binary
    #[serde(default = "default_docker_binary")]
    pub binary: String,

    /// Container poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Timeout for `docker exec` calls
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: u64,

    /// Timeout for one-shot jobs (backup/restore)
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Container label prefix
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,
}

/// MariaDB catalog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MariaDbConfig {
    /// Image used for new services and one-shot jobs
    #[serde(default = "default_mariadb_image")]
    pub image: String,

    /// Default root user for new services
    #[serde(default = "default_root_user")]
    pub root_user: String,

    /// Default root password for new services
    #[serde(default = "default_root_password")]
    pub root_password: String,

    /// Default service port
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Binlog coordinates file, relative to the service backup path
    #[serde(default = "default_binlog_marker")]
    pub binlog_marker: PathBuf,

    /// Backup directory inside the container
    #[serde(default = "default_container_backup_dir")]
    pub container_backup_dir: String,

    /// Data directory inside the container
    #[serde(default = "default_container_data_dir")]
    pub container_data_dir: String,
}

/// Bulk sync transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Path to the rsync binary
    #[serde(default = "default_rsync_binary")]
    pub binary: String,

    /// rsync daemon password file
    #[serde(default = "default_password_file")]
    pub password_file: PathBuf,

    /// rsync daemon module exporting the tmp path
    #[serde(default = "default_sync_module")]
    pub module: String,
}

/// Alarm configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmConfig {
    /// Webhook receiving alarms (alarms are only logged when unset)
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Basic auth account
    #[serde(default)]
    pub account: String,

    /// Basic auth password
    #[serde(default)]
    pub password: String,

    /// Alarm receiver id
    #[serde(default)]
    pub receiver: String,

    /// Consecutive unhealthy ticks before an alarm is raised
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_designation_file() -> PathBuf {
    PathBuf::from("/var/local/share/cluster/cluster-info.json")
}

fn default_workspace() -> PathBuf {
    PathBuf::from("/var/lib/wolfha")
}

fn default_tick_interval_ms() -> u64 {
    2000
}

fn default_catalogs() -> Vec<Catalog> {
    vec![Catalog::Mariadb]
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_peer_port() -> u16 {
    8080
}

fn default_status_timeout() -> u64 {
    30
}

fn default_backup_timeout() -> u64 {
    3600
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_retry_ceiling() -> u64 {
    30 * 60
}

fn default_resync_window() -> u64 {
    72
}

fn default_driver_kind() -> String {
    "docker".to_string()
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_exec_timeout() -> u64 {
    60
}

fn default_job_timeout() -> u64 {
    3600
}

fn default_label_prefix() -> String {
    "service.".to_string()
}

fn default_mariadb_image() -> String {
    "mariadb:10.6.11".to_string()
}

fn default_root_user() -> String {
    "root".to_string()
}

fn default_root_password() -> String {
    "rootkit".to_string()
}

fn default_db_port() -> u16 {
    3306
}

fn default_binlog_marker() -> PathBuf {
    PathBuf::from("xtrabackup_binlog_info")
}

fn default_container_backup_dir() -> String {
    "/backup".to_string()
}

fn default_container_data_dir() -> String {
    "/var/lib/mysql".to_string()
}

fn default_rsync_binary() -> String {
    "rsync".to_string()
}

fn default_password_file() -> PathBuf {
    PathBuf::from("/etc/rsyncd.passwd")
}

fn default_sync_module() -> String {
    "backup".to_string()
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            designation_file: default_designation_file(),
            workspace: default_workspace(),
            tick_interval_ms: default_tick_interval_ms(),
            catalogs: default_catalogs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            port: default_peer_port(),
            status_timeout_secs: default_status_timeout(),
            backup_timeout_secs: default_backup_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            retry_ceiling_secs: default_retry_ceiling(),
            resync_window_hours: default_resync_window(),
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            kind: default_driver_kind(),
            binary: default_docker_binary(),
            poll_interval_ms: default_poll_interval_ms(),
            exec_timeout_secs: default_exec_timeout(),
            job_timeout_secs: default_job_timeout(),
            label_prefix: default_label_prefix(),
        }
    }
}

impl Default for MariaDbConfig {
    fn default() -> Self {
        Self {
            image: default_mariadb_image(),
            root_user: default_root_user(),
            root_password: default_root_password(),
            port: default_db_port(),
            binlog_marker: default_binlog_marker(),
            container_backup_dir: default_container_backup_dir(),
            container_data_dir: default_container_data_dir(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            binary: default_rsync_binary(),
            password_file: default_password_file(),
            module: default_sync_module(),
        }
    }
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            account: String::new(),
            password: String::new(),
            receiver: String::new(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.designation_file.as_os_str().is_empty() {
            return Err(crate::Error::Config("node.designation_file cannot be empty".into()));
        }

        if self.node.tick_interval_ms == 0 {
            return Err(crate::Error::Config("node.tick_interval_ms must be positive".into()));
        }

        if self.driver.poll_interval_ms == 0 {
            return Err(crate::Error::Config("driver.poll_interval_ms must be positive".into()));
        }

        if self.node.catalogs.is_empty() {
            return Err(crate::Error::Config("node.catalogs cannot be empty".into()));
        }

        if self.driver.kind != "docker" {
            return Err(crate::Error::Config(format!(
                "unsupported driver.kind '{}'",
                self.driver.kind
            )));
        }

        if self.failover.retry_ceiling_secs == 0 {
            return Err(crate::Error::Config("failover.retry_ceiling_secs must be positive".into()));
        }

        if self.api.enabled && self.api.bind_address.is_empty() {
            return Err(crate::Error::Config("api.bind_address cannot be empty".into()));
        }

        Ok(())
    }

    /// Get tick interval as Duration
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.node.tick_interval_ms)
    }

    /// Get driver poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.driver.poll_interval_ms)
    }

    /// Age after which a failing pending switch is dropped
    pub fn retry_ceiling(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.failover.retry_ceiling_secs as i64)
    }

    /// Maximum age of a local master record before a full resync
    pub fn resync_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.failover.resync_window_hours as i64)
    }

    /// Port of the remote agent API, honouring the environment override
    pub fn peer_port(&self) -> u16 {
        std::env::var(NODE_PORT_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.peer.port)
    }

    /// Directory holding per-service data directories
    pub fn data_dir(&self) -> PathBuf {
        self.node.workspace.join("data")
    }

    /// Directory holding per-service backup directories
    pub fn backup_dir(&self) -> PathBuf {
        self.node.workspace.join("data").join("backup")
    }

    /// Directory holding per-service configuration
    pub fn conf_dir(&self) -> PathBuf {
        self.node.workspace.join("config")
    }

    /// Directory holding endpoint route overrides
    pub fn endpoint_dir(&self) -> PathBuf {
        self.node.workspace.join("endpoints")
    }
}
