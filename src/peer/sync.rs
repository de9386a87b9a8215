//! Bulk Sync Transport
//!
//! Copies backup directories between the two nodes. Paths in [`SyncInfo`]
//! are relative to the designation tmp path, which the rsync daemon on each
//! node exports as a module.

use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::service::SyncInfo;

/// Directory transfer between peers
#[async_trait::async_trait]
pub trait SyncTransport: Send + Sync {
    /// Pull `info.remote` on the peer into `info.local`
    async fn sync_to_local(&self, host: &str, tmp_path: &str, info: &SyncInfo) -> Result<()>;

    /// Push `info.local` into `info.remote` on the peer
    async fn sync_to_remote(&self, host: &str, tmp_path: &str, info: &SyncInfo) -> Result<()>;
}

/// rsync daemon transport
pub struct RsyncTransport {
    binary: String,
    password_file: PathBuf,
    module: String,
    timeout: Duration,
}

impl RsyncTransport {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            binary: config.sync.binary.clone(),
            password_file: config.sync.password_file.clone(),
            module: config.sync.module.clone(),
            timeout: Duration::from_secs(config.peer.backup_timeout_secs),
        }
    }

    fn remote_url(&self, host: &str, path: &str) -> String {
        format!("rsync://{}/{}/{}/", host, self.module, path)
    }

    fn local_dir(tmp_path: &str, path: &str) -> String {
        format!("{}/{}/", tmp_path.trim_end_matches('/'), path)
    }

    fn args(&self, source: String, destination: String) -> Vec<String> {
        vec![
            "-avz".to_string(),
            format!("--password-file={}", self.password_file.display()),
            source,
            destination,
        ]
    }

    async fn rsync(&self, name: &str, args: Vec<String>) -> Result<()> {
        tracing::info!("Syncing {}: {} {}", name, self.binary, args.join(" "));

        let output = tokio::time::timeout(self.timeout, Command::new(&self.binary).args(&args).output())
            .await
            .map_err(|_| Error::SyncFailed(format!("rsync of {} timed out", name)))?
            .map_err(|e| Error::SyncFailed(format!("failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            return Err(Error::SyncFailed(format!(
                "rsync of {} exited with {}: {}",
                name,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl SyncTransport for RsyncTransport {
    async fn sync_to_local(&self, host: &str, tmp_path: &str, info: &SyncInfo) -> Result<()> {
        let local = Self::local_dir(tmp_path, &info.local);
        tokio::fs::create_dir_all(&local).await?;

        let args = self.args(self.remote_url(host, &info.remote), local);
        self.rsync(&info.name, args).await
    }

    async fn sync_to_remote(&self, host: &str, tmp_path: &str, info: &SyncInfo) -> Result<()> {
        let args = self.args(
            Self::local_dir(tmp_path, &info.local),
            self.remote_url(host, &info.remote),
        );
        self.rsync(&info.name, args).await
    }
}
