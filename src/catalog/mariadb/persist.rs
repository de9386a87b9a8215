//! Persisted replication records (`master.json` / `slave.json`) kept in a
//! service's backup directory.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::status::{MasterStatus, SlaveStatus};

const MASTER_FILE: &str = "master.json";
const SLAVE_FILE: &str = "slave.json";

/// Both persisted records of a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredState {
    pub master: Option<MasterStatus>,
    pub slave: Option<SlaveStatus>,
}

/// File store for one service's replication records
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn master_path(&self) -> PathBuf {
        self.dir.join(MASTER_FILE)
    }

    pub fn slave_path(&self) -> PathBuf {
        self.dir.join(SLAVE_FILE)
    }

    /// Last master record; `None` if never written
    pub async fn load_master(&self) -> Result<Option<MasterStatus>> {
        load(&self.master_path()).await
    }

    pub async fn save_master(&self, status: &MasterStatus) -> Result<()> {
        save(&self.master_path(), status).await
    }

    /// Last slave record; `None` if never written
    pub async fn load_slave(&self) -> Result<Option<SlaveStatus>> {
        load(&self.slave_path()).await
    }

    pub async fn save_slave(&self, status: &SlaveStatus) -> Result<()> {
        save(&self.slave_path(), status).await
    }

    pub async fn load_all(&self) -> Result<StoredState> {
        Ok(StoredState {
            master: self.load_master().await?,
            slave: self.load_slave().await?,
        })
    }
}

fn persist_error(path: &Path, reason: impl std::fmt::Display) -> Error {
    Error::PersistFailed {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

async fn load<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(persist_error(path, e)),
    };

    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|e| persist_error(path, e))
}

async fn save<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value).map_err(|e| persist_error(path, e))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| persist_error(path, e))?;
    }

    // Write then rename so readers never see a partial record
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| persist_error(path, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| persist_error(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("mariadb-01"));

        assert_eq!(store.load_all().await.unwrap(), StoredState::default());

        let master = MasterStatus {
            enabled: true,
            host: "10.0.0.2".into(),
            port: 3306,
            log_file: "mysql-bin.000007".into(),
            log_pos: 154,
            timestamp: 1_700_000_000_000,
        };
        store.save_master(&master).await.unwrap();
        assert_eq!(store.load_master().await.unwrap(), Some(master.clone()));

        let slave = SlaveStatus {
            enabled: true,
            master_host: "10.0.0.2".into(),
            master_port: 3306,
            running_ok: true,
            behind_seconds: 0,
            timestamp: 1_700_000_000_000,
        };
        store.save_slave(&slave).await.unwrap();

        let state = store.load_all().await.unwrap();
        assert_eq!(state.master, Some(master));
        assert_eq!(state.slave, Some(slave));

        // Stored in the wire format shared with the peer
        let raw = tokio::fs::read_to_string(store.master_path()).await.unwrap();
        assert!(raw.contains("\"timeStamp\""));
    }

    #[tokio::test]
    async fn test_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        tokio::fs::write(store.master_path(), "{broken").await.unwrap();

        assert!(matches!(
            store.load_master().await,
            Err(Error::PersistFailed { .. })
        ));
    }
}
