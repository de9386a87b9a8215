//! Role switch protocol
//!
//! Promotion: grant replication, refuse while the local slave still lags,
//! stop the slave thread, restore the service's routing.
//!
//! Demotion: verify the peer is a plain master, copy its data first when
//! the local binlog history is too old, follow it, route clients to it.
//!
//! A failing step aborts the switch; completed steps are not rolled back.
//! The reconciler retries the whole switch.

use chrono::{DateTime, Utc};

use super::{MariaDbCatalog, StateStore};
use crate::catalog::Role;
use crate::designation::ClusterDesignation;
use crate::error::{Error, Result};
use crate::peer::PeerTarget;
use crate::service::{Catalog, ServiceInfo, SyncInfo};
use crate::status::{needs_full_resync, parse_binlog_marker, MasterCoordinates, MasterStatus, ReplicationReport};

/// Check that the peer can be followed: its master side must be enabled
/// and it must not itself be replicating from someone.
pub fn check_remote_eligible(host: &str, report: ReplicationReport) -> Result<MasterStatus> {
    let master = match report.master_status {
        Some(master) if master.enabled => master,
        _ => {
            return Err(Error::RemoteNotEligible {
                host: host.to_string(),
                reason: "missing master or master is disabled".into(),
            })
        }
    };

    if report.slave_status.map(|s| s.enabled).unwrap_or(false) {
        return Err(Error::RemoteNotEligible {
            host: host.to_string(),
            reason: "remote service remains in slave mode".into(),
        });
    }

    Ok(master)
}

impl MariaDbCatalog {
    pub(crate) async fn switch_role_at(
        &self,
        name: &str,
        designation: &ClusterDesignation,
        now: DateTime<Utc>,
    ) -> Result<Role> {
        let service = self.resolve(name).await?;

        if designation.is_local_master()? {
            self.promote(&service, now).await?;
            Ok(Role::Master)
        } else {
            self.demote(&service, designation, now).await?;
            Ok(Role::Slave)
        }
    }

    async fn promote(&self, service: &ServiceInfo, now: DateTime<Utc>) -> Result<()> {
        tracing::info!("Switching {} to master", service);

        self.commands.grant_replication(service).await?;

        let slave = self.commands.slave_status(service, now).await?;
        if slave.enabled && slave.running_ok && slave.behind_seconds > 0 {
            tracing::warn!(
                "Cannot promote {}: slave is {}s behind its master",
                service,
                slave.behind_seconds
            );
            return Err(Error::PromotionBlocked {
                service: service.name.clone(),
                behind_seconds: slave.behind_seconds,
            });
        }

        if slave.enabled {
            self.commands.stop_slave(service).await?;
        }

        self.driver.restore_endpoint(service).await?;

        tracing::info!("{} is now master", service);
        Ok(())
    }

    async fn demote(
        &self,
        service: &ServiceInfo,
        designation: &ClusterDesignation,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let peer = PeerTarget::remote_of(designation);
        tracing::info!("Switching {} to slave of {}", service, peer.host);

        let master = self.verify_remote(service, designation, &peer, now).await?;
        self.follow(service, &master.coordinates(), now).await?;

        let remote = self
            .peer
            .query_service(&peer, &service.name, Catalog::Mariadb)
            .await?;
        self.driver.change_endpoint(service, &remote.endpoint).await?;

        let store = StateStore::new(&service.volumes.back_path);
        match self.commands.slave_status(service, now).await {
            Ok(slave) => {
                if let Err(e) = store.save_slave(&slave).await {
                    tracing::warn!("{}: {}", service, e);
                }
            }
            Err(e) => tracing::warn!("{}: slave status after switch unavailable: {}", service, e),
        }

        tracing::info!("{} is now slave of {}", service, peer.host);
        Ok(())
    }

    /// Check the peer and resolve the coordinates to follow, resyncing
    /// from the peer's backup when the local history is stale.
    async fn verify_remote(
        &self,
        service: &ServiceInfo,
        designation: &ClusterDesignation,
        peer: &PeerTarget,
        now: DateTime<Utc>,
    ) -> Result<MasterStatus> {
        let report = self.peer.query_status(peer, &service.name).await?;
        let mut master = check_remote_eligible(&peer.host, report).map_err(|e| {
            tracing::error!("Cannot follow {} for {}: {}", peer.host, service, e);
            e
        })?;

        let store = StateStore::new(&service.volumes.back_path);
        let record = match store.load_master().await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("{}: ignoring unreadable master record: {}", service, e);
                None
            }
        };

        if !needs_full_resync(record.as_ref(), now, self.resync_window) {
            return Ok(master);
        }

        tracing::info!("{} needs a full resync from {}", service, peer.host);
        self.resync(service, designation).await?;

        let (log_file, log_pos) = self.extract_binlog(service).await?;
        master.log_file = log_file;
        master.log_pos = log_pos;

        if let Err(e) = store.save_master(&master).await {
            tracing::error!("{}: {}", service, e);
        }

        Ok(master)
    }

    /// Back up the peer, pull the backup and restore it locally
    pub(super) async fn resync(&self, service: &ServiceInfo, designation: &ClusterDesignation) -> Result<()> {
        let peer = PeerTarget::remote_of(designation);
        tracing::info!("Restoring {} from {}", service, peer.host);

        let data_path = self.peer.request_backup(&peer, &service.name).await?;

        let back_path = service.volumes.back_path.display().to_string();
        let info = SyncInfo {
            name: service.name.clone(),
            local: designation.relative_to_tmp(&back_path)?,
            remote: designation.relative_to_tmp(&data_path)?,
        };
        self.sync
            .sync_to_local(&peer.host, &designation.tmp_path, &info)
            .await?;

        self.commands.restore(service).await
    }

    /// Binlog coordinates recorded by the last restored backup
    async fn extract_binlog(&self, service: &ServiceInfo) -> Result<(String, u64)> {
        let path = service.volumes.back_path.join(&self.config.binlog_marker);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            Error::CorruptBinlogMarker(format!("cannot read {}: {}", path.display(), e))
        })?;
        parse_binlog_marker(&content)
    }

    /// Point replication at the master and start the slave thread
    async fn follow(&self, service: &ServiceInfo, master: &MasterCoordinates, now: DateTime<Utc>) -> Result<()> {
        let slave = self.commands.slave_status(service, now).await?;
        if slave.follows(&master.host.to_lowercase(), master.port) {
            tracing::info!("{} already follows {}:{}", service, master.host, master.port);
            return Ok(());
        }

        if slave.enabled {
            self.commands.stop_slave(service).await?;
        }

        self.commands.change_master(service, master).await?;
        self.commands.start_slave(service).await
    }
}
