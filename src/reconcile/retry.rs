//! Retry Queue
//!
//! Batches of role switches that still have to succeed. Each drain
//! attempts every queued service once; failures go back into the queue
//! until the batch is older than the retry ceiling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::catalog::CatalogSet;
use crate::designation::ClusterDesignation;
use crate::error::Result;
use crate::service::{Catalog, CatalogServices};

/// Performs one service's role switch
#[async_trait::async_trait]
pub trait RoleSwitcher: Send + Sync {
    async fn switch(&self, catalog: Catalog, service: &str, designation: &ClusterDesignation) -> Result<()>;
}

#[async_trait::async_trait]
impl RoleSwitcher for CatalogSet {
    async fn switch(&self, catalog: Catalog, service: &str, designation: &ClusterDesignation) -> Result<()> {
        let role = self.get(catalog)?.switch_role(service, designation).await?;
        tracing::info!("{}:{} switched to {}", catalog, service, role);
        Ok(())
    }
}

/// A group of services that must take the roles of one designation
#[derive(Debug, Clone)]
pub struct PendingSwitch {
    pub id: Uuid,
    pub services: CatalogServices,
    pub designation: ClusterDesignation,
    pub start_time: DateTime<Utc>,
    /// Drains attempted so far; informational only
    pub attempts: u32,
}

impl PendingSwitch {
    pub fn new(services: CatalogServices, designation: ClusterDesignation, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            services,
            designation,
            start_time: now,
            attempts: 0,
        }
    }

    /// Batch for a single service
    pub fn single(catalog: Catalog, service: &str, designation: ClusterDesignation, now: DateTime<Utc>) -> Self {
        let mut services = CatalogServices::new();
        services.insert(catalog, vec![service.to_string()]);
        Self::new(services, designation, now)
    }

    pub fn service_count(&self) -> usize {
        self.services.values().map(Vec::len).sum()
    }

    /// Dropped once strictly older than the ceiling
    pub fn is_expired(&self, now: DateTime<Utc>, ceiling: chrono::Duration) -> bool {
        now - self.start_time > ceiling
    }

    /// Attempt every service in order; returns the failed remainder
    pub async fn attempt(&self, switcher: &dyn RoleSwitcher) -> Option<PendingSwitch> {
        let mut failed = CatalogServices::new();

        for (catalog, names) in &self.services {
            for name in names {
                if let Err(e) = switcher.switch(*catalog, name, &self.designation).await {
                    tracing::error!(
                        "Batch {}: switching {}:{} failed (attempt {}): {}",
                        self.id,
                        catalog,
                        name,
                        self.attempts + 1,
                        e
                    );
                    failed.entry(*catalog).or_default().push(name.clone());
                }
            }
        }

        if failed.is_empty() {
            return None;
        }

        Some(PendingSwitch {
            id: self.id,
            services: failed,
            designation: self.designation.clone(),
            start_time: self.start_time,
            attempts: self.attempts + 1,
        })
    }

    pub fn summary(&self, now: DateTime<Utc>) -> PendingSummary {
        let status = self.designation.status.as_ref();
        PendingSummary {
            id: self.id,
            master: status.map(|s| s.master.clone()).unwrap_or_default(),
            slave: status.map(|s| s.slave.clone()).unwrap_or_default(),
            services: self.services.clone(),
            start_time: self.start_time,
            age_secs: (now - self.start_time).num_seconds(),
            attempts: self.attempts,
        }
    }
}

/// Queue entry as reported by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSummary {
    pub id: Uuid,
    pub master: String,
    pub slave: String,
    pub services: CatalogServices,
    pub start_time: DateTime<Utc>,
    pub age_secs: i64,
    pub attempts: u32,
}

/// Result of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub batches: usize,
    pub completed: usize,
    pub requeued: usize,
    pub dropped: usize,
}

/// Queue of pending switch batches
pub struct RetryQueue {
    ceiling: chrono::Duration,
    pending: Mutex<Vec<PendingSwitch>>,
}

impl RetryQueue {
    pub fn new(ceiling: chrono::Duration) -> Self {
        Self {
            ceiling,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub async fn push(&self, batch: PendingSwitch) {
        tracing::info!(
            "Queued batch {} with {} service(s)",
            batch.id,
            batch.service_count()
        );
        self.pending.lock().await.push(batch);
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<PendingSwitch> {
        self.pending.lock().await.clone()
    }

    /// Take every queued batch, leaving the queue empty
    async fn take_all(&self) -> Vec<PendingSwitch> {
        std::mem::take(&mut *self.pending.lock().await)
    }

    /// Put unfinished batches back ahead of those queued meanwhile
    async fn requeue(&self, mut remaining: Vec<PendingSwitch>) {
        if remaining.is_empty() {
            return;
        }
        let mut pending = self.pending.lock().await;
        remaining.append(&mut pending);
        *pending = remaining;
    }

    /// Attempt every queued batch once.
    ///
    /// The lock is only held to take and merge the queue, never while
    /// switching.
    pub async fn drain(&self, switcher: &dyn RoleSwitcher, now: DateTime<Utc>) -> DrainStats {
        let batches = self.take_all().await;
        let mut stats = DrainStats {
            batches: batches.len(),
            ..Default::default()
        };

        let mut remaining = Vec::new();
        for batch in batches {
            let Some(rest) = batch.attempt(switcher).await else {
                tracing::info!("Batch {} completed", batch.id);
                stats.completed += 1;
                continue;
            };

            if rest.is_expired(now, self.ceiling) {
                tracing::warn!(
                    "Dropping batch {} started at {} ({}) after {} attempts, still failing: {:?}",
                    rest.id,
                    rest.start_time,
                    rest.designation
                        .status
                        .as_ref()
                        .map(|s| s.to_string())
                        .unwrap_or_default(),
                    rest.attempts,
                    rest.services
                );
                stats.dropped += 1;
                continue;
            }

            stats.requeued += 1;
            remaining.push(rest);
        }

        self.requeue(remaining).await;
        stats
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeSwitcher;
    use super::*;
    use chrono::Duration;

    fn designation() -> ClusterDesignation {
        ClusterDesignation::from_json(
            r#"{"localHost":"a","remoteHost":"b","status":{"master":"a","slave":"b"}}"#,
        )
        .unwrap()
    }

    fn batch(names: &[&str], now: DateTime<Utc>) -> PendingSwitch {
        let mut services = CatalogServices::new();
        services.insert(Catalog::Mariadb, names.iter().map(|n| n.to_string()).collect());
        PendingSwitch::new(services, designation(), now)
    }

    #[tokio::test]
    async fn test_successes_leave_the_batch() {
        let queue = RetryQueue::new(Duration::minutes(30));
        let t0 = Utc::now();
        queue.push(batch(&["mariadb-01", "mariadb-02", "mariadb-03"], t0)).await;

        let switcher = FakeSwitcher::failing(&["mariadb-02"]);
        let stats = queue.drain(&switcher, t0).await;
        assert_eq!(stats.requeued, 1);
        assert_eq!(switcher.calls(), vec!["mariadb-01", "mariadb-02", "mariadb-03"]);

        let pending = queue.snapshot().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].services[&Catalog::Mariadb], vec!["mariadb-02"]);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].start_time, t0);

        switcher.failing.lock().unwrap().clear();
        let stats = queue.drain(&switcher, t0 + Duration::seconds(2)).await;
        assert_eq!(stats.completed, 1);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_retry_ceiling() {
        let queue = RetryQueue::new(Duration::minutes(30));
        let t0 = Utc::now();
        queue.push(batch(&["mariadb-01"], t0)).await;
        let switcher = FakeSwitcher::failing(&["mariadb-01"]);

        for minute in 1..=29 {
            queue.drain(&switcher, t0 + Duration::minutes(minute)).await;
        }
        let pending = queue.snapshot().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 29);

        let stats = queue.drain(&switcher, t0 + Duration::minutes(31)).await;
        assert_eq!(stats.dropped, 1);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_ceiling_ignores_attempt_count() {
        let queue = RetryQueue::new(Duration::minutes(30));
        let t0 = Utc::now();
        let mut old = batch(&["mariadb-01"], t0);
        old.attempts = 10_000;
        queue.push(old).await;

        let switcher = FakeSwitcher::failing(&["mariadb-01"]);
        queue.drain(&switcher, t0 + Duration::minutes(29)).await;
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_requeue_keeps_order() {
        let queue = RetryQueue::new(Duration::minutes(30));
        let t0 = Utc::now();
        let first = batch(&["mariadb-01"], t0);
        let first_id = first.id;
        queue.push(first).await;

        let switcher = FakeSwitcher::failing(&["mariadb-01"]);
        queue.drain(&switcher, t0).await;

        let second = batch(&["mariadb-02"], t0);
        let second_id = second.id;
        queue.push(second).await;

        let ids: Vec<Uuid> = queue.snapshot().await.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![first_id, second_id]);
    }

    #[test]
    fn test_summary() {
        let t0 = Utc::now();
        let b = batch(&["mariadb-01"], t0);
        let summary = b.summary(t0 + Duration::seconds(90));
        assert_eq!(summary.master, "a");
        assert_eq!(summary.age_secs, 90);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["services"]["mariadb"][0], "mariadb-01");
    }
}
