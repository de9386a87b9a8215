use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, RwLock};

use super::retry::{DrainStats, PendingSummary, PendingSwitch, RetryQueue};
use crate::catalog::CatalogSet;
use crate::config::AgentConfig;
use crate::designation::ClusterDesignation;
use crate::driver::ComputeDriver;
use crate::error::{Error, Result};
use crate::service::{Catalog, CatalogServices, ServiceEvent, ServiceRegistry};

/// Result of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The previous tick was still running
    Skipped,
    Completed { enqueued: bool, stats: DrainStats },
}

/// Last loaded designation and the file time it was loaded at
#[derive(Default)]
struct DesignationCache {
    mtime: Option<SystemTime>,
    current: Option<ClusterDesignation>,
}

/// Clears the tick flag when the tick ends, including on panic
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Per-node reconciliation loop
pub struct Reconciler {
    designation_file: PathBuf,
    catalogs: Vec<Catalog>,
    driver: Arc<dyn ComputeDriver>,
    registry: Arc<ServiceRegistry>,
    handlers: CatalogSet,
    queue: RetryQueue,
    cache: RwLock<DesignationCache>,
    ticking: AtomicBool,
}

impl Reconciler {
    pub fn new(
        config: &AgentConfig,
        driver: Arc<dyn ComputeDriver>,
        registry: Arc<ServiceRegistry>,
        handlers: CatalogSet,
    ) -> Self {
        Self {
            designation_file: config.node.designation_file.clone(),
            catalogs: config.node.catalogs.clone(),
            driver,
            registry,
            handlers,
            queue: RetryQueue::new(config.retry_ceiling()),
            cache: RwLock::new(DesignationCache::default()),
            ticking: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn handlers(&self) -> &CatalogSet {
        &self.handlers
    }

    /// Register the services the driver already runs
    pub async fn seed_registry(&self) -> Result<usize> {
        let mut count = 0;
        for catalog in &self.catalogs {
            for service in self.driver.list_services(*catalog).await? {
                tracing::info!("Discovered {} (available: {})", service, service.available);
                if self.registry.upsert(service).await {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Snapshot of the last loaded designation
    pub async fn current_designation(&self) -> Option<ClusterDesignation> {
        self.cache.read().await.current.clone()
    }

    /// One reconciliation pass: reload the designation if it changed, then
    /// drain the retry queue. Overlapping calls are dropped.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickOutcome {
        if self
            .ticking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Previous tick still running, skipping");
            return TickOutcome::Skipped;
        }
        let _guard = TickGuard(&self.ticking);

        let enqueued = match self.poll_designation(now).await {
            Ok(Some(batch)) => {
                self.queue.push(batch).await;
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("Designation poll failed: {}", e);
                false
            }
        };

        let stats = self.queue.drain(&self.handlers, now).await;
        if stats.batches > 0 {
            tracing::debug!("Drain: {:?}", stats);
        }

        TickOutcome::Completed { enqueued, stats }
    }

    /// Reload the designation when its file changed; returns the batch to
    /// queue when the requested roles changed.
    async fn poll_designation(&self, now: DateTime<Utc>) -> Result<Option<PendingSwitch>> {
        let mtime = tokio::fs::metadata(&self.designation_file)
            .await
            .and_then(|m| m.modified())
            .map_err(|e| {
                Error::Designation(format!(
                    "failed to stat {}: {}",
                    self.designation_file.display(),
                    e
                ))
            })?;

        if self.cache.read().await.mtime == Some(mtime) {
            return Ok(None);
        }

        let loaded = ClusterDesignation::load(&self.designation_file).await?;

        let previous = {
            let mut cache = self.cache.write().await;
            cache.mtime = Some(mtime);
            cache.current.replace(loaded.clone())
        };

        let hard_change = match &previous {
            Some(p) => p.status.is_none() || loaded.status.is_none(),
            None => true,
        };

        let Some(status) = &loaded.status else {
            tracing::warn!("Designation has no status, nothing to switch");
            return Ok(None);
        };

        if !hard_change && previous.as_ref().is_some_and(|p| p.role_equal(&loaded)) {
            tracing::debug!("Designation touched, roles unchanged");
            return Ok(None);
        }

        tracing::info!("Designation changed: {}", status);

        let services = self.managed_services().await;
        if services.is_empty() {
            tracing::info!("No local services to switch");
            return Ok(None);
        }

        Ok(Some(PendingSwitch::new(services, loaded.snapshot(), now)))
    }

    /// Registered services grouped by catalog
    async fn managed_services(&self) -> CatalogServices {
        let mut services = CatalogServices::new();
        for catalog in &self.catalogs {
            let names: Vec<String> = self
                .registry
                .list(*catalog)
                .await
                .into_iter()
                .map(|s| s.name)
                .collect();
            if !names.is_empty() {
                services.insert(*catalog, names);
            }
        }
        services
    }

    /// Apply a driver notification to the registry. Returns the single
    /// service switch to attempt when an available service showed up.
    pub async fn handle_event(&self, event: ServiceEvent, now: DateTime<Utc>) -> Option<PendingSwitch> {
        let service = event.service();
        if !self.registry.is_managed(service.catalog) {
            tracing::debug!("Ignoring {} event for {}", event.type_name(), service);
            return None;
        }

        tracing::info!("Service {} {}", service, event.type_name());

        let service = match event {
            ServiceEvent::Removed(service) => {
                self.registry.remove(&service).await;
                return None;
            }
            ServiceEvent::Added(service) | ServiceEvent::Modified(service) => service,
        };

        let (catalog, name, available) = (service.catalog, service.name.clone(), service.available);
        self.registry.upsert(service).await;

        if !available {
            return None;
        }

        let designation = self.current_designation().await.filter(|d| d.status.is_some())?;
        Some(PendingSwitch::single(catalog, &name, designation, now))
    }

    /// Attempt a batch right away, queueing whatever fails
    pub async fn switch_now(&self, batch: PendingSwitch) {
        if let Some(rest) = batch.attempt(&self.handlers).await {
            self.queue.push(rest).await;
        }
    }

    /// Consume driver notifications until the channel closes. Switches run
    /// in their own tasks so new notifications keep being registered.
    pub async fn consume_events(self: Arc<Self>, mut rx: mpsc::Receiver<ServiceEvent>) {
        while let Some(event) = rx.recv().await {
            if let Some(batch) = self.handle_event(event, Utc::now()).await {
                let reconciler = self.clone();
                tokio::spawn(async move { reconciler.switch_now(batch).await });
            }
        }
        tracing::info!("Service notification channel closed");
    }

    /// Retry queue as reported by the API
    pub async fn pending(&self, now: DateTime<Utc>) -> Vec<PendingSummary> {
        self.queue
            .snapshot()
            .await
            .iter()
            .map(|b| b.summary(now))
            .collect()
    }

    pub async fn health_status(&self) -> bool {
        self.registry.health_status().await
    }

    pub async fn ready_status(&self) -> bool {
        self.registry
            .ready_status(|service| {
                let handler = self.handlers.get(service.catalog);
                async move { handler?.probe_slave(&service.name).await }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fake::FakeHandler;
    use crate::driver::mock::MockDriver;
    use crate::service::ServiceInfo;
    use crate::status::SlaveStatus;
    use std::path::Path;
    use std::time::Duration;

    const MASTER_HERE: &str = r#"{"localHost":"10.0.0.1","remoteHost":"10.0.0.2","status":{"master":"10.0.0.1","slave":"10.0.0.2","updateTime":"t1"}}"#;
    const MASTER_HERE_LATER: &str = r#"{"localHost":"10.0.0.1","remoteHost":"10.0.0.2","status":{"master":"10.0.0.1","slave":"10.0.0.2","updateTime":"t2"}}"#;
    const SLAVE_HERE: &str = r#"{"localHost":"10.0.0.1","remoteHost":"10.0.0.2","status":{"master":"10.0.0.2","slave":"10.0.0.1","updateTime":"t3"}}"#;
    const NO_STATUS: &str = r#"{"localHost":"10.0.0.1","remoteHost":"10.0.0.2"}"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        path: PathBuf,
        handler: Arc<FakeHandler>,
        reconciler: Arc<Reconciler>,
        bumps: u64,
    }

    impl Fixture {
        async fn new(services: &[&str]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("cluster-info.json");

            let mut config = AgentConfig::default();
            config.node.designation_file = path.clone();

            let driver = Arc::new(MockDriver::new());
            for name in services {
                let mut service = ServiceInfo::new(*name, Catalog::Mariadb);
                service.available = true;
                driver.add_service(service);
            }

            let registry = Arc::new(ServiceRegistry::new([Catalog::Mariadb]));
            let handler = Arc::new(FakeHandler::default());
            let mut handlers = CatalogSet::new();
            handlers.register(handler.clone());

            let reconciler = Arc::new(Reconciler::new(&config, driver, registry, handlers));
            reconciler.seed_registry().await.unwrap();

            Self {
                _dir: dir,
                path,
                handler,
                reconciler,
                bumps: 0,
            }
        }

        /// Write the designation with a strictly newer modification time
        fn write(&mut self, content: &str) {
            std::fs::write(&self.path, content).unwrap();
            self.bumps += 1;
            set_mtime(&self.path, SystemTime::now() + Duration::from_secs(self.bumps * 10));
        }
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    fn enqueued(outcome: TickOutcome) -> bool {
        match outcome {
            TickOutcome::Completed { enqueued, .. } => enqueued,
            TickOutcome::Skipped => panic!("tick skipped"),
        }
    }

    #[tokio::test]
    async fn test_seed_registry() {
        let fx = Fixture::new(&["mariadb-01", "mariadb-02"]).await;
        assert_eq!(fx.reconciler.registry().len().await, 2);
    }

    #[tokio::test]
    async fn test_same_roles_enqueue_nothing() {
        let mut fx = Fixture::new(&["mariadb-01", "mariadb-02"]).await;
        let now = Utc::now();

        fx.write(MASTER_HERE);
        assert!(enqueued(fx.reconciler.tick(now).await));
        assert_eq!(fx.handler.switches(), vec!["mariadb-01", "mariadb-02"]);

        // Unchanged file
        assert!(!enqueued(fx.reconciler.tick(now).await));

        // Rewritten with the same roles
        fx.write(MASTER_HERE_LATER);
        assert!(!enqueued(fx.reconciler.tick(now).await));
        assert_eq!(fx.handler.switches().len(), 2);

        let current = fx.reconciler.current_designation().await.unwrap();
        assert_eq!(current.status.unwrap().update_time, "t2");
    }

    #[tokio::test]
    async fn test_role_change_enqueues() {
        let mut fx = Fixture::new(&["mariadb-01"]).await;
        let now = Utc::now();

        fx.write(MASTER_HERE);
        fx.reconciler.tick(now).await;
        fx.write(SLAVE_HERE);
        assert!(enqueued(fx.reconciler.tick(now).await));
        assert_eq!(fx.handler.switches().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_status_is_hard_change() {
        let mut fx = Fixture::new(&["mariadb-01"]).await;
        let now = Utc::now();

        fx.write(NO_STATUS);
        assert!(!enqueued(fx.reconciler.tick(now).await));
        assert!(fx.handler.switches().is_empty());

        fx.write(MASTER_HERE);
        assert!(enqueued(fx.reconciler.tick(now).await));

        fx.write(NO_STATUS);
        assert!(!enqueued(fx.reconciler.tick(now).await));

        // Same roles as before the status disappeared
        fx.write(MASTER_HERE_LATER);
        assert!(enqueued(fx.reconciler.tick(now).await));
    }

    #[tokio::test]
    async fn test_invalid_designation_is_retried() {
        let mut fx = Fixture::new(&["mariadb-01"]).await;
        let now = Utc::now();

        fx.write("{broken");
        assert!(!enqueued(fx.reconciler.tick(now).await));
        assert!(fx.reconciler.current_designation().await.is_none());

        std::fs::write(&fx.path, MASTER_HERE).unwrap();
        set_mtime(&fx.path, SystemTime::now() + Duration::from_secs(fx.bumps * 10));
        assert!(enqueued(fx.reconciler.tick(now).await));
    }

    #[tokio::test]
    async fn test_empty_listing_makes_no_batch() {
        let mut fx = Fixture::new(&[]).await;
        fx.write(MASTER_HERE);
        assert!(!enqueued(fx.reconciler.tick(Utc::now()).await));
        assert!(fx.reconciler.pending(Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_switch_is_retried_next_tick() {
        let mut fx = Fixture::new(&["mariadb-01", "mariadb-02"]).await;
        fx.handler.fail("mariadb-02");
        let t0 = Utc::now();

        fx.write(MASTER_HERE);
        fx.reconciler.tick(t0).await;
        let pending = fx.reconciler.pending(t0).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].services[&Catalog::Mariadb], vec!["mariadb-02"]);

        fx.handler.failing.lock().unwrap().clear();
        let outcome = fx.reconciler.tick(t0 + chrono::Duration::seconds(2)).await;
        match outcome {
            TickOutcome::Completed { stats, .. } => assert_eq!(stats.completed, 1),
            TickOutcome::Skipped => panic!("tick skipped"),
        }
        assert!(fx.reconciler.pending(t0).await.is_empty());
        assert_eq!(
            fx.handler.switches(),
            vec!["mariadb-01", "mariadb-02", "mariadb-02"]
        );
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let fx = Fixture::new(&[]).await;
        fx.reconciler.ticking.store(true, Ordering::Release);
        assert_eq!(fx.reconciler.tick(Utc::now()).await, TickOutcome::Skipped);

        fx.reconciler.ticking.store(false, Ordering::Release);
        assert_ne!(fx.reconciler.tick(Utc::now()).await, TickOutcome::Skipped);
        assert!(!fx.reconciler.ticking.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_available_service_switches_at_once() {
        let mut fx = Fixture::new(&[]).await;
        let now = Utc::now();

        let mut service = ServiceInfo::new("mariadb-03", Catalog::Mariadb);
        service.available = true;

        // No designation yet: registered only
        let batch = fx
            .reconciler
            .handle_event(ServiceEvent::Added(service.clone()), now)
            .await;
        assert!(batch.is_none());
        assert!(fx.reconciler.registry().get("mariadb-03").await.is_some());

        fx.write(MASTER_HERE);
        fx.reconciler.tick(now).await;
        fx.handler.fail("mariadb-03");
        fx.handler.switches.lock().unwrap().clear();

        let batch = fx
            .reconciler
            .handle_event(ServiceEvent::Modified(service.clone()), now)
            .await
            .unwrap();
        fx.reconciler.switch_now(batch).await;
        assert_eq!(fx.handler.switches(), vec!["mariadb-03"]);

        let pending = fx.reconciler.pending(now).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].start_time, now);

        fx.reconciler
            .handle_event(ServiceEvent::Removed(service), now)
            .await;
        assert!(fx.reconciler.registry().get("mariadb-03").await.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_service_is_not_switched() {
        let mut fx = Fixture::new(&[]).await;
        fx.write(MASTER_HERE);
        fx.reconciler.tick(Utc::now()).await;

        let service = ServiceInfo::new("mariadb-04", Catalog::Mariadb);
        let batch = fx
            .reconciler
            .handle_event(ServiceEvent::Added(service), Utc::now())
            .await;
        assert!(batch.is_none());
        assert!(!fx.reconciler.health_status().await);
    }

    #[tokio::test]
    async fn test_ready_status_uses_slave_probe() {
        let fx = Fixture::new(&["mariadb-01", "mariadb-02"]).await;
        fx.handler.set_slave("mariadb-01", SlaveStatus::default());
        fx.handler.set_slave(
            "mariadb-02",
            SlaveStatus {
                enabled: true,
                ..Default::default()
            },
        );
        assert!(fx.reconciler.ready_status().await);

        fx.handler.set_slave(
            "mariadb-02",
            SlaveStatus {
                enabled: true,
                behind_seconds: 3,
                ..Default::default()
            },
        );
        assert!(!fx.reconciler.ready_status().await);
    }
}
