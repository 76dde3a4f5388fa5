//! WorkerManager: the single authority on which tenants have a running worker.
//!
//! Two locks are involved:
//! - `workers`, one std mutex around the whole registry, held only for map
//!   reads and writes, never across an `.await`
//! - one async mutex per tenant, held for a full reconcile so that events for
//!   the same tenant apply one after another
//!
//! Worker start/stop happens with only the tenant lock held. A restart removes
//! the old entry before stopping it and inserts the new worker only once it has
//! started, so the registry never holds two workers for one tenant and never
//! holds a worker that failed to start.
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex as TenantLock;
use tracing::{Level, debug, error, info, warn};

use crate::{
    activity::{ActivityError, ActivityEvent},
    connection::{Connection, ConnectionStore, StoreError},
    logger::BridgeMetrics,
    worker::{RelayFactory, Worker, WorkerError, WorkerState, WorkerTimeouts},
};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Activity(#[from] ActivityError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("connection store failed: {0}")]
    Store(#[from] StoreError),
    #[error("worker manager is shutting down")]
    ShuttingDown,
}

/// What a reconcile did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Unchanged,
    Started,
    Stopped,
    Restarted,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Unchanged => "unchanged",
            ReconcileOutcome::Started => "started",
            ReconcileOutcome::Stopped => "stopped",
            ReconcileOutcome::Restarted => "restarted",
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct BootstrapReport {
    pub started: Vec<String>,
    /// client id and reason
    pub failed: Vec<(String, String)>,
}

pub struct WorkerManager {
    store: Arc<dyn ConnectionStore>,
    relays: Arc<dyn RelayFactory>,
    timeouts: WorkerTimeouts,
    workers: Mutex<HashMap<String, Arc<Worker>>>,
    tenant_locks: DashMap<String, Arc<TenantLock<()>>>,
    shutting_down: AtomicBool,
    metrics: BridgeMetrics,
}

impl WorkerManager {
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        relays: Arc<dyn RelayFactory>,
        timeouts: WorkerTimeouts,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            relays,
            timeouts,
            workers: Mutex::new(HashMap::new()),
            tenant_locks: DashMap::new(),
            shutting_down: AtomicBool::new(false),
            metrics: BridgeMetrics::new(),
        })
    }

    pub fn store(&self) -> Arc<dyn ConnectionStore> {
        self.store.clone()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, Arc<Worker>>> {
        // a panic elsewhere must not take the registry down with it
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tenant_lock(&self, client_id: &str) -> Arc<TenantLock<()>> {
        self.tenant_locks
            .entry(client_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Forget the lock of a tenant that has no worker and nobody waiting.
    /// Call after dropping your own clone of the lock.
    fn prune_tenant_lock(&self, client_id: &str) {
        if self.lookup(client_id).is_none() {
            // cloning happens under the same shard lock, so a count of one
            // means only the map holds it
            self.tenant_locks
                .remove_if(client_id, |_, lock| Arc::strong_count(lock) == 1);
        }
    }

    /// The running worker for `client_id`, if any.
    pub fn lookup(&self, client_id: &str) -> Option<Arc<Worker>> {
        self.registry().get(client_id).cloned()
    }

    /// Number of registered workers.
    pub fn count(&self) -> usize {
        self.registry().len()
    }

    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Simple diagnostics: client id → worker state
    pub fn diagnostics(&self) -> HashMap<String, WorkerState> {
        self.registry()
            .iter()
            .map(|(id, worker)| (id.clone(), worker.state()))
            .collect()
    }

    /// Start a worker for every active connection in the store.
    ///
    /// Workers start concurrently. One tenant failing is logged and reported,
    /// the others still start.
    pub async fn bootstrap(&self) -> Result<BootstrapReport, ManagerError> {
        let connections = self.store.list_active().await?;
        info!("Bootstrapping {} active connections", connections.len());

        let results = join_all(connections.into_iter().map(|connection| async move {
            let client_id = connection.client_id.clone();
            let lock = self.tenant_lock(&client_id);
            let guard = lock.lock().await;
            let result = if self.lookup(&client_id).is_some() {
                debug!(client_id = %client_id, "Already running, skipped by bootstrap");
                Ok(())
            } else {
                self.launch(connection).await.map(|_| ())
            };
            drop(guard);
            drop(lock);
            self.prune_tenant_lock(&client_id);
            (client_id, result)
        }))
        .await;

        let mut report = BootstrapReport::default();
        for (client_id, result) in results {
            match result {
                Ok(()) => report.started.push(client_id),
                Err(err) => {
                    error!(client_id = %client_id, "Bootstrap could not start worker: {err}");
                    report.failed.push((client_id, err.to_string()));
                }
            }
        }
        info!(
            "Bootstrap done: {} started, {} failed",
            report.started.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Bring the registry in line with one activity event, then record the
    /// event's active flag and url in the store.
    ///
    /// Serialized per tenant. Store failures are logged only; the registry
    /// change stands either way.
    pub async fn reconcile(&self, event: &ActivityEvent) -> Result<ReconcileOutcome, ManagerError> {
        if let Err(err) = event.validate() {
            warn!(client_id = %event.client_id, "Rejected activity event: {err}");
            return Err(err.into());
        }

        let started_at = Instant::now();
        let lock = self.tenant_lock(&event.client_id);
        let guard = lock.lock().await;

        let result = self.apply(event).await;
        self.persist(event).await;

        drop(guard);
        drop(lock);
        self.prune_tenant_lock(&event.client_id);

        let elapsed = started_at.elapsed().as_secs_f64() * 1_000.0;
        match &result {
            Ok(outcome) => {
                info!(
                    client_id = %event.client_id,
                    active = event.active,
                    freeze = event.freeze,
                    "Reconciled: {}",
                    outcome.as_str()
                );
                self.metrics.record_reconcile(outcome.as_str(), elapsed);
            }
            Err(err) => {
                error!(client_id = %event.client_id, "Reconcile failed: {err}");
                self.metrics.record_reconcile("failed", elapsed);
            }
        }
        let outcome = match &result {
            Ok(outcome) => outcome.as_str(),
            Err(_) => "error",
        };
        tracing::event!(
            target: "reconcile",
            Level::INFO,
            client_id = %event.client_id,
            should_run = event.should_run(),
            latency_ms = elapsed,
            outcome
        );

        result
    }

    async fn apply(&self, event: &ActivityEvent) -> Result<ReconcileOutcome, ManagerError> {
        let existing = self.lookup(&event.client_id);
        match existing {
            None if !event.should_run() => Ok(ReconcileOutcome::Unchanged),
            None => {
                let snapshot = self.snapshot_for(event, None).await;
                self.launch(snapshot).await?;
                Ok(ReconcileOutcome::Started)
            }
            Some(worker) if !event.should_run() => {
                self.retire(&worker).await;
                Ok(ReconcileOutcome::Stopped)
            }
            Some(worker) if worker.connection().system_url == event.system_url => {
                Ok(ReconcileOutcome::Unchanged)
            }
            Some(worker) => {
                info!(
                    client_id = %event.client_id,
                    from = %worker.connection().system_url,
                    to = %event.system_url,
                    "System url changed, restarting worker"
                );
                self.retire(&worker).await;
                let snapshot = self.snapshot_for(event, Some(worker.connection())).await;
                self.launch(snapshot).await?;
                Ok(ReconcileOutcome::Restarted)
            }
        }
    }

    /// Configuration for a new worker: the freshest record we have, with the
    /// event's view of active/url on top.
    async fn snapshot_for(&self, event: &ActivityEvent, previous: Option<&Connection>) -> Connection {
        let stored = match self.store.get(&event.client_id).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(client_id = %event.client_id, "Could not read stored connection: {err}");
                None
            }
        };
        let mut snapshot = stored
            .or_else(|| previous.cloned())
            .unwrap_or_else(|| Connection::new(event.client_id.clone(), event.system_url.clone()));
        snapshot.system_url = event.system_url.clone();
        snapshot.active = event.active;
        snapshot
    }

    /// Create and start a worker, registering it only once it runs.
    /// Caller holds the tenant lock.
    async fn launch(&self, connection: Connection) -> Result<Arc<Worker>, ManagerError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ManagerError::ShuttingDown);
        }
        let worker = Arc::new(Worker::new(connection, self.relays.clone(), self.timeouts));
        if let Err(err) = worker.start().await {
            self.metrics.start_failures.add(1, &[]);
            return Err(err.into());
        }

        // checked under the registry lock so a concurrent shutdown either
        // drains this worker or makes us stop it
        let admitted = {
            let mut registry = self.registry();
            if self.shutting_down.load(Ordering::SeqCst) {
                None
            } else {
                Some(registry.insert(worker.client_id().to_string(), worker.clone()))
            }
        };
        let Some(replaced) = admitted else {
            info!(client_id = %worker.client_id(), "Shutdown began during start, stopping worker again");
            if let Err(err) = worker.stop().await {
                warn!(client_id = %worker.client_id(), "{err}");
            }
            return Err(ManagerError::ShuttingDown);
        };
        if let Some(stale) = replaced {
            // only reachable if someone bypassed the tenant lock
            error!(client_id = %stale.client_id(), "Replaced a worker that was still registered");
        }
        self.metrics.workers_started.add(1, &[]);
        Ok(worker)
    }

    /// Unregister a worker and stop it. A stop timeout is logged, the entry is
    /// gone regardless. Caller holds the tenant lock.
    async fn retire(&self, worker: &Arc<Worker>) {
        {
            let mut registry = self.registry();
            if registry
                .get(worker.client_id())
                .is_some_and(|current| Arc::ptr_eq(current, worker))
            {
                registry.remove(worker.client_id());
            }
        }
        if let Err(err) = worker.stop().await {
            warn!(client_id = %worker.client_id(), "{err}");
        }
        self.metrics.workers_stopped.add(1, &[]);
    }

    async fn persist(&self, event: &ActivityEvent) {
        match self
            .store
            .update_activity(&event.client_id, event.active, &event.system_url)
            .await
        {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                warn!(client_id = %event.client_id, "No stored connection to record activity on");
            }
            Err(err) => {
                error!(
                    client_id = %event.client_id,
                    "Store and registry disagree, activity not persisted: {err}"
                );
            }
        }
    }

    /// Stop every worker. Best-effort; nothing starts afterwards.
    pub async fn shutdown(&self) {
        let workers: Vec<Arc<Worker>> = {
            let mut registry = self.registry();
            self.shutting_down.store(true, Ordering::SeqCst);
            registry.drain().map(|(_, w)| w).collect()
        };
        info!("Stopping {} workers", workers.len());

        join_all(workers.iter().map(|worker| async move {
            if let Err(err) = worker.stop().await {
                warn!(client_id = %worker.client_id(), "{err}");
            }
            self.metrics.workers_stopped.add(1, &[]);
        }))
        .await;
    }
}

impl std::fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerManager")
            .field("workers", &self.client_ids())
            .field("timeouts", &self.timeouts)
            .field("shutting_down", &self.shutting_down.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, time::Duration};

    use anyhow::{Result, bail};
    use async_trait::async_trait;

    use super::*;
    use crate::connection::InMemoryConnectionStore;
    use crate::worker::Relay;
    use crate::worker::relay::mock::{
        FailingRelayFactory, HangingRelayFactory, IdleRelayFactory, SlowRelayFactory, StubbornRelayFactory,
    };

    const C1: &str = "09385039f039irf039fkj309fj30jf3";
    const U1: &str = "https://test.retailcrm.ru";
    const U2: &str = "http://change.retailcrm.ru";

    fn timeouts() -> WorkerTimeouts {
        WorkerTimeouts {
            start: Duration::from_millis(500),
            stop: Duration::from_millis(200),
        }
    }

    fn stored(id: &str, url: &str) -> Connection {
        Connection::new(id, url)
            .with_api_key("ii32if32iuf23iufn2uifnr23inf")
            .with_gateway("https://test.retailcrm.pro", "988730985u23r390rf8j3984jf32904fj")
            .activated(true)
    }

    fn manager_with(
        connections: Vec<Connection>,
        relays: Arc<dyn RelayFactory>,
    ) -> (Arc<WorkerManager>, Arc<InMemoryConnectionStore>) {
        let store = Arc::new(InMemoryConnectionStore::with_connections(connections));
        let mgr = WorkerManager::new(store.clone(), relays, timeouts());
        (mgr, store)
    }

    fn activity(active: bool, freeze: bool, url: &str) -> ActivityEvent {
        ActivityEvent::new(C1, active, freeze, url)
    }

    /// Fails to prepare for the listed tenants only.
    struct SelectiveRelayFactory {
        inner: IdleRelayFactory,
        refuse: HashSet<String>,
    }

    #[async_trait]
    impl RelayFactory for SelectiveRelayFactory {
        async fn prepare(&self, connection: &Connection) -> Result<Box<dyn Relay>> {
            if self.refuse.contains(&connection.client_id) {
                bail!("refused");
            }
            self.inner.prepare(connection).await
        }
    }

    /// In-memory store whose writes and listings can be made to fail.
    #[derive(Default)]
    struct UnreliableStore {
        inner: InMemoryConnectionStore,
        fail_updates: AtomicBool,
        fail_listing: AtomicBool,
    }

    fn disk_full() -> StoreError {
        StoreError::Io(std::io::Error::other("no space left on device"))
    }

    #[async_trait]
    impl ConnectionStore for UnreliableStore {
        async fn list(&self) -> Result<Vec<Connection>, StoreError> {
            if self.fail_listing.load(Ordering::SeqCst) {
                return Err(disk_full());
            }
            self.inner.list().await
        }

        async fn get(&self, client_id: &str) -> Result<Option<Connection>, StoreError> {
            self.inner.get(client_id).await
        }

        async fn upsert(&self, connection: Connection) -> Result<Connection, StoreError> {
            self.inner.upsert(connection).await
        }

        async fn update_activity(&self, client_id: &str, active: bool, system_url: &str) -> Result<(), StoreError> {
            if self.fail_updates.load(Ordering::SeqCst) {
                return Err(disk_full());
            }
            self.inner.update_activity(client_id, active, system_url).await
        }

        async fn remove(&self, client_id: &str) -> Result<bool, StoreError> {
            self.inner.remove(client_id).await
        }
    }

    #[tokio::test]
    async fn bootstrap_starts_active_connections() {
        let relays = Arc::new(IdleRelayFactory::default());
        let (mgr, _) = manager_with(
            vec![stored(C1, U1), stored("inactive", U1).activated(false)],
            relays.clone(),
        );

        let report = mgr.bootstrap().await.unwrap();
        assert_eq!(report.started, vec![C1.to_string()]);
        assert!(report.failed.is_empty());
        assert_eq!(mgr.count(), 1);

        let worker = mgr.lookup(C1).expect("C1 running");
        assert!(worker.is_running());
        assert_eq!(worker.connection().system_url, U1);
        assert_eq!(relays.running(), 1);
    }

    #[tokio::test]
    async fn bootstrap_tolerates_partial_failure() {
        let relays = Arc::new(SelectiveRelayFactory {
            inner: IdleRelayFactory::default(),
            refuse: HashSet::from(["bad".to_string()]),
        });
        let (mgr, _) = manager_with(vec![stored("good", U1), stored("bad", U1)], relays);

        let report = mgr.bootstrap().await.unwrap();
        assert_eq!(report.started, vec!["good".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "bad");
        assert_eq!(mgr.client_ids(), vec!["good".to_string()]);
    }

    #[tokio::test]
    async fn bootstrap_twice_does_not_duplicate() {
        let relays = Arc::new(IdleRelayFactory::default());
        let (mgr, _) = manager_with(vec![stored(C1, U1)], relays.clone());
        mgr.bootstrap().await.unwrap();
        mgr.bootstrap().await.unwrap();
        assert_eq!(mgr.count(), 1);
        assert_eq!(relays.prepared(), 1);
    }

    #[tokio::test]
    async fn decision_table() {
        let relays = Arc::new(IdleRelayFactory::default());
        let (mgr, _) = manager_with(vec![stored(C1, U1).activated(false)], relays.clone());

        // absent + should not run
        assert_eq!(mgr.reconcile(&activity(false, false, U1)).await.unwrap(), ReconcileOutcome::Unchanged);
        assert!(mgr.lookup(C1).is_none());

        // absent + should run
        assert_eq!(mgr.reconcile(&activity(true, false, U1)).await.unwrap(), ReconcileOutcome::Started);
        let first = mgr.lookup(C1).unwrap();
        assert_eq!(first.connection().system_url, U1);

        // present + same url
        assert_eq!(mgr.reconcile(&activity(true, false, U1)).await.unwrap(), ReconcileOutcome::Unchanged);
        assert!(Arc::ptr_eq(&first, &mgr.lookup(C1).unwrap()));

        // present + url changed
        assert_eq!(mgr.reconcile(&activity(true, false, U2)).await.unwrap(), ReconcileOutcome::Restarted);
        let second = mgr.lookup(C1).unwrap();
        assert_eq!(second.connection().system_url, U2);
        assert_eq!(first.state(), WorkerState::Stopped);
        assert!(second.is_running());

        // present + should not run
        assert_eq!(mgr.reconcile(&activity(false, false, U2)).await.unwrap(), ReconcileOutcome::Stopped);
        assert!(mgr.lookup(C1).is_none());
        assert_eq!(second.state(), WorkerState::Stopped);
        assert_eq!(relays.running(), 0);
    }

    #[tokio::test]
    async fn restart_keeps_stored_credentials() {
        let (mgr, _) = manager_with(vec![stored(C1, U1)], Arc::new(IdleRelayFactory::default()));
        mgr.bootstrap().await.unwrap();
        mgr.reconcile(&activity(true, false, U2)).await.unwrap();

        let worker = mgr.lookup(C1).unwrap();
        assert_eq!(worker.connection().gate_token, "988730985u23r390rf8j3984jf32904fj");
        assert_eq!(worker.connection().system_url, U2);
    }

    #[tokio::test]
    async fn unknown_tenant_gets_bare_snapshot() {
        let (mgr, store) = manager_with(vec![], Arc::new(IdleRelayFactory::default()));
        let event = ActivityEvent::new("newcomer", true, false, U1);
        assert_eq!(mgr.reconcile(&event).await.unwrap(), ReconcileOutcome::Started);

        let worker = mgr.lookup("newcomer").unwrap();
        assert_eq!(worker.connection().client_id, "newcomer");
        assert_eq!(worker.connection().system_url, U1);
        // nothing to persist onto
        assert!(store.get("newcomer").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn freeze_never_runs() {
        let (mgr, _) = manager_with(vec![stored(C1, U1)], Arc::new(IdleRelayFactory::default()));

        assert_eq!(mgr.reconcile(&activity(true, true, U1)).await.unwrap(), ReconcileOutcome::Unchanged);
        assert!(mgr.lookup(C1).is_none());

        mgr.bootstrap().await.unwrap();
        let running = mgr.lookup(C1).unwrap();
        assert_eq!(mgr.reconcile(&activity(true, true, U2)).await.unwrap(), ReconcileOutcome::Stopped);
        assert!(mgr.lookup(C1).is_none());
        assert_eq!(running.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn same_event_twice_is_idempotent() {
        let relays = Arc::new(IdleRelayFactory::default());
        let (mgr, _) = manager_with(vec![stored(C1, U1)], relays.clone());

        for event in [activity(true, false, U2), activity(false, false, U2)] {
            mgr.reconcile(&event).await.unwrap();
            let ids = mgr.client_ids();
            let url = mgr.lookup(C1).map(|w| w.connection().system_url.clone());
            assert_eq!(mgr.reconcile(&event).await.unwrap(), ReconcileOutcome::Unchanged);
            assert_eq!(mgr.client_ids(), ids);
            assert_eq!(mgr.lookup(C1).map(|w| w.connection().system_url.clone()), url);
        }
        assert_eq!(relays.running(), 0);
    }

    #[tokio::test]
    async fn activity_is_persisted_whatever_the_transition() {
        let (mgr, store) = manager_with(vec![stored(C1, U1)], Arc::new(IdleRelayFactory::default()));

        mgr.reconcile(&activity(true, true, U2)).await.unwrap();
        let conn = store.get(C1).await.unwrap().unwrap();
        assert!(conn.active);
        assert_eq!(conn.system_url, U2);

        mgr.reconcile(&activity(false, false, U1)).await.unwrap();
        let conn = store.get(C1).await.unwrap().unwrap();
        assert!(!conn.active);
        assert_eq!(conn.system_url, U1);
    }

    #[tokio::test]
    async fn failed_start_leaves_no_entry() {
        let (mgr, store) = manager_with(vec![stored(C1, U1).activated(false)], Arc::new(FailingRelayFactory));

        let err = mgr.reconcile(&activity(true, false, U2)).await.unwrap_err();
        assert!(matches!(err, ManagerError::Worker(WorkerError::StartFailed { .. })));
        assert!(mgr.lookup(C1).is_none());
        assert_eq!(mgr.count(), 0);

        // still recorded
        let conn = store.get(C1).await.unwrap().unwrap();
        assert!(conn.active);
        assert_eq!(conn.system_url, U2);
    }

    #[tokio::test]
    async fn stop_timeout_still_unregisters() {
        let (mgr, _) = manager_with(vec![stored(C1, U1)], Arc::new(StubbornRelayFactory));
        mgr.bootstrap().await.unwrap();
        let worker = mgr.lookup(C1).unwrap();

        assert_eq!(mgr.reconcile(&activity(false, false, U1)).await.unwrap(), ReconcileOutcome::Stopped);
        assert!(mgr.lookup(C1).is_none());
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn invalid_event_is_rejected_without_side_effects() {
        let (mgr, store) = manager_with(vec![stored(C1, U1)], Arc::new(IdleRelayFactory::default()));
        mgr.bootstrap().await.unwrap();

        let err = mgr.reconcile(&activity(false, false, "not a url")).await.unwrap_err();
        assert!(matches!(err, ManagerError::Activity(ActivityError::InvalidUrl { .. })));
        assert!(mgr.lookup(C1).is_some());
        assert_eq!(store.get(C1).await.unwrap().unwrap().system_url, U1);

        let err = mgr.reconcile(&ActivityEvent::new("", true, false, U1)).await.unwrap_err();
        assert!(matches!(err, ManagerError::Activity(ActivityError::MissingClientId)));
    }

    #[tokio::test]
    async fn sequential_scenario_ends_on_latest_url() {
        let relays = Arc::new(IdleRelayFactory::default());
        let (mgr, _) = manager_with(vec![stored(C1, U1)], relays.clone());
        mgr.bootstrap().await.unwrap();

        let steps = [
            (activity(false, false, U1), false),
            (activity(true, false, U1), true),
            (activity(true, false, U2), true),
        ];
        for (event, running) in steps {
            mgr.reconcile(&event).await.unwrap();
            let worker = mgr.lookup(C1);
            assert_eq!(worker.is_some(), running);
            if let Some(worker) = worker {
                assert_eq!(worker.connection().system_url, event.system_url);
            }
        }
        assert_eq!(mgr.count(), 1);
        assert_eq!(relays.running(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_events_for_one_tenant_never_double_up() {
        let relays = Arc::new(IdleRelayFactory::default());
        let (mgr, _) = manager_with(vec![stored(C1, U1)], relays.clone());
        mgr.bootstrap().await.unwrap();

        let urls = [U1, U2, "https://third.retailcrm.ru"];
        let handles: Vec<_> = (0..48)
            .map(|i| {
                let mgr = mgr.clone();
                let event = activity(i % 3 != 0, i % 7 == 0, urls[i % urls.len()]);
                tokio::spawn(async move {
                    let outcome = mgr.reconcile(&event).await;
                    assert!(mgr.count() <= 1);
                    outcome
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(mgr.count() <= 1);
        // every relay that is still alive belongs to the registered worker
        assert_eq!(relays.running(), mgr.count());
        if let Some(worker) = mgr.lookup(C1) {
            assert!(worker.is_running());
            assert!(urls.contains(&worker.connection().system_url.as_str()));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_tenants_reconcile_independently() {
        let relays = Arc::new(IdleRelayFactory::default());
        let (mgr, _) = manager_with(vec![], relays.clone());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let mgr = mgr.clone();
                tokio::spawn(async move {
                    mgr.reconcile(&ActivityEvent::new(format!("tenant-{i}"), true, false, U1))
                        .await
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), ReconcileOutcome::Started);
        }
        assert_eq!(mgr.count(), 16);
        assert_eq!(relays.running(), 16);
    }

    #[tokio::test]
    async fn shutdown_stops_everything_and_refuses_new_work() {
        let relays = Arc::new(IdleRelayFactory::default());
        let (mgr, _) = manager_with(vec![stored("a", U1), stored("b", U2)], relays.clone());
        mgr.bootstrap().await.unwrap();
        let a = mgr.lookup("a").unwrap();

        mgr.shutdown().await;
        assert_eq!(mgr.count(), 0);
        assert_eq!(relays.running(), 0);
        assert_eq!(a.state(), WorkerState::Stopped);

        let err = mgr.reconcile(&ActivityEvent::new("a", true, false, U1)).await.unwrap_err();
        assert!(matches!(err, ManagerError::ShuttingDown));
    }

    #[tokio::test]
    async fn diagnostics_reports_states() {
        let (mgr, _) = manager_with(vec![stored(C1, U1)], Arc::new(IdleRelayFactory::default()));
        mgr.bootstrap().await.unwrap();
        let diag = mgr.diagnostics();
        assert_eq!(diag.get(C1), Some(&WorkerState::Running));
    }

    #[tokio::test]
    async fn shutdown_during_start_leaves_nothing_behind() {
        let relays = SlowRelayFactory {
            idle: IdleRelayFactory::default(),
            delay: Duration::from_millis(200),
        };
        let idle = relays.idle.clone();
        let (mgr, _) = manager_with(vec![stored("late", U1)], Arc::new(relays));

        let pending = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.reconcile(&ActivityEvent::new("late", true, false, U1)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        mgr.shutdown().await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ManagerError::ShuttingDown));
        assert_eq!(mgr.count(), 0);
        assert!(mgr.lookup("late").is_none());
        assert_eq!(idle.running(), 0);
    }

    #[tokio::test]
    async fn shutdown_during_bootstrap_leaves_nothing_behind() {
        let relays = SlowRelayFactory {
            idle: IdleRelayFactory::default(),
            delay: Duration::from_millis(200),
        };
        let idle = relays.idle.clone();
        let (mgr, _) = manager_with(vec![stored("a", U1), stored("b", U2)], Arc::new(relays));

        let booting = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.bootstrap().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        mgr.shutdown().await;

        let report = booting.await.unwrap().unwrap();
        assert!(report.started.is_empty());
        assert_eq!(report.failed.len(), 2);
        assert_eq!(mgr.count(), 0);
        assert_eq!(idle.running(), 0);
    }

    #[tokio::test]
    async fn store_write_failure_does_not_undo_the_start() {
        let store = Arc::new(UnreliableStore::default());
        store.inner.upsert(stored(C1, U1).activated(false)).await.unwrap();
        store.fail_updates.store(true, Ordering::SeqCst);
        let mgr = WorkerManager::new(store.clone(), Arc::new(IdleRelayFactory::default()), timeouts());

        let outcome = mgr.reconcile(&activity(true, false, U2)).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Started);
        let worker = mgr.lookup(C1).expect("registered despite store failure");
        assert!(worker.is_running());
        assert_eq!(worker.connection().system_url, U2);

        // the record still says what it said before
        let record = store.get(C1).await.unwrap().unwrap();
        assert!(!record.active);
        assert_eq!(record.system_url, U1);

        let outcome = mgr.reconcile(&activity(false, false, U2)).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Stopped);
        assert!(mgr.lookup(C1).is_none());
    }

    #[tokio::test]
    async fn bootstrap_reports_listing_failure_without_touching_registry() {
        let store = Arc::new(UnreliableStore::default());
        store.inner.upsert(stored(C1, U1)).await.unwrap();
        store.inner.upsert(stored("other", U2)).await.unwrap();
        let relays = Arc::new(IdleRelayFactory::default());
        let mgr = WorkerManager::new(store.clone(), relays.clone(), timeouts());
        mgr.reconcile(&activity(true, false, U1)).await.unwrap();

        store.fail_listing.store(true, Ordering::SeqCst);
        let err = mgr.bootstrap().await.unwrap_err();
        assert!(matches!(err, ManagerError::Store(StoreError::Io(_))));
        assert_eq!(mgr.client_ids(), vec![C1.to_string()]);
        assert_eq!(relays.prepared(), 1);
    }

    #[tokio::test]
    async fn start_timeout_leaves_no_entry() {
        let (mgr, _) = manager_with(vec![stored(C1, U1)], Arc::new(HangingRelayFactory));

        let err = mgr.reconcile(&activity(true, false, U1)).await.unwrap_err();
        assert!(matches!(err, ManagerError::Worker(WorkerError::StartTimeout(..))));
        assert!(mgr.lookup(C1).is_none());
        assert_eq!(mgr.count(), 0);
    }

    #[tokio::test]
    async fn tenant_locks_are_dropped_once_idle_and_absent() {
        let (mgr, _) = manager_with(vec![stored(C1, U1)], Arc::new(IdleRelayFactory::default()));

        mgr.reconcile(&activity(true, false, U1)).await.unwrap();
        assert!(mgr.tenant_locks.contains_key(C1));

        mgr.reconcile(&activity(false, false, U1)).await.unwrap();
        assert!(!mgr.tenant_locks.contains_key(C1));

        for i in 0..10 {
            mgr.reconcile(&ActivityEvent::new(format!("gone-{i}"), false, false, U1))
                .await
                .unwrap();
        }
        assert!(mgr.tenant_locks.is_empty());
    }
}
