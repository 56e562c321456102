//! Offline engine: one per session, shared via `Arc`.
//!
//! Owns the action queue, the job snapshot cache, the sync engine and the
//! invalidation bus, and attaches itself to a `ConnectivityMonitor` so that
//! going offline freezes the job view and coming back online replays the
//! queue.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldsync_core::{ActionId, Job, NewAction, OfflineAction, WorkerId};
use serde::Serialize;

use crate::cache::default_snapshot_ttl;
use crate::connectivity::{ConnectivityMonitor, ConnectivityObserver, ObserverId};
use crate::invalidation::{InvalidationBus, InvalidationSubscription};
use crate::queue::{DeadLetter, ProjectionContext, ProjectionTable};
use crate::remote::{RemoteError, RemoteJobApi};
use crate::retry::RetryPolicy;
use crate::state::{DurableStore, SharedState};
use crate::store::StoreError;
use crate::sync::{SyncEngine, SyncPhase, SyncReport};

/// Session-level settings.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Stamped as assignee by the `accept_job` projection.
    pub worker_id: Option<WorkerId>,
    pub snapshot_ttl: chrono::Duration,
    pub retry: RetryPolicy,
    pub projections: ProjectionTable,
}

impl EngineOptions {
    pub fn with_worker(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn with_snapshot_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.snapshot_ttl = ttl;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_projections(mut self, projections: ProjectionTable) -> Self {
        self.projections = projections;
        self
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            worker_id: None,
            snapshot_ttl: default_snapshot_ttl(),
            retry: RetryPolicy::default(),
            projections: ProjectionTable::standard(),
        }
    }
}

/// Point-in-time view for pending/offline indicators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub online: bool,
    pub phase: SyncPhase,
    pub pending: usize,
    pub dead_lettered: usize,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_pass_at: Option<DateTime<Utc>>,
}

pub struct OfflineEngine {
    shared: SharedState,
    sync: SyncEngine,
    remote: Arc<dyn RemoteJobApi>,
    monitor: Arc<ConnectivityMonitor>,
    invalidation: InvalidationBus,
    projections: ProjectionTable,
    worker_id: Option<WorkerId>,
    observer_id: OnceLock<ObserverId>,
}

impl std::fmt::Debug for OfflineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineEngine")
            .field("status", &self.status())
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

impl OfflineEngine {
    /// Load the persisted state and attach to `monitor`.
    pub async fn open(
        store: DurableStore,
        remote: Arc<dyn RemoteJobApi>,
        monitor: Arc<ConnectivityMonitor>,
        options: EngineOptions,
    ) -> Arc<Self> {
        let shared = SharedState::open(store, options.snapshot_ttl).await;
        shared.update(|s| s.online = monitor.is_online());

        let engine = Arc::new(Self {
            shared,
            sync: SyncEngine::new(options.retry),
            remote,
            monitor: monitor.clone(),
            invalidation: InvalidationBus::new(),
            projections: options.projections,
            worker_id: options.worker_id,
            observer_id: OnceLock::new(),
        });

        let id = monitor.subscribe(Arc::new(EngineObserver {
            engine: Arc::downgrade(&engine),
        }));
        let _ = engine.observer_id.set(id);

        engine
    }

    /// Record a user intent.
    ///
    /// The action is appended, its projection (if any) applied to the cached
    /// jobs, and the result persisted before this returns. Never fails: a
    /// storage error is logged and the full state is written again on the
    /// next commit.
    pub async fn enqueue(&self, new: NewAction) -> ActionId {
        let now = Utc::now();
        let action = OfflineAction::from_new(new, ActionId::new(), now);
        let id = action.id;
        let kind = action.kind.clone();

        let projected = self
            .shared
            .commit(|s| {
                let ctx = ProjectionContext {
                    worker: self.worker_id.as_ref(),
                    now,
                };
                let projected = self.projections.project(&action, &mut s.cache, &ctx);
                s.queue.push(action);
                projected
            })
            .await;

        tracing::debug!(action_id = %id, %kind, projected, "action enqueued");
        id
    }

    /// Replay the queue now if online and no pass is running.
    pub async fn sync_now(&self) -> SyncReport {
        self.sync
            .run(&self.shared, self.monitor.is_online(), self.remote.as_ref(), &self.invalidation)
            .await
    }

    /// Offline transition: freeze the current job view into the snapshot.
    pub async fn handle_offline(&self) {
        // An enqueue can commit between the monitor flipping and this freeze.
        // Projections write the live view too, so the frozen copy keeps them.
        let now = Utc::now();
        let frozen = self
            .shared
            .commit(|s| {
                s.online = false;
                s.cache.freeze(now)
            })
            .await;

        if frozen {
            tracing::info!("went offline; job snapshot saved");
        } else {
            tracing::info!("went offline; no live job view, keeping previous snapshot");
        }
    }

    /// Online transition: replay the queue.
    pub async fn handle_online(&self) -> SyncReport {
        self.shared.commit(|s| s.online = true).await;
        tracing::info!("back online; replaying queued actions");
        self.sync_now().await
    }

    /// Replace the in-memory live job view. Not persisted until the next
    /// offline transition.
    pub fn refresh_jobs(&self, jobs: Vec<Job>) {
        self.shared.update(|s| s.cache.refresh(jobs));
    }

    /// Fetch available and assigned jobs and make them the live view.
    pub async fn refresh_from_remote(&self) -> Result<usize, RemoteError> {
        let available = self.remote.list_available_jobs().await?;
        let mine = self.remote.list_my_jobs().await?;

        let mut seen = HashSet::new();
        let jobs: Vec<Job> = available
            .into_iter()
            .chain(mine)
            .filter(|job| seen.insert(job.id.clone()))
            .collect();

        let count = jobs.len();
        self.refresh_jobs(jobs);
        tracing::debug!(jobs = count, "live job view refreshed");
        Ok(count)
    }

    /// Snapshot jobs if still fresh, otherwise empty.
    pub fn cached_jobs(&self) -> Vec<Job> {
        let now = Utc::now();
        self.shared.read(|s| s.cache.get_cached_jobs(now))
    }

    /// Jobs to render: the live view while online, otherwise the snapshot.
    pub fn jobs_view(&self) -> Vec<Job> {
        let online = self.monitor.is_online();
        let now = Utc::now();
        self.shared.read(|s| s.cache.view(online, now))
    }

    pub fn pending_actions(&self) -> Vec<OfflineAction> {
        self.shared.read(|s| s.queue.snapshot())
    }

    pub fn has_pending_actions(&self) -> bool {
        self.shared.read(|s| !s.queue.is_empty())
    }

    pub fn pending_count(&self) -> usize {
        self.shared.read(|s| s.queue.len())
    }

    pub fn is_syncing(&self) -> bool {
        self.sync.is_syncing()
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    pub fn status(&self) -> EngineStatus {
        let (pending, dead_lettered, last_sync_time) = self
            .shared
            .read(|s| (s.queue.len(), s.dead_letters.len(), s.cache.last_sync_time()));

        EngineStatus {
            online: self.monitor.is_online(),
            phase: self.sync.phase(),
            pending,
            dead_lettered,
            last_sync_time,
            last_pass_at: self.sync.last_pass_at(),
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.read(|s| s.dead_letters.clone())
    }

    /// Move a dead-lettered action back to the tail of the queue with its
    /// retry bookkeeping reset.
    pub async fn requeue_dead_letter(&self, id: ActionId) -> bool {
        if !self.shared.read(|s| s.dead_letters.iter().any(|d| d.action.id == id)) {
            return false;
        }

        let requeued = self
            .shared
            .commit(|s| {
                let Some(pos) = s.dead_letters.iter().position(|d| d.action.id == id) else {
                    return false;
                };
                let mut action = s.dead_letters.remove(pos).action;
                action.attempts = 0;
                action.last_error = None;
                action.next_attempt_at = None;
                s.queue.push(action)
            })
            .await;

        if requeued {
            tracing::info!(action_id = %id, "dead letter re-queued");
        }
        requeued
    }

    /// Discard pending actions, dead letters and cached jobs (logout/reset).
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.shared.reset().await?;
        tracing::info!("offline state cleared");
        Ok(())
    }

    /// Receive read-cache invalidation keys after successful passes.
    pub fn subscribe_invalidations(&self) -> InvalidationSubscription {
        self.invalidation.subscribe()
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn remote(&self) -> &Arc<dyn RemoteJobApi> {
        &self.remote
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.sync.policy()
    }
}

impl Drop for OfflineEngine {
    fn drop(&mut self) {
        if let Some(id) = self.observer_id.get() {
            self.monitor.unsubscribe(*id);
        }
    }
}

/// Monitor hook. Holds the engine weakly so the monitor does not keep a
/// dropped session alive.
struct EngineObserver {
    engine: Weak<OfflineEngine>,
}

#[async_trait]
impl ConnectivityObserver for EngineObserver {
    async fn on_online(&self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.handle_online().await;
        }
    }

    async fn on_offline(&self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.handle_offline().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ConnectivityState;
    use crate::store::InMemoryKeyValueStore;
    use fieldsync_core::{JobId, JobStatus};

    struct Unreachable;

    #[async_trait]
    impl RemoteJobApi for Unreachable {
        async fn accept_job(&self, _: ActionId, _: &JobId) -> Result<(), RemoteError> {
            Err(RemoteError::Network("unreachable".into()))
        }

        async fn update_status(&self, _: ActionId, _: &JobId, _: JobStatus) -> Result<(), RemoteError> {
            Err(RemoteError::Network("unreachable".into()))
        }

        async fn add_photo(&self, _: ActionId, _: &JobId, _: &fieldsync_core::PhotoRecord) -> Result<(), RemoteError> {
            Err(RemoteError::Network("unreachable".into()))
        }

        async fn list_available_jobs(&self) -> Result<Vec<Job>, RemoteError> {
            Ok(vec![Job::new(JobId::new("J1").unwrap(), "a", JobStatus::Available)])
        }

        async fn list_my_jobs(&self) -> Result<Vec<Job>, RemoteError> {
            Ok(vec![
                Job::new(JobId::new("J1").unwrap(), "a", JobStatus::Available),
                Job::new(JobId::new("J2").unwrap(), "b", JobStatus::Accepted),
            ])
        }

        async fn check_connectivity(&self) -> bool {
            false
        }
    }

    async fn engine(initial: ConnectivityState) -> (Arc<ConnectivityMonitor>, Arc<OfflineEngine>) {
        let monitor = ConnectivityMonitor::arc(initial);
        let store = DurableStore::new(InMemoryKeyValueStore::arc());
        let engine = OfflineEngine::open(store, Arc::new(Unreachable), monitor.clone(), EngineOptions::default()).await;
        (monitor, engine)
    }

    #[tokio::test]
    async fn refresh_from_remote_merges_by_id() {
        let (_, engine) = engine(ConnectivityState::Online).await;
        assert_eq!(engine.refresh_from_remote().await.unwrap(), 2);
        let ids: Vec<_> = engine.jobs_view().into_iter().map(|j| j.id.to_string()).collect();
        assert_eq!(ids, vec!["J1", "J2"]);
    }

    #[tokio::test]
    async fn enqueue_before_freeze_survives_into_snapshot() {
        let (monitor, engine) = engine(ConnectivityState::Online).await;
        engine.refresh_jobs(vec![Job::new(JobId::new("J1").unwrap(), "a", JobStatus::Available)]);

        engine.enqueue(NewAction::accept_job(JobId::new("J1").unwrap())).await;
        assert!(monitor.set_offline().await);

        let cached = engine.cached_jobs();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].status, JobStatus::Accepted);
        assert_eq!(engine.jobs_view()[0].status, JobStatus::Accepted);
        assert_eq!(engine.pending_count(), 1);
    }

    #[tokio::test]
    async fn dropping_the_engine_unsubscribes() {
        let (monitor, engine) = engine(ConnectivityState::Online).await;
        drop(engine);
        // No observer left to call; the transition still registers.
        assert!(monitor.set_offline().await);
    }

    #[tokio::test]
    async fn status_reflects_queue_and_connectivity() {
        let (monitor, engine) = engine(ConnectivityState::Offline).await;
        engine.enqueue(NewAction::accept_job(JobId::new("J9").unwrap())).await;

        let status = engine.status();
        assert!(!status.online);
        assert_eq!(status.phase, SyncPhase::Idle);
        assert_eq!(status.pending, 1);
        assert_eq!(status.last_pass_at, None);

        // Every call fails; the action stays queued.
        monitor.set_online().await;
        let status = engine.status();
        assert!(status.online);
        assert_eq!(status.pending, 1);
        assert!(status.last_pass_at.is_some());
        assert_eq!(engine.pending_actions()[0].attempts, 1);
    }
}
