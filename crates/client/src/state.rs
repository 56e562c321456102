//! Persisted offline state and the in-memory view kept in lockstep with it.
//!
//! The whole record lives as one JSON blob under a fixed key. `DurableStore`
//! is the only writer of that blob; `SharedState` mutates the in-memory view
//! and writes it back before a mutation counts as committed.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use fieldsync_core::{Job, OfflineAction};
use serde::{Deserialize, Serialize};

use crate::cache::JobSnapshotCache;
use crate::queue::{ActionQueue, DeadLetter};
use crate::store::{KeyValueStore, StoreError};

/// Fixed namespace key of the offline state blob.
pub const STATE_KEY: &str = "fieldsync.offline_state";

/// The single durable record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Last known connectivity. Advisory only; not trusted after a reload.
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub pending_actions: Vec<OfflineAction>,
    #[serde(default)]
    pub cached_jobs: Vec<Job>,
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dead_letters: Vec<DeadLetter>,
}

/// Load/save access to the persisted record.
#[derive(Clone)]
pub struct DurableStore {
    kv: Arc<dyn KeyValueStore>,
    key: String,
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore").field("key", &self.key).finish_non_exhaustive()
    }
}

impl DurableStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self::with_key(kv, STATE_KEY)
    }

    pub fn with_key(kv: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self { kv, key: key.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load the record, or an empty one when nothing is stored.
    ///
    /// Read and parse failures are treated as a cold start: availability wins
    /// over durability here.
    pub async fn load(&self) -> PersistedState {
        let raw = match self.kv.get(&self.key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return PersistedState::default(),
            Err(err) => {
                tracing::warn!(key = %self.key, error = %err, "failed to read offline state; starting empty");
                return PersistedState::default();
            }
        };

        match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(key = %self.key, error = %err, "offline state is unreadable; starting empty");
                PersistedState::default()
            }
        }
    }

    pub async fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        let raw = serde_json::to_string(state).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.kv.set(&self.key, raw).await
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.kv.remove(&self.key).await
    }
}

/// In-memory view of the persisted record.
#[derive(Debug, Clone)]
pub(crate) struct LocalState {
    pub online: bool,
    pub queue: ActionQueue,
    pub cache: JobSnapshotCache,
    pub dead_letters: Vec<DeadLetter>,
}

impl LocalState {
    /// Rebuild from the persisted record. Connectivity is not restored: the
    /// session starts offline until a monitor says otherwise.
    pub fn from_persisted(state: PersistedState, ttl: Duration) -> Self {
        Self {
            online: false,
            queue: ActionQueue::restore(state.pending_actions),
            cache: JobSnapshotCache::restore(state.cached_jobs, state.last_sync_time, ttl),
            dead_letters: state.dead_letters,
        }
    }

    pub fn to_persisted(&self) -> PersistedState {
        PersistedState {
            online: self.online,
            pending_actions: self.queue.snapshot(),
            cached_jobs: self.cache.snapshot_jobs().to_vec(),
            last_sync_time: self.cache.last_sync_time(),
            dead_letters: self.dead_letters.clone(),
        }
    }
}

/// In-memory state plus its durable copy.
///
/// The state mutex is only ever held for synchronous sections. Mutations that
/// must be persisted go through `commit`, which serializes
/// mutate-then-write sections behind an async gate so writes reach storage
/// in mutation order.
pub(crate) struct SharedState {
    state: Mutex<LocalState>,
    store: DurableStore,
    write_gate: tokio::sync::Mutex<()>,
}

impl SharedState {
    pub async fn open(store: DurableStore, ttl: Duration) -> Self {
        let persisted = store.load().await;
        tracing::info!(
            pending = persisted.pending_actions.len(),
            cached_jobs = persisted.cached_jobs.len(),
            dead_letters = persisted.dead_letters.len(),
            "loaded offline state"
        );

        Self {
            state: Mutex::new(LocalState::from_persisted(persisted, ttl)),
            store,
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Read from the in-memory state.
    pub fn read<R>(&self, f: impl FnOnce(&LocalState) -> R) -> R {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    /// Mutate fields that are not persisted (the live job view).
    pub fn update<R>(&self, f: impl FnOnce(&mut LocalState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Mutate the in-memory state and persist the result.
    ///
    /// A failed write is logged, not returned: the in-memory change stands
    /// and the next successful commit writes the complete state again.
    pub async fn commit<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut LocalState) -> R + Send,
        R: Send,
    {
        let _gate = self.write_gate.lock().await;

        let (result, snapshot) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let result = f(&mut state);
            (result, state.to_persisted())
        };

        if let Err(err) = self.store.save(&snapshot).await {
            tracing::error!(error = %err, "failed to persist offline state");
        }

        result
    }

    /// Discard all pending actions, dead letters and cached data, in memory
    /// and on disk. Connectivity is kept.
    pub async fn reset(&self) -> Result<(), StoreError> {
        let _gate = self.write_gate.lock().await;

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.queue.clear();
            state.cache.clear();
            state.dead_letters.clear();
        }

        self.store.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::default_snapshot_ttl;
    use crate::store::InMemoryKeyValueStore;
    use fieldsync_core::{ActionId, JobId, JobStatus, NewAction};

    fn store() -> (Arc<InMemoryKeyValueStore>, DurableStore) {
        let kv = InMemoryKeyValueStore::arc();
        let store = DurableStore::new(kv.clone());
        (kv, store)
    }

    #[tokio::test]
    async fn missing_state_loads_empty() {
        let (_, store) = store();
        assert_eq!(store.load().await, PersistedState::default());
    }

    #[tokio::test]
    async fn corrupt_state_loads_empty() {
        let (kv, store) = store();
        kv.insert_raw(STATE_KEY, "{not json");
        assert_eq!(store.load().await, PersistedState::default());
    }

    #[tokio::test]
    async fn save_then_load_returns_same_record() {
        let (kv, store) = store();
        let job_id = JobId::new("J1").unwrap();
        let state = PersistedState {
            online: true,
            pending_actions: vec![OfflineAction::from_new(
                NewAction::accept_job(job_id.clone()),
                ActionId::new(),
                Utc::now(),
            )],
            cached_jobs: vec![Job::new(job_id, "Fix boiler", JobStatus::Available)],
            last_sync_time: Some(Utc::now()),
            dead_letters: Vec::new(),
        };

        store.save(&state).await.unwrap();
        assert!(kv.raw(STATE_KEY).is_some());
        assert_eq!(store.load().await, state);

        store.clear().await.unwrap();
        assert!(kv.raw(STATE_KEY).is_none());
    }

    #[tokio::test]
    async fn records_without_newer_fields_still_load() {
        let (kv, store) = store();
        kv.insert_raw(STATE_KEY, r#"{"online":true,"pending_actions":[],"cached_jobs":[],"last_sync_time":null}"#);
        let state = store.load().await;
        assert!(state.online);
        assert!(state.dead_letters.is_empty());
    }

    #[tokio::test]
    async fn reload_does_not_trust_online_flag() {
        let (_, store) = store();
        store
            .save(&PersistedState {
                online: true,
                ..PersistedState::default()
            })
            .await
            .unwrap();

        let shared = SharedState::open(store, default_snapshot_ttl()).await;
        assert!(!shared.read(|s| s.online));
    }

    #[tokio::test]
    async fn commit_writes_through() {
        let (kv, store) = store();
        let shared = SharedState::open(store.clone(), default_snapshot_ttl()).await;

        let action = OfflineAction::from_new(
            NewAction::accept_job(JobId::new("J7").unwrap()),
            ActionId::new(),
            Utc::now(),
        );
        let pushed = shared.commit(|s| s.queue.push(action.clone())).await;
        assert!(pushed);

        let on_disk = store.load().await;
        assert_eq!(on_disk.pending_actions, vec![action]);

        shared.reset().await.unwrap();
        assert!(kv.raw(STATE_KEY).is_none());
        assert!(shared.read(|s| s.queue.is_empty()));
    }
}
