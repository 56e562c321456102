//! `fieldsync-client`
//!
//! **Responsibility:** Offline-first action queue and sync engine for the
//! field worker app.
//!
//! This crate provides:
//! - A durable, ordered queue of user intents recorded while offline
//! - Optimistic projection of queued actions onto cached jobs
//! - A time-bounded job snapshot for offline reads
//! - Replay of the queue against the remote API when connectivity returns
//!
//! The server stays the authority: the queue only guarantees that every
//! recorded intent is delivered (at least once) in the order it was made.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod invalidation;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod state;
pub mod store;
pub mod sync;
pub mod worker;

pub use cache::JobSnapshotCache;
pub use config::{ClientConfig, ConfigError};
pub use connectivity::{ConnectivityMonitor, ConnectivityObserver, ConnectivityState, ObserverId};
pub use engine::{EngineOptions, EngineStatus, OfflineEngine};
pub use invalidation::{InvalidationBus, InvalidationKey, InvalidationSubscription};
pub use queue::{DeadLetter, ProjectionContext, ProjectionTable, Projector};
pub use remote::{HttpRemoteApi, RemoteError, RemoteJobApi};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use state::{DurableStore, PersistedState, STATE_KEY};
pub use store::{InMemoryKeyValueStore, KeyValueStore, SqliteKeyValueStore, StoreError};
pub use sync::{SyncOutcome, SyncPhase, SyncReport};
pub use worker::ConnectivityWorker;
