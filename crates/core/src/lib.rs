//! `fieldsync-core`: domain building blocks for the field worker client.
//!
//! This crate contains **pure domain** types (no IO, no async): identifiers,
//! the cached job entity and the offline action model replayed by the sync
//! engine.

pub mod action;
pub mod error;
pub mod id;
pub mod job;

pub use action::{ActionKind, NewAction, OfflineAction, PhotoRecord};
pub use error::{DomainError, DomainResult};
pub use id::{ActionId, JobId, WorkerId};
pub use job::{Job, JobStatus};
