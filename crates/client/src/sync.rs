//! Sync engine: replays the offline queue against the remote API.
//!
//! A pass works on an immutable snapshot of the queue taken when it starts,
//! dispatches those actions strictly in order (one at a time, never aborting
//! on a failure), and then settles the results against the queue *as it is at
//! the end of the pass*. Actions enqueued while the pass ran are therefore
//! neither dropped nor dispatched twice; they wait for the next pass.
//!
//! Only one pass runs at a time. Asking for a pass while one is in flight is
//! a no-op, not a queued request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use fieldsync_core::{ActionId, ActionKind, OfflineAction};
use serde::{Deserialize, Serialize};

use crate::invalidation::{InvalidationBus, InvalidationKey};
use crate::queue::Settlement;
use crate::remote::RemoteJobApi;
use crate::retry::RetryPolicy;
use crate::state::SharedState;

/// Sync engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Syncing,
}

/// How a `run` request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A pass ran to completion.
    Completed,
    /// Not attempted: offline.
    SkippedOffline,
    /// Not attempted: another pass is in flight.
    SkippedBusy,
}

/// Result of a sync request.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    /// Actions in the snapshot the pass worked on.
    pub snapshot_len: usize,
    pub succeeded: Vec<ActionId>,
    pub failed: Vec<(ActionId, String)>,
    /// Unreplayable actions removed without dispatch.
    pub dropped: Vec<ActionId>,
    /// Actions skipped because their backoff had not elapsed.
    pub deferred: Vec<ActionId>,
    /// Actions whose payload could not be dispatched.
    pub rejected: Vec<(ActionId, String)>,
    /// Actions moved to dead letters in this pass: rejected ones plus
    /// failures that exhausted the retry policy.
    pub dead_lettered: Vec<ActionId>,
}

impl SyncReport {
    fn skipped(outcome: SyncOutcome) -> Self {
        Self {
            outcome,
            snapshot_len: 0,
            succeeded: Vec::new(),
            failed: Vec::new(),
            dropped: Vec::new(),
            deferred: Vec::new(),
            rejected: Vec::new(),
            dead_lettered: Vec::new(),
        }
    }
}

/// Outcome of replaying one action.
#[derive(Debug)]
enum Dispatch {
    Succeeded,
    Failed(String),
    /// Known kind, but the payload is malformed. Retrying cannot help.
    Rejected(String),
    Dropped(String),
}

/// Resets the phase to `Idle` however the pass ends (including the future
/// being dropped mid-flight).
struct PhaseGuard<'a>(&'a AtomicBool);

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Idle/Syncing state machine plus the replay loop.
#[derive(Debug)]
pub struct SyncEngine {
    syncing: AtomicBool,
    policy: RetryPolicy,
    last_pass_at: Mutex<Option<DateTime<Utc>>>,
}

impl SyncEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            syncing: AtomicBool::new(false),
            policy,
            last_pass_at: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        if self.syncing.load(Ordering::Acquire) {
            SyncPhase::Syncing
        } else {
            SyncPhase::Idle
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.phase() == SyncPhase::Syncing
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// When the last completed pass finished.
    pub fn last_pass_at(&self) -> Option<DateTime<Utc>> {
        *self.last_pass_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_begin(&self) -> Option<PhaseGuard<'_>> {
        self.syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PhaseGuard(&self.syncing))
    }

    /// Run one pass if online and idle.
    pub(crate) async fn run(
        &self,
        shared: &SharedState,
        online: bool,
        remote: &dyn RemoteJobApi,
        invalidation: &InvalidationBus,
    ) -> SyncReport {
        if !online {
            tracing::debug!("sync skipped: offline");
            return SyncReport::skipped(SyncOutcome::SkippedOffline);
        }

        let Some(_phase) = self.try_begin() else {
            tracing::debug!("sync skipped: pass already in flight");
            return SyncReport::skipped(SyncOutcome::SkippedBusy);
        };

        let snapshot = shared.read(|s| s.queue.snapshot());
        let started_at = Utc::now();
        let mut report = SyncReport {
            snapshot_len: snapshot.len(),
            ..SyncReport::skipped(SyncOutcome::Completed)
        };

        tracing::info!(pending = snapshot.len(), "sync pass started");

        let mut settlement = Settlement::default();
        for action in &snapshot {
            if !action.is_due(started_at) {
                report.deferred.push(action.id);
                continue;
            }

            match dispatch(remote, action).await {
                Dispatch::Succeeded => {
                    tracing::debug!(action_id = %action.id, kind = %action.kind, job_id = %action.target_id, "action synced");
                    settlement.completed.insert(action.id);
                    report.succeeded.push(action.id);
                }
                Dispatch::Failed(error) => {
                    tracing::warn!(
                        action_id = %action.id,
                        kind = %action.kind,
                        job_id = %action.target_id,
                        attempts = action.attempts + 1,
                        %error,
                        "action sync failed; will retry"
                    );
                    settlement.failed.push((action.id, error.clone()));
                    report.failed.push((action.id, error));
                }
                Dispatch::Rejected(reason) => {
                    tracing::warn!(
                        action_id = %action.id,
                        kind = %action.kind,
                        job_id = %action.target_id,
                        %reason,
                        "action payload is malformed; moving to dead letters"
                    );
                    settlement.rejected.push((action.id, reason.clone()));
                    report.rejected.push((action.id, reason));
                }
                Dispatch::Dropped(reason) => {
                    tracing::warn!(action_id = %action.id, kind = %action.kind, %reason, "dropping unreplayable action");
                    settlement.completed.insert(action.id);
                    report.dropped.push(action.id);
                }
            }
        }

        if !settlement.completed.is_empty() || !settlement.failed.is_empty() || !settlement.rejected.is_empty() {
            let finished_at = Utc::now();
            report.dead_lettered = shared
                .commit(|s| {
                    let dead = s.queue.settle(&settlement, &self.policy, finished_at);
                    let ids = dead.iter().map(|d| d.action.id).collect::<Vec<_>>();
                    s.dead_letters.extend(dead);
                    ids
                })
                .await;
        }

        if !report.succeeded.is_empty() {
            invalidation.publish_all(&InvalidationKey::JOB_COLLECTIONS);
        }

        *self.last_pass_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());

        tracing::info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            rejected = report.rejected.len(),
            dropped = report.dropped.len(),
            deferred = report.deferred.len(),
            dead_lettered = report.dead_lettered.len(),
            "sync pass finished"
        );

        report
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

/// Replay one action against the remote API.
async fn dispatch(remote: &dyn RemoteJobApi, action: &OfflineAction) -> Dispatch {
    let result = match &action.kind {
        ActionKind::AcceptJob => remote.accept_job(action.id, &action.target_id).await,
        ActionKind::UpdateStatus => match action.requested_status() {
            Ok(status) => remote.update_status(action.id, &action.target_id, status).await,
            Err(err) => return Dispatch::Rejected(err.to_string()),
        },
        ActionKind::AddPhoto => match action.photo() {
            Ok(photo) => remote.add_photo(action.id, &action.target_id, &photo).await,
            Err(err) => return Dispatch::Rejected(err.to_string()),
        },
        ActionKind::Unknown(raw) => return Dispatch::Dropped(format!("unknown action type `{raw}`")),
    };

    match result {
        Ok(()) => Dispatch::Succeeded,
        Err(err) => Dispatch::Failed(err.to_string()),
    }
}
