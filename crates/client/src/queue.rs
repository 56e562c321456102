//! Ordered queue of pending offline actions and the optimistic projector.
//!
//! Queue order is insertion order. Nothing here reorders, coalesces or
//! deduplicates actions; the only removals are the ones a sync pass settles
//! (`settle`) and an explicit `clear`.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use fieldsync_core::{ActionId, ActionKind, JobStatus, OfflineAction, WorkerId};
use serde::{Deserialize, Serialize};

use crate::cache::JobSnapshotCache;
use crate::retry::RetryPolicy;

/// An action that exhausted its retry budget, or whose payload can never be
/// replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub action: OfflineAction,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// What a sync pass learned about the actions it looked at.
#[derive(Debug, Clone, Default)]
pub struct Settlement {
    /// Actions to remove: replayed successfully, or dropped as unreplayable.
    pub completed: HashSet<ActionId>,
    /// Actions whose replay failed, with the error.
    pub failed: Vec<(ActionId, String)>,
    /// Actions whose payload cannot be dispatched, with the reason. These go
    /// straight to dead letters whatever the retry policy says.
    pub rejected: Vec<(ActionId, String)>,
}

/// In-memory view of the pending action list.
#[derive(Debug, Clone, Default)]
pub struct ActionQueue {
    actions: Vec<OfflineAction>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted actions, keeping the first occurrence of any
    /// repeated id.
    pub fn restore(actions: Vec<OfflineAction>) -> Self {
        let mut seen = HashSet::with_capacity(actions.len());
        let mut queue = Self::new();
        for action in actions {
            if seen.insert(action.id) {
                queue.actions.push(action);
            } else {
                tracing::warn!(action_id = %action.id, "dropping duplicate action id from persisted queue");
            }
        }
        queue
    }

    /// Append an action. Returns `false` (and leaves the queue alone) if an
    /// action with the same id is already queued.
    pub fn push(&mut self, action: OfflineAction) -> bool {
        if self.contains(&action.id) {
            return false;
        }
        self.actions.push(action);
        true
    }

    /// Immutable copy of the current list.
    pub fn snapshot(&self) -> Vec<OfflineAction> {
        self.actions.clone()
    }

    pub fn actions(&self) -> &[OfflineAction] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn contains(&self, id: &ActionId) -> bool {
        self.actions.iter().any(|a| &a.id == id)
    }

    /// Apply a pass's results to the *current* list.
    ///
    /// Completed actions are removed, failed ones get their attempt
    /// bookkeeping updated and, once the policy is exhausted, are moved out
    /// and returned as dead letters. Rejected actions are dead-lettered on
    /// the spot. Ids the pass did not see (enqueued while it ran) are left
    /// exactly as they are.
    pub fn settle(&mut self, settlement: &Settlement, policy: &RetryPolicy, now: DateTime<Utc>) -> Vec<DeadLetter> {
        let failures: HashMap<&ActionId, &str> =
            settlement.failed.iter().map(|(id, err)| (id, err.as_str())).collect();
        let rejections: HashMap<&ActionId, &str> =
            settlement.rejected.iter().map(|(id, reason)| (id, reason.as_str())).collect();

        let mut dead = Vec::new();
        let mut kept = Vec::with_capacity(self.actions.len());

        for mut action in self.actions.drain(..) {
            if settlement.completed.contains(&action.id) {
                continue;
            }

            if let Some(reason) = rejections.get(&action.id) {
                action.attempts = action.attempts.saturating_add(1);
                action.last_error = Some((*reason).to_string());
                action.next_attempt_at = None;
                dead.push(DeadLetter {
                    reason: (*reason).to_string(),
                    action,
                    dead_lettered_at: now,
                });
                continue;
            }

            if let Some(error) = failures.get(&action.id) {
                action.attempts = action.attempts.saturating_add(1);
                action.last_error = Some((*error).to_string());
                action.next_attempt_at = policy.next_attempt_at(now, action.attempts);

                if policy.is_exhausted(action.attempts) {
                    tracing::warn!(
                        action_id = %action.id,
                        kind = %action.kind,
                        attempts = action.attempts,
                        "retry budget exhausted; moving action to dead letters"
                    );
                    dead.push(DeadLetter {
                        reason: (*error).to_string(),
                        action,
                        dead_lettered_at: now,
                    });
                    continue;
                }
            }

            kept.push(action);
        }

        self.actions = kept;
        dead
    }

    pub fn clear(&mut self) {
        self.actions.clear();
    }
}

/// Inputs a projector may use besides the action itself.
#[derive(Debug, Clone, Copy)]
pub struct ProjectionContext<'a> {
    /// Worker of this session, stamped as assignee where relevant.
    pub worker: Option<&'a WorkerId>,
    pub now: DateTime<Utc>,
}

/// Applies an action's expected effect to the cache. Returns whether a cached
/// job was touched.
pub type Projector = fn(&OfflineAction, &mut JobSnapshotCache, &ProjectionContext<'_>) -> bool;

/// Policy table: action kind → optimistic projection.
///
/// Kinds without an entry are left unprojected and only show up in the cache
/// once the server confirms them and the UI refetches.
#[derive(Clone)]
pub struct ProjectionTable {
    entries: HashMap<ActionKind, Projector>,
}

impl std::fmt::Debug for ProjectionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

impl ProjectionTable {
    /// No projections at all.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// `accept_job` marks the job accepted and assigned to this worker.
    pub fn standard() -> Self {
        Self::empty().with(ActionKind::AcceptJob, project_accept_job)
    }

    pub fn with(mut self, kind: ActionKind, projector: Projector) -> Self {
        self.entries.insert(kind, projector);
        self
    }

    pub fn get(&self, kind: &ActionKind) -> Option<Projector> {
        self.entries.get(kind).copied()
    }

    /// Run the projection registered for the action's kind, if any.
    pub fn project(&self, action: &OfflineAction, cache: &mut JobSnapshotCache, ctx: &ProjectionContext<'_>) -> bool {
        match self.get(&action.kind) {
            Some(projector) => projector(action, cache, ctx),
            None => false,
        }
    }
}

impl Default for ProjectionTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Projection for `accept_job`.
pub fn project_accept_job(action: &OfflineAction, cache: &mut JobSnapshotCache, ctx: &ProjectionContext<'_>) -> bool {
    cache.update_job(&action.target_id, |job| {
        job.status = JobStatus::Accepted;
        if let Some(worker) = ctx.worker {
            job.assigned_to = Some(worker.clone());
        }
        job.updated_at = Some(ctx.now);
    })
}

/// Projection for `update_status`: applies the requested status when the
/// payload is valid. Not registered by default; opt in with
/// `ProjectionTable::standard().with(ActionKind::UpdateStatus, project_update_status)`.
pub fn project_update_status(action: &OfflineAction, cache: &mut JobSnapshotCache, ctx: &ProjectionContext<'_>) -> bool {
    let Ok(status) = action.requested_status() else {
        return false;
    };
    cache.update_job(&action.target_id, |job| {
        job.status = status;
        job.updated_at = Some(ctx.now);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::TimeZone;
    use fieldsync_core::{Job, JobId, NewAction};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap()
    }

    fn job_id(id: &str) -> JobId {
        JobId::new(id).unwrap()
    }

    fn action(new: NewAction) -> OfflineAction {
        OfflineAction::from_new(new, ActionId::new(), at(0))
    }

    #[test]
    fn push_preserves_order_and_rejects_duplicate_ids() {
        let mut queue = ActionQueue::new();
        let a = action(NewAction::accept_job(job_id("J1")));
        let b = action(NewAction::update_status(job_id("J1"), JobStatus::InProgress));

        assert!(queue.push(a.clone()));
        assert!(queue.push(b.clone()));
        assert!(!queue.push(a.clone()));

        let ids: Vec<_> = queue.actions().iter().map(|x| x.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[test]
    fn restore_drops_repeated_ids() {
        let a = action(NewAction::accept_job(job_id("J1")));
        let queue = ActionQueue::restore(vec![a.clone(), a.clone()]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn settle_removes_completed_and_keeps_newcomers() {
        let mut queue = ActionQueue::new();
        let a = action(NewAction::accept_job(job_id("J1")));
        let b = action(NewAction::accept_job(job_id("J2")));
        queue.push(a.clone());
        queue.push(b.clone());

        // Enqueued after the pass took its snapshot.
        let late = action(NewAction::accept_job(job_id("J3")));
        queue.push(late.clone());

        let settlement = Settlement {
            completed: [a.id].into_iter().collect(),
            failed: vec![(b.id, "503".to_string())],
            ..Settlement::default()
        };
        let dead = queue.settle(&settlement, &RetryPolicy::default(), at(10));

        assert!(dead.is_empty());
        let remaining: Vec<_> = queue.actions().iter().map(|x| x.id).collect();
        assert_eq!(remaining, vec![b.id, late.id]);

        let retained = &queue.actions()[0];
        assert_eq!(retained.attempts, 1);
        assert_eq!(retained.last_error.as_deref(), Some("503"));
        assert_eq!(retained.next_attempt_at, None);
        assert_eq!(queue.actions()[1].attempts, 0);
    }

    #[test]
    fn settle_dead_letters_exhausted_actions() {
        let mut queue = ActionQueue::new();
        let mut a = action(NewAction::accept_job(job_id("J1")));
        a.attempts = 1;
        queue.push(a.clone());

        let policy = RetryPolicy::fixed(Some(2), Duration::from_secs(60));
        let settlement = Settlement {
            failed: vec![(a.id, "boom".to_string())],
            ..Settlement::default()
        };
        let dead = queue.settle(&settlement, &policy, at(0));

        assert!(queue.is_empty());
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].action.id, a.id);
        assert_eq!(dead[0].action.attempts, 2);
        assert_eq!(dead[0].reason, "boom");
    }

    #[test]
    fn settle_dead_letters_rejected_actions_under_unbounded_policy() {
        let mut queue = ActionQueue::new();
        let broken = action(NewAction::accept_job(job_id("J1")));
        let retried = action(NewAction::accept_job(job_id("J2")));
        queue.push(broken.clone());
        queue.push(retried.clone());

        let settlement = Settlement {
            failed: vec![(retried.id, "503".to_string())],
            rejected: vec![(broken.id, "invalid payload: missing status".to_string())],
            ..Settlement::default()
        };
        let dead = queue.settle(&settlement, &RetryPolicy::unbounded(), at(0));

        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].action.id, broken.id);
        assert_eq!(dead[0].action.attempts, 1);
        assert_eq!(dead[0].reason, "invalid payload: missing status");
        assert_eq!(dead[0].dead_lettered_at, at(0));

        let remaining: Vec<_> = queue.actions().iter().map(|x| x.id).collect();
        assert_eq!(remaining, vec![retried.id]);
    }

    #[test]
    fn settle_schedules_backoff() {
        let mut queue = ActionQueue::new();
        let a = action(NewAction::accept_job(job_id("J1")));
        queue.push(a.clone());

        let policy = RetryPolicy::fixed(None, Duration::from_secs(60));
        let settlement = Settlement {
            failed: vec![(a.id, "timeout".to_string())],
            ..Settlement::default()
        };
        queue.settle(&settlement, &policy, at(0));

        assert_eq!(queue.actions()[0].next_attempt_at, Some(at(60)));
        assert!(!queue.actions()[0].is_due(at(59)));
    }

    #[test]
    fn standard_table_projects_accept_only() {
        let mut cache = JobSnapshotCache::default();
        cache.refresh(vec![
            Job::new(job_id("J1"), "a", JobStatus::Available),
            Job::new(job_id("J2"), "b", JobStatus::Accepted),
        ]);
        cache.freeze(at(0));

        let worker = WorkerId::new("w-1").unwrap();
        let ctx = ProjectionContext {
            worker: Some(&worker),
            now: at(5),
        };
        let table = ProjectionTable::standard();

        assert!(table.project(&action(NewAction::accept_job(job_id("J1"))), &mut cache, &ctx));
        let j1 = &cache.snapshot_jobs()[0];
        assert_eq!(j1.status, JobStatus::Accepted);
        assert!(j1.is_assigned_to(&worker));
        assert_eq!(j1.updated_at, Some(at(5)));

        let status = action(NewAction::update_status(job_id("J2"), JobStatus::Completed));
        assert!(!table.project(&status, &mut cache, &ctx));
        assert_eq!(cache.snapshot_jobs()[1].status, JobStatus::Accepted);

        let extended = ProjectionTable::standard().with(ActionKind::UpdateStatus, project_update_status);
        assert!(extended.project(&status, &mut cache, &ctx));
        assert_eq!(cache.snapshot_jobs()[1].status, JobStatus::Completed);
    }
}
