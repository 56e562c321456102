//! Time-bounded snapshot of job entities for offline reads.
//!
//! While online the UI feeds the cache a *live* view (in memory only). When
//! connectivity drops, the live view is frozen into the persisted snapshot
//! and stamped with `last_sync_time`; from then on reads are served from the
//! snapshot until it expires.

use chrono::{DateTime, Duration, Utc};
use fieldsync_core::{Job, JobId};

/// Default snapshot lifetime.
pub const DEFAULT_SNAPSHOT_TTL_HOURS: i64 = 4;

pub fn default_snapshot_ttl() -> Duration {
    Duration::hours(DEFAULT_SNAPSHOT_TTL_HOURS)
}

/// Cached job view (snapshot + optional live view).
#[derive(Debug, Clone)]
pub struct JobSnapshotCache {
    snapshot: Vec<Job>,
    last_sync_time: Option<DateTime<Utc>>,
    live: Option<Vec<Job>>,
    ttl: Duration,
}

impl JobSnapshotCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            snapshot: Vec::new(),
            last_sync_time: None,
            live: None,
            ttl,
        }
    }

    /// Rebuild from persisted fields. The live view starts empty.
    pub fn restore(snapshot: Vec<Job>, last_sync_time: Option<DateTime<Utc>>, ttl: Duration) -> Self {
        Self {
            snapshot,
            last_sync_time,
            live: None,
            ttl,
        }
    }

    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.last_sync_time
    }

    /// Raw snapshot contents regardless of age (for persistence).
    pub fn snapshot_jobs(&self) -> &[Job] {
        &self.snapshot
    }

    pub fn live(&self) -> Option<&[Job]> {
        self.live.as_deref()
    }

    /// Whether the snapshot is younger than the expiry window at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.last_sync_time
            .is_some_and(|stamp| now.signed_duration_since(stamp) < self.ttl)
    }

    /// The snapshot if fresh, otherwise empty. Stale data is never returned.
    pub fn get_cached_jobs(&self, now: DateTime<Utc>) -> Vec<Job> {
        if self.is_fresh(now) {
            self.snapshot.clone()
        } else {
            Vec::new()
        }
    }

    /// Jobs the UI should render: the live view while online (once one has
    /// been fetched), otherwise the snapshot.
    pub fn view(&self, online: bool, now: DateTime<Utc>) -> Vec<Job> {
        match (&self.live, online) {
            (Some(live), true) => live.clone(),
            _ => self.get_cached_jobs(now),
        }
    }

    /// Replace the live view with freshly fetched jobs.
    pub fn refresh(&mut self, jobs: Vec<Job>) {
        self.live = Some(jobs);
    }

    /// Freeze the live view into the snapshot.
    ///
    /// Without a live view (e.g. the session started offline) the existing
    /// snapshot and its timestamp are kept. Returns whether a snapshot was taken.
    pub fn freeze(&mut self, now: DateTime<Utc>) -> bool {
        match &self.live {
            Some(live) => {
                self.snapshot = live.clone();
                self.last_sync_time = Some(now);
                true
            }
            None => false,
        }
    }

    /// Apply `f` to the job with `id` in both the snapshot and the live view.
    /// Returns whether any copy was found.
    pub fn update_job(&mut self, id: &JobId, mut f: impl FnMut(&mut Job)) -> bool {
        let mut found = false;
        let live = self.live.iter_mut().flatten();
        for job in self.snapshot.iter_mut().chain(live) {
            if &job.id == id {
                f(job);
                found = true;
            }
        }
        found
    }

    /// Drop snapshot, timestamp and live view.
    pub fn clear(&mut self) {
        self.snapshot.clear();
        self.last_sync_time = None;
        self.live = None;
    }
}

impl Default for JobSnapshotCache {
    fn default() -> Self {
        Self::new(default_snapshot_ttl())
    }
}
