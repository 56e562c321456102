//! Job entity as cached on the device.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DomainError;
use crate::id::{JobId, WorkerId};

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Open for any worker to accept.
    Available,
    /// Accepted by a worker, not yet started.
    Accepted,
    /// Work is underway.
    InProgress,
    Completed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Available => "available",
            JobStatus::Accepted => "accepted",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(JobStatus::Available),
            "accepted" => Ok(JobStatus::Accepted),
            "in_progress" => Ok(JobStatus::InProgress),
            "completed" => Ok(JobStatus::Completed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// A job entity (matches the API response shape).
///
/// Fields the client does not interpret are kept in `extra` so a cached
/// snapshot renders the same as the live response it was taken from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(default)]
    pub title: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<WorkerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Job {
    pub fn new(id: JobId, title: impl Into<String>, status: JobStatus) -> Self {
        Self {
            id,
            title: title.into(),
            status,
            assigned_to: None,
            updated_at: None,
            extra: Map::new(),
        }
    }

    /// Whether the job is assigned to `worker`.
    pub fn is_assigned_to(&self, worker: &WorkerId) -> bool {
        self.assigned_to.as_ref() == Some(worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_match_wire_names() {
        for status in [
            JobStatus::Available,
            JobStatus::Accepted,
            JobStatus::InProgress,
            JobStatus::Completed,
            JobStatus::Cancelled,
        ] {
            let wire = serde_json::to_value(status).unwrap();
            assert_eq!(wire, Value::String(status.as_str().to_string()));
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!(matches!(
            "paused".parse::<JobStatus>(),
            Err(DomainError::UnknownStatus(s)) if s == "paused"
        ));
    }

    #[test]
    fn unknown_job_fields_survive_a_round_trip() {
        let raw = serde_json::json!({
            "id": "J1",
            "title": "Fix boiler",
            "status": "available",
            "address": "12 High St",
            "reward_points": 40
        });

        let job: Job = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(job.id.as_str(), "J1");
        assert_eq!(job.extra.get("reward_points"), Some(&Value::from(40)));
        assert_eq!(serde_json::to_value(&job).unwrap(), raw);
    }
}
