//! Offline actions: recorded intents to mutate a job, replayed on reconnect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{DomainError, DomainResult};
use crate::id::{ActionId, JobId};
use crate::job::JobStatus;

/// Kind of mutation an action performs.
///
/// The set is closed; `Unknown` only appears when a persisted queue was written
/// by a client with a different set of kinds. Such actions can never be
/// replayed and are dropped by the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionKind {
    AcceptJob,
    UpdateStatus,
    AddPhoto,
    Unknown(String),
}

impl ActionKind {
    pub fn as_str(&self) -> &str {
        match self {
            ActionKind::AcceptJob => "accept_job",
            ActionKind::UpdateStatus => "update_status",
            ActionKind::AddPhoto => "add_photo",
            ActionKind::Unknown(raw) => raw,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, ActionKind::Unknown(_))
    }
}

impl From<String> for ActionKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "accept_job" => ActionKind::AcceptJob,
            "update_status" => ActionKind::UpdateStatus,
            "add_photo" => ActionKind::AddPhoto,
            _ => ActionKind::Unknown(value),
        }
    }
}

impl From<ActionKind> for String {
    fn from(value: ActionKind) -> Self {
        match value {
            ActionKind::Unknown(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl core::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A photo attached to a job from the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoRecord {
    /// Device-local or uploaded location of the image.
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    pub taken_at: DateTime<Utc>,
}

/// An action as requested by the UI, before the queue assigns id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAction {
    pub kind: ActionKind,
    pub target_id: JobId,
    pub payload: Value,
}

impl NewAction {
    pub fn accept_job(target_id: JobId) -> Self {
        Self {
            kind: ActionKind::AcceptJob,
            target_id,
            payload: json!({}),
        }
    }

    pub fn update_status(target_id: JobId, status: JobStatus) -> Self {
        Self {
            kind: ActionKind::UpdateStatus,
            target_id,
            payload: json!({ "status": status.as_str() }),
        }
    }

    pub fn add_photo(target_id: JobId, photo: &PhotoRecord) -> Self {
        Self {
            kind: ActionKind::AddPhoto,
            target_id,
            payload: json!({
                "uri": photo.uri,
                "caption": photo.caption,
                "taken_at": photo.taken_at,
            }),
        }
    }
}

/// A pending action in the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineAction {
    pub id: ActionId,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub target_id: JobId,
    #[serde(default)]
    pub payload: Value,
    /// Diagnostics and ordering only; actions never expire.
    pub enqueued_at: DateTime<Utc>,
    /// Failed replay attempts so far.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Earliest time the next replay may be attempted (backoff).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl OfflineAction {
    pub fn from_new(action: NewAction, id: ActionId, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: action.kind,
            target_id: action.target_id,
            payload: action.payload,
            enqueued_at,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
        }
    }

    /// Whether backoff allows a replay at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Status requested by an `update_status` action.
    pub fn requested_status(&self) -> DomainResult<JobStatus> {
        let raw = self
            .payload
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| DomainError::invalid_payload("update_status requires a string `status`"))?;
        raw.parse()
    }

    /// Photo carried by an `add_photo` action.
    pub fn photo(&self) -> DomainResult<PhotoRecord> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| DomainError::invalid_payload(format!("add_photo: {e}")))
    }
}
