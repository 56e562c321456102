//! Read-cache invalidation signals for the UI layer.
//!
//! After a sync pass confirms at least one action, the engine publishes the
//! job collection keys whose server-side state changed. The UI owns its read
//! cache; it subscribes here and refetches on each key it receives.
//!
//! Delivery is best-effort fan-out with broadcast semantics: every live
//! subscription gets a copy of every key, and dropped subscriptions are
//! pruned on the next publish. Refetching is idempotent, so a duplicate or a
//! coalesced signal is harmless.

use std::sync::{Mutex, PoisonError, mpsc};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Read-cache key the UI refetches on invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidationKey {
    /// Jobs open for acceptance.
    AvailableJobs,
    /// Jobs assigned to the current worker.
    MyJobs,
}

impl InvalidationKey {
    /// Keys invalidated after any confirmed job mutation.
    pub const JOB_COLLECTIONS: [InvalidationKey; 2] = [InvalidationKey::AvailableJobs, InvalidationKey::MyJobs];

    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidationKey::AvailableJobs => "available-jobs",
            InvalidationKey::MyJobs => "my-jobs",
        }
    }
}

impl core::fmt::Display for InvalidationKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subscription to invalidation signals.
///
/// Designed for a single consumer (typically the UI thread polling with
/// `try_recv`).
#[derive(Debug)]
pub struct InvalidationSubscription {
    receiver: mpsc::Receiver<InvalidationKey>,
}

impl InvalidationSubscription {
    /// Block until the next key is available.
    pub fn recv(&self) -> Result<InvalidationKey, mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a key without blocking.
    pub fn try_recv(&self) -> Result<InvalidationKey, mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a key.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<InvalidationKey, mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything received so far, without blocking.
    pub fn drain(&self) -> Vec<InvalidationKey> {
        self.receiver.try_iter().collect()
    }
}

/// In-process pub/sub for invalidation keys.
#[derive(Debug, Default)]
pub struct InvalidationBus {
    subscribers: Mutex<Vec<mpsc::Sender<InvalidationKey>>>,
}

impl InvalidationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, key: InvalidationKey) {
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);

        // Drop any dead subscribers while publishing.
        subs.retain(|tx| tx.send(key).is_ok());
    }

    pub fn publish_all(&self, keys: &[InvalidationKey]) {
        for key in keys {
            self.publish(*key);
        }
    }

    pub fn subscribe(&self) -> InvalidationSubscription {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).push(tx);
        InvalidationSubscription { receiver: rx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_gets_every_key() {
        let bus = InvalidationBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish_all(&InvalidationKey::JOB_COLLECTIONS);

        assert_eq!(a.drain(), InvalidationKey::JOB_COLLECTIONS.to_vec());
        assert_eq!(b.drain(), InvalidationKey::JOB_COLLECTIONS.to_vec());
        assert!(a.try_recv().is_err());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = InvalidationBus::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(InvalidationKey::MyJobs);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(keep.recv_timeout(Duration::from_millis(10)).unwrap(), InvalidationKey::MyJobs);
    }

    #[test]
    fn keys_use_kebab_case_names() {
        assert_eq!(serde_json::to_value(InvalidationKey::AvailableJobs).unwrap(), "available-jobs");
        assert_eq!(InvalidationKey::MyJobs.to_string(), "my-jobs");
    }
}
