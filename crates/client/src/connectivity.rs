//! Connectivity state and transition hooks.
//!
//! `ConnectivityMonitor` is fed observations (from a probe, the OS, or a
//! test) and fires `on_online` / `on_offline` on its observers exactly once
//! per transition. Repeating the current state fires nothing.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Connectivity state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// Online and able to reach the API.
    Online,
    /// Offline (network unreachable or API unavailable).
    Offline,
}

impl ConnectivityState {
    pub fn from_online(online: bool) -> Self {
        if online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }

    pub fn is_online(self) -> bool {
        self == ConnectivityState::Online
    }
}

/// Lifecycle hooks fired on connectivity transitions.
#[async_trait]
pub trait ConnectivityObserver: Send + Sync {
    async fn on_online(&self);

    async fn on_offline(&self);
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct MonitorInner {
    state: ConnectivityState,
    next_id: u64,
    observers: Vec<(ObserverId, Arc<dyn ConnectivityObserver>)>,
}

/// Tracks connectivity and notifies observers on transitions.
pub struct ConnectivityMonitor {
    inner: Mutex<MonitorInner>,
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ConnectivityMonitor")
            .field("state", &inner.state)
            .field("observers", &inner.observers.len())
            .finish()
    }
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        Self {
            inner: Mutex::new(MonitorInner {
                state: initial,
                next_id: 0,
                observers: Vec::new(),
            }),
        }
    }

    pub fn arc(initial: ConnectivityState) -> Arc<Self> {
        Arc::new(Self::new(initial))
    }

    pub fn state(&self) -> ConnectivityState {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).state
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    /// Register an observer. It is not called for the current state, only for
    /// transitions from now on.
    pub fn subscribe(&self, observer: Arc<dyn ConnectivityObserver>) -> ObserverId {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = ObserverId(inner.next_id);
        inner.next_id += 1;
        inner.observers.push((id, observer));
        id
    }

    /// Remove an observer. Returns whether it was registered.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let before = inner.observers.len();
        inner.observers.retain(|(oid, _)| *oid != id);
        inner.observers.len() != before
    }

    /// Record an observed state. On a transition, awaits every observer's
    /// hook in registration order and returns `true`.
    pub async fn report(&self, state: ConnectivityState) -> bool {
        let observers: Vec<Arc<dyn ConnectivityObserver>> = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.state == state {
                return false;
            }
            inner.state = state;
            inner.observers.iter().map(|(_, o)| o.clone()).collect()
        };

        tracing::info!(state = ?state, observers = observers.len(), "connectivity changed");

        for observer in observers {
            match state {
                ConnectivityState::Online => observer.on_online().await,
                ConnectivityState::Offline => observer.on_offline().await,
            }
        }

        true
    }

    pub async fn set_online(&self) -> bool {
        self.report(ConnectivityState::Online).await
    }

    pub async fn set_offline(&self) -> bool {
        self.report(ConnectivityState::Offline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        online: AtomicUsize,
        offline: AtomicUsize,
    }

    #[async_trait]
    impl ConnectivityObserver for Counting {
        async fn on_online(&self) {
            self.online.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_offline(&self) {
            self.offline.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn fires_once_per_transition() {
        let monitor = ConnectivityMonitor::new(ConnectivityState::Online);
        let counting = Arc::new(Counting::default());
        monitor.subscribe(counting.clone());

        assert!(!monitor.set_online().await);
        assert!(monitor.set_offline().await);
        assert!(!monitor.set_offline().await);
        assert!(monitor.set_online().await);
        assert!(!monitor.set_online().await);

        assert_eq!(counting.offline.load(Ordering::SeqCst), 1);
        assert_eq!(counting.online.load(Ordering::SeqCst), 1);
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn unsubscribed_observers_are_not_called() {
        let monitor = ConnectivityMonitor::new(ConnectivityState::Offline);
        let counting = Arc::new(Counting::default());
        let id = monitor.subscribe(counting.clone());

        assert!(monitor.unsubscribe(id));
        assert!(!monitor.unsubscribe(id));

        monitor.set_online().await;
        assert_eq!(counting.online.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.state(), ConnectivityState::Online);
    }
}
