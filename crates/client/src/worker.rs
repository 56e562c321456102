//! Background connectivity probe.
//!
//! Polls the remote health endpoint on an interval, reports the result to the
//! engine's monitor (which fires the online/offline hooks on a transition) and
//! nudges a sync when online with work still queued, so failed actions get
//! retried without waiting for the next transition.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::connectivity::ConnectivityState;
use crate::engine::OfflineEngine;

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

pub struct ConnectivityWorker {
    engine: Arc<OfflineEngine>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl ConnectivityWorker {
    pub fn new(engine: Arc<OfflineEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle for requesting shutdown after `start` consumed the worker.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Probe once and act on the result.
    ///
    /// A transition to online already runs a pass through the engine's
    /// monitor hook, so the periodic pass only runs on ticks without one.
    pub async fn tick(engine: &OfflineEngine) {
        let online = engine.remote().check_connectivity().await;
        let transitioned = engine.monitor().report(ConnectivityState::from_online(online)).await;

        if !transitioned && online && engine.has_pending_actions() && !engine.is_syncing() {
            let report = engine.sync_now().await;
            tracing::debug!(outcome = ?report.outcome, succeeded = report.succeeded.len(), "periodic sync");
        }
    }

    /// Spawn the probe loop. The first probe runs immediately.
    pub fn start(self) -> JoinHandle<()> {
        let Self {
            engine,
            interval,
            shutdown,
        } = self;

        tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "connectivity worker started");

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        tracing::info!("connectivity worker received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        Self::tick(&engine).await;
                    }
                }
            }

            tracing::info!("connectivity worker stopped");
        })
    }
}
