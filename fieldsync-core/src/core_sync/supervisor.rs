/*
    supervisor.rs - Process-wide sync lifecycle

    - start: one pull-then-push cycle, then the periodic background cycle
    - connectivity regained: immediate push
    - shutdown: let a running cycle finish within the grace period, then
      stop the periodic cycle

    The only state held is the engine's "background cycle running" flag.
*/

use super::engine::{SyncEngine, SyncReport};
use super::errors::SyncResult;
use super::status::NetworkState;
use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct SyncSupervisor {
    engine: Arc<SyncEngine>,
}

impl SyncSupervisor {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        SyncSupervisor { engine }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Startup cycle, then the periodic cycle if enabled
    ///
    /// The periodic cycle starts even when the startup cycle fails; the
    /// startup result is returned afterwards.
    pub async fn start(&self) -> SyncResult<Option<SyncReport>> {
        let result = self.engine.startup_sync().await;
        if let Err(e) = &result {
            warn!(error = %e, "Startup sync failed");
        }

        let config = self.engine.config();
        if config.background_sync {
            self.engine.start_background_sync(config.interval);
        } else {
            debug!("Background sync disabled");
        }
        result
    }

    /// Apply a connectivity change; pushes when sync becomes possible again
    pub async fn on_network_change(&self, state: NetworkState) -> SyncResult<Option<SyncReport>> {
        let was_eligible = self.engine.can_sync();
        self.engine.set_network(state);
        if was_eligible || !self.engine.can_sync() {
            return Ok(None);
        }
        info!(network = %state, "Connectivity regained; pushing queued changes");
        self.engine.push_changes().await
    }

    /// Follow a host-provided connectivity stream until it closes
    pub fn watch_network(&self, mut network: watch::Receiver<NetworkState>) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            loop {
                let state = *network.borrow_and_update();
                if let Err(e) = supervisor.on_network_change(state).await {
                    warn!(network = %state, error = %e, "Push on reconnect failed");
                }
                if network.changed().await.is_err() {
                    break;
                }
            }
            debug!("Connectivity stream closed");
        })
    }

    pub fn is_running(&self) -> bool {
        self.engine.is_background_running()
    }

    pub fn stop(&self) -> bool {
        self.engine.stop_background_sync()
    }

    /// Start, then wait for a shutdown signal
    ///
    /// A failed startup cycle does not stop the process; its result is
    /// returned once shutdown completes.
    pub async fn run_until_shutdown(
        &self,
        coordinator: &ShutdownCoordinator,
    ) -> SyncResult<Option<SyncReport>> {
        let mut signals = coordinator.subscribe();
        if coordinator.is_shutting_down().await {
            return Ok(None);
        }
        let startup = self.start().await;
        match &startup {
            Ok(Some(report)) => {
                debug!(pushed = report.pushed, pulled = report.pulled, "Startup sync done")
            }
            Ok(None) => {
                info!(network = %self.engine.network(), "Startup sync skipped; waiting for the periodic cycle")
            }
            Err(e) if e.is_auth() => {
                error!(error = %e, "Startup sync rejected; check the bearer token")
            }
            Err(e) => debug!(error = %e, "Continuing after failed startup sync"),
        }

        let signal = signals.recv().await.unwrap_or(ShutdownSignal::Graceful);
        if signal == ShutdownSignal::Graceful && self.engine.is_syncing() {
            info!(grace = ?coordinator.grace_period(), "Waiting for the running sync cycle");
            let mut status = self.engine.subscribe();
            let finished = async {
                while status.borrow_and_update().is_syncing {
                    if status.changed().await.is_err() {
                        break;
                    }
                }
            };
            tokio::select! {
                result = tokio::time::timeout(coordinator.grace_period(), finished) => {
                    if result.is_err() {
                        warn!("Grace period elapsed; unacknowledged operations stay queued");
                    }
                }
                Ok(ShutdownSignal::Immediate) = signals.recv() => {
                    warn!("Immediate shutdown; unacknowledged operations stay queued");
                }
            }
        }

        self.stop();
        coordinator.mark_complete().await;
        startup
    }
}
