//! Lifecycle and scheduling across all registries.
//!
//! One scheduling loop per syncable registry, each on its own ticker
//! (1-minute default). A tick claims the registry through an atomic
//! `!Syncing → Syncing` transition, runs the sync pipeline outside any
//! lock, and finalizes status on every exit path. In multi-replica
//! deployments the lease loop replaces the per-registry tickers: work is
//! pulled through the state service's `next_sync_job`, whose row locking
//! guarantees at-most-one replica syncs a given registry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use regmux_types::status::MSG_SYNC_INTERRUPTED;
use regmux_types::{RegistryConfig, StateError, SyncError, SyncPhase, SyncStatus};

use crate::metrics::Metrics;
use crate::state::{MSG_SYNC_COMPLETED, MSG_SYNC_IN_PROGRESS, StateService};
use crate::sync::{DEFAULT_SYNC_INTERVAL, SyncManager, SyncOutcome};

/// How the coordinator schedules work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    /// One ticker loop per syncable registry; single-replica deployments.
    PerRegistry,
    /// Poll the state service's job lease; safe with multiple replicas
    /// sharing a database backend.
    Lease { poll_interval: Duration },
}

/// Drives syncs for every configured registry until stopped.
pub struct Coordinator {
    state: Arc<dyn StateService>,
    sync_manager: Arc<SyncManager>,
    metrics: Arc<dyn Metrics>,
    registries: Vec<RegistryConfig>,
    mode: ScheduleMode,
    cancel: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(
        state: Arc<dyn StateService>,
        sync_manager: Arc<SyncManager>,
        metrics: Arc<dyn Metrics>,
        registries: Vec<RegistryConfig>,
        mode: ScheduleMode,
    ) -> Self {
        Self {
            state,
            sync_manager,
            metrics,
            registries,
            mode,
            cancel: CancellationToken::new(),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Token cancelled by [`Coordinator::stop`]; embedders may link it to
    /// process shutdown signals.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn the scheduling loops and block until cancelled.
    pub async fn start(self: Arc<Self>) {
        match self.mode {
            ScheduleMode::PerRegistry => {
                let mut tasks = self.tasks.lock().await;
                for config in &self.registries {
                    if !config.syncable() {
                        debug!(registry = %config.name, "skipping non-synced registry");
                        continue;
                    }
                    let this = Arc::clone(&self);
                    let config = config.clone();
                    tasks.push(tokio::spawn(async move {
                        this.run_registry_loop(config).await;
                    }));
                }
                info!(loops = tasks.len(), "coordinator started");
            }
            ScheduleMode::Lease { poll_interval } => {
                let this = Arc::clone(&self);
                let mut tasks = self.tasks.lock().await;
                tasks.push(tokio::spawn(async move {
                    this.run_lease_loop(poll_interval).await;
                }));
                info!(poll = ?poll_interval, "coordinator started in lease mode");
            }
        }

        self.cancel.cancelled().await;
    }

    /// Cancel all loops and await in-flight syncs.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "scheduling loop panicked");
            }
        }
        info!("coordinator stopped");
    }

    async fn run_registry_loop(&self, config: RegistryConfig) {
        let interval = match config.sync_interval() {
            Some(Ok(interval)) if !interval.is_zero() => interval,
            Some(Ok(_)) => {
                warn!(registry = %config.name, "zero sync interval; using default");
                DEFAULT_SYNC_INTERVAL
            }
            Some(Err(e)) => {
                warn!(registry = %config.name, error = %e,
                      "unparseable sync interval; using default");
                DEFAULT_SYNC_INTERVAL
            }
            None => DEFAULT_SYNC_INTERVAL,
        };

        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately, giving every registry an
        // initial check on startup.
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sync_once(&config, false).await {
                error!(registry = %config.name, error = %e, "sync attempt errored");
            }
        }
    }

    async fn run_lease_loop(&self, poll_interval: Duration) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(jittered(poll_interval)) => {}
            }

            let now = Utc::now();
            let manager = &self.sync_manager;
            let leased = self
                .state
                .next_sync_job(&|config, status| manager.needs_attempt(config, status, now))
                .await;

            match leased {
                Ok(Some(config)) => {
                    // The lease already flipped the row to Syncing.
                    let claimed = match self.state.sync_status(&config.name).await {
                        Ok(status) => status,
                        Err(e) => {
                            error!(registry = %config.name, error = %e,
                                   "failed to read leased status");
                            continue;
                        }
                    };
                    self.run_claimed_sync(&config, claimed).await;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "job lease poll failed"),
            }
        }
    }

    /// One decision + sync attempt for a registry. `manual` marks an
    /// operator-requested sync.
    pub async fn sync_once(
        &self,
        config: &RegistryConfig,
        manual: bool,
    ) -> Result<(), StateError> {
        let status = self.state.sync_status(&config.name).await?;
        let reason = self
            .sync_manager
            .should_sync(&self.cancel, config, &status, manual)
            .await;
        if !reason.should_sync() {
            debug!(registry = %config.name, %reason, "skipping sync");
            return Ok(());
        }
        info!(registry = %config.name, %reason, "sync needed");

        // Claim under the row lock; losing the race is not an error.
        let mut claimed = None;
        let changed = self
            .state
            .update_status_atomically(&config.name, &mut |status| {
                if status.sync_in_flight(Utc::now()) {
                    return false;
                }
                status.phase = SyncPhase::Syncing;
                status.message = MSG_SYNC_IN_PROGRESS.to_string();
                status.last_attempt = Some(Utc::now());
                status.attempt_count += 1;
                claimed = Some(status.clone());
                true
            })
            .await?;
        if !changed {
            debug!(registry = %config.name, "another worker holds the sync");
            return Ok(());
        }
        let claimed = claimed.expect("claim callback populated the status");

        self.run_claimed_sync(config, claimed).await;
        Ok(())
    }

    /// Run the pipeline for an already-claimed registry and finalize its
    /// status no matter how the sync ends.
    async fn run_claimed_sync(&self, config: &RegistryConfig, claimed: SyncStatus) {
        let mut guard = FinalizeGuard::new(Arc::clone(&self.state), config.name.clone());
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SyncError::fetch(format!(
                "registry {:?}: sync cancelled during shutdown",
                config.name
            ))),
            result = self.sync_manager.perform_sync(&self.cancel, config) => result,
        };

        let success = outcome.is_ok();
        let final_status = finalize_status(claimed, &outcome, config);
        match self
            .state
            .update_sync_status(&config.name, &final_status)
            .await
        {
            Ok(()) => guard.disarm(),
            Err(e) => error!(registry = %config.name, error = %e,
                             "failed to write final sync status"),
        }

        self.metrics
            .record_sync_duration(&config.name, started.elapsed(), success);
        match &outcome {
            Ok(result) => {
                self.metrics
                    .record_server_count(&config.name, result.server_count);
                info!(registry = %config.name, servers = result.server_count,
                      hash = %result.hash, "sync completed");
            }
            Err(e) => {
                warn!(registry = %config.name, kind = %e.kind, error = %e, "sync failed");
            }
        }
    }
}

/// Build the final status row from the claimed row and the pipeline
/// outcome.
fn finalize_status(
    mut status: SyncStatus,
    outcome: &Result<SyncOutcome, SyncError>,
    config: &RegistryConfig,
) -> SyncStatus {
    match outcome {
        Ok(result) => {
            status.phase = SyncPhase::Complete;
            status.message = MSG_SYNC_COMPLETED.to_string();
            status.last_sync_time = Some(Utc::now());
            status.last_sync_hash = Some(result.hash.clone());
            status.last_applied_filter_hash = Some(SyncManager::applied_filter_hash(config));
            status.server_count = result.server_count;
            status.attempt_count = 0;
        }
        Err(e) => {
            status.phase = SyncPhase::Failed;
            status.message = e.message.clone();
            // attempt_count was already bumped at claim time and is
            // retained across failures.
        }
    }
    status
}

/// Writes a failure row if a sync ends without finalizing (task abort,
/// panic in the pipeline). Disarmed after the normal final write.
struct FinalizeGuard {
    state: Arc<dyn StateService>,
    registry: String,
    armed: bool,
}

impl FinalizeGuard {
    fn new(state: Arc<dyn StateService>, registry: String) -> Self {
        Self {
            state,
            registry,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let state = Arc::clone(&self.state);
        let registry = std::mem::take(&mut self.registry);
        tokio::spawn(async move {
            let result = state
                .update_status_atomically(&registry, &mut |status| {
                    if status.phase != SyncPhase::Syncing {
                        return false;
                    }
                    status.phase = SyncPhase::Failed;
                    status.message = MSG_SYNC_INTERRUPTED.to_string();
                    true
                })
                .await;
            if let Err(e) = result {
                error!(registry = %registry, error = %e,
                       "failed to record interrupted sync");
            }
        });
    }
}

/// Uniform jitter of ±25% so replicas polling the lease do not align.
fn jittered(base: Duration) -> Duration {
    let factor = rand::rng().random_range(0.75..=1.25);
    base.mul_f64(factor)
}
