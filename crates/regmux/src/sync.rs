//! The should-sync decision and the sync pipeline.
//!
//! [`SyncManager::should_sync`] weighs, in order: the registry's state
//! (failed, recovering, never synced), a manual trigger, a filter config
//! change, and the configured interval. Only when one of those suggests a
//! sync might be needed does it probe the upstream hash; the probe is the
//! expensive part and is skipped whenever nothing else points at a sync.
//!
//! [`SyncManager::perform_sync`] runs handler creation → validation →
//! fetch → filter → store, mapping each stage's failure to its
//! [`SyncErrorKind`]. It never touches sync status; finalization is the
//! coordinator's job.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use regmux_filter::{apply_filters, filter_hash};
use regmux_types::{RegistryConfig, SyncError, SyncPhase, SyncStatus};

use crate::source::HandlerFactory;
use crate::store::CatalogStore;

/// Ticker interval used when a registry has no parseable sync policy.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Why a sync will or will not run. Closed enum; [`Reason::should_sync`]
/// is the boolean projection the coordinator acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// Last sync failed, was interrupted, or never happened, and the
    /// upstream differs from what is stored.
    RegistryNotReady,
    /// The filter config changed since the last applied filter.
    FilterChanged,
    /// Upstream content hash differs from the last synced hash.
    SourceDataChanged,
    /// Operator asked and the upstream differs.
    ManualWithChanges,
    /// The change probe failed; sync anyway as the conservative choice.
    ErrorCheckingChanges,
    /// A sync already holds this registry.
    AlreadyInProgress,
    /// Operator asked but the upstream is unchanged.
    ManualNoChanges,
    /// The probe failed while evaluating a routine interval check.
    ErrorCheckingSyncNeed,
    /// Interval not yet elapsed and nothing else triggers.
    UpToDateWithPolicy,
    /// No sync policy configured and nothing else triggers.
    UpToDateNoPolicy,
}

impl Reason {
    pub fn should_sync(&self) -> bool {
        matches!(
            self,
            Reason::RegistryNotReady
                | Reason::FilterChanged
                | Reason::SourceDataChanged
                | Reason::ManualWithChanges
                | Reason::ErrorCheckingChanges
        )
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Reason::RegistryNotReady => "registry not ready",
            Reason::FilterChanged => "filter changed",
            Reason::SourceDataChanged => "source data changed",
            Reason::ManualWithChanges => "manual sync with changes",
            Reason::ErrorCheckingChanges => "error checking for changes",
            Reason::AlreadyInProgress => "sync already in progress",
            Reason::ManualNoChanges => "manual sync with no changes",
            Reason::ErrorCheckingSyncNeed => "error checking sync need",
            Reason::UpToDateWithPolicy => "up to date with policy",
            Reason::UpToDateNoPolicy => "up to date without policy",
        };
        write!(f, "{s}")
    }
}

/// What a successful sync reports back for status finalization.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    /// Upstream content hash; becomes `last_sync_hash`.
    pub hash: String,
    /// Servers in the stored (post-filter) snapshot.
    pub server_count: u64,
}

/// Drives the per-registry sync pipeline.
pub struct SyncManager {
    handlers: Arc<dyn HandlerFactory>,
    catalogs: Arc<dyn CatalogStore>,
}

impl SyncManager {
    pub fn new(handlers: Arc<dyn HandlerFactory>, catalogs: Arc<dyn CatalogStore>) -> Self {
        Self { handlers, catalogs }
    }

    /// Cheap portion of the sync decision: no upstream I/O.
    ///
    /// Used as the lease predicate in multi-replica mode, where the probe
    /// must not run inside the lease transaction.
    pub fn needs_attempt(
        &self,
        config: &RegistryConfig,
        status: &SyncStatus,
        now: DateTime<Utc>,
    ) -> bool {
        if status.sync_in_flight(now) {
            return false;
        }
        !status.has_synced()
            || status.phase == SyncPhase::Failed
            || filter_changed(config, status)
            || interval_due(config, status, now)
    }

    /// Full sync decision, probing the upstream only when warranted.
    pub async fn should_sync(
        &self,
        cancel: &CancellationToken,
        config: &RegistryConfig,
        status: &SyncStatus,
        manual_requested: bool,
    ) -> Reason {
        let now = Utc::now();

        if status.sync_in_flight(now) {
            return Reason::AlreadyInProgress;
        }

        // A Syncing phase that is *not* in flight means the worker died;
        // treat it like a failed sync.
        let not_ready = !status.has_synced() || status.phase != SyncPhase::Complete;
        let filter_changed = filter_changed(config, status);
        let has_policy = config.sync_policy.as_ref().is_some_and(|p| p.interval.is_some());
        let due = interval_due(config, status, now);

        if !(not_ready || manual_requested || filter_changed || due) {
            return if has_policy {
                Reason::UpToDateWithPolicy
            } else {
                Reason::UpToDateNoPolicy
            };
        }

        // Something points at a sync; now pay for the probe.
        let current = match self.handlers.handler_for(config) {
            Ok(handler) => handler.current_hash(cancel, config).await,
            Err(e) => Err(anyhow::Error::new(e)),
        };

        let current = match current {
            Ok(hash) => hash,
            Err(e) => {
                return if not_ready || manual_requested || filter_changed {
                    warn!(registry = %config.name, error = %e,
                          "change probe failed; syncing conservatively");
                    Reason::ErrorCheckingChanges
                } else {
                    // Only the routine interval pointed here; skip this
                    // round rather than hammer a broken upstream.
                    warn!(registry = %config.name, error = %e,
                          "change probe failed during interval check");
                    Reason::ErrorCheckingSyncNeed
                };
            }
        };

        let data_changed = status.last_sync_hash.as_deref() != Some(current.as_str());

        if not_ready && data_changed {
            return Reason::RegistryNotReady;
        }
        if filter_changed {
            return Reason::FilterChanged;
        }
        if data_changed {
            return if manual_requested && !due {
                Reason::ManualWithChanges
            } else {
                Reason::SourceDataChanged
            };
        }
        if manual_requested {
            return Reason::ManualNoChanges;
        }
        if has_policy {
            Reason::UpToDateWithPolicy
        } else {
            Reason::UpToDateNoPolicy
        }
    }

    /// Run the full pipeline for one registry.
    ///
    /// Status is untouched here; the coordinator records the outcome.
    pub async fn perform_sync(
        &self,
        cancel: &CancellationToken,
        config: &RegistryConfig,
    ) -> Result<SyncOutcome, SyncError> {
        let handler = self.handlers.handler_for(config)?;
        handler.validate(config)?;

        let fetched = handler.fetch(cancel, config).await?;
        debug!(registry = %config.name, servers = fetched.server_count,
               format = %fetched.format, "fetched upstream catalog");

        let stored = match &config.filter {
            Some(filter) => apply_filters(&fetched.catalog, Some(filter)).map_err(|e| {
                SyncError::fetch(format!(
                    "registry {:?}: filter application failed",
                    config.name
                ))
                .with_cause(e)
            })?,
            None => fetched.catalog,
        };

        self.catalogs.store(&config.name, &stored).await.map_err(|e| {
            SyncError::storage(format!(
                "registry {:?}: failed to store snapshot",
                config.name
            ))
            .with_cause(e)
        })?;

        Ok(SyncOutcome {
            hash: fetched.hash,
            server_count: stored.server_count(),
        })
    }

    /// Hash of the filter that a successful sync of this config applies.
    pub fn applied_filter_hash(config: &RegistryConfig) -> String {
        filter_hash(config.filter.as_ref())
    }
}

fn filter_changed(config: &RegistryConfig, status: &SyncStatus) -> bool {
    let applied = status
        .last_applied_filter_hash
        .clone()
        .unwrap_or_else(|| filter_hash(None));
    filter_hash(config.filter.as_ref()) != applied
}

fn interval_due(config: &RegistryConfig, status: &SyncStatus, now: DateTime<Utc>) -> bool {
    let interval = match config.sync_interval() {
        None => return false,
        Some(Ok(interval)) => interval,
        Some(Err(_)) => DEFAULT_SYNC_INTERVAL,
    };
    match status.last_attempt {
        None => true,
        Some(last) => now
            .signed_duration_since(last)
            .to_std()
            .map(|elapsed| elapsed >= interval)
            .unwrap_or(false),
    }
}
