use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::RegistryType;

/// A `Syncing` row older than this is treated as orphaned by a dead worker
/// and may be re-claimed. The file backend additionally rewrites such rows
/// at startup.
pub const STALE_SYNC_TIMEOUT: Duration = Duration::from_secs(600);

/// Message seeded for syncable registries that have never synced. The
/// `Failed` phase guarantees the first tick triggers a sync.
pub const MSG_NO_PREVIOUS_SYNC: &str = "No previous sync status found";

/// Message written when startup recovery finds an orphaned `Syncing` row.
pub const MSG_SYNC_INTERRUPTED: &str = "Previous sync was interrupted";

/// The sync state machine phase held per registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Syncing,
    Complete,
    Failed,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::Syncing => write!(f, "syncing"),
            SyncPhase::Complete => write!(f, "complete"),
            SyncPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Durable per-registry sync state.
///
/// Mutated only through the state service's atomic operations; invariants:
/// `attempt_count == 0` iff `phase == Complete`, and `last_sync_hash` is set
/// iff at least one sync has succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    #[serde(default)]
    pub message: String,
    /// Time the most recent sync attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    /// Consecutive failures; reset to 0 on success.
    #[serde(default)]
    pub attempt_count: u32,
    /// Time of the last successful sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Content hash of the last successfully stored catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_hash: Option<String>,
    /// Hash of the filter config applied at the last success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_filter_hash: Option<String>,
    #[serde(default)]
    pub server_count: u64,
}

impl SyncStatus {
    /// Seed state for a syncable registry that has never synced.
    pub fn initial_syncable() -> Self {
        Self {
            phase: SyncPhase::Failed,
            message: MSG_NO_PREVIOUS_SYNC.to_string(),
            last_attempt: None,
            attempt_count: 0,
            last_sync_time: None,
            last_sync_hash: None,
            last_applied_filter_hash: None,
            server_count: 0,
        }
    }

    /// Seed state for managed/kubernetes registries, which never sync.
    pub fn initial_non_synced(reg_type: RegistryType) -> Self {
        Self {
            phase: SyncPhase::Complete,
            message: format!("Non-synced registry (type: {reg_type})"),
            last_attempt: None,
            attempt_count: 0,
            last_sync_time: None,
            last_sync_hash: None,
            last_applied_filter_hash: None,
            server_count: 0,
        }
    }

    /// Whether a sync is currently believed to be running.
    ///
    /// A `Syncing` row whose attempt started more than
    /// [`STALE_SYNC_TIMEOUT`] ago is considered orphaned (the worker died
    /// without finalizing) and no longer counts as in flight.
    pub fn sync_in_flight(&self, now: DateTime<Utc>) -> bool {
        if self.phase != SyncPhase::Syncing {
            return false;
        }
        match self.last_attempt {
            Some(started) => {
                let age = now.signed_duration_since(started);
                age.to_std().map(|d| d < STALE_SYNC_TIMEOUT).unwrap_or(true)
            }
            // Syncing with no attempt timestamp is malformed; treat as stale.
            None => false,
        }
    }

    /// Whether at least one sync has ever succeeded.
    pub fn has_synced(&self) -> bool {
        self.last_sync_hash.is_some()
    }
}
