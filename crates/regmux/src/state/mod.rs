//! Durable per-registry sync state.
//!
//! One [`StateService`] contract, two backends with identical semantics:
//! a single-process file backend (per-registry `status.json`, process
//! mutex) and a multi-process Postgres backend (row locks, `SKIP LOCKED`
//! leasing). No backend-specific types leak through the trait.

use std::collections::BTreeMap;

use async_trait::async_trait;

use regmux_types::{RegistryConfig, RegistryRecord, StateError, SyncStatus};

mod file;
mod postgres;

pub use file::FileStateService;
pub use postgres::PgStateService;

/// Callback for [`StateService::update_status_atomically`]. Mutates the
/// status in place and returns whether to persist; must be pure with
/// respect to storage.
pub type StatusMutator<'a> = dyn FnMut(&mut SyncStatus) -> bool + Send + 'a;

/// Lease predicate for [`StateService::next_sync_job`]. Must be cheap:
/// the database backend evaluates it inside a transaction holding row
/// locks.
pub type JobPredicate<'a> = dyn Fn(&RegistryConfig, &SyncStatus) -> bool + Sync + 'a;

/// Durable per-registry sync state with atomic transitions and job
/// leasing.
#[async_trait]
pub trait StateService: Send + Sync {
    /// Startup reconciliation: upsert CONFIG-owned registries, refuse to
    /// touch API-owned rows or change a persisted `reg_type`, delete
    /// CONFIG rows absent from the input, and seed first-ever statuses.
    /// Conflicts fail the whole call without mutation. Idempotent.
    async fn initialize(&self, configs: &[RegistryConfig]) -> Result<(), StateError>;

    async fn sync_status(&self, name: &str) -> Result<SyncStatus, StateError>;

    async fn list_sync_statuses(&self) -> Result<BTreeMap<String, SyncStatus>, StateError>;

    /// Unconditional upsert of the full status row.
    async fn update_sync_status(&self, name: &str, status: &SyncStatus) -> Result<(), StateError>;

    /// Read-modify-write under a per-registry lock. Persists and returns
    /// `true` iff the callback returns `true`; otherwise commits a no-op.
    async fn update_status_atomically(
        &self,
        name: &str,
        mutate: &mut StatusMutator<'_>,
    ) -> Result<bool, StateError>;

    /// Atomically lease the next due sync job.
    ///
    /// Scans syncable registries ordered by last sync time (nulls first),
    /// skipping rows another worker holds and rows whose config cannot be
    /// reconstructed. The first match is flipped to `Syncing` (attempt
    /// counted, `last_attempt` stamped) in the same transaction and
    /// returned; `None` when nothing is due.
    async fn next_sync_job(
        &self,
        predicate: &JobPredicate<'_>,
    ) -> Result<Option<RegistryConfig>, StateError>;

    async fn registry(&self, name: &str) -> Result<RegistryRecord, StateError>;

    async fn list_registries(&self) -> Result<Vec<RegistryRecord>, StateError>;

    /// Create an API-owned registry at runtime.
    async fn create_registry(&self, config: &RegistryConfig)
    -> Result<RegistryRecord, StateError>;

    /// Delete an API-owned registry; CONFIG rows belong to the config
    /// file and are refused. Status and snapshot die by cascade.
    async fn delete_registry(&self, name: &str) -> Result<(), StateError>;
}

/// Message stamped on a status row while its sync runs.
pub const MSG_SYNC_IN_PROGRESS: &str = "Sync in progress";

/// Message written on a successful sync.
pub const MSG_SYNC_COMPLETED: &str = "Sync completed successfully";
