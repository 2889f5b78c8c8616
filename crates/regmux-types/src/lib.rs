//! Domain types for the regmux registry aggregator.
//!
//! Everything a backend or handler needs to talk about a sub-registry lives
//! here: the normalized catalog model, the per-registry configuration and
//! persisted record shapes, the sync state machine, and the structured error
//! taxonomy shared by the sync pipeline and the read path.

/// Normalized catalog model: servers, versions, snapshots.
pub mod catalog;

/// Structured errors: sync pipeline, state backends, read path.
pub mod error;

/// Registry identity: configuration, persisted records, source blocks.
pub mod registry;

/// Per-registry sync state machine types.
pub mod status;

pub use catalog::{Catalog, ServerEntry, ServerVersion};
pub use error::{ServiceError, StateError, SyncError, SyncErrorKind};
pub use registry::{
    ApiSource, CreationType, FileSource, FilterConfig, GitSource, NameFilter, RegistryConfig,
    RegistryRecord, RegistryType, SourceType, SyncPolicy, TagFilter,
};
pub use status::{SyncPhase, SyncStatus};
