//! Catalog snapshot persistence.
//!
//! A [`CatalogStore`] holds the latest normalized catalog per registry.
//! The atomicity contract: after a successful `store`, readers see the new
//! snapshot in full; on error, readers still see the previous snapshot
//! unchanged. Snapshots are replaced whole, never patched.

use anyhow::Result;
use async_trait::async_trait;

use regmux_types::Catalog;

mod file;
mod postgres;

pub use file::FileCatalogStore;
pub use postgres::PgCatalogStore;

/// Storage for the per-registry catalog snapshot written by the sync
/// pipeline and read by the registry service.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Atomically replace the snapshot for a registry.
    async fn store(&self, registry: &str, catalog: &Catalog) -> Result<()>;

    /// Load the latest committed snapshot, `None` if none was ever stored.
    async fn load(&self, registry: &str) -> Result<Option<Catalog>>;

    /// Drop the snapshot for a registry, if any.
    async fn delete(&self, registry: &str) -> Result<()>;
}
