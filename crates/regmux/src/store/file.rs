use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

use regmux_types::Catalog;

use crate::fsutil;
use crate::store::CatalogStore;

pub const CATALOG_FILE: &str = "catalog.json";

/// File-backed snapshot store: `{dataDir}/{registry}/catalog.json`,
/// written via temp file + rename so readers never observe a torn
/// snapshot.
pub struct FileCatalogStore {
    data_dir: PathBuf,
}

impl FileCatalogStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    fn catalog_path(&self, registry: &str) -> PathBuf {
        self.data_dir.join(registry).join(CATALOG_FILE)
    }
}

#[async_trait]
impl CatalogStore for FileCatalogStore {
    async fn store(&self, registry: &str, catalog: &Catalog) -> Result<()> {
        let path = self.catalog_path(registry);
        let catalog = catalog.clone();
        tokio::task::spawn_blocking(move || {
            let dir = path.parent().expect("catalog path has a parent");
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            fsutil::atomic_write_json(&path, &catalog)
        })
        .await
        .context("snapshot write task failed")?
    }

    async fn load(&self, registry: &str) -> Result<Option<Catalog>> {
        let path = self.catalog_path(registry);
        tokio::task::spawn_blocking(move || fsutil::load_json(&path))
            .await
            .context("snapshot read task failed")?
    }

    async fn delete(&self, registry: &str) -> Result<()> {
        let path = self.catalog_path(registry);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}
