use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use regmux_types::{Catalog, FileSource, RegistryConfig, SyncError};

use crate::hash::sha256_hex;
use crate::source::{FetchOutcome, parse};

/// Reads a catalog from a local path. The content hash is the SHA-256 of
/// the raw file bytes, so the probe and the full fetch always agree.
pub struct FileHandler {}

impl FileHandler {
    pub fn new() -> Self {
        Self {}
    }

    fn source<'a>(&self, config: &'a RegistryConfig) -> Result<&'a FileSource, SyncError> {
        config.file.as_ref().ok_or_else(|| {
            SyncError::validation(format!(
                "registry {:?}: file source block is missing",
                config.name
            ))
        })
    }

    pub fn validate(&self, config: &RegistryConfig) -> Result<(), SyncError> {
        let source = self.source(config)?;
        let meta = std::fs::metadata(&source.path).map_err(|e| {
            SyncError::validation(format!(
                "registry {:?}: catalog file {} is not readable",
                config.name,
                source.path.display()
            ))
            .with_cause(e)
        })?;
        if !meta.is_file() {
            return Err(SyncError::validation(format!(
                "registry {:?}: {} is not a regular file",
                config.name,
                source.path.display()
            )));
        }
        Ok(())
    }

    pub async fn fetch(
        &self,
        cancel: &CancellationToken,
        config: &RegistryConfig,
    ) -> Result<FetchOutcome, SyncError> {
        let source = self.source(config).map_err(|e| {
            // A missing block at fetch time is an upstream-shape problem.
            SyncError::fetch(e.message.clone())
        })?;

        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(SyncError::fetch(format!(
                    "registry {:?}: fetch cancelled",
                    config.name
                )));
            }
            read = tokio::fs::read(&source.path) => read.map_err(|e| {
                SyncError::fetch(format!(
                    "registry {:?}: failed to read {}",
                    config.name,
                    source.path.display()
                ))
                .with_cause(e)
            })?,
        };

        let hash = sha256_hex(&bytes);
        let servers = parse::parse_catalog(&bytes, &config.format).map_err(|e| {
            SyncError::fetch(format!(
                "registry {:?}: failed to parse {}",
                config.name,
                source.path.display()
            ))
            .with_cause(e)
        })?;

        let catalog = Catalog::new(servers, hash.clone());
        let server_count = catalog.server_count();
        Ok(FetchOutcome {
            catalog,
            format: config.format.clone(),
            hash,
            server_count,
        })
    }

    pub async fn current_hash(
        &self,
        _cancel: &CancellationToken,
        config: &RegistryConfig,
    ) -> Result<String> {
        let source = config
            .file
            .as_ref()
            .with_context(|| format!("registry {:?}: file source block is missing", config.name))?;
        let bytes = tokio::fs::read(&source.path)
            .await
            .with_context(|| format!("failed to read {}", source.path.display()))?;
        Ok(sha256_hex(&bytes))
    }
}

impl Default for FileHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regmux_types::{SourceType, SyncErrorKind};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn config_for(path: PathBuf) -> RegistryConfig {
        let mut cfg = RegistryConfig::new("files", SourceType::File);
        cfg.file = Some(FileSource { path });
        cfg
    }

    const CATALOG: &str = r#"{"servers": [
        {"name": "alpha", "versions": [{"version": "1.0.0"}]},
        {"name": "beta", "versions": [{"version": "0.2.0"}]}
    ]}"#;

    #[tokio::test]
    async fn fetch_reads_parses_and_hashes() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("reg.json");
        std::fs::write(&path, CATALOG).expect("write catalog");

        let handler = FileHandler::new();
        let cfg = config_for(path);
        let out = handler
            .fetch(&CancellationToken::new(), &cfg)
            .await
            .expect("fetch");

        assert_eq!(out.server_count, 2);
        assert_eq!(out.hash, sha256_hex(CATALOG.as_bytes()));
        assert_eq!(out.catalog.hash, out.hash);
        assert_eq!(out.catalog.servers[0].name, "alpha");
    }

    #[tokio::test]
    async fn current_hash_agrees_with_fetch_hash() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("reg.json");
        std::fs::write(&path, CATALOG).expect("write catalog");

        let handler = FileHandler::new();
        let cfg = config_for(path);
        let probed = handler
            .current_hash(&CancellationToken::new(), &cfg)
            .await
            .expect("probe");
        let fetched = handler
            .fetch(&CancellationToken::new(), &cfg)
            .await
            .expect("fetch");
        assert_eq!(probed, fetched.hash);
    }

    #[tokio::test]
    async fn fetch_fails_with_fetch_kind_on_missing_file() {
        let handler = FileHandler::new();
        let cfg = config_for(PathBuf::from("/nonexistent/reg.json"));
        let err = handler
            .fetch(&CancellationToken::new(), &cfg)
            .await
            .err()
            .expect("must fail");
        assert_eq!(err.kind, SyncErrorKind::Fetch);
    }

    #[tokio::test]
    async fn fetch_fails_with_fetch_kind_on_malformed_catalog() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("reg.json");
        std::fs::write(&path, "{broken").expect("write");

        let handler = FileHandler::new();
        let cfg = config_for(path);
        let err = handler
            .fetch(&CancellationToken::new(), &cfg)
            .await
            .err()
            .expect("must fail");
        assert_eq!(err.kind, SyncErrorKind::Fetch);
        assert!(err.message.contains("failed to parse"));
    }

    #[test]
    fn validate_requires_existing_regular_file() {
        let td = tempdir().expect("tempdir");
        let handler = FileHandler::new();

        let missing = config_for(td.path().join("absent.json"));
        let err = handler.validate(&missing).err().expect("must fail");
        assert_eq!(err.kind, SyncErrorKind::Validation);

        let dir = config_for(td.path().to_path_buf());
        let err = handler.validate(&dir).err().expect("must fail");
        assert!(err.message.contains("not a regular file"));

        let path = td.path().join("reg.json");
        std::fs::write(&path, CATALOG).expect("write");
        handler.validate(&config_for(path)).expect("valid");
    }

    #[tokio::test]
    async fn cancelled_fetch_returns_promptly() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("reg.json");
        std::fs::write(&path, CATALOG).expect("write");

        let cancel = CancellationToken::new();
        cancel.cancel();

        let handler = FileHandler::new();
        let err = handler
            .fetch(&cancel, &config_for(path))
            .await
            .err()
            .expect("must fail");
        assert!(err.message.contains("cancelled"));
    }
}
