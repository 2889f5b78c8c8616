//! Per-source-type upstream handlers.
//!
//! A [`SourceHandler`] is a closed sum over the configured source types,
//! each implementing the capability set {validate, fetch, current_hash}.
//! `fetch` retrieves and normalizes the full catalog; `current_hash` is a
//! cheap best-effort probe used by the should-sync decision, free to return
//! the "changed" sentinel when the upstream cannot be probed cheaply.

use std::path::Path;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use regmux_types::{Catalog, RegistryConfig, SourceType, SyncError};

mod api;
mod file;
mod git;

/// Catalog format parsers.
pub mod parse;

pub use api::ApiHandler;
pub use file::FileHandler;
pub use git::GitHandler;
pub use parse::{FORMAT_REGMUX, FORMAT_UPSTREAM};

/// Everything a successful fetch reports back to the sync pipeline.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub catalog: Catalog,
    pub format: String,
    /// Stable content hash of the upstream data; depends only on the
    /// normalized bytes, never on transport metadata.
    pub hash: String,
    pub server_count: u64,
}

/// A per-source-type adapter, dispatched on [`SourceType`].
pub enum SourceHandler {
    File(FileHandler),
    Git(GitHandler),
    Api(ApiHandler),
    /// In-process registry owned by this server; never fetched.
    Managed,
    /// Populated by an external reconciler; never fetched.
    Kubernetes,
}

impl SourceHandler {
    /// Handler-specific config validation.
    pub fn validate(&self, config: &RegistryConfig) -> Result<(), SyncError> {
        if !parse::format_is_known(&config.format) {
            return Err(SyncError::validation(format!(
                "registry {:?}: unknown catalog format {:?}",
                config.name, config.format
            )));
        }
        match self {
            SourceHandler::File(h) => h.validate(config),
            SourceHandler::Git(h) => h.validate(config),
            SourceHandler::Api(h) => h.validate(config),
            SourceHandler::Managed | SourceHandler::Kubernetes => Ok(()),
        }
    }

    /// Retrieve and normalize the upstream catalog.
    pub async fn fetch(
        &self,
        cancel: &CancellationToken,
        config: &RegistryConfig,
    ) -> Result<FetchOutcome, SyncError> {
        match self {
            SourceHandler::File(h) => h.fetch(cancel, config).await,
            SourceHandler::Git(h) => h.fetch(cancel, config).await,
            SourceHandler::Api(h) => h.fetch(cancel, config).await,
            SourceHandler::Managed => Err(SyncError::fetch(format!(
                "registry {:?} is managed and has no upstream to fetch",
                config.name
            ))),
            SourceHandler::Kubernetes => Err(SyncError::fetch(format!(
                "registry {:?} is reconciler-owned and has no upstream to fetch",
                config.name
            ))),
        }
    }

    /// Cheap probe of the upstream state.
    ///
    /// May return [`crate::hash::CHANGED_SENTINEL`] when a cheap probe is
    /// impossible, which forces a full fetch on the next sync.
    pub async fn current_hash(
        &self,
        cancel: &CancellationToken,
        config: &RegistryConfig,
    ) -> Result<String> {
        match self {
            SourceHandler::File(h) => h.current_hash(cancel, config).await,
            SourceHandler::Git(h) => h.current_hash(cancel, config).await,
            SourceHandler::Api(h) => h.current_hash(cancel, config).await,
            SourceHandler::Managed | SourceHandler::Kubernetes => {
                anyhow::bail!("non-synced registry {:?} has no upstream hash", config.name)
            }
        }
    }
}

/// Builds handlers for registry configs. Pluggable so tests and embedders
/// can substitute sources.
pub trait HandlerFactory: Send + Sync {
    fn handler_for(&self, config: &RegistryConfig) -> Result<SourceHandler, SyncError>;
}

/// Default factory backed by the real source implementations.
pub struct DefaultHandlerFactory {
    git_cache_dir: std::path::PathBuf,
}

impl DefaultHandlerFactory {
    /// `data_dir` hosts the git clone cache under `.cache/git/`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            git_cache_dir: data_dir.join(".cache").join("git"),
        }
    }
}

impl HandlerFactory for DefaultHandlerFactory {
    fn handler_for(&self, config: &RegistryConfig) -> Result<SourceHandler, SyncError> {
        match config.source_type {
            SourceType::File => {
                config.file.as_ref().ok_or_else(|| {
                    SyncError::handler_creation(format!(
                        "registry {:?}: file source block is missing",
                        config.name
                    ))
                })?;
                Ok(SourceHandler::File(FileHandler::new()))
            }
            SourceType::Git => {
                config.git.as_ref().ok_or_else(|| {
                    SyncError::handler_creation(format!(
                        "registry {:?}: git source block is missing",
                        config.name
                    ))
                })?;
                Ok(SourceHandler::Git(GitHandler::new(
                    self.git_cache_dir.join(&config.name),
                )))
            }
            SourceType::Api => {
                config.api.as_ref().ok_or_else(|| {
                    SyncError::handler_creation(format!(
                        "registry {:?}: api source block is missing",
                        config.name
                    ))
                })?;
                ApiHandler::new().map(SourceHandler::Api).map_err(|e| {
                    SyncError::handler_creation(format!(
                        "registry {:?}: failed to build HTTP client",
                        config.name
                    ))
                    .with_cause(e)
                })
            }
            SourceType::Managed => Ok(SourceHandler::Managed),
            SourceType::Kubernetes => Ok(SourceHandler::Kubernetes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regmux_types::{FileSource, SyncErrorKind};
    use std::path::PathBuf;

    fn factory() -> DefaultHandlerFactory {
        DefaultHandlerFactory::new(Path::new("/tmp/regmux-test"))
    }

    #[test]
    fn factory_rejects_missing_source_block() {
        let cfg = RegistryConfig::new("r1", SourceType::File);
        let err = factory().handler_for(&cfg).err().expect("must fail");
        assert_eq!(err.kind, SyncErrorKind::HandlerCreation);
    }

    #[test]
    fn factory_builds_file_handler() {
        let mut cfg = RegistryConfig::new("r1", SourceType::File);
        cfg.file = Some(FileSource {
            path: PathBuf::from("reg.json"),
        });
        assert!(matches!(
            factory().handler_for(&cfg).expect("handler"),
            SourceHandler::File(_)
        ));
    }

    #[test]
    fn factory_builds_non_synced_handlers() {
        let managed = RegistryConfig::new("m", SourceType::Managed);
        assert!(matches!(
            factory().handler_for(&managed).expect("handler"),
            SourceHandler::Managed
        ));
        let kube = RegistryConfig::new("k", SourceType::Kubernetes);
        assert!(matches!(
            factory().handler_for(&kube).expect("handler"),
            SourceHandler::Kubernetes
        ));
    }

    #[tokio::test]
    async fn managed_handler_refuses_fetch() {
        let cfg = RegistryConfig::new("m", SourceType::Managed);
        let err = SourceHandler::Managed
            .fetch(&CancellationToken::new(), &cfg)
            .await
            .err()
            .expect("must fail");
        assert_eq!(err.kind, SyncErrorKind::Fetch);
        assert!(err.message.contains("managed"));
    }

    #[test]
    fn unknown_format_fails_validation() {
        let mut cfg = RegistryConfig::new("r1", SourceType::File);
        cfg.file = Some(FileSource {
            path: PathBuf::from("reg.json"),
        });
        cfg.format = "xml".to_string();
        let handler = factory().handler_for(&cfg).expect("handler");
        let err = handler.validate(&cfg).err().expect("must fail");
        assert_eq!(err.kind, SyncErrorKind::Validation);
        assert!(err.message.contains("unknown catalog format"));
    }
}
