use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which stage of the sync pipeline failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// The handler factory rejected the config.
    HandlerCreation,
    /// Handler-specific config check failed.
    Validation,
    /// Upstream retrieval, parsing, or filtering failed.
    Fetch,
    /// Persisting the snapshot failed.
    Storage,
}

impl SyncErrorKind {
    /// Observability condition recorded on the final status for this kind.
    pub fn condition(self) -> &'static str {
        match self {
            SyncErrorKind::HandlerCreation => "HandlerCreationFailed",
            SyncErrorKind::Validation => "ValidationFailed",
            SyncErrorKind::Fetch => "FetchFailed",
            SyncErrorKind::Storage => "StorageFailed",
        }
    }
}

// Display matches the serde rename so logs and the wire agree on spelling.
impl std::fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncErrorKind::HandlerCreation => "handler_creation",
            SyncErrorKind::Validation => "validation",
            SyncErrorKind::Fetch => "fetch",
            SyncErrorKind::Storage => "storage",
        };
        write!(f, "{s}")
    }
}

/// Structured sync pipeline error: a kind tag, a human message, and an
/// optional underlying cause.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SyncError {
    pub kind: SyncErrorKind,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl SyncError {
    pub fn new(kind: SyncErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(
        mut self,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn handler_creation(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::HandlerCreation, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Validation, message)
    }

    pub fn fetch(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Fetch, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Storage, message)
    }
}

/// Errors surfaced by the state service, independent of backend.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("registry {0:?} not found")]
    NotFound(String),
    /// Ownership or immutability violation: API-row overwrite, reg_type
    /// change, duplicate name.
    #[error("{0}")]
    Conflict(String),
    #[error("state backend error: {0:#}")]
    Backend(anyhow::Error),
}

impl StateError {
    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        StateError::Backend(err.into())
    }
}

/// Read/publish path errors, mapped to HTTP codes by the API layer.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("registry {0:?} is not a managed registry")]
    NotManagedRegistry(String),
    #[error("version {version} of server {server:?} already exists")]
    VersionAlreadyExists { server: String, version: String },
    #[error("invalid request: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StateError> for ServiceError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(name) => ServiceError::NotFound(format!("registry {name:?}")),
            StateError::Conflict(msg) => ServiceError::InvalidInput(msg),
            StateError::Backend(e) => ServiceError::Internal(e),
        }
    }
}
