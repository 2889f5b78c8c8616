//! Server configuration (`regmux.yaml`) loading and validation.
//!
//! The config file names the server, enumerates sub-registries, selects the
//! storage backend, and carries opaque sections (`auth`, `telemetry`) that
//! are passed through to collaborators untouched.

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use regmux_types::RegistryConfig;

/// Which state/snapshot backend the process uses. Chosen at startup and
/// stable for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    File,
    Database,
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageType::File => write!(f, "file"),
            StorageType::Database => write!(f, "database"),
        }
    }
}

/// Relational backend connection settings.
///
/// The password may be given inline, read from a file, or read from an
/// environment variable; exactly one of the three.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    pub database: String,
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
    #[serde(default = "default_max_open_conns")]
    pub max_open_conns: u32,
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: u32,
    /// Humantime string, e.g. `"30m"`.
    #[serde(default = "default_conn_max_lifetime")]
    pub conn_max_lifetime: String,
}

fn default_db_port() -> u16 {
    5432
}

fn default_ssl_mode() -> String {
    "prefer".to_string()
}

fn default_max_open_conns() -> u32 {
    10
}

fn default_max_idle_conns() -> u32 {
    2
}

fn default_conn_max_lifetime() -> String {
    "30m".to_string()
}

impl DatabaseConfig {
    /// Resolve the password from whichever indirection is configured.
    pub fn resolve_password(&self) -> Result<String> {
        match (&self.password, &self.password_file, &self.password_env) {
            (Some(p), None, None) => Ok(p.clone()),
            (None, Some(path), None) => {
                let raw = fs::read_to_string(path).with_context(|| {
                    format!("failed to read password file {}", path.display())
                })?;
                Ok(raw.trim_end_matches(['\r', '\n']).to_string())
            }
            (None, None, Some(var)) => env::var(var)
                .with_context(|| format!("password environment variable {var:?} is not set")),
            (None, None, None) => bail!(
                "database password is required: set password, passwordFile, or passwordEnv"
            ),
            _ => bail!("password, passwordFile, and passwordEnv are mutually exclusive"),
        }
    }

    /// Max pool connection lifetime as a parsed duration.
    pub fn conn_max_lifetime(&self) -> Result<std::time::Duration> {
        humantime::parse_duration(&self.conn_max_lifetime).with_context(|| {
            format!("invalid connMaxLifetime {:?}", self.conn_max_lifetime)
        })
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Identifier this server reports for itself.
    pub registry_name: String,
    #[serde(default)]
    pub registries: Vec<RegistryConfig>,
    #[serde(default)]
    pub storage_type: StorageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseConfig>,
    /// Base directory for the file backend; also holds source caches.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub enable_aggregated_endpoints: bool,
    /// Opaque; handed to the auth middleware unmodified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<serde_yaml::Value>,
    /// Opaque; handed to the telemetry wiring unmodified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<serde_yaml::Value>,
    /// Opaque; handed to the cluster reconciler unmodified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch_namespace: Option<String>,
    /// Opaque; handed to the cluster reconciler unmodified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_election_id: Option<String>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl ServerConfig {
    /// Parse and validate a YAML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let cfg: ServerConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Structural validation of the whole document.
    pub fn validate(&self) -> Result<()> {
        if self.registry_name.is_empty() {
            bail!("registryName must not be empty");
        }

        let mut seen = BTreeSet::new();
        for registry in &self.registries {
            registry.validate()?;
            if let Some(filter) = &registry.filter {
                regmux_filter::validate_filter(filter)
                    .with_context(|| format!("registry {:?}", registry.name))?;
            }
            if !seen.insert(registry.name.as_str()) {
                bail!("duplicate registry name {:?}", registry.name);
            }
        }

        match self.storage_type {
            StorageType::Database => {
                let db = self
                    .database
                    .as_ref()
                    .context("storageType is database but no database section is present")?;
                if db.host.is_empty() || db.user.is_empty() || db.database.is_empty() {
                    bail!("database host, user, and database are required");
                }
                db.conn_max_lifetime()?;
            }
            StorageType::File => {}
        }

        Ok(())
    }
}
