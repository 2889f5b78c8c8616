use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default upstream catalog format when a registry does not name one.
pub const DEFAULT_FORMAT: &str = "regmux";

/// Where a sub-registry's catalog comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Git,
    Api,
    File,
    Managed,
    Kubernetes,
}

impl SourceType {
    /// The persisted registry type derived from the source.
    pub fn registry_type(self) -> RegistryType {
        match self {
            SourceType::Git | SourceType::Api => RegistryType::Remote,
            SourceType::File => RegistryType::File,
            SourceType::Managed => RegistryType::Managed,
            SourceType::Kubernetes => RegistryType::Kubernetes,
        }
    }

    /// Whether the coordinator runs a sync loop for this source.
    ///
    /// Managed registries own their data and kubernetes registries are
    /// written by an external reconciler, so neither is synced.
    pub fn syncable(self) -> bool {
        matches!(self, SourceType::Git | SourceType::Api | SourceType::File)
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceType::Git => write!(f, "git"),
            SourceType::Api => write!(f, "api"),
            SourceType::File => write!(f, "file"),
            SourceType::Managed => write!(f, "managed"),
            SourceType::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

/// Persisted registry classification. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RegistryType {
    Remote,
    File,
    Managed,
    Kubernetes,
}

impl std::fmt::Display for RegistryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryType::Remote => write!(f, "REMOTE"),
            RegistryType::File => write!(f, "FILE"),
            RegistryType::Managed => write!(f, "MANAGED"),
            RegistryType::Kubernetes => write!(f, "KUBERNETES"),
        }
    }
}

/// Who owns a persisted registry row.
///
/// CONFIG rows are owned by the configuration file and bulk-replaced at
/// startup; API rows are owned by runtime and must never be overwritten by
/// config loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CreationType {
    Config,
    Api,
}

impl std::fmt::Display for CreationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CreationType::Config => write!(f, "CONFIG"),
            CreationType::Api => write!(f, "API"),
        }
    }
}

/// Git upstream: a repo ref plus a path to the catalog file within it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSource {
    pub url: String,
    /// Branch, tag, or commit; defaults to the remote HEAD.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Path of the catalog file inside the repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl GitSource {
    /// Catalog path inside the repo, defaulting to `registry.json`.
    pub fn catalog_path(&self) -> &str {
        self.path.as_deref().unwrap_or("registry.json")
    }
}

/// HTTP API upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSource {
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// Local file upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSource {
    pub path: PathBuf,
}

/// In-process registry owned by this server. No source fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ManagedSource {}

/// Registry populated by an external cluster reconciler. No source fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KubernetesSource {}

/// Name include/exclude glob lists.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NameFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

/// Tag include/exclude lists. Plain membership, no globs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TagFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

/// Include/exclude rules applied to a fetched catalog before storing it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub names: Option<NameFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<TagFilter>,
}

impl FilterConfig {
    pub fn is_empty(&self) -> bool {
        self.names.is_none() && self.tags.is_none()
    }
}

/// Sync scheduling policy for one registry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    /// Humantime interval string, e.g. `"5m"` or `"1h 30m"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

/// Identity and source of one configured sub-registry.
///
/// Exactly one source block must be present, and it must match
/// `source_type`. [`RegistryConfig::validate`] enforces this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Unique, stable identifier; doubles as the URL path segment.
    pub name: String,
    pub source_type: SourceType,
    /// Wire format of the upstream catalog; validated by the handler.
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed: Option<ManagedSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<SyncPolicy>,
}

fn default_format() -> String {
    DEFAULT_FORMAT.to_string()
}

impl RegistryConfig {
    /// Minimal config for a source type, used by tests and API creation.
    pub fn new(name: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            name: name.into(),
            source_type,
            format: default_format(),
            git: None,
            api: None,
            file: None,
            managed: None,
            kubernetes: None,
            filter: None,
            sync_policy: None,
        }
    }

    pub fn registry_type(&self) -> RegistryType {
        self.source_type.registry_type()
    }

    pub fn syncable(&self) -> bool {
        self.source_type.syncable()
    }

    /// The configured sync interval, if present and parseable.
    pub fn sync_interval(&self) -> Option<Result<Duration>> {
        let raw = self.sync_policy.as_ref()?.interval.as_deref()?;
        Some(
            humantime::parse_duration(raw)
                .map_err(|e| anyhow::anyhow!("invalid sync interval {raw:?}: {e}")),
        )
    }

    /// Structural validation: name shape and the one-source-block invariant.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("registry name must not be empty");
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            bail!(
                "registry name {:?} must contain only alphanumerics, '-', '_' or '.'",
                self.name
            );
        }

        let blocks = [
            ("git", self.git.is_some()),
            ("api", self.api.is_some()),
            ("file", self.file.is_some()),
            ("managed", self.managed.is_some()),
            ("kubernetes", self.kubernetes.is_some()),
        ];
        let present: Vec<&str> = blocks
            .iter()
            .filter(|(_, set)| *set)
            .map(|(name, _)| *name)
            .collect();

        let expected = self.source_type.to_string();
        match present.as_slice() {
            [] if matches!(self.source_type, SourceType::Managed | SourceType::Kubernetes) => {
                // Managed/kubernetes blocks are empty structs; allow omission.
            }
            [] => bail!(
                "registry {:?}: source block {expected:?} is required",
                self.name
            ),
            [single] if *single == expected => {}
            [single] => bail!(
                "registry {:?}: source block {single:?} does not match sourceType {expected:?}",
                self.name
            ),
            many => bail!(
                "registry {:?}: exactly one source block expected, found {}",
                self.name,
                many.join(", ")
            ),
        }

        if let Some(Err(e)) = self.sync_interval() {
            // Unparseable intervals fall back to the default at schedule
            // time; validation only reports them.
            return Err(e.context(format!("registry {:?}", self.name)));
        }

        Ok(())
    }
}

/// A persisted registry row, backend-agnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub id: Uuid,
    pub name: String,
    pub reg_type: RegistryType,
    pub creation_type: CreationType,
    /// The full config, serialized into the backend and reconstructable
    /// from it. For CONFIG rows the in-memory config cache takes priority.
    pub config: RegistryConfig,
    pub sync_schedule: Option<String>,
    pub syncable: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RegistryRecord {
    /// Build a fresh record from a config.
    pub fn from_config(config: &RegistryConfig, creation_type: CreationType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: config.name.clone(),
            reg_type: config.registry_type(),
            creation_type,
            config: config.clone(),
            sync_schedule: config
                .sync_policy
                .as_ref()
                .and_then(|p| p.interval.clone()),
            syncable: config.syncable(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_config(name: &str) -> RegistryConfig {
        let mut cfg = RegistryConfig::new(name, SourceType::File);
        cfg.file = Some(FileSource {
            path: PathBuf::from("registry.json"),
        });
        cfg
    }

    #[test]
    fn source_type_maps_to_registry_type() {
        assert_eq!(SourceType::Git.registry_type(), RegistryType::Remote);
        assert_eq!(SourceType::Api.registry_type(), RegistryType::Remote);
        assert_eq!(SourceType::File.registry_type(), RegistryType::File);
        assert_eq!(SourceType::Managed.registry_type(), RegistryType::Managed);
        assert_eq!(
            SourceType::Kubernetes.registry_type(),
            RegistryType::Kubernetes
        );
    }

    #[test]
    fn managed_and_kubernetes_are_not_syncable() {
        assert!(SourceType::Git.syncable());
        assert!(SourceType::Api.syncable());
        assert!(SourceType::File.syncable());
        assert!(!SourceType::Managed.syncable());
        assert!(!SourceType::Kubernetes.syncable());
    }

    #[test]
    fn validate_accepts_matching_source_block() {
        file_config("r1").validate().expect("valid");
    }

    #[test]
    fn validate_rejects_empty_name() {
        let cfg = file_config("");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_name_with_slash() {
        let cfg = file_config("a/b");
        let err = cfg.validate().expect_err("must fail");
        assert!(err.to_string().contains("alphanumerics"));
    }

    #[test]
    fn validate_rejects_missing_source_block() {
        let cfg = RegistryConfig::new("r1", SourceType::File);
        let err = cfg.validate().expect_err("must fail");
        assert!(err.to_string().contains("required"));
    }

    #[test]
    fn validate_rejects_mismatched_source_block() {
        let mut cfg = RegistryConfig::new("r1", SourceType::Git);
        cfg.file = Some(FileSource {
            path: PathBuf::from("x.json"),
        });
        let err = cfg.validate().expect_err("must fail");
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn validate_rejects_multiple_source_blocks() {
        let mut cfg = file_config("r1");
        cfg.git = Some(GitSource {
            url: "https://example.com/repo.git".to_string(),
            reference: None,
            path: None,
        });
        let err = cfg.validate().expect_err("must fail");
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn validate_allows_managed_without_block() {
        let cfg = RegistryConfig::new("local", SourceType::Managed);
        cfg.validate().expect("valid");
    }

    #[test]
    fn sync_interval_parses_humantime() {
        let mut cfg = file_config("r1");
        cfg.sync_policy = Some(SyncPolicy {
            interval: Some("5m".to_string()),
        });
        let dur = cfg.sync_interval().expect("present").expect("parses");
        assert_eq!(dur, Duration::from_secs(300));
    }

    #[test]
    fn sync_interval_reports_parse_failure() {
        let mut cfg = file_config("r1");
        cfg.sync_policy = Some(SyncPolicy {
            interval: Some("soon".to_string()),
        });
        assert!(cfg.sync_interval().expect("present").is_err());
    }

    #[test]
    fn sync_interval_absent_when_no_policy() {
        assert!(file_config("r1").sync_interval().is_none());
    }

    #[test]
    fn git_source_defaults_catalog_path() {
        let src = GitSource {
            url: "https://example.com/repo.git".to_string(),
            reference: None,
            path: None,
        };
        assert_eq!(src.catalog_path(), "registry.json");
    }

    #[test]
    fn config_roundtrips_through_json_with_ref_rename() {
        let mut cfg = RegistryConfig::new("r1", SourceType::Git);
        cfg.git = Some(GitSource {
            url: "https://example.com/repo.git".to_string(),
            reference: Some("main".to_string()),
            path: Some("data/reg.json".to_string()),
        });
        let json = serde_json::to_string(&cfg).expect("serialize");
        assert!(json.contains("\"ref\":\"main\""));
        let back: RegistryConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, cfg);
    }

    #[test]
    fn record_from_config_derives_type_and_schedule() {
        let mut cfg = file_config("r1");
        cfg.sync_policy = Some(SyncPolicy {
            interval: Some("10m".to_string()),
        });
        let rec = RegistryRecord::from_config(&cfg, CreationType::Config);
        assert_eq!(rec.reg_type, RegistryType::File);
        assert_eq!(rec.creation_type, CreationType::Config);
        assert_eq!(rec.sync_schedule.as_deref(), Some("10m"));
        assert!(rec.syncable);
    }
}
