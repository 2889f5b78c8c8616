//! Read and publish path over stored snapshots.
//!
//! Queries read the latest committed snapshot written by the sync writer
//! and per-registry status from the state service. Mutations (publish,
//! delete) are accepted only for managed registries; everything else is
//! read-only aggregation of what upstreams provided.
//!
//! Pagination is cursor-based: an opaque token, a bounded limit, and a
//! stable order by server name.

use std::sync::Arc;

use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use regmux_types::{
    Catalog, RegistryConfig, RegistryRecord, RegistryType, ServerEntry, ServerVersion,
    ServiceError, SyncStatus,
};

use crate::hash;
use crate::state::StateService;
use crate::store::CatalogStore;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

/// Query options for server listings.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
    /// Substring match on server name.
    pub search: Option<String>,
    /// Keep only servers whose newest version is at or after this time.
    pub updated_since: Option<DateTime<Utc>>,
    /// Keep only servers that have this exact version.
    pub version: Option<String>,
}

/// One page of results plus the cursor for the next page.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Listing row for one server within a registry.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
    pub version_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ServerSummary {
    fn from_entry(entry: &ServerEntry) -> Self {
        Self {
            name: entry.name.clone(),
            description: entry.description.clone(),
            tags: entry.tags.clone(),
            latest_version: entry.latest().map(|v| v.version.clone()),
            version_count: entry.versions.len(),
            updated_at: entry.updated_at(),
        }
    }
}

/// Listing row for the aggregated endpoints: a summary plus the registry
/// it came from.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedServer {
    pub registry: String,
    #[serde(flatten)]
    pub server: ServerSummary,
}

/// One version of a server as found in one registry.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedVersion {
    pub registry: String,
    #[serde(flatten)]
    pub version: ServerVersion,
}

/// Registry listing row: identity plus current sync state.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryInfo {
    pub name: String,
    pub reg_type: RegistryType,
    pub syncable: bool,
    pub status: SyncStatus,
}

/// Publish request body for managed registries.
#[derive(Debug, Clone, Deserialize)]
pub struct PublishRequest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub packages: Vec<serde_json::Value>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

/// The read/publish API over aggregated sub-registries.
pub struct RegistryService {
    state: Arc<dyn StateService>,
    catalogs: Arc<dyn CatalogStore>,
}

impl RegistryService {
    pub fn new(state: Arc<dyn StateService>, catalogs: Arc<dyn CatalogStore>) -> Self {
        Self { state, catalogs }
    }

    /// All registries with their sync state.
    pub async fn list_registries(&self) -> Result<Vec<RegistryInfo>, ServiceError> {
        let records = self.state.list_registries().await?;
        let mut infos = Vec::with_capacity(records.len());
        for record in records {
            let status = self.state.sync_status(&record.name).await?;
            infos.push(RegistryInfo {
                name: record.name,
                reg_type: record.reg_type,
                syncable: record.syncable,
                status,
            });
        }
        Ok(infos)
    }

    pub async fn registry_status(&self, registry: &str) -> Result<SyncStatus, ServiceError> {
        Ok(self.state.sync_status(registry).await?)
    }

    /// Create a registry at runtime. The row is API-owned: config loading
    /// will never overwrite it, and only the API may delete it.
    pub async fn create_registry(
        &self,
        config: RegistryConfig,
    ) -> Result<RegistryInfo, ServiceError> {
        config
            .validate()
            .map_err(|e| ServiceError::InvalidInput(format!("{e:#}")))?;
        if let Some(filter) = &config.filter {
            regmux_filter::validate_filter(filter)
                .map_err(|e| ServiceError::InvalidInput(format!("{e:#}")))?;
        }

        let record = self.state.create_registry(&config).await?;
        let status = self.state.sync_status(&record.name).await?;
        Ok(RegistryInfo {
            name: record.name,
            reg_type: record.reg_type,
            syncable: record.syncable,
            status,
        })
    }

    /// Delete an API-owned registry; its status and snapshot go with it.
    pub async fn delete_registry(&self, registry: &str) -> Result<(), ServiceError> {
        self.state.delete_registry(registry).await?;
        Ok(())
    }

    /// List servers in one registry, paginated and filtered.
    pub async fn list_servers(
        &self,
        registry: &str,
        options: &ListOptions,
    ) -> Result<Page<ServerSummary>, ServiceError> {
        let catalog = self.snapshot(registry).await?;

        let mut entries: Vec<&ServerEntry> = catalog.servers.iter().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let filtered: Vec<ServerSummary> = entries
            .into_iter()
            .filter(|entry| matches_options(entry, options))
            .map(ServerSummary::from_entry)
            .collect();

        paginate(filtered, options, |summary| summary.name.clone())
    }

    /// List servers across every registry, labeled by origin.
    pub async fn list_all_servers(
        &self,
        options: &ListOptions,
    ) -> Result<Page<AggregatedServer>, ServiceError> {
        let mut rows = Vec::new();
        for record in self.state.list_registries().await? {
            let Some(catalog) = self.catalogs.load(&record.name).await.map_err(|e| {
                ServiceError::Internal(e.context("failed to load snapshot"))
            })?
            else {
                continue;
            };
            for entry in &catalog.servers {
                if matches_options(entry, options) {
                    rows.push(AggregatedServer {
                        registry: record.name.clone(),
                        server: ServerSummary::from_entry(entry),
                    });
                }
            }
        }
        rows.sort_by(|a, b| {
            a.server
                .name
                .cmp(&b.server.name)
                .then_with(|| a.registry.cmp(&b.registry))
        });

        paginate(rows, options, |row| {
            format!("{}\u{0}{}", row.server.name, row.registry)
        })
    }

    /// Versions of one server across every registry, labeled by origin.
    /// Registries that do not carry the server are skipped; an empty
    /// result means no registry knows it.
    pub async fn aggregated_server_versions(
        &self,
        server: &str,
    ) -> Result<Vec<AggregatedVersion>, ServiceError> {
        let mut rows = Vec::new();
        for record in self.state.list_registries().await? {
            let Some(catalog) = self.catalogs.load(&record.name).await.map_err(|e| {
                ServiceError::Internal(e.context("failed to load snapshot"))
            })?
            else {
                continue;
            };
            if let Some(entry) = catalog.server(server) {
                rows.extend(entry.versions.iter().map(|version| AggregatedVersion {
                    registry: record.name.clone(),
                    version: version.clone(),
                }));
            }
        }
        if rows.is_empty() {
            return Err(ServiceError::NotFound(format!("server {server:?}")));
        }
        Ok(rows)
    }

    /// All versions of one server, oldest first.
    pub async fn list_server_versions(
        &self,
        registry: &str,
        server: &str,
    ) -> Result<Vec<ServerVersion>, ServiceError> {
        let catalog = self.snapshot(registry).await?;
        let entry = catalog
            .server(server)
            .ok_or_else(|| ServiceError::NotFound(format!("server {server:?}")))?;
        Ok(entry.versions.clone())
    }

    /// One version of one server; `"latest"` resolves to the newest.
    pub async fn get_server_version(
        &self,
        registry: &str,
        server: &str,
        version: &str,
    ) -> Result<ServerVersion, ServiceError> {
        let catalog = self.snapshot(registry).await?;
        let entry = catalog
            .server(server)
            .ok_or_else(|| ServiceError::NotFound(format!("server {server:?}")))?;

        let found = if version == "latest" {
            entry.latest()
        } else {
            entry.version(version)
        };
        found.cloned().ok_or_else(|| {
            ServiceError::NotFound(format!("version {version} of server {server:?}"))
        })
    }

    /// Publish a version into a managed registry.
    pub async fn publish_server_version(
        &self,
        registry: &str,
        request: PublishRequest,
    ) -> Result<ServerVersion, ServiceError> {
        if request.name.is_empty() {
            return Err(ServiceError::InvalidInput("server name is required".into()));
        }
        if request.version.is_empty() {
            return Err(ServiceError::InvalidInput("version is required".into()));
        }
        let record = self.managed_registry(registry).await?;

        let mut catalog = self
            .catalogs
            .load(registry)
            .await
            .map_err(|e| ServiceError::Internal(e.context("failed to load snapshot")))?
            .unwrap_or_default();

        if let Some(existing) = catalog.server(&request.name)
            && existing.version(&request.version).is_some()
        {
            return Err(ServiceError::VersionAlreadyExists {
                server: request.name,
                version: request.version,
            });
        }

        let version = ServerVersion {
            version: request.version,
            description: request.description.clone(),
            packages: request.packages,
            repository: request.repository,
            updated_at: Some(Utc::now()),
            meta: request.meta,
        };

        match catalog.server_mut(&request.name) {
            Some(entry) => {
                entry.versions.push(version.clone());
                if request.description.is_some() {
                    entry.description = request.description;
                }
                if !request.tags.is_empty() {
                    entry.tags = request.tags;
                }
            }
            None => {
                let mut entry = ServerEntry::new(request.name.clone());
                entry.description = request.description;
                entry.tags = request.tags;
                entry.versions.push(version.clone());
                // Managed catalogs stay name-sorted so listings are
                // deterministic across publishes.
                let at = catalog
                    .servers
                    .partition_point(|s| s.name < entry.name);
                catalog.servers.insert(at, entry);
            }
        }

        catalog.hash = hash::catalog_hash(&catalog.servers)
            .context("failed to hash managed catalog")
            .map_err(ServiceError::Internal)?;

        self.catalogs
            .store(registry, &catalog)
            .await
            .map_err(|e| ServiceError::Internal(e.context("failed to store snapshot")))?;
        self.bump_server_count(&record.name, catalog.server_count())
            .await?;

        Ok(version)
    }

    /// Delete a version from a managed registry; removes the server when
    /// its last version goes.
    pub async fn delete_server_version(
        &self,
        registry: &str,
        server: &str,
        version: &str,
    ) -> Result<(), ServiceError> {
        let record = self.managed_registry(registry).await?;

        let mut catalog = self
            .catalogs
            .load(registry)
            .await
            .map_err(|e| ServiceError::Internal(e.context("failed to load snapshot")))?
            .unwrap_or_default();

        let entry = catalog
            .server_mut(server)
            .ok_or_else(|| ServiceError::NotFound(format!("server {server:?}")))?;
        let before = entry.versions.len();
        entry.versions.retain(|v| v.version != version);
        if entry.versions.len() == before {
            return Err(ServiceError::NotFound(format!(
                "version {version} of server {server:?}"
            )));
        }
        if entry.versions.is_empty() {
            catalog.servers.retain(|s| s.name != server);
        }

        catalog.hash = hash::catalog_hash(&catalog.servers)
            .context("failed to hash managed catalog")
            .map_err(ServiceError::Internal)?;

        self.catalogs
            .store(registry, &catalog)
            .await
            .map_err(|e| ServiceError::Internal(e.context("failed to store snapshot")))?;
        self.bump_server_count(&record.name, catalog.server_count())
            .await?;
        Ok(())
    }

    async fn snapshot(&self, registry: &str) -> Result<Catalog, ServiceError> {
        // Resolve the registry first so unknown names 404 rather than
        // reading as empty.
        self.state.registry(registry).await?;
        Ok(self
            .catalogs
            .load(registry)
            .await
            .map_err(|e| ServiceError::Internal(e.context("failed to load snapshot")))?
            .unwrap_or_default())
    }

    async fn managed_registry(&self, registry: &str) -> Result<RegistryRecord, ServiceError> {
        let record = self.state.registry(registry).await?;
        if record.reg_type != RegistryType::Managed {
            return Err(ServiceError::NotManagedRegistry(registry.to_string()));
        }
        Ok(record)
    }

    async fn bump_server_count(&self, registry: &str, count: u64) -> Result<(), ServiceError> {
        self.state
            .update_status_atomically(registry, &mut |status| {
                if status.server_count == count {
                    return false;
                }
                status.server_count = count;
                true
            })
            .await?;
        Ok(())
    }
}

fn matches_options(entry: &ServerEntry, options: &ListOptions) -> bool {
    if let Some(search) = &options.search
        && !entry.name.contains(search.as_str())
    {
        return false;
    }
    if let Some(since) = options.updated_since {
        match entry.updated_at() {
            Some(updated) if updated >= since => {}
            _ => return false,
        }
    }
    if let Some(version) = &options.version
        && entry.version(version).is_none()
    {
        return false;
    }
    true
}

/// Cut one page out of a sorted result set. `key` must be strictly
/// increasing over the input; the cursor is its opaque encoding.
fn paginate<T>(
    rows: Vec<T>,
    options: &ListOptions,
    key: impl Fn(&T) -> String,
) -> Result<Page<T>, ServiceError> {
    let limit = options.limit.unwrap_or(DEFAULT_LIMIT);
    if limit == 0 {
        return Err(ServiceError::InvalidInput(
            "limit must be a positive integer".into(),
        ));
    }
    let limit = limit.min(MAX_LIMIT);

    let start = match &options.cursor {
        Some(cursor) => {
            let after = decode_cursor(cursor)?;
            rows.partition_point(|row| key(row) <= after)
        }
        None => 0,
    };

    let mut items: Vec<T> = rows.into_iter().skip(start).take(limit + 1).collect();
    let next_cursor = if items.len() > limit {
        items.truncate(limit);
        items.last().map(|row| encode_cursor(&key(row)))
    } else {
        None
    };

    Ok(Page { items, next_cursor })
}

fn encode_cursor(key: &str) -> String {
    URL_SAFE_NO_PAD.encode(key.as_bytes())
}

fn decode_cursor(cursor: &str) -> Result<String, ServiceError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor.as_bytes())
        .map_err(|_| ServiceError::InvalidInput("malformed cursor".into()))?;
    String::from_utf8(bytes).map_err(|_| ServiceError::InvalidInput("malformed cursor".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use regmux_types::{RegistryConfig, SourceType};
    use tempfile::TempDir;

    use crate::state::{FileStateService, StateService};
    use crate::store::FileCatalogStore;

    struct Fixture {
        _dir: TempDir,
        service: RegistryService,
        state: Arc<FileStateService>,
        catalogs: Arc<FileCatalogStore>,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let data_dir = dir.path().join("data");
        let state = Arc::new(FileStateService::new(data_dir.clone()));
        let catalogs = Arc::new(FileCatalogStore::new(data_dir));

        let mut file_cfg = RegistryConfig::new("community", SourceType::File);
        file_cfg.file = Some(regmux_types::FileSource {
            path: dir.path().join("upstream.json"),
        });
        let managed_cfg = RegistryConfig::new("internal", SourceType::Managed);
        state
            .initialize(&[file_cfg, managed_cfg])
            .await
            .expect("init");

        let service = RegistryService::new(state.clone(), catalogs.clone());
        Fixture {
            _dir: dir,
            service,
            state,
            catalogs,
        }
    }

    fn entry(name: &str, versions: &[&str]) -> ServerEntry {
        let mut e = ServerEntry::new(name);
        e.versions = versions.iter().map(|v| ServerVersion::new(*v)).collect();
        e
    }

    async fn seed_community(fx: &Fixture, names: &[&str]) {
        let servers = names.iter().map(|n| entry(n, &["1.0.0"])).collect();
        fx.catalogs
            .store("community", &Catalog::new(servers, "h1"))
            .await
            .expect("seed");
    }

    #[tokio::test]
    async fn list_servers_is_name_ordered() {
        let fx = fixture().await;
        seed_community(&fx, &["zeta", "alpha", "mid"]).await;

        let page = fx
            .service
            .list_servers("community", &ListOptions::default())
            .await
            .expect("list");
        let names: Vec<&str> = page.items.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn list_servers_unknown_registry_is_not_found() {
        let fx = fixture().await;
        let err = fx
            .service
            .list_servers("ghost", &ListOptions::default())
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_servers_before_first_sync_is_empty_not_missing() {
        let fx = fixture().await;
        let page = fx
            .service
            .list_servers("community", &ListOptions::default())
            .await
            .expect("list");
        assert!(page.items.is_empty());
    }

    #[tokio::test]
    async fn pagination_walks_the_catalog_in_stable_pages() {
        let fx = fixture().await;
        let names: Vec<String> = (0..7).map(|i| format!("server-{i}")).collect();
        let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        seed_community(&fx, &name_refs).await;

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = fx
                .service
                .list_servers(
                    "community",
                    &ListOptions {
                        cursor: cursor.clone(),
                        limit: Some(3),
                        ..ListOptions::default()
                    },
                )
                .await
                .expect("page");
            seen.extend(page.items.iter().map(|s| s.name.clone()));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, names);
    }

    #[tokio::test]
    async fn malformed_cursor_is_invalid_input() {
        let fx = fixture().await;
        seed_community(&fx, &["a"]).await;

        let err = fx
            .service
            .list_servers(
                "community",
                &ListOptions {
                    cursor: Some("!!not-base64!!".to_string()),
                    ..ListOptions::default()
                },
            )
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, ServiceError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn zero_limit_is_invalid_input() {
        let fx = fixture().await;
        seed_community(&fx, &["a"]).await;

        let err = fx
            .service
            .list_servers(
                "community",
                &ListOptions {
                    limit: Some(0),
                    ..ListOptions::default()
                },
            )
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, ServiceError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn search_matches_name_substring() {
        let fx = fixture().await;
        seed_community(&fx, &["postgres-mcp", "redis-mcp", "files"]).await;

        let page = fx
            .service
            .list_servers(
                "community",
                &ListOptions {
                    search: Some("mcp".to_string()),
                    ..ListOptions::default()
                },
            )
            .await
            .expect("list");
        let names: Vec<&str> = page.items.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["postgres-mcp", "redis-mcp"]);
    }

    #[tokio::test]
    async fn updated_since_excludes_stale_and_undated_servers() {
        let fx = fixture().await;
        let mut fresh = entry("fresh", &["1.0.0"]);
        fresh.versions[0].updated_at = Some(Utc::now());
        let mut stale = entry("stale", &["1.0.0"]);
        stale.versions[0].updated_at =
            Some(Utc::now() - chrono::Duration::days(30));
        let undated = entry("undated", &["1.0.0"]);
        fx.catalogs
            .store("community", &Catalog::new(vec![fresh, stale, undated], "h"))
            .await
            .expect("seed");

        let page = fx
            .service
            .list_servers(
                "community",
                &ListOptions {
                    updated_since: Some(Utc::now() - chrono::Duration::days(1)),
                    ..ListOptions::default()
                },
            )
            .await
            .expect("list");
        let names: Vec<&str> = page.items.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["fresh"]);
    }

    #[tokio::test]
    async fn version_filter_keeps_only_matching_servers() {
        let fx = fixture().await;
        fx.catalogs
            .store(
                "community",
                &Catalog::new(
                    vec![entry("a", &["1.0.0", "2.0.0"]), entry("b", &["1.5.0"])],
                    "h",
                ),
            )
            .await
            .expect("seed");

        let page = fx
            .service
            .list_servers(
                "community",
                &ListOptions {
                    version: Some("2.0.0".to_string()),
                    ..ListOptions::default()
                },
            )
            .await
            .expect("list");
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].name, "a");
    }

    #[tokio::test]
    async fn get_server_version_resolves_latest() {
        let fx = fixture().await;
        fx.catalogs
            .store(
                "community",
                &Catalog::new(vec![entry("a", &["1.0.0", "2.0.0"])], "h"),
            )
            .await
            .expect("seed");

        let latest = fx
            .service
            .get_server_version("community", "a", "latest")
            .await
            .expect("latest");
        assert_eq!(latest.version, "2.0.0");

        let pinned = fx
            .service
            .get_server_version("community", "a", "1.0.0")
            .await
            .expect("pinned");
        assert_eq!(pinned.version, "1.0.0");

        let err = fx
            .service
            .get_server_version("community", "a", "9.9.9")
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn publish_into_managed_registry_roundtrips() {
        let fx = fixture().await;
        let published = fx
            .service
            .publish_server_version(
                "internal",
                PublishRequest {
                    name: "tool".to_string(),
                    version: "1.0.0".to_string(),
                    description: Some("internal tool".to_string()),
                    tags: vec!["internal".to_string()],
                    packages: vec![],
                    repository: None,
                    meta: None,
                },
            )
            .await
            .expect("publish");
        assert_eq!(published.version, "1.0.0");

        let fetched = fx
            .service
            .get_server_version("internal", "tool", "latest")
            .await
            .expect("get");
        assert_eq!(fetched.version, "1.0.0");

        // Status reflects the new count.
        let status = fx.state.sync_status("internal").await.expect("status");
        assert_eq!(status.server_count, 1);
    }

    #[tokio::test]
    async fn publish_duplicate_version_conflicts() {
        let fx = fixture().await;
        let request = PublishRequest {
            name: "tool".to_string(),
            version: "1.0.0".to_string(),
            description: None,
            tags: vec![],
            packages: vec![],
            repository: None,
            meta: None,
        };
        fx.service
            .publish_server_version("internal", request.clone())
            .await
            .expect("publish");

        let err = fx
            .service
            .publish_server_version("internal", request)
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, ServiceError::VersionAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn publish_into_synced_registry_is_forbidden() {
        let fx = fixture().await;
        let err = fx
            .service
            .publish_server_version(
                "community",
                PublishRequest {
                    name: "tool".to_string(),
                    version: "1.0.0".to_string(),
                    description: None,
                    tags: vec![],
                    packages: vec![],
                    repository: None,
                    meta: None,
                },
            )
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, ServiceError::NotManagedRegistry(_)));
    }

    #[tokio::test]
    async fn publishes_keep_managed_catalog_name_sorted() {
        let fx = fixture().await;
        for name in ["zeta", "alpha", "mid"] {
            fx.service
                .publish_server_version(
                    "internal",
                    PublishRequest {
                        name: name.to_string(),
                        version: "1.0.0".to_string(),
                        description: None,
                        tags: vec![],
                        packages: vec![],
                        repository: None,
                        meta: None,
                    },
                )
                .await
                .expect("publish");
        }

        let snapshot = fx
            .catalogs
            .load("internal")
            .await
            .expect("load")
            .expect("snapshot");
        let names: Vec<&str> = snapshot.servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn delete_version_removes_server_when_last_version_goes() {
        let fx = fixture().await;
        for version in ["1.0.0", "2.0.0"] {
            fx.service
                .publish_server_version(
                    "internal",
                    PublishRequest {
                        name: "tool".to_string(),
                        version: version.to_string(),
                        description: None,
                        tags: vec![],
                        packages: vec![],
                        repository: None,
                        meta: None,
                    },
                )
                .await
                .expect("publish");
        }

        fx.service
            .delete_server_version("internal", "tool", "1.0.0")
            .await
            .expect("delete");
        let versions = fx
            .service
            .list_server_versions("internal", "tool")
            .await
            .expect("versions");
        assert_eq!(versions.len(), 1);

        fx.service
            .delete_server_version("internal", "tool", "2.0.0")
            .await
            .expect("delete");
        let err = fx
            .service
            .list_server_versions("internal", "tool")
            .await
            .err()
            .expect("gone");
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_from_synced_registry_is_forbidden() {
        let fx = fixture().await;
        seed_community(&fx, &["a"]).await;
        let err = fx
            .service
            .delete_server_version("community", "a", "1.0.0")
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, ServiceError::NotManagedRegistry(_)));
    }

    #[tokio::test]
    async fn aggregated_listing_unions_registries_with_origin() {
        let fx = fixture().await;
        seed_community(&fx, &["shared", "community-only"]).await;
        fx.service
            .publish_server_version(
                "internal",
                PublishRequest {
                    name: "shared".to_string(),
                    version: "1.0.0".to_string(),
                    description: None,
                    tags: vec![],
                    packages: vec![],
                    repository: None,
                    meta: None,
                },
            )
            .await
            .expect("publish");

        let page = fx
            .service
            .list_all_servers(&ListOptions::default())
            .await
            .expect("list");
        let rows: Vec<(String, String)> = page
            .items
            .iter()
            .map(|r| (r.server.name.clone(), r.registry.clone()))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("community-only".to_string(), "community".to_string()),
                ("shared".to_string(), "community".to_string()),
                ("shared".to_string(), "internal".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn created_registry_is_api_owned_and_deletable() {
        let fx = fixture().await;
        let info = fx
            .service
            .create_registry(RegistryConfig::new("runtime", SourceType::Managed))
            .await
            .expect("create");
        assert_eq!(info.reg_type, RegistryType::Managed);
        assert!(!info.syncable);

        fx.service
            .publish_server_version(
                "runtime",
                PublishRequest {
                    name: "tool".to_string(),
                    version: "1.0.0".to_string(),
                    description: None,
                    tags: vec![],
                    packages: vec![],
                    repository: None,
                    meta: None,
                },
            )
            .await
            .expect("publish");

        fx.service.delete_registry("runtime").await.expect("delete");
        let err = fx
            .service
            .list_servers("runtime", &ListOptions::default())
            .await
            .err()
            .expect("gone");
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_registry_rejects_invalid_config() {
        let fx = fixture().await;
        // File source without its source block.
        let err = fx
            .service
            .create_registry(RegistryConfig::new("bad", SourceType::File))
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, ServiceError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn config_owned_registry_cannot_be_deleted_through_the_api() {
        let fx = fixture().await;
        let err = fx
            .service
            .delete_registry("community")
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, ServiceError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn list_registries_reports_types_and_status() {
        let fx = fixture().await;
        let infos = fx.service.list_registries().await.expect("list");
        assert_eq!(infos.len(), 2);
        let community = infos.iter().find(|i| i.name == "community").expect("row");
        assert!(community.syncable);
        let internal = infos.iter().find(|i| i.name == "internal").expect("row");
        assert_eq!(internal.reg_type, RegistryType::Managed);
        assert!(!internal.syncable);
    }

    #[test]
    fn cursor_roundtrips_arbitrary_keys() {
        for key in ["a", "server-name", "name\u{0}registry", "ünïcode"] {
            assert_eq!(decode_cursor(&encode_cursor(key)).expect("decode"), key);
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn cursor_roundtrip(key in "\\PC{0,64}") {
                prop_assert_eq!(decode_cursor(&encode_cursor(&key)).expect("decode"), key);
            }

            #[test]
            fn pagination_never_duplicates_or_drops(
                count in 0usize..40,
                limit in 1usize..10,
            ) {
                let rows: Vec<String> = (0..count).map(|i| format!("row-{i:02}")).collect();
                let mut collected = Vec::new();
                let mut cursor = None;
                loop {
                    let options = ListOptions {
                        cursor: cursor.clone(),
                        limit: Some(limit),
                        ..ListOptions::default()
                    };
                    let page = paginate(rows.clone(), &options, |row| row.clone())
                        .expect("paginate");
                    collected.extend(page.items);
                    match page.next_cursor {
                        Some(next) => cursor = Some(next),
                        None => break,
                    }
                }
                prop_assert_eq!(collected, rows);
            }
        }
    }
}
