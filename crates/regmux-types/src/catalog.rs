use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One published version of an MCP server.
///
/// The `packages` and `meta` fields carry upstream data verbatim; the
/// aggregator never rewrites them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerVersion {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Package distribution entries, preserved as opaque JSON.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Upstream extension data (`_meta` in the public registry format).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl ServerVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            description: None,
            packages: Vec::new(),
            repository: None,
            updated_at: None,
            meta: None,
        }
    }
}

/// One MCP server with its ordered version history.
///
/// Versions are ordered oldest-first; the last entry is the newest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub versions: Vec<ServerVersion>,
}

impl ServerEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            tags: Vec::new(),
            versions: Vec::new(),
        }
    }

    /// The newest version, if any.
    pub fn latest(&self) -> Option<&ServerVersion> {
        self.versions.last()
    }

    pub fn version(&self, version: &str) -> Option<&ServerVersion> {
        self.versions.iter().find(|v| v.version == version)
    }

    /// Timestamp of the newest version carrying one.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.versions.iter().rev().find_map(|v| v.updated_at)
    }
}

/// The full normalized catalog stored for one registry after a successful
/// sync, together with the content hash of the upstream data it was built
/// from.
///
/// Snapshots are replaced whole; there is no partial update.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Catalog {
    pub servers: Vec<ServerEntry>,
    #[serde(default)]
    pub hash: String,
}

impl Catalog {
    pub fn new(servers: Vec<ServerEntry>, hash: impl Into<String>) -> Self {
        Self {
            servers,
            hash: hash.into(),
        }
    }

    pub fn server_count(&self) -> u64 {
        self.servers.len() as u64
    }

    pub fn server(&self, name: &str) -> Option<&ServerEntry> {
        self.servers.iter().find(|s| s.name == name)
    }

    pub fn server_mut(&mut self, name: &str) -> Option<&mut ServerEntry> {
        self.servers.iter_mut().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with_versions(name: &str, versions: &[&str]) -> ServerEntry {
        let mut e = ServerEntry::new(name);
        e.versions = versions
            .iter()
            .map(|v| ServerVersion::new(*v))
            .collect();
        e
    }

    #[test]
    fn latest_returns_last_version() {
        let e = entry_with_versions("demo", &["1.0.0", "1.1.0", "2.0.0"]);
        assert_eq!(e.latest().expect("latest").version, "2.0.0");
    }

    #[test]
    fn latest_is_none_for_empty_versions() {
        let e = ServerEntry::new("demo");
        assert!(e.latest().is_none());
    }

    #[test]
    fn version_lookup_finds_exact_match() {
        let e = entry_with_versions("demo", &["1.0.0", "1.1.0"]);
        assert_eq!(e.version("1.0.0").expect("found").version, "1.0.0");
        assert!(e.version("9.9.9").is_none());
    }

    #[test]
    fn updated_at_prefers_newest_version_with_timestamp() {
        let mut e = entry_with_versions("demo", &["1.0.0", "1.1.0", "2.0.0"]);
        let older = "2024-01-01T00:00:00Z".parse().expect("ts");
        let newer = "2024-06-01T00:00:00Z".parse().expect("ts");
        e.versions[0].updated_at = Some(older);
        e.versions[1].updated_at = Some(newer);
        // 2.0.0 carries no timestamp, so 1.1.0's is used.
        assert_eq!(e.updated_at(), Some(newer));
    }

    #[test]
    fn catalog_counts_servers_not_versions() {
        let catalog = Catalog::new(
            vec![
                entry_with_versions("a", &["1.0.0", "2.0.0"]),
                entry_with_versions("b", &["1.0.0"]),
            ],
            "abc123",
        );
        assert_eq!(catalog.server_count(), 2);
    }

    #[test]
    fn catalog_roundtrips_through_json() {
        let catalog = Catalog::new(vec![entry_with_versions("a", &["1.0.0"])], "h1");
        let json = serde_json::to_string(&catalog).expect("serialize");
        let back: Catalog = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, catalog);
    }
}
