//! Upstream catalog format parsers.
//!
//! Two wire formats are understood: the native `regmux` snapshot shape and
//! the public MCP registry's `upstream` shape. Parsing is deterministic:
//! output order is input order, grouped by first occurrence of a server
//! name. Parsed data is normalized but never rewritten; upstream extension
//! blobs ride along verbatim.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use regmux_types::{ServerEntry, ServerVersion};

/// Native snapshot format: `{"servers": […]}` or a bare array.
pub const FORMAT_REGMUX: &str = "regmux";

/// Public MCP registry wire format.
pub const FORMAT_UPSTREAM: &str = "upstream";

/// Whether a format string names a known parser.
pub fn format_is_known(format: &str) -> bool {
    matches!(format, FORMAT_REGMUX | FORMAT_UPSTREAM)
}

/// Parse catalog bytes according to the registry's configured format.
pub fn parse_catalog(bytes: &[u8], format: &str) -> Result<Vec<ServerEntry>> {
    match format {
        FORMAT_REGMUX => parse_native(bytes),
        FORMAT_UPSTREAM => parse_upstream(bytes),
        other => bail!("unknown catalog format {other:?}"),
    }
}

#[derive(Deserialize)]
struct NativeDocument {
    servers: Vec<ServerEntry>,
}

fn parse_native(bytes: &[u8]) -> Result<Vec<ServerEntry>> {
    // Accept both the wrapped document and a bare server array.
    if let Ok(doc) = serde_json::from_slice::<NativeDocument>(bytes) {
        return Ok(doc.servers);
    }
    let servers: Vec<ServerEntry> =
        serde_json::from_slice(bytes).context("failed to parse native catalog document")?;
    Ok(servers)
}

#[derive(Deserialize)]
struct UpstreamDocument {
    servers: Vec<UpstreamEntry>,
}

#[derive(Deserialize)]
struct UpstreamEntry {
    server: UpstreamServer,
    #[serde(rename = "_meta", default)]
    meta: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct UpstreamServer {
    name: String,
    #[serde(default)]
    description: Option<String>,
    version: String,
    #[serde(default)]
    repository: Option<UpstreamRepository>,
    #[serde(default)]
    packages: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct UpstreamRepository {
    #[serde(default)]
    url: Option<String>,
}

fn parse_upstream(bytes: &[u8]) -> Result<Vec<ServerEntry>> {
    let doc: UpstreamDocument =
        serde_json::from_slice(bytes).context("failed to parse upstream catalog document")?;

    let mut servers: Vec<ServerEntry> = Vec::new();
    for entry in doc.servers {
        let updated_at = entry.meta.as_ref().and_then(extract_updated_at);
        let version = ServerVersion {
            version: entry.server.version,
            description: entry.server.description.clone(),
            packages: entry.server.packages,
            repository: entry.server.repository.and_then(|r| r.url),
            updated_at,
            meta: entry.meta,
        };

        match servers.iter_mut().find(|s| s.name == entry.server.name) {
            Some(existing) => existing.versions.push(version),
            None => {
                let mut server = ServerEntry::new(entry.server.name);
                server.description = entry.server.description;
                server.versions.push(version);
                servers.push(server);
            }
        }
    }
    Ok(servers)
}

/// Pull an `updatedAt` timestamp out of an upstream `_meta` blob.
///
/// The official registry nests it under its publisher extension key; other
/// registries put it at the top level. Both are accepted.
fn extract_updated_at(meta: &serde_json::Value) -> Option<DateTime<Utc>> {
    let direct = meta.get("updatedAt");
    let nested = meta
        .get("io.modelcontextprotocol.registry/official")
        .and_then(|official| official.get("updatedAt"));
    direct
        .or(nested)
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
}
