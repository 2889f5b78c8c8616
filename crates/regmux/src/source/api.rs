use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;

use regmux_types::{ApiSource, Catalog, RegistryConfig, SyncError};

use crate::hash::{CHANGED_SENTINEL, sha256_hex};
use crate::source::{FetchOutcome, parse};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches a catalog from an HTTP endpoint.
///
/// The content hash is the endpoint's strong ETag when it sends one, else
/// the SHA-256 of the response body. The probe issues a HEAD request and
/// falls back to the "changed" sentinel when the endpoint gives no ETag.
pub struct ApiHandler {
    client: reqwest::Client,
}

impl ApiHandler {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }

    fn source<'a>(&self, config: &'a RegistryConfig) -> Result<&'a ApiSource, SyncError> {
        config.api.as_ref().ok_or_else(|| {
            SyncError::validation(format!(
                "registry {:?}: api source block is missing",
                config.name
            ))
        })
    }

    pub fn validate(&self, config: &RegistryConfig) -> Result<(), SyncError> {
        let source = self.source(config)?;
        if !source.endpoint.starts_with("http://") && !source.endpoint.starts_with("https://") {
            return Err(SyncError::validation(format!(
                "registry {:?}: endpoint {:?} must be an http(s) URL",
                config.name, source.endpoint
            )));
        }
        Ok(())
    }

    pub async fn fetch(
        &self,
        cancel: &CancellationToken,
        config: &RegistryConfig,
    ) -> Result<FetchOutcome, SyncError> {
        let source = self
            .source(config)
            .map_err(|e| SyncError::fetch(e.message.clone()))?;

        let mut request = self.client.get(&source.endpoint);
        for (key, value) in &source.headers {
            request = request.header(key, value);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(SyncError::fetch(format!(
                    "registry {:?}: fetch cancelled",
                    config.name
                )));
            }
            resp = request.send() => resp.map_err(|e| {
                SyncError::fetch(format!(
                    "registry {:?}: request to {} failed",
                    config.name, source.endpoint
                ))
                .with_cause(e)
            })?,
        };

        if !response.status().is_success() {
            return Err(SyncError::fetch(format!(
                "registry {:?}: {} returned {}",
                config.name,
                source.endpoint,
                response.status()
            )));
        }

        let etag = strong_etag(&response);
        let bytes = response.bytes().await.map_err(|e| {
            SyncError::fetch(format!(
                "registry {:?}: failed to read response body",
                config.name
            ))
            .with_cause(e)
        })?;

        let hash = etag.unwrap_or_else(|| sha256_hex(&bytes));
        let servers = parse::parse_catalog(&bytes, &config.format).map_err(|e| {
            SyncError::fetch(format!(
                "registry {:?}: failed to parse response from {}",
                config.name, source.endpoint
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

    /// HEAD probe for a strong ETag; conservative sentinel otherwise.
    pub async fn current_hash(
        &self,
        cancel: &CancellationToken,
        config: &RegistryConfig,
    ) -> Result<String> {
        let source = config
            .api
            .as_ref()
            .with_context(|| format!("registry {:?}: api source block is missing", config.name))?;

        let mut request = self.client.head(&source.endpoint);
        for (key, value) in &source.headers {
            request = request.header(key, value);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => bail!("registry {:?}: probe cancelled", config.name),
            resp = request.send() => resp
                .with_context(|| format!("HEAD {} failed", source.endpoint))?,
        };

        if !response.status().is_success() {
            bail!(
                "HEAD {} returned {}",
                source.endpoint,
                response.status()
            );
        }

        Ok(strong_etag(&response).unwrap_or_else(|| CHANGED_SENTINEL.to_string()))
    }
}

/// A strong ETag from the response, with surrounding quotes stripped.
/// Weak validators (`W/"…"`) are ignored: they do not guarantee byte
/// equality, which the hash comparison requires.
fn strong_etag(response: &reqwest::Response) -> Option<String> {
    let raw = response
        .headers()
        .get(reqwest::header::ETAG)?
        .to_str()
        .ok()?;
    if raw.starts_with("W/") {
        return None;
    }
    Some(format!("etag:{}", raw.trim_matches('"')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use regmux_types::{SourceType, SyncErrorKind};
    use std::collections::BTreeMap;

    fn config_with_endpoint(endpoint: &str) -> RegistryConfig {
        let mut cfg = RegistryConfig::new("apireg", SourceType::Api);
        cfg.api = Some(ApiSource {
            endpoint: endpoint.to_string(),
            headers: BTreeMap::new(),
        });
        cfg
    }

    /// One-shot HTTP server on an ephemeral port.
    fn serve_once(
        body: &'static str,
        etag: Option<&'static str>,
    ) -> (String, std::thread::JoinHandle<()>) {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind");
        let addr = format!("http://{}", server.server_addr());
        let handle = std::thread::spawn(move || {
            for request in server.incoming_requests().take(1) {
                let mut response = tiny_http::Response::from_string(body);
                if let Some(tag) = etag {
                    response.add_header(
                        tiny_http::Header::from_bytes(&b"ETag"[..], tag.as_bytes())
                            .expect("header"),
                    );
                }
                let _ = request.respond(response);
            }
        });
        (addr, handle)
    }

    #[test]
    fn validate_requires_http_url() {
        let handler = ApiHandler::new().expect("client");
        let err = handler
            .validate(&config_with_endpoint("ftp://example.com"))
            .err()
            .expect("must fail");
        assert_eq!(err.kind, SyncErrorKind::Validation);

        handler
            .validate(&config_with_endpoint("https://example.com/v0/servers"))
            .expect("valid");
    }

    #[tokio::test]
    async fn fetch_hashes_body_when_no_etag() {
        let body = r#"{"servers": [{"name": "a", "versions": [{"version": "1.0.0"}]}]}"#;
        let (addr, handle) = serve_once(body, None);

        let handler = ApiHandler::new().expect("client");
        let cfg = config_with_endpoint(&addr);
        let out = handler
            .fetch(&CancellationToken::new(), &cfg)
            .await
            .expect("fetch");

        assert_eq!(out.server_count, 1);
        assert_eq!(out.hash, sha256_hex(body.as_bytes()));
        handle.join().expect("server thread");
    }

    #[tokio::test]
    async fn fetch_prefers_strong_etag_over_body_hash() {
        let body = r#"{"servers": []}"#;
        let (addr, handle) = serve_once(body, Some("\"v42\""));

        let handler = ApiHandler::new().expect("client");
        let cfg = config_with_endpoint(&addr);
        let out = handler
            .fetch(&CancellationToken::new(), &cfg)
            .await
            .expect("fetch");

        assert_eq!(out.hash, "etag:v42");
        handle.join().expect("server thread");
    }

    #[tokio::test]
    async fn fetch_fails_on_http_error_status() {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind");
        let addr = format!("http://{}", server.server_addr());
        let handle = std::thread::spawn(move || {
            for request in server.incoming_requests().take(1) {
                let _ = request.respond(tiny_http::Response::empty(503));
            }
        });

        let handler = ApiHandler::new().expect("client");
        let cfg = config_with_endpoint(&addr);
        let err = handler
            .fetch(&CancellationToken::new(), &cfg)
            .await
            .err()
            .expect("must fail");
        assert_eq!(err.kind, SyncErrorKind::Fetch);
        assert!(err.message.contains("503"));
        handle.join().expect("server thread");
    }

    #[tokio::test]
    async fn probe_without_etag_returns_changed_sentinel() {
        let (addr, handle) = serve_once("{}", None);

        let handler = ApiHandler::new().expect("client");
        let cfg = config_with_endpoint(&addr);
        let probed = handler
            .current_hash(&CancellationToken::new(), &cfg)
            .await
            .expect("probe");
        assert_eq!(probed, CHANGED_SENTINEL);
        handle.join().expect("server thread");
    }

    #[tokio::test]
    async fn cancelled_fetch_fails_promptly() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let handler = ApiHandler::new().expect("client");
        let cfg = config_with_endpoint("http://127.0.0.1:9/unreachable");
        let err = handler.fetch(&cancel, &cfg).await.err().expect("must fail");
        assert!(err.message.contains("cancelled"));
    }
}
