use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use regmux_types::{Catalog, GitSource, RegistryConfig, SyncError};

use crate::source::{FetchOutcome, parse};

/// Fetches a catalog file from a git repository ref.
///
/// Clones shallowly into a per-registry cache directory and fast-forwards
/// on subsequent fetches. The content hash is `"<commit-id>:<path>"` on
/// every code path, so a path change forces a resync even when the commit
/// is unchanged.
pub struct GitHandler {
    cache_dir: PathBuf,
}

impl GitHandler {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    fn source<'a>(&self, config: &'a RegistryConfig) -> Result<&'a GitSource, SyncError> {
        config.git.as_ref().ok_or_else(|| {
            SyncError::validation(format!(
                "registry {:?}: git source block is missing",
                config.name
            ))
        })
    }

    pub fn validate(&self, config: &RegistryConfig) -> Result<(), SyncError> {
        let source = self.source(config)?;
        if source.url.is_empty() || source.url.chars().any(char::is_whitespace) {
            return Err(SyncError::validation(format!(
                "registry {:?}: git url {:?} is not a valid repository URL",
                config.name, source.url
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

        let commit = self
            .sync_repo(cancel, source)
            .await
            .map_err(|e| {
                SyncError::fetch(format!(
                    "registry {:?}: failed to fetch {}",
                    config.name, source.url
                ))
                .with_cause(e)
            })?;

        let catalog_path = self.cache_dir.join(source.catalog_path());
        let bytes = tokio::fs::read(&catalog_path).await.map_err(|e| {
            SyncError::fetch(format!(
                "registry {:?}: catalog file {:?} not found in repository",
                config.name,
                source.catalog_path()
            ))
            .with_cause(e)
        })?;

        let servers = parse::parse_catalog(&bytes, &config.format).map_err(|e| {
            SyncError::fetch(format!(
                "registry {:?}: failed to parse {:?}",
                config.name,
                source.catalog_path()
            ))
            .with_cause(e)
        })?;

        let hash = content_hash(&commit, source.catalog_path());
        let catalog = Catalog::new(servers, hash.clone());
        let server_count = catalog.server_count();
        Ok(FetchOutcome {
            catalog,
            format: config.format.clone(),
            hash,
            server_count,
        })
    }

    /// Probe the remote ref without touching the local clone.
    pub async fn current_hash(
        &self,
        cancel: &CancellationToken,
        config: &RegistryConfig,
    ) -> Result<String> {
        let source = config
            .git
            .as_ref()
            .with_context(|| format!("registry {:?}: git source block is missing", config.name))?;

        let reference = source.reference.as_deref().unwrap_or("HEAD");
        let output = run_git(
            cancel,
            None,
            &["ls-remote", &source.url, reference],
        )
        .await?;

        let commit = output
            .split_whitespace()
            .next()
            .filter(|c| !c.is_empty())
            .with_context(|| {
                format!("ls-remote found no ref {reference:?} at {}", source.url)
            })?;
        Ok(content_hash(commit, source.catalog_path()))
    }

    /// Clone or fast-forward the cache clone; returns the checked-out
    /// commit id.
    async fn sync_repo(&self, cancel: &CancellationToken, source: &GitSource) -> Result<String> {
        let reference = source.reference.as_deref();

        if !self.cache_dir.join(".git").exists() {
            if let Some(parent) = self.cache_dir.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let dir = self
                .cache_dir
                .to_str()
                .context("git cache path is not valid UTF-8")?;
            let mut args = vec!["clone", "--depth", "1"];
            if let Some(r) = reference {
                args.extend(["--branch", r]);
            }
            args.extend([source.url.as_str(), dir]);
            run_git(cancel, None, &args).await?;
        } else {
            let fetch_ref = reference.unwrap_or("HEAD");
            run_git(
                cancel,
                Some(&self.cache_dir),
                &["fetch", "--depth", "1", "origin", fetch_ref],
            )
            .await?;
            run_git(
                cancel,
                Some(&self.cache_dir),
                &["reset", "--hard", "FETCH_HEAD"],
            )
            .await?;
        }

        let commit = run_git(cancel, Some(&self.cache_dir), &["rev-parse", "HEAD"]).await?;
        let commit = commit.trim();
        if commit.is_empty() {
            bail!("rev-parse returned no commit for {}", source.url);
        }
        Ok(commit.to_string())
    }
}

fn content_hash(commit: &str, path: &str) -> String {
    format!("{commit}:{path}")
}

/// Run a git command, honoring cancellation by killing the child.
async fn run_git(
    cancel: &CancellationToken,
    dir: Option<&Path>,
    args: &[&str],
) -> Result<String> {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }

    let child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn git {}", args.join(" ")))?;

    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => bail!("git {} cancelled", args.join(" ")),
        out = child.wait_with_output() => {
            out.with_context(|| format!("git {} did not run", args.join(" ")))?
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git {} failed ({}): {}",
            args.join(" "),
            output.status,
            stderr.trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
