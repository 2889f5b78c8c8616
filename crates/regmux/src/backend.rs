//! Storage backend selection.
//!
//! The backend is chosen once at startup from the server configuration and
//! is stable for the process lifetime. Both backends satisfy the same
//! [`StateService`](crate::state::StateService) and
//! [`CatalogStore`](crate::store::CatalogStore) contracts.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};

use regmux_config::{DatabaseConfig, ServerConfig, StorageType};

use crate::state::{FileStateService, PgStateService, StateService};
use crate::store::{CatalogStore, FileCatalogStore, PgCatalogStore};

/// The pair of persistence handles the rest of the system runs on.
pub struct StorageBackends {
    pub state: Arc<dyn StateService>,
    pub catalogs: Arc<dyn CatalogStore>,
}

/// Build the configured backend pair.
pub async fn connect(config: &ServerConfig) -> Result<StorageBackends> {
    match config.storage_type {
        StorageType::File => {
            std::fs::create_dir_all(&config.data_dir).with_context(|| {
                format!("failed to create data dir {}", config.data_dir.display())
            })?;
            Ok(StorageBackends {
                state: Arc::new(FileStateService::new(config.data_dir.clone())),
                catalogs: Arc::new(FileCatalogStore::new(config.data_dir.clone())),
            })
        }
        StorageType::Database => {
            let db = config
                .database
                .as_ref()
                .context("storageType is database but no database section is present")?;
            let pool = connect_pool(db).await?;
            let state = PgStateService::connect(pool.clone()).await?;
            Ok(StorageBackends {
                state: Arc::new(state),
                catalogs: Arc::new(PgCatalogStore::new(pool)),
            })
        }
    }
}

async fn connect_pool(db: &DatabaseConfig) -> Result<sqlx::PgPool> {
    let options = PgConnectOptions::new()
        .host(&db.host)
        .port(db.port)
        .username(&db.user)
        .password(&db.resolve_password()?)
        .database(&db.database)
        .ssl_mode(parse_ssl_mode(&db.ssl_mode)?);

    PgPoolOptions::new()
        .max_connections(db.max_open_conns)
        .min_connections(db.max_idle_conns)
        .max_lifetime(db.conn_max_lifetime()?)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to connect to database at {}:{}", db.host, db.port))
}

fn parse_ssl_mode(raw: &str) -> Result<PgSslMode> {
    Ok(match raw {
        "disable" => PgSslMode::Disable,
        "allow" => PgSslMode::Allow,
        "prefer" => PgSslMode::Prefer,
        "require" => PgSslMode::Require,
        "verify-ca" => PgSslMode::VerifyCa,
        "verify-full" => PgSslMode::VerifyFull,
        other => bail!("unknown sslMode {other:?}"),
    })
}
