use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};
use tracing::warn;
use uuid::Uuid;

use regmux_types::{
    CreationType, RegistryConfig, RegistryRecord, RegistryType, StateError, SyncPhase, SyncStatus,
};

use crate::state::{JobPredicate, MSG_SYNC_IN_PROGRESS, StateService, StatusMutator};

const SCHEMA: &str = include_str!("schema.sql");

/// Postgres-backed state service.
///
/// Safe for multiple server replicas sharing the database: atomic status
/// transitions use `SELECT … FOR UPDATE`, and job leasing adds
/// `SKIP LOCKED` so replicas scanning concurrently never collide on the
/// same registry.
pub struct PgStateService {
    pool: PgPool,
    /// Config cache for lease reconstruction; rebuilt by `initialize` and
    /// kept current by the registry CRUD methods.
    configs: RwLock<BTreeMap<String, RegistryConfig>>,
}

impl PgStateService {
    /// Wrap a pool and apply the schema idempotently.
    pub async fn connect(pool: PgPool) -> Result<Self> {
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("failed to apply state schema")?;
        Ok(Self {
            pool,
            configs: RwLock::new(BTreeMap::new()),
        })
    }

    fn cached_config(&self, name: &str) -> Option<RegistryConfig> {
        self.configs
            .read()
            .expect("config cache lock poisoned")
            .get(name)
            .cloned()
    }
}

fn phase_to_sql(phase: SyncPhase) -> &'static str {
    match phase {
        SyncPhase::Syncing => "syncing",
        SyncPhase::Complete => "complete",
        SyncPhase::Failed => "failed",
    }
}

fn phase_from_sql(raw: &str) -> Result<SyncPhase> {
    match raw {
        "syncing" => Ok(SyncPhase::Syncing),
        "complete" => Ok(SyncPhase::Complete),
        "failed" => Ok(SyncPhase::Failed),
        other => Err(anyhow!("unknown sync phase {other:?} in database")),
    }
}

fn creation_type_to_sql(creation_type: CreationType) -> &'static str {
    match creation_type {
        CreationType::Config => "CONFIG",
        CreationType::Api => "API",
    }
}

fn creation_type_from_sql(raw: &str) -> Result<CreationType> {
    match raw {
        "CONFIG" => Ok(CreationType::Config),
        "API" => Ok(CreationType::Api),
        other => Err(anyhow!("unknown creation type {other:?} in database")),
    }
}

fn reg_type_to_sql(reg_type: RegistryType) -> &'static str {
    match reg_type {
        RegistryType::Remote => "REMOTE",
        RegistryType::File => "FILE",
        RegistryType::Managed => "MANAGED",
        RegistryType::Kubernetes => "KUBERNETES",
    }
}

fn reg_type_from_sql(raw: &str) -> Result<RegistryType> {
    match raw {
        "REMOTE" => Ok(RegistryType::Remote),
        "FILE" => Ok(RegistryType::File),
        "MANAGED" => Ok(RegistryType::Managed),
        "KUBERNETES" => Ok(RegistryType::Kubernetes),
        other => Err(anyhow!("unknown registry type {other:?} in database")),
    }
}

/// Columns selected for every status read.
const STATUS_COLUMNS: &str = "s.sync_status::text AS phase, s.error_msg, s.started_at, \
                              s.ended_at, s.attempt_count, s.last_sync_hash, \
                              s.last_applied_filter_hash, s.server_count";

fn status_from_row(row: &PgRow) -> Result<SyncStatus> {
    let phase_raw: String = row.try_get("phase").context("failed to decode phase")?;
    Ok(SyncStatus {
        phase: phase_from_sql(&phase_raw)?,
        message: row.try_get("error_msg").context("failed to decode error_msg")?,
        last_attempt: row
            .try_get::<Option<DateTime<Utc>>, _>("started_at")
            .context("failed to decode started_at")?,
        attempt_count: row
            .try_get::<i32, _>("attempt_count")
            .context("failed to decode attempt_count")? as u32,
        last_sync_time: row
            .try_get::<Option<DateTime<Utc>>, _>("ended_at")
            .context("failed to decode ended_at")?,
        last_sync_hash: row
            .try_get("last_sync_hash")
            .context("failed to decode last_sync_hash")?,
        last_applied_filter_hash: row
            .try_get("last_applied_filter_hash")
            .context("failed to decode last_applied_filter_hash")?,
        server_count: row
            .try_get::<i64, _>("server_count")
            .context("failed to decode server_count")? as u64,
    })
}

fn record_from_row(row: &PgRow) -> Result<RegistryRecord> {
    let reg_type_raw: String = row.try_get("reg_type").context("failed to decode reg_type")?;
    let creation_raw: String = row
        .try_get("creation_type")
        .context("failed to decode creation_type")?;
    let source_config: serde_json::Value = row
        .try_get("source_config")
        .context("failed to decode source_config")?;
    Ok(RegistryRecord {
        id: row.try_get("id").context("failed to decode id")?,
        name: row.try_get("name").context("failed to decode name")?,
        reg_type: reg_type_from_sql(&reg_type_raw)?,
        creation_type: creation_type_from_sql(&creation_raw)?,
        config: serde_json::from_value(source_config)
            .context("failed to decode stored registry config")?,
        sync_schedule: row
            .try_get("sync_schedule")
            .context("failed to decode sync_schedule")?,
        syncable: row.try_get("syncable").context("failed to decode syncable")?,
        created_at: row.try_get("created_at").context("failed to decode created_at")?,
        updated_at: row.try_get("updated_at").context("failed to decode updated_at")?,
    })
}

/// Insert a registry row with its seed status inside a transaction.
async fn insert_registry(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    config: &RegistryConfig,
    creation_type: CreationType,
) -> Result<RegistryRecord> {
    let record = RegistryRecord::from_config(config, creation_type);
    sqlx::query(
        "INSERT INTO registries (id, name, reg_type, creation_type, source_type, format, \
         source_config, filter_config, sync_schedule, syncable, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
    )
    .bind(record.id)
    .bind(&record.name)
    .bind(reg_type_to_sql(record.reg_type))
    .bind(creation_type_to_sql(record.creation_type))
    .bind(config.source_type.to_string())
    .bind(&config.format)
    .bind(serde_json::to_value(config).context("failed to encode registry config")?)
    .bind(
        config
            .filter
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .context("failed to encode filter config")?,
    )
    .bind(&record.sync_schedule)
    .bind(record.syncable)
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to insert registry {:?}", record.name))?;

    let seed = if record.syncable {
        SyncStatus::initial_syncable()
    } else {
        SyncStatus::initial_non_synced(record.reg_type)
    };
    sqlx::query(
        "INSERT INTO registry_syncs (id, registry_id, sync_status, error_msg, attempt_count, \
         server_count) VALUES ($1, $2, CAST($3 AS sync_phase), $4, $5, $6)",
    )
    .bind(Uuid::new_v4())
    .bind(record.id)
    .bind(phase_to_sql(seed.phase))
    .bind(&seed.message)
    .bind(seed.attempt_count as i32)
    .bind(seed.server_count as i64)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to seed sync status for {:?}", record.name))?;

    Ok(record)
}

#[async_trait]
impl StateService for PgStateService {
    async fn initialize(&self, configs: &[RegistryConfig]) -> Result<(), StateError> {
        let mut seen = std::collections::BTreeSet::new();
        for config in configs {
            config.validate().map_err(StateError::backend)?;
            if !seen.insert(config.name.as_str()) {
                return Err(StateError::Conflict(format!(
                    "duplicate registry name {:?} in configuration",
                    config.name
                )));
            }
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StateError::backend(anyhow!(e).context("failed to open transaction")))?;

        let existing = sqlx::query(
            "SELECT id, name, reg_type, creation_type FROM registries FOR UPDATE",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| StateError::backend(anyhow!(e).context("failed to scan registries")))?;

        struct ExistingRow {
            id: Uuid,
            name: String,
            reg_type: RegistryType,
            creation_type: CreationType,
        }
        let mut rows = Vec::with_capacity(existing.len());
        for row in &existing {
            let reg_type_raw: String =
                row.try_get("reg_type").map_err(StateError::backend)?;
            let creation_raw: String =
                row.try_get("creation_type").map_err(StateError::backend)?;
            rows.push(ExistingRow {
                id: row.try_get("id").map_err(StateError::backend)?,
                name: row.try_get("name").map_err(StateError::backend)?,
                reg_type: reg_type_from_sql(&reg_type_raw).map_err(StateError::backend)?,
                creation_type: creation_type_from_sql(&creation_raw)
                    .map_err(StateError::backend)?,
            });
        }

        // Conflicts fail the transaction before any writes; rollback on
        // drop leaves the store untouched.
        for config in configs {
            if let Some(row) = rows.iter().find(|r| r.name == config.name) {
                if row.creation_type == CreationType::Api {
                    return Err(StateError::Conflict(format!(
                        "registry {:?} was created through the API and cannot be \
                         overwritten by configuration",
                        config.name
                    )));
                }
                if row.reg_type != config.registry_type() {
                    return Err(StateError::Conflict(format!(
                        "registry {:?} has type {} which cannot be changed to {}",
                        config.name,
                        row.reg_type,
                        config.registry_type()
                    )));
                }
            }
        }

        for row in &rows {
            if row.creation_type == CreationType::Config && !seen.contains(row.name.as_str()) {
                sqlx::query("DELETE FROM registries WHERE id = $1")
                    .bind(row.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        StateError::backend(
                            anyhow!(e).context(format!("failed to delete registry {:?}", row.name)),
                        )
                    })?;
            }
        }

        for config in configs {
            match rows.iter().find(|r| r.name == config.name) {
                Some(row) => {
                    sqlx::query(
                        "UPDATE registries SET source_type = $2, format = $3, \
                         source_config = $4, filter_config = $5, sync_schedule = $6, \
                         syncable = $7, updated_at = now() WHERE id = $1",
                    )
                    .bind(row.id)
                    .bind(config.source_type.to_string())
                    .bind(&config.format)
                    .bind(
                        serde_json::to_value(config)
                            .context("failed to encode registry config")
                            .map_err(StateError::backend)?,
                    )
                    .bind(
                        config
                            .filter
                            .as_ref()
                            .map(serde_json::to_value)
                            .transpose()
                            .context("failed to encode filter config")
                            .map_err(StateError::backend)?,
                    )
                    .bind(config.sync_policy.as_ref().and_then(|p| p.interval.clone()))
                    .bind(config.syncable())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        StateError::backend(
                            anyhow!(e)
                                .context(format!("failed to update registry {:?}", config.name)),
                        )
                    })?;
                }
                None => {
                    insert_registry(&mut tx, config, CreationType::Config)
                        .await
                        .map_err(StateError::backend)?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| StateError::backend(anyhow!(e).context("failed to commit initialize")))?;

        let mut cache = BTreeMap::new();
        for config in configs {
            cache.insert(config.name.clone(), config.clone());
        }
        for record in self.list_registries().await? {
            if record.creation_type == CreationType::Api {
                cache.insert(record.name.clone(), record.config.clone());
            }
        }
        *self.configs.write().expect("config cache lock poisoned") = cache;

        Ok(())
    }

    async fn sync_status(&self, name: &str) -> Result<SyncStatus, StateError> {
        let row = sqlx::query(&format!(
            "SELECT {STATUS_COLUMNS} FROM registry_syncs s \
             JOIN registries r ON r.id = s.registry_id WHERE r.name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StateError::backend(anyhow!(e).context("failed to load sync status")))?
        .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        status_from_row(&row).map_err(StateError::backend)
    }

    async fn list_sync_statuses(&self) -> Result<BTreeMap<String, SyncStatus>, StateError> {
        let rows = sqlx::query(&format!(
            "SELECT r.name, {STATUS_COLUMNS} FROM registry_syncs s \
             JOIN registries r ON r.id = s.registry_id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StateError::backend(anyhow!(e).context("failed to list sync statuses")))?;

        let mut statuses = BTreeMap::new();
        for row in rows {
            let name: String = row.try_get("name").map_err(StateError::backend)?;
            statuses.insert(name, status_from_row(&row).map_err(StateError::backend)?);
        }
        Ok(statuses)
    }

    async fn update_sync_status(&self, name: &str, status: &SyncStatus) -> Result<(), StateError> {
        let result = sqlx::query(
            "INSERT INTO registry_syncs (id, registry_id, sync_status, error_msg, started_at, \
             ended_at, attempt_count, last_sync_hash, last_applied_filter_hash, server_count) \
             SELECT $2, r.id, CAST($3 AS sync_phase), $4, $5, $6, $7, $8, $9, $10 \
             FROM registries r WHERE r.name = $1 \
             ON CONFLICT (registry_id) DO UPDATE SET sync_status = CAST($3 AS sync_phase), \
             error_msg = $4, started_at = $5, ended_at = $6, attempt_count = $7, \
             last_sync_hash = $8, last_applied_filter_hash = $9, server_count = $10",
        )
        .bind(name)
        .bind(Uuid::new_v4())
        .bind(phase_to_sql(status.phase))
        .bind(&status.message)
        .bind(status.last_attempt)
        .bind(status.last_sync_time)
        .bind(status.attempt_count as i32)
        .bind(&status.last_sync_hash)
        .bind(&status.last_applied_filter_hash)
        .bind(status.server_count as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| StateError::backend(anyhow!(e).context("failed to upsert sync status")))?;

        if result.rows_affected() == 0 {
            return Err(StateError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn update_status_atomically(
        &self,
        name: &str,
        mutate: &mut StatusMutator<'_>,
    ) -> Result<bool, StateError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StateError::backend(anyhow!(e).context("failed to open transaction")))?;

        let row = sqlx::query(&format!(
            "SELECT s.id, {STATUS_COLUMNS} FROM registry_syncs s \
             JOIN registries r ON r.id = s.registry_id \
             WHERE r.name = $1 FOR UPDATE OF s"
        ))
        .bind(name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StateError::backend(anyhow!(e).context("failed to lock sync status")))?
        .ok_or_else(|| StateError::NotFound(name.to_string()))?;

        let sync_id: Uuid = row.try_get("id").map_err(StateError::backend)?;
        let mut status = status_from_row(&row).map_err(StateError::backend)?;

        if !mutate(&mut status) {
            // Commit the no-op so the row lock drops cleanly.
            tx.commit().await.map_err(|e| {
                StateError::backend(anyhow!(e).context("failed to commit no-op"))
            })?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE registry_syncs SET sync_status = CAST($2 AS sync_phase), error_msg = $3, \
             started_at = $4, ended_at = $5, attempt_count = $6, last_sync_hash = $7, \
             last_applied_filter_hash = $8, server_count = $9 WHERE id = $1",
        )
        .bind(sync_id)
        .bind(phase_to_sql(status.phase))
        .bind(&status.message)
        .bind(status.last_attempt)
        .bind(status.last_sync_time)
        .bind(status.attempt_count as i32)
        .bind(&status.last_sync_hash)
        .bind(&status.last_applied_filter_hash)
        .bind(status.server_count as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| StateError::backend(anyhow!(e).context("failed to write sync status")))?;

        tx.commit()
            .await
            .map_err(|e| StateError::backend(anyhow!(e).context("failed to commit status")))?;
        Ok(true)
    }

    async fn next_sync_job(
        &self,
        predicate: &JobPredicate<'_>,
    ) -> Result<Option<RegistryConfig>, StateError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StateError::backend(anyhow!(e).context("failed to open transaction")))?;

        // SKIP LOCKED keeps concurrent replicas from colliding: a row
        // another replica is leasing right now is simply not seen here.
        let rows = sqlx::query(&format!(
            "SELECT s.id, r.name, r.creation_type, r.source_config, {STATUS_COLUMNS} \
             FROM registry_syncs s JOIN registries r ON r.id = s.registry_id \
             WHERE r.syncable ORDER BY s.ended_at ASC NULLS FIRST, r.name \
             FOR UPDATE OF s SKIP LOCKED"
        ))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| StateError::backend(anyhow!(e).context("failed to scan sync jobs")))?;

        for row in rows {
            let name: String = row.try_get("name").map_err(StateError::backend)?;
            let status = status_from_row(&row).map_err(StateError::backend)?;

            let config = match self.cached_config(&name) {
                Some(config) => config,
                None => {
                    let stored: serde_json::Value =
                        row.try_get("source_config").map_err(StateError::backend)?;
                    match serde_json::from_value::<RegistryConfig>(stored) {
                        Ok(config) => config,
                        Err(e) => {
                            // Cannot reconstitute the config; skip the row
                            // rather than halt scheduling.
                            warn!(registry = %name, error = %e,
                                  "skipping registry with undecodable stored config");
                            continue;
                        }
                    }
                }
            };

            if !predicate(&config, &status) {
                continue;
            }

            let sync_id: Uuid = row.try_get("id").map_err(StateError::backend)?;
            sqlx::query(
                "UPDATE registry_syncs SET sync_status = 'syncing', error_msg = $2, \
                 started_at = now(), attempt_count = attempt_count + 1 WHERE id = $1",
            )
            .bind(sync_id)
            .bind(MSG_SYNC_IN_PROGRESS)
            .execute(&mut *tx)
            .await
            .map_err(|e| StateError::backend(anyhow!(e).context("failed to lease sync job")))?;

            tx.commit()
                .await
                .map_err(|e| StateError::backend(anyhow!(e).context("failed to commit lease")))?;
            return Ok(Some(config));
        }

        tx.commit()
            .await
            .map_err(|e| StateError::backend(anyhow!(e).context("failed to commit scan")))?;
        Ok(None)
    }

    async fn registry(&self, name: &str) -> Result<RegistryRecord, StateError> {
        let row = sqlx::query("SELECT * FROM registries WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StateError::backend(anyhow!(e).context("failed to load registry")))?
            .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        record_from_row(&row).map_err(StateError::backend)
    }

    async fn list_registries(&self) -> Result<Vec<RegistryRecord>, StateError> {
        let rows = sqlx::query("SELECT * FROM registries ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StateError::backend(anyhow!(e).context("failed to list registries")))?;
        rows.iter()
            .map(|row| record_from_row(row).map_err(StateError::backend))
            .collect()
    }

    async fn create_registry(
        &self,
        config: &RegistryConfig,
    ) -> Result<RegistryRecord, StateError> {
        config.validate().map_err(StateError::backend)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StateError::backend(anyhow!(e).context("failed to open transaction")))?;

        let exists = sqlx::query("SELECT 1 FROM registries WHERE name = $1")
            .bind(&config.name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StateError::backend(anyhow!(e).context("failed to check registry")))?;
        if exists.is_some() {
            return Err(StateError::Conflict(format!(
                "registry {:?} already exists",
                config.name
            )));
        }

        let record = insert_registry(&mut tx, config, CreationType::Api)
            .await
            .map_err(StateError::backend)?;
        tx.commit()
            .await
            .map_err(|e| StateError::backend(anyhow!(e).context("failed to commit create")))?;

        self.configs
            .write()
            .expect("config cache lock poisoned")
            .insert(config.name.clone(), config.clone());
        Ok(record)
    }

    async fn delete_registry(&self, name: &str) -> Result<(), StateError> {
        let record = self.registry(name).await?;
        if record.creation_type == CreationType::Config {
            return Err(StateError::Conflict(format!(
                "registry {name:?} is owned by the configuration file and cannot be \
                 deleted through the API"
            )));
        }

        // Status and snapshot rows die by FK cascade.
        sqlx::query("DELETE FROM registries WHERE name = $1 AND creation_type = 'API'")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| StateError::backend(anyhow!(e).context("failed to delete registry")))?;

        self.configs
            .write()
            .expect("config cache lock poisoned")
            .remove(name);
        Ok(())
    }
}
