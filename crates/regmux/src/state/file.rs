use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use regmux_types::status::MSG_SYNC_INTERRUPTED;
use regmux_types::{
    CreationType, RegistryConfig, RegistryRecord, StateError, SyncPhase, SyncStatus,
};

use crate::fsutil;
use crate::state::{JobPredicate, MSG_SYNC_IN_PROGRESS, StateService, StatusMutator};

const REGISTRY_FILE: &str = "registry.json";
const STATUS_FILE: &str = "status.json";

/// File-backed state service: one directory per registry under the data
/// dir, holding `registry.json` and `status.json`, each written via temp
/// file + rename. A process-wide mutex serializes writers; the backend
/// assumes a single server process owns the data directory.
pub struct FileStateService {
    data_dir: PathBuf,
    lock: Mutex<()>,
    /// In-memory config cache used to reconstruct lease results; rebuilt
    /// by `initialize` and kept current by the registry CRUD methods.
    configs: RwLock<BTreeMap<String, RegistryConfig>>,
}

impl FileStateService {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            lock: Mutex::new(()),
            configs: RwLock::new(BTreeMap::new()),
        }
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(name).join(REGISTRY_FILE)
    }

    fn status_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(name).join(STATUS_FILE)
    }

    fn load_record(&self, name: &str) -> Result<Option<RegistryRecord>> {
        fsutil::load_json(&self.record_path(name))
    }

    fn write_record(&self, record: &RegistryRecord) -> Result<()> {
        let path = self.record_path(&record.name);
        let dir = path.parent().expect("record path has a parent");
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        fsutil::atomic_write_json(&path, record)
    }

    /// Load a registry's status, falling back to the seed state when the
    /// file is missing (e.g. a crash between record and status writes).
    fn load_status_or_seed(&self, record: &RegistryRecord) -> Result<SyncStatus> {
        match fsutil::load_json(&self.status_path(&record.name))? {
            Some(status) => Ok(status),
            None if record.syncable => Ok(SyncStatus::initial_syncable()),
            None => Ok(SyncStatus::initial_non_synced(record.reg_type)),
        }
    }

    fn write_status(&self, name: &str, status: &SyncStatus) -> Result<()> {
        let path = self.status_path(name);
        let dir = path.parent().expect("status path has a parent");
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        fsutil::atomic_write_json(&path, status)
    }

    /// All persisted registry records, sorted by name.
    fn scan_records(&self) -> Result<Vec<RegistryRecord>> {
        let mut records = Vec::new();
        let entries = match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read data dir {}", self.data_dir.display())
                });
            }
        };
        for entry in entries {
            let entry = entry.context("failed to read data dir entry")?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if let Some(record) = self.load_record(&name)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    fn remove_registry_dir(&self, name: &str) -> Result<()> {
        let dir = self.data_dir.join(name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to remove {}", dir.display()))?;
        }
        Ok(())
    }

    fn cached_config(&self, name: &str) -> Option<RegistryConfig> {
        self.configs
            .read()
            .expect("config cache lock poisoned")
            .get(name)
            .cloned()
    }

    fn cache_config(&self, config: &RegistryConfig) {
        self.configs
            .write()
            .expect("config cache lock poisoned")
            .insert(config.name.clone(), config.clone());
    }

    fn uncache_config(&self, name: &str) {
        self.configs
            .write()
            .expect("config cache lock poisoned")
            .remove(name);
    }
}

#[async_trait]
impl StateService for FileStateService {
    async fn initialize(&self, configs: &[RegistryConfig]) -> Result<(), StateError> {
        let _guard = self.lock.lock().await;

        let existing = self.scan_records().map_err(StateError::backend)?;
        let existing_by_name: BTreeMap<&str, &RegistryRecord> =
            existing.iter().map(|r| (r.name.as_str(), r)).collect();

        // Conflict pass: fail before any mutation.
        let mut seen = std::collections::BTreeSet::new();
        for config in configs {
            config.validate().map_err(StateError::backend)?;
            if !seen.insert(config.name.as_str()) {
                return Err(StateError::Conflict(format!(
                    "duplicate registry name {:?} in configuration",
                    config.name
                )));
            }
            if let Some(record) = existing_by_name.get(config.name.as_str()) {
                if record.creation_type == CreationType::Api {
                    return Err(StateError::Conflict(format!(
                        "registry {:?} was created through the API and cannot be \
                         overwritten by configuration",
                        config.name
                    )));
                }
                if record.reg_type != config.registry_type() {
                    return Err(StateError::Conflict(format!(
                        "registry {:?} has type {} which cannot be changed to {}",
                        config.name,
                        record.reg_type,
                        config.registry_type()
                    )));
                }
            }
        }

        // Drop CONFIG rows that vanished from the configuration.
        for record in &existing {
            if record.creation_type == CreationType::Config
                && !seen.contains(record.name.as_str())
            {
                info!(registry = %record.name, "removing registry dropped from configuration");
                self.remove_registry_dir(&record.name)
                    .map_err(StateError::backend)?;
            }
        }

        // Upsert CONFIG rows.
        for config in configs {
            let record = match existing_by_name.get(config.name.as_str()) {
                Some(existing_record) => {
                    let mut record = (*existing_record).clone();
                    record.config = config.clone();
                    record.sync_schedule = config
                        .sync_policy
                        .as_ref()
                        .and_then(|p| p.interval.clone());
                    record.syncable = config.syncable();
                    record.updated_at = Utc::now();
                    record
                }
                None => RegistryRecord::from_config(config, CreationType::Config),
            };
            self.write_record(&record).map_err(StateError::backend)?;

            let mut status = self
                .load_status_or_seed(&record)
                .map_err(StateError::backend)?;
            if record.syncable && status.phase == SyncPhase::Syncing {
                warn!(registry = %record.name, "recovering interrupted sync");
                status.phase = SyncPhase::Failed;
                status.message = MSG_SYNC_INTERRUPTED.to_string();
            }
            self.write_status(&record.name, &status)
                .map_err(StateError::backend)?;
        }

        // Recover orphaned Syncing rows on surviving API registries too.
        for record in &existing {
            if record.creation_type != CreationType::Api {
                continue;
            }
            let mut status = self
                .load_status_or_seed(record)
                .map_err(StateError::backend)?;
            if record.syncable && status.phase == SyncPhase::Syncing {
                warn!(registry = %record.name, "recovering interrupted sync");
                status.phase = SyncPhase::Failed;
                status.message = MSG_SYNC_INTERRUPTED.to_string();
                self.write_status(&record.name, &status)
                    .map_err(StateError::backend)?;
            }
        }

        // Rebuild the config cache: configured registries from the input,
        // API registries from their persisted records.
        let mut cache = BTreeMap::new();
        for config in configs {
            cache.insert(config.name.clone(), config.clone());
        }
        for record in &existing {
            if record.creation_type == CreationType::Api {
                cache.insert(record.name.clone(), record.config.clone());
            }
        }
        *self.configs.write().expect("config cache lock poisoned") = cache;

        Ok(())
    }

    async fn sync_status(&self, name: &str) -> Result<SyncStatus, StateError> {
        let _guard = self.lock.lock().await;
        let record = self
            .load_record(name)
            .map_err(StateError::backend)?
            .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        self.load_status_or_seed(&record).map_err(StateError::backend)
    }

    async fn list_sync_statuses(&self) -> Result<BTreeMap<String, SyncStatus>, StateError> {
        let _guard = self.lock.lock().await;
        let mut statuses = BTreeMap::new();
        for record in self.scan_records().map_err(StateError::backend)? {
            let status = self
                .load_status_or_seed(&record)
                .map_err(StateError::backend)?;
            statuses.insert(record.name, status);
        }
        Ok(statuses)
    }

    async fn update_sync_status(&self, name: &str, status: &SyncStatus) -> Result<(), StateError> {
        let _guard = self.lock.lock().await;
        if self.load_record(name).map_err(StateError::backend)?.is_none() {
            return Err(StateError::NotFound(name.to_string()));
        }
        self.write_status(name, status).map_err(StateError::backend)
    }

    async fn update_status_atomically(
        &self,
        name: &str,
        mutate: &mut StatusMutator<'_>,
    ) -> Result<bool, StateError> {
        let _guard = self.lock.lock().await;
        let record = self
            .load_record(name)
            .map_err(StateError::backend)?
            .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        let mut status = self
            .load_status_or_seed(&record)
            .map_err(StateError::backend)?;

        if !mutate(&mut status) {
            return Ok(false);
        }
        self.write_status(name, &status)
            .map_err(StateError::backend)?;
        Ok(true)
    }

    async fn next_sync_job(
        &self,
        predicate: &JobPredicate<'_>,
    ) -> Result<Option<RegistryConfig>, StateError> {
        let _guard = self.lock.lock().await;

        let mut candidates = Vec::new();
        for record in self.scan_records().map_err(StateError::backend)? {
            if !record.syncable {
                continue;
            }
            let status = self
                .load_status_or_seed(&record)
                .map_err(StateError::backend)?;
            candidates.push((record, status));
        }

        // Least-recently-synced first; never-synced rows lead.
        candidates.sort_by(|(a_rec, a), (b_rec, b)| {
            match (a.last_sync_time, b.last_sync_time) {
                (None, None) => a_rec.name.cmp(&b_rec.name),
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (Some(x), Some(y)) => x.cmp(&y).then_with(|| a_rec.name.cmp(&b_rec.name)),
            }
        });

        for (record, mut status) in candidates {
            let config = match self.cached_config(&record.name) {
                Some(config) => config,
                // Inability to reconstitute a config skips the row; it
                // never halts scheduling.
                None => record.config.clone(),
            };
            if !predicate(&config, &status) {
                continue;
            }

            status.phase = SyncPhase::Syncing;
            status.message = MSG_SYNC_IN_PROGRESS.to_string();
            status.last_attempt = Some(Utc::now());
            status.attempt_count += 1;
            self.write_status(&record.name, &status)
                .map_err(StateError::backend)?;
            return Ok(Some(config));
        }
        Ok(None)
    }

    async fn registry(&self, name: &str) -> Result<RegistryRecord, StateError> {
        let _guard = self.lock.lock().await;
        self.load_record(name)
            .map_err(StateError::backend)?
            .ok_or_else(|| StateError::NotFound(name.to_string()))
    }

    async fn list_registries(&self) -> Result<Vec<RegistryRecord>, StateError> {
        let _guard = self.lock.lock().await;
        self.scan_records().map_err(StateError::backend)
    }

    async fn create_registry(
        &self,
        config: &RegistryConfig,
    ) -> Result<RegistryRecord, StateError> {
        config.validate().map_err(StateError::backend)?;
        let _guard = self.lock.lock().await;
        if self
            .load_record(&config.name)
            .map_err(StateError::backend)?
            .is_some()
        {
            return Err(StateError::Conflict(format!(
                "registry {:?} already exists",
                config.name
            )));
        }

        let record = RegistryRecord::from_config(config, CreationType::Api);
        self.write_record(&record).map_err(StateError::backend)?;
        let status = if record.syncable {
            SyncStatus::initial_syncable()
        } else {
            SyncStatus::initial_non_synced(record.reg_type)
        };
        self.write_status(&record.name, &status)
            .map_err(StateError::backend)?;
        self.cache_config(config);
        Ok(record)
    }

    async fn delete_registry(&self, name: &str) -> Result<(), StateError> {
        let _guard = self.lock.lock().await;
        let record = self
            .load_record(name)
            .map_err(StateError::backend)?
            .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        if record.creation_type == CreationType::Config {
            return Err(StateError::Conflict(format!(
                "registry {:?} is owned by the configuration file and cannot be \
                 deleted through the API",
                name
            )));
        }
        self.remove_registry_dir(name).map_err(StateError::backend)?;
        self.uncache_config(name);
        Ok(())
    }
}
