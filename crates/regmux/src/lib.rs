//! # regmux
//!
//! Core engine of the regmux multi-tenant MCP registry aggregator.
//!
//! regmux ingests catalogs of MCP servers from heterogeneous upstream
//! sources (git repositories, HTTP APIs, local files, cluster reconcilers,
//! and an in-process managed registry), normalizes them into a common model,
//! stores the result durably, and serves a read/publish API across all
//! aggregated sub-registries.
//!
//! ## Pipeline
//!
//! The sync flow for one registry is **decide → claim → fetch → filter →
//! store → finalize**:
//!
//! 1. [`sync::SyncManager::should_sync`] weighs state, manual triggers,
//!    filter changes, and the sync interval, probing the upstream only when
//!    one of those suggests a sync might be needed.
//! 2. The [`coordinator::Coordinator`] claims the registry with an atomic
//!    `!Syncing → Syncing` transition through the state service.
//! 3. [`sync::SyncManager::perform_sync`] drives the source handler, the
//!    filter engine, and the catalog store, entirely outside any lock.
//! 4. The coordinator writes the final status on every exit path, including
//!    cancellation.
//!
//! ## Modules
//!
//! - [`source`] — per-source-type handlers: validate, fetch, hash probe
//! - [`sync`] — should-sync decision and the fetch/filter/store pipeline
//! - [`coordinator`] — scheduling loops, leasing, lifecycle, finalization
//! - [`state`] — durable per-registry sync state, file and Postgres backends
//! - [`store`] — catalog snapshot persistence, file and Postgres backends
//! - [`backend`] — backend selection from server configuration
//! - [`service`] — read/publish path over stored snapshots
//! - [`metrics`] — observer hooks, no-op unless a provider is wired
//! - [`hash`] — content hashing helpers shared by sources and the service

/// Backend selection from server configuration.
pub mod backend;

/// Scheduling loops, leasing, lifecycle, finalization.
pub mod coordinator;

/// Content hashing helpers.
pub mod hash;

/// Observer hooks for sync and HTTP metrics.
pub mod metrics;

/// Read/publish path over stored snapshots.
pub mod service;

/// Per-source-type upstream handlers.
pub mod source;

/// Durable per-registry sync state.
pub mod state;

/// Catalog snapshot persistence.
pub mod store;

/// Should-sync decision and the sync pipeline.
pub mod sync;

pub(crate) mod fsutil;
