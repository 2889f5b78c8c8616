//! Application assembly.
//!
//! [`AppBuilder`] wires the service graph — configuration → storage
//! backend → state service → sync manager → coordinator → HTTP router —
//! from an enumerated option set. Every option is validated eagerly when
//! it is supplied; `build` only composes what already checked out.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::info;

use regmux::backend::{self, StorageBackends};
use regmux::coordinator::{Coordinator, ScheduleMode};
use regmux::metrics::{Metrics, NoopMetrics};
use regmux::service::RegistryService;
use regmux::source::{DefaultHandlerFactory, HandlerFactory};
use regmux::state::StateService as _;
use regmux::sync::SyncManager;
use regmux_config::{ServerConfig, StorageType};

use crate::http;

/// How often a lease-mode replica polls for due jobs.
const LEASE_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Transform applied to the router for authorization; identity when no
/// auth provider is wired.
pub type AuthzLayer = Box<dyn FnOnce(axum::Router) -> axum::Router + Send>;

/// Builds a fully wired [`App`].
pub struct AppBuilder {
    config: Option<ServerConfig>,
    address: SocketAddr,
    data_dir: Option<PathBuf>,
    handler_factory: Option<Arc<dyn HandlerFactory>>,
    storage: Option<StorageBackends>,
    sync_manager: Option<Arc<SyncManager>>,
    metrics: Arc<dyn Metrics>,
    tracer: Option<tracing::Dispatch>,
    authz: Option<AuthzLayer>,
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            data_dir: None,
            handler_factory: None,
            storage: None,
            sync_manager: None,
            metrics: Arc::new(NoopMetrics),
            tracer: None,
            authz: None,
        }
    }

    /// The validated server configuration. Required.
    pub fn with_config(mut self, config: ServerConfig) -> Result<Self> {
        config.validate()?;
        self.config = Some(config);
        Ok(self)
    }

    /// Listen address for the HTTP API.
    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = address;
        self
    }

    /// Override the configured data directory.
    pub fn with_data_directory(mut self, data_dir: PathBuf) -> Result<Self> {
        if data_dir.as_os_str().is_empty() {
            bail!("data directory must not be empty");
        }
        self.data_dir = Some(data_dir);
        Ok(self)
    }

    /// Substitute the source handler factory (tests, embedders).
    pub fn with_registry_handler_factory(mut self, factory: Arc<dyn HandlerFactory>) -> Self {
        self.handler_factory = Some(factory);
        self
    }

    /// Substitute pre-connected storage backends.
    pub fn with_storage(mut self, storage: StorageBackends) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Substitute the sync manager wholesale.
    pub fn with_sync_manager(mut self, sync_manager: Arc<SyncManager>) -> Self {
        self.sync_manager = Some(sync_manager);
        self
    }

    /// Metrics provider; defaults to no-op.
    pub fn with_meter_provider(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Tracing dispatcher scoped to this application; defaults to the
    /// globally installed subscriber.
    pub fn with_tracer_provider(mut self, dispatch: tracing::Dispatch) -> Self {
        self.tracer = Some(dispatch);
        self
    }

    /// Authorization middleware applied around the whole router.
    pub fn with_authz_middleware(mut self, layer: AuthzLayer) -> Self {
        self.authz = Some(layer);
        self
    }

    /// Connect storage, reconcile state, and assemble the application.
    pub async fn build(self) -> Result<App> {
        let mut config = self.config.context("a server configuration is required")?;
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }

        let storage = match self.storage {
            Some(storage) => storage,
            None => backend::connect(&config).await?,
        };

        storage
            .state
            .initialize(&config.registries)
            .await
            .context("startup state reconciliation failed")?;
        info!(registries = config.registries.len(), backend = %config.storage_type,
              "state initialized");

        let handler_factory = self
            .handler_factory
            .unwrap_or_else(|| Arc::new(DefaultHandlerFactory::new(&config.data_dir)));
        let sync_manager = self.sync_manager.unwrap_or_else(|| {
            Arc::new(SyncManager::new(handler_factory, storage.catalogs.clone()))
        });

        // Replicas sharing a database pull work through the lease; the
        // file backend is single-process and keeps per-registry loops.
        let mode = match config.storage_type {
            StorageType::File => ScheduleMode::PerRegistry,
            StorageType::Database => ScheduleMode::Lease {
                poll_interval: LEASE_POLL_INTERVAL,
            },
        };
        let coordinator = Arc::new(Coordinator::new(
            storage.state.clone(),
            sync_manager,
            self.metrics.clone(),
            config.registries.clone(),
            mode,
        ));

        let service = Arc::new(RegistryService::new(
            storage.state.clone(),
            storage.catalogs.clone(),
        ));
        let mut router = http::router(http::HttpState {
            service: service.clone(),
            metrics: self.metrics.clone(),
            registry_name: config.registry_name.clone(),
            aggregated_enabled: config.enable_aggregated_endpoints,
        });
        if let Some(authz) = self.authz {
            router = authz(router);
        }

        Ok(App {
            router,
            coordinator,
            address: self.address,
            tracer: self.tracer,
        })
    }
}

/// A wired application, ready to run.
pub struct App {
    router: axum::Router,
    coordinator: Arc<Coordinator>,
    address: SocketAddr,
    tracer: Option<tracing::Dispatch>,
}

impl App {
    /// The HTTP router, exposed for in-process testing.
    pub fn router(&self) -> axum::Router {
        self.router.clone()
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    /// Token that stops the whole application when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.coordinator.cancellation_token()
    }

    /// Serve the API and run the sync coordinator until the shutdown
    /// token fires; drains in-flight work before returning.
    pub async fn run(mut self) -> Result<()> {
        match self.tracer.take() {
            Some(dispatch) => {
                use tracing::instrument::WithSubscriber;
                self.run_inner().with_subscriber(dispatch).await
            }
            None => self.run_inner().await,
        }
    }

    async fn run_inner(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.address)
            .await
            .with_context(|| format!("failed to bind {}", self.address))?;
        info!(address = %self.address, "listening");

        let coordinator = self.coordinator.clone();
        let runner = tokio::spawn(async move { coordinator.start().await });

        let shutdown = self.coordinator.cancellation_token();
        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("HTTP server failed")?;

        self.coordinator.stop().await;
        runner.await.context("coordinator task panicked")?;
        Ok(())
    }
}
