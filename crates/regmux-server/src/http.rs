//! The versioned read/publish HTTP API.
//!
//! Thin handlers over [`RegistryService`]: parse the request, call the
//! service, map the error taxonomy onto status codes. Publish and delete
//! are accepted only for managed registries (403 otherwise), duplicate
//! publishes are 409, and the aggregated endpoints are read-only unions
//! registered only when enabled in configuration.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::error;

use regmux::metrics::Metrics;
use regmux::service::{
    AggregatedServer, ListOptions, PublishRequest, RegistryService, ServerSummary,
};
use regmux_types::{ServerVersion, ServiceError};

/// Shared handler state.
#[derive(Clone)]
pub struct HttpState {
    pub service: Arc<RegistryService>,
    pub metrics: Arc<dyn Metrics>,
    /// Identifier this server reports for itself.
    pub registry_name: String,
    pub aggregated_enabled: bool,
}

/// Assemble the full router.
pub fn router(state: HttpState) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(health))
        .route("/v0.1/registries", get(list_registries).post(create_registry))
        .route("/v0.1/registries/{registry}", axum::routing::delete(delete_registry));

    if state.aggregated_enabled {
        router = router
            .route("/v0.1/servers", get(list_all_servers))
            .route(
                "/v0.1/servers/{server}/versions",
                get(list_all_server_versions),
            )
            .route("/v0.1/publish", post(publish_aggregated));
    }

    router
        .route("/{registry}/v0.1/servers", get(list_servers))
        .route(
            "/{registry}/v0.1/servers/{server}/versions",
            get(list_server_versions),
        )
        .route(
            "/{registry}/v0.1/servers/{server}/versions/{version}",
            get(get_server_version).delete(delete_server_version),
        )
        .route("/{registry}/v0.1/publish", post(publish))
        .layer(middleware::from_fn_with_state(state.clone(), track_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Service errors mapped onto HTTP status codes.
struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::NotManagedRegistry(_) => StatusCode::FORBIDDEN,
            ServiceError::VersionAlreadyExists { .. } => StatusCode::CONFLICT,
            ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ServiceError::Internal(e) => {
                error!(error = %e, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct ListParams {
    cursor: Option<String>,
    limit: Option<usize>,
    search: Option<String>,
    /// RFC 3339 timestamp.
    updated_since: Option<DateTime<Utc>>,
    version: Option<String>,
}

impl From<ListParams> for ListOptions {
    fn from(params: ListParams) -> Self {
        ListOptions {
            cursor: params.cursor,
            limit: params.limit,
            search: params.search,
            updated_since: params.updated_since,
            version: params.version,
        }
    }
}

#[derive(Serialize)]
struct ServersResponse {
    servers: Vec<ServerSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<String>,
}

#[derive(Serialize)]
struct AggregatedServersResponse {
    servers: Vec<AggregatedServer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<String>,
}

#[derive(Serialize)]
struct VersionsResponse {
    versions: Vec<ServerVersion>,
}

async fn health(State(state): State<HttpState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "registry": state.registry_name }))
}

async fn list_registries(
    State(state): State<HttpState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let registries = state.service.list_registries().await?;
    Ok(Json(serde_json::json!({ "registries": registries })))
}

async fn create_registry(
    State(state): State<HttpState>,
    Json(config): Json<regmux_types::RegistryConfig>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let info = state.service.create_registry(config).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "registry": info })),
    ))
}

async fn delete_registry(
    State(state): State<HttpState>,
    Path(registry): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.service.delete_registry(&registry).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_servers(
    State(state): State<HttpState>,
    Path(registry): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<ServersResponse>, ApiError> {
    let page = state
        .service
        .list_servers(&registry, &params.into())
        .await?;
    Ok(Json(ServersResponse {
        servers: page.items,
        next_cursor: page.next_cursor,
    }))
}

async fn list_server_versions(
    State(state): State<HttpState>,
    Path((registry, server)): Path<(String, String)>,
) -> Result<Json<VersionsResponse>, ApiError> {
    let versions = state
        .service
        .list_server_versions(&registry, &server)
        .await?;
    Ok(Json(VersionsResponse { versions }))
}

async fn get_server_version(
    State(state): State<HttpState>,
    Path((registry, server, version)): Path<(String, String, String)>,
) -> Result<Json<ServerVersion>, ApiError> {
    let found = state
        .service
        .get_server_version(&registry, &server, &version)
        .await?;
    Ok(Json(found))
}

async fn delete_server_version(
    State(state): State<HttpState>,
    Path((registry, server, version)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .service
        .delete_server_version(&registry, &server, &version)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn publish(
    State(state): State<HttpState>,
    Path(registry): Path<String>,
    Json(request): Json<PublishRequest>,
) -> Result<(StatusCode, Json<ServerVersion>), ApiError> {
    let published = state
        .service
        .publish_server_version(&registry, request)
        .await?;
    Ok((StatusCode::CREATED, Json(published)))
}

async fn list_all_servers(
    State(state): State<HttpState>,
    Query(params): Query<ListParams>,
) -> Result<Json<AggregatedServersResponse>, ApiError> {
    let page = state.service.list_all_servers(&params.into()).await?;
    Ok(Json(AggregatedServersResponse {
        servers: page.items,
        next_cursor: page.next_cursor,
    }))
}

async fn list_all_server_versions(
    State(state): State<HttpState>,
    Path(server): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let versions = state.service.aggregated_server_versions(&server).await?;
    Ok(Json(serde_json::json!({ "versions": versions })))
}

async fn publish_aggregated() -> impl IntoResponse {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(serde_json::json!({
            "error": "publish requires a registry: POST /{registry}/v0.1/publish"
        })),
    )
}

/// Request metrics: in-flight gauge plus duration/count per route.
async fn track_metrics(State(state): State<HttpState>, request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    state.metrics.http_requests_in_flight(1);
    let started = Instant::now();

    let response = next.run(request).await;

    state.metrics.http_requests_in_flight(-1);
    state.metrics.record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}
