//! HTTP API Server
//!
//! Agent-to-agent and operator endpoints: health and readiness, replication
//! status, backups, restores, sync requests and the retry queue.

use axum::{
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::designation::ClusterDesignation;
use crate::driver::ComputeDriver;
use crate::error::{Error, Result};
use crate::peer::{BackupResult, ErrorResponse, SyncTransport, API_KEY_HEADER, API_KEY_QUERY, API_PREFIX};
use crate::reconcile::Reconciler;
use crate::service::{Catalog, ServiceInfo, SyncInfo};

/// Shared application state
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
    pub driver: Arc<dyn ComputeDriver>,
    pub sync: Arc<dyn SyncTransport>,
}

impl AppState {
    /// Registered service by name
    async fn service(&self, name: &str) -> Result<ServiceInfo> {
        self.reconciler
            .registry()
            .get(name)
            .await
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    async fn designation(&self) -> Result<ClusterDesignation> {
        self.reconciler
            .current_designation()
            .await
            .ok_or_else(|| Error::Designation("no designation loaded yet".into()))
    }
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Create the router
    pub fn create_router(state: Arc<AppState>) -> Router {
        let api = Router::new()
            .route("/ha/health", get(handle_ha_health))
            .route("/ha/ready", get(handle_ha_ready))
            .route("/status/:service", get(handle_status))
            .route("/backup/:service", get(handle_backup))
            .route("/restore/:service", get(handle_restore))
            .route("/query/:service", post(handle_query))
            .route("/sync/remote/:service", post(handle_sync_remote))
            .route("/sync/local/:service", post(handle_sync_local))
            .route("/state/:service", get(handle_state))
            .route("/pending", get(handle_pending))
            .route_layer(middleware::from_fn_with_state(state.clone(), require_secret));

        Router::new()
            .route("/health", get(handle_health))
            .nest(API_PREFIX, api)
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(state)
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Errors ============

/// Error rendered as `{error, code}`
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::ServiceNotFound(_) => StatusCode::NOT_FOUND,
            Error::PromotionBlocked { .. } | Error::RemoteNotEligible { .. } => StatusCode::CONFLICT,
            Error::RemoteCallFailed { .. } | Error::Network(_) | Error::SyncFailed(_) => {
                StatusCode::BAD_GATEWAY
            }
            Error::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: self.0.code().to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============ Auth ============

/// Reject requests without the designation's sync secret. Unknown callers
/// get a plain 404.
async fn require_secret(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let secret = state
        .reconciler
        .current_designation()
        .await
        .map(|d| d.sync_secret)
        .filter(|s| !s.is_empty());

    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| params.get(API_KEY_QUERY).map(String::as_str));

    match (secret, presented) {
        (Some(secret), Some(key)) if secret == key => next.run(request).await,
        _ => {
            tracing::warn!("Rejected unauthenticated request to {}", request.uri().path());
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

// ============ Request/Response Types ============

/// Liveness response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
}

#[derive(Debug, Deserialize)]
struct CatalogQuery {
    catalog: Option<String>,
}

/// Result of a restore request
#[derive(Debug, Serialize, Deserialize)]
pub struct RestoreResponse {
    pub service: String,
    pub restored: bool,
}

// ============ Handlers ============

async fn handle_health() -> impl IntoResponse {
    Json(HealthResponse { healthy: true })
}

async fn handle_ha_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let healthy = state.reconciler.health_status().await;
    let status = if healthy { StatusCode::OK } else { StatusCode::FORBIDDEN };
    (status, Json(HealthResponse { healthy }))
}

async fn handle_ha_ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ready = state.reconciler.ready_status().await;
    let status = if ready { StatusCode::OK } else { StatusCode::FORBIDDEN };
    (status, Json(HealthResponse { healthy: ready }))
}

async fn handle_status(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service(&name).await?;
    let handler = state.reconciler.handlers().get(service.catalog)?;
    Ok(Json(handler.probe(&name).await?))
}

async fn handle_backup(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service(&name).await?;
    let handler = state.reconciler.handlers().get(service.catalog)?;
    let data_path = handler.backup(&name).await?;
    tracing::info!("Backup of {} ready at {}", service, data_path);
    Ok(Json(BackupResult { data_path }))
}

async fn handle_restore(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service(&name).await?;
    let designation = state.designation().await?;
    let handler = state.reconciler.handlers().get(service.catalog)?;
    handler.restore(&name, &designation).await?;
    tracing::info!("Restored {} from {}", service, designation.remote_host);
    Ok(Json(RestoreResponse {
        service: name,
        restored: true,
    }))
}

async fn handle_query(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<CatalogQuery>,
) -> ApiResult<impl IntoResponse> {
    let catalog = match query.catalog.as_deref() {
        Some(c) => c.parse::<Catalog>()?,
        None => Catalog::Mariadb,
    };
    Ok(Json(state.driver.query_service(&name, catalog).await?))
}

async fn handle_sync_remote(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(info): Json<SyncInfo>,
) -> ApiResult<impl IntoResponse> {
    let designation = state.designation().await?;
    tracing::info!("Pushing {} to {}: {}", name, designation.remote_host, info);
    state
        .sync
        .sync_to_remote(&designation.remote_host, &designation.tmp_path, &info)
        .await?;
    Ok(StatusCode::OK)
}

async fn handle_sync_local(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(info): Json<SyncInfo>,
) -> ApiResult<impl IntoResponse> {
    let designation = state.designation().await?;
    tracing::info!("Pulling {} from {}: {}", name, designation.remote_host, info);
    state
        .sync
        .sync_to_local(&designation.remote_host, &designation.tmp_path, &info)
        .await?;
    Ok(StatusCode::OK)
}

async fn handle_state(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service(&name).await?;
    let handler = state.reconciler.handlers().get(service.catalog)?;
    Ok(Json(handler.stored_state(&name).await?))
}

async fn handle_pending(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.reconciler.pending(Utc::now()).await)
}
