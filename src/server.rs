//! Admin HTTP server.
//!
//! Exposes sync state and manual triggers as a small JSON API. Triggered
//! runs are spawned as tokio tasks and answered with `202 Accepted`; the
//! category locks keep them from overlapping with scheduled runs.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `GET`    | `/sync/status` | Overall status, state rows, artifact counts |
//! | `GET`    | `/sync/statistics` | Artifact counts per category |
//! | `POST`   | `/sync/run` | Spawn `run_all` |
//! | `POST`   | `/sync/{category}?full=bool` | Spawn one category, optionally a full resync |
//! | `DELETE` | `/sync/{category}/artifacts` | Reset the category |
//!
//! [`run_serve`] runs this server next to the [scheduler](crate::scheduler).
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "unknown category: 'Problem'. ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `conflict` (409), `internal` (500).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use itsm_sync_core::coordinator::SyncCoordinator;
use itsm_sync_core::error::SyncError;
use itsm_sync_core::models::{Category, SyncState};

use crate::config::Config;
use crate::scheduler::{run_scheduler, Schedule};

#[derive(Clone)]
struct AppState {
    coordinator: Arc<SyncCoordinator>,
}

/// Router over the coordinator. Exposed separately from [`run_server`] so
/// tests can serve it on an ephemeral port.
pub fn router(coordinator: Arc<SyncCoordinator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/sync/status", get(handle_status))
        .route("/sync/statistics", get(handle_statistics))
        .route("/sync/run", post(handle_run_all))
        .route("/sync/{category}", post(handle_run_category))
        .route("/sync/{category}/artifacts", delete(handle_reset))
        .layer(cors)
        .with_state(AppState { coordinator })
}

/// Bind `[server].bind` and serve until `shutdown` resolves.
pub async fn run_server<F>(
    config: &Config,
    coordinator: Arc<SyncCoordinator>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let bind_addr = config.server.bind.clone();
    let app = router(coordinator);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "admin server listening");
    println!("Admin server listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "conflict".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::UnknownCategory(_) | SyncError::CategoryNotConfigured(_) => {
                bad_request(err.to_string())
            }
            SyncError::Store(_) => internal(err.to_string()),
        }
    }
}

/// Parse a path segment and check it is configured here.
fn configured_category(coordinator: &SyncCoordinator, name: &str) -> Result<Category, AppError> {
    let category: Category = name.parse().map_err(AppError::from)?;
    if !coordinator.categories().contains(&category) {
        return Err(SyncError::CategoryNotConfigured(category.to_string()).into());
    }
    Ok(category)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /sync/status, /sync/statistics ============

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    states: Vec<SyncState>,
    artifacts: BTreeMap<Category, u64>,
    total_artifacts: u64,
}

async fn handle_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, AppError> {
    let stats = state.coordinator.statistics().await?;
    Ok(Json(StatusResponse {
        status: stats.overall,
        states: stats.states,
        artifacts: stats.artifacts,
        total_artifacts: stats.total_artifacts,
    }))
}

#[derive(Serialize)]
struct StatisticsResponse {
    artifacts: BTreeMap<Category, u64>,
    total_artifacts: u64,
}

async fn handle_statistics(
    State(state): State<AppState>,
) -> Result<Json<StatisticsResponse>, AppError> {
    let stats = state.coordinator.statistics().await?;
    Ok(Json(StatisticsResponse {
        artifacts: stats.artifacts,
        total_artifacts: stats.total_artifacts,
    }))
}

// ============ POST /sync/run, /sync/{category} ============

#[derive(Serialize)]
struct AcceptedResponse {
    accepted: bool,
    categories: Vec<Category>,
    full: bool,
}

async fn handle_run_all(State(state): State<AppState>) -> (StatusCode, Json<AcceptedResponse>) {
    let coordinator = state.coordinator.clone();
    let categories = coordinator.categories();
    tokio::spawn(async move {
        coordinator.run_all().await;
    });
    (
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            accepted: true,
            categories,
            full: false,
        }),
    )
}

#[derive(Deserialize)]
struct RunParams {
    #[serde(default)]
    full: bool,
}

async fn handle_run_category(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<RunParams>,
) -> Result<(StatusCode, Json<AcceptedResponse>), AppError> {
    let category = configured_category(&state.coordinator, &name)?;

    let coordinator = state.coordinator.clone();
    let full = params.full;
    tokio::spawn(async move {
        let name = category.as_str();
        let outcome = if full {
            coordinator.force_full_sync(name).await
        } else {
            coordinator.run_category(name).await
        };
        if let Err(e) = outcome {
            tracing::warn!(category = name, error = %e, "manual sync rejected");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            accepted: true,
            categories: vec![category],
            full,
        }),
    ))
}

// ============ DELETE /sync/{category}/artifacts ============

#[derive(Serialize)]
struct ResetResponse {
    category: Category,
    artifacts_deleted: u64,
}

async fn handle_reset(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ResetResponse>, AppError> {
    let category = configured_category(&state.coordinator, &name)?;
    match state.coordinator.reset_category(category.as_str()).await? {
        Some(deleted) => Ok(Json(ResetResponse {
            category,
            artifacts_deleted: deleted,
        })),
        None => Err(conflict(format!(
            "Sync already in progress for {}; try again later",
            category
        ))),
    }
}

/// `serve`: scheduler and admin server in one process until Ctrl-C.
pub async fn run_serve(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;
    crate::migrate::migrate_pool(&pool).await?;
    let coordinator = Arc::new(crate::ingest::build_coordinator(config, pool.clone())?);

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let stopped = |mut rx: tokio::sync::watch::Receiver<bool>| async move {
        let _ = rx.wait_for(|stop| *stop).await;
    };

    let schedule = Schedule {
        sync_every: Duration::from_secs(config.sync.interval_secs),
        reconcile_every: Duration::from_secs(config.sync.reconcile_interval_secs),
    };
    let scheduler = tokio::spawn(run_scheduler(
        coordinator.clone(),
        schedule,
        stopped(stop_rx.clone()),
    ));

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        let _ = stop_tx.send(true);
    });

    let served = run_server(config, coordinator, stopped(stop_rx)).await;
    if let Err(e) = scheduler.await {
        tracing::warn!(error = %e, "scheduler task ended abnormally");
    }
    pool.close().await;
    served
}
