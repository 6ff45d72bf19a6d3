//! HTTP control API served by `warden run`.
//!
//! Device changes are written to the directory first and then queued on the
//! supervisor, so a restart sees the same fleet.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::{Json, Router};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use warden_core::supervisor::Supervisor;
use warden_db::models::{Device, DeviceId};
use warden_db::queries::devices as device_db;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub pool: PgPool,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/devices", get(list_devices).post(add_device))
        .route("/api/devices/{udid}", delete(remove_device))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Serve the control API until `shutdown` is cancelled.
pub async fn serve(state: AppState, bind: &str, port: u16, shutdown: CancellationToken) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("warden control API listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!("warden control API shut down");
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn list_devices(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.supervisor.device_statuses().await)
}

async fn add_device(
    State(state): State<AppState>,
    Json(device): Json<Device>,
) -> Result<axum::response::Response, AppError> {
    if device.name.trim().is_empty() {
        return Err(AppError::bad_request("device name must not be empty"));
    }
    let stored = device_db::upsert_device(&state.pool, &device)
        .await
        .map_err(AppError::internal)?;
    state.supervisor.add_device(stored.clone());
    Ok((StatusCode::ACCEPTED, Json(stored)).into_response())
}

async fn remove_device(
    State(state): State<AppState>,
    Path(udid): Path<String>,
) -> Result<axum::response::Response, AppError> {
    let id: DeviceId = udid
        .parse()
        .map_err(|e| AppError::bad_request(format!("invalid device id: {e}")))?;
    let removed = device_db::delete_device(&state.pool, &id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("device {id} not found")))?;
    state.supervisor.remove_device(removed.clone());
    Ok((StatusCode::ACCEPTED, Json(removed)).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
