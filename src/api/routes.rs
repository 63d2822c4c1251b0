//! API Routes
//!
//! Thin axum handlers; all behavior lives in the network controller.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ControllerError;
use crate::network::{FleetStatus, NetworkController};
use crate::types::HeartbeatMessage;

pub fn router(controller: Arc<NetworkController>) -> Router {
    Router::new()
        // Node lifecycle
        .route("/nodes/:name", put(put_node))
        .route("/heartbeat/:name", post(post_heartbeat))
        .route("/files/:name/*path", get(get_file))
        // Health & status
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(controller)
}

/// Run the HTTP server until it fails or the process exits
pub async fn serve(controller: Arc<NetworkController>) -> anyhow::Result<()> {
    let addr = controller.app_config().listen_addr;
    let app = router(controller);

    info!("📊 node API listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

struct ApiError(ControllerError);

impl From<ControllerError> for ApiError {
    fn from(e: ControllerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControllerError::UnknownNode(_) => StatusCode::NOT_FOUND,
            ControllerError::InvalidFilename(_) => StatusCode::BAD_REQUEST,
            ControllerError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// PUT /nodes/:name - register a node with an optional user config overlay
async fn put_node(
    State(controller): State<Arc<NetworkController>>,
    Path(name): Path<String>,
    body: Option<Json<Value>>,
) -> Result<StatusCode, ApiError> {
    let config_user = body.map(|Json(value)| value);
    controller.create_node(&name, config_user).await?;
    Ok(StatusCode::OK)
}

/// POST /heartbeat/:name - node agent liveness report
async fn post_heartbeat(
    State(controller): State<Arc<NetworkController>>,
    Path(name): Path<String>,
    body: Option<Json<HeartbeatMessage>>,
) -> Result<Json<Value>, ApiError> {
    let msg = body.map(|Json(msg)| msg).unwrap_or_default();
    match controller.heartbeat(&name, &msg).await? {
        Some(reply) => Ok(Json(
            serde_json::to_value(reply).map_err(ControllerError::from)?,
        )),
        // Maintenance in progress: empty reply, nothing was recorded.
        None => Ok(Json(json!({}))),
    }
}

/// GET /files/:name/*path - per-node file distribution
async fn get_file(
    State(controller): State<Arc<NetworkController>>,
    Path((name, path)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let file_path = controller.node_file_path(&name, &path)?;
    let bytes = tokio::fs::read(&file_path)
        .await
        .map_err(ControllerError::from)?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}

/// GET /health - simple liveness probe
async fn health_check() -> &'static str {
    "OK"
}

/// GET /status - fleet summary
async fn get_status(State(controller): State<Arc<NetworkController>>) -> Json<FleetStatus> {
    Json(controller.fleet_status().await)
}
