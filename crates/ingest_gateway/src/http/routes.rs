use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use homestead_domain::{CommandQueue, IngestService, Protocol};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shared state for the HTTP transport.
#[derive(Clone)]
pub struct HttpState {
    pub ingest: Arc<IngestService>,
    pub commands: Arc<CommandQueue>,
}

/// Routes served by the ingest API.
pub fn ingest_router(state: HttpState) -> Router {
    Router::new()
        .route("/automation_api", post(ingest_handler))
        .route(
            "/api/devices/:device_id/commands",
            post(queue_command_handler),
        )
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serves the router until the token is cancelled.
pub async fn serve_http(
    bind_addr: &str,
    router: Router,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "HTTP ingest listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    info!("HTTP ingest stopped");
    Ok(())
}

/// Telemetry intake. The response status comes from the pipeline
/// outcome; pending commands ride back inside the response body.
async fn ingest_handler(State(state): State<HttpState>, Json(payload): Json<Value>) -> Response {
    match state.ingest.ingest(payload, Protocol::Http).await {
        Ok(outcome) => {
            let status = StatusCode::from_u16(outcome.status_code)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(outcome.body)).into_response()
        }
        Err(error) => {
            error!(%error, "telemetry ingestion failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "Error", "message": "Internal error"})),
            )
                .into_response()
        }
    }
}

/// Queues a command tree for a device. Delivery happens on the
/// device's next poll, or immediately over MQTT when it is connected.
async fn queue_command_handler(
    State(state): State<HttpState>,
    Path(device_id): Path<String>,
    Json(command): Json<Value>,
) -> Response {
    let usable = command.as_object().map(|map| !map.is_empty()).unwrap_or(false);
    if !usable {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "Rejected", "message": "Command must be a non-empty object"})),
        )
            .into_response();
    }

    match state.commands.enqueue(&device_id, command).await {
        Ok(id) => (
            StatusCode::ACCEPTED,
            Json(json!({"status": "Queued", "id": id.to_string()})),
        )
            .into_response(),
        Err(error) => {
            error!(device_id = %device_id, %error, "failed to queue command");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "Error", "message": "Internal error"})),
            )
                .into_response()
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
