//! HTTP surface of the ingest service.
//!
//! - `POST {webhook_endpoint}`: signed Jira webhook, answered with `202` and
//!   the assigned message id
//! - `GET /health`: liveness
//! - `GET /metrics`: Prometheus text format

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::info;

use super::Producer;
use crate::error::IngestError;
use crate::metrics::export_metrics;
use crate::webhook::SIGNATURE_HEADER;

/// Shared state of the ingest handlers.
#[derive(Clone)]
pub struct AppState {
    pub producer: Arc<Producer>,
}

/// Body of a `202 Accepted` answer.
#[derive(Debug, Serialize)]
struct AcceptedResponse {
    status: &'static str,
    message_id: String,
    stream: String,
}

/// Builds the ingest router with `webhook_endpoint` as the webhook path.
pub fn router(state: AppState, webhook_endpoint: &str) -> Router {
    Router::new()
        .route(webhook_endpoint, post(receive_webhook))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serves `app` on `addr` until `shutdown` resolves.
pub async fn serve<F>(addr: &str, app: Router, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %listener.local_addr()?, "Ingest server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Ingest server stopped");
    Ok(())
}

async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<AcceptedResponse>), IngestError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let accepted = state.producer.accept(&body, signature).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted",
            message_id: accepted.message_id.to_string(),
            stream: accepted.stream_key,
        }),
    ))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "jira_ingest",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics() -> String {
    export_metrics()
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = match self {
            IngestError::Unauthorized => StatusCode::UNAUTHORIZED,
            IngestError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            IngestError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        let body = Json(serde_json::json!({
            "status": "rejected",
            "error": self.outcome(),
            "detail": self.to_string(),
        }));

        (status, body).into_response()
    }
}
