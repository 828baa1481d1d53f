use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::callback::{CallbackCoordinator, CallbackResult};

const TOKEN_HEADER: &str = "x-callback-token";

/// Raw callback body as runners actually send it. Field-name variants
/// (camelCase and snake_case) are accepted here and normalized into
/// [`CallbackResult`]; nothing downstream sees the variants.
#[derive(Debug, Deserialize)]
pub struct CallbackPayload {
    #[serde(alias = "correlationId")]
    pub correlation_id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default, alias = "errorMessage", alias = "error")]
    pub error_message: Option<String>,
    #[serde(default, alias = "durationSecs", alias = "duration")]
    pub duration_secs: Option<f64>,
    #[serde(default, alias = "exitCode")]
    pub exit_code: Option<i32>,
}

impl From<CallbackPayload> for CallbackResult {
    fn from(payload: CallbackPayload) -> Self {
        Self {
            correlation_id: payload.correlation_id,
            success: payload.success,
            output: payload.output,
            error_message: payload.error_message,
            duration_secs: payload.duration_secs,
            exit_code: payload.exit_code,
        }
    }
}

#[derive(Clone)]
pub struct WebhookState {
    pub coordinator: Arc<CallbackCoordinator>,
    pub shared_secret: Option<String>,
}

pub fn build_router(state: WebhookState) -> Router {
    Router::new()
        .route("/callback", post(callback_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve the callback endpoint until the process exits.
pub async fn serve(port: u16, state: WebhookState) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Callback server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn callback_handler(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    Json(payload): Json<CallbackPayload>,
) -> (StatusCode, Json<serde_json::Value>) {
    if let Some(secret) = &state.shared_secret {
        let provided = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok());
        if provided != Some(secret.as_str()) {
            warn!("Rejected callback with missing or invalid token");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "unauthorized" })),
            );
        }
    }

    let result = CallbackResult::from(payload);

    // An authenticated runner always gets a 200: stale callbacks are an
    // expected race, and delivery failures are ours to log, not the
    // runner's to retry.
    match state.coordinator.handle_callback(&result).await {
        Ok(outcome) => (StatusCode::OK, Json(json!({ "outcome": outcome }))),
        Err(err) => {
            error!(
                correlation_id = %result.correlation_id,
                error = %err,
                "Callback processing failed"
            );
            (
                StatusCode::OK,
                Json(json!({ "outcome": "delivery-failed" })),
            )
        }
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_accepts_snake_case() {
        let payload: CallbackPayload = serde_json::from_value(json!({
            "correlation_id": "req-1",
            "success": true,
            "output": "done",
            "duration_secs": 1.5,
            "exit_code": 0
        }))
        .unwrap();
        let result = CallbackResult::from(payload);
        assert_eq!(result.correlation_id, "req-1");
        assert!(result.success);
        assert_eq!(result.output, "done");
        assert_eq!(result.duration_secs, Some(1.5));
        assert_eq!(result.exit_code, Some(0));
    }

    #[test]
    fn payload_accepts_camel_case_aliases() {
        let payload: CallbackPayload = serde_json::from_value(json!({
            "correlationId": "req-2",
            "success": false,
            "errorMessage": "disk full",
            "durationSecs": 0.2,
            "exitCode": 1
        }))
        .unwrap();
        let result = CallbackResult::from(payload);
        assert_eq!(result.correlation_id, "req-2");
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("disk full"));
        assert_eq!(result.exit_code, Some(1));
    }

    #[test]
    fn payload_without_correlation_id_is_rejected() {
        let parsed: Result<CallbackPayload, _> =
            serde_json::from_value(json!({ "success": true }));
        assert!(parsed.is_err());
    }
}
