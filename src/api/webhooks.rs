use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::ErrorCode;
use crate::middleware::error::ErrorResponse;
use crate::services::webhook_processor::{WebhookOutcome, WebhookProcessor, WebhookProcessorError};

pub struct WebhookState {
    pub processor: Arc<WebhookProcessor>,
}

/// POST /webhooks/paypal
pub async fn handle_paypal_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let pairs: Vec<(&str, &str)> = headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
        .collect();

    match state.processor.process_webhook(pairs, &body).await {
        Ok(outcome) => {
            let status = match outcome {
                WebhookOutcome::Processed => "processed",
                WebhookOutcome::Duplicate => "duplicate",
                WebhookOutcome::Ignored => "ignored",
            };
            info!(status, "Webhook acknowledged");
            (StatusCode::OK, Json(json!({ "status": status }))).into_response()
        }
        Err(e) => rejection(e),
    }
}

fn rejection(err: WebhookProcessorError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = match &err {
        WebhookProcessorError::Processing(app) => ErrorResponse::from_app_error(app),
        WebhookProcessorError::Malformed(message) => {
            ErrorResponse::new(ErrorCode::IllegalParam, message.clone(), false)
        }
        WebhookProcessorError::InvalidSignature(_) => {
            ErrorResponse::new(ErrorCode::IllegalParam, "Invalid webhook signature", false)
        }
        WebhookProcessorError::InFlight => {
            ErrorResponse::new(ErrorCode::Conflict, err.to_string(), true)
        }
        WebhookProcessorError::Cache(_) => {
            ErrorResponse::new(ErrorCode::CacheError, "Service temporarily unavailable", true)
        }
    };
    if status.is_server_error() {
        error!(error = %err, status = status.as_u16(), "Webhook rejected");
    } else {
        warn!(error = %err, status = status.as_u16(), "Webhook rejected");
    }
    (status, Json(body)).into_response()
}
