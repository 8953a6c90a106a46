//! HTTP surface: buyer payment actions, the gateway webhook endpoint and a
//! health check.

pub mod payments;
pub mod webhooks;

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::services::checkout::CheckoutService;
use crate::services::webhook_processor::WebhookProcessor;
use payments::PaymentState;
use webhooks::WebhookState;

pub fn router(processor: Arc<WebhookProcessor>, checkout: Arc<CheckoutService>) -> Router {
    let payment_routes = Router::new()
        .route("/payments/paypal/checkout", post(payments::create_checkout))
        .route("/payments/paypal/{payment_id}/capture", post(payments::capture_payment))
        .route("/payments/paypal/{payment_id}/cancel", post(payments::cancel_payment))
        .with_state(Arc::new(PaymentState { checkout }));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/paypal", post(webhooks::handle_paypal_webhook))
        .with_state(Arc::new(WebhookState { processor }))
        .merge(payment_routes)
        .layer(TraceLayer::new_for_http())
}

/// GET /health
async fn health() -> Json<JsonValue> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
