use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::database::entities::PaymentChannel;
use crate::error::AppError;
use crate::services::checkout::{CheckoutRequest, CheckoutResponse, CheckoutService};
use crate::services::reconciliation_engine::PaymentResultView;

/// Caller identity set by the storefront gateway in front of this service.
pub const USER_ID_HEADER: &str = "x-user-id";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

pub struct PaymentState {
    pub checkout: Arc<CheckoutService>,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutBody {
    pub order_id: i64,
    pub return_url: String,
    pub cancel_url: String,
    #[serde(default)]
    pub locale: Option<String>,
}

fn caller(headers: &HeaderMap) -> Result<i64, AppError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|id| *id > 0)
        .ok_or_else(|| AppError::illegal_param(USER_ID_HEADER, "missing or invalid caller id"))
}

/// POST /payments/paypal/checkout
pub async fn create_checkout(
    State(state): State<Arc<PaymentState>>,
    headers: HeaderMap,
    Json(body): Json<CheckoutBody>,
) -> Result<Json<CheckoutResponse>, AppError> {
    let user_id = caller(&headers)?;
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let response = state
        .checkout
        .create_checkout(CheckoutRequest {
            user_id,
            order_id: body.order_id,
            channel: PaymentChannel::Paypal,
            return_url: body.return_url,
            cancel_url: body.cancel_url,
            locale: body.locale,
            idempotency_key,
        })
        .await?;
    Ok(Json(response))
}

/// POST /payments/paypal/{payment_id}/capture
pub async fn capture_payment(
    State(state): State<Arc<PaymentState>>,
    headers: HeaderMap,
    Path(payment_id): Path<i64>,
) -> Result<Json<PaymentResultView>, AppError> {
    let user_id = caller(&headers)?;
    Ok(Json(state.checkout.capture_payment(user_id, payment_id).await?))
}

/// POST /payments/paypal/{payment_id}/cancel
pub async fn cancel_payment(
    State(state): State<Arc<PaymentState>>,
    headers: HeaderMap,
    Path(payment_id): Path<i64>,
) -> Result<Json<PaymentResultView>, AppError> {
    let user_id = caller(&headers)?;
    Ok(Json(state.checkout.cancel_payment(user_id, payment_id).await?))
}
