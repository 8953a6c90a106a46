mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Duration;
use serde_json::{json, Value as JsonValue};
use tower::ServiceExt;

use common::{Harness, USER_ID};
use storefront_reconciler::api;
use storefront_reconciler::database::entities::{OrderStatus, PaymentStatus};

fn app(h: &Harness) -> Router {
    api::router(h.webhooks.clone(), h.checkout.clone())
}

fn post(uri: &str, user_id: Option<i64>, body: Option<JsonValue>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(user_id) = user_id {
        builder = builder.header("x-user-id", user_id.to_string());
    }
    let body = body.map(|b| serde_json::to_vec(&b).unwrap()).unwrap_or_default();
    builder.body(Body::from(body)).unwrap()
}

fn checkout_body(order_id: i64) -> JsonValue {
    json!({
        "order_id": order_id,
        "return_url": "https://shop.test/return",
        "cancel_url": "https://shop.test/cancel"
    })
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, JsonValue) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(JsonValue::Null))
}

#[tokio::test]
async fn checkout_and_capture_over_http() {
    let h = Harness::new();
    h.seed_order(1, Duration::minutes(1)).await;

    let (status, body) = send(
        app(&h),
        post("/payments/paypal/checkout", Some(USER_ID), Some(checkout_body(1))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "PENDING");
    let pid = body["payment_id"].as_i64().unwrap();
    assert_eq!(body["external_id"], format!("PAY-{pid}"));

    let (status, body) = send(
        app(&h),
        post(&format!("/payments/paypal/{pid}/capture"), Some(USER_ID), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "SUCCESS");
    assert_eq!(h.ledger.order(1).await.unwrap().status, OrderStatus::Paid);
}

#[tokio::test]
async fn idempotency_header_returns_the_same_checkout() {
    let h = Harness::new();
    h.seed_order(1, Duration::minutes(1)).await;
    let request = || {
        let mut req = post("/payments/paypal/checkout", Some(USER_ID), Some(checkout_body(1)));
        req.headers_mut()
            .insert("idempotency-key", "cart-42".parse().unwrap());
        req
    };

    let (_, first) = send(app(&h), request()).await;
    let (status, second) = send(app(&h), request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["payment_id"], second["payment_id"]);
    assert_eq!(second["reused"], true);
}

#[tokio::test]
async fn capture_after_cancel_is_a_conflict() {
    let h = Harness::new();
    h.seed_order(1, Duration::minutes(1)).await;
    let pid = h
        .checkout
        .create_checkout(Harness::checkout_request(1, None))
        .await
        .unwrap()
        .payment_id;

    let (status, body) = send(
        app(&h),
        post(&format!("/payments/paypal/{pid}/cancel"), Some(USER_ID), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "CLOSED");

    let (status, body) = send(
        app(&h),
        post(&format!("/payments/paypal/{pid}/capture"), Some(USER_ID), None),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "CONFLICT");
    assert_eq!(body["retryable"], true);
    assert!(!h.gateway.calls().iter().any(|c| c.starts_with("capture:")));
    assert_eq!(h.ledger.attempt(pid).await.unwrap().status, PaymentStatus::Closed);
}

#[tokio::test]
async fn missing_caller_is_a_bad_request() {
    let h = Harness::new();
    h.seed_order(1, Duration::minutes(1)).await;

    let (status, body) = send(
        app(&h),
        post("/payments/paypal/checkout", None, Some(checkout_body(1))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ILLEGAL_PARAM");
    assert!(h.ledger.attempts_for_order(1).await.is_empty());
}

#[tokio::test]
async fn other_users_payment_is_not_found() {
    let h = Harness::new();
    h.seed_order(1, Duration::minutes(1)).await;
    let pid = h
        .checkout
        .create_checkout(Harness::checkout_request(1, None))
        .await
        .unwrap()
        .payment_id;

    let (status, body) = send(
        app(&h),
        post(&format!("/payments/paypal/{pid}/cancel"), Some(USER_ID + 1), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NOT_FOUND");
    assert_eq!(h.ledger.attempt(pid).await.unwrap().status, PaymentStatus::Pending);
}
