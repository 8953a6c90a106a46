mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use serde_json::{json, Value as JsonValue};
use tower::ServiceExt;

use common::{capture_completed_event, webhook_headers, Harness};
use storefront_reconciler::api;
use storefront_reconciler::cache::keys::webhook::EventKey;
use storefront_reconciler::cache::IdempotencyCache;
use storefront_reconciler::database::entities::{OrderStatus, PaymentStatus};

fn app(h: &Harness) -> Router {
    api::router(h.webhooks.clone(), h.checkout.clone())
}

fn webhook_request(headers: &[(String, String)], body: &JsonValue) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhooks/paypal")
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, JsonValue) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn pending_checkout(h: &Harness) -> i64 {
    h.seed_order(1, Duration::minutes(1)).await;
    h.checkout
        .create_checkout(Harness::checkout_request(1, None))
        .await
        .unwrap()
        .payment_id
}

#[tokio::test]
async fn health_reports_healthy() {
    let h = Harness::new();
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(app(&h), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn capture_webhook_pays_the_order_then_dedupes() {
    let h = Harness::new();
    let pid = pending_checkout(&h).await;
    let event = capture_completed_event("WH-1", &format!("PAY-{pid}"), Utc::now());
    let headers = webhook_headers("TX-1");

    let (status, body) = send(app(&h), webhook_request(&headers, &event)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "processed");
    assert_eq!(h.ledger.attempt(pid).await.unwrap().status, PaymentStatus::Success);
    assert_eq!(h.ledger.order(1).await.unwrap().status, OrderStatus::Paid);

    let (status, body) = send(app(&h), webhook_request(&headers, &event)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "duplicate");
}

#[tokio::test]
async fn missing_headers_are_rejected() {
    let h = Harness::new();
    let event = capture_completed_event("WH-1", "PAY-1", Utc::now());
    let headers = webhook_headers("TX-1")
        .into_iter()
        .filter(|(name, _)| name != "paypal-transmission-sig")
        .collect::<Vec<_>>();

    let (status, body) = send(app(&h), webhook_request(&headers, &event)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["retryable"], false);
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let h = Harness::new();
    let mut request = webhook_request(&webhook_headers("TX-1"), &json!({}));
    *request.body_mut() = Body::from("not json");
    let (status, _) = send(app(&h), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn bad_signature_is_unauthorized() {
    let h = Harness::new();
    let pid = pending_checkout(&h).await;
    *h.gateway.reject_signatures.lock().unwrap() = true;
    let event = capture_completed_event("WH-1", &format!("PAY-{pid}"), Utc::now());

    let (status, _) = send(app(&h), webhook_request(&webhook_headers("TX-1"), &event)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(h.ledger.attempt(pid).await.unwrap().status, PaymentStatus::Pending);

    // A rejected delivery leaves no dedupe key behind.
    let key = EventKey::paypal("TX-1", "WH-1").to_string();
    assert_eq!(h.cache.get(&key).await.unwrap(), None);
}

#[tokio::test]
async fn stale_transmission_time_is_unauthorized() {
    let h = Harness::new();
    let event = capture_completed_event("WH-1", "PAY-1", Utc::now());
    let headers = webhook_headers("TX-1")
        .into_iter()
        .map(|(name, value)| {
            if name == "paypal-transmission-time" {
                (name, (Utc::now() - Duration::minutes(30)).to_rfc3339())
            } else {
                (name, value)
            }
        })
        .collect::<Vec<_>>();

    let (status, _) = send(app(&h), webhook_request(&headers, &event)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_gateway_order_is_acknowledged_as_ignored() {
    let h = Harness::new();
    let event = capture_completed_event("WH-1", "PAY-UNKNOWN", Utc::now());
    let (status, body) = send(app(&h), webhook_request(&webhook_headers("TX-1"), &event)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");
}

#[tokio::test]
async fn unhandled_event_type_is_ignored() {
    let h = Harness::new();
    let event = json!({
        "id": "WH-9",
        "event_type": "CUSTOMER.DISPUTE.CREATED",
        "resource": { "id": "PP-D-1" }
    });
    let (status, body) = send(app(&h), webhook_request(&webhook_headers("TX-9"), &event)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");
}

#[tokio::test]
async fn delivery_in_flight_asks_for_redelivery() {
    let h = Harness::new();
    let pid = pending_checkout(&h).await;
    let key = EventKey::paypal("TX-1", "WH-1").to_string();
    assert!(h
        .cache
        .set_if_absent(&key, "processing", std::time::Duration::from_secs(300))
        .await
        .unwrap());

    let event = capture_completed_event("WH-1", &format!("PAY-{pid}"), Utc::now());
    let (status, body) = send(app(&h), webhook_request(&webhook_headers("TX-1"), &event)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["retryable"], true);
    assert_eq!(h.ledger.attempt(pid).await.unwrap().status, PaymentStatus::Pending);
}

#[tokio::test]
async fn approved_order_webhook_captures() {
    let h = Harness::new();
    let pid = pending_checkout(&h).await;
    let event = json!({
        "id": "WH-A",
        "event_type": "CHECKOUT.ORDER.APPROVED",
        "resource": { "id": format!("PAY-{pid}"), "status": "APPROVED" }
    });

    let (status, body) = send(app(&h), webhook_request(&webhook_headers("TX-A"), &event)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "processed");
    assert!(h.gateway.calls().contains(&format!("capture:ppcap-{pid}")));
    assert_eq!(h.ledger.order(1).await.unwrap().status, OrderStatus::Paid);
}
