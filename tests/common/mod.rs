#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use storefront_reconciler::cache::{DedupeGate, MemoryIdempotencyCache};
use storefront_reconciler::database::entities::{
    Order, OrderStatus, PaymentChannel, PaymentStatus,
};
use storefront_reconciler::database::MemoryLedger;
use storefront_reconciler::payments::error::{PaymentError, PaymentResult};
use storefront_reconciler::payments::provider::PaymentGateway;
use storefront_reconciler::payments::providers::paypal;
use storefront_reconciler::payments::types::{
    CaptureRequest, CaptureStatus, CreateRemoteOrderRequest, GatewayOrder, GatewayRefund,
    GatewayRefundStatus, RefundRequest, RemoteOrder, RemoteOrderStatus, WebhookEvent,
    WebhookHeaders,
};
use storefront_reconciler::services::checkout::{CheckoutRequest, CheckoutService};
use storefront_reconciler::services::payment_sync::{PaymentSyncConfig, PaymentSyncService};
use storefront_reconciler::services::reconciliation_engine::{
    EngineConfig, ReconciliationEngine,
};
use storefront_reconciler::services::webhook_processor::{
    WebhookOutcome, WebhookProcessor, WebhookProcessorConfig, WebhookProcessorError,
};

pub const USER_ID: i64 = 7;

pub fn order(id: i64, created_at: DateTime<Utc>) -> Order {
    Order {
        id,
        order_no: format!("ORD-{id}"),
        user_id: USER_ID,
        status: OrderStatus::Created,
        pay_channel: PaymentChannel::None,
        pay_status: PaymentStatus::None,
        payment_external_id: None,
        active_payment_id: None,
        pay_amount_minor: 1000,
        currency: "USD".to_string(),
        pay_time: None,
        created_at,
        updated_at: created_at,
    }
}

/// Gateway double whose answers are set per external id.
#[derive(Default)]
pub struct ScriptedGateway {
    pub calls: Mutex<Vec<String>>,
    /// Answer to `get_order_status`; a missing entry is a network error.
    pub orders: Mutex<HashMap<String, GatewayOrder>>,
    /// Answer to `capture`; a missing entry captures successfully now.
    pub captures: Mutex<HashMap<String, GatewayOrder>>,
    pub refund_statuses: Mutex<HashMap<String, GatewayRefundStatus>>,
    pub reject_signatures: Mutex<bool>,
    refund_seq: Mutex<u32>,
}

impl ScriptedGateway {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn set_order(&self, order: GatewayOrder) {
        self.orders
            .lock()
            .unwrap()
            .insert(order.external_id.clone(), order);
    }

    pub fn set_capture(&self, order: GatewayOrder) {
        self.captures
            .lock()
            .unwrap()
            .insert(order.external_id.clone(), order);
    }
}

pub fn captured(external_id: &str, status: CaptureStatus, at: DateTime<Utc>) -> GatewayOrder {
    let capture_id = format!("CAP-{external_id}");
    GatewayOrder {
        external_id: external_id.to_string(),
        order_status: RemoteOrderStatus::Completed,
        capture_status: Some(status),
        capture_id: Some(capture_id.clone()),
        capture_time: Some(at),
        approve_url: None,
        request_payload: None,
        response_payload: Some(json!({ "id": external_id, "capture": capture_id })),
    }
}

pub fn uncaptured(external_id: &str, status: RemoteOrderStatus) -> GatewayOrder {
    GatewayOrder {
        external_id: external_id.to_string(),
        order_status: status,
        capture_status: None,
        capture_id: None,
        capture_time: None,
        approve_url: None,
        request_payload: None,
        response_payload: Some(json!({ "id": external_id })),
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    fn channel(&self) -> PaymentChannel {
        PaymentChannel::Paypal
    }

    async fn create_remote_order(
        &self,
        request: CreateRemoteOrderRequest,
    ) -> PaymentResult<RemoteOrder> {
        self.record(format!("create_order:{}", request.idempotency_key));
        let external_id = format!("PAY-{}", request.payment_id);
        let approve = format!("https://paypal.test/approve/{external_id}");
        Ok(RemoteOrder {
            external_id: external_id.clone(),
            approve_url: Some(approve.clone()),
            request_payload: Some(json!({ "amount": request.amount.to_decimal_string() })),
            response_payload: Some(json!({
                "id": external_id,
                "links": [{ "rel": "approve", "href": approve }],
            })),
        })
    }

    async fn capture(&self, request: CaptureRequest) -> PaymentResult<GatewayOrder> {
        self.record(format!("capture:{}", request.idempotency_key));
        let scripted = self
            .captures
            .lock()
            .unwrap()
            .get(&request.external_id)
            .cloned();
        Ok(scripted.unwrap_or_else(|| {
            captured(&request.external_id, CaptureStatus::Completed, Utc::now())
        }))
    }

    async fn get_order_status(&self, external_id: &str) -> PaymentResult<GatewayOrder> {
        self.record(format!("order_status:{external_id}"));
        self.orders
            .lock()
            .unwrap()
            .get(external_id)
            .cloned()
            .ok_or_else(|| PaymentError::NetworkError {
                message: format!("no answer for {external_id}"),
            })
    }

    async fn create_refund(&self, request: RefundRequest) -> PaymentResult<GatewayRefund> {
        self.record(format!("refund:{}", request.idempotency_key));
        let mut seq = self.refund_seq.lock().unwrap();
        *seq += 1;
        Ok(GatewayRefund {
            external_refund_id: Some(format!("RF-{}", *seq)),
            status: GatewayRefundStatus::Completed,
            request_payload: Some(json!({ "capture_id": request.capture_id })),
            response_payload: Some(json!({ "status": "COMPLETED" })),
        })
    }

    async fn get_refund_status(&self, external_refund_id: &str) -> PaymentResult<GatewayRefund> {
        self.record(format!("refund_status:{external_refund_id}"));
        let status = self
            .refund_statuses
            .lock()
            .unwrap()
            .get(external_refund_id)
            .copied()
            .ok_or_else(|| PaymentError::NetworkError {
                message: format!("no answer for {external_refund_id}"),
            })?;
        Ok(GatewayRefund {
            external_refund_id: Some(external_refund_id.to_string()),
            status,
            request_payload: None,
            response_payload: Some(json!({ "id": external_refund_id })),
        })
    }

    async fn verify_webhook(
        &self,
        _headers: &WebhookHeaders,
        _event: &JsonValue,
    ) -> PaymentResult<bool> {
        Ok(!*self.reject_signatures.lock().unwrap())
    }

    fn parse_webhook_event(&self, event: &JsonValue) -> PaymentResult<WebhookEvent> {
        paypal::parse_webhook_event(event)
    }

    fn approve_url(&self, response_payload: &JsonValue) -> Option<String> {
        response_payload
            .pointer("/links/0/href")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
    }
}

pub struct Harness {
    pub ledger: MemoryLedger,
    pub gateway: Arc<ScriptedGateway>,
    pub engine: Arc<ReconciliationEngine>,
    pub sync: Arc<PaymentSyncService>,
    pub checkout: Arc<CheckoutService>,
    pub webhooks: Arc<WebhookProcessor>,
    pub cache: Arc<MemoryIdempotencyCache>,
}

impl Harness {
    pub fn new() -> Self {
        let ledger = MemoryLedger::new();
        let gateway = Arc::new(ScriptedGateway::default());
        let cache = Arc::new(MemoryIdempotencyCache::new());
        let engine = Arc::new(ReconciliationEngine::new(
            Arc::new(ledger.clone()),
            EngineConfig::default(),
        ));
        let sync = Arc::new(PaymentSyncService::new(
            engine.clone(),
            gateway.clone(),
            PaymentSyncConfig::default(),
        ));
        let checkout = Arc::new(CheckoutService::new(
            engine.clone(),
            gateway.clone(),
            sync.clone(),
            DedupeGate::new(
                cache.clone(),
                std::time::Duration::from_secs(600),
                std::time::Duration::from_secs(600),
            ),
        ));
        let webhooks = Arc::new(WebhookProcessor::new(
            gateway.clone(),
            sync.clone(),
            DedupeGate::new(
                cache.clone(),
                std::time::Duration::from_secs(4 * 24 * 3600),
                std::time::Duration::from_secs(300),
            ),
            WebhookProcessorConfig::default(),
        ));
        Self {
            ledger,
            gateway,
            engine,
            sync,
            checkout,
            webhooks,
            cache,
        }
    }

    /// Seeds an order created `age` ago.
    pub async fn seed_order(&self, id: i64, age: Duration) {
        self.ledger.insert_order(order(id, Utc::now() - age)).await;
    }

    pub fn checkout_request(order_id: i64, key: Option<&str>) -> CheckoutRequest {
        CheckoutRequest {
            user_id: USER_ID,
            order_id,
            channel: PaymentChannel::Paypal,
            return_url: "https://shop.test/return".to_string(),
            cancel_url: "https://shop.test/cancel".to_string(),
            locale: None,
            idempotency_key: key.map(str::to_string),
        }
    }
}

impl Harness {
    /// Delivers one signed webhook through the processor.
    pub async fn deliver(
        &self,
        transmission_id: &str,
        event: &JsonValue,
    ) -> Result<WebhookOutcome, WebhookProcessorError> {
        let headers = webhook_headers(transmission_id);
        let body = serde_json::to_vec(event).unwrap();
        self.webhooks
            .process_webhook(
                headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                &body,
            )
            .await
    }
}

pub fn webhook_headers(transmission_id: &str) -> Vec<(String, String)> {
    vec![
        ("paypal-auth-algo".to_string(), "SHA256withRSA".to_string()),
        (
            "paypal-cert-url".to_string(),
            "https://api.paypal.com/v1/notifications/certs/CERT".to_string(),
        ),
        ("paypal-transmission-id".to_string(), transmission_id.to_string()),
        ("paypal-transmission-sig".to_string(), "c2lnbmF0dXJl".to_string()),
        ("paypal-transmission-time".to_string(), Utc::now().to_rfc3339()),
    ]
}

pub fn capture_completed_event(event_id: &str, external_id: &str, at: DateTime<Utc>) -> JsonValue {
    json!({
        "id": event_id,
        "event_type": "PAYMENT.CAPTURE.COMPLETED",
        "resource": {
            "id": format!("CAP-{external_id}"),
            "status": "COMPLETED",
            "update_time": at.to_rfc3339(),
            "supplementary_data": { "related_ids": { "order_id": external_id } }
        }
    })
}

pub fn capture_refunded_event(
    event_id: &str,
    external_id: &str,
    refund_id: &str,
    value: &str,
) -> JsonValue {
    json!({
        "id": event_id,
        "event_type": "PAYMENT.CAPTURE.REFUNDED",
        "resource": {
            "id": refund_id,
            "status": "COMPLETED",
            "amount": { "value": value, "currency_code": "USD" },
            "supplementary_data": { "related_ids": { "order_id": external_id } }
        }
    })
}
