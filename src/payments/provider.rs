use crate::database::entities::PaymentChannel;
use crate::payments::error::PaymentResult;
use crate::payments::types::{
    CaptureRequest, CreateRemoteOrderRequest, GatewayOrder, GatewayRefund, RefundRequest,
    RemoteOrder, WebhookEvent, WebhookHeaders,
};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

/// Idempotency key for creating the remote order of an attempt.
pub fn create_order_idempotency_key(payment_id: i64) -> String {
    format!("ppco-{}", payment_id)
}

/// Idempotency key for capturing the remote order of an attempt.
pub fn capture_idempotency_key(payment_id: i64) -> String {
    format!("ppcap-{}", payment_id)
}

/// Synchronous calls into the payment provider.
///
/// Every call is retryable; implementations bound their own timeouts and map
/// transport failures to [`crate::payments::error::PaymentError`].
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn channel(&self) -> PaymentChannel;

    async fn create_remote_order(
        &self,
        request: CreateRemoteOrderRequest,
    ) -> PaymentResult<RemoteOrder>;

    async fn capture(&self, request: CaptureRequest) -> PaymentResult<GatewayOrder>;

    async fn get_order_status(&self, external_id: &str) -> PaymentResult<GatewayOrder>;

    async fn create_refund(&self, request: RefundRequest) -> PaymentResult<GatewayRefund>;

    async fn get_refund_status(&self, external_refund_id: &str) -> PaymentResult<GatewayRefund>;

    /// Asks the provider whether the notification was signed by it.
    async fn verify_webhook(
        &self,
        headers: &WebhookHeaders,
        event: &JsonValue,
    ) -> PaymentResult<bool>;

    fn parse_webhook_event(&self, event: &JsonValue) -> PaymentResult<WebhookEvent>;

    /// Buyer approval link stored in a create-order response, if any.
    fn approve_url(&self, _response_payload: &JsonValue) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_keys_are_derived_from_payment_id() {
        assert_eq!(create_order_idempotency_key(12), "ppco-12");
        assert_eq!(capture_idempotency_key(12), "ppcap-12");
    }
}
