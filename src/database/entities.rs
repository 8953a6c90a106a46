//! Persisted rows consumed and produced by the reconciliation core.
//!
//! Status columns are stored as upper-case text; every enum here round-trips
//! through `as_str` / `FromStr` so both storage adapters share one mapping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

/// Returned when a stored status string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

text_enum!(
    /// Order lifecycle owned by the order bounded context.
    OrderStatus, "order status" {
        Created => "CREATED",
        PendingPayment => "PENDING_PAYMENT",
        Paid => "PAID",
        Cancelled => "CANCELLED",
        Closed => "CLOSED",
        Refunding => "REFUNDING",
        Refunded => "REFUNDED",
    }
);

text_enum!(
    /// Payment attempt status, mirrored onto `orders.pay_status` for display.
    PaymentStatus, "payment status" {
        None => "NONE",
        Init => "INIT",
        Pending => "PENDING",
        Success => "SUCCESS",
        Fail => "FAIL",
        Exception => "EXCEPTION",
        Closed => "CLOSED",
    }
);

text_enum!(
    PaymentChannel, "payment channel" {
        None => "NONE",
        Paypal => "PAYPAL",
    }
);

text_enum!(
    RefundStatus, "refund status" {
        Init => "INIT",
        Pending => "PENDING",
        Success => "SUCCESS",
        Fail => "FAIL",
    }
);

text_enum!(
    RefundReasonCode, "refund reason" {
        CustomerRequest => "CUSTOMER_REQUEST",
        Exception => "EXCEPTION",
        Other => "OTHER",
    }
);

text_enum!(
    RefundInitiator, "refund initiator" {
        User => "USER",
        Admin => "ADMIN",
        System => "SYSTEM",
    }
);

text_enum!(
    /// Which trigger produced a status-log entry.
    EventSource, "event source" {
        User => "USER",
        PaymentCallback => "PAYMENT_CALLBACK",
        Scheduler => "SCHEDULER",
        System => "SYSTEM",
        Admin => "ADMIN",
    }
);

/// Attempt statuses that may still be driven by the gateway.
pub const OPEN_PAYMENT_STATUSES: [PaymentStatus; 2] = [PaymentStatus::Init, PaymentStatus::Pending];

/// Order statuses from which a capture may still advance the order to PAID.
pub const PAYABLE_ORDER_STATUSES: [OrderStatus; 2] =
    [OrderStatus::Created, OrderStatus::PendingPayment];

impl PaymentStatus {
    pub fn is_open(&self) -> bool {
        OPEN_PAYMENT_STATUSES.contains(self)
    }
}

impl RefundStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Init | Self::Pending)
    }

    pub fn is_final(&self) -> bool {
        !self.is_open()
    }
}

/// Order row as seen by the payment core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub order_no: String,
    pub user_id: i64,
    pub status: OrderStatus,
    pub pay_channel: PaymentChannel,
    pub pay_status: PaymentStatus,
    pub payment_external_id: Option<String>,
    pub active_payment_id: Option<i64>,
    pub pay_amount_minor: i64,
    pub currency: String,
    pub pay_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Status allows payment and no attempt has succeeded yet.
    pub fn is_payable(&self) -> bool {
        PAYABLE_ORDER_STATUSES.contains(&self.status) && self.pay_status != PaymentStatus::Success
    }

    pub fn is_closed_or_cancelled(&self) -> bool {
        matches!(self.status, OrderStatus::Closed | OrderStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub id: i64,
    pub order_id: i64,
    pub channel: PaymentChannel,
    pub status: PaymentStatus,
    pub external_id: Option<String>,
    pub capture_id: Option<String>,
    pub amount_minor: i64,
    pub currency: String,
    pub request_payload: Option<JsonValue>,
    pub response_payload: Option<JsonValue>,
    pub notify_payload: Option<JsonValue>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentAttempt {
    pub fn is_placeholder(&self) -> bool {
        self.channel == PaymentChannel::None && self.status == PaymentStatus::None
    }

    pub fn external_id(&self) -> Option<&str> {
        non_blank(self.external_id.as_deref())
    }

    pub fn capture_id(&self) -> Option<&str> {
        non_blank(self.capture_id.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPaymentAttempt {
    pub order_id: i64,
    pub channel: PaymentChannel,
    pub status: PaymentStatus,
    pub amount_minor: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundAttempt {
    pub id: i64,
    pub refund_no: String,
    pub order_id: i64,
    pub payment_attempt_id: i64,
    pub external_refund_id: Option<String>,
    pub client_dedupe_key: Option<String>,
    pub amount_minor: i64,
    pub currency: String,
    pub status: RefundStatus,
    pub reason_code: RefundReasonCode,
    pub initiator: RefundInitiator,
    pub request_payload: Option<JsonValue>,
    pub response_payload: Option<JsonValue>,
    pub notify_payload: Option<JsonValue>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RefundAttempt {
    pub fn external_refund_id(&self) -> Option<&str> {
        non_blank(self.external_refund_id.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRefundAttempt {
    pub refund_no: String,
    pub order_id: i64,
    pub payment_attempt_id: i64,
    pub external_refund_id: Option<String>,
    pub client_dedupe_key: Option<String>,
    pub amount_minor: i64,
    pub currency: String,
    pub status: RefundStatus,
    pub reason_code: RefundReasonCode,
    pub initiator: RefundInitiator,
    pub request_payload: Option<JsonValue>,
    pub response_payload: Option<JsonValue>,
    pub notify_payload: Option<JsonValue>,
    pub last_notified_at: Option<DateTime<Utc>>,
}

impl NewRefundAttempt {
    /// Generates a merchant-side refund number.
    pub fn generate_refund_no() -> String {
        format!("RF{}", uuid::Uuid::new_v4().simple()).to_uppercase()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusLogEntry {
    pub id: i64,
    pub order_id: i64,
    pub source: EventSource,
    pub from_status: Option<OrderStatus>,
    pub to_status: OrderStatus,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewStatusLog {
    pub order_id: i64,
    pub source: EventSource,
    pub from_status: Option<OrderStatus>,
    pub to_status: OrderStatus,
    pub note: Option<String>,
}

/// Deterministic refund dedupe keys: `ppref-{paymentAttemptId}-{scope}-{key}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundDedupeKey(String);

impl RefundDedupeKey {
    pub const PREFIX: &'static str = "ppref";

    pub fn new(payment_attempt_id: i64, scope: &str, key: &str) -> Self {
        Self(format!(
            "{}-{}-{}-{}",
            Self::PREFIX,
            payment_attempt_id,
            scope.trim(),
            key.trim()
        ))
    }

    /// Key for a refund first seen through a gateway notification.
    pub fn webhook(payment_attempt_id: i64, external_refund_id: &str) -> Self {
        Self::new(payment_attempt_id, "webhook", external_refund_id)
    }

    /// Key for the system refund of a capture that could not close the sale.
    pub fn auto_capture(payment_attempt_id: i64) -> Self {
        Self::new(payment_attempt_id, "auto", "capture")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RefundDedupeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Treats `null`, blank strings and `{}` as absent audit payloads.
pub fn meaningful_payload(payload: Option<&JsonValue>) -> Option<&JsonValue> {
    match payload {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::Object(map)) if map.is_empty() => None,
        Some(JsonValue::String(s)) if s.trim().is_empty() || s.trim() == "{}" => None,
        Some(other) => Some(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_text_round_trips_case_insensitively() {
        assert_eq!(
            "pending_payment".parse::<OrderStatus>().unwrap(),
            OrderStatus::PendingPayment
        );
        assert_eq!(PaymentStatus::Exception.as_str(), "EXCEPTION");
        assert!("BOGUS".parse::<RefundStatus>().is_err());
    }

    #[test]
    fn serde_uses_stored_spelling() {
        let json = serde_json::to_string(&OrderStatus::PendingPayment).unwrap();
        assert_eq!(json, "\"PENDING_PAYMENT\"");
    }

    #[test]
    fn dedupe_keys_are_deterministic() {
        assert_eq!(
            RefundDedupeKey::webhook(42, "RF-9").as_str(),
            "ppref-42-webhook-RF-9"
        );
        assert_eq!(
            RefundDedupeKey::auto_capture(42).as_str(),
            "ppref-42-auto-capture"
        );
    }

    #[test]
    fn empty_payloads_are_not_meaningful() {
        assert!(meaningful_payload(None).is_none());
        assert!(meaningful_payload(Some(&json!({}))).is_none());
        assert!(meaningful_payload(Some(&json!("  {} "))).is_none());
        assert!(meaningful_payload(Some(&json!({"id": "X"}))).is_some());
    }

    #[test]
    fn refund_numbers_are_prefixed() {
        let no = NewRefundAttempt::generate_refund_no();
        assert!(no.starts_with("RF"));
        assert_eq!(no.len(), 34);
    }
}
