use crate::database::entities::RefundStatus;
use crate::payments::error::{PaymentError, PaymentResult};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;

/// Number of minor-unit digits for an ISO 4217 currency.
pub fn currency_exponent(currency: &str) -> u32 {
    match currency.trim().to_ascii_uppercase().as_str() {
        "BIF" | "CLP" | "DJF" | "GNF" | "HUF" | "ISK" | "JPY" | "KMF" | "KRW" | "PYG" | "RWF"
        | "TWD" | "UGX" | "VND" | "VUV" | "XAF" | "XOF" | "XPF" => 0,
        "BHD" | "IQD" | "JOD" | "KWD" | "LYD" | "OMR" | "TND" => 3,
        _ => 2,
    }
}

/// Amount held in minor units; the gateway speaks decimal strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Money {
    pub amount_minor: i64,
    pub currency: String,
}

impl Money {
    pub fn new(amount_minor: i64, currency: impl Into<String>) -> Self {
        Self {
            amount_minor,
            currency: currency.into().to_ascii_uppercase(),
        }
    }

    /// `1000 USD` renders as `"10.00"`.
    pub fn to_decimal_string(&self) -> String {
        Decimal::new(self.amount_minor, currency_exponent(&self.currency)).to_string()
    }

    /// Parses a gateway decimal amount, rounding to the currency's minor unit.
    pub fn from_decimal_str(value: &str, currency: &str) -> PaymentResult<Self> {
        let invalid = || PaymentError::ValidationError {
            message: format!("invalid decimal amount: {}", value),
            field: Some("amount".to_string()),
        };
        let decimal = Decimal::from_str(value.trim()).map_err(|_| invalid())?;
        let scaled = decimal
            .checked_mul(Decimal::from(10_i64.pow(currency_exponent(currency))))
            .ok_or_else(invalid)?;
        let minor = scaled
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .ok_or_else(invalid)?;
        Ok(Self::new(minor, currency))
    }

    pub fn validate_positive(&self, field: &str) -> PaymentResult<()> {
        if self.amount_minor <= 0 {
            return Err(PaymentError::ValidationError {
                message: "amount must be greater than zero".to_string(),
                field: Some(field.to_string()),
            });
        }
        if self.currency.trim().len() != 3 {
            return Err(PaymentError::ValidationError {
                message: format!("invalid currency code: {}", self.currency),
                field: Some("currency".to_string()),
            });
        }
        Ok(())
    }
}

/// Remote order status as reported by the gateway.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteOrderStatus {
    Created,
    Saved,
    Approved,
    Voided,
    Completed,
    PayerActionRequired,
    Unknown,
}

impl RemoteOrderStatus {
    pub fn from_provider(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_uppercase()).as_deref() {
            Some("CREATED") => Self::Created,
            Some("SAVED") => Self::Saved,
            Some("APPROVED") => Self::Approved,
            Some("VOIDED") => Self::Voided,
            Some("COMPLETED") => Self::Completed,
            Some("PAYER_ACTION_REQUIRED") => Self::PayerActionRequired,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaptureStatus {
    Completed,
    Declined,
    Failed,
    Pending,
    PartiallyRefunded,
    Refunded,
    Unknown,
}

impl CaptureStatus {
    pub fn from_provider(value: Option<&str>) -> Option<Self> {
        let value = value.map(str::trim).filter(|v| !v.is_empty())?;
        Some(match value.to_ascii_uppercase().as_str() {
            "COMPLETED" => Self::Completed,
            "DECLINED" => Self::Declined,
            "FAILED" => Self::Failed,
            "PENDING" => Self::Pending,
            "PARTIALLY_REFUNDED" => Self::PartiallyRefunded,
            "REFUNDED" => Self::Refunded,
            _ => Self::Unknown,
        })
    }

    /// Statuses that must not be applied as a capture outcome.
    pub fn defers_to_other_flows(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Refunded | Self::PartiallyRefunded | Self::Unknown
        )
    }

    pub fn is_success(&self) -> bool {
        *self == Self::Completed
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayRefundStatus {
    Completed,
    Pending,
    Failed,
    Cancelled,
    Unknown,
}

impl GatewayRefundStatus {
    pub fn from_provider(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_uppercase()).as_deref() {
            Some("COMPLETED") => Self::Completed,
            Some("PENDING") => Self::Pending,
            Some("FAILED") => Self::Failed,
            Some("CANCELLED") => Self::Cancelled,
            _ => Self::Unknown,
        }
    }

    pub fn to_refund_status(self) -> RefundStatus {
        match self {
            Self::Completed => RefundStatus::Success,
            Self::Pending | Self::Unknown => RefundStatus::Pending,
            Self::Failed | Self::Cancelled => RefundStatus::Fail,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRemoteOrderRequest {
    pub idempotency_key: String,
    pub payment_id: i64,
    pub order_no: String,
    pub amount: Money,
    pub return_url: String,
    pub cancel_url: String,
    pub locale: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteOrder {
    pub external_id: String,
    pub approve_url: Option<String>,
    pub request_payload: Option<JsonValue>,
    pub response_payload: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub idempotency_key: String,
    pub external_id: String,
    pub note: Option<String>,
}

/// Gateway view of a remote order, returned by capture and status polls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub external_id: String,
    pub order_status: RemoteOrderStatus,
    pub capture_status: Option<CaptureStatus>,
    pub capture_id: Option<String>,
    pub capture_time: Option<DateTime<Utc>>,
    pub approve_url: Option<String>,
    pub request_payload: Option<JsonValue>,
    pub response_payload: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    pub idempotency_key: String,
    pub capture_id: String,
    pub amount: Money,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRefund {
    pub external_refund_id: Option<String>,
    pub status: GatewayRefundStatus,
    pub request_payload: Option<JsonValue>,
    pub response_payload: Option<JsonValue>,
}

/// Transmission headers that take part in webhook signature verification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookHeaders {
    pub auth_algo: String,
    pub cert_url: String,
    pub transmission_id: String,
    pub transmission_sig: String,
    pub transmission_time: String,
}

impl WebhookHeaders {
    /// Collects the transmission headers, matching names case-insensitively.
    pub fn from_pairs<'a, I>(pairs: I) -> PaymentResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut found: [Option<String>; 5] = Default::default();
        const NAMES: [&str; 5] = [
            "PAYPAL-AUTH-ALGO",
            "PAYPAL-CERT-URL",
            "PAYPAL-TRANSMISSION-ID",
            "PAYPAL-TRANSMISSION-SIG",
            "PAYPAL-TRANSMISSION-TIME",
        ];
        for (name, value) in pairs {
            let upper = name.trim().to_ascii_uppercase();
            if let Some(i) = NAMES.iter().position(|n| *n == upper) {
                let value = value.trim();
                if !value.is_empty() {
                    found[i] = Some(value.to_string());
                }
            }
        }
        let [auth_algo, cert_url, transmission_id, transmission_sig, transmission_time] = found;
        let require = |value: Option<String>, name: &str| {
            value.ok_or_else(|| PaymentError::ValidationError {
                message: format!("missing webhook header {}", name),
                field: Some(name.to_string()),
            })
        };
        Ok(Self {
            auth_algo: require(auth_algo, NAMES[0])?,
            cert_url: require(cert_url, NAMES[1])?,
            transmission_id: require(transmission_id, NAMES[2])?,
            transmission_sig: require(transmission_sig, NAMES[3])?,
            transmission_time: require(transmission_time, NAMES[4])?,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventKind {
    OrderApproved,
    CaptureCompleted,
    CaptureDeclined,
    CaptureRefunded,
    Other,
}

impl WebhookEventKind {
    pub fn from_event_type(event_type: &str) -> Self {
        match event_type.trim().to_ascii_uppercase().as_str() {
            "CHECKOUT.ORDER.APPROVED" => Self::OrderApproved,
            "PAYMENT.CAPTURE.COMPLETED" => Self::CaptureCompleted,
            "PAYMENT.CAPTURE.DECLINED" | "PAYMENT.CAPTURE.DENIED" => Self::CaptureDeclined,
            "PAYMENT.CAPTURE.REFUNDED" | "PAYMENT.CAPTURE.REVERSED" => Self::CaptureRefunded,
            _ => Self::Other,
        }
    }
}

/// Decimal amount exactly as the gateway sent it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecimalAmount {
    pub value: String,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_id: String,
    pub event_type: String,
    pub kind: WebhookEventKind,
    /// Gateway order id the event belongs to, when the event carries one.
    pub external_order_id: Option<String>,
    pub resource_id: Option<String>,
    pub resource_status: Option<String>,
    pub resource_amount: Option<DecimalAmount>,
    pub resource_time: Option<DateTime<Utc>>,
    pub payload: JsonValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_renders_with_currency_exponent() {
        assert_eq!(Money::new(1000, "usd").to_decimal_string(), "10.00");
        assert_eq!(Money::new(1500, "JPY").to_decimal_string(), "1500");
        assert_eq!(Money::new(12345, "KWD").to_decimal_string(), "12.345");
    }

    #[test]
    fn money_parses_decimal_strings() {
        assert_eq!(Money::from_decimal_str("10.00", "USD").unwrap().amount_minor, 1000);
        assert_eq!(Money::from_decimal_str("7.5", "USD").unwrap().amount_minor, 750);
        assert_eq!(Money::from_decimal_str("1500", "JPY").unwrap().amount_minor, 1500);
        assert!(Money::from_decimal_str("ten", "USD").is_err());
    }

    #[test]
    fn oversized_amounts_are_rejected() {
        assert!(Money::from_decimal_str("79228162514264337593543950335", "USD").is_err());
        assert!(Money::from_decimal_str("100000000000000000000", "USD").is_err());
    }

    #[test]
    fn refund_status_mapping() {
        assert_eq!(
            GatewayRefundStatus::from_provider(Some("completed")).to_refund_status(),
            RefundStatus::Success
        );
        assert_eq!(
            GatewayRefundStatus::from_provider(None).to_refund_status(),
            RefundStatus::Pending
        );
        assert_eq!(
            GatewayRefundStatus::from_provider(Some("CANCELLED")).to_refund_status(),
            RefundStatus::Fail
        );
    }

    #[test]
    fn capture_status_parsing() {
        assert_eq!(CaptureStatus::from_provider(Some("")), None);
        assert_eq!(
            CaptureStatus::from_provider(Some("partially_refunded")),
            Some(CaptureStatus::PartiallyRefunded)
        );
        assert!(CaptureStatus::Pending.defers_to_other_flows());
        assert!(!CaptureStatus::Declined.defers_to_other_flows());
    }

    #[test]
    fn event_kinds_cover_subscribed_types() {
        assert_eq!(
            WebhookEventKind::from_event_type("payment.capture.denied"),
            WebhookEventKind::CaptureDeclined
        );
        assert_eq!(
            WebhookEventKind::from_event_type("PAYMENT.CAPTURE.REVERSED"),
            WebhookEventKind::CaptureRefunded
        );
        assert_eq!(
            WebhookEventKind::from_event_type("BILLING.PLAN.CREATED"),
            WebhookEventKind::Other
        );
    }

    #[test]
    fn webhook_headers_are_case_insensitive() {
        let headers = WebhookHeaders::from_pairs([
            ("paypal-auth-algo", "SHA256withRSA"),
            ("PayPal-Cert-Url", "https://api.paypal.com/cert"),
            ("paypal-transmission-id", "tx-1"),
            ("paypal-transmission-sig", "sig"),
            ("paypal-transmission-time", "2026-10-19T10:00:00Z"),
        ])
        .unwrap();
        assert_eq!(headers.transmission_id, "tx-1");

        let missing = WebhookHeaders::from_pairs([("paypal-auth-algo", "x")]);
        assert!(missing.is_err());
    }
}
