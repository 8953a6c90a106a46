use crate::database::entities::PaymentChannel;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentGateway;
use crate::payments::types::{
    CaptureRequest, CaptureStatus, CreateRemoteOrderRequest, DecimalAmount, GatewayOrder,
    GatewayRefund, GatewayRefundStatus, RefundRequest, RemoteOrder, RemoteOrderStatus,
    WebhookEvent, WebhookEventKind, WebhookHeaders,
};
use crate::payments::utils::{encode_form, json_str, Auth, PaymentHttpClient, RequestBody};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

const PROVIDER: &str = "paypal";
/// Tokens are refreshed this long before PayPal expires them.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct PayPalConfig {
    pub client_id: String,
    pub client_secret: String,
    pub webhook_id: Option<String>,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub brand_name: Option<String>,
}

impl Default for PayPalConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            webhook_id: None,
            base_url: "https://api-m.sandbox.paypal.com".to_string(),
            timeout_secs: 10,
            max_retries: 2,
            brand_name: None,
        }
    }
}

impl PayPalConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let required = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| PaymentError::ValidationError {
                    message: format!("{} environment variable is required", name),
                    field: Some(name.to_string()),
                })
        };

        Ok(Self {
            client_id: required("PAYPAL_CLIENT_ID")?,
            client_secret: required("PAYPAL_CLIENT_SECRET")?,
            webhook_id: std::env::var("PAYPAL_WEBHOOK_ID").ok(),
            base_url: std::env::var("PAYPAL_BASE_URL")
                .unwrap_or_else(|_| "https://api-m.sandbox.paypal.com".to_string()),
            timeout_secs: std::env::var("PAYPAL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(10),
            max_retries: std::env::var("PAYPAL_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(2),
            brand_name: std::env::var("PAYPAL_BRAND_NAME").ok(),
        })
    }
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

pub struct PayPalProvider {
    config: PayPalConfig,
    http: PaymentHttpClient,
    token: RwLock<Option<CachedToken>>,
}

impl PayPalProvider {
    pub fn new(config: PayPalConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(
            PROVIDER,
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        Ok(Self {
            config,
            http,
            token: RwLock::new(None),
        })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(PayPalConfig::from_env()?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> PaymentResult<String> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref() {
                if token.expires_at > Instant::now() {
                    return Ok(token.access_token.clone());
                }
            }
        }

        let mut slot = self.token.write().await;
        if let Some(token) = slot.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.access_token.clone());
            }
        }

        let credentials = BASE64.encode(format!(
            "{}:{}",
            self.config.client_id, self.config.client_secret
        ));
        let form = encode_form(&[("grant_type", "client_credentials")]);
        let raw = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/v1/oauth2/token"),
                Some(Auth::Basic(&credentials)),
                RequestBody::Form(&form),
                &[],
            )
            .await?;

        let access_token = json_str(&raw, "/access_token")
            .ok_or_else(|| PaymentError::AuthenticationError {
                message: "token response carries no access_token".to_string(),
            })?
            .to_string();
        let expires_in = raw
            .get("expires_in")
            .and_then(JsonValue::as_u64)
            .unwrap_or(300);
        let lifetime = Duration::from_secs(expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        debug!(expires_in, "paypal access token refreshed");

        *slot = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(access_token)
    }

    async fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        body: RequestBody<'_>,
        request_id: Option<&str>,
    ) -> PaymentResult<JsonValue> {
        let token = self.access_token().await?;
        let mut headers: Vec<(&str, &str)> = vec![("Prefer", "return=representation")];
        if let Some(id) = request_id {
            headers.push(("PayPal-Request-Id", id));
        }
        self.http
            .request_json(
                method,
                &self.endpoint(path),
                Some(Auth::Bearer(&token)),
                body,
                &headers,
            )
            .await
    }
}

#[async_trait]
impl PaymentGateway for PayPalProvider {
    fn channel(&self) -> PaymentChannel {
        PaymentChannel::Paypal
    }

    async fn create_remote_order(
        &self,
        request: CreateRemoteOrderRequest,
    ) -> PaymentResult<RemoteOrder> {
        request.amount.validate_positive("amount")?;

        let mut context = json!({
            "return_url": request.return_url,
            "cancel_url": request.cancel_url,
            "user_action": "PAY_NOW",
            "shipping_preference": "NO_SHIPPING",
        });
        if let Some(brand) = self.config.brand_name.as_deref() {
            context["brand_name"] = json!(brand);
        }
        if let Some(locale) = request.locale.as_deref() {
            context["locale"] = json!(locale);
        }
        let payload = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": request.order_no,
                "custom_id": request.payment_id.to_string(),
                "amount": {
                    "currency_code": request.amount.currency,
                    "value": request.amount.to_decimal_string(),
                },
            }],
            "application_context": context,
        });

        let response = self
            .call(
                reqwest::Method::POST,
                "/v2/checkout/orders",
                RequestBody::Json(&payload),
                Some(&request.idempotency_key),
            )
            .await?;

        let external_id = json_str(&response, "/id")
            .ok_or_else(|| PaymentError::InvalidResponse {
                message: "create order response carries no id".to_string(),
            })?
            .to_string();
        info!(
            payment_id = request.payment_id,
            external_id = %external_id,
            "paypal order created"
        );

        Ok(RemoteOrder {
            approve_url: approve_link(&response),
            external_id,
            request_payload: Some(payload),
            response_payload: Some(response),
        })
    }

    async fn capture(&self, request: CaptureRequest) -> PaymentResult<GatewayOrder> {
        let mut payload = json!({});
        if let Some(note) = request.note.as_deref() {
            payload["note_to_payer"] = json!(note);
        }
        let response = self
            .call(
                reqwest::Method::POST,
                &format!("/v2/checkout/orders/{}/capture", request.external_id),
                RequestBody::Json(&payload),
                Some(&request.idempotency_key),
            )
            .await?;
        parse_gateway_order(&request.external_id, Some(payload), response)
    }

    async fn get_order_status(&self, external_id: &str) -> PaymentResult<GatewayOrder> {
        let response = self
            .call(
                reqwest::Method::GET,
                &format!("/v2/checkout/orders/{}", external_id),
                RequestBody::Empty,
                None,
            )
            .await?;
        parse_gateway_order(external_id, None, response)
    }

    async fn create_refund(&self, request: RefundRequest) -> PaymentResult<GatewayRefund> {
        request.amount.validate_positive("amount")?;
        let mut payload = json!({
            "amount": {
                "currency_code": request.amount.currency,
                "value": request.amount.to_decimal_string(),
            },
        });
        if let Some(note) = request.note.as_deref() {
            payload["note_to_payer"] = json!(note);
        }
        let response = self
            .call(
                reqwest::Method::POST,
                &format!("/v2/payments/captures/{}/refund", request.capture_id),
                RequestBody::Json(&payload),
                Some(&request.idempotency_key),
            )
            .await?;
        Ok(parse_refund(Some(payload), response))
    }

    async fn get_refund_status(&self, external_refund_id: &str) -> PaymentResult<GatewayRefund> {
        let response = self
            .call(
                reqwest::Method::GET,
                &format!("/v2/payments/refunds/{}", external_refund_id),
                RequestBody::Empty,
                None,
            )
            .await?;
        Ok(parse_refund(None, response))
    }

    async fn verify_webhook(
        &self,
        headers: &WebhookHeaders,
        event: &JsonValue,
    ) -> PaymentResult<bool> {
        let webhook_id = self
            .config
            .webhook_id
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| PaymentError::WebhookVerificationError {
                message: "paypal webhook id is not configured".to_string(),
            })?;
        let payload = json!({
            "auth_algo": headers.auth_algo,
            "cert_url": headers.cert_url,
            "transmission_id": headers.transmission_id,
            "transmission_sig": headers.transmission_sig,
            "transmission_time": headers.transmission_time,
            "webhook_id": webhook_id,
            "webhook_event": event,
        });
        let response = self
            .call(
                reqwest::Method::POST,
                "/v1/notifications/verify-webhook-signature",
                RequestBody::Json(&payload),
                None,
            )
            .await?;
        Ok(json_str(&response, "/verification_status")
            .map(|s| s.eq_ignore_ascii_case("SUCCESS"))
            .unwrap_or(false))
    }

    fn parse_webhook_event(&self, event: &JsonValue) -> PaymentResult<WebhookEvent> {
        parse_webhook_event(event)
    }

    fn approve_url(&self, response_payload: &JsonValue) -> Option<String> {
        approve_link(response_payload)
    }
}

fn approve_link(response: &JsonValue) -> Option<String> {
    response
        .get("links")
        .and_then(JsonValue::as_array)?
        .iter()
        .find(|link| {
            matches!(
                json_str(link, "/rel"),
                Some("approve") | Some("payer-action")
            )
        })
        .and_then(|link| json_str(link, "/href"))
        .map(str::to_string)
}

fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// First capture of the first purchase unit, where PayPal reports the capture.
fn first_capture(order: &JsonValue) -> Option<&JsonValue> {
    order.pointer("/purchase_units/0/payments/captures/0")
}

fn parse_gateway_order(
    requested_id: &str,
    request_payload: Option<JsonValue>,
    response: JsonValue,
) -> PaymentResult<GatewayOrder> {
    let external_id = json_str(&response, "/id").unwrap_or(requested_id).to_string();
    if external_id != requested_id {
        return Err(PaymentError::InvalidResponse {
            message: format!(
                "order response id {} does not match requested {}",
                external_id, requested_id
            ),
        });
    }
    let order_status = RemoteOrderStatus::from_provider(json_str(&response, "/status"));
    let capture = first_capture(&response);
    let capture_status = capture.and_then(|c| CaptureStatus::from_provider(json_str(c, "/status")));
    let capture_id = capture.and_then(|c| json_str(c, "/id")).map(str::to_string);
    let capture_time = capture.and_then(|c| {
        parse_time(json_str(c, "/update_time")).or_else(|| parse_time(json_str(c, "/create_time")))
    });

    Ok(GatewayOrder {
        approve_url: approve_link(&response),
        external_id,
        order_status,
        capture_status,
        capture_id,
        capture_time,
        request_payload,
        response_payload: Some(response),
    })
}

fn parse_refund(request_payload: Option<JsonValue>, response: JsonValue) -> GatewayRefund {
    GatewayRefund {
        external_refund_id: json_str(&response, "/id").map(str::to_string),
        status: GatewayRefundStatus::from_provider(json_str(&response, "/status")),
        request_payload,
        response_payload: Some(response),
    }
}

pub fn parse_webhook_event(event: &JsonValue) -> PaymentResult<WebhookEvent> {
    let invalid = |message: &str| PaymentError::ValidationError {
        message: message.to_string(),
        field: Some("webhook_event".to_string()),
    };
    let event_id = json_str(event, "/id").ok_or_else(|| invalid("event id is missing"))?;
    let event_type =
        json_str(event, "/event_type").ok_or_else(|| invalid("event_type is missing"))?;
    let resource = event
        .get("resource")
        .filter(|r| r.is_object())
        .ok_or_else(|| invalid("event resource is missing"))?;

    let external_order_id = if event_type.to_ascii_uppercase().starts_with("CHECKOUT.ORDER.") {
        json_str(resource, "/id")
    } else {
        json_str(resource, "/supplementary_data/related_ids/order_id")
    };
    let resource_amount = match (
        json_str(resource, "/amount/value"),
        json_str(resource, "/amount/currency_code"),
    ) {
        (Some(value), Some(currency)) => Some(DecimalAmount {
            value: value.to_string(),
            currency: currency.to_string(),
        }),
        _ => None,
    };

    Ok(WebhookEvent {
        event_id: event_id.to_string(),
        event_type: event_type.to_string(),
        kind: WebhookEventKind::from_event_type(event_type),
        external_order_id: external_order_id.map(str::to_string),
        resource_id: json_str(resource, "/id").map(str::to_string),
        resource_status: json_str(resource, "/status").map(str::to_string),
        resource_amount,
        resource_time: parse_time(json_str(resource, "/update_time"))
            .or_else(|| parse_time(json_str(resource, "/create_time"))),
        payload: event.clone(),
    })
}
