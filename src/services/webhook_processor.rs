use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::cache::keys::webhook::EventKey;
use crate::cache::{DedupeDecision, DedupeGate};
use crate::error::AppError;
use crate::payments::error::PaymentError;
use crate::payments::provider::PaymentGateway;
use crate::payments::types::{WebhookEvent, WebhookEventKind, WebhookHeaders};
use crate::services::payment_sync::{PaymentSyncService, SyncOutcome};

#[derive(Debug, Error)]
pub enum WebhookProcessorError {
    #[error("Malformed webhook: {0}")]
    Malformed(String),
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Delivery is already being processed")]
    InFlight,
    #[error("Cache error: {0}")]
    Cache(String),
    #[error("Processing error: {0}")]
    Processing(#[from] AppError),
}

impl WebhookProcessorError {
    /// Non-2xx answers make the gateway redeliver.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Malformed(_) => 400,
            Self::InvalidSignature(_) => 401,
            Self::InFlight => 409,
            Self::Cache(_) => 503,
            Self::Processing(err) if err.is_illegal_param() => 400,
            Self::Processing(err) if err.is_retryable() => 503,
            Self::Processing(_) => 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    Duplicate,
    Ignored,
}

#[derive(Debug, Clone)]
pub struct WebhookProcessorConfig {
    /// Accepted distance between the transmission time and now.
    pub clock_skew: Duration,
}

impl Default for WebhookProcessorConfig {
    fn default() -> Self {
        Self {
            clock_skew: Duration::minutes(5),
        }
    }
}

pub struct WebhookProcessor {
    gateway: Arc<dyn PaymentGateway>,
    sync: Arc<PaymentSyncService>,
    dedupe: DedupeGate,
    config: WebhookProcessorConfig,
}

impl WebhookProcessor {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        sync: Arc<PaymentSyncService>,
        dedupe: DedupeGate,
        config: WebhookProcessorConfig,
    ) -> Self {
        Self {
            gateway,
            sync,
            dedupe,
            config,
        }
    }

    /// Verifies, dedupes and routes one gateway notification.
    ///
    /// Signature checks run before the dedupe gate so forged deliveries never
    /// occupy a key. A failed run releases its key for redelivery.
    pub async fn process_webhook<'a, I>(
        &self,
        headers: I,
        body: &[u8],
    ) -> Result<WebhookOutcome, WebhookProcessorError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let payload: JsonValue = serde_json::from_slice(body)
            .map_err(|e| WebhookProcessorError::Malformed(format!("invalid JSON body: {}", e)))?;
        let headers = WebhookHeaders::from_pairs(headers)
            .map_err(|e| WebhookProcessorError::Malformed(e.to_string()))?;

        self.check_transmission_time(&headers.transmission_time)?;
        match self.gateway.verify_webhook(&headers, &payload).await {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    transmission_id = %headers.transmission_id,
                    "Invalid webhook signature"
                );
                return Err(WebhookProcessorError::InvalidSignature(
                    "gateway rejected the signature".to_string(),
                ));
            }
            Err(PaymentError::WebhookVerificationError { message }) => {
                return Err(WebhookProcessorError::InvalidSignature(message));
            }
            Err(e) => return Err(AppError::from(e).into()),
        }

        let event = self
            .gateway
            .parse_webhook_event(&payload)
            .map_err(|e| WebhookProcessorError::Malformed(e.to_string()))?;
        let key = EventKey::paypal(&headers.transmission_id, &event.event_id).to_string();

        match self
            .dedupe
            .acquire(&key)
            .await
            .map_err(|e| WebhookProcessorError::Cache(e.to_string()))?
        {
            DedupeDecision::Acquired => {}
            DedupeDecision::Completed(_) => {
                info!(event_id = %event.event_id, "Webhook already processed");
                return Ok(WebhookOutcome::Duplicate);
            }
            DedupeDecision::InFlight => return Err(WebhookProcessorError::InFlight),
        }

        match self.route(&event).await {
            Ok(outcome) => {
                if let Err(e) = self.dedupe.complete(&key, None).await {
                    warn!(event_id = %event.event_id, error = %e, "Failed to mark webhook done");
                }
                info!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    ?outcome,
                    "Webhook processed"
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(event_id = %event.event_id, error = %e, "Webhook processing failed");
                if let Err(release) = self.dedupe.release(&key).await {
                    error!(event_id = %event.event_id, error = %release, "Failed to release webhook key");
                }
                Err(e.into())
            }
        }
    }

    fn check_transmission_time(&self, raw: &str) -> Result<(), WebhookProcessorError> {
        let sent = DateTime::parse_from_rfc3339(raw)
            .map_err(|_| {
                WebhookProcessorError::Malformed(format!("invalid transmission time: {}", raw))
            })?
            .with_timezone(&Utc);
        let drift = (Utc::now() - sent).abs();
        if drift > self.config.clock_skew {
            return Err(WebhookProcessorError::InvalidSignature(format!(
                "transmission time {} outside accepted skew",
                raw
            )));
        }
        Ok(())
    }

    async fn route(&self, event: &WebhookEvent) -> Result<WebhookOutcome, AppError> {
        let outcome = match event.kind {
            WebhookEventKind::OrderApproved => self.sync.handle_order_approved(event).await?,
            WebhookEventKind::CaptureCompleted => self.sync.handle_capture_event(event, true).await?,
            WebhookEventKind::CaptureDeclined => self.sync.handle_capture_event(event, false).await?,
            WebhookEventKind::CaptureRefunded => self.sync.handle_refund_event(event).await?,
            WebhookEventKind::Other => return Ok(WebhookOutcome::Ignored),
        };
        Ok(match outcome {
            SyncOutcome::Ignored { reason } => {
                info!(event_id = %event.event_id, reason = %reason, "Webhook ignored");
                WebhookOutcome::Ignored
            }
            _ => WebhookOutcome::Processed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses_drive_redelivery() {
        assert_eq!(WebhookProcessorError::Malformed("x".into()).http_status(), 400);
        assert_eq!(
            WebhookProcessorError::InvalidSignature("x".into()).http_status(),
            401
        );
        assert_eq!(WebhookProcessorError::InFlight.http_status(), 409);
        assert_eq!(
            WebhookProcessorError::Processing(AppError::conflict("race")).http_status(),
            503
        );
        assert_eq!(
            WebhookProcessorError::Processing(AppError::not_found("order", 1)).http_status(),
            500
        );
    }
}
