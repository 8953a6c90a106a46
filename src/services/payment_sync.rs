//! Gateway-driven reconciliation: status polls, buyer-return captures,
//! webhook events and the automatic refund of captures that could not close
//! the sale. Gateway calls happen here, outside any ledger transaction.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::database::entities::{
    EventSource, PaymentAttempt, PaymentStatus, RefundAttempt, RefundDedupeKey,
    RefundReasonCode, RefundStatus,
};
use crate::database::payment_attempt_repository::PollRecord;
use crate::error::{AppError, AppResult};
use crate::payments::provider::{capture_idempotency_key, PaymentGateway};
use crate::payments::types::{
    CaptureRequest, GatewayOrder, GatewayRefundStatus, Money, RefundRequest, RemoteOrderStatus,
    WebhookEvent,
};
use crate::services::reconciliation_engine::{
    CaptureApplyCommand, PaymentResultView, ReconciliationEngine, RefundNotice,
    RefundResultCommand, SystemRefund,
};

#[derive(Debug, Clone)]
pub struct PaymentSyncConfig {
    pub auto_refund_enabled: bool,
}

impl Default for PaymentSyncConfig {
    fn default() -> Self {
        Self {
            auto_refund_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Applied(PaymentResultView),
    Closed { payment_id: i64 },
    /// Gateway state is not final yet, or another flow owns it.
    Deferred { reason: String },
    Ignored { reason: String },
    Refund(RefundAttempt),
}

impl SyncOutcome {
    fn deferred(reason: impl Into<String>) -> Self {
        Self::Deferred {
            reason: reason.into(),
        }
    }

    fn ignored(reason: impl Into<String>) -> Self {
        Self::Ignored {
            reason: reason.into(),
        }
    }
}

pub struct PaymentSyncService {
    engine: Arc<ReconciliationEngine>,
    gateway: Arc<dyn PaymentGateway>,
    config: PaymentSyncConfig,
}

fn require_external_id(attempt: &PaymentAttempt) -> AppResult<String> {
    attempt
        .external_id()
        .map(str::to_string)
        .ok_or_else(|| AppError::illegal_param("external_id", format!("payment {} has no external id", attempt.id)))
}

impl PaymentSyncService {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        gateway: Arc<dyn PaymentGateway>,
        config: PaymentSyncConfig,
    ) -> Self {
        Self {
            engine,
            gateway,
            config,
        }
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }

    /// Polls the gateway order of one attempt and drives the engine with it.
    /// The poll stamp is recorded even when the gateway call fails.
    pub async fn sync_payment(&self, payment_id: i64) -> AppResult<SyncOutcome> {
        let attempt = self.engine.find_attempt(payment_id).await?;
        let external_id = require_external_id(&attempt)?;

        let remote = match self.gateway.get_order_status(&external_id).await {
            Ok(remote) => remote,
            Err(err) => {
                self.engine
                    .mark_polled(
                        payment_id,
                        PollRecord {
                            polled_at: Utc::now(),
                            response_payload: None,
                            capture_id: None,
                        },
                    )
                    .await?;
                return Err(err.into());
            }
        };
        self.record_poll(payment_id, &remote).await?;

        if remote.capture_status.is_none() && remote.order_status == RemoteOrderStatus::Approved {
            return self
                .capture_and_settle(&attempt, &external_id, EventSource::Scheduler)
                .await;
        }
        self.settle_remote_order(&attempt, &external_id, remote, EventSource::Scheduler)
            .await
    }

    /// Captures an approved gateway order and applies whatever came back.
    pub async fn capture_and_settle(
        &self,
        attempt: &PaymentAttempt,
        external_id: &str,
        source: EventSource,
    ) -> AppResult<SyncOutcome> {
        let captured = self
            .gateway
            .capture(CaptureRequest {
                idempotency_key: capture_idempotency_key(attempt.id),
                external_id: external_id.to_string(),
                note: None,
            })
            .await?;
        self.record_poll(attempt.id, &captured).await?;
        self.settle_remote_order(attempt, external_id, captured, source)
            .await
    }

    async fn record_poll(&self, payment_id: i64, remote: &GatewayOrder) -> AppResult<()> {
        self.engine
            .mark_polled(
                payment_id,
                PollRecord {
                    polled_at: Utc::now(),
                    response_payload: remote.response_payload.clone(),
                    capture_id: remote.capture_id.clone(),
                },
            )
            .await
    }

    async fn settle_remote_order(
        &self,
        attempt: &PaymentAttempt,
        external_id: &str,
        remote: GatewayOrder,
        source: EventSource,
    ) -> AppResult<SyncOutcome> {
        let Some(capture_status) = remote.capture_status else {
            return match remote.order_status {
                RemoteOrderStatus::Voided => {
                    self.engine.close_attempt_for_ops(attempt.id, source).await?;
                    Ok(SyncOutcome::Closed {
                        payment_id: attempt.id,
                    })
                }
                other => Ok(SyncOutcome::deferred(format!(
                    "gateway order is {:?} without capture",
                    other
                ))),
            };
        };
        if capture_status.defers_to_other_flows() {
            return Ok(SyncOutcome::deferred(format!(
                "capture is {:?}",
                capture_status
            )));
        }

        let outcome = self
            .engine
            .apply_capture_result(CaptureApplyCommand {
                payment_id: attempt.id,
                order_id: Some(attempt.order_id),
                external_id: external_id.to_string(),
                capture_success: capture_status.is_success(),
                capture_id: remote.capture_id.clone(),
                capture_time: remote.capture_time,
                response_payload: remote.response_payload.clone(),
                notify_payload: None,
                source,
            })
            .await?;
        if outcome.needs_auto_refund() {
            if let Some(capture_id) = outcome.capture_id.as_deref() {
                self.auto_refund_exception_capture(attempt.id, capture_id)
                    .await?;
            }
        }
        Ok(SyncOutcome::Applied(outcome.view))
    }

    /// Returns a successful capture that was recorded as EXCEPTION.
    ///
    /// Uses one deterministic key as both the refund row dedupe key and the
    /// gateway idempotency key, so repeated runs refund at most once.
    pub async fn auto_refund_exception_capture(
        &self,
        payment_id: i64,
        capture_id: &str,
    ) -> AppResult<Option<RefundAttempt>> {
        if !self.config.auto_refund_enabled {
            info!(payment_id, "auto refund disabled, exception capture left for ops");
            return Ok(None);
        }
        let key = RefundDedupeKey::auto_capture(payment_id);
        if let Some(existing) = self.engine.refund_by_dedupe_key(payment_id, &key).await? {
            return Ok(Some(existing));
        }

        let attempt = self.engine.find_attempt(payment_id).await?;
        let amount = Money::new(attempt.amount_minor, attempt.currency.clone());
        let refund = self
            .gateway
            .create_refund(RefundRequest {
                idempotency_key: key.to_string(),
                capture_id: capture_id.to_string(),
                amount: amount.clone(),
                note: Some("Payment could not be completed and was returned".to_string()),
            })
            .await?;

        let row = self
            .engine
            .record_system_refund(SystemRefund {
                payment_id,
                dedupe_key: key,
                external_refund_id: refund.external_refund_id.clone(),
                amount,
                reason_code: RefundReasonCode::Exception,
                request_payload: refund.request_payload.clone(),
                response_payload: refund.response_payload.clone(),
            })
            .await?;
        let applied = self
            .engine
            .apply_refund_result(RefundResultCommand {
                refund_id: row.id,
                external_refund_id: refund.external_refund_id.clone(),
                status: refund.status.to_refund_status(),
                response_payload: refund.response_payload.clone(),
                notify_payload: None,
                notified_at: None,
                source: EventSource::System,
            })
            .await?;
        warn!(
            payment_id,
            refund_id = applied.id,
            status = %applied.status,
            "exception capture refunded automatically"
        );
        Ok(Some(applied))
    }

    /// Polls one refund and applies a final gateway status.
    pub async fn sync_refund(&self, refund_id: i64) -> AppResult<SyncOutcome> {
        let refund = self.engine.find_refund(refund_id).await?;
        let external_refund_id = refund
            .external_refund_id()
            .map(str::to_string)
            .ok_or_else(|| {
                AppError::illegal_param(
                    "external_refund_id",
                    format!("refund {} has no external refund id", refund_id),
                )
            })?;

        let remote = match self.gateway.get_refund_status(&external_refund_id).await {
            Ok(remote) => remote,
            Err(err) => {
                self.engine
                    .mark_refund_polled(refund_id, Utc::now(), None)
                    .await?;
                return Err(err.into());
            }
        };
        self.engine
            .mark_refund_polled(refund_id, Utc::now(), remote.response_payload.as_ref())
            .await?;

        let status = remote.status.to_refund_status();
        if status == RefundStatus::Pending {
            return Ok(SyncOutcome::deferred("refund pending at gateway"));
        }
        let applied = self
            .engine
            .apply_refund_result(RefundResultCommand {
                refund_id,
                external_refund_id: Some(external_refund_id),
                status,
                response_payload: remote.response_payload,
                notify_payload: None,
                notified_at: None,
                source: EventSource::Scheduler,
            })
            .await?;
        Ok(SyncOutcome::Refund(applied))
    }

    async fn attempt_for_event(&self, event: &WebhookEvent) -> AppResult<Option<(PaymentAttempt, String)>> {
        let Some(external_id) = event.external_order_id.clone() else {
            return Ok(None);
        };
        Ok(self
            .engine
            .find_attempt_by_external_id(&external_id)
            .await?
            .map(|attempt| (attempt, external_id)))
    }

    /// `CHECKOUT.ORDER.APPROVED`: the buyer approved, capture now.
    pub async fn handle_order_approved(&self, event: &WebhookEvent) -> AppResult<SyncOutcome> {
        let Some((attempt, external_id)) = self.attempt_for_event(event).await? else {
            return Ok(SyncOutcome::ignored("no attempt for gateway order"));
        };
        if attempt.status == PaymentStatus::Success {
            return Ok(SyncOutcome::ignored("payment already captured"));
        }
        self.capture_and_settle(&attempt, &external_id, EventSource::PaymentCallback)
            .await
    }

    /// `PAYMENT.CAPTURE.COMPLETED` and `PAYMENT.CAPTURE.DECLINED`/`DENIED`.
    pub async fn handle_capture_event(
        &self,
        event: &WebhookEvent,
        capture_success: bool,
    ) -> AppResult<SyncOutcome> {
        let Some((attempt, external_id)) = self.attempt_for_event(event).await? else {
            return Ok(SyncOutcome::ignored("no attempt for gateway order"));
        };
        let outcome = self
            .engine
            .apply_capture_result(CaptureApplyCommand {
                payment_id: attempt.id,
                order_id: Some(attempt.order_id),
                external_id,
                capture_success,
                capture_id: event.resource_id.clone(),
                capture_time: event.resource_time,
                response_payload: None,
                notify_payload: Some(event.payload.clone()),
                source: EventSource::PaymentCallback,
            })
            .await?;
        if outcome.needs_auto_refund() {
            if let Some(capture_id) = outcome.capture_id.as_deref() {
                self.auto_refund_exception_capture(attempt.id, capture_id)
                    .await?;
            }
        }
        Ok(SyncOutcome::Applied(outcome.view))
    }

    /// `PAYMENT.CAPTURE.REFUNDED`/`REVERSED`: lands the refund on one row.
    pub async fn handle_refund_event(&self, event: &WebhookEvent) -> AppResult<SyncOutcome> {
        let Some((attempt, _external_id)) = self.attempt_for_event(event).await? else {
            return Ok(SyncOutcome::ignored("no attempt for gateway order"));
        };
        let external_refund_id = event.resource_id.clone().ok_or_else(|| {
            AppError::illegal_param("resource.id", "refund event carries no refund id")
        })?;
        let amount = match event.resource_amount.as_ref() {
            Some(raw) => match Money::from_decimal_str(&raw.value, &raw.currency) {
                Ok(amount) => amount,
                Err(e) => {
                    warn!(
                        payment_id = attempt.id,
                        event_id = %event.event_id,
                        amount = %raw.value,
                        error = %e,
                        "unparseable refund amount, using the attempt amount"
                    );
                    Money::new(attempt.amount_minor, attempt.currency.clone())
                }
            },
            None => Money::new(attempt.amount_minor, attempt.currency.clone()),
        };

        let refund = self
            .engine
            .resolve_refund_target(RefundNotice {
                payment_id: attempt.id,
                external_refund_id: external_refund_id.clone(),
                amount_minor: Some(amount.amount_minor),
                currency: Some(amount.currency),
                notify_payload: Some(event.payload.clone()),
                notified_at: Some(Utc::now()),
            })
            .await?;
        let status =
            GatewayRefundStatus::from_provider(event.resource_status.as_deref()).to_refund_status();
        let applied = self
            .engine
            .apply_refund_result(RefundResultCommand {
                refund_id: refund.id,
                external_refund_id: Some(external_refund_id),
                status,
                response_payload: None,
                notify_payload: Some(event.payload.clone()),
                notified_at: Some(Utc::now()),
                source: EventSource::PaymentCallback,
            })
            .await?;
        Ok(SyncOutcome::Refund(applied))
    }
}
