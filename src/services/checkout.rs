//! Buyer-facing payment flows: checkout creation, capture on return from the
//! gateway and cancellation.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::keys::checkout::RegistrationKey;
use crate::cache::{DedupeDecision, DedupeGate};
use crate::database::entities::{EventSource, PaymentChannel, PaymentStatus};
use crate::error::{AppError, AppResult};
use crate::payments::provider::{create_order_idempotency_key, PaymentGateway};
use crate::payments::types::{CreateRemoteOrderRequest, Money};
use crate::services::payment_sync::{PaymentSyncService, SyncOutcome};
use crate::services::reconciliation_engine::{
    BindExternalId, CaptureTarget, CheckoutPrepared, PaymentResultView, PrepareCheckout, ReconciliationEngine,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub user_id: i64,
    pub order_id: i64,
    pub channel: PaymentChannel,
    pub return_url: String,
    pub cancel_url: String,
    pub locale: Option<String>,
    /// Client-supplied key; repeated submissions with the same key return the
    /// same payment.
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutResponse {
    pub payment_id: i64,
    pub order_id: i64,
    pub order_no: String,
    pub external_id: Option<String>,
    pub approve_url: Option<String>,
    pub status: PaymentStatus,
    pub amount: Money,
    pub reused: bool,
}

pub struct CheckoutService {
    engine: Arc<ReconciliationEngine>,
    gateway: Arc<dyn PaymentGateway>,
    sync: Arc<PaymentSyncService>,
    registrations: DedupeGate,
}

impl CheckoutService {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        gateway: Arc<dyn PaymentGateway>,
        sync: Arc<PaymentSyncService>,
        registrations: DedupeGate,
    ) -> Self {
        Self {
            engine,
            gateway,
            sync,
            registrations,
        }
    }

    pub async fn create_checkout(&self, request: CheckoutRequest) -> AppResult<CheckoutResponse> {
        let key = request
            .idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(|k| RegistrationKey::new(request.user_id, k).to_string());

        let Some(key) = key else {
            return self.checkout_once(&request).await;
        };

        match self.registrations.acquire(&key).await? {
            DedupeDecision::Acquired => {}
            DedupeDecision::Completed(Some(payment_id)) => {
                let payment_id: i64 = payment_id.parse().map_err(|_| {
                    AppError::conflict(format!("registration {} holds no payment id", key))
                })?;
                return self.existing_checkout(request.user_id, payment_id).await;
            }
            DedupeDecision::Completed(None) => {
                return Err(AppError::conflict(format!(
                    "registration {} finished without a payment",
                    key
                )));
            }
            DedupeDecision::InFlight => {
                return Err(AppError::conflict("checkout with this idempotency key is in flight"));
            }
        }

        match self.checkout_once(&request).await {
            Ok(response) => {
                let payment_id = response.payment_id.to_string();
                if let Err(e) = self.registrations.complete(&key, Some(&payment_id)).await {
                    warn!(key = %key, error = %e, "Failed to store checkout registration");
                }
                Ok(response)
            }
            Err(err) => {
                if let Err(e) = self.registrations.release(&key).await {
                    warn!(key = %key, error = %e, "Failed to release checkout registration");
                }
                Err(err)
            }
        }
    }

    async fn checkout_once(&self, request: &CheckoutRequest) -> AppResult<CheckoutResponse> {
        let prepared = self.prepare(request).await?;
        if prepared.external_id.is_some() {
            return self.respond_existing(prepared).await;
        }

        let remote = self
            .gateway
            .create_remote_order(CreateRemoteOrderRequest {
                idempotency_key: create_order_idempotency_key(prepared.payment_id),
                payment_id: prepared.payment_id,
                order_no: prepared.order_no.clone(),
                amount: prepared.amount.clone(),
                return_url: request.return_url.clone(),
                cancel_url: request.cancel_url.clone(),
                locale: request.locale.clone(),
            })
            .await?;

        let bound = self
            .engine
            .bind_external_id(BindExternalId {
                payment_id: prepared.payment_id,
                external_id: remote.external_id.clone(),
                request_payload: remote.request_payload.clone(),
                response_payload: remote.response_payload.clone(),
                source: EventSource::User,
            })
            .await;

        match bound {
            Ok(view) => {
                info!(
                    payment_id = view.payment_id,
                    order_id = view.order_id,
                    external_id = %remote.external_id,
                    "checkout created"
                );
                Ok(CheckoutResponse {
                    payment_id: view.payment_id,
                    order_id: view.order_id,
                    order_no: view.order_no,
                    external_id: view.external_id,
                    approve_url: remote.approve_url,
                    status: view.status,
                    amount: prepared.amount,
                    reused: prepared.reused,
                })
            }
            Err(err) if err.is_conflict() => {
                warn!(
                    payment_id = prepared.payment_id,
                    error = %err,
                    "bind lost to a concurrent checkout, re-preparing"
                );
                let current = self.prepare(request).await?;
                if current.external_id.is_some() {
                    self.respond_existing(current).await
                } else {
                    Err(err)
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn prepare(&self, request: &CheckoutRequest) -> AppResult<CheckoutPrepared> {
        self.engine
            .prepare_checkout(PrepareCheckout {
                user_id: request.user_id,
                order_id: request.order_id,
                channel: request.channel,
                source: EventSource::User,
            })
            .await
    }

    async fn respond_existing(&self, prepared: CheckoutPrepared) -> AppResult<CheckoutResponse> {
        let attempt = self.engine.find_attempt(prepared.payment_id).await?;
        let approve_url = attempt
            .response_payload
            .as_ref()
            .and_then(|payload| self.gateway.approve_url(payload));
        Ok(CheckoutResponse {
            payment_id: prepared.payment_id,
            order_id: prepared.order_id,
            order_no: prepared.order_no,
            external_id: prepared.external_id,
            approve_url,
            status: prepared.status,
            amount: prepared.amount,
            reused: true,
        })
    }

    async fn existing_checkout(&self, user_id: i64, payment_id: i64) -> AppResult<CheckoutResponse> {
        let (attempt, order) = self.engine.find_attempt_with_order(payment_id).await?;
        if order.user_id != user_id {
            return Err(AppError::not_found("payment attempt", payment_id));
        }
        let approve_url = attempt
            .response_payload
            .as_ref()
            .and_then(|payload| self.gateway.approve_url(payload));
        Ok(CheckoutResponse {
            payment_id: attempt.id,
            order_id: order.id,
            order_no: order.order_no.clone(),
            external_id: attempt.external_id().map(str::to_string),
            approve_url,
            status: attempt.status,
            amount: Money::new(attempt.amount_minor, attempt.currency.clone()),
            reused: true,
        })
    }

    /// Captures after the buyer returns from the approval page.
    pub async fn capture_payment(&self, user_id: i64, payment_id: i64) -> AppResult<PaymentResultView> {
        let (attempt, external_id) = match self.engine.capture_target(user_id, payment_id).await? {
            CaptureTarget::Ready {
                attempt,
                external_id,
            } => (attempt, external_id),
            CaptureTarget::AlreadyPaid(view) => return Ok(view),
        };

        let message = match self
            .sync
            .capture_and_settle(&attempt, &external_id, EventSource::User)
            .await?
        {
            SyncOutcome::Applied(view) => return Ok(view),
            SyncOutcome::Closed { .. } => "gateway order voided".to_string(),
            SyncOutcome::Deferred { reason } | SyncOutcome::Ignored { reason } => reason,
            SyncOutcome::Refund(_) => "refund recorded".to_string(),
        };
        let (attempt, order) = self.engine.find_attempt_with_order(payment_id).await?;
        Ok(PaymentResultView::of(&attempt, &order).with_message(&message))
    }

    pub async fn cancel_payment(&self, user_id: i64, payment_id: i64) -> AppResult<PaymentResultView> {
        self.engine
            .cancel_attempt(user_id, payment_id, EventSource::User)
            .await
    }
}
