//! Reconciliation Engine
//!
//! Every order-mutating payment operation runs as one ledger transaction:
//! lock the order row, resolve the active attempt, move attempt and refund
//! rows through named CAS transitions, mirror the order's payment columns,
//! commit. Gateway I/O never happens in here; callers do it before or after.
//!
//! A lost CAS, stale state or a cross-wired external id surfaces as
//! `Conflict`. Every operation is idempotent, so callers may retry verbatim.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::database::entities::{
    non_blank, EventSource, NewPaymentAttempt, NewRefundAttempt, NewStatusLog, Order,
    OrderStatus, PaymentAttempt, PaymentChannel, PaymentStatus, RefundAttempt, RefundDedupeKey,
    RefundInitiator, RefundReasonCode, RefundStatus, OPEN_PAYMENT_STATUSES,
    PAYABLE_ORDER_STATUSES,
};
use crate::database::order_ledger::{OrderPaymentFields, PayStatusGuard};
use crate::database::payment_attempt_repository::{AttemptAudit, CaptureUpdate, PollRecord};
use crate::database::transaction::{LedgerStore, PaymentTx};
use crate::error::{AppError, AppResult};
use crate::payments::types::Money;
use crate::services::active_attempt::{
    decide_capture, decide_gate, is_late_capture, reconcile_active_attempt, CaptureFacts,
    GateDecision,
};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Window after order creation in which a capture may still close the sale.
    pub payable_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            payable_ttl: Duration::minutes(15),
        }
    }
}

// ============================================================================
// Commands and views
// ============================================================================

#[derive(Debug, Clone)]
pub struct PrepareCheckout {
    pub user_id: i64,
    pub order_id: i64,
    pub channel: PaymentChannel,
    pub source: EventSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutPrepared {
    pub payment_id: i64,
    pub order_id: i64,
    pub order_no: String,
    pub channel: PaymentChannel,
    pub status: PaymentStatus,
    pub external_id: Option<String>,
    pub amount: Money,
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct BindExternalId {
    pub payment_id: i64,
    pub external_id: String,
    pub request_payload: Option<JsonValue>,
    pub response_payload: Option<JsonValue>,
    pub source: EventSource,
}

#[derive(Debug, Clone)]
pub struct CaptureApplyCommand {
    pub payment_id: i64,
    /// When present, must match the attempt's order.
    pub order_id: Option<i64>,
    pub external_id: String,
    pub capture_success: bool,
    pub capture_id: Option<String>,
    /// Defaults to now.
    pub capture_time: Option<DateTime<Utc>>,
    pub response_payload: Option<JsonValue>,
    pub notify_payload: Option<JsonValue>,
    pub source: EventSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentResultView {
    pub payment_id: i64,
    pub order_id: i64,
    pub order_no: String,
    pub status: PaymentStatus,
    pub external_id: Option<String>,
    pub message: Option<String>,
}

impl PaymentResultView {
    pub fn of(attempt: &PaymentAttempt, order: &Order) -> Self {
        Self {
            payment_id: attempt.id,
            order_id: order.id,
            order_no: order.order_no.clone(),
            status: attempt.status,
            external_id: attempt.external_id().map(str::to_string),
            message: None,
        }
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOutcome {
    pub view: PaymentResultView,
    /// False when the call was absorbed without a status write.
    pub applied: bool,
    pub capture_id: Option<String>,
}

impl CaptureOutcome {
    /// A successful capture that could not close the sale and has money to return.
    pub fn needs_auto_refund(&self) -> bool {
        self.applied && self.view.status == PaymentStatus::Exception && self.capture_id.is_some()
    }
}

/// Whether a buyer-initiated capture may go to the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureTarget {
    /// Open, active and bound.
    Ready {
        attempt: PaymentAttempt,
        external_id: String,
    },
    AlreadyPaid(PaymentResultView),
}

/// A gateway refund that must land on exactly one refund row.
#[derive(Debug, Clone)]
pub struct RefundNotice {
    pub payment_id: i64,
    pub external_refund_id: String,
    pub amount_minor: Option<i64>,
    pub currency: Option<String>,
    pub notify_payload: Option<JsonValue>,
    pub notified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RefundResultCommand {
    pub refund_id: i64,
    pub external_refund_id: Option<String>,
    pub status: RefundStatus,
    pub response_payload: Option<JsonValue>,
    pub notify_payload: Option<JsonValue>,
    pub notified_at: Option<DateTime<Utc>>,
    pub source: EventSource,
}

#[derive(Debug, Clone)]
pub struct SystemRefund {
    pub payment_id: i64,
    pub dedupe_key: RefundDedupeKey,
    pub external_refund_id: Option<String>,
    pub amount: Money,
    pub reason_code: RefundReasonCode,
    pub request_payload: Option<JsonValue>,
    pub response_payload: Option<JsonValue>,
}

// ============================================================================
// Engine
// ============================================================================

pub struct ReconciliationEngine {
    store: Arc<dyn LedgerStore>,
    config: EngineConfig,
}

type Tx = Box<dyn PaymentTx>;

async fn locked_order(tx: &mut Tx, order_id: i64) -> AppResult<Order> {
    tx.lock_order(order_id)
        .await?
        .ok_or_else(|| AppError::not_found("order", order_id))
}

async fn attempt_of(tx: &mut Tx, payment_id: i64) -> AppResult<PaymentAttempt> {
    tx.find_attempt(payment_id)
        .await?
        .ok_or_else(|| AppError::not_found("payment attempt", payment_id))
}

async fn refund_of(tx: &mut Tx, refund_id: i64) -> AppResult<RefundAttempt> {
    tx.find_refund(refund_id)
        .await?
        .ok_or_else(|| AppError::not_found("refund attempt", refund_id))
}

/// Locks the attempt's order, then rereads the attempt under that lock.
async fn lock_attempt(tx: &mut Tx, payment_id: i64) -> AppResult<(PaymentAttempt, Order)> {
    let unlocked = attempt_of(tx, payment_id).await?;
    let order = locked_order(tx, unlocked.order_id).await?;
    let attempt = attempt_of(tx, payment_id).await?;
    Ok((attempt, order))
}

/// Persists the legacy self-heal. Returns whether the attempt is active.
async fn resolve_active(
    tx: &mut Tx,
    order: &Order,
    payment_id: i64,
    incoming_external_id: Option<&str>,
) -> AppResult<bool> {
    let resolved = reconcile_active_attempt(order, payment_id, incoming_external_id);
    if resolved.healed {
        let claimed = tx.claim_active_payment(order.id, payment_id).await?;
        if !claimed {
            return Ok(false);
        }
        info!(
            order_id = order.id,
            payment_id, "adopted legacy attempt as active payment"
        );
    }
    Ok(resolved.is_active)
}

/// Appends a status-log row only when the order actually moved.
async fn advance_order(
    tx: &mut Tx,
    order: &Order,
    from: &[OrderStatus],
    to: OrderStatus,
    source: EventSource,
    note: String,
) -> AppResult<bool> {
    if !from.contains(&order.status) {
        return Ok(false);
    }
    let moved = tx.advance_status(order.id, from, to).await?;
    if moved {
        tx.append_status_log(&NewStatusLog {
            order_id: order.id,
            source,
            from_status: Some(order.status),
            to_status: to,
            note: Some(note),
        })
        .await?;
    }
    Ok(moved)
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn LedgerStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn begin(&self) -> AppResult<Tx> {
        Ok(self.store.begin().await?)
    }

    // ------------------------------------------------------------------------
    // Checkout preparation
    // ------------------------------------------------------------------------

    /// Obtains the single open attempt for an order.
    ///
    /// Reuses the active attempt when the channel matches, upgrades a NONE
    /// placeholder, or closes the previous one and inserts a fresh INIT row.
    /// Any other open attempt of the order is closed.
    pub async fn prepare_checkout(&self, cmd: PrepareCheckout) -> AppResult<CheckoutPrepared> {
        if cmd.channel == PaymentChannel::None {
            return Err(AppError::illegal_param("channel", "a payment channel is required"));
        }

        let mut tx = self.begin().await?;
        let order = locked_order(&mut tx, cmd.order_id).await?;
        if order.user_id != cmd.user_id {
            return Err(AppError::not_found("order", cmd.order_id));
        }
        if !order.is_payable() {
            return Err(AppError::conflict(format!(
                "order {} is not payable (status {}, pay status {})",
                order.order_no, order.status, order.pay_status
            )));
        }

        let active = match order.active_payment_id {
            Some(id) => tx
                .find_attempt(id)
                .await?
                .filter(|a| a.order_id == order.id),
            None => None,
        };
        if let Some(paid) = active.as_ref().filter(|a| a.status == PaymentStatus::Success) {
            return Err(AppError::conflict(format!(
                "order {} already has succeeded payment {}",
                order.order_no, paid.id
            )));
        }

        let (attempt, reused) = match decide_gate(active.as_ref(), cmd.channel) {
            GateDecision::Reuse(attempt) => (attempt, true),
            GateDecision::UpgradePlaceholder(placeholder) => {
                let upgraded = tx
                    .try_upgrade_placeholder(
                        placeholder.id,
                        cmd.channel,
                        order.pay_amount_minor,
                        &order.currency,
                    )
                    .await?;
                if !upgraded {
                    return Err(AppError::conflict(format!(
                        "placeholder attempt {} was taken concurrently",
                        placeholder.id
                    )));
                }
                (attempt_of(&mut tx, placeholder.id).await?, false)
            }
            GateDecision::CreateNew { close_previous } => {
                if let Some(previous) = close_previous {
                    tx.try_close(previous, &OPEN_PAYMENT_STATUSES).await?;
                }
                let attempt = tx
                    .insert_attempt(&NewPaymentAttempt {
                        order_id: order.id,
                        channel: cmd.channel,
                        status: PaymentStatus::Init,
                        amount_minor: order.pay_amount_minor,
                        currency: order.currency.clone(),
                    })
                    .await?;
                (attempt, false)
            }
        };

        let closed = tx.close_open_siblings(order.id, attempt.id).await?;
        if closed > 0 {
            debug!(order_id = order.id, closed, "closed stale open attempts");
        }

        let synced = tx
            .update_payment_fields(
                order.id,
                PayStatusGuard::Not(PaymentStatus::Success),
                &OrderPaymentFields {
                    pay_channel: Some(attempt.channel),
                    pay_status: Some(attempt.status),
                    payment_external_id: attempt.external_id().map(str::to_string),
                    active_payment_id: Some(attempt.id),
                    pay_time: None,
                },
            )
            .await?;
        if !synced {
            return Err(AppError::conflict(format!(
                "order {} was paid concurrently",
                order.order_no
            )));
        }
        advance_order(
            &mut tx,
            &order,
            &[OrderStatus::Created],
            OrderStatus::PendingPayment,
            cmd.source,
            format!("checkout prepared with payment {}", attempt.id),
        )
        .await?;

        tx.commit().await?;
        info!(
            order_id = order.id,
            payment_id = attempt.id,
            reused,
            "checkout prepared"
        );

        Ok(CheckoutPrepared {
            payment_id: attempt.id,
            order_id: order.id,
            order_no: order.order_no.clone(),
            channel: attempt.channel,
            status: attempt.status,
            external_id: attempt.external_id().map(str::to_string),
            amount: Money::new(attempt.amount_minor, attempt.currency.clone()),
            reused,
        })
    }

    // ------------------------------------------------------------------------
    // External id bind
    // ------------------------------------------------------------------------

    /// Binds the gateway order id to the attempt and moves it to PENDING.
    ///
    /// An attempt that lost its authority is closed and the call fails with
    /// a late-binding conflict; the close is committed before returning.
    pub async fn bind_external_id(&self, cmd: BindExternalId) -> AppResult<PaymentResultView> {
        let external_id = non_blank(Some(cmd.external_id.as_str()))
            .ok_or_else(|| AppError::illegal_param("external_id", "must not be blank"))?
            .to_string();

        let mut tx = self.begin().await?;
        let (attempt, order) = lock_attempt(&mut tx, cmd.payment_id).await?;

        if let Some(bound) = attempt.external_id() {
            if bound != external_id {
                return Err(AppError::conflict(format!(
                    "payment {} is bound to a different external id",
                    attempt.id
                )));
            }
            if attempt.status == PaymentStatus::Success {
                return Ok(PaymentResultView::of(&attempt, &order).with_message("already paid"));
            }
        }

        let is_active = resolve_active(&mut tx, &order, attempt.id, Some(&external_id)).await?;
        let terminal = matches!(
            attempt.status,
            PaymentStatus::Closed | PaymentStatus::Fail | PaymentStatus::Exception
        );
        if !is_active || !order.is_payable() || terminal {
            tx.try_close(
                attempt.id,
                &[PaymentStatus::None, PaymentStatus::Init, PaymentStatus::Pending],
            )
            .await?;
            tx.commit().await?;
            warn!(
                payment_id = attempt.id,
                order_id = order.id,
                external_id = %external_id,
                is_active,
                "late binding rejected"
            );
            return Err(AppError::conflict(format!(
                "late binding: payment {} is no longer the active payable attempt",
                attempt.id
            )));
        }

        let already_bound = attempt.external_id().is_some();
        let mirrored = order.active_payment_id == Some(attempt.id)
            && order.pay_status == PaymentStatus::Pending
            && order.pay_channel == attempt.channel
            && order.payment_external_id.as_deref() == Some(external_id.as_str())
            && order.status != OrderStatus::Created;
        if already_bound && attempt.status == PaymentStatus::Pending && mirrored {
            // Rebinding the same id writes nothing.
            return Ok(PaymentResultView::of(&attempt, &order).with_message("already bound"));
        }

        if !already_bound && !tx.bind_external_id(attempt.id, &external_id).await? {
            return Err(AppError::conflict(format!(
                "payment {} was bound concurrently",
                attempt.id
            )));
        }
        tx.record_gateway_exchange(
            attempt.id,
            cmd.request_payload.as_ref(),
            cmd.response_payload.as_ref(),
        )
        .await?;
        if !tx.try_move_open(attempt.id, PaymentStatus::Pending).await? {
            return Err(AppError::conflict(format!(
                "payment {} left the open states",
                attempt.id
            )));
        }
        let synced = tx
            .update_payment_fields(
                order.id,
                PayStatusGuard::Not(PaymentStatus::Success),
                &OrderPaymentFields {
                    pay_channel: Some(attempt.channel),
                    pay_status: Some(PaymentStatus::Pending),
                    payment_external_id: Some(external_id.clone()),
                    active_payment_id: Some(attempt.id),
                    pay_time: None,
                },
            )
            .await?;
        if !synced {
            return Err(AppError::conflict(format!(
                "order {} was paid concurrently",
                order.order_no
            )));
        }
        advance_order(
            &mut tx,
            &order,
            &[OrderStatus::Created],
            OrderStatus::PendingPayment,
            cmd.source,
            format!("payment {} bound to {}", attempt.id, external_id),
        )
        .await?;

        let bound = attempt_of(&mut tx, attempt.id).await?;
        tx.commit().await?;
        info!(
            payment_id = bound.id,
            order_id = order.id,
            external_id = %external_id,
            "external id bound"
        );
        Ok(PaymentResultView::of(&bound, &order))
    }

    // ------------------------------------------------------------------------
    // Capture result
    // ------------------------------------------------------------------------

    pub async fn apply_capture_result(&self, cmd: CaptureApplyCommand) -> AppResult<CaptureOutcome> {
        let external_id = non_blank(Some(cmd.external_id.as_str()))
            .ok_or_else(|| AppError::illegal_param("external_id", "must not be blank"))?
            .to_string();
        let capture_id = non_blank(cmd.capture_id.as_deref()).map(str::to_string);
        let now = Utc::now();

        let mut tx = self.begin().await?;
        let (attempt, order) = lock_attempt(&mut tx, cmd.payment_id).await?;
        if let Some(expected) = cmd.order_id {
            if expected != attempt.order_id {
                return Err(AppError::illegal_param(
                    "order_id",
                    format!("payment {} does not belong to order {}", attempt.id, expected),
                ));
            }
        }
        if let Some(bound) = attempt.external_id() {
            if bound != external_id {
                return Err(AppError::conflict(format!(
                    "capture for {} does not match payment {}",
                    external_id, attempt.id
                )));
            }
        }

        let audit = AttemptAudit {
            response_payload: cmd.response_payload.clone(),
            notify_payload: cmd.notify_payload.clone(),
            notified_at: cmd.notify_payload.as_ref().map(|_| now),
        };

        if order.status == OrderStatus::Refunded {
            tx.backfill_capture(attempt.id, &external_id, capture_id.as_deref())
                .await?;
            tx.record_audit(attempt.id, &audit).await?;
            let current = attempt_of(&mut tx, attempt.id).await?;
            tx.commit().await?;
            warn!(
                payment_id = attempt.id,
                order_id = order.id,
                external_id = %external_id,
                capture_success = cmd.capture_success,
                "capture absorbed by refunded order"
            );
            return Ok(CaptureOutcome {
                view: PaymentResultView::of(&current, &order).with_message("order already refunded"),
                applied: false,
                capture_id,
            });
        }

        if attempt.status == PaymentStatus::Success {
            debug!(payment_id = attempt.id, "capture replay on succeeded attempt");
            return Ok(CaptureOutcome {
                view: PaymentResultView::of(&attempt, &order).with_message("already paid"),
                applied: false,
                capture_id,
            });
        }

        let is_active = resolve_active(&mut tx, &order, attempt.id, Some(&external_id)).await?;
        let capture_time = cmd.capture_time.unwrap_or(now);
        let target = decide_capture(CaptureFacts {
            capture_success: cmd.capture_success,
            is_active,
            order_payable: order.is_payable(),
            order_closed_or_cancelled: order.is_closed_or_cancelled(),
            attempt_payable: attempt.status.is_open(),
            is_late: is_late_capture(order.created_at, self.config.payable_ttl, capture_time),
        });

        if target == PaymentStatus::Fail && !attempt.status.is_open() && !attempt.is_placeholder() {
            // A decline never rewrites a closed or already-flagged attempt.
            tx.record_audit(attempt.id, &audit).await?;
            tx.commit().await?;
            return Ok(CaptureOutcome {
                view: PaymentResultView::of(&attempt, &order).with_message("attempt already settled"),
                applied: false,
                capture_id,
            });
        }

        let applied = tx
            .try_apply_capture(
                attempt.id,
                &CaptureUpdate {
                    status: target,
                    external_id: external_id.clone(),
                    capture_id: capture_id.clone(),
                    response_payload: cmd.response_payload.clone(),
                    notify_payload: cmd.notify_payload.clone(),
                    notified_at: audit.notified_at,
                },
            )
            .await?;
        if !applied {
            return Err(AppError::conflict(format!(
                "payment {} succeeded concurrently",
                attempt.id
            )));
        }

        if is_active {
            let synced = tx
                .update_payment_fields(
                    order.id,
                    PayStatusGuard::Not(PaymentStatus::Success),
                    &OrderPaymentFields {
                        pay_channel: Some(attempt.channel),
                        pay_status: Some(target),
                        payment_external_id: Some(external_id.clone()),
                        active_payment_id: None,
                        pay_time: cmd.capture_success.then_some(capture_time),
                    },
                )
                .await?;
            if !synced {
                warn!(
                    order_id = order.id,
                    payment_id = attempt.id,
                    "order pay status already SUCCESS, mirror skipped"
                );
            }
        }

        if target == PaymentStatus::Success {
            let paid = advance_order(
                &mut tx,
                &order,
                &PAYABLE_ORDER_STATUSES,
                OrderStatus::Paid,
                cmd.source,
                format!("payment {} captured", attempt.id),
            )
            .await?;
            if !paid {
                return Err(AppError::conflict(format!(
                    "order {} left the payable states",
                    order.order_no
                )));
            }
        }

        let current = attempt_of(&mut tx, attempt.id).await?;
        tx.commit().await?;

        match target {
            PaymentStatus::Success => info!(
                payment_id = attempt.id,
                order_id = order.id,
                external_id = %external_id,
                "payment captured, order paid"
            ),
            PaymentStatus::Exception => warn!(
                payment_id = attempt.id,
                order_id = order.id,
                external_id = %external_id,
                is_active,
                order_status = %order.status,
                "capture recorded as exception"
            ),
            _ => info!(
                payment_id = attempt.id,
                order_id = order.id,
                external_id = %external_id,
                "capture failed"
            ),
        }

        Ok(CaptureOutcome {
            view: PaymentResultView::of(&current, &order),
            applied: true,
            capture_id: current.capture_id().map(str::to_string),
        })
    }

    /// Gate for a buyer capture. Closed, failed or superseded attempts never
    /// reach the gateway; a legacy self-heal found on the way is committed.
    pub async fn capture_target(&self, user_id: i64, payment_id: i64) -> AppResult<CaptureTarget> {
        let mut tx = self.begin().await?;
        let (attempt, order) = lock_attempt(&mut tx, payment_id).await?;
        if order.user_id != user_id {
            return Err(AppError::not_found("payment attempt", payment_id));
        }
        if attempt.status == PaymentStatus::Success {
            return Ok(CaptureTarget::AlreadyPaid(
                PaymentResultView::of(&attempt, &order).with_message("already paid"),
            ));
        }
        let external_id = attempt
            .external_id()
            .map(str::to_string)
            .ok_or_else(|| AppError::illegal_param("payment_id", "payment has no gateway order"))?;
        if !attempt.status.is_open() {
            return Err(AppError::conflict(format!(
                "payment {} is {} and cannot be captured",
                payment_id, attempt.status
            )));
        }

        let is_active = resolve_active(&mut tx, &order, attempt.id, Some(&external_id)).await?;
        tx.commit().await?;
        if !is_active {
            warn!(
                payment_id,
                order_id = order.id,
                active_payment_id = ?order.active_payment_id,
                "capture requested for a superseded attempt"
            );
            return Err(AppError::conflict(format!(
                "payment {} is no longer the active attempt of order {}",
                payment_id, order.order_no
            )));
        }
        Ok(CaptureTarget::Ready {
            attempt,
            external_id,
        })
    }

    // ------------------------------------------------------------------------
    // Cancel / close
    // ------------------------------------------------------------------------

    /// Buyer cancel. Closing an already closed attempt is a no-op.
    pub async fn cancel_attempt(
        &self,
        user_id: i64,
        payment_id: i64,
        source: EventSource,
    ) -> AppResult<PaymentResultView> {
        let mut tx = self.begin().await?;
        let (attempt, order) = lock_attempt(&mut tx, payment_id).await?;
        if order.user_id != user_id {
            return Err(AppError::not_found("payment attempt", payment_id));
        }

        match attempt.status {
            PaymentStatus::Closed => {
                return Ok(PaymentResultView::of(&attempt, &order).with_message("no-op"));
            }
            PaymentStatus::Success => {
                return Err(AppError::conflict(format!(
                    "payment {} is completed and cannot be cancelled",
                    payment_id
                )));
            }
            _ => {}
        }
        if attempt.channel == PaymentChannel::None {
            return Err(AppError::conflict(format!(
                "payment {} has no channel to cancel",
                payment_id
            )));
        }
        if !tx.try_close(attempt.id, &OPEN_PAYMENT_STATUSES).await? {
            return Err(AppError::conflict(format!(
                "payment {} in status {} cannot be cancelled",
                payment_id, attempt.status
            )));
        }

        self.mirror_closed(&mut tx, &order, &attempt).await?;
        let current = attempt_of(&mut tx, attempt.id).await?;
        tx.commit().await?;
        info!(payment_id, order_id = order.id, ?source, "payment cancelled");
        Ok(PaymentResultView::of(&current, &order))
    }

    /// Ops/scanner close after the gateway voided the order. Never fails on
    /// settled attempts.
    pub async fn close_attempt_for_ops(&self, payment_id: i64, source: EventSource) -> AppResult<()> {
        let mut tx = self.begin().await?;
        let (attempt, order) = lock_attempt(&mut tx, payment_id).await?;
        if !attempt.status.is_open() {
            return Ok(());
        }
        if !tx.try_close(attempt.id, &OPEN_PAYMENT_STATUSES).await? {
            let current = attempt_of(&mut tx, attempt.id).await?;
            return match current.status {
                PaymentStatus::Closed | PaymentStatus::Success => Ok(()),
                other => Err(AppError::conflict(format!(
                    "payment {} moved to {} while closing",
                    payment_id, other
                ))),
            };
        }
        self.mirror_closed(&mut tx, &order, &attempt).await?;
        tx.commit().await?;
        info!(payment_id, order_id = order.id, ?source, "payment closed");
        Ok(())
    }

    async fn mirror_closed(&self, tx: &mut Tx, order: &Order, attempt: &PaymentAttempt) -> AppResult<()> {
        let is_active = resolve_active(tx, order, attempt.id, attempt.external_id()).await?;
        if is_active {
            tx.update_payment_fields(
                order.id,
                PayStatusGuard::Not(PaymentStatus::Success),
                &OrderPaymentFields {
                    pay_status: Some(PaymentStatus::Closed),
                    ..Default::default()
                },
            )
            .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Refunds
    // ------------------------------------------------------------------------

    /// Finds or creates the refund row a gateway refund belongs to.
    ///
    /// Concurrent deliveries race on the unique constraints; the loser rereads
    /// in a fresh transaction. Finding nothing after a violation is an
    /// inconsistency and is not retried.
    pub async fn resolve_refund_target(&self, notice: RefundNotice) -> AppResult<RefundAttempt> {
        let external_refund_id = non_blank(Some(notice.external_refund_id.as_str()))
            .ok_or_else(|| AppError::illegal_param("external_refund_id", "must not be blank"))?
            .to_string();
        let dedupe_key = RefundDedupeKey::webhook(notice.payment_id, &external_refund_id);

        let mut tx = self.begin().await?;
        if let Some(found) = tx.find_refund_by_external_id(&external_refund_id).await? {
            if found.payment_attempt_id != notice.payment_id {
                return Err(AppError::conflict(format!(
                    "refund {} belongs to payment {}",
                    external_refund_id, found.payment_attempt_id
                )));
            }
            return Ok(found);
        }
        if let Some(open) = tx.find_open_unbound_refund(notice.payment_id).await? {
            return Ok(open);
        }

        let attempt = attempt_of(&mut tx, notice.payment_id).await?;
        let insert = tx
            .insert_refund(&NewRefundAttempt {
                refund_no: NewRefundAttempt::generate_refund_no(),
                order_id: attempt.order_id,
                payment_attempt_id: attempt.id,
                external_refund_id: Some(external_refund_id.clone()),
                client_dedupe_key: Some(dedupe_key.to_string()),
                amount_minor: notice.amount_minor.unwrap_or(attempt.amount_minor),
                currency: notice.currency.clone().unwrap_or_else(|| attempt.currency.clone()),
                status: RefundStatus::Init,
                reason_code: RefundReasonCode::Other,
                initiator: RefundInitiator::System,
                request_payload: None,
                response_payload: None,
                notify_payload: notice.notify_payload.clone(),
                last_notified_at: notice.notified_at,
            })
            .await;

        match insert {
            Ok(created) => {
                tx.commit().await?;
                info!(
                    refund_id = created.id,
                    payment_id = attempt.id,
                    external_refund_id = %external_refund_id,
                    "refund row created from gateway notice"
                );
                Ok(created)
            }
            Err(err) if err.is_unique_violation() => {
                drop(tx);
                let mut reread = self.begin().await?;
                if let Some(found) = reread.find_refund_by_external_id(&external_refund_id).await? {
                    return Ok(found);
                }
                if let Some(found) = reread
                    .find_refund_by_dedupe_key(notice.payment_id, dedupe_key.as_str())
                    .await?
                {
                    return Ok(found);
                }
                error!(
                    payment_id = notice.payment_id,
                    external_refund_id = %external_refund_id,
                    dedupe_key = %dedupe_key,
                    "refund insert conflicted but no row is visible"
                );
                Err(AppError::conflict(format!(
                    "refund {} could not be resolved after a duplicate insert",
                    external_refund_id
                ))
                .with_context("inconsistent refund state"))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Records a system-initiated refund created at the gateway.
    pub async fn record_system_refund(&self, refund: SystemRefund) -> AppResult<RefundAttempt> {
        let mut tx = self.begin().await?;
        let (attempt, _order) = lock_attempt(&mut tx, refund.payment_id).await?;
        let insert = tx
            .insert_refund(&NewRefundAttempt {
                refund_no: NewRefundAttempt::generate_refund_no(),
                order_id: attempt.order_id,
                payment_attempt_id: attempt.id,
                external_refund_id: refund
                    .external_refund_id
                    .as_deref()
                    .and_then(|id| non_blank(Some(id)))
                    .map(str::to_string),
                client_dedupe_key: Some(refund.dedupe_key.to_string()),
                amount_minor: refund.amount.amount_minor,
                currency: refund.amount.currency.clone(),
                status: RefundStatus::Init,
                reason_code: refund.reason_code,
                initiator: RefundInitiator::System,
                request_payload: refund.request_payload.clone(),
                response_payload: refund.response_payload.clone(),
                notify_payload: None,
                last_notified_at: None,
            })
            .await;

        match insert {
            Ok(created) => {
                tx.commit().await?;
                Ok(created)
            }
            Err(err) if err.is_unique_violation() => {
                drop(tx);
                self.refund_by_dedupe_key(refund.payment_id, &refund.dedupe_key)
                    .await?
                    .ok_or_else(|| {
                        AppError::conflict(format!(
                            "system refund {} conflicted but no row is visible",
                            refund.dedupe_key
                        ))
                    })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Applies a gateway refund status. Moves only forward.
    pub async fn apply_refund_result(&self, cmd: RefundResultCommand) -> AppResult<RefundAttempt> {
        let mut tx = self.begin().await?;
        let unlocked = refund_of(&mut tx, cmd.refund_id).await?;
        let order = locked_order(&mut tx, unlocked.order_id).await?;
        let refund = refund_of(&mut tx, cmd.refund_id).await?;

        if let Some(external) = non_blank(cmd.external_refund_id.as_deref()) {
            match refund.external_refund_id() {
                None => {
                    tx.bind_external_refund_id(refund.id, external).await?;
                }
                Some(bound) if bound != external => {
                    return Err(AppError::conflict(format!(
                        "refund {} is bound to a different external refund id",
                        refund.id
                    )));
                }
                Some(_) => {}
            }
        }
        if let Some(payload) = cmd.notify_payload.as_ref() {
            tx.record_refund_notification(refund.id, payload, cmd.notified_at.unwrap_or_else(Utc::now))
                .await?;
        }

        let mut finished = false;
        match cmd.status {
            RefundStatus::Init => {}
            RefundStatus::Pending => {
                tx.try_mark_refund_pending(refund.id).await?;
            }
            status if refund.status.is_open() => {
                if !tx
                    .try_finish_refund(refund.id, status, cmd.response_payload.as_ref())
                    .await?
                {
                    return Err(AppError::conflict(format!(
                        "refund {} was finished concurrently",
                        refund.id
                    )));
                }
                finished = true;
            }
            status if status == refund.status => {
                debug!(refund_id = refund.id, "refund result replay");
            }
            status => {
                return Err(AppError::conflict(format!(
                    "refund {} is already {} and cannot become {}",
                    refund.id, refund.status, status
                )));
            }
        }

        if finished && cmd.status == RefundStatus::Success {
            advance_order(
                &mut tx,
                &order,
                &[OrderStatus::Refunding],
                OrderStatus::Refunded,
                cmd.source,
                format!("refund {} completed", refund.refund_no),
            )
            .await?;
        }

        let current = refund_of(&mut tx, refund.id).await?;
        tx.commit().await?;
        if finished {
            info!(
                refund_id = current.id,
                order_id = order.id,
                status = %current.status,
                "refund finished"
            );
        }
        Ok(current)
    }

    // ------------------------------------------------------------------------
    // Reads and poll stamps
    // ------------------------------------------------------------------------

    pub async fn find_attempt(&self, payment_id: i64) -> AppResult<PaymentAttempt> {
        let mut tx = self.begin().await?;
        attempt_of(&mut tx, payment_id).await
    }

    /// Attempt together with its order. The order row is read under lock and
    /// the lock is released when the read-only transaction drops.
    pub async fn find_attempt_with_order(&self, payment_id: i64) -> AppResult<(PaymentAttempt, Order)> {
        let mut tx = self.begin().await?;
        let attempt = attempt_of(&mut tx, payment_id).await?;
        let order = locked_order(&mut tx, attempt.order_id).await?;
        Ok((attempt, order))
    }

    pub async fn find_attempt_by_external_id(&self, external_id: &str) -> AppResult<Option<PaymentAttempt>> {
        let mut tx = self.begin().await?;
        Ok(tx.find_attempt_by_external_id(external_id).await?)
    }

    pub async fn find_refund(&self, refund_id: i64) -> AppResult<RefundAttempt> {
        let mut tx = self.begin().await?;
        refund_of(&mut tx, refund_id).await
    }

    pub async fn refund_by_dedupe_key(
        &self,
        payment_id: i64,
        key: &RefundDedupeKey,
    ) -> AppResult<Option<RefundAttempt>> {
        let mut tx = self.begin().await?;
        Ok(tx.find_refund_by_dedupe_key(payment_id, key.as_str()).await?)
    }

    pub async fn list_sync_candidates(&self, limit: u32) -> AppResult<Vec<PaymentAttempt>> {
        let mut tx = self.begin().await?;
        Ok(tx.list_sync_candidates(limit).await?)
    }

    pub async fn list_refund_sync_candidates(&self, limit: u32) -> AppResult<Vec<RefundAttempt>> {
        let mut tx = self.begin().await?;
        Ok(tx.list_refund_sync_candidates(limit).await?)
    }

    pub async fn mark_polled(&self, payment_id: i64, poll: PollRecord) -> AppResult<()> {
        let mut tx = self.begin().await?;
        if !tx.mark_polled(payment_id, &poll).await? {
            return Err(AppError::not_found("payment attempt", payment_id));
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn mark_refund_polled(
        &self,
        refund_id: i64,
        polled_at: DateTime<Utc>,
        response_payload: Option<&JsonValue>,
    ) -> AppResult<()> {
        let mut tx = self.begin().await?;
        if !tx.mark_refund_polled(refund_id, polled_at, response_payload).await? {
            return Err(AppError::not_found("refund attempt", refund_id));
        }
        tx.commit().await?;
        Ok(())
    }
}
