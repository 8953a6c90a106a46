//! In-process ledger used by tests and local runs.
//!
//! Transactions are serialised behind one async mutex, which is strictly
//! stronger than the row lock + CAS contract the Postgres adapter provides.
//! Each transaction keeps a snapshot and restores it when dropped uncommitted.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::entities::{
    meaningful_payload, non_blank, NewPaymentAttempt, NewRefundAttempt, NewStatusLog, Order,
    OrderStatus, PaymentAttempt, PaymentChannel, PaymentStatus, RefundAttempt, RefundStatus,
    StatusLogEntry,
};
use super::error::{DatabaseError, DatabaseResult};
use super::order_ledger::{OrderLedger, OrderPaymentFields, PayStatusGuard};
use super::payment_attempt_repository::{
    clamp_batch_limit, AttemptAudit, CaptureUpdate, PaymentAttemptStore, PollRecord,
};
use super::refund_attempt_repository::RefundAttemptStore;
use super::transaction::{LedgerStore, PaymentTx};

#[derive(Debug, Clone, Default)]
struct LedgerState {
    orders: BTreeMap<i64, Order>,
    attempts: BTreeMap<i64, PaymentAttempt>,
    refunds: BTreeMap<i64, RefundAttempt>,
    status_log: Vec<StatusLogEntry>,
    attempt_seq: i64,
    refund_seq: i64,
    log_seq: i64,
}

impl LedgerState {
    fn insert_attempt(&mut self, new: &NewPaymentAttempt) -> PaymentAttempt {
        self.attempt_seq += 1;
        let now = Utc::now();
        let attempt = PaymentAttempt {
            id: self.attempt_seq,
            order_id: new.order_id,
            channel: new.channel,
            status: new.status,
            external_id: None,
            capture_id: None,
            amount_minor: new.amount_minor,
            currency: new.currency.clone(),
            request_payload: None,
            response_payload: None,
            notify_payload: None,
            last_polled_at: None,
            last_notified_at: None,
            created_at: now,
            updated_at: now,
        };
        self.attempts.insert(attempt.id, attempt.clone());
        attempt
    }

    fn attempt_mut(&mut self, id: i64) -> Option<&mut PaymentAttempt> {
        self.attempts.get_mut(&id)
    }

    fn refund_mut(&mut self, id: i64) -> Option<&mut RefundAttempt> {
        self.refunds.get_mut(&id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an order row owned by the order context.
    pub async fn insert_order(&self, order: Order) {
        self.state.lock().await.orders.insert(order.id, order);
    }

    /// Seeds an attempt row directly, e.g. a NONE/NONE placeholder.
    pub async fn seed_attempt(&self, attempt: NewPaymentAttempt) -> PaymentAttempt {
        self.state.lock().await.insert_attempt(&attempt)
    }

    /// Overwrites order fields outside the payment flows, as the order context would.
    pub async fn update_order<F>(&self, order_id: i64, change: F)
    where
        F: FnOnce(&mut Order) + Send,
    {
        if let Some(order) = self.state.lock().await.orders.get_mut(&order_id) {
            change(order);
            order.updated_at = Utc::now();
        }
    }

    pub async fn order(&self, order_id: i64) -> Option<Order> {
        self.state.lock().await.orders.get(&order_id).cloned()
    }

    pub async fn attempt(&self, id: i64) -> Option<PaymentAttempt> {
        self.state.lock().await.attempts.get(&id).cloned()
    }

    pub async fn attempts_for_order(&self, order_id: i64) -> Vec<PaymentAttempt> {
        self.state
            .lock()
            .await
            .attempts
            .values()
            .filter(|a| a.order_id == order_id)
            .cloned()
            .collect()
    }

    pub async fn refund(&self, id: i64) -> Option<RefundAttempt> {
        self.state.lock().await.refunds.get(&id).cloned()
    }

    pub async fn refunds_for_order(&self, order_id: i64) -> Vec<RefundAttempt> {
        self.state
            .lock()
            .await
            .refunds
            .values()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect()
    }

    pub async fn status_log(&self, order_id: i64) -> Vec<StatusLogEntry> {
        self.state
            .lock()
            .await
            .status_log
            .iter()
            .filter(|e| e.order_id == order_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn begin(&self) -> DatabaseResult<Box<dyn PaymentTx>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            snapshot: Some(snapshot),
        }))
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<LedgerState>,
    snapshot: Option<LedgerState>,
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

fn set_if_meaningful(slot: &mut Option<JsonValue>, payload: Option<&JsonValue>) {
    if let Some(p) = meaningful_payload(payload) {
        *slot = Some(p.clone());
    }
}

#[async_trait]
impl PaymentTx for MemoryTx {
    async fn commit(mut self: Box<Self>) -> DatabaseResult<()> {
        self.snapshot = None;
        Ok(())
    }
}

#[async_trait]
impl OrderLedger for MemoryTx {
    async fn lock_order(&mut self, order_id: i64) -> DatabaseResult<Option<Order>> {
        Ok(self.guard.orders.get(&order_id).cloned())
    }

    async fn update_payment_fields(
        &mut self,
        order_id: i64,
        guard: PayStatusGuard,
        fields: &OrderPaymentFields,
    ) -> DatabaseResult<bool> {
        let Some(order) = self.guard.orders.get_mut(&order_id) else {
            return Ok(false);
        };
        if !guard.admits(order.pay_status) {
            return Ok(false);
        }
        fields.apply_to(order);
        order.updated_at = Utc::now();
        Ok(true)
    }

    async fn claim_active_payment(
        &mut self,
        order_id: i64,
        payment_id: i64,
    ) -> DatabaseResult<bool> {
        match self.guard.orders.get_mut(&order_id) {
            Some(order) if order.active_payment_id.is_none() => {
                order.active_payment_id = Some(payment_id);
                order.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn advance_status(
        &mut self,
        order_id: i64,
        from: &[OrderStatus],
        to: OrderStatus,
    ) -> DatabaseResult<bool> {
        match self.guard.orders.get_mut(&order_id) {
            Some(order) if from.contains(&order.status) => {
                order.status = to;
                order.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_status_log(&mut self, entry: &NewStatusLog) -> DatabaseResult<()> {
        let state = &mut *self.guard;
        state.log_seq += 1;
        state.status_log.push(StatusLogEntry {
            id: state.log_seq,
            order_id: entry.order_id,
            source: entry.source,
            from_status: entry.from_status,
            to_status: entry.to_status,
            note: entry.note.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }
}

#[async_trait]
impl PaymentAttemptStore for MemoryTx {
    async fn find_attempt(&mut self, id: i64) -> DatabaseResult<Option<PaymentAttempt>> {
        Ok(self.guard.attempts.get(&id).cloned())
    }

    async fn find_attempt_by_external_id(
        &mut self,
        external_id: &str,
    ) -> DatabaseResult<Option<PaymentAttempt>> {
        Ok(self
            .guard
            .attempts
            .values()
            .find(|a| a.external_id() == Some(external_id))
            .cloned())
    }

    async fn insert_attempt(
        &mut self,
        attempt: &NewPaymentAttempt,
    ) -> DatabaseResult<PaymentAttempt> {
        Ok(self.guard.insert_attempt(attempt))
    }

    async fn try_upgrade_placeholder(
        &mut self,
        id: i64,
        channel: PaymentChannel,
        amount_minor: i64,
        currency: &str,
    ) -> DatabaseResult<bool> {
        match self.guard.attempt_mut(id) {
            Some(a) if a.is_placeholder() => {
                a.channel = channel;
                a.status = PaymentStatus::Init;
                a.amount_minor = amount_minor;
                a.currency = currency.to_string();
                a.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_close(&mut self, id: i64, from: &[PaymentStatus]) -> DatabaseResult<bool> {
        match self.guard.attempt_mut(id) {
            Some(a) if from.contains(&a.status) => {
                a.status = PaymentStatus::Closed;
                a.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn close_open_siblings(&mut self, order_id: i64, keep_id: i64) -> DatabaseResult<u64> {
        let now = Utc::now();
        let mut closed = 0;
        for attempt in self.guard.attempts.values_mut() {
            if attempt.order_id == order_id && attempt.id != keep_id && attempt.status.is_open() {
                attempt.status = PaymentStatus::Closed;
                attempt.updated_at = now;
                closed += 1;
            }
        }
        Ok(closed)
    }

    async fn try_move_open(&mut self, id: i64, to: PaymentStatus) -> DatabaseResult<bool> {
        if !to.is_open() {
            return Ok(false);
        }
        match self.guard.attempt_mut(id) {
            Some(a) if a.status.is_open() => {
                if a.status != to {
                    a.status = to;
                    a.updated_at = Utc::now();
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn bind_external_id(&mut self, id: i64, external_id: &str) -> DatabaseResult<bool> {
        let taken = self
            .guard
            .attempts
            .values()
            .any(|a| a.id != id && a.external_id() == Some(external_id));
        if taken {
            return Err(DatabaseError::unique_violation("uk_payment_attempt_external_id"));
        }
        match self.guard.attempt_mut(id) {
            Some(a) if a.external_id().is_none() => {
                a.external_id = Some(external_id.to_string());
                a.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_gateway_exchange(
        &mut self,
        id: i64,
        request_payload: Option<&JsonValue>,
        response_payload: Option<&JsonValue>,
    ) -> DatabaseResult<bool> {
        let Some(a) = self.guard.attempt_mut(id) else {
            return Ok(false);
        };
        set_if_meaningful(&mut a.request_payload, request_payload);
        set_if_meaningful(&mut a.response_payload, response_payload);
        a.updated_at = Utc::now();
        Ok(true)
    }

    async fn try_apply_capture(
        &mut self,
        id: i64,
        update: &CaptureUpdate,
    ) -> DatabaseResult<bool> {
        let Some(a) = self.guard.attempt_mut(id) else {
            return Ok(false);
        };
        if a.status == PaymentStatus::Success {
            return Ok(false);
        }
        a.status = update.status;
        if a.external_id().is_none() {
            a.external_id = Some(update.external_id.clone());
        }
        if let Some(capture_id) = non_blank(update.capture_id.as_deref()) {
            a.capture_id = Some(capture_id.to_string());
        }
        set_if_meaningful(&mut a.response_payload, update.response_payload.as_ref());
        set_if_meaningful(&mut a.notify_payload, update.notify_payload.as_ref());
        if update.notified_at.is_some() {
            a.last_notified_at = update.notified_at;
        }
        a.updated_at = Utc::now();
        Ok(true)
    }

    async fn backfill_capture(
        &mut self,
        id: i64,
        external_id: &str,
        capture_id: Option<&str>,
    ) -> DatabaseResult<bool> {
        let Some(a) = self.guard.attempt_mut(id) else {
            return Ok(false);
        };
        let mut changed = false;
        if a.external_id().is_none() {
            a.external_id = Some(external_id.to_string());
            changed = true;
        }
        if let Some(capture_id) = non_blank(capture_id) {
            if a.capture_id().is_none() {
                a.capture_id = Some(capture_id.to_string());
                changed = true;
            }
        }
        if changed {
            a.updated_at = Utc::now();
        }
        Ok(changed)
    }

    async fn record_audit(&mut self, id: i64, audit: &AttemptAudit) -> DatabaseResult<bool> {
        let Some(a) = self.guard.attempt_mut(id) else {
            return Ok(false);
        };
        set_if_meaningful(&mut a.response_payload, audit.response_payload.as_ref());
        set_if_meaningful(&mut a.notify_payload, audit.notify_payload.as_ref());
        if audit.notified_at.is_some() {
            a.last_notified_at = audit.notified_at;
        }
        a.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_polled(&mut self, id: i64, poll: &PollRecord) -> DatabaseResult<bool> {
        let Some(a) = self.guard.attempt_mut(id) else {
            return Ok(false);
        };
        a.last_polled_at = Some(poll.polled_at);
        set_if_meaningful(&mut a.response_payload, poll.response_payload.as_ref());
        if let Some(capture_id) = non_blank(poll.capture_id.as_deref()) {
            if a.capture_id().is_none() {
                a.capture_id = Some(capture_id.to_string());
            }
        }
        a.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_sync_candidates(&mut self, limit: u32) -> DatabaseResult<Vec<PaymentAttempt>> {
        let mut rows: Vec<PaymentAttempt> = self
            .guard
            .attempts
            .values()
            .filter(|a| a.status.is_open() && a.external_id().is_some())
            .cloned()
            .collect();
        rows.sort_by_key(|a| (a.updated_at, a.id));
        rows.truncate(clamp_batch_limit(limit) as usize);
        Ok(rows)
    }
}

#[async_trait]
impl RefundAttemptStore for MemoryTx {
    async fn find_refund(&mut self, id: i64) -> DatabaseResult<Option<RefundAttempt>> {
        Ok(self.guard.refunds.get(&id).cloned())
    }

    async fn find_refund_by_external_id(
        &mut self,
        external_refund_id: &str,
    ) -> DatabaseResult<Option<RefundAttempt>> {
        Ok(self
            .guard
            .refunds
            .values()
            .find(|r| r.external_refund_id() == Some(external_refund_id))
            .cloned())
    }

    async fn find_open_unbound_refund(
        &mut self,
        payment_attempt_id: i64,
    ) -> DatabaseResult<Option<RefundAttempt>> {
        Ok(self
            .guard
            .refunds
            .values()
            .filter(|r| {
                r.payment_attempt_id == payment_attempt_id
                    && r.status.is_open()
                    && r.external_refund_id().is_none()
            })
            .max_by_key(|r| (r.created_at, r.id))
            .cloned())
    }

    async fn find_refund_by_dedupe_key(
        &mut self,
        payment_attempt_id: i64,
        dedupe_key: &str,
    ) -> DatabaseResult<Option<RefundAttempt>> {
        Ok(self
            .guard
            .refunds
            .values()
            .find(|r| {
                r.payment_attempt_id == payment_attempt_id
                    && r.client_dedupe_key.as_deref() == Some(dedupe_key)
            })
            .cloned())
    }

    async fn insert_refund(&mut self, refund: &NewRefundAttempt) -> DatabaseResult<RefundAttempt> {
        let state = &mut *self.guard;
        if let Some(external) = non_blank(refund.external_refund_id.as_deref()) {
            if state
                .refunds
                .values()
                .any(|r| r.external_refund_id() == Some(external))
            {
                return Err(DatabaseError::unique_violation("uk_refund_attempt_external_id"));
            }
        }
        if let Some(key) = refund.client_dedupe_key.as_deref() {
            if state.refunds.values().any(|r| {
                r.payment_attempt_id == refund.payment_attempt_id
                    && r.client_dedupe_key.as_deref() == Some(key)
            }) {
                return Err(DatabaseError::unique_violation("uk_refund_attempt_dedupe"));
            }
        }
        state.refund_seq += 1;
        let now = Utc::now();
        let row = RefundAttempt {
            id: state.refund_seq,
            refund_no: refund.refund_no.clone(),
            order_id: refund.order_id,
            payment_attempt_id: refund.payment_attempt_id,
            external_refund_id: non_blank(refund.external_refund_id.as_deref()).map(str::to_string),
            client_dedupe_key: refund.client_dedupe_key.clone(),
            amount_minor: refund.amount_minor,
            currency: refund.currency.clone(),
            status: refund.status,
            reason_code: refund.reason_code,
            initiator: refund.initiator,
            request_payload: refund.request_payload.clone(),
            response_payload: refund.response_payload.clone(),
            notify_payload: refund.notify_payload.clone(),
            last_polled_at: None,
            last_notified_at: refund.last_notified_at,
            created_at: now,
            updated_at: now,
        };
        state.refunds.insert(row.id, row.clone());
        Ok(row)
    }

    async fn bind_external_refund_id(
        &mut self,
        id: i64,
        external_refund_id: &str,
    ) -> DatabaseResult<bool> {
        let taken = self
            .guard
            .refunds
            .values()
            .any(|r| r.id != id && r.external_refund_id() == Some(external_refund_id));
        if taken {
            return Err(DatabaseError::unique_violation("uk_refund_attempt_external_id"));
        }
        match self.guard.refund_mut(id) {
            Some(r) if r.external_refund_id().is_none() => {
                r.external_refund_id = Some(external_refund_id.to_string());
                r.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_mark_refund_pending(&mut self, id: i64) -> DatabaseResult<bool> {
        match self.guard.refund_mut(id) {
            Some(r) if r.status == RefundStatus::Init => {
                r.status = RefundStatus::Pending;
                r.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_finish_refund(
        &mut self,
        id: i64,
        to: RefundStatus,
        response_payload: Option<&JsonValue>,
    ) -> DatabaseResult<bool> {
        if !to.is_final() {
            return Ok(false);
        }
        match self.guard.refund_mut(id) {
            Some(r) if r.status.is_open() => {
                r.status = to;
                set_if_meaningful(&mut r.response_payload, response_payload);
                r.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_refund_notification(
        &mut self,
        id: i64,
        notify_payload: &JsonValue,
        notified_at: chrono::DateTime<Utc>,
    ) -> DatabaseResult<bool> {
        let Some(r) = self.guard.refund_mut(id) else {
            return Ok(false);
        };
        set_if_meaningful(&mut r.notify_payload, Some(notify_payload));
        r.last_notified_at = Some(notified_at);
        r.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_refund_polled(
        &mut self,
        id: i64,
        polled_at: chrono::DateTime<Utc>,
        response_payload: Option<&JsonValue>,
    ) -> DatabaseResult<bool> {
        let Some(r) = self.guard.refund_mut(id) else {
            return Ok(false);
        };
        r.last_polled_at = Some(polled_at);
        set_if_meaningful(&mut r.response_payload, response_payload);
        r.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_refund_sync_candidates(
        &mut self,
        limit: u32,
    ) -> DatabaseResult<Vec<RefundAttempt>> {
        let mut rows: Vec<RefundAttempt> = self
            .guard
            .refunds
            .values()
            .filter(|r| r.status.is_open() && r.external_refund_id().is_some())
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.updated_at, r.id));
        rows.truncate(clamp_batch_limit(limit) as usize);
        Ok(rows)
    }
}
