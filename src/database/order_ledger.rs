//! Boundary with the order bounded context.
//!
//! The payment core never owns order rows. It only locks them, mirrors the
//! redundant payment columns and moves the status along a few edges.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::entities::{NewStatusLog, Order, OrderStatus, PaymentChannel, PaymentStatus};
use super::error::DatabaseResult;

/// Precondition on `orders.pay_status` for a conditional field update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayStatusGuard {
    Any,
    Not(PaymentStatus),
    Is(PaymentStatus),
}

impl PayStatusGuard {
    pub fn admits(&self, current: PaymentStatus) -> bool {
        match self {
            Self::Any => true,
            Self::Not(status) => current != *status,
            Self::Is(status) => current == *status,
        }
    }
}

/// Redundant payment columns on the order; `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderPaymentFields {
    pub pay_channel: Option<PaymentChannel>,
    pub pay_status: Option<PaymentStatus>,
    pub payment_external_id: Option<String>,
    pub active_payment_id: Option<i64>,
    pub pay_time: Option<DateTime<Utc>>,
}

impl OrderPaymentFields {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Applies the populated fields to an in-memory order copy.
    pub fn apply_to(&self, order: &mut Order) {
        if let Some(channel) = self.pay_channel {
            order.pay_channel = channel;
        }
        if let Some(status) = self.pay_status {
            order.pay_status = status;
        }
        if let Some(external_id) = &self.payment_external_id {
            order.payment_external_id = Some(external_id.clone());
        }
        if let Some(payment_id) = self.active_payment_id {
            order.active_payment_id = Some(payment_id);
        }
        if let Some(pay_time) = self.pay_time {
            order.pay_time = Some(pay_time);
        }
    }
}

#[async_trait]
pub trait OrderLedger: Send {
    /// Reads the order and holds its row lock until the transaction ends.
    async fn lock_order(&mut self, order_id: i64) -> DatabaseResult<Option<Order>>;

    /// Writes the populated payment fields if `pay_status` satisfies `guard`.
    async fn update_payment_fields(
        &mut self,
        order_id: i64,
        guard: PayStatusGuard,
        fields: &OrderPaymentFields,
    ) -> DatabaseResult<bool>;

    /// Sets `active_payment_id` only while it is still null.
    async fn claim_active_payment(&mut self, order_id: i64, payment_id: i64)
        -> DatabaseResult<bool>;

    async fn advance_status(
        &mut self,
        order_id: i64,
        from: &[OrderStatus],
        to: OrderStatus,
    ) -> DatabaseResult<bool>;

    async fn append_status_log(&mut self, entry: &NewStatusLog) -> DatabaseResult<()>;
}
