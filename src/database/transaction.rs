use async_trait::async_trait;

use super::error::DatabaseResult;
use super::order_ledger::OrderLedger;
use super::payment_attempt_repository::PaymentAttemptStore;
use super::refund_attempt_repository::RefundAttemptStore;

/// One unit of work spanning the order ledger and both attempt stores.
///
/// Dropping a transaction without calling [`PaymentTx::commit`] rolls it back.
#[async_trait]
pub trait PaymentTx: OrderLedger + PaymentAttemptStore + RefundAttemptStore {
    async fn commit(self: Box<Self>) -> DatabaseResult<()>;
}

/// Source of payment transactions.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> DatabaseResult<Box<dyn PaymentTx>>;
}
