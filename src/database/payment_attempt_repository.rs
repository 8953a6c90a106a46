//! Payment attempt rows and their named CAS transitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use super::entities::{NewPaymentAttempt, PaymentAttempt, PaymentChannel, PaymentStatus};
use super::error::DatabaseResult;

/// Upper bound on one scanner batch.
pub const MAX_SYNC_BATCH: u32 = 200;

pub fn clamp_batch_limit(limit: u32) -> u32 {
    limit.clamp(1, MAX_SYNC_BATCH)
}

/// Outcome of one capture applied to an attempt row.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureUpdate {
    pub status: PaymentStatus,
    /// Bound only if the row has none yet.
    pub external_id: String,
    pub capture_id: Option<String>,
    pub response_payload: Option<JsonValue>,
    pub notify_payload: Option<JsonValue>,
    pub notified_at: Option<DateTime<Utc>>,
}

/// Audit-only write used when status must not move.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptAudit {
    pub response_payload: Option<JsonValue>,
    pub notify_payload: Option<JsonValue>,
    pub notified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollRecord {
    pub polled_at: DateTime<Utc>,
    /// Ignored when blank or `{}`.
    pub response_payload: Option<JsonValue>,
    /// Backfilled only if the row has none yet.
    pub capture_id: Option<String>,
}

#[async_trait]
pub trait PaymentAttemptStore: Send {
    async fn find_attempt(&mut self, id: i64) -> DatabaseResult<Option<PaymentAttempt>>;

    async fn find_attempt_by_external_id(
        &mut self,
        external_id: &str,
    ) -> DatabaseResult<Option<PaymentAttempt>>;

    async fn insert_attempt(&mut self, attempt: &NewPaymentAttempt)
        -> DatabaseResult<PaymentAttempt>;

    /// NONE/NONE placeholder to `{channel, INIT}` with a fresh amount.
    async fn try_upgrade_placeholder(
        &mut self,
        id: i64,
        channel: PaymentChannel,
        amount_minor: i64,
        currency: &str,
    ) -> DatabaseResult<bool>;

    /// Any status in `from` to CLOSED.
    async fn try_close(&mut self, id: i64, from: &[PaymentStatus]) -> DatabaseResult<bool>;

    /// Closes every INIT/PENDING attempt of the order except `keep_id`.
    async fn close_open_siblings(&mut self, order_id: i64, keep_id: i64) -> DatabaseResult<u64>;

    /// INIT/PENDING to `to`, which must itself be INIT or PENDING.
    async fn try_move_open(&mut self, id: i64, to: PaymentStatus) -> DatabaseResult<bool>;

    /// Binds the gateway order id if the column is still empty.
    async fn bind_external_id(&mut self, id: i64, external_id: &str) -> DatabaseResult<bool>;

    async fn record_gateway_exchange(
        &mut self,
        id: i64,
        request_payload: Option<&JsonValue>,
        response_payload: Option<&JsonValue>,
    ) -> DatabaseResult<bool>;

    /// Writes the capture outcome unless the attempt already succeeded.
    async fn try_apply_capture(&mut self, id: i64, update: &CaptureUpdate)
        -> DatabaseResult<bool>;

    /// Fills `capture_id` and `external_id` where they are still empty.
    async fn backfill_capture(
        &mut self,
        id: i64,
        external_id: &str,
        capture_id: Option<&str>,
    ) -> DatabaseResult<bool>;

    async fn record_audit(&mut self, id: i64, audit: &AttemptAudit) -> DatabaseResult<bool>;

    async fn mark_polled(&mut self, id: i64, poll: &PollRecord) -> DatabaseResult<bool>;

    /// Open attempts with an external id, least recently updated first.
    async fn list_sync_candidates(&mut self, limit: u32) -> DatabaseResult<Vec<PaymentAttempt>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_limit_is_clamped() {
        assert_eq!(clamp_batch_limit(0), 1);
        assert_eq!(clamp_batch_limit(50), 50);
        assert_eq!(clamp_batch_limit(10_000), MAX_SYNC_BATCH);
    }
}
