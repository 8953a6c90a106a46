//! Refund attempt rows. Transitions only move forward.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use super::entities::{NewRefundAttempt, RefundAttempt, RefundStatus};
use super::error::DatabaseResult;

#[async_trait]
pub trait RefundAttemptStore: Send {
    async fn find_refund(&mut self, id: i64) -> DatabaseResult<Option<RefundAttempt>>;

    async fn find_refund_by_external_id(
        &mut self,
        external_refund_id: &str,
    ) -> DatabaseResult<Option<RefundAttempt>>;

    /// Newest INIT/PENDING refund of the attempt that has no external id yet.
    async fn find_open_unbound_refund(
        &mut self,
        payment_attempt_id: i64,
    ) -> DatabaseResult<Option<RefundAttempt>>;

    async fn find_refund_by_dedupe_key(
        &mut self,
        payment_attempt_id: i64,
        dedupe_key: &str,
    ) -> DatabaseResult<Option<RefundAttempt>>;

    /// Fails with a unique violation on a duplicate external id or dedupe key.
    async fn insert_refund(&mut self, refund: &NewRefundAttempt) -> DatabaseResult<RefundAttempt>;

    async fn bind_external_refund_id(
        &mut self,
        id: i64,
        external_refund_id: &str,
    ) -> DatabaseResult<bool>;

    /// INIT to PENDING.
    async fn try_mark_refund_pending(&mut self, id: i64) -> DatabaseResult<bool>;

    /// INIT/PENDING to SUCCESS or FAIL.
    async fn try_finish_refund(
        &mut self,
        id: i64,
        to: RefundStatus,
        response_payload: Option<&JsonValue>,
    ) -> DatabaseResult<bool>;

    async fn record_refund_notification(
        &mut self,
        id: i64,
        notify_payload: &JsonValue,
        notified_at: DateTime<Utc>,
    ) -> DatabaseResult<bool>;

    async fn mark_refund_polled(
        &mut self,
        id: i64,
        polled_at: DateTime<Utc>,
        response_payload: Option<&JsonValue>,
    ) -> DatabaseResult<bool>;

    /// Open refunds with an external id, least recently updated first.
    async fn list_refund_sync_candidates(
        &mut self,
        limit: u32,
    ) -> DatabaseResult<Vec<RefundAttempt>>;
}
