//! sqlx/Postgres implementation of the payment ledger.
//!
//! The order row is locked with `SELECT ... FOR UPDATE`; attempt and refund
//! transitions are conditional `UPDATE`s whose `rows_affected` is the CAS result.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::str::FromStr;

use super::entities::{
    meaningful_payload, non_blank, NewPaymentAttempt, NewRefundAttempt, NewStatusLog, Order,
    OrderStatus, PaymentAttempt, PaymentChannel, PaymentStatus, RefundAttempt, RefundStatus,
    OPEN_PAYMENT_STATUSES,
};
use super::error::{DatabaseError, DatabaseResult};
use super::order_ledger::{OrderLedger, OrderPaymentFields, PayStatusGuard};
use super::payment_attempt_repository::{
    clamp_batch_limit, AttemptAudit, CaptureUpdate, PaymentAttemptStore, PollRecord,
};
use super::refund_attempt_repository::RefundAttemptStore;
use super::transaction::{LedgerStore, PaymentTx};

const ORDER_COLUMNS: &str = "id, order_no, user_id, status, pay_channel, pay_status, \
     payment_external_id, active_payment_id, pay_amount, currency, pay_time, created_at, updated_at";

const ATTEMPT_COLUMNS: &str = "id, order_id, channel, status, external_id, capture_id, amount, \
     currency, request_payload, response_payload, notify_payload, last_polled_at, \
     last_notified_at, created_at, updated_at";

const REFUND_COLUMNS: &str = "id, refund_no, order_id, payment_attempt_id, external_refund_id, \
     client_dedupe_key, amount, currency, status, reason_code, initiator, request_payload, \
     response_payload, notify_payload, last_polled_at, last_notified_at, created_at, updated_at";

#[derive(Debug, FromRow)]
struct OrderRow {
    id: i64,
    order_no: String,
    user_id: i64,
    status: String,
    pay_channel: String,
    pay_status: String,
    payment_external_id: Option<String>,
    active_payment_id: Option<i64>,
    pay_amount: i64,
    currency: String,
    pay_time: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct AttemptRow {
    id: i64,
    order_id: i64,
    channel: String,
    status: String,
    external_id: Option<String>,
    capture_id: Option<String>,
    amount: i64,
    currency: String,
    request_payload: Option<JsonValue>,
    response_payload: Option<JsonValue>,
    notify_payload: Option<JsonValue>,
    last_polled_at: Option<DateTime<Utc>>,
    last_notified_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct RefundRow {
    id: i64,
    refund_no: String,
    order_id: i64,
    payment_attempt_id: i64,
    external_refund_id: Option<String>,
    client_dedupe_key: Option<String>,
    amount: i64,
    currency: String,
    status: String,
    reason_code: String,
    initiator: String,
    request_payload: Option<JsonValue>,
    response_payload: Option<JsonValue>,
    notify_payload: Option<JsonValue>,
    last_polled_at: Option<DateTime<Utc>>,
    last_notified_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn parse<T: FromStr>(entity: &str, value: &str) -> DatabaseResult<T>
where
    T::Err: std::fmt::Display,
{
    T::from_str(value).map_err(|e| DatabaseError::corrupt(entity, e))
}

impl TryFrom<OrderRow> for Order {
    type Error = DatabaseError;

    fn try_from(row: OrderRow) -> DatabaseResult<Self> {
        Ok(Order {
            id: row.id,
            order_no: row.order_no,
            user_id: row.user_id,
            status: parse("order", &row.status)?,
            pay_channel: parse("order", &row.pay_channel)?,
            pay_status: parse("order", &row.pay_status)?,
            payment_external_id: row.payment_external_id,
            active_payment_id: row.active_payment_id,
            pay_amount_minor: row.pay_amount,
            currency: row.currency,
            pay_time: row.pay_time,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<AttemptRow> for PaymentAttempt {
    type Error = DatabaseError;

    fn try_from(row: AttemptRow) -> DatabaseResult<Self> {
        Ok(PaymentAttempt {
            id: row.id,
            order_id: row.order_id,
            channel: parse("payment_attempt", &row.channel)?,
            status: parse("payment_attempt", &row.status)?,
            external_id: row.external_id,
            capture_id: row.capture_id,
            amount_minor: row.amount,
            currency: row.currency,
            request_payload: row.request_payload,
            response_payload: row.response_payload,
            notify_payload: row.notify_payload,
            last_polled_at: row.last_polled_at,
            last_notified_at: row.last_notified_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<RefundRow> for RefundAttempt {
    type Error = DatabaseError;

    fn try_from(row: RefundRow) -> DatabaseResult<Self> {
        Ok(RefundAttempt {
            id: row.id,
            refund_no: row.refund_no,
            order_id: row.order_id,
            payment_attempt_id: row.payment_attempt_id,
            external_refund_id: row.external_refund_id,
            client_dedupe_key: row.client_dedupe_key,
            amount_minor: row.amount,
            currency: row.currency,
            status: parse("refund_attempt", &row.status)?,
            reason_code: parse("refund_attempt", &row.reason_code)?,
            initiator: parse("refund_attempt", &row.initiator)?,
            request_payload: row.request_payload,
            response_payload: row.response_payload,
            notify_payload: row.notify_payload,
            last_polled_at: row.last_polled_at,
            last_notified_at: row.last_notified_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn status_texts(statuses: &[PaymentStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn payload(value: Option<&JsonValue>) -> Option<JsonValue> {
    meaningful_payload(value).cloned()
}

/// Ledger backed by a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn begin(&self) -> DatabaseResult<Box<dyn PaymentTx>> {
        let tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;
        Ok(Box::new(PgTx { tx }))
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

type PgQueryAs<'q, O> = sqlx::query::QueryAs<'q, Postgres, O, sqlx::postgres::PgArguments>;

impl PgTx {
    async fn fetch_attempt(
        &mut self,
        query: PgQueryAs<'_, AttemptRow>,
    ) -> DatabaseResult<Option<PaymentAttempt>> {
        query
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(PaymentAttempt::try_from)
            .transpose()
    }

    async fn fetch_refund(
        &mut self,
        query: PgQueryAs<'_, RefundRow>,
    ) -> DatabaseResult<Option<RefundAttempt>> {
        query
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(RefundAttempt::try_from)
            .transpose()
    }
}

#[async_trait]
impl PaymentTx for PgTx {
    async fn commit(self: Box<Self>) -> DatabaseResult<()> {
        let this = *self;
        this.tx.commit().await.map_err(DatabaseError::from_sqlx)
    }
}

#[async_trait]
impl OrderLedger for PgTx {
    async fn lock_order(&mut self, order_id: i64) -> DatabaseResult<Option<Order>> {
        let sql = format!("SELECT {} FROM orders WHERE id = $1 FOR UPDATE", ORDER_COLUMNS);
        sqlx::query_as::<_, OrderRow>(&sql)
            .bind(order_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Order::try_from)
            .transpose()
    }

    async fn update_payment_fields(
        &mut self,
        order_id: i64,
        guard: PayStatusGuard,
        fields: &OrderPaymentFields,
    ) -> DatabaseResult<bool> {
        let (guard_sql, guard_value) = match guard {
            PayStatusGuard::Any => ("TRUE", None),
            PayStatusGuard::Not(status) => ("pay_status <> $7", Some(status.as_str())),
            PayStatusGuard::Is(status) => ("pay_status = $7", Some(status.as_str())),
        };
        let sql = format!(
            "UPDATE orders SET \
                 pay_channel = COALESCE($2, pay_channel), \
                 pay_status = COALESCE($3, pay_status), \
                 payment_external_id = COALESCE($4, payment_external_id), \
                 active_payment_id = COALESCE($5, active_payment_id), \
                 pay_time = COALESCE($6, pay_time), \
                 updated_at = NOW() \
             WHERE id = $1 AND ({})",
            guard_sql
        );
        let mut query = sqlx::query(&sql)
            .bind(order_id)
            .bind(fields.pay_channel.map(|c| c.as_str()))
            .bind(fields.pay_status.map(|s| s.as_str()))
            .bind(fields.payment_external_id.as_deref())
            .bind(fields.active_payment_id)
            .bind(fields.pay_time);
        if let Some(value) = guard_value {
            query = query.bind(value);
        }
        let result = query
            .execute(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_active_payment(
        &mut self,
        order_id: i64,
        payment_id: i64,
    ) -> DatabaseResult<bool> {
        let result = sqlx::query(
            "UPDATE orders SET active_payment_id = $2, updated_at = NOW() \
             WHERE id = $1 AND active_payment_id IS NULL",
        )
        .bind(order_id)
        .bind(payment_id)
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn advance_status(
        &mut self,
        order_id: i64,
        from: &[OrderStatus],
        to: OrderStatus,
    ) -> DatabaseResult<bool> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let result = sqlx::query(
            "UPDATE orders SET status = $2, updated_at = NOW() \
             WHERE id = $1 AND status = ANY($3)",
        )
        .bind(order_id)
        .bind(to.as_str())
        .bind(from)
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn append_status_log(&mut self, entry: &NewStatusLog) -> DatabaseResult<()> {
        sqlx::query(
            "INSERT INTO order_status_log (order_id, source, from_status, to_status, note) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(entry.order_id)
        .bind(entry.source.as_str())
        .bind(entry.from_status.map(|s| s.as_str()))
        .bind(entry.to_status.as_str())
        .bind(entry.note.as_deref())
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }
}

#[async_trait]
impl PaymentAttemptStore for PgTx {
    async fn find_attempt(&mut self, id: i64) -> DatabaseResult<Option<PaymentAttempt>> {
        let sql = format!("SELECT {} FROM payment_attempt WHERE id = $1", ATTEMPT_COLUMNS);
        self.fetch_attempt(sqlx::query_as(&sql).bind(id)).await
    }

    async fn find_attempt_by_external_id(
        &mut self,
        external_id: &str,
    ) -> DatabaseResult<Option<PaymentAttempt>> {
        let sql = format!(
            "SELECT {} FROM payment_attempt WHERE external_id = $1 LIMIT 1",
            ATTEMPT_COLUMNS
        );
        self.fetch_attempt(sqlx::query_as(&sql).bind(external_id))
            .await
    }

    async fn insert_attempt(
        &mut self,
        attempt: &NewPaymentAttempt,
    ) -> DatabaseResult<PaymentAttempt> {
        let sql = format!(
            "INSERT INTO payment_attempt (order_id, channel, status, amount, currency) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {}",
            ATTEMPT_COLUMNS
        );
        let row = sqlx::query_as::<_, AttemptRow>(&sql)
            .bind(attempt.order_id)
            .bind(attempt.channel.as_str())
            .bind(attempt.status.as_str())
            .bind(attempt.amount_minor)
            .bind(&attempt.currency)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        PaymentAttempt::try_from(row)
    }

    async fn try_upgrade_placeholder(
        &mut self,
        id: i64,
        channel: PaymentChannel,
        amount_minor: i64,
        currency: &str,
    ) -> DatabaseResult<bool> {
        let result = sqlx::query(
            "UPDATE payment_attempt \
             SET channel = $2, status = 'INIT', amount = $3, currency = $4, updated_at = NOW() \
             WHERE id = $1 AND channel = 'NONE' AND status = 'NONE'",
        )
        .bind(id)
        .bind(channel.as_str())
        .bind(amount_minor)
        .bind(currency)
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn try_close(&mut self, id: i64, from: &[PaymentStatus]) -> DatabaseResult<bool> {
        let result = sqlx::query(
            "UPDATE payment_attempt SET status = 'CLOSED', updated_at = NOW() \
             WHERE id = $1 AND status = ANY($2)",
        )
        .bind(id)
        .bind(status_texts(from))
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn close_open_siblings(&mut self, order_id: i64, keep_id: i64) -> DatabaseResult<u64> {
        let result = sqlx::query(
            "UPDATE payment_attempt SET status = 'CLOSED', updated_at = NOW() \
             WHERE order_id = $1 AND id <> $2 AND status = ANY($3)",
        )
        .bind(order_id)
        .bind(keep_id)
        .bind(status_texts(&OPEN_PAYMENT_STATUSES))
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn try_move_open(&mut self, id: i64, to: PaymentStatus) -> DatabaseResult<bool> {
        if !to.is_open() {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE payment_attempt SET status = $2, updated_at = NOW() \
             WHERE id = $1 AND status = ANY($3)",
        )
        .bind(id)
        .bind(to.as_str())
        .bind(status_texts(&OPEN_PAYMENT_STATUSES))
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn bind_external_id(&mut self, id: i64, external_id: &str) -> DatabaseResult<bool> {
        let result = sqlx::query(
            "UPDATE payment_attempt SET external_id = $2, updated_at = NOW() \
             WHERE id = $1 AND (external_id IS NULL OR external_id = '')",
        )
        .bind(id)
        .bind(external_id)
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_gateway_exchange(
        &mut self,
        id: i64,
        request_payload: Option<&JsonValue>,
        response_payload: Option<&JsonValue>,
    ) -> DatabaseResult<bool> {
        let result = sqlx::query(
            "UPDATE payment_attempt SET \
                 request_payload = COALESCE($2, request_payload), \
                 response_payload = COALESCE($3, response_payload), \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(payload(request_payload))
        .bind(payload(response_payload))
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn try_apply_capture(
        &mut self,
        id: i64,
        update: &CaptureUpdate,
    ) -> DatabaseResult<bool> {
        let result = sqlx::query(
            "UPDATE payment_attempt SET \
                 status = $2, \
                 external_id = CASE WHEN external_id IS NULL OR external_id = '' THEN $3 ELSE external_id END, \
                 capture_id = COALESCE($4, capture_id), \
                 response_payload = COALESCE($5, response_payload), \
                 notify_payload = COALESCE($6, notify_payload), \
                 last_notified_at = COALESCE($7, last_notified_at), \
                 updated_at = NOW() \
             WHERE id = $1 AND status <> 'SUCCESS'",
        )
        .bind(id)
        .bind(update.status.as_str())
        .bind(&update.external_id)
        .bind(non_blank(update.capture_id.as_deref()))
        .bind(payload(update.response_payload.as_ref()))
        .bind(payload(update.notify_payload.as_ref()))
        .bind(update.notified_at)
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn backfill_capture(
        &mut self,
        id: i64,
        external_id: &str,
        capture_id: Option<&str>,
    ) -> DatabaseResult<bool> {
        let result = sqlx::query(
            "UPDATE payment_attempt SET \
                 external_id = CASE WHEN external_id IS NULL OR external_id = '' THEN $2 ELSE external_id END, \
                 capture_id = CASE WHEN (capture_id IS NULL OR capture_id = '') AND $3::TEXT IS NOT NULL THEN $3 ELSE capture_id END, \
                 updated_at = NOW() \
             WHERE id = $1 \
               AND ((external_id IS NULL OR external_id = '') \
                    OR ((capture_id IS NULL OR capture_id = '') AND $3::TEXT IS NOT NULL))",
        )
        .bind(id)
        .bind(external_id)
        .bind(non_blank(capture_id))
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_audit(&mut self, id: i64, audit: &AttemptAudit) -> DatabaseResult<bool> {
        let result = sqlx::query(
            "UPDATE payment_attempt SET \
                 response_payload = COALESCE($2, response_payload), \
                 notify_payload = COALESCE($3, notify_payload), \
                 last_notified_at = COALESCE($4, last_notified_at), \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(payload(audit.response_payload.as_ref()))
        .bind(payload(audit.notify_payload.as_ref()))
        .bind(audit.notified_at)
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_polled(&mut self, id: i64, poll: &PollRecord) -> DatabaseResult<bool> {
        let result = sqlx::query(
            "UPDATE payment_attempt SET \
                 last_polled_at = $2, \
                 response_payload = COALESCE($3, response_payload), \
                 capture_id = CASE WHEN capture_id IS NULL OR capture_id = '' THEN COALESCE($4, capture_id) ELSE capture_id END, \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(poll.polled_at)
        .bind(payload(poll.response_payload.as_ref()))
        .bind(non_blank(poll.capture_id.as_deref()))
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_sync_candidates(&mut self, limit: u32) -> DatabaseResult<Vec<PaymentAttempt>> {
        let sql = format!(
            "SELECT {} FROM payment_attempt \
             WHERE status = ANY($1) AND external_id IS NOT NULL AND external_id <> '' \
             ORDER BY updated_at ASC, id ASC LIMIT $2",
            ATTEMPT_COLUMNS
        );
        let rows = sqlx::query_as::<_, AttemptRow>(&sql)
            .bind(status_texts(&OPEN_PAYMENT_STATUSES))
            .bind(i64::from(clamp_batch_limit(limit)))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        rows.into_iter().map(PaymentAttempt::try_from).collect()
    }
}

#[async_trait]
impl RefundAttemptStore for PgTx {
    async fn find_refund(&mut self, id: i64) -> DatabaseResult<Option<RefundAttempt>> {
        let sql = format!("SELECT {} FROM refund_attempt WHERE id = $1", REFUND_COLUMNS);
        self.fetch_refund(sqlx::query_as(&sql).bind(id)).await
    }

    async fn find_refund_by_external_id(
        &mut self,
        external_refund_id: &str,
    ) -> DatabaseResult<Option<RefundAttempt>> {
        let sql = format!(
            "SELECT {} FROM refund_attempt WHERE external_refund_id = $1 LIMIT 1",
            REFUND_COLUMNS
        );
        self.fetch_refund(sqlx::query_as(&sql).bind(external_refund_id))
            .await
    }

    async fn find_open_unbound_refund(
        &mut self,
        payment_attempt_id: i64,
    ) -> DatabaseResult<Option<RefundAttempt>> {
        let sql = format!(
            "SELECT {} FROM refund_attempt \
             WHERE payment_attempt_id = $1 AND status IN ('INIT', 'PENDING') \
               AND (external_refund_id IS NULL OR external_refund_id = '') \
             ORDER BY created_at DESC, id DESC LIMIT 1",
            REFUND_COLUMNS
        );
        self.fetch_refund(sqlx::query_as(&sql).bind(payment_attempt_id))
            .await
    }

    async fn find_refund_by_dedupe_key(
        &mut self,
        payment_attempt_id: i64,
        dedupe_key: &str,
    ) -> DatabaseResult<Option<RefundAttempt>> {
        let sql = format!(
            "SELECT {} FROM refund_attempt \
             WHERE payment_attempt_id = $1 AND client_dedupe_key = $2 LIMIT 1",
            REFUND_COLUMNS
        );
        self.fetch_refund(
            sqlx::query_as(&sql)
                .bind(payment_attempt_id)
                .bind(dedupe_key),
        )
        .await
    }

    async fn insert_refund(&mut self, refund: &NewRefundAttempt) -> DatabaseResult<RefundAttempt> {
        let sql = format!(
            "INSERT INTO refund_attempt (refund_no, order_id, payment_attempt_id, \
                 external_refund_id, client_dedupe_key, amount, currency, status, reason_code, \
                 initiator, request_payload, response_payload, notify_payload, last_notified_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             RETURNING {}",
            REFUND_COLUMNS
        );
        let row = sqlx::query_as::<_, RefundRow>(&sql)
            .bind(&refund.refund_no)
            .bind(refund.order_id)
            .bind(refund.payment_attempt_id)
            .bind(non_blank(refund.external_refund_id.as_deref()))
            .bind(refund.client_dedupe_key.as_deref())
            .bind(refund.amount_minor)
            .bind(&refund.currency)
            .bind(refund.status.as_str())
            .bind(refund.reason_code.as_str())
            .bind(refund.initiator.as_str())
            .bind(payload(refund.request_payload.as_ref()))
            .bind(payload(refund.response_payload.as_ref()))
            .bind(payload(refund.notify_payload.as_ref()))
            .bind(refund.last_notified_at)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        RefundAttempt::try_from(row)
    }

    async fn bind_external_refund_id(
        &mut self,
        id: i64,
        external_refund_id: &str,
    ) -> DatabaseResult<bool> {
        let result = sqlx::query(
            "UPDATE refund_attempt SET external_refund_id = $2, updated_at = NOW() \
             WHERE id = $1 AND (external_refund_id IS NULL OR external_refund_id = '')",
        )
        .bind(id)
        .bind(external_refund_id)
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn try_mark_refund_pending(&mut self, id: i64) -> DatabaseResult<bool> {
        let result = sqlx::query(
            "UPDATE refund_attempt SET status = 'PENDING', updated_at = NOW() \
             WHERE id = $1 AND status = 'INIT'",
        )
        .bind(id)
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
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
        let result = sqlx::query(
            "UPDATE refund_attempt SET status = $2, \
                 response_payload = COALESCE($3, response_payload), updated_at = NOW() \
             WHERE id = $1 AND status IN ('INIT', 'PENDING')",
        )
        .bind(id)
        .bind(to.as_str())
        .bind(payload(response_payload))
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_refund_notification(
        &mut self,
        id: i64,
        notify_payload: &JsonValue,
        notified_at: DateTime<Utc>,
    ) -> DatabaseResult<bool> {
        let result = sqlx::query(
            "UPDATE refund_attempt SET notify_payload = COALESCE($2, notify_payload), \
                 last_notified_at = $3, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(payload(Some(notify_payload)))
        .bind(notified_at)
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_refund_polled(
        &mut self,
        id: i64,
        polled_at: DateTime<Utc>,
        response_payload: Option<&JsonValue>,
    ) -> DatabaseResult<bool> {
        let result = sqlx::query(
            "UPDATE refund_attempt SET last_polled_at = $2, \
                 response_payload = COALESCE($3, response_payload), updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(polled_at)
        .bind(payload(response_payload))
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_refund_sync_candidates(
        &mut self,
        limit: u32,
    ) -> DatabaseResult<Vec<RefundAttempt>> {
        let sql = format!(
            "SELECT {} FROM refund_attempt \
             WHERE status IN ('INIT', 'PENDING') \
               AND external_refund_id IS NOT NULL AND external_refund_id <> '' \
             ORDER BY updated_at ASC, id ASC LIMIT $1",
            REFUND_COLUMNS
        );
        let rows = sqlx::query_as::<_, RefundRow>(&sql)
            .bind(i64::from(clamp_batch_limit(limit)))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        rows.into_iter().map(RefundAttempt::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::entities::{RefundInitiator, RefundReasonCode};

    async fn setup_ledger() -> PgLedger {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/reconciler_test".to_string());
        let pool = PgPool::connect(&url)
            .await
            .expect("failed to connect to test database");
        PgLedger::new(pool)
    }

    #[tokio::test]
    #[ignore] // Requires a migrated database
    async fn refund_dedupe_constraint_surfaces_as_unique_violation() {
        let ledger = setup_ledger().await;
        let mut tx = ledger.begin().await.unwrap();
        let refund = NewRefundAttempt {
            refund_no: NewRefundAttempt::generate_refund_no(),
            order_id: 1,
            payment_attempt_id: 1,
            external_refund_id: None,
            client_dedupe_key: Some("ppref-1-test-dup".to_string()),
            amount_minor: 100,
            currency: "USD".to_string(),
            status: RefundStatus::Init,
            reason_code: RefundReasonCode::Other,
            initiator: RefundInitiator::System,
            request_payload: None,
            response_payload: None,
            notify_payload: None,
            last_notified_at: None,
        };
        tx.insert_refund(&refund).await.unwrap();
        let second = NewRefundAttempt {
            refund_no: NewRefundAttempt::generate_refund_no(),
            ..refund
        };
        let err = tx.insert_refund(&second).await.unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    #[ignore] // Requires a migrated database
    async fn sync_candidates_respect_batch_bound() {
        let ledger = setup_ledger().await;
        let mut tx = ledger.begin().await.unwrap();
        let rows = tx.list_sync_candidates(10_000).await.unwrap();
        assert!(rows.len() <= 200);
        assert!(rows.iter().all(|r| r.status.is_open()));
    }
}
