mod common;

use chrono::Duration;

use common::{capture_refunded_event, Harness, USER_ID};
use storefront_reconciler::database::entities::{
    EventSource, OrderStatus, RefundDedupeKey, RefundInitiator, RefundReasonCode, RefundStatus,
};
use storefront_reconciler::payments::types::Money;
use storefront_reconciler::services::reconciliation_engine::{RefundResultCommand, SystemRefund};
use storefront_reconciler::services::webhook_processor::WebhookOutcome;

/// Paid order with one captured attempt; returns the payment id.
async fn paid_order(h: &Harness, order_id: i64) -> i64 {
    h.seed_order(order_id, Duration::minutes(1)).await;
    let checkout = h
        .checkout
        .create_checkout(Harness::checkout_request(order_id, None))
        .await
        .unwrap();
    h.checkout
        .capture_payment(USER_ID, checkout.payment_id)
        .await
        .unwrap();
    checkout.payment_id
}

fn result(refund_id: i64, status: RefundStatus) -> RefundResultCommand {
    RefundResultCommand {
        refund_id,
        external_refund_id: None,
        status,
        response_payload: None,
        notify_payload: None,
        notified_at: None,
        source: EventSource::Admin,
    }
}

#[tokio::test]
async fn duplicate_refund_notices_land_on_one_row() {
    let h = Harness::new();
    let pid = paid_order(&h, 1).await;
    h.ledger
        .update_order(1, |o| o.status = OrderStatus::Refunding)
        .await;

    let event = capture_refunded_event("WH-R1", &format!("PAY-{pid}"), "RF-EXT", "10.00");
    assert_eq!(h.deliver("TX-1", &event).await.unwrap(), WebhookOutcome::Processed);
    assert_eq!(h.deliver("TX-2", &event).await.unwrap(), WebhookOutcome::Processed);
    assert_eq!(h.deliver("TX-1", &event).await.unwrap(), WebhookOutcome::Duplicate);

    let refunds = h.ledger.refunds_for_order(1).await;
    assert_eq!(refunds.len(), 1);
    let refund = &refunds[0];
    assert_eq!(refund.status, RefundStatus::Success);
    assert_eq!(refund.external_refund_id.as_deref(), Some("RF-EXT"));
    assert_eq!(refund.amount_minor, 1000);
    assert_eq!(refund.initiator, RefundInitiator::System);
    assert_eq!(
        refund.client_dedupe_key.as_deref(),
        Some(format!("ppref-{pid}-webhook-RF-EXT").as_str())
    );
    assert!(refund.notify_payload.is_some());

    let order = h.ledger.order(1).await.unwrap();
    assert_eq!(order.status, OrderStatus::Refunded);
    let log = h.ledger.status_log(1).await;
    assert_eq!(log.last().unwrap().to_status, OrderStatus::Refunded);
    assert_eq!(log.last().unwrap().source, EventSource::PaymentCallback);
}

#[tokio::test]
async fn refund_notice_binds_the_open_unbound_row() {
    let h = Harness::new();
    let pid = paid_order(&h, 1).await;
    let requested = h
        .engine
        .record_system_refund(SystemRefund {
            payment_id: pid,
            dedupe_key: RefundDedupeKey::new(pid, "admin", "r1"),
            external_refund_id: None,
            amount: Money::new(400, "USD"),
            reason_code: RefundReasonCode::CustomerRequest,
            request_payload: None,
            response_payload: None,
        })
        .await
        .unwrap();
    assert_eq!(requested.status, RefundStatus::Init);

    let event = capture_refunded_event("WH-R1", &format!("PAY-{pid}"), "RF-EXT", "4.00");
    assert_eq!(h.deliver("TX-1", &event).await.unwrap(), WebhookOutcome::Processed);

    let refunds = h.ledger.refunds_for_order(1).await;
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].id, requested.id);
    assert_eq!(refunds[0].external_refund_id.as_deref(), Some("RF-EXT"));
    assert_eq!(refunds[0].status, RefundStatus::Success);
    // Only a REFUNDING order moves to REFUNDED.
    assert_eq!(h.ledger.order(1).await.unwrap().status, OrderStatus::Paid);
}

#[tokio::test]
async fn refund_status_only_moves_forward() {
    let h = Harness::new();
    let pid = paid_order(&h, 1).await;
    let row = h
        .engine
        .record_system_refund(SystemRefund {
            payment_id: pid,
            dedupe_key: RefundDedupeKey::new(pid, "admin", "r1"),
            external_refund_id: Some("RF-1".to_string()),
            amount: Money::new(1000, "USD"),
            reason_code: RefundReasonCode::CustomerRequest,
            request_payload: None,
            response_payload: None,
        })
        .await
        .unwrap();

    let pending = h
        .engine
        .apply_refund_result(result(row.id, RefundStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.status, RefundStatus::Pending);

    let failed = h
        .engine
        .apply_refund_result(result(row.id, RefundStatus::Fail))
        .await
        .unwrap();
    assert_eq!(failed.status, RefundStatus::Fail);

    let replay = h
        .engine
        .apply_refund_result(result(row.id, RefundStatus::Fail))
        .await
        .unwrap();
    assert_eq!(replay.status, RefundStatus::Fail);

    let err = h
        .engine
        .apply_refund_result(result(row.id, RefundStatus::Success))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(h.ledger.refund(row.id).await.unwrap().status, RefundStatus::Fail);
}

#[tokio::test]
async fn refund_bound_to_another_external_id_conflicts() {
    let h = Harness::new();
    let pid = paid_order(&h, 1).await;
    let row = h
        .engine
        .record_system_refund(SystemRefund {
            payment_id: pid,
            dedupe_key: RefundDedupeKey::new(pid, "admin", "r1"),
            external_refund_id: Some("RF-1".to_string()),
            amount: Money::new(1000, "USD"),
            reason_code: RefundReasonCode::Other,
            request_payload: None,
            response_payload: None,
        })
        .await
        .unwrap();

    let err = h
        .engine
        .apply_refund_result(RefundResultCommand {
            external_refund_id: Some("RF-2".to_string()),
            ..result(row.id, RefundStatus::Success)
        })
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn system_refund_with_the_same_key_returns_the_existing_row() {
    let h = Harness::new();
    let pid = paid_order(&h, 1).await;
    let refund = SystemRefund {
        payment_id: pid,
        dedupe_key: RefundDedupeKey::auto_capture(pid),
        external_refund_id: Some("RF-1".to_string()),
        amount: Money::new(1000, "USD"),
        reason_code: RefundReasonCode::Exception,
        request_payload: None,
        response_payload: None,
    };

    let first = h.engine.record_system_refund(refund.clone()).await.unwrap();
    let second = h.engine.record_system_refund(refund).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(h.ledger.refunds_for_order(1).await.len(), 1);
}

#[tokio::test]
async fn refund_notice_for_unknown_gateway_order_is_ignored() {
    let h = Harness::new();
    let event = capture_refunded_event("WH-R1", "PAY-NOPE", "RF-EXT", "10.00");
    assert_eq!(h.deliver("TX-1", &event).await.unwrap(), WebhookOutcome::Ignored);
}

#[tokio::test]
async fn unparseable_refund_amount_falls_back_to_the_attempt_amount() {
    let h = Harness::new();
    let pid = paid_order(&h, 1).await;
    h.ledger
        .update_order(1, |o| o.status = OrderStatus::Refunding)
        .await;

    let event = capture_refunded_event("WH-R1", &format!("PAY-{pid}"), "RF-EXT", "garbage");
    assert_eq!(h.deliver("TX-1", &event).await.unwrap(), WebhookOutcome::Processed);

    let refunds = h.ledger.refunds_for_order(1).await;
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].amount_minor, 1000);
    assert_eq!(refunds[0].currency, "USD");
    assert_eq!(refunds[0].status, RefundStatus::Success);
    assert_eq!(h.ledger.order(1).await.unwrap().status, OrderStatus::Refunded);
}
