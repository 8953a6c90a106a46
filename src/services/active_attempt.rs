//! Pure decisions about which attempt may write order-level payment fields.
//!
//! Nothing here touches storage. The engine locks the order, feeds the locked
//! snapshot through these functions and persists whatever they decide.

use chrono::{DateTime, Duration, Utc};

use crate::database::entities::{Order, PaymentAttempt, PaymentChannel, PaymentStatus};

/// Outcome of resolving the active attempt against a locked order snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveAttempt {
    /// Order after the self-heal, if one applied.
    pub order: Order,
    pub is_active: bool,
    /// `active_payment_id` was adopted from a matching legacy external id and
    /// must be persisted with a claim.
    pub healed: bool,
}

/// Resolves whether `payment_id` is the order's active attempt.
///
/// Rows written before `active_payment_id` existed only carry the gateway
/// order id. When that id equals `incoming_external_id` the attempt is adopted
/// as active, once.
pub fn reconcile_active_attempt(
    order: &Order,
    payment_id: i64,
    incoming_external_id: Option<&str>,
) -> ActiveAttempt {
    let mut order = order.clone();
    let mut healed = false;
    if order.active_payment_id.is_none() {
        let stored = non_blank(order.payment_external_id.as_deref());
        let incoming = non_blank(incoming_external_id);
        if stored.is_some() && stored == incoming {
            order.active_payment_id = Some(payment_id);
            healed = true;
        }
    }
    let is_active = order.active_payment_id == Some(payment_id);
    ActiveAttempt {
        order,
        is_active,
        healed,
    }
}

/// Direct form of the legacy rule, without rewriting the order.
pub fn is_active_attempt(order: &Order, payment_id: i64, incoming_external_id: Option<&str>) -> bool {
    match order.active_payment_id {
        Some(active) => active == payment_id,
        None => {
            let stored = non_blank(order.payment_external_id.as_deref());
            stored.is_some() && stored == non_blank(incoming_external_id)
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Reuse(PaymentAttempt),
    UpgradePlaceholder(PaymentAttempt),
    CreateNew {
        /// Previous active attempt that is still open and must be closed first.
        close_previous: Option<i64>,
    },
}

/// Chooses how checkout preparation obtains its attempt.
pub fn decide_gate(active: Option<&PaymentAttempt>, channel: PaymentChannel) -> GateDecision {
    match active {
        Some(a) if a.channel == channel && a.status.is_open() => GateDecision::Reuse(a.clone()),
        Some(a) if a.is_placeholder() => GateDecision::UpgradePlaceholder(a.clone()),
        Some(a) if a.status.is_open() => GateDecision::CreateNew {
            close_previous: Some(a.id),
        },
        _ => GateDecision::CreateNew {
            close_previous: None,
        },
    }
}

/// Capture confirmed after the payable window closed.
pub fn is_late_capture(order_created_at: DateTime<Utc>, ttl: Duration, captured_at: DateTime<Utc>) -> bool {
    captured_at > order_created_at + ttl
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFacts {
    pub capture_success: bool,
    pub is_active: bool,
    pub order_payable: bool,
    pub order_closed_or_cancelled: bool,
    pub attempt_payable: bool,
    pub is_late: bool,
}

/// Attempt status a capture outcome resolves to.
///
/// A successful capture only closes the sale when every guard holds;
/// otherwise the money is acknowledged as EXCEPTION.
pub fn decide_capture(facts: CaptureFacts) -> PaymentStatus {
    if !facts.capture_success {
        return PaymentStatus::Fail;
    }
    let may_close_sale = facts.is_active
        && facts.order_payable
        && !facts.order_closed_or_cancelled
        && facts.attempt_payable
        && !facts.is_late;
    if may_close_sale {
        PaymentStatus::Success
    } else {
        PaymentStatus::Exception
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::entities::OrderStatus;
    use proptest::prelude::*;

    fn order(active: Option<i64>, external: Option<&str>) -> Order {
        let now = Utc::now();
        Order {
            id: 1,
            order_no: "ORD-1".to_string(),
            user_id: 7,
            status: OrderStatus::PendingPayment,
            pay_channel: PaymentChannel::Paypal,
            pay_status: PaymentStatus::Pending,
            payment_external_id: external.map(str::to_string),
            active_payment_id: active,
            pay_amount_minor: 1000,
            currency: "USD".to_string(),
            pay_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn attempt(id: i64, channel: PaymentChannel, status: PaymentStatus) -> PaymentAttempt {
        let now = Utc::now();
        PaymentAttempt {
            id,
            order_id: 1,
            channel,
            status,
            external_id: None,
            capture_id: None,
            amount_minor: 1000,
            currency: "USD".to_string(),
            request_payload: None,
            response_payload: None,
            notify_payload: None,
            last_polled_at: None,
            last_notified_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn legacy_row_is_healed_once() {
        let resolved = reconcile_active_attempt(&order(None, Some("PAY-1")), 5, Some("PAY-1"));
        assert!(resolved.is_active);
        assert!(resolved.healed);
        assert_eq!(resolved.order.active_payment_id, Some(5));

        let again = reconcile_active_attempt(&resolved.order, 5, Some("PAY-1"));
        assert!(again.is_active);
        assert!(!again.healed);
    }

    #[test]
    fn blank_ids_never_heal() {
        let resolved = reconcile_active_attempt(&order(None, Some("  ")), 5, Some("  "));
        assert!(!resolved.is_active);
        assert!(!resolved.healed);
    }

    #[test]
    fn explicit_active_id_wins_over_external_id() {
        let resolved = reconcile_active_attempt(&order(Some(9), Some("PAY-1")), 5, Some("PAY-1"));
        assert!(!resolved.is_active);
        assert!(!resolved.healed);
    }

    #[test]
    fn gate_prefers_reuse_then_placeholder() {
        let open = attempt(3, PaymentChannel::Paypal, PaymentStatus::Pending);
        assert_eq!(
            decide_gate(Some(&open), PaymentChannel::Paypal),
            GateDecision::Reuse(open.clone())
        );

        let placeholder = attempt(4, PaymentChannel::None, PaymentStatus::None);
        assert_eq!(
            decide_gate(Some(&placeholder), PaymentChannel::Paypal),
            GateDecision::UpgradePlaceholder(placeholder.clone())
        );

        let other_channel = attempt(5, PaymentChannel::None, PaymentStatus::Init);
        assert_eq!(
            decide_gate(Some(&other_channel), PaymentChannel::Paypal),
            GateDecision::CreateNew {
                close_previous: Some(5)
            }
        );

        let failed = attempt(6, PaymentChannel::Paypal, PaymentStatus::Fail);
        assert_eq!(
            decide_gate(Some(&failed), PaymentChannel::Paypal),
            GateDecision::CreateNew {
                close_previous: None
            }
        );
        assert_eq!(
            decide_gate(None, PaymentChannel::Paypal),
            GateDecision::CreateNew {
                close_previous: None
            }
        );
    }

    #[test]
    fn late_capture_is_exception() {
        let created = Utc::now();
        let ttl = Duration::minutes(15);
        assert!(!is_late_capture(created, ttl, created + Duration::seconds(2)));
        assert!(is_late_capture(created, ttl, created + Duration::minutes(20)));

        let facts = CaptureFacts {
            capture_success: true,
            is_active: true,
            order_payable: true,
            order_closed_or_cancelled: false,
            attempt_payable: true,
            is_late: true,
        };
        assert_eq!(decide_capture(facts), PaymentStatus::Exception);
        assert_eq!(
            decide_capture(CaptureFacts {
                is_late: false,
                ..facts
            }),
            PaymentStatus::Success
        );
        assert_eq!(
            decide_capture(CaptureFacts {
                capture_success: false,
                ..facts
            }),
            PaymentStatus::Fail
        );
    }

    fn external_id() -> impl Strategy<Value = Option<String>> {
        prop_oneof![
            Just(None),
            Just(Some(String::new())),
            Just(Some(" ".to_string())),
            "PAY-[0-3]".prop_map(Some),
        ]
    }

    proptest! {
        #[test]
        fn reconcile_agrees_with_legacy_rule(
            active in proptest::option::of(1i64..5),
            stored in external_id(),
            incoming in external_id(),
            payment_id in 1i64..5,
        ) {
            let o = order(active, stored.as_deref());
            let resolved = reconcile_active_attempt(&o, payment_id, incoming.as_deref());
            prop_assert_eq!(
                resolved.is_active,
                is_active_attempt(&o, payment_id, incoming.as_deref())
            );
            // The healed snapshot answers the same with the plain id check.
            prop_assert_eq!(
                resolved.is_active,
                resolved.order.active_payment_id == Some(payment_id)
            );
            prop_assert!(!resolved.healed || active.is_none());
        }

        #[test]
        fn success_requires_every_guard(
            capture_success: bool,
            is_active: bool,
            order_payable: bool,
            order_closed_or_cancelled: bool,
            attempt_payable: bool,
            is_late: bool,
        ) {
            let status = decide_capture(CaptureFacts {
                capture_success,
                is_active,
                order_payable,
                order_closed_or_cancelled,
                attempt_payable,
                is_late,
            });
            if status == PaymentStatus::Success {
                prop_assert!(capture_success && is_active && order_payable);
                prop_assert!(attempt_payable && !is_late && !order_closed_or_cancelled);
            }
            prop_assert_eq!(status == PaymentStatus::Fail, !capture_success);
        }
    }
}
