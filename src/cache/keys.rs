//! Type-safe cache key builders

use std::fmt;

pub const VERSION: &str = "v1";

pub mod webhook {
    use super::*;

    pub const NAMESPACE: &str = "webhook";

    /// Dedupe key for one delivery of a gateway notification.
    #[derive(Debug, Clone)]
    pub struct EventKey {
        pub provider: String,
        pub transmission_id: String,
        pub event_id: String,
    }

    impl EventKey {
        pub fn new(
            provider: impl Into<String>,
            transmission_id: impl Into<String>,
            event_id: impl Into<String>,
        ) -> Self {
            Self {
                provider: provider.into(),
                transmission_id: transmission_id.into(),
                event_id: event_id.into(),
            }
        }

        pub fn paypal(transmission_id: impl Into<String>, event_id: impl Into<String>) -> Self {
            Self::new("paypal", transmission_id, event_id)
        }
    }

    impl fmt::Display for EventKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}:{}:{}:{}:{}",
                VERSION, NAMESPACE, self.provider, self.transmission_id, self.event_id
            )
        }
    }
}

pub mod checkout {
    use super::*;

    pub const NAMESPACE: &str = "checkout";

    /// Registration gate for a client-supplied checkout idempotency key.
    #[derive(Debug, Clone)]
    pub struct RegistrationKey {
        pub user_id: i64,
        pub idempotency_key: String,
    }

    impl RegistrationKey {
        pub fn new(user_id: i64, idempotency_key: impl Into<String>) -> Self {
            Self {
                user_id,
                idempotency_key: idempotency_key.into(),
            }
        }
    }

    impl fmt::Display for RegistrationKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}:{}:{}:{}",
                VERSION, NAMESPACE, self.user_id, self.idempotency_key
            )
        }
    }
}
