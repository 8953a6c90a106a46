//! Payment reconciliation services

pub mod active_attempt;
pub mod checkout;
pub mod payment_sync;
pub mod reconciliation_engine;
pub mod webhook_processor;

pub use checkout::{CheckoutRequest, CheckoutResponse, CheckoutService};
pub use payment_sync::{PaymentSyncConfig, PaymentSyncService, SyncOutcome};
pub use reconciliation_engine::{EngineConfig, PaymentResultView, ReconciliationEngine};
pub use webhook_processor::{
    WebhookOutcome, WebhookProcessor, WebhookProcessorConfig, WebhookProcessorError,
};
