//! Order-to-payment reconciliation for a storefront.
//!
//! The crate keeps payment attempts, refunds and the order's payment columns
//! consistent under concurrent checkout calls, gateway webhooks and periodic
//! polling. State transitions live in [`services::reconciliation_engine`];
//! everything else feeds it.

pub mod api;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
