pub mod paypal;

pub use paypal::{PayPalConfig, PayPalProvider};
