pub mod reconciliation_scanner;

pub use reconciliation_scanner::{ReconciliationScanner, ScanReport, ScannerConfig, ScannerError};
