use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::database::payment_attempt_repository::{clamp_batch_limit, MAX_SYNC_BATCH};
use crate::error::AppError;
use crate::services::payment_sync::{PaymentSyncService, SyncOutcome};

// ---------------------------------------------------------------------------
// Custom error type
// ---------------------------------------------------------------------------

/// Only a failed candidate query aborts a cycle; per-row failures are logged
/// and counted in the [`ScanReport`].
#[derive(Debug, thiserror::Error)]
pub enum ScannerError {
    #[error("failed to list {kind} sync candidates: {source}")]
    Candidates {
        kind: &'static str,
        #[source]
        source: AppError,
    },
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Pause between the end of one cycle and the start of the next.
    pub poll_interval: Duration,
    /// Candidates fetched per kind and cycle, clamped to `1..=200`.
    pub batch_size: u32,
    pub enabled: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            batch_size: MAX_SYNC_BATCH,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub payments_polled: usize,
    pub payments_failed: usize,
    pub refunds_polled: usize,
    pub refunds_failed: usize,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct ReconciliationScanner {
    sync: Arc<PaymentSyncService>,
    config: ScannerConfig,
}

impl ReconciliationScanner {
    pub fn new(sync: Arc<PaymentSyncService>, config: ScannerConfig) -> Self {
        Self { sync, config }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("reconciliation scanner disabled");
            return;
        }
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = clamp_batch_limit(self.config.batch_size),
            "reconciliation scanner started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("reconciliation scanner stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.run_cycle().await {
                        Ok(report) => {
                            if report != ScanReport::default() {
                                info!(
                                    payments_polled = report.payments_polled,
                                    payments_failed = report.payments_failed,
                                    refunds_polled = report.refunds_polled,
                                    refunds_failed = report.refunds_failed,
                                    "reconciliation cycle finished"
                                );
                            }
                        }
                        Err(e) => warn!(error = %e, "reconciliation cycle failed"),
                    }
                }
            }
        }

        info!("reconciliation scanner stopped");
    }

    /// One pass over open payments, then open refunds.
    pub async fn run_cycle(&self) -> Result<ScanReport, ScannerError> {
        let limit = clamp_batch_limit(self.config.batch_size);
        let mut report = ScanReport::default();

        let payments = self
            .sync
            .engine()
            .list_sync_candidates(limit)
            .await
            .map_err(|source| ScannerError::Candidates {
                kind: "payment",
                source,
            })?;
        for attempt in payments {
            report.payments_polled += 1;
            match self.sync.sync_payment(attempt.id).await {
                Ok(outcome) => log_outcome("payment", attempt.id, &outcome),
                Err(e) => {
                    report.payments_failed += 1;
                    log_failure("payment", attempt.id, &e);
                }
            }
        }

        let refunds = self
            .sync
            .engine()
            .list_refund_sync_candidates(limit)
            .await
            .map_err(|source| ScannerError::Candidates {
                kind: "refund",
                source,
            })?;
        for refund in refunds {
            report.refunds_polled += 1;
            match self.sync.sync_refund(refund.id).await {
                Ok(outcome) => log_outcome("refund", refund.id, &outcome),
                Err(e) => {
                    report.refunds_failed += 1;
                    log_failure("refund", refund.id, &e);
                }
            }
        }

        Ok(report)
    }
}

fn log_outcome(kind: &str, id: i64, outcome: &SyncOutcome) {
    debug!(kind, id, ?outcome, "candidate synced");
}

fn log_failure(kind: &str, id: i64, err: &AppError) {
    if err.is_retryable() {
        warn!(kind, id, error = %err, "candidate sync failed, will retry next cycle");
    } else {
        error!(kind, id, error = %err, "candidate sync failed");
    }
}
