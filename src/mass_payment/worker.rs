//! Recovery Worker
//!
//! Background worker that resumes batches interrupted by a crash or restart.
//! Batches parked by an iteration failure are left for an explicit resume.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::error::BatchError;
use super::orchestrator::{CancelSignal, PaymentBatchOrchestrator};
use super::types::OrchestrationOutcome;

/// Configuration for the recovery worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to scan for interrupted batches
    pub scan_interval: Duration,
    /// How long a checkpoint must be untouched to be considered interrupted
    pub stale_threshold: Duration,
    /// Maximum batches resumed per scan
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

pub struct RecoveryWorker {
    orchestrator: Arc<PaymentBatchOrchestrator>,
    config: WorkerConfig,
    cancel: Arc<CancelSignal>,
}

impl RecoveryWorker {
    pub fn new(
        orchestrator: Arc<PaymentBatchOrchestrator>,
        config: WorkerConfig,
        cancel: Arc<CancelSignal>,
    ) -> Self {
        Self {
            orchestrator,
            config,
            cancel,
        }
    }

    /// Scan until cancelled
    pub async fn run(&self) {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            stale_threshold_secs = self.config.stale_threshold.as_secs(),
            "Starting recovery worker"
        );

        while !self.cancel.is_cancelled() {
            if let Err(e) = self.scan_and_recover().await {
                error!(error = %e, "Recovery scan failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.scan_interval) => {}
                _ = self.cancel.cancelled() => {}
            }
        }

        info!("Recovery worker stopped");
    }

    /// Run a single scan; returns the number of batches driven to completion
    pub async fn scan_and_recover(&self) -> Result<usize, BatchError> {
        let stale_before = chrono::Utc::now().timestamp_millis()
            - self.config.stale_threshold.as_millis() as i64;
        let candidates = self
            .orchestrator
            .store()
            .list_unfinished(stale_before, self.config.batch_size)
            .await?;

        if candidates.is_empty() {
            debug!("No interrupted batches found");
            return Ok(0);
        }

        info!(count = candidates.len(), "Found interrupted batches to resume");

        let mut recovered = 0;
        for checkpoint in candidates {
            if self.cancel.is_cancelled() {
                break;
            }
            let request_id = checkpoint.request_id;
            if self.orchestrator.is_running(request_id) {
                debug!(request_id = %request_id, "Batch already running, skipped");
                continue;
            }

            debug!(
                request_id = %request_id,
                completed = checkpoint.completed_iterations,
                total = checkpoint.request.iteration_count,
                in_flight = checkpoint.in_flight.is_some(),
                "Resuming batch"
            );

            match self.orchestrator.run(request_id, &self.cancel).await {
                Ok(OrchestrationOutcome::Completed(result)) => {
                    info!(
                        request_id = %request_id,
                        tx_id = %result.transaction_id,
                        "Recovered batch completed"
                    );
                    recovered += 1;
                }
                Ok(OrchestrationOutcome::Failed { iteration, cause }) => {
                    warn!(
                        request_id = %request_id,
                        iteration,
                        error = %cause,
                        "Recovered batch failed"
                    );
                }
                Err(BatchError::AlreadyRunning(_)) => {}
                Err(e) => {
                    error!(request_id = %request_id, error = %e, "Failed to resume batch");
                }
            }
        }

        if recovered > 0 {
            info!(count = recovered, "Recovered batches this scan");
        }

        Ok(recovered)
    }
}
