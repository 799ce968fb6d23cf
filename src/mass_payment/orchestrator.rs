//! Payment Batch Orchestrator
//!
//! Drives a batch through its iterations, one at a time, persisting progress
//! after every finalized iteration so a restarted node resumes exactly where
//! the previous run stopped.
//!
//! Per iteration:
//! 1. publish `Phase::Paying`
//! 2. persist the in-flight marker (persist-before-call)
//! 3. invoke the executor exactly once
//! 4. on success, compare-and-set the checkpoint forward (retrying only the
//!    write); on failure, park the batch and stop

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::adapters::IdentityService;
use super::checkpoint::{CheckpointStore, OrchestrationCheckpoint};
use super::error::{BatchError, CheckpointError, ExecutorError};
use super::executor::PaymentExecutor;
use super::progress::{NoopProgress, Phase, ProgressPublisher};
use super::state::BatchState;
use super::types::{
    BatchRequest, BatchRequestId, FailureRecord, InFlightIteration, IterationResult,
    OrchestrationOutcome,
};

/// Cooperative cancellation, checked between iterations only
///
/// An iteration already handed to the executor always runs to its outcome.
#[derive(Debug, Default)]
pub struct CancelSignal {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Retry policy for checkpoint writes
///
/// Only transient storage errors are retried. The executor is never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for CheckpointRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl CheckpointRetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): doubles, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Exclusive claim on a batch within this process
struct RunLease<'a> {
    active: &'a DashMap<BatchRequestId, BatchState>,
    request_id: BatchRequestId,
}

impl<'a> RunLease<'a> {
    fn acquire(
        active: &'a DashMap<BatchRequestId, BatchState>,
        request_id: BatchRequestId,
    ) -> Result<Self, BatchError> {
        match active.entry(request_id) {
            Entry::Occupied(_) => Err(BatchError::AlreadyRunning(request_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(BatchState::Pending);
                Ok(Self { active, request_id })
            }
        }
    }

    fn set(&self, state: BatchState) {
        if let Some(mut current) = self.active.get_mut(&self.request_id) {
            *current = state;
        }
    }
}

impl Drop for RunLease<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.request_id);
    }
}

/// State of a batch no run currently owns
pub fn settled_state(checkpoint: &OrchestrationCheckpoint) -> BatchState {
    if checkpoint.archived || checkpoint.is_complete() {
        BatchState::Completed
    } else if checkpoint.failure.is_some() {
        BatchState::Failed
    } else {
        BatchState::Pending
    }
}

pub struct PaymentBatchOrchestrator {
    store: Arc<dyn CheckpointStore>,
    executor: Arc<dyn PaymentExecutor>,
    identity: Arc<dyn IdentityService>,
    progress: Arc<dyn ProgressPublisher>,
    retry: CheckpointRetryPolicy,
    active: DashMap<BatchRequestId, BatchState>,
}

impl PaymentBatchOrchestrator {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        executor: Arc<dyn PaymentExecutor>,
        identity: Arc<dyn IdentityService>,
    ) -> Self {
        Self {
            store,
            executor,
            identity,
            progress: Arc::new(NoopProgress),
            retry: CheckpointRetryPolicy::default(),
            active: DashMap::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressPublisher>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_retry_policy(mut self, retry: CheckpointRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn is_running(&self, request_id: BatchRequestId) -> bool {
        self.active.contains_key(&request_id)
    }

    pub fn running_count(&self) -> usize {
        self.active.len()
    }

    /// Reject requests that cannot run on this network
    pub async fn validate(&self, request: &BatchRequest) -> Result<(), BatchError> {
        if request.iteration_count == 0 {
            return Err(BatchError::InvalidIterationCount);
        }
        if request.recipient.anonymous
            || self
                .identity
                .well_known_party(&request.recipient.name)
                .await
                .is_none()
        {
            return Err(BatchError::UnknownParty(request.recipient.to_string()));
        }
        if self
            .identity
            .well_known_party(&request.notary.name)
            .await
            .is_none()
        {
            return Err(BatchError::UnknownParty(request.notary.to_string()));
        }
        if !self.identity.is_notary(&request.notary).await {
            return Err(BatchError::NotANotary(request.notary.to_string()));
        }
        Ok(())
    }

    /// Validate and persist a new batch without running it
    pub async fn submit(&self, request: BatchRequest) -> Result<BatchRequestId, BatchError> {
        self.validate(&request).await?;
        let request_id = BatchRequestId::new();
        self.store.initialize(request_id, &request).await?;
        info!(
            request_id = %request_id,
            iterations = request.iteration_count,
            amount = %request.amount,
            recipient = %request.recipient,
            "Batch submitted"
        );
        Ok(request_id)
    }

    /// Submit and run a new batch to its outcome
    pub async fn execute(
        &self,
        request: BatchRequest,
        cancel: &CancelSignal,
    ) -> Result<(BatchRequestId, OrchestrationOutcome), BatchError> {
        self.validate(&request).await?;
        let request_id = BatchRequestId::new();
        let lease = RunLease::acquire(&self.active, request_id)?;
        self.store.initialize(request_id, &request).await?;
        info!(
            request_id = %request_id,
            iterations = request.iteration_count,
            amount = %request.amount,
            recipient = %request.recipient,
            "Batch submitted"
        );
        let outcome = self.drive(&lease, request_id, cancel).await?;
        Ok((request_id, outcome))
    }

    /// Run (or resume) a persisted batch to its outcome
    pub async fn run(
        &self,
        request_id: BatchRequestId,
        cancel: &CancelSignal,
    ) -> Result<OrchestrationOutcome, BatchError> {
        let lease = RunLease::acquire(&self.active, request_id)?;
        self.drive(&lease, request_id, cancel).await
    }

    /// Run a persisted batch on the tokio runtime
    pub fn spawn_run(
        self: &Arc<Self>,
        request_id: BatchRequestId,
        cancel: Arc<CancelSignal>,
    ) -> JoinHandle<Result<OrchestrationOutcome, BatchError>> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(request_id, &cancel).await })
    }

    pub async fn state(&self, request_id: BatchRequestId) -> Result<BatchState, BatchError> {
        if let Some(state) = self.active.get(&request_id) {
            return Ok(*state);
        }
        Ok(settled_state(&self.checkpoint(request_id).await?))
    }

    pub async fn checkpoint(
        &self,
        request_id: BatchRequestId,
    ) -> Result<OrchestrationCheckpoint, BatchError> {
        self.store
            .load(request_id)
            .await?
            .ok_or_else(|| BatchError::NotFound(request_id.to_string()))
    }

    async fn drive(
        &self,
        lease: &RunLease<'_>,
        request_id: BatchRequestId,
        cancel: &CancelSignal,
    ) -> Result<OrchestrationOutcome, BatchError> {
        let mut checkpoint = self.checkpoint(request_id).await?;
        checkpoint.verify()?;

        if let Some(in_flight) = checkpoint.in_flight.clone() {
            checkpoint = self.reconcile_in_flight(&checkpoint, &in_flight).await?;
        }

        let OrchestrationCheckpoint {
            request,
            completed_iterations,
            last_result,
            archived,
            ..
        } = checkpoint;
        let total = request.iteration_count;

        if completed_iterations >= total {
            let result = last_result.ok_or_else(|| {
                BatchError::CheckpointInconsistency(format!(
                    "batch {} complete without a result",
                    request_id
                ))
            })?;
            if !archived {
                self.archive(request_id, total).await;
            }
            lease.set(BatchState::Completed);
            info!(request_id = %request_id, iterations = total, "Batch already complete");
            return Ok(OrchestrationOutcome::Completed(result));
        }

        lease.set(BatchState::Running);
        info!(
            request_id = %request_id,
            completed = completed_iterations,
            total,
            store = self.store.name(),
            "Batch running"
        );

        let mut completed = completed_iterations;
        let mut last = last_result;
        while completed < total {
            if cancel.is_cancelled() {
                lease.set(BatchState::Pending);
                warn!(request_id = %request_id, completed, total, "Batch cancelled");
                return Err(BatchError::Cancelled {
                    request_id: request_id.to_string(),
                    completed,
                });
            }

            let iteration = completed + 1;
            self.progress.publish(request_id, Phase::Paying);
            let ctx = request.iteration_context(request_id, iteration);

            self.with_write_retry(request_id, iteration, "begin_iteration", || {
                self.store
                    .begin_iteration(request_id, iteration, &ctx.issue_ref)
            })
            .await
            .map_err(|(_, e)| BatchError::from(e))?;

            match self.executor.execute(&ctx).await {
                Ok(result) => {
                    completed = self.record_success(request_id, completed, &result).await?;
                    debug!(
                        request_id = %request_id,
                        iteration,
                        tx_id = %result.transaction_id,
                        "Iteration recorded"
                    );
                    last = Some(result);
                }
                Err(cause) => {
                    error!(
                        request_id = %request_id,
                        iteration,
                        code = cause.code(),
                        explicit = cause.is_explicit_fail(),
                        error = %cause,
                        "Iteration failed, batch stopped"
                    );
                    self.record_failure(request_id, iteration, &cause).await;
                    lease.set(BatchState::Failed);
                    return Ok(OrchestrationOutcome::Failed { iteration, cause });
                }
            }
        }

        let result = last.ok_or_else(|| {
            BatchError::CheckpointInconsistency(format!("batch {} finished without a result", request_id))
        })?;
        self.archive(request_id, total).await;
        lease.set(BatchState::Completed);
        info!(
            request_id = %request_id,
            iterations = total,
            tx_id = %result.transaction_id,
            "Batch completed"
        );
        Ok(OrchestrationOutcome::Completed(result))
    }

    /// Settle an iteration interrupted between begin and record
    async fn reconcile_in_flight(
        &self,
        checkpoint: &OrchestrationCheckpoint,
        in_flight: &InFlightIteration,
    ) -> Result<OrchestrationCheckpoint, BatchError> {
        let request_id = checkpoint.request_id;
        let iteration = in_flight.iteration;
        let ctx = checkpoint.request.iteration_context(request_id, iteration);
        warn!(
            request_id = %request_id,
            iteration,
            issue_ref = %in_flight.issue_ref,
            "In-flight iteration found, reconciling with ledger"
        );

        match self.executor.reconcile(&ctx).await {
            Ok(Some(result)) => {
                info!(
                    request_id = %request_id,
                    iteration,
                    tx_id = %result.transaction_id,
                    "In-flight iteration was finalized, recording without re-execution"
                );
                self.record_success(request_id, checkpoint.completed_iterations, &result)
                    .await?;
            }
            Ok(None) => {
                info!(
                    request_id = %request_id,
                    iteration,
                    "In-flight iteration not on ledger, will execute"
                );
                self.with_write_retry(request_id, iteration, "clear_in_flight", || {
                    self.store.clear_in_flight(request_id, iteration)
                })
                .await
                .map_err(|(_, e)| BatchError::from(e))?;
            }
            Err(cause) => {
                error!(
                    request_id = %request_id,
                    iteration,
                    error = %cause,
                    "Cannot determine in-flight iteration outcome"
                );
                return Err(BatchError::InDoubt { iteration, cause });
            }
        }

        let checkpoint = self.checkpoint(request_id).await?;
        checkpoint.verify()?;
        Ok(checkpoint)
    }

    /// Move the checkpoint from `expected` to `expected + 1`
    ///
    /// The iteration is already final on the ledger: only the write is retried.
    async fn record_success(
        &self,
        request_id: BatchRequestId,
        expected: u32,
        result: &IterationResult,
    ) -> Result<u32, BatchError> {
        let iteration = result.iteration;
        let written = self
            .with_write_retry(request_id, iteration, "advance", || {
                self.store.advance(request_id, expected, result)
            })
            .await;

        match written {
            Ok(completed) if completed == expected + 1 => Ok(completed),
            Ok(completed) => Err(BatchError::CheckpointInconsistency(format!(
                "advance of {} from {} reported {}",
                request_id, expected, completed
            ))),
            Err((_, CheckpointError::Conflict { actual, .. })) => {
                // A previous attempt may have landed with its acknowledgement lost
                if self.advance_landed(request_id, expected, result).await? {
                    debug!(request_id = %request_id, iteration, "Checkpoint advance already applied");
                    Ok(expected + 1)
                } else {
                    error!(
                        request_id = %request_id,
                        iteration,
                        expected,
                        actual,
                        "Checkpoint moved by another writer"
                    );
                    Err(BatchError::CheckpointInconsistency(format!(
                        "{} moved from {} to {} during iteration {}",
                        request_id, expected, actual, iteration
                    )))
                }
            }
            Err((attempts, source)) if source.is_transient() => {
                error!(
                    request_id = %request_id,
                    iteration,
                    tx_id = %result.transaction_id,
                    attempts,
                    error = %source,
                    "CRITICAL: iteration final on ledger but checkpoint write failed"
                );
                Err(BatchError::CheckpointWrite {
                    iteration,
                    attempts,
                    source,
                })
            }
            Err((_, source)) => Err(source.into()),
        }
    }

    async fn advance_landed(
        &self,
        request_id: BatchRequestId,
        expected: u32,
        result: &IterationResult,
    ) -> Result<bool, BatchError> {
        let current = self.checkpoint(request_id).await?;
        Ok(current.completed_iterations == expected + 1
            && current.last_result.as_ref() == Some(result))
    }

    async fn record_failure(&self, request_id: BatchRequestId, iteration: u32, cause: &ExecutorError) {
        let failure = FailureRecord::from_error(iteration, cause);
        if let Err((attempts, e)) = self
            .with_write_retry(request_id, iteration, "fail_iteration", || {
                self.store.fail_iteration(request_id, &failure)
            })
            .await
        {
            warn!(
                request_id = %request_id,
                iteration,
                attempts,
                error = %e,
                "Failure not recorded, batch stays eligible for recovery"
            );
        }
    }

    async fn archive(&self, request_id: BatchRequestId, iterations: u32) {
        if let Err((attempts, e)) = self
            .with_write_retry(request_id, iterations, "archive", || {
                self.store.archive(request_id)
            })
            .await
        {
            warn!(request_id = %request_id, attempts, error = %e, "Archive failed");
        }
    }

    /// Run a checkpoint write, retrying transient failures with backoff
    ///
    /// Returns the attempts made alongside the final error.
    async fn with_write_retry<T, F, Fut>(
        &self,
        request_id: BatchRequestId,
        iteration: u32,
        op: &'static str,
        mut write: F,
    ) -> Result<T, (u32, CheckpointError)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CheckpointError>>,
    {
        let mut attempt = 1;
        loop {
            match write().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        request_id = %request_id,
                        iteration,
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Checkpoint write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err((attempt, e)),
            }
        }
    }
}
