//! Orchestration Checkpoints
//!
//! The checkpoint is the single source of truth for batch progress. Every
//! backend applies the same transition rules (`apply_*` below) so a batch
//! resumes identically whether it was persisted in memory, in the journal or in
//! PostgreSQL.
//!
//! # Transitions
//!
//! ```text
//! initialize ──► begin_iteration(k) ──► advance(k-1 → k) ──► ... ──► archive
//!                      │
//!                      ├──► clear_in_flight(k)        (ledger did not commit)
//!                      └──► fail_iteration(k)         (batch parked until resumed)
//! ```

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::error::CheckpointError;
use super::types::{
    BatchRequest, BatchRequestId, FailureRecord, InFlightIteration, IssueRef, IterationResult,
};

/// Durable progress record of one batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationCheckpoint {
    pub request_id: BatchRequestId,
    pub request: BatchRequest,
    /// Iterations finalized and recorded; only ever grows
    pub completed_iterations: u32,
    /// Iteration started but not yet recorded
    pub in_flight: Option<InFlightIteration>,
    /// Result of iteration `completed_iterations`
    pub last_result: Option<IterationResult>,
    pub failure: Option<FailureRecord>,
    pub archived: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl OrchestrationCheckpoint {
    pub fn new(request_id: BatchRequestId, request: BatchRequest) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            request_id,
            request,
            completed_iterations: 0,
            in_flight: None,
            last_result: None,
            failure: None,
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.request
            .iteration_count
            .saturating_sub(self.completed_iterations)
    }

    pub fn is_complete(&self) -> bool {
        self.completed_iterations >= self.request.iteration_count
    }

    /// Eligible for a recovery scan: not archived and not parked by a failure
    pub fn is_recoverable(&self) -> bool {
        !self.archived && self.failure.is_none()
    }

    /// Check structural invariants of a loaded checkpoint
    pub fn verify(&self) -> Result<(), CheckpointError> {
        let id = self.request_id;
        if self.request.iteration_count == 0 {
            return Err(CheckpointError::inconsistent(id, "iteration_count is 0"));
        }
        if self.completed_iterations > self.request.iteration_count {
            return Err(CheckpointError::inconsistent(
                id,
                format!(
                    "completed {} exceeds iteration_count {}",
                    self.completed_iterations, self.request.iteration_count
                ),
            ));
        }
        match &self.last_result {
            Some(result) if result.iteration != self.completed_iterations => {
                return Err(CheckpointError::inconsistent(
                    id,
                    format!(
                        "last result is iteration {}, completed is {}",
                        result.iteration, self.completed_iterations
                    ),
                ));
            }
            None if self.completed_iterations > 0 => {
                return Err(CheckpointError::inconsistent(
                    id,
                    "completed iterations recorded without a result",
                ));
            }
            _ => {}
        }
        if let Some(in_flight) = &self.in_flight {
            if in_flight.iteration != self.completed_iterations + 1 {
                return Err(CheckpointError::inconsistent(
                    id,
                    format!(
                        "in-flight iteration {} does not follow completed {}",
                        in_flight.iteration, self.completed_iterations
                    ),
                ));
            }
            if in_flight.issue_ref != IssueRef::for_iteration(id, in_flight.iteration) {
                return Err(CheckpointError::inconsistent(
                    id,
                    format!("in-flight issue ref {} is foreign", in_flight.issue_ref),
                ));
            }
        }
        if self.archived && !self.is_complete() {
            return Err(CheckpointError::inconsistent(id, "archived before completion"));
        }
        Ok(())
    }

    // ========================================================================
    // Transition rules shared by all backends
    // ========================================================================

    /// Record that `iteration` is about to be executed
    ///
    /// Re-beginning the same in-flight iteration is a no-op.
    pub fn apply_begin(
        &mut self,
        iteration: u32,
        issue_ref: &IssueRef,
        now: i64,
    ) -> Result<(), CheckpointError> {
        if self.archived {
            return Err(CheckpointError::inconsistent(self.request_id, "batch archived"));
        }
        if iteration != self.completed_iterations + 1 || iteration > self.request.iteration_count {
            return Err(CheckpointError::inconsistent(
                self.request_id,
                format!(
                    "cannot begin iteration {} with {} of {} completed",
                    iteration, self.completed_iterations, self.request.iteration_count
                ),
            ));
        }
        match &self.in_flight {
            Some(existing) if existing.iteration != iteration || &existing.issue_ref != issue_ref => {
                Err(CheckpointError::inconsistent(
                    self.request_id,
                    format!("iteration {} already in flight", existing.iteration),
                ))
            }
            _ => {
                self.in_flight = Some(InFlightIteration {
                    iteration,
                    issue_ref: issue_ref.clone(),
                });
                self.failure = None;
                self.updated_at = now;
                Ok(())
            }
        }
    }

    /// Compare-and-set `completed_iterations` from `expected` to `expected + 1`
    pub fn apply_advance(
        &mut self,
        expected: u32,
        result: &IterationResult,
        now: i64,
    ) -> Result<u32, CheckpointError> {
        if self.completed_iterations != expected {
            return Err(CheckpointError::Conflict {
                request_id: self.request_id.to_string(),
                expected,
                actual: self.completed_iterations,
            });
        }
        if self.archived || self.is_complete() {
            return Err(CheckpointError::inconsistent(
                self.request_id,
                "advance past iteration_count",
            ));
        }
        if result.iteration != expected + 1 {
            return Err(CheckpointError::inconsistent(
                self.request_id,
                format!(
                    "result for iteration {} cannot advance from {}",
                    result.iteration, expected
                ),
            ));
        }
        self.completed_iterations = expected + 1;
        self.last_result = Some(result.clone());
        self.in_flight = None;
        self.failure = None;
        self.updated_at = now;
        Ok(self.completed_iterations)
    }

    /// Drop the in-flight marker of `iteration`; no-op when none is set
    pub fn apply_clear(&mut self, iteration: u32, now: i64) -> Result<(), CheckpointError> {
        match &self.in_flight {
            None => Ok(()),
            Some(existing) if existing.iteration == iteration => {
                self.in_flight = None;
                self.updated_at = now;
                Ok(())
            }
            Some(existing) => Err(CheckpointError::inconsistent(
                self.request_id,
                format!(
                    "clear of iteration {} while {} is in flight",
                    iteration, existing.iteration
                ),
            )),
        }
    }

    /// Park the batch after a failed iteration
    ///
    /// The in-flight marker survives only when the ledger outcome is unknown.
    pub fn apply_failure(
        &mut self,
        failure: &FailureRecord,
        now: i64,
    ) -> Result<(), CheckpointError> {
        if failure.iteration != self.completed_iterations + 1 {
            return Err(CheckpointError::inconsistent(
                self.request_id,
                format!(
                    "failure of iteration {} with {} completed",
                    failure.iteration, self.completed_iterations
                ),
            ));
        }
        if !failure.outcome_unknown {
            self.in_flight = None;
        }
        self.failure = Some(failure.clone());
        self.updated_at = now;
        Ok(())
    }

    pub fn apply_archive(&mut self, now: i64) -> Result<(), CheckpointError> {
        if !self.is_complete() {
            return Err(CheckpointError::inconsistent(
                self.request_id,
                format!(
                    "archive with {} of {} completed",
                    self.completed_iterations, self.request.iteration_count
                ),
            ));
        }
        if !self.archived {
            self.archived = true;
            self.updated_at = now;
        }
        Ok(())
    }
}

/// Durable checkpoint storage
///
/// Each mutating call is durable when it returns `Ok`. `advance` is a
/// compare-and-set on `completed_iterations`, so a retried write that already
/// landed surfaces as `Conflict` rather than double-counting.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Create the checkpoint of a new batch
    async fn initialize(
        &self,
        request_id: BatchRequestId,
        request: &BatchRequest,
    ) -> Result<OrchestrationCheckpoint, CheckpointError>;

    async fn load(
        &self,
        request_id: BatchRequestId,
    ) -> Result<Option<OrchestrationCheckpoint>, CheckpointError>;

    /// Persist the in-flight marker before the executor is called
    async fn begin_iteration(
        &self,
        request_id: BatchRequestId,
        iteration: u32,
        issue_ref: &IssueRef,
    ) -> Result<(), CheckpointError>;

    /// Record a finalized iteration; returns the new completed count
    async fn advance(
        &self,
        request_id: BatchRequestId,
        expected_completed: u32,
        result: &IterationResult,
    ) -> Result<u32, CheckpointError>;

    async fn clear_in_flight(
        &self,
        request_id: BatchRequestId,
        iteration: u32,
    ) -> Result<(), CheckpointError>;

    async fn fail_iteration(
        &self,
        request_id: BatchRequestId,
        failure: &FailureRecord,
    ) -> Result<(), CheckpointError>;

    async fn archive(&self, request_id: BatchRequestId) -> Result<(), CheckpointError>;

    /// Recoverable checkpoints not touched since `stale_before` (epoch millis),
    /// oldest first
    async fn list_unfinished(
        &self,
        stale_before: i64,
        limit: usize,
    ) -> Result<Vec<OrchestrationCheckpoint>, CheckpointError>;
}

#[inline]
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// In-process checkpoint store
///
/// Survives orchestrator restarts within one process; lost on process exit.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: DashMap<BatchRequestId, OrchestrationCheckpoint>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    fn mutate<T>(
        &self,
        request_id: BatchRequestId,
        f: impl FnOnce(&mut OrchestrationCheckpoint) -> Result<T, CheckpointError>,
    ) -> Result<T, CheckpointError> {
        let mut entry = self
            .checkpoints
            .get_mut(&request_id)
            .ok_or_else(|| CheckpointError::NotFound(request_id.to_string()))?;
        // Apply to a copy so a rejected transition leaves the record untouched
        let mut next = entry.clone();
        let out = f(&mut next)?;
        *entry = next;
        Ok(out)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn initialize(
        &self,
        request_id: BatchRequestId,
        request: &BatchRequest,
    ) -> Result<OrchestrationCheckpoint, CheckpointError> {
        use dashmap::mapref::entry::Entry;

        match self.checkpoints.entry(request_id) {
            Entry::Occupied(_) => Err(CheckpointError::AlreadyExists(request_id.to_string())),
            Entry::Vacant(slot) => {
                let checkpoint = OrchestrationCheckpoint::new(request_id, request.clone());
                slot.insert(checkpoint.clone());
                Ok(checkpoint)
            }
        }
    }

    async fn load(
        &self,
        request_id: BatchRequestId,
    ) -> Result<Option<OrchestrationCheckpoint>, CheckpointError> {
        Ok(self.checkpoints.get(&request_id).map(|c| c.value().clone()))
    }

    async fn begin_iteration(
        &self,
        request_id: BatchRequestId,
        iteration: u32,
        issue_ref: &IssueRef,
    ) -> Result<(), CheckpointError> {
        self.mutate(request_id, |c| c.apply_begin(iteration, issue_ref, now_ms()))
    }

    async fn advance(
        &self,
        request_id: BatchRequestId,
        expected_completed: u32,
        result: &IterationResult,
    ) -> Result<u32, CheckpointError> {
        self.mutate(request_id, |c| {
            c.apply_advance(expected_completed, result, now_ms())
        })
    }

    async fn clear_in_flight(
        &self,
        request_id: BatchRequestId,
        iteration: u32,
    ) -> Result<(), CheckpointError> {
        self.mutate(request_id, |c| c.apply_clear(iteration, now_ms()))
    }

    async fn fail_iteration(
        &self,
        request_id: BatchRequestId,
        failure: &FailureRecord,
    ) -> Result<(), CheckpointError> {
        self.mutate(request_id, |c| c.apply_failure(failure, now_ms()))
    }

    async fn archive(&self, request_id: BatchRequestId) -> Result<(), CheckpointError> {
        self.mutate(request_id, |c| c.apply_archive(now_ms()))
    }

    async fn list_unfinished(
        &self,
        stale_before: i64,
        limit: usize,
    ) -> Result<Vec<OrchestrationCheckpoint>, CheckpointError> {
        let mut found: Vec<OrchestrationCheckpoint> = self
            .checkpoints
            .iter()
            .filter(|c| c.is_recoverable() && c.updated_at <= stale_before)
            .map(|c| c.value().clone())
            .collect();
        found.sort_by_key(|c| c.updated_at);
        found.truncate(limit);
        Ok(found)
    }
}

/// Checkpoint store with injectable write failures for testing
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Wraps a [`MemoryCheckpointStore`]; failures are injected per operation
    #[derive(Default)]
    pub struct FlakyCheckpointStore {
        inner: MemoryCheckpointStore,
        /// Remaining `advance` calls to reject before touching state
        fail_advance: AtomicUsize,
        /// Remaining `advance` calls to apply but report as failed
        lose_advance_ack: AtomicUsize,
        fail_begin: Mutex<bool>,
        advance_calls: AtomicUsize,
    }

    impl FlakyCheckpointStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_next_advances(&self, n: usize) {
            self.fail_advance.store(n, Ordering::SeqCst);
        }

        pub fn lose_next_advance_acks(&self, n: usize) {
            self.lose_advance_ack.store(n, Ordering::SeqCst);
        }

        pub fn set_fail_begin(&self, fail: bool) {
            *self.fail_begin.lock().unwrap() = fail;
        }

        pub fn advance_calls(&self) -> usize {
            self.advance_calls.load(Ordering::SeqCst)
        }

        fn take(counter: &AtomicUsize) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl CheckpointStore for FlakyCheckpointStore {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn initialize(
            &self,
            request_id: BatchRequestId,
            request: &BatchRequest,
        ) -> Result<OrchestrationCheckpoint, CheckpointError> {
            self.inner.initialize(request_id, request).await
        }

        async fn load(
            &self,
            request_id: BatchRequestId,
        ) -> Result<Option<OrchestrationCheckpoint>, CheckpointError> {
            self.inner.load(request_id).await
        }

        async fn begin_iteration(
            &self,
            request_id: BatchRequestId,
            iteration: u32,
            issue_ref: &IssueRef,
        ) -> Result<(), CheckpointError> {
            if *self.fail_begin.lock().unwrap() {
                return Err(CheckpointError::Storage("injected begin failure".into()));
            }
            self.inner
                .begin_iteration(request_id, iteration, issue_ref)
                .await
        }

        async fn advance(
            &self,
            request_id: BatchRequestId,
            expected_completed: u32,
            result: &IterationResult,
        ) -> Result<u32, CheckpointError> {
            self.advance_calls.fetch_add(1, Ordering::SeqCst);
            if Self::take(&self.fail_advance) {
                return Err(CheckpointError::Storage("injected advance failure".into()));
            }
            let applied = self
                .inner
                .advance(request_id, expected_completed, result)
                .await?;
            if Self::take(&self.lose_advance_ack) {
                return Err(CheckpointError::Storage("acknowledgement lost".into()));
            }
            Ok(applied)
        }

        async fn clear_in_flight(
            &self,
            request_id: BatchRequestId,
            iteration: u32,
        ) -> Result<(), CheckpointError> {
            self.inner.clear_in_flight(request_id, iteration).await
        }

        async fn fail_iteration(
            &self,
            request_id: BatchRequestId,
            failure: &FailureRecord,
        ) -> Result<(), CheckpointError> {
            self.inner.fail_iteration(request_id, failure).await
        }

        async fn archive(&self, request_id: BatchRequestId) -> Result<(), CheckpointError> {
            self.inner.archive(request_id).await
        }

        async fn list_unfinished(
            &self,
            stale_before: i64,
            limit: usize,
        ) -> Result<Vec<OrchestrationCheckpoint>, CheckpointError> {
            self.inner.list_unfinished(stale_before, limit).await
        }
    }
}
