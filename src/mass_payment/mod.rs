//! Mass Payment Orchestrator
//!
//! Runs a batch of N identical issue-and-pay iterations against a ledger
//! network, checkpointing after every finalized iteration so an interrupted
//! batch resumes exactly where it stopped.
//!
//! # State Machine
//!
//! ```text
//! PENDING → RUNNING → COMPLETED
//!              ↓
//!            FAILED
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Persist-Before-Call**: the in-flight marker is durable before the executor runs
//! 2. **Never Re-Pay**: a finalized iteration is recorded, never executed again
//! 3. **Stop On First Failure**: a failed iteration ends the run; later iterations never start
//! 4. **Monotonic Progress**: `completed_iterations` only moves forward by one, via CAS

pub mod adapters;
pub mod api;
pub mod checkpoint;
pub mod db;
pub mod error;
pub mod executor;
pub mod journal_store;
pub mod orchestrator;
pub mod progress;
pub mod state;
pub mod types;
pub mod worker;


// Re-exports for convenience
pub use adapters::SimulatedNetwork;
pub use api::{BatchAcceptedResponse, BatchStatusResponse, MassPaymentApiRequest};
pub use checkpoint::{CheckpointStore, MemoryCheckpointStore, OrchestrationCheckpoint};
pub use db::PgCheckpointStore;
pub use error::{BatchError, CheckpointError, ExecutorError};
pub use executor::{CashPaymentExecutor, PaymentExecutor};
pub use journal_store::JournalCheckpointStore;
pub use orchestrator::{CancelSignal, CheckpointRetryPolicy, PaymentBatchOrchestrator};
pub use progress::{BroadcastProgress, Phase, ProgressEvent, ProgressPublisher, TracingProgress};
pub use state::BatchState;
pub use types::{
    BatchRequest, BatchRequestId, IterationResult, OrchestrationOutcome, Party, TransactionId,
};
pub use worker::{RecoveryWorker, WorkerConfig};
