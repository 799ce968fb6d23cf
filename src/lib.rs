//! Mass Payment - batched issue-and-pay orchestration
//!
//! Issues and pays N identical cash amounts to one recipient, one finalized
//! transaction per iteration, with a durable checkpoint after each so an
//! interrupted batch resumes without paying twice.
//!
//! # Modules
//!
//! - [`money`] - Validated decimal amounts and currency codes
//! - [`journal`] - CRC-framed append-only journal format
//! - [`mass_payment`] - Orchestrator, executor, checkpoint stores, recovery
//! - [`gateway`] - HTTP API
//! - [`bootstrap`] - Node wiring from configuration
//! - [`config`] / [`logging`] - YAML configuration and tracing setup

pub mod bootstrap;
pub mod config;
pub mod gateway;
pub mod journal;
pub mod logging;
pub mod mass_payment;
pub mod money;

// Convenient re-exports at crate root
pub use mass_payment::{
    BatchError, BatchRequest, BatchRequestId, BatchState, CancelSignal, OrchestrationOutcome,
    Party, PaymentBatchOrchestrator,
};
pub use money::Amount;
