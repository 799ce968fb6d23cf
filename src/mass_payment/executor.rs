//! Atomic Payment Executor
//!
//! One iteration = one issue-and-pay: self-issue cash tagged with the
//! iteration's issue reference, build a transfer to the recipient (or a fresh
//! anonymous identity of it), collect the counterparty's signature, notarise and
//! finalize. The executor is not retried by the orchestrator; whatever it
//! returns is the outcome of the iteration.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::adapters::{CounterpartyChannel, IdentityService, LedgerEngine, NotaryService};
use super::error::ExecutorError;
use super::types::{IterationContext, IterationResult, Party};

#[async_trait]
pub trait PaymentExecutor: Send + Sync {
    /// Run one iteration to finality or failure
    async fn execute(&self, ctx: &IterationContext) -> Result<IterationResult, ExecutorError>;

    /// Look up whether the iteration described by `ctx` was finalized by an
    /// earlier, interrupted call
    async fn reconcile(
        &self,
        ctx: &IterationContext,
    ) -> Result<Option<IterationResult>, ExecutorError>;
}

/// Executor driving the ledger collaborators
pub struct CashPaymentExecutor {
    our_identity: Party,
    ledger: Arc<dyn LedgerEngine>,
    counterparty: Arc<dyn CounterpartyChannel>,
    notary: Arc<dyn NotaryService>,
    identity: Arc<dyn IdentityService>,
}

impl CashPaymentExecutor {
    pub fn new(
        our_identity: Party,
        ledger: Arc<dyn LedgerEngine>,
        counterparty: Arc<dyn CounterpartyChannel>,
        notary: Arc<dyn NotaryService>,
        identity: Arc<dyn IdentityService>,
    ) -> Self {
        Self {
            our_identity,
            ledger,
            counterparty,
            notary,
            identity,
        }
    }

    pub fn our_identity(&self) -> &Party {
        &self.our_identity
    }
}

#[async_trait]
impl PaymentExecutor for CashPaymentExecutor {
    async fn execute(&self, ctx: &IterationContext) -> Result<IterationResult, ExecutorError> {
        // Step A: issue
        let issued = self
            .ledger
            .issue(&ctx.amount, &ctx.issue_ref, &self.our_identity, &ctx.notary)
            .await?;
        debug!(
            request_id = %ctx.request_id,
            iteration = ctx.iteration,
            state_ref = %issued.state_ref.0,
            "Cash issued"
        );

        // Step B: transfer
        let new_owner = if ctx.anonymize {
            self.identity.fresh_anonymous(&ctx.recipient).await?
        } else {
            ctx.recipient.clone()
        };
        let tx = self
            .ledger
            .build_transfer(&issued, &new_owner, &ctx.notary)
            .await?;
        let agreement = self.counterparty.propose(&ctx.recipient, &tx).await?;
        let notarisation = self.notary.notarise(&ctx.notary, &tx).await?;
        let transaction_id = self.ledger.finalize(&tx, &agreement, &notarisation).await?;

        info!(
            request_id = %ctx.request_id,
            iteration = ctx.iteration,
            tx_id = %transaction_id,
            ledger = self.ledger.name(),
            "Payment finalized"
        );

        Ok(IterationResult {
            iteration: ctx.iteration,
            transaction_id,
            recipient: new_owner,
        })
    }

    async fn reconcile(
        &self,
        ctx: &IterationContext,
    ) -> Result<Option<IterationResult>, ExecutorError> {
        let found = self.ledger.find_by_reference(&ctx.issue_ref).await?;
        Ok(found.map(|transfer| IterationResult {
            iteration: ctx.iteration,
            transaction_id: transfer.tx_id,
            recipient: transfer.new_owner,
        }))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::mass_payment::adapters::SimulatedNetwork;
    use crate::mass_payment::types::{BatchRequest, BatchRequestId};
    use crate::money::Amount;
    use rust_decimal::Decimal;

    fn setup() -> (Arc<SimulatedNetwork>, CashPaymentExecutor, BatchRequest) {
        let net = Arc::new(SimulatedNetwork::new());
        let me = net.register_party("O=Bank A, L=London, C=GB");
        let bob = net.register_party("O=Bank B, L=New York, C=US");
        let notary = net.register_notary("O=Notary, L=Zurich, C=CH");
        let executor = CashPaymentExecutor::new(
            me,
            net.clone(),
            net.clone(),
            net.clone(),
            net.clone(),
        );
        let request = BatchRequest::new(
            2,
            Amount::new(Decimal::from(10), "USD").unwrap(),
            bob,
            false,
            notary,
        );
        (net, executor, request)
    }

    #[tokio::test]
    async fn test_execute_pays_recipient_under_requested_notary() {
        let (net, executor, request) = setup();
        let ctx = request.iteration_context(BatchRequestId::new(), 1);

        let result = executor.execute(&ctx).await.unwrap();
        assert_eq!(result.iteration, 1);
        assert_eq!(result.recipient, request.recipient);

        let finalized = net.finalized();
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].notary, request.notary);
        assert_eq!(finalized[0].issue_ref, ctx.issue_ref);
    }

    #[tokio::test]
    async fn test_execute_anonymized_pays_fresh_identity() {
        let (_net, executor, mut request) = setup();
        request.anonymize = true;
        let id = BatchRequestId::new();

        let r1 = executor.execute(&request.iteration_context(id, 1)).await.unwrap();
        let r2 = executor.execute(&request.iteration_context(id, 2)).await.unwrap();
        assert!(r1.recipient.anonymous);
        assert_ne!(r1.recipient, r2.recipient);
        assert_ne!(r1.recipient, request.recipient);
    }

    #[tokio::test]
    async fn test_notary_conflict_surfaces() {
        let (net, executor, request) = setup();
        net.conflict_at_notarisation(1);
        let ctx = request.iteration_context(BatchRequestId::new(), 1);

        let err = executor.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NotaryConflict(_)));
        assert!(err.is_explicit_fail());
        assert!(executor.reconcile(&ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reconcile_finds_committed_after_timeout() {
        let (net, executor, request) = setup();
        net.time_out_after_finalize_at(1);
        let ctx = request.iteration_context(BatchRequestId::new(), 1);

        let err = executor.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout(_)));

        let found = executor.reconcile(&ctx).await.unwrap().unwrap();
        assert_eq!(found.iteration, 1);
        assert_eq!(found.transaction_id, net.finalized()[0].tx_id);
    }
}
