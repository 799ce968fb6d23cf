//! In-process ledger network
//!
//! One node's view of a small network: a ledger with issuance and finality, a
//! notary enforcing single-spend of inputs, counterparties that sign whatever
//! they are sent, and an identity registry. Faults are injected by call
//! ordinal (1-based, counted per operation across all batches).

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::{
    Agreement, CounterpartyChannel, FinalizedTransfer, IdentityService, IssuedState, LedgerEngine,
    Notarisation, NotaryService, ProposedTransaction, StateRef,
};
use crate::mass_payment::error::ExecutorError;
use crate::mass_payment::types::{IssueRef, Party, TransactionId};
use crate::money::Amount;

#[derive(Default)]
struct Book {
    parties: HashMap<String, bool>,
    unconsumed: HashMap<StateRef, IssuedState>,
    consumed: HashSet<StateRef>,
    finalized: Vec<FinalizedTransfer>,
    by_reference: HashMap<IssueRef, usize>,
}

#[derive(Default)]
struct Faults {
    reject_proposal: HashSet<u64>,
    timeout_proposal: HashSet<u64>,
    notary_conflict: HashSet<u64>,
    timeout_after_finalize: HashSet<u64>,
    lookup_unavailable: bool,
}

pub struct SimulatedNetwork {
    book: Mutex<Book>,
    faults: Mutex<Faults>,
    latency: Option<Duration>,
    issue_calls: AtomicU64,
    proposal_calls: AtomicU64,
    notarise_calls: AtomicU64,
    finalize_calls: AtomicU64,
}

impl Default for SimulatedNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        Self {
            book: Mutex::new(Book::default()),
            faults: Mutex::new(Faults::default()),
            latency: None,
            issue_calls: AtomicU64::new(0),
            proposal_calls: AtomicU64::new(0),
            notarise_calls: AtomicU64::new(0),
            finalize_calls: AtomicU64::new(0),
        }
    }

    /// Delay applied to each counterparty and notary round trip
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn register_party(&self, name: &str) -> Party {
        if let Ok(mut book) = self.book.lock() {
            book.parties.entry(name.to_string()).or_insert(false);
        }
        Party::new(name)
    }

    pub fn register_notary(&self, name: &str) -> Party {
        if let Ok(mut book) = self.book.lock() {
            book.parties.insert(name.to_string(), true);
        }
        Party::new(name)
    }

    // === Fault injection ===

    pub fn reject_proposal_at(&self, ordinal: u64) {
        self.with_faults(|f| f.reject_proposal.insert(ordinal));
    }

    pub fn time_out_proposal_at(&self, ordinal: u64) {
        self.with_faults(|f| f.timeout_proposal.insert(ordinal));
    }

    pub fn conflict_at_notarisation(&self, ordinal: u64) {
        self.with_faults(|f| f.notary_conflict.insert(ordinal));
    }

    /// Commit the finalize call then report a timeout
    pub fn time_out_after_finalize_at(&self, ordinal: u64) {
        self.with_faults(|f| f.timeout_after_finalize.insert(ordinal));
    }

    pub fn set_lookup_unavailable(&self, unavailable: bool) {
        self.with_faults(|f| f.lookup_unavailable = unavailable);
    }

    // === Inspection ===

    pub fn issue_count(&self) -> u64 {
        self.issue_calls.load(Ordering::SeqCst)
    }

    pub fn proposal_count(&self) -> u64 {
        self.proposal_calls.load(Ordering::SeqCst)
    }

    pub fn notarise_count(&self) -> u64 {
        self.notarise_calls.load(Ordering::SeqCst)
    }

    /// Committed transfers in finality order
    pub fn finalized(&self) -> Vec<FinalizedTransfer> {
        self.book
            .lock()
            .map(|book| book.finalized.clone())
            .unwrap_or_default()
    }

    fn with_faults<T>(&self, f: impl FnOnce(&mut Faults) -> T) {
        if let Ok(mut faults) = self.faults.lock() {
            f(&mut faults);
        }
    }

    fn fault(&self, check: impl FnOnce(&Faults) -> bool) -> bool {
        self.faults.lock().map(|f| check(&f)).unwrap_or(false)
    }

    fn book(&self) -> Result<MutexGuard<'_, Book>, ExecutorError> {
        self.book
            .lock()
            .map_err(|_| ExecutorError::Network("ledger unavailable".into()))
    }

    async fn round_trip(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl LedgerEngine for SimulatedNetwork {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn issue(
        &self,
        amount: &Amount,
        issue_ref: &IssueRef,
        owner: &Party,
        notary: &Party,
    ) -> Result<IssuedState, ExecutorError> {
        self.issue_calls.fetch_add(1, Ordering::SeqCst);
        let state = IssuedState {
            state_ref: StateRef(format!("{}:0", ulid::Ulid::new())),
            amount: amount.clone(),
            owner: owner.clone(),
            notary: notary.clone(),
            issue_ref: issue_ref.clone(),
        };
        self.book()?
            .unconsumed
            .insert(state.state_ref.clone(), state.clone());
        debug!(issue_ref = %issue_ref, state_ref = %state.state_ref.0, "Issued");
        Ok(state)
    }

    async fn build_transfer(
        &self,
        input: &IssuedState,
        new_owner: &Party,
        notary: &Party,
    ) -> Result<ProposedTransaction, ExecutorError> {
        if !self.book()?.unconsumed.contains_key(&input.state_ref) {
            return Err(ExecutorError::ValidationFailed(format!(
                "input {} is not an unconsumed state",
                input.state_ref.0
            )));
        }
        if &input.notary != notary {
            return Err(ExecutorError::ValidationFailed(format!(
                "input notary {} differs from {}",
                input.notary, notary
            )));
        }
        Ok(ProposedTransaction {
            tx_id: TransactionId::new(ulid::Ulid::new().to_string()),
            inputs: vec![input.state_ref.clone()],
            amount: input.amount.clone(),
            new_owner: new_owner.clone(),
            notary: notary.clone(),
            issue_ref: input.issue_ref.clone(),
        })
    }

    async fn finalize(
        &self,
        tx: &ProposedTransaction,
        agreement: &Agreement,
        notarisation: &Notarisation,
    ) -> Result<TransactionId, ExecutorError> {
        let ordinal = self.finalize_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if agreement.tx_id != tx.tx_id || notarisation.tx_id != tx.tx_id {
            return Err(ExecutorError::ValidationFailed(format!(
                "signatures do not cover {}",
                tx.tx_id
            )));
        }
        {
            let mut book = self.book()?;
            for input in &tx.inputs {
                book.unconsumed.remove(input);
            }
            let index = book.finalized.len();
            book.finalized.push(FinalizedTransfer {
                tx_id: tx.tx_id.clone(),
                issue_ref: tx.issue_ref.clone(),
                amount: tx.amount.clone(),
                new_owner: tx.new_owner.clone(),
                notary: tx.notary.clone(),
            });
            book.by_reference.insert(tx.issue_ref.clone(), index);
        }
        if self.fault(|f| f.timeout_after_finalize.contains(&ordinal)) {
            return Err(ExecutorError::Timeout("finality acknowledgement".into()));
        }
        Ok(tx.tx_id.clone())
    }

    async fn find_by_reference(
        &self,
        issue_ref: &IssueRef,
    ) -> Result<Option<FinalizedTransfer>, ExecutorError> {
        if self.fault(|f| f.lookup_unavailable) {
            return Err(ExecutorError::Network("vault query unavailable".into()));
        }
        let book = self.book()?;
        Ok(book
            .by_reference
            .get(issue_ref)
            .and_then(|&i| book.finalized.get(i).cloned()))
    }
}

#[async_trait]
impl CounterpartyChannel for SimulatedNetwork {
    async fn propose(
        &self,
        counterparty: &Party,
        tx: &ProposedTransaction,
    ) -> Result<Agreement, ExecutorError> {
        let ordinal = self.proposal_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.round_trip().await;

        if !self.book()?.parties.contains_key(&counterparty.name) {
            return Err(ExecutorError::CounterpartyRejected(format!(
                "no session with {}",
                counterparty
            )));
        }
        if self.fault(|f| f.timeout_proposal.contains(&ordinal)) {
            return Err(ExecutorError::Timeout(format!("signature from {}", counterparty)));
        }
        if self.fault(|f| f.reject_proposal.contains(&ordinal)) {
            return Err(ExecutorError::CounterpartyRejected(format!(
                "{} declined {}",
                counterparty, tx.tx_id
            )));
        }
        Ok(Agreement {
            tx_id: tx.tx_id.clone(),
            counterparty: counterparty.clone(),
        })
    }
}

#[async_trait]
impl NotaryService for SimulatedNetwork {
    async fn notarise(
        &self,
        notary: &Party,
        tx: &ProposedTransaction,
    ) -> Result<Notarisation, ExecutorError> {
        let ordinal = self.notarise_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.round_trip().await;

        let injected = self.fault(|f| f.notary_conflict.contains(&ordinal));
        let mut book = self.book()?;
        if book.parties.get(&notary.name) != Some(&true) {
            return Err(ExecutorError::ValidationFailed(format!("{} is not a notary", notary)));
        }
        if let Some(spent) = tx.inputs.iter().find(|s| book.consumed.contains(*s)) {
            return Err(ExecutorError::NotaryConflict(spent.0.clone()));
        }
        if injected {
            return Err(ExecutorError::NotaryConflict(
                tx.inputs.first().map(|s| s.0.clone()).unwrap_or_default(),
            ));
        }
        for input in &tx.inputs {
            book.consumed.insert(input.clone());
        }
        Ok(Notarisation {
            tx_id: tx.tx_id.clone(),
            notary: notary.clone(),
        })
    }
}

#[async_trait]
impl IdentityService for SimulatedNetwork {
    async fn well_known_party(&self, name: &str) -> Option<Party> {
        let book = self.book.lock().ok()?;
        book.parties.contains_key(name).then(|| Party::new(name))
    }

    async fn is_notary(&self, party: &Party) -> bool {
        !party.anonymous
            && self
                .book
                .lock()
                .map(|b| b.parties.get(&party.name) == Some(&true))
                .unwrap_or(false)
    }

    async fn fresh_anonymous(&self, party: &Party) -> Result<Party, ExecutorError> {
        if party.anonymous {
            return Err(ExecutorError::ValidationFailed(format!(
                "{} is already anonymous",
                party
            )));
        }
        Ok(Party::anonymous(format!("key-{}", ulid::Ulid::new())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn network() -> (SimulatedNetwork, Party, Party, Party) {
        let net = SimulatedNetwork::new();
        let me = net.register_party("O=Bank A, L=London, C=GB");
        let bob = net.register_party("O=Bank B, L=New York, C=US");
        let notary = net.register_notary("O=Notary, L=Zurich, C=CH");
        (net, me, bob, notary)
    }

    fn ten_usd() -> Amount {
        Amount::new(Decimal::from(10), "USD").unwrap()
    }

    #[tokio::test]
    async fn test_full_transfer_is_findable_by_reference() {
        let (net, me, bob, notary) = network();
        let issue_ref = IssueRef::from("batch/000001".to_string());

        let issued = net.issue(&ten_usd(), &issue_ref, &me, &notary).await.unwrap();
        let tx = net.build_transfer(&issued, &bob, &notary).await.unwrap();
        let agreement = net.propose(&bob, &tx).await.unwrap();
        let notarisation = net.notarise(&notary, &tx).await.unwrap();
        let tx_id = net.finalize(&tx, &agreement, &notarisation).await.unwrap();

        let found = net.find_by_reference(&issue_ref).await.unwrap().unwrap();
        assert_eq!(found.tx_id, tx_id);
        assert_eq!(found.new_owner, bob);
        assert_eq!(net.finalized().len(), 1);
    }

    #[tokio::test]
    async fn test_notary_rejects_double_spend() {
        let (net, me, bob, notary) = network();
        let issued = net
            .issue(&ten_usd(), &IssueRef::from("r".to_string()), &me, &notary)
            .await
            .unwrap();
        let tx1 = net.build_transfer(&issued, &bob, &notary).await.unwrap();
        let tx2 = net.build_transfer(&issued, &bob, &notary).await.unwrap();

        net.notarise(&notary, &tx1).await.unwrap();
        assert!(matches!(
            net.notarise(&notary, &tx2).await,
            Err(ExecutorError::NotaryConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_faults_by_ordinal() {
        let (net, me, bob, notary) = network();
        net.reject_proposal_at(2);

        let issued = net
            .issue(&ten_usd(), &IssueRef::from("r".to_string()), &me, &notary)
            .await
            .unwrap();
        let tx = net.build_transfer(&issued, &bob, &notary).await.unwrap();
        assert!(net.propose(&bob, &tx).await.is_ok());
        assert!(matches!(
            net.propose(&bob, &tx).await,
            Err(ExecutorError::CounterpartyRejected(_))
        ));
        assert_eq!(net.proposal_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_counterparty_rejected() {
        let (net, me, _bob, notary) = network();
        let stranger = Party::new("O=Unknown, L=Nowhere, C=XX");
        let issued = net
            .issue(&ten_usd(), &IssueRef::from("r".to_string()), &me, &notary)
            .await
            .unwrap();
        let tx = net.build_transfer(&issued, &stranger, &notary).await.unwrap();
        assert!(matches!(
            net.propose(&stranger, &tx).await,
            Err(ExecutorError::CounterpartyRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_identity_service() {
        let (net, _me, bob, notary) = network();
        assert_eq!(net.well_known_party(&bob.name).await, Some(bob.clone()));
        assert!(net.well_known_party("O=Nobody").await.is_none());
        assert!(net.is_notary(&notary).await);
        assert!(!net.is_notary(&bob).await);

        let a1 = net.fresh_anonymous(&bob).await.unwrap();
        let a2 = net.fresh_anonymous(&bob).await.unwrap();
        assert!(a1.anonymous);
        assert_ne!(a1, a2);
    }
}
