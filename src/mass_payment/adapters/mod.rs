//! Ledger Collaborators
//!
//! Boundaries between the payment executor and the distributed ledger it
//! drives. Production deployments supply network-backed implementations;
//! [`SimulatedNetwork`] implements all four in process.
//!
//! Every call that can reach a remote node may fail with
//! `ExecutorError::Timeout` / `ExecutorError::Network`, in which case the
//! effect of the call is unknown.

pub mod simulated;

pub use simulated::SimulatedNetwork;

use async_trait::async_trait;

use super::error::ExecutorError;
use super::types::{IssueRef, Party, TransactionId};
use crate::money::Amount;

/// Reference to one unconsumed ledger state
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateRef(pub String);

/// Cash freshly issued to the orchestrating party
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedState {
    pub state_ref: StateRef,
    pub amount: Amount,
    pub owner: Party,
    pub notary: Party,
    pub issue_ref: IssueRef,
}

/// Unsigned transfer of one issued state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedTransaction {
    pub tx_id: TransactionId,
    pub inputs: Vec<StateRef>,
    pub amount: Amount,
    pub new_owner: Party,
    pub notary: Party,
    pub issue_ref: IssueRef,
}

/// Counterparty signature over a proposed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agreement {
    pub tx_id: TransactionId,
    pub counterparty: Party,
}

/// Notary signature: the inputs were unconsumed and are now spent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notarisation {
    pub tx_id: TransactionId,
    pub notary: Party,
}

/// Transfer committed to the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedTransfer {
    pub tx_id: TransactionId,
    pub issue_ref: IssueRef,
    pub amount: Amount,
    pub new_owner: Party,
    pub notary: Party,
}

/// Local ledger: issuance, transaction building, finality and lookup
#[async_trait]
pub trait LedgerEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Self-issue `amount` to `owner`, tagged with `issue_ref`
    async fn issue(
        &self,
        amount: &Amount,
        issue_ref: &IssueRef,
        owner: &Party,
        notary: &Party,
    ) -> Result<IssuedState, ExecutorError>;

    /// Build a transaction moving `input` to `new_owner` under `notary`
    async fn build_transfer(
        &self,
        input: &IssuedState,
        new_owner: &Party,
        notary: &Party,
    ) -> Result<ProposedTransaction, ExecutorError>;

    /// Commit a fully signed transaction
    async fn finalize(
        &self,
        tx: &ProposedTransaction,
        agreement: &Agreement,
        notarisation: &Notarisation,
    ) -> Result<TransactionId, ExecutorError>;

    /// Finalized transfer whose cash carried `issue_ref`, if any
    async fn find_by_reference(
        &self,
        issue_ref: &IssueRef,
    ) -> Result<Option<FinalizedTransfer>, ExecutorError>;
}

/// Negotiation channel to the receiving party
#[async_trait]
pub trait CounterpartyChannel: Send + Sync {
    /// Ask `counterparty` to check and sign `tx`
    async fn propose(
        &self,
        counterparty: &Party,
        tx: &ProposedTransaction,
    ) -> Result<Agreement, ExecutorError>;
}

/// Uniqueness service guarding against double spends
#[async_trait]
pub trait NotaryService: Send + Sync {
    async fn notarise(
        &self,
        notary: &Party,
        tx: &ProposedTransaction,
    ) -> Result<Notarisation, ExecutorError>;
}

/// Party resolution and anonymous identity minting
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Well-known party registered under `name`
    async fn well_known_party(&self, name: &str) -> Option<Party>;

    async fn is_notary(&self, party: &Party) -> bool;

    /// Mint a fresh single-use identity controlled by `party`
    async fn fresh_anonymous(&self, party: &Party) -> Result<Party, ExecutorError>;
}
