//! Node wiring
//!
//! Builds the checkpoint store, ledger network and orchestrator described by
//! an [`AppConfig`]. Shared by the gateway and the CLI.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, CheckpointBackend, CheckpointConfig, NetworkConfig};
use crate::mass_payment::{
    CashPaymentExecutor, CheckpointRetryPolicy, CheckpointStore, JournalCheckpointStore,
    MemoryCheckpointStore, Party, PaymentBatchOrchestrator, PgCheckpointStore, SimulatedNetwork,
    TracingProgress,
};

pub struct Node {
    pub identity: Party,
    pub network: Arc<SimulatedNetwork>,
    pub orchestrator: Arc<PaymentBatchOrchestrator>,
}

pub fn build_network(config: &NetworkConfig) -> Arc<SimulatedNetwork> {
    let mut network = SimulatedNetwork::new();
    if config.latency_ms > 0 {
        network = network.with_latency(Duration::from_millis(config.latency_ms));
    }
    network.register_party(&config.identity);
    for party in &config.parties {
        network.register_party(party);
    }
    for notary in &config.notaries {
        network.register_notary(notary);
    }
    Arc::new(network)
}

pub async fn open_store(config: &CheckpointConfig) -> anyhow::Result<Arc<dyn CheckpointStore>> {
    let store: Arc<dyn CheckpointStore> = match config.backend {
        CheckpointBackend::Memory => Arc::new(MemoryCheckpointStore::new()),
        CheckpointBackend::Journal => Arc::new(
            JournalCheckpointStore::open(&config.journal_path)
                .with_context(|| format!("Failed to open journal {}", config.journal_path))?,
        ),
        CheckpointBackend::Postgres => {
            let url = config
                .postgres_url
                .as_deref()
                .context("checkpoint.postgres_url is required for the postgres backend")?;
            Arc::new(
                PgCheckpointStore::connect(url)
                    .await
                    .context("Failed to connect checkpoint database")?,
            )
        }
    };
    tracing::info!(backend = store.name(), "Checkpoint store ready");
    Ok(store)
}

pub async fn build_node(config: &AppConfig) -> anyhow::Result<Node> {
    let network = build_network(&config.network);
    let store = open_store(&config.checkpoint).await?;
    let identity = Party::new(config.network.identity.clone());

    let executor = CashPaymentExecutor::new(
        identity.clone(),
        network.clone(),
        network.clone(),
        network.clone(),
        network.clone(),
    );
    let orchestrator = PaymentBatchOrchestrator::new(store, Arc::new(executor), network.clone())
        .with_progress(Arc::new(TracingProgress))
        .with_retry_policy(CheckpointRetryPolicy::from(
            &config.orchestrator.checkpoint_retry,
        ));

    Ok(Node {
        identity,
        network,
        orchestrator: Arc::new(orchestrator),
    })
}
