//! Mass Payment node
//!
//! ```text
//! mass_payment [--env dev] serve
//! mass_payment pay --iterations 3 --amount 100 --currency USD \
//!     --recipient "O=Bank B, L=New York, C=US" --notary "O=Notary, L=Zurich, C=CH"
//! mass_payment resume <request_id>
//! mass_payment status <request_id>
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;

use mass_payment::bootstrap::{Node, build_node};
use mass_payment::config::AppConfig;
use mass_payment::gateway::{self, state::AppState};
use mass_payment::mass_payment::{
    BatchRequestId, BatchStatusResponse, CancelSignal, MassPaymentApiRequest,
    OrchestrationOutcome, RecoveryWorker, WorkerConfig,
};

#[derive(Parser)]
#[command(
    name = "mass_payment",
    version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ")"),
    about = "Batched issue-and-pay orchestrator"
)]
struct Cli {
    /// Config environment, loads config/<env>.yaml
    #[arg(short, long, default_value = "dev")]
    env: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway and the recovery worker
    Serve,
    /// Run a new batch in the foreground
    Pay {
        #[arg(long)]
        iterations: u32,
        #[arg(long)]
        amount: String,
        #[arg(long)]
        currency: String,
        #[arg(long)]
        recipient: String,
        #[arg(long)]
        notary: String,
        /// Pay the recipient's well-known identity
        #[arg(long)]
        no_anonymize: bool,
    },
    /// Resume a pending or failed batch in the foreground
    Resume { request_id: String },
    /// Print the checkpoint of a batch
    Status { request_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.env)?;
    let _log_guard = mass_payment::logging::init_logging(&config);

    tracing::info!(
        env = %cli.env,
        version = env!("GIT_HASH"),
        "Starting mass payment node"
    );
    let node = build_node(&config).await?;

    match cli.command {
        Command::Serve => serve(&config, node).await,
        Command::Pay {
            iterations,
            amount,
            currency,
            recipient,
            notary,
            no_anonymize,
        } => {
            let request = MassPaymentApiRequest {
                iteration_count: iterations,
                amount,
                currency,
                recipient,
                anonymize: !no_anonymize,
                notary,
            }
            .into_batch_request()?;
            let cancel = cancel_on_ctrl_c();
            let (request_id, outcome) = node.orchestrator.execute(request, &cancel).await?;
            report(request_id, &outcome);
            print_status(&node, request_id).await
        }
        Command::Resume { request_id } => {
            let request_id = parse_id(&request_id)?;
            let cancel = cancel_on_ctrl_c();
            let outcome = node.orchestrator.run(request_id, &cancel).await?;
            report(request_id, &outcome);
            print_status(&node, request_id).await
        }
        Command::Status { request_id } => print_status(&node, parse_id(&request_id)?).await,
    }
}

async fn serve(config: &AppConfig, node: Node) -> anyhow::Result<()> {
    let shutdown = Arc::new(CancelSignal::new());
    let state = Arc::new(AppState::new(node.orchestrator.clone(), shutdown.clone()));

    if config.recovery.enabled {
        let worker = RecoveryWorker::new(
            node.orchestrator.clone(),
            WorkerConfig::from(&config.recovery),
            shutdown,
        );
        state.spawn_tracked(async move { worker.run().await }).await;
    }

    tracing::info!(identity = %node.identity, "Node ready");
    gateway::run_server(&config.gateway, state).await
}

fn cancel_on_ctrl_c() -> Arc<CancelSignal> {
    let cancel = Arc::new(CancelSignal::new());
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Cancelling after the current iteration");
            signal.cancel();
        }
    });
    cancel
}

fn parse_id(s: &str) -> anyhow::Result<BatchRequestId> {
    s.parse()
        .with_context(|| format!("Invalid request id: {}", s))
}

fn report(request_id: BatchRequestId, outcome: &OrchestrationOutcome) {
    match outcome {
        OrchestrationOutcome::Completed(_) => {
            tracing::info!(request_id = %request_id, "{}", outcome)
        }
        OrchestrationOutcome::Failed { .. } => {
            tracing::error!(request_id = %request_id, "{}", outcome)
        }
    }
}

async fn print_status(node: &Node, request_id: BatchRequestId) -> anyhow::Result<()> {
    let checkpoint = node.orchestrator.checkpoint(request_id).await?;
    let state = node.orchestrator.state(request_id).await?;
    let status = BatchStatusResponse::from_checkpoint(&checkpoint, state);
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
