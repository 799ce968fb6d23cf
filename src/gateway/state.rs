use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::mass_payment::{CancelSignal, PaymentBatchOrchestrator};

/// Gateway shared state
pub struct AppState {
    pub orchestrator: Arc<PaymentBatchOrchestrator>,
    /// Tripped on shutdown; background runs stop between iterations
    pub shutdown: Arc<CancelSignal>,
    /// Background batch runs and the recovery worker, drained on shutdown
    tasks: Mutex<JoinSet<()>>,
}

impl AppState {
    pub fn new(orchestrator: Arc<PaymentBatchOrchestrator>, shutdown: Arc<CancelSignal>) -> Self {
        Self {
            orchestrator,
            shutdown,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Spawn a task that shutdown waits for
    pub async fn spawn_tracked<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        // Reap finished runs so the set only holds live ones
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    pub async fn tracked_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Wait for every tracked task; call after tripping `shutdown`
    pub async fn drain(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        if tasks.is_empty() {
            return;
        }
        tracing::info!(tasks = tasks.len(), "Waiting for background runs to stop");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Background run panicked or was aborted");
            }
        }
        tracing::info!("Background runs stopped");
    }
}
