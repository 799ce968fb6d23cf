use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::mass_payment::{CheckpointRetryPolicy, WorkerConfig};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// Emit per-iteration progress events
    #[serde(default)]
    pub enable_tracing: bool,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    Memory,
    Journal,
    Postgres,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CheckpointConfig {
    pub backend: CheckpointBackend,
    pub journal_path: String,
    #[serde(default)]
    pub postgres_url: Option<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::Journal,
            journal_path: "./data/mass_payment/checkpoints.journal".to_string(),
            postgres_url: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub checkpoint_retry: RetryConfig,
}

/// Retry of checkpoint writes after an iteration has finalized
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 2000,
        }
    }
}

impl From<&RetryConfig> for CheckpointRetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        Self {
            max_attempts: c.max_attempts.max(1),
            initial_backoff: Duration::from_millis(c.initial_backoff_ms),
            max_backoff: Duration::from_millis(c.max_backoff_ms),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub scan_interval_ms: u64,
    pub stale_threshold_ms: u64,
    pub batch_size: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_ms: 30_000,
            stale_threshold_ms: 60_000,
            batch_size: 100,
        }
    }
}

impl From<&RecoveryConfig> for WorkerConfig {
    fn from(c: &RecoveryConfig) -> Self {
        Self {
            scan_interval: Duration::from_millis(c.scan_interval_ms),
            stale_threshold: Duration::from_millis(c.stale_threshold_ms),
            batch_size: c.batch_size,
        }
    }
}

/// Participants of the simulated ledger network
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    /// Legal name of this node
    pub identity: String,
    #[serde(default)]
    pub parties: Vec<String>,
    #[serde(default)]
    pub notaries: Vec<String>,
    /// Artificial delay per ledger call
    #[serde(default)]
    pub latency_ms: u64,
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
log_level: info
log_dir: ./logs
log_file: mass_payment.log
use_json: false
rotation: daily
gateway:
  host: 0.0.0.0
  port: 8080
network:
  identity: "O=Bank A, L=London, C=GB"
  parties: ["O=Bank B, L=New York, C=US"]
  notaries: ["O=Notary, L=Zurich, C=CH"]
"#;

    #[test]
    fn test_defaults_fill_optional_sections() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();
        assert!(!config.enable_tracing);
        assert_eq!(config.checkpoint.backend, CheckpointBackend::Journal);
        assert_eq!(config.orchestrator.checkpoint_retry.max_attempts, 5);
        assert!(config.recovery.enabled);
        assert_eq!(config.network.latency_ms, 0);
    }

    #[test]
    fn test_conversions() {
        let retry = CheckpointRetryPolicy::from(&RetryConfig {
            max_attempts: 0,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
        });
        assert_eq!(retry.max_attempts, 1);
        assert_eq!(retry.initial_backoff, Duration::from_millis(10));

        let worker = WorkerConfig::from(&RecoveryConfig::default());
        assert_eq!(worker.scan_interval, Duration::from_secs(30));
        assert_eq!(worker.batch_size, 100);
    }

    #[test]
    fn test_backend_names() {
        let yaml = MINIMAL.to_string()
            + "checkpoint:\n  backend: postgres\n  journal_path: unused\n  postgres_url: postgresql://localhost/mp\n";
        let config = AppConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.checkpoint.backend, CheckpointBackend::Postgres);
        assert!(config.checkpoint.postgres_url.is_some());

        assert!(AppConfig::from_yaml(&MINIMAL.replace("port: 8080", "port: x")).is_err());
    }
}
