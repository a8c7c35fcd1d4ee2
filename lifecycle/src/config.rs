//! Configuration for the hub

use crate::fees::FeeConfig;
use message_bus::{BrokerConfig, SlowConsumerPolicy, WebhookConfig};
use node_adapters::ClusterConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Hub configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ledger store
    pub ledger: ledger_core::Config,

    /// Incoming invoices
    pub invoices: InvoiceConfig,

    /// Outgoing payments
    pub payments: PaymentConfig,

    /// Fee reserve
    pub fees: FeeConfig,

    /// Pending payment reconciliation
    pub reconcile: ReconcileConfig,

    /// Settlement stream supervision
    pub supervisor: SupervisorConfig,

    /// Node backend
    pub node: NodeBackendConfig,

    /// Liveness cluster (used when more than one node is configured)
    pub cluster: ClusterConfig,

    /// Event broker
    pub broker: BrokerConfig,

    /// External event sinks
    pub sinks: SinksConfig,
}

/// Incoming invoice configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvoiceConfig {
    /// Invoice expiry (seconds)
    pub expiry_secs: u64,

    /// Largest amount a single invoice may request
    pub max_receive_sat: Option<i64>,
}

impl Default for InvoiceConfig {
    fn default() -> Self {
        Self {
            expiry_secs: 86_400,
            max_receive_sat: None,
        }
    }
}

/// Outgoing payment configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentConfig {
    /// Give up waiting on `pay_exact` after this long and leave the payment
    /// to reconciliation. `None` waits indefinitely.
    pub pay_timeout_secs: Option<u64>,
}

/// Reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Time between passes (seconds)
    pub interval_secs: u64,

    /// Only invoices untouched for this long are reconciled (seconds)
    pub safety_window_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            safety_window_secs: 300,
        }
    }
}

/// Settlement stream supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Restarts allowed before the failure becomes fatal
    pub max_restarts: u32,

    /// First restart delay (ms)
    pub initial_backoff_ms: u64,

    /// Upper bound on a restart delay (ms)
    pub max_backoff_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

/// Node backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeBackend {
    /// In-memory simulated nodes
    #[default]
    Simulated,
}

/// Node backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeBackendConfig {
    /// Backend kind
    pub backend: NodeBackend,

    /// Node names, in failover priority order
    pub nodes: Vec<String>,
}

impl Default for NodeBackendConfig {
    fn default() -> Self {
        Self {
            backend: NodeBackend::Simulated,
            nodes: vec!["node-a".to_string()],
        }
    }
}

/// External sinks fed from the broker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SinksConfig {
    /// Topics forwarded to every sink
    pub topics: Vec<String>,

    /// Webhook sink
    pub webhook: Option<WebhookConfig>,

    /// NATS sink
    pub nats: Option<NatsSinkConfig>,
}

/// NATS sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsSinkConfig {
    /// Server URL
    pub url: String,

    /// Subject prefix
    pub subject_prefix: String,
}

impl Default for NatsSinkConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            subject_prefix: "hub".to_string(),
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Defaults overridden by `HUB_*` environment variables
    pub fn from_env() -> crate::Result<Self> {
        Config::default().with_env_overrides()
    }

    /// Apply `HUB_*` environment variables on top of `self`
    pub fn with_env_overrides(mut self) -> crate::Result<Self> {
        if let Ok(dir) = std::env::var("HUB_DATA_DIR") {
            self.ledger.data_dir = PathBuf::from(dir);
        }

        if let Some(enabled) = parse_env("HUB_FEE_RESERVE_ENABLED")? {
            self.fees.reserve_enabled = enabled;
        }

        if let Some(secs) = parse_env("HUB_PAY_TIMEOUT_SECS")? {
            self.payments.pay_timeout_secs = Some(secs);
        }

        if let Some(secs) = parse_env("HUB_RECONCILE_INTERVAL_SECS")? {
            self.reconcile.interval_secs = secs;
        }

        if let Some(secs) = parse_env("HUB_SAFETY_WINDOW_SECS")? {
            self.reconcile.safety_window_secs = secs;
        }

        if let Some(threshold) = parse_env("HUB_LIVENESS_THRESHOLD")? {
            self.cluster.threshold = threshold;
        }

        if let Ok(nodes) = std::env::var("HUB_NODES") {
            self.node.nodes = nodes
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(policy) = std::env::var("HUB_SLOW_CONSUMER_POLICY") {
            self.broker.slow_consumer_policy = match policy.as_str() {
                "drop_event" => SlowConsumerPolicy::DropEvent,
                "disconnect" => SlowConsumerPolicy::Disconnect,
                other => {
                    return Err(crate::Error::Config(format!(
                        "HUB_SLOW_CONSUMER_POLICY: {}",
                        other
                    )))
                }
            };
        }

        if let Ok(url) = std::env::var("HUB_WEBHOOK_URL") {
            let webhook = self.sinks.webhook.get_or_insert_with(WebhookConfig::default);
            webhook.url = url;
        }

        if let Ok(url) = std::env::var("HUB_NATS_URL") {
            let nats = self.sinks.nats.get_or_insert_with(NatsSinkConfig::default);
            nats.url = url;
        }

        Ok(self)
    }

    /// Reject configurations the hub cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.nodes.is_empty() {
            return Err(crate::Error::Config("at least one node is required".into()));
        }
        if !(0.0..=1.0).contains(&self.cluster.threshold) {
            return Err(crate::Error::Config(format!(
                "liveness threshold {} outside [0, 1]",
                self.cluster.threshold
            )));
        }
        if self.fees.floor_sat < 0 || self.fees.base_sat < 0 {
            return Err(crate::Error::Config("fee reserve parts must be >= 0".into()));
        }
        if self.broker.channel_capacity == 0 {
            return Err(crate::Error::Config("broker channel capacity must be > 0".into()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> crate::Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| crate::Error::Config(format!("{}: {}", name, value))),
        Err(_) => Ok(None),
    }
}
