use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use trustmesh_broker::ChannelManagerConfig;
use trustmesh_orchestrator::{CircuitBreakerConfig, OrchestratorConfig, RouteConfig, TaskKindSpec};
use trustmesh_reputation::EigenTrustConfig;
use trustmesh_types::BackoffPolicy;
use trustmesh_voting::VotingConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "TRUSTMESH_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "trustmesh.toml";

/// Top-level configuration for a trustmesh node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub reputation: EigenTrustConfig,
    #[serde(default)]
    pub voting: VotingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default level when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
    /// Per-target overrides, e.g. `trustmesh_broker = "debug"`.
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            filters: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    #[default]
    Memory,
    Amqp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub backend: BrokerBackend,
    #[serde(default = "default_amqp_uri")]
    pub uri: String,
    #[serde(default = "default_publish_channels")]
    pub publish_channels: usize,
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,
    #[serde(default = "default_true")]
    pub confirm_mode: bool,
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,
    #[serde(default = "default_reconnect")]
    pub reconnect: BackoffPolicy,
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
    #[serde(default = "default_dead_letter_route")]
    pub dead_letter_route: String,
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
}

fn default_amqp_uri() -> String {
    "amqp://127.0.0.1:5672/%2f".to_string()
}

fn default_publish_channels() -> usize {
    2
}

fn default_max_channels() -> usize {
    16
}

fn default_true() -> bool {
    true
}

fn default_confirm_timeout_ms() -> u64 {
    5_000
}

fn default_reconnect() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(200), Duration::from_secs(30))
}

fn default_max_redeliveries() -> u32 {
    5
}

fn default_dead_letter_route() -> String {
    "dead-letter".to_string()
}

fn default_prefetch() -> u16 {
    16
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::default(),
            uri: default_amqp_uri(),
            publish_channels: default_publish_channels(),
            max_channels: default_max_channels(),
            confirm_mode: true,
            confirm_timeout_ms: default_confirm_timeout_ms(),
            reconnect: default_reconnect(),
            max_redeliveries: default_max_redeliveries(),
            dead_letter_route: default_dead_letter_route(),
            prefetch: default_prefetch(),
        }
    }
}

impl BrokerConfig {
    pub fn manager_config(&self) -> ChannelManagerConfig {
        ChannelManagerConfig {
            publish_channels: self.publish_channels,
            max_channels: self.max_channels,
            confirm_mode: self.confirm_mode,
            confirm_timeout: Duration::from_millis(self.confirm_timeout_ms),
            reconnect: self.reconnect,
            max_redeliveries: self.max_redeliveries,
            dead_letter_route: self.dead_letter_route.clone(),
            prefetch: self.prefetch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    /// One of `aggressive`, `moderate`, `conservative`, `none`.
    #[serde(default = "default_retry_preset")]
    pub retry_preset: String,
    #[serde(default = "default_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_window_ms")]
    pub circuit_window_ms: u64,
    #[serde(default = "default_circuit_cooldown_ms")]
    pub circuit_cooldown_ms: u64,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    #[serde(default = "default_min_active_agents")]
    pub min_active_agents: usize,
    #[serde(default = "default_dispatch_prefix")]
    pub dispatch_prefix: String,
    #[serde(default = "default_results_route")]
    pub results_route: String,
    #[serde(default = "default_task_dead_letter_route")]
    pub dead_letter_route: String,
    #[serde(default = "default_inbound_route")]
    pub inbound_route: String,
    /// Task kinds accepted at startup.
    #[serde(default)]
    pub kinds: Vec<TaskKindSpec>,
}

fn default_ack_timeout_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    60_000
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_dispatch_interval_ms() -> u64 {
    250
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_preset() -> String {
    "moderate".to_string()
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_circuit_window_ms() -> u64 {
    60_000
}

fn default_circuit_cooldown_ms() -> u64 {
    30_000
}

fn default_publish_timeout_ms() -> u64 {
    5_000
}

fn default_min_active_agents() -> usize {
    1
}

fn default_dispatch_prefix() -> String {
    "tasks.dispatch".to_string()
}

fn default_results_route() -> String {
    "tasks.results".to_string()
}

fn default_task_dead_letter_route() -> String {
    "tasks.dead-letter".to_string()
}

fn default_inbound_route() -> String {
    "agents.inbound".to_string()
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            default_max_attempts: default_max_attempts(),
            retry_preset: default_retry_preset(),
            circuit_failure_threshold: default_failure_threshold(),
            circuit_window_ms: default_circuit_window_ms(),
            circuit_cooldown_ms: default_circuit_cooldown_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
            min_active_agents: default_min_active_agents(),
            dispatch_prefix: default_dispatch_prefix(),
            results_route: default_results_route(),
            dead_letter_route: default_task_dead_letter_route(),
            inbound_route: default_inbound_route(),
            kinds: Vec::new(),
        }
    }
}

impl OrchestratorSection {
    pub fn orchestrator_config(&self) -> Result<OrchestratorConfig> {
        let Some(retry) = BackoffPolicy::preset(&self.retry_preset) else {
            bail!("Unknown retry preset '{}'", self.retry_preset);
        };
        Ok(OrchestratorConfig {
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms.max(1)),
            dispatch_interval: Duration::from_millis(self.dispatch_interval_ms.max(1)),
            default_max_attempts: self.default_max_attempts.max(1),
            retry,
            circuit: CircuitBreakerConfig {
                failure_threshold: self.circuit_failure_threshold,
                window: Duration::from_millis(self.circuit_window_ms),
                cooldown: Duration::from_millis(self.circuit_cooldown_ms),
            },
            routes: RouteConfig {
                dispatch_prefix: self.dispatch_prefix.clone(),
                results: self.results_route.clone(),
                dead_letter: self.dead_letter_route.clone(),
                inbound: self.inbound_route.clone(),
            },
            publish_timeout: Duration::from_millis(self.publish_timeout_ms),
            min_active_agents: self.min_active_agents,
        })
    }
}

impl NodeConfig {
    /// Config file location: `$TRUSTMESH_CONFIG`, else `trustmesh.toml`.
    pub fn default_path() -> PathBuf {
        Self::resolve_path(std::env::var(CONFIG_ENV).ok())
    }

    fn resolve_path(from_env: Option<String>) -> PathBuf {
        from_env
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Load config from disk. Returns default if not found.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Save config to disk.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }
}
