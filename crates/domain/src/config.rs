//! Layered configuration: TOML file defaults overridden by environment
//! variables, following the same per-section `#[serde(default)]` shape
//! and `validate() -> Vec<ConfigIssue>` pattern used throughout the
//! core's ambient stack.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub state_store: StateStoreConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub agent_runner: AgentRunnerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub allowlists: AllowlistSeeds,
}

impl Config {
    /// Load from a TOML file, then apply environment overrides.
    /// Missing file is not an error — defaults are used.
    pub fn load(path: Option<&std::path::Path>) -> crate::error::Result<Self> {
        let mut cfg: Config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)?;
                toml::from_str(&raw)
                    .map_err(|e| crate::error::Error::Config(format!("{}: {e}", p.display())))?
            }
            _ => Config::default(),
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Overlay a handful of environment variables onto a file-loaded
    /// config, per §6 "Configuration (environment)".
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("WARDEN_STATE_STORE_LOCK_TTL_SECS") {
            if let Ok(n) = v.parse() {
                self.state_store.lock_ttl_secs = n;
            }
        }
        if let Ok(v) = std::env::var("WARDEN_RECONCILER_TICK_SECS") {
            if let Ok(n) = v.parse() {
                self.reconciler.tick_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("WARDEN_ROUTER_MAX_CHANNELS") {
            if let Ok(n) = v.parse() {
                self.router.max_channels = n;
            }
        }
        if let Ok(v) = std::env::var("WARDEN_ROUTER_QUEUE_CAPACITY") {
            if let Ok(n) = v.parse() {
                self.router.queue_capacity = n;
            }
        }
        if let Ok(v) = std::env::var("WARDEN_DEFAULT_MODEL_NAME") {
            self.agent_runner.default_model_name = v;
        }
        if let Ok(v) = std::env::var("WARDEN_DEFAULT_COMMAND_PREFIX") {
            self.allowlists.default_command_prefix = v;
        }
        if let Ok(v) = std::env::var("WARDEN_MONITOR_BIND") {
            self.server.bind_addr = v;
        }
        if let Ok(v) = std::env::var("WARDEN_DM_ALLOWLIST_SEED") {
            self.allowlists
                .direct_message_seed
                .extend(v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()));
        }
        if let Ok(v) = std::env::var("WARDEN_SERVER_ALLOWLIST_SEED") {
            self.allowlists
                .server_seed
                .extend(v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()));
        }
    }

    /// Validate the configuration and return a list of issues.
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.state_store.lock_ttl_secs == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "state_store.lock_ttl_secs".into(),
                message: "lock TTL must be greater than 0".into(),
            });
        }
        if self.reconciler.tick_interval_secs == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "reconciler.tick_interval_secs".into(),
                message: "tick interval must be greater than 0".into(),
            });
        }
        if self.router.max_channels == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "router.max_channels".into(),
                message: "max_channels must be greater than 0".into(),
            });
        }
        if self.router.queue_capacity == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "router.queue_capacity".into(),
                message: "queue_capacity must be greater than 0".into(),
            });
        }
        if self.agent_runner.chunk_size_chars == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "agent_runner.chunk_size_chars".into(),
                message: "chunk_size_chars must be greater than 0".into(),
            });
        }
        if self.agent_runner.models.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "agent_runner.models".into(),
                message: "no models configured — every AgentConfig.model_name will resolve to ConfigError".into(),
            });
        }
        for (alias, target) in &self.agent_runner.model_aliases {
            if !self.agent_runner.models.contains_key(target) {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: format!("agent_runner.model_aliases.{alias}"),
                    message: format!("alias target \"{target}\" has no model policy"),
                });
            }
        }
        for (name, policy) in &self.agent_runner.models {
            if policy.max_tokens == 0 {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: format!("agent_runner.models.{name}.max_tokens"),
                    message: "max_tokens must be greater than 0".into(),
                });
            }
            if policy.interval_seconds == 0 {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: format!("agent_runner.models.{name}.interval_seconds"),
                    message: "interval_seconds must be greater than 0".into(),
                });
            }
        }
        if !self.agent_runner.models.contains_key(&self.agent_runner.default_model_name)
            && !self.agent_runner.model_aliases.contains_key(&self.agent_runner.default_model_name)
        {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "agent_runner.default_model_name".into(),
                message: format!(
                    "default model \"{}\" has no policy or alias entry",
                    self.agent_runner.default_model_name
                ),
            });
        }
        if self.server.bind_addr.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.bind_addr".into(),
                message: "bind_addr must not be empty".into(),
            });
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateStoreConfig {
    /// Bounded TTL for `starting`/`stopping` distributed locks (§4.1).
    #[serde(default = "d_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Timeout for State Store operations (§5 "10 s for the State Store").
    #[serde(default = "d_store_timeout_secs")]
    pub op_timeout_secs: u64,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: d_lock_ttl_secs(),
            op_timeout_secs: d_store_timeout_secs(),
        }
    }
}

fn d_lock_ttl_secs() -> u64 {
    10
}

fn d_store_timeout_secs() -> u64 {
    10
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reconciler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Tick period, default ≈3 s per §4.2.
    #[serde(default = "d_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: d_tick_interval_secs(),
        }
    }
}

fn d_tick_interval_secs() -> u64 {
    3
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Maximum simultaneous ConversationKeys with a live queue, default 100.
    #[serde(default = "d_max_channels")]
    pub max_channels: usize,
    /// Maximum pending items per key, default 64.
    #[serde(default = "d_queue_capacity")]
    pub queue_capacity: usize,
    /// Bounded wait before a full queue's `enqueue` fails with
    /// `ChannelBacklogged`, default 1 s.
    #[serde(default = "d_backlog_wait_ms")]
    pub backlog_wait_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_channels: d_max_channels(),
            queue_capacity: d_queue_capacity(),
            backlog_wait_ms: d_backlog_wait_ms(),
        }
    }
}

fn d_max_channels() -> usize {
    100
}

fn d_queue_capacity() -> usize {
    64
}

fn d_backlog_wait_ms() -> u64 {
    1_000
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Declared policy when a per-session request would exceed `max_tokens`
/// within `interval_seconds` (§4.6 "defer vs reject — a declared option
/// on the model record").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitPolicy {
    Defer,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPolicy {
    pub max_tokens: u64,
    pub interval_seconds: u64,
    #[serde(default = "d_rate_limit_policy")]
    pub on_exceed: RateLimitPolicy,
}

fn d_rate_limit_policy() -> RateLimitPolicy {
    RateLimitPolicy::Reject
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunnerConfig {
    /// Timeout for a single agent-engine call (§5 "30 s for the agent engine").
    #[serde(default = "d_engine_timeout_secs")]
    pub engine_timeout_secs: u64,
    /// Timeout for the chat-service send path (§5 "5 s ... with internal retries").
    #[serde(default = "d_send_timeout_secs")]
    pub send_timeout_secs: u64,
    /// Output chunk size in characters, fixed at 2,000 by §4.6.
    #[serde(default = "d_chunk_size_chars")]
    pub chunk_size_chars: usize,
    #[serde(default = "d_default_model_name")]
    pub default_model_name: String,
    /// Historical model name → canonical model name (§9 "Model aliases").
    #[serde(default)]
    pub model_aliases: HashMap<String, String>,
    /// Per-model rate-limit policy, keyed by canonical model name.
    #[serde(default)]
    pub models: HashMap<String, ModelPolicy>,
}

impl Default for AgentRunnerConfig {
    fn default() -> Self {
        let mut models = HashMap::new();
        models.insert(
            d_default_model_name(),
            ModelPolicy {
                max_tokens: 100_000,
                interval_seconds: 60,
                on_exceed: RateLimitPolicy::Reject,
            },
        );
        Self {
            engine_timeout_secs: d_engine_timeout_secs(),
            send_timeout_secs: d_send_timeout_secs(),
            chunk_size_chars: d_chunk_size_chars(),
            default_model_name: d_default_model_name(),
            model_aliases: HashMap::new(),
            models,
        }
    }
}

fn d_engine_timeout_secs() -> u64 {
    30
}

fn d_send_timeout_secs() -> u64 {
    5
}

fn d_chunk_size_chars() -> usize {
    2_000
}

fn d_default_model_name() -> String {
    "gpt-4o".to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Monitoring server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the read-only monitoring endpoint (§6).
    #[serde(default = "d_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: d_bind_addr(),
        }
    }
}

fn d_bind_addr() -> String {
    "127.0.0.1:8089".to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Allowlist seeds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Seeds merged into every per-bot allowlist at reconciliation time —
/// operators can grant a set of ids (e.g. moderators, a home server)
/// access across every bot without repeating it in each `InitConfig`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AllowlistSeeds {
    #[serde(default)]
    pub direct_message_seed: Vec<String>,
    #[serde(default)]
    pub server_seed: Vec<String>,
    #[serde(default = "d_command_prefix")]
    pub default_command_prefix: String,
}

fn d_command_prefix() -> String {
    "!".to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut models = HashMap::new();
        models.insert(
            "gpt-4o".to_string(),
            ModelPolicy {
                max_tokens: 50_000,
                interval_seconds: 60,
                on_exceed: RateLimitPolicy::Reject,
            },
        );
        Config {
            agent_runner: AgentRunnerConfig {
                models,
                ..AgentRunnerConfig::default()
            },
            ..Config::default()
        }
    }

    #[test]
    fn valid_config_passes() {
        let issues = valid_config().validate();
        let errors: Vec<_> = issues
            .iter()
            .filter(|i| i.severity == ConfigSeverity::Error)
            .collect();
        assert!(errors.is_empty(), "expected no errors, got: {errors:?}");
    }

    #[test]
    fn zero_lock_ttl_is_error() {
        let mut cfg = valid_config();
        cfg.state_store.lock_ttl_secs = 0;
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|i| i.field == "state_store.lock_ttl_secs" && i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn no_models_is_warning() {
        let mut cfg = valid_config();
        cfg.agent_runner.models.clear();
        let issues = cfg.validate();
        let issue = issues
            .iter()
            .find(|i| i.field == "agent_runner.models")
            .expect("expected no-models warning");
        assert_eq!(issue.severity, ConfigSeverity::Warning);
    }

    #[test]
    fn dangling_alias_is_error() {
        let mut cfg = valid_config();
        cfg.agent_runner
            .model_aliases
            .insert("gpt4".to_string(), "gpt-4-turbo".to_string());
        let issues = cfg.validate();
        assert!(issues.iter().any(|i| i.field == "agent_runner.model_aliases.gpt4"));
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let cfg = Config::default();
        let serialized = toml::to_string(&cfg).expect("serialize");
        let parsed: Config = toml::from_str(&serialized).expect("parse");
        assert_eq!(parsed.router.max_channels, cfg.router.max_channels);
    }

    #[test]
    fn empty_bind_addr_is_error() {
        let mut cfg = valid_config();
        cfg.server.bind_addr = String::new();
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|i| i.field == "server.bind_addr" && i.severity == ConfigSeverity::Error));
    }
}
