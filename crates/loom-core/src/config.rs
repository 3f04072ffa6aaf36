//! Immutable process configuration.
//!
//! Loaded once at startup from an optional TOML file, overlaid with `LOOM_*`
//! environment variables, and never mutated afterward — a config reload is a
//! deliberate restart, not a runtime operation.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub security: SecurityConfig,
    pub plugins: PluginsConfig,
    pub personas: PersonasConfig,
    pub gateway: crate::types::GatewayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            security: SecurityConfig::default(),
            plugins: PluginsConfig::default(),
            personas: PersonasConfig::default(),
            gateway: crate::types::GatewayConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_concurrent_subagents: usize,
    pub max_tool_calls_per_turn: usize,
    pub max_history_messages: usize,
    pub enable_thinking: bool,
    pub subagent_timeout_seconds: u64,
    pub debounce_ms: u64,
    pub max_iterations: usize,
    pub default_model: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_subagents: 4,
            max_tool_calls_per_turn: 16,
            max_history_messages: 50,
            enable_thinking: true,
            subagent_timeout_seconds: 120,
            debounce_ms: 500,
            max_iterations: 25,
            default_model: "default".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub enabled: bool,
    pub default_role: String,
    pub roles: HashMap<String, RoleRules>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct RoleRules {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    pub enabled: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct PersonasConfig {
    pub enabled: Vec<String>,
}

impl Config {
    /// Load from a TOML file, falling back to defaults when the path is
    /// absent. A malformed file is an error — startup should abort, matching
    /// spec's "only initialization failures abort the process".
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(p)?;
                toml::from_str(&content)
                    .map_err(|e| crate::Error::ConfigError(format!("{}: {e}", p.display())))?
            }
            _ => Config::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("LOOM_MAX_CONCURRENT_SUBAGENTS") {
            if let Ok(n) = v.parse() {
                self.agent.max_concurrent_subagents = n;
            }
        }
        if let Ok(v) = std::env::var("LOOM_DEBOUNCE_MS") {
            if let Ok(n) = v.parse() {
                self.agent.debounce_ms = n;
            }
        }
        if let Ok(v) = std::env::var("LOOM_DEFAULT_MODEL") {
            self.agent.default_model = v;
        }
        if let Ok(v) = std::env::var("LOOM_SECURITY_ENABLED") {
            self.security.enabled = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("LOOM_GATEWAY_PORT") {
            if let Ok(n) = v.parse() {
                self.gateway.port = n;
            }
        }
    }
}
