//! Configuration management for Restrictor.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LimiterError, Result};
use crate::ratelimit::RuleConfig;

/// Main configuration for a Restrictor deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestrictorConfig {
    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limit rules
    #[serde(default = "default_rules")]
    pub rules: Vec<RuleConfig>,
}

impl Default for RestrictorConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            rules: default_rules(),
        }
    }
}

fn default_rules() -> Vec<RuleConfig> {
    vec![RuleConfig::new("default", 100, 60)]
}

/// Which store backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process memory, shared only by callers in this process
    #[default]
    Memory,
    /// A Redis server shared by every process
    Redis,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend kind
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// How long a per-key lock is held before it can be taken over
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

fn default_lock_timeout_ms() -> u64 {
    1000
}

impl RestrictorConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RestrictorConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.rules.is_empty() {
            return Err(LimiterError::Config("at least one rule is required".to_string()));
        }

        let mut names = HashSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !names.insert(rule.name.as_str()) {
                return Err(LimiterError::Config(format!(
                    "duplicate rule name '{}'",
                    rule.name
                )));
            }
        }

        if self.store.lock_timeout_ms == 0 {
            return Err(LimiterError::Config(
                "lock_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Redis
            && self.store.redis_url.as_deref().map_or(true, str::is_empty)
        {
            return Err(LimiterError::Config(
                "redis_url is required for the redis backend".to_string(),
            ));
        }

        Ok(())
    }
}
