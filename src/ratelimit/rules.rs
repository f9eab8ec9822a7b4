//! Named rate limit rules and the registry of coordinators built from them.
//!
//! Each rule becomes one [`RateLimitCoordinator`]. All coordinators in a
//! [`RuleSet`] share a single store and are kept apart by their prefixes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::coordinator::RateLimitCoordinator;
use crate::error::{LimiterError, Result};
use crate::store::Store;

/// Number of buckets used when a rule does not say.
pub const DEFAULT_BUCKETS: u64 = 100;

/// A single named rate limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Name used to look the rule up
    pub name: String,
    /// Maximum admitted events per window
    pub limit: u64,
    /// Window length in seconds
    #[serde(default)]
    pub window_secs: Option<u64>,
    /// Window given as a time unit instead of seconds
    #[serde(default)]
    pub unit: Option<TimeUnit>,
    /// Target number of buckets per window
    #[serde(default = "default_buckets")]
    pub buckets: u64,
    /// Storage namespace shared by every process enforcing this rule
    #[serde(default)]
    pub prefix: Option<String>,
}

fn default_buckets() -> u64 {
    DEFAULT_BUCKETS
}

/// Time unit for rule windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of this time unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

impl RuleConfig {
    /// Create a rule with a window in seconds and default buckets.
    pub fn new(name: impl Into<String>, limit: u64, window_secs: u64) -> Self {
        Self {
            name: name.into(),
            limit,
            window_secs: Some(window_secs),
            unit: None,
            buckets: DEFAULT_BUCKETS,
            prefix: None,
        }
    }

    /// The window this rule limits over.
    pub fn window(&self) -> Result<Duration> {
        match (self.window_secs, self.unit) {
            (Some(secs), None) => Ok(Duration::from_secs(secs)),
            (None, Some(unit)) => Ok(unit.duration()),
            (Some(_), Some(_)) => Err(LimiterError::Config(format!(
                "rule '{}' sets both window_secs and unit",
                self.name
            ))),
            (None, None) => Err(LimiterError::Config(format!(
                "rule '{}' needs window_secs or unit",
                self.name
            ))),
        }
    }

    /// Check the rule without building anything.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(LimiterError::Config("rule name must not be empty".to_string()));
        }
        if self.window()?.as_secs() == 0 {
            return Err(LimiterError::Config(format!(
                "rule '{}' window must be at least one second",
                self.name
            )));
        }
        if self.buckets == 0 {
            return Err(LimiterError::Config(format!(
                "rule '{}' needs at least one bucket",
                self.name
            )));
        }
        Ok(())
    }

    /// Build the coordinator enforcing this rule.
    pub fn build(&self, store: Arc<dyn Store>) -> Result<RateLimitCoordinator> {
        self.validate()?;
        let coordinator = RateLimitCoordinator::new(self.window()?, self.limit, self.buckets, store)?;
        Ok(match &self.prefix {
            Some(prefix) => coordinator.with_prefix(prefix.clone()),
            None => coordinator,
        })
    }
}

struct Entry {
    rule: RuleConfig,
    coordinator: Arc<RateLimitCoordinator>,
}

/// The coordinators for a set of rules, sharing one store.
///
/// Rules can be replaced at runtime with [`RuleSet::reload`].
pub struct RuleSet {
    store: Arc<dyn Store>,
    entries: RwLock<HashMap<String, Entry>>,
}

impl RuleSet {
    /// Build a coordinator for every rule.
    pub fn build(rules: &[RuleConfig], store: Arc<dyn Store>) -> Result<Self> {
        let entries = Self::build_entries(rules, &store, &HashMap::new())?;
        info!(rules = entries.len(), "Rule set built");
        Ok(Self {
            store,
            entries: RwLock::new(entries),
        })
    }

    /// Get the coordinator for a rule.
    pub fn get(&self, name: &str) -> Option<Arc<RateLimitCoordinator>> {
        self.entries
            .read()
            .get(name)
            .map(|entry| entry.coordinator.clone())
    }

    /// Names of all rules, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether there are no rules.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Replace the rules.
    ///
    /// Rules whose configuration is unchanged keep their coordinator, and with
    /// it their storage prefix and recorded state. On error the current rules
    /// stay in place.
    pub fn reload(&self, rules: &[RuleConfig]) -> Result<()> {
        let mut entries = self.entries.write();
        let rebuilt = Self::build_entries(rules, &self.store, &entries)?;
        info!(rules = rebuilt.len(), "Rule set reloaded");
        *entries = rebuilt;
        Ok(())
    }

    fn build_entries(
        rules: &[RuleConfig],
        store: &Arc<dyn Store>,
        current: &HashMap<String, Entry>,
    ) -> Result<HashMap<String, Entry>> {
        let mut entries = HashMap::with_capacity(rules.len());

        for rule in rules {
            if entries.contains_key(&rule.name) {
                return Err(LimiterError::Config(format!(
                    "duplicate rule name '{}'",
                    rule.name
                )));
            }

            let coordinator = match current.get(&rule.name) {
                Some(existing) if existing.rule == *rule => existing.coordinator.clone(),
                _ => Arc::new(rule.build(store.clone())?),
            };

            entries.insert(
                rule.name.clone(),
                Entry {
                    rule: rule.clone(),
                    coordinator,
                },
            );
        }

        Ok(entries)
    }
}
