//! Restrictor - Distributed Sliding-Window Rate Limiting
//!
//! This crate decides whether an event for a key exceeds a configured count
//! within a sliding time window. Window state is kept in bounded buckets and
//! shared between processes through a pluggable store that offers only
//! key-value persistence and a per-key exclusive lock.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use error::{DecisionError, LimiterError, Result};
pub use ratelimit::{BucketedWindow, Decision, RateLimitCoordinator, RuleSet};
pub use store::{MemoryStore, Store};
