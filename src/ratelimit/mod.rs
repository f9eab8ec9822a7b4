//! Sliding-window rate limiting over a shared store.

mod coordinator;
mod rules;
mod window;

pub use coordinator::{Decision, RateLimitCoordinator};
pub use rules::{RuleConfig, RuleSet, TimeUnit, DEFAULT_BUCKETS};
pub use window::{BucketedWindow, Evaluation};
