//! Bucketed sliding-window counter.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a single [`BucketedWindow::evaluate`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    /// Whether the limit has been reached (the event was not admitted)
    pub reached: bool,
    /// Count within the window, including the event if it was admitted
    pub count: u64,
    /// Whether the window was modified and needs to be persisted
    pub changed: bool,
    /// Whether the persisted state should get a full window of time-to-live
    pub reset_ttl: bool,
}

impl Evaluation {
    fn blocked(count: u64) -> Self {
        Self {
            reached: true,
            count,
            changed: false,
            reset_ttl: false,
        }
    }
}

/// A sliding-window event counter that aggregates events into buckets.
///
/// Buckets are keyed by epoch seconds aligned to the bucket span, so the
/// bucket an event lands in does not depend on when the window started.
/// Memory is bounded by `window / bucket_span` buckets per key.
///
/// The window holds no locks and knows nothing about storage; it is loaded,
/// evaluated and saved back whole while the caller holds the per-key lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketedWindow {
    /// Epoch second before which the window is known to be at capacity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    full_until: Option<i64>,
    /// Event counts indexed by normalized bucket timestamp
    #[serde(default)]
    buckets: HashMap<i64, u64>,
}

impl BucketedWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event at `now` unless the window already holds `limit` events.
    ///
    /// Buckets at or before `now - window_secs` are dropped as a side effect.
    /// Once the window is found full, the moment the oldest bucket leaves the
    /// window is cached and calls before it return without touching buckets.
    pub fn evaluate(
        &mut self,
        window_secs: u64,
        limit: u64,
        bucket_span: u64,
        now: DateTime<Utc>,
    ) -> Evaluation {
        if limit == 0 {
            return Evaluation::blocked(0);
        }

        let ts = now.timestamp();
        if matches!(self.full_until, Some(until) if ts < until) {
            return Evaluation::blocked(limit);
        }

        let window = secs(window_secs);
        let boundary = ts.saturating_sub(window);
        self.buckets.retain(|&bucket, _| bucket > boundary);

        let total: u64 = self.buckets.values().sum();
        if total < limit {
            self.full_until = None;
            let span = secs(bucket_span.max(1));
            let normalized = ts - ts.rem_euclid(span);
            *self.buckets.entry(normalized).or_insert(0) += 1;
            return Evaluation {
                reached: false,
                count: total + 1,
                changed: true,
                reset_ttl: true,
            };
        }

        let oldest = self.buckets.keys().copied().min().unwrap_or(ts);
        self.full_until = Some(oldest.saturating_add(window));
        Evaluation {
            reached: true,
            count: limit,
            changed: true,
            reset_ttl: false,
        }
    }

    /// Count events recorded after `now - window_secs`. Read only.
    pub fn count(&self, window_secs: u64, now: DateTime<Utc>) -> u64 {
        let boundary = now.timestamp().saturating_sub(secs(window_secs));
        self.buckets
            .iter()
            .filter(|(&bucket, _)| bucket > boundary)
            .map(|(_, &count)| count)
            .sum()
    }

    /// The cached capacity boundary, if the window was last found full.
    pub fn full_until(&self) -> Option<i64> {
        self.full_until
    }

    /// Number of buckets currently held.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no events are recorded.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

fn secs(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_burst_admits_up_to_limit() {
        let mut window = BucketedWindow::new();
        let now = at(1_700_000_000);

        for expected in 1..=5 {
            let eval = window.evaluate(60, 5, 1, now);
            assert!(!eval.reached);
            assert_eq!(eval.count, expected);
            assert!(eval.changed);
            assert!(eval.reset_ttl);
        }

        let eval = window.evaluate(60, 5, 1, now);
        assert!(eval.reached);
        assert_eq!(eval.count, 5);
        assert!(eval.changed);
        assert!(!eval.reset_ttl);
    }

    #[test]
    fn test_zero_limit_always_blocks() {
        let mut window = BucketedWindow::new();
        window.evaluate(60, 3, 1, at(100));

        let before = window.clone();
        let eval = window.evaluate(60, 0, 1, at(101));

        assert_eq!(eval, Evaluation::blocked(0));
        assert_eq!(window, before);
    }

    #[test]
    fn test_full_records_capacity_boundary() {
        let mut window = BucketedWindow::new();
        window.evaluate(60, 2, 1, at(10));
        window.evaluate(60, 2, 1, at(20));

        window.evaluate(60, 2, 1, at(30));
        assert_eq!(window.full_until(), Some(70));
    }

    #[test]
    fn test_fast_path_skips_pruning() {
        let mut window = BucketedWindow::new();
        window.evaluate(10, 1, 1, at(100));
        window.evaluate(10, 1, 1, at(105));
        assert_eq!(window.full_until(), Some(110));

        // A bucket that a full scan at t=109 would prune.
        window.buckets.insert(90, 7);

        let eval = window.evaluate(10, 1, 1, at(109));
        assert_eq!(eval, Evaluation::blocked(1));
        assert_eq!(window.buckets.get(&90), Some(&7));
    }

    #[test]
    fn test_admission_clears_capacity_boundary() {
        let mut window = BucketedWindow::new();
        window.evaluate(10, 1, 1, at(100));
        window.evaluate(10, 1, 1, at(101));
        assert_eq!(window.full_until(), Some(110));

        let eval = window.evaluate(10, 1, 1, at(110));
        assert!(!eval.reached);
        assert_eq!(eval.count, 1);
        assert_eq!(window.full_until(), None);
        assert_eq!(window.bucket_count(), 1);
    }

    #[test]
    fn test_buckets_align_to_epoch() {
        let mut window = BucketedWindow::new();
        window.evaluate(60, 10, 5, at(101));
        window.evaluate(60, 10, 5, at(104));
        window.evaluate(60, 10, 5, at(105));

        assert_eq!(window.bucket_count(), 2);
        assert_eq!(window.buckets.get(&100), Some(&2));
        assert_eq!(window.buckets.get(&105), Some(&1));
    }

    #[test]
    fn test_count_excludes_expired_buckets() {
        let mut window = BucketedWindow::new();
        window.evaluate(10, 5, 2, at(0));

        assert_eq!(window.count(10, at(9)), 1);
        assert_eq!(window.count(10, at(11)), 0);
        // Counting never prunes.
        assert_eq!(window.bucket_count(), 1);
    }

    #[test]
    fn test_evaluate_prunes_expired_buckets() {
        let mut window = BucketedWindow::new();
        window.evaluate(10, 5, 1, at(0));
        window.evaluate(10, 5, 1, at(5));

        let eval = window.evaluate(10, 5, 1, at(12));
        assert_eq!(eval.count, 2);
        assert_eq!(window.bucket_count(), 2);
        assert!(!window.buckets.contains_key(&0));
    }

    #[test]
    fn test_sub_window_count() {
        let mut window = BucketedWindow::new();
        for ts in [100, 110, 120, 130] {
            window.evaluate(60, 10, 1, at(ts));
        }

        assert_eq!(window.count(60, at(130)), 4);
        assert_eq!(window.count(15, at(130)), 2);
    }

    #[test]
    fn test_oversized_window_saturates() {
        let mut window = BucketedWindow::new();
        let now = at(1_700_000_000);

        assert!(!window.evaluate(u64::MAX, 1, 1, now).reached);
        let eval = window.evaluate(u64::MAX, 1, 1, now);
        assert_eq!(eval.count, 1);
        assert!(eval.reached);
        assert_eq!(window.full_until(), Some(i64::MAX));
        assert_eq!(window.count(u64::MAX, now), 1);

        // Still inside the cached boundary much later.
        assert!(window.evaluate(u64::MAX, 1, 1, at(4_000_000_000)).reached);
    }

    #[test]
    fn test_window_survives_json() {
        let mut window = BucketedWindow::new();
        window.evaluate(60, 1, 1, at(100));
        window.evaluate(60, 1, 1, at(101));

        let json = serde_json::to_string(&window).unwrap();
        let decoded: BucketedWindow = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, window);
        assert_eq!(decoded.full_until(), Some(160));
    }
}
