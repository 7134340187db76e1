// src/mirrors.rs

//! Per-mirror failure scores
//!
//! Each mirror URL accumulates an integer failure score while downloads run.
//! A score at or above [`BAN_THRESHOLD`] excludes the mirror from selection;
//! the coordinator then applies a penalty/decay cycle that walks the score
//! back below the threshold so the mirror eventually becomes selectable
//! again. Scores never go below zero.
//!
//! The map is shared mutable state across a whole transaction. It is an
//! explicit value passed by reference, mutex-guarded so score updates stay
//! atomic if concurrent transactions are ever allowed.

use std::collections::HashMap;
use std::sync::Mutex;

/// Failure score at which a mirror is excluded from selection.
pub const BAN_THRESHOLD: i32 = 30;

/// Penalty applied when a banned mirror is first encountered; together with
/// [`DECAY`] this keeps the mirror out of rotation for several passes.
pub const BAN_PENALTY: i32 = 45;

/// Per-encounter decay applied to a banned mirror above the threshold.
pub const DECAY: i32 = -4;

#[derive(Debug, Default)]
struct StatusInner {
    scores: HashMap<String, i32>,
    working: Option<String>,
}

/// Shared mirror failure-score map
#[derive(Debug, Default)]
pub struct MirrorStatus {
    inner: Mutex<StatusInner>,
}

impl MirrorStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current failure score for a mirror, 0 when never seen
    pub fn failing_score(&self, url: &str) -> i32 {
        let inner = self.inner.lock().unwrap();
        inner.scores.get(url).copied().unwrap_or(0)
    }

    /// Set the failure score, clamped at 0
    pub fn set_failing_score(&self, url: &str, score: i32) {
        let mut inner = self.inner.lock().unwrap();
        inner.scores.insert(url.to_string(), score.max(0));
    }

    /// Add to the failure score, clamped at 0
    pub fn add_failing(&self, url: &str, delta: i32) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.scores.entry(url.to_string()).or_insert(0);
        *entry = (*entry + delta).max(0);
    }

    /// Whether the mirror is currently excluded from selection
    pub fn is_banned(&self, url: &str) -> bool {
        self.failing_score(url) >= BAN_THRESHOLD
    }

    /// Record the mirror a transfer is currently using, `None` when idle
    pub fn set_working_mirror(&self, url: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        inner.working = url.map(str::to_string);
    }

    pub fn working_mirror(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.working.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_defaults_to_zero() {
        let status = MirrorStatus::new();
        assert_eq!(status.failing_score("http://mirror-a"), 0);
        assert!(!status.is_banned("http://mirror-a"));
    }

    #[test]
    fn test_score_is_bounded_at_zero() {
        let status = MirrorStatus::new();
        status.add_failing("http://mirror-a", -10);
        assert_eq!(status.failing_score("http://mirror-a"), 0);
        status.set_failing_score("http://mirror-a", -5);
        assert_eq!(status.failing_score("http://mirror-a"), 0);
    }

    #[test]
    fn test_ban_threshold() {
        let status = MirrorStatus::new();
        for _ in 0..30 {
            status.add_failing("http://mirror-a", 1);
        }
        assert!(status.is_banned("http://mirror-a"));
        assert!(!status.is_banned("http://mirror-b"));
    }

    #[test]
    fn test_working_mirror_tracking() {
        let status = MirrorStatus::new();
        assert_eq!(status.working_mirror(), None);
        status.set_working_mirror(Some("http://mirror-a"));
        assert_eq!(status.working_mirror().as_deref(), Some("http://mirror-a"));
        status.set_working_mirror(None);
        assert_eq!(status.working_mirror(), None);
    }
}
