//! Configuration knobs.
//!
//! Retention is a policy decision, not a protocol constant: `keep_last_n`
//! and the optional age bound are supplied by the embedding application.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine-level tuning forwarded when creating or joining a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// How many past epochs the engine keeps decryption state for.
    pub max_past_epochs: u32,
    /// Tolerance for out-of-order message delivery within an epoch.
    pub out_of_order_tolerance: u32,
    /// Maximum forward jump in the message ratchet.
    pub maximum_forward_distance: u32,
}

impl Default for GroupConfig {
    fn default() -> Self {
        // Retain enough past epochs to ride out network delays and
        // reordering without losing decryptability.
        Self { max_past_epochs: 5, out_of_order_tolerance: 10, maximum_forward_distance: 2000 }
    }
}

/// Retention window for epoch secrets.
///
/// Count-based with an optional age bound. Secrets inside the window are
/// never pruned; the current epoch and everything newer than
/// `current - keep_last_n` are always protected regardless of age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Number of past epochs whose secrets are always retained.
    pub keep_last_n: u64,
    /// If set, secrets older than this (and outside the count window) are
    /// eligible for pruning.
    pub max_age_secs: Option<u64>,
}

impl RetentionPolicy {
    /// Retain the last `n` epochs with no age bound.
    pub fn keep_last(n: u64) -> Self {
        Self { keep_last_n: n, max_age_secs: None }
    }
}

/// Retry behavior for state-mutating network calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts (first try included).
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt.
    pub base_backoff: Duration,
    /// Upper bound on the backoff delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based), doubling and capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_backoff.saturating_mul(1u32 << shift);
        delay.min(self.max_backoff)
    }
}

/// Top-level configuration for a principal context.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Engine tuning for new and joined groups.
    pub group: GroupConfig,
    /// Epoch secret retention window.
    pub retention: RetentionPolicy,
    /// Network retry behavior.
    pub retry: RetryPolicy,
    /// How many messages from future epochs to hold per conversation.
    pub future_queue_limit: usize,
    /// How many principal contexts the manager keeps open at once.
    pub context_cache_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            group: GroupConfig::default(),
            retention: RetentionPolicy::keep_last(5),
            retry: RetryPolicy::default(),
            future_queue_limit: 256,
            context_cache_capacity: 4,
        }
    }
}
