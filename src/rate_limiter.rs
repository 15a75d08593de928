//! Fixed-window rate limiting
//!
//! One counter per (client, endpoint) pair. A window opens on the first
//! request, lasts `window_ms`, and is replaced wholesale by the first request
//! at or after its reset instant. Up to `2 × max_requests` requests can pass
//! around a window boundary; that is the accepted cost of O(1) state per key.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::SharedClock;
use crate::rules::{RateRule, RuleStore};

/// Counter state for one (client, endpoint) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRecord {
    /// Requests admitted in the current window
    pub count: u32,
    /// Absolute instant (Unix ms) at which the window ends
    pub reset_time_ms: u64,
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Rule maximum for the endpoint
    pub limit: u32,
    /// Requests left in the current window
    pub remaining: u32,
    /// Rule window length
    pub window_ms: u64,
    /// End of the current window (Unix ms)
    pub reset_at_ms: u64,
}

impl RateDecision {
    /// Reset instant in Unix seconds, rounded up
    pub fn reset_epoch_secs(&self) -> u64 {
        self.reset_at_ms.div_ceil(1000)
    }
}

#[derive(Debug, Default)]
struct LimiterStats {
    allowed: AtomicU64,
    limited: AtomicU64,
    swept: AtomicU64,
}

/// Snapshot of limiter statistics
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub total_allowed: u64,
    pub total_limited: u64,
    pub total_swept: u64,
    pub keys_tracked: usize,
}

/// Fixed-window limiter keyed by (client key, endpoint)
pub struct FixedWindowLimiter {
    records: DashMap<(String, String), RateRecord>,
    rules: Arc<RuleStore>,
    clock: SharedClock,
    stats: LimiterStats,
}

impl FixedWindowLimiter {
    pub fn new(rules: Arc<RuleStore>, clock: SharedClock) -> Self {
        Self {
            records: DashMap::new(),
            rules,
            clock,
            stats: LimiterStats::default(),
        }
    }

    /// Count the request against the endpoint's window and decide.
    ///
    /// The read-decide-write sequence runs under the key's entry lock, so
    /// concurrent callers on the same key never lose an increment.
    pub fn check(&self, client_key: &str, endpoint: &str) -> RateDecision {
        let rule = self.rules.get_rule(endpoint);
        let key = (client_key.to_string(), endpoint.to_string());

        let decision = match self.records.entry(key) {
            Entry::Vacant(vacant) => {
                let record = fresh_record(&rule, self.clock.now_ms());
                vacant.insert(record);
                allowed(&rule, &record)
            }
            Entry::Occupied(mut occupied) => {
                let now = self.clock.now_ms();
                let record = occupied.get_mut();
                if now >= record.reset_time_ms {
                    *record = fresh_record(&rule, now);
                    allowed(&rule, record)
                } else if record.count < rule.max_requests {
                    record.count += 1;
                    allowed(&rule, record)
                } else {
                    RateDecision {
                        allowed: false,
                        limit: rule.max_requests,
                        remaining: 0,
                        window_ms: rule.window_ms,
                        reset_at_ms: record.reset_time_ms,
                    }
                }
            }
        };

        if decision.allowed {
            self.stats.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.limited.fetch_add(1, Ordering::Relaxed);
        }
        decision
    }

    /// Whether a request is admitted (counts the request)
    pub fn is_allowed(&self, client_key: &str, endpoint: &str) -> bool {
        self.check(client_key, endpoint).allowed
    }

    /// Quota left in the live window without counting a request
    pub fn get_remaining(&self, client_key: &str, endpoint: &str) -> u32 {
        let rule = self.rules.get_rule(endpoint);
        let key = (client_key.to_string(), endpoint.to_string());
        let now = self.clock.now_ms();

        match self.records.get(&key) {
            Some(record) if now < record.reset_time_ms => {
                rule.max_requests.saturating_sub(record.count)
            }
            _ => rule.max_requests,
        }
    }

    /// Live record for the pair, if any
    pub fn record(&self, client_key: &str, endpoint: &str) -> Option<RateRecord> {
        self.records
            .get(&(client_key.to_string(), endpoint.to_string()))
            .map(|r| *r.value())
    }

    /// Drop records whose window has ended; returns how many were removed
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.records.len();
        self.records.retain(|_, record| now < record.reset_time_ms);
        let removed = before.saturating_sub(self.records.len());
        self.stats.swept.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Spawn the periodic sweep
    pub fn spawn_cleanup_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = limiter.cleanup();
                if removed > 0 {
                    debug!("Swept {} expired rate limit records", removed);
                }
            }
        })
    }

    pub fn get_stats(&self) -> RateLimiterSnapshot {
        RateLimiterSnapshot {
            total_allowed: self.stats.allowed.load(Ordering::Relaxed),
            total_limited: self.stats.limited.load(Ordering::Relaxed),
            total_swept: self.stats.swept.load(Ordering::Relaxed),
            keys_tracked: self.records.len(),
        }
    }

    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }
}

fn fresh_record(rule: &RateRule, now: u64) -> RateRecord {
    RateRecord {
        count: 1,
        reset_time_ms: now.saturating_add(rule.window_ms),
    }
}

fn allowed(rule: &RateRule, record: &RateRecord) -> RateDecision {
    RateDecision {
        allowed: true,
        limit: rule.max_requests,
        remaining: rule.max_requests.saturating_sub(record.count),
        window_ms: rule.window_ms,
        reset_at_ms: record.reset_time_ms,
    }
}
