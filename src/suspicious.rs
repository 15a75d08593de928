//! Suspicious activity tracking
//!
//! Three signals feed one terminal transition:
//! - repeated failures per client key (user id, else normalized IP)
//! - traffic spikes per normalized IP
//! - rapid-fire request patterns per normalized IP
//!
//! The first threshold breach flags the key and immediately blocks it. Flags
//! are permanent for the lifetime of the persisted state; only the block can
//! be lifted by an operator.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::blocks::{BlockRecord, BlockStore};
use crate::client_key::{normalize_ip, resolve_client_key};
use crate::clock::SharedClock;
use crate::error::{AdmissionError, StoreError};
use crate::store::{PersistentTable, StateStore};

/// Detection thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuspiciousConfig {
    /// Failures before a key is flagged
    pub max_failures: u32,
    /// Requests inside the spike window that count as a spike
    pub spike_threshold: usize,
    /// Spike window length (milliseconds)
    pub spike_window_ms: u64,
    /// Minimum expected gap between requests; three requests closer than
    /// `3 × pattern_interval_ms` count as abnormal
    pub pattern_interval_ms: u64,
    /// Response statuses at or above this are failures
    pub failure_status_threshold: u16,
}

impl Default for SuspiciousConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            spike_threshold: 20,
            spike_window_ms: 10_000,
            pattern_interval_ms: 100,
            failure_status_threshold: 400,
        }
    }
}

impl SuspiciousConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_failures == 0 {
            return Err(anyhow::anyhow!("suspicious.max_failures must be greater than 0"));
        }
        if self.spike_threshold == 0 {
            return Err(anyhow::anyhow!(
                "suspicious.spike_threshold must be greater than 0"
            ));
        }
        if self.spike_window_ms == 0 {
            return Err(anyhow::anyhow!(
                "suspicious.spike_window_ms must be greater than 0"
            ));
        }
        if !(100..=599).contains(&self.failure_status_threshold) {
            return Err(anyhow::anyhow!(
                "suspicious.failure_status_threshold must be an HTTP status (got {})",
                self.failure_status_threshold
            ));
        }
        Ok(())
    }

    /// Span under which the last three requests are considered rapid fire
    pub fn pattern_span_ms(&self) -> u64 {
        self.pattern_interval_ms.saturating_mul(3)
    }
}

/// Why a key was flagged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagReason {
    RepeatedFailures,
    TrafficSpike,
    AbnormalPattern,
}

impl FlagReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RepeatedFailures => "repeated_failures",
            Self::TrafficSpike => "traffic_spike",
            Self::AbnormalPattern => "abnormal_pattern",
        }
    }
}

impl fmt::Display for FlagReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted flag entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagRecord {
    pub reason: FlagReason,
    pub timestamp: DateTime<Utc>,
}

/// Tracker counters
#[derive(Debug, Clone, Serialize)]
pub struct TrackerSnapshot {
    pub failure_keys: usize,
    pub flagged_keys: usize,
    pub blocked_keys: usize,
    pub tracked_windows: usize,
}

/// Failure counters, request windows, flags and escalation to blocks
pub struct SuspiciousActivityTracker {
    failures: PersistentTable<u32>,
    flags: PersistentTable<FlagRecord>,
    /// Per-IP request timestamps (Unix ms), oldest first; never persisted
    windows: DashMap<String, VecDeque<u64>>,
    blocks: Arc<BlockStore>,
    thresholds: RwLock<SuspiciousConfig>,
    clock: SharedClock,
}

impl SuspiciousActivityTracker {
    pub fn new(
        thresholds: SuspiciousConfig,
        failures: Arc<dyn StateStore<u32>>,
        flags: Arc<dyn StateStore<FlagRecord>>,
        blocks: Arc<BlockStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            failures: PersistentTable::load("failure counters", failures),
            flags: PersistentTable::load("flags", flags),
            windows: DashMap::new(),
            blocks,
            thresholds: RwLock::new(thresholds),
            clock,
        }
    }

    /// Record a failed request.
    ///
    /// Returns the reason if this call flagged the key.
    pub fn track_failure(&self, ip: &str, user_id: Option<&str>) -> Option<FlagReason> {
        let key = resolve_client_key(ip, user_id);
        let max_failures = self.thresholds.read().max_failures;

        let count = {
            let mut counter = self.failures.entries().entry(key.clone()).or_insert(0);
            *counter = counter.saturating_add(1);
            *counter
        };
        self.failures.persist_best_effort();
        debug!("Failure {} recorded for {}", count, key);

        if count >= max_failures && self.flag(&key, FlagReason::RepeatedFailures) {
            return Some(FlagReason::RepeatedFailures);
        }
        None
    }

    /// Record a request for spike and pattern detection.
    ///
    /// Both checks run on every call. Returns the reason if this call flagged
    /// the IP.
    pub fn track_request(&self, ip: &str) -> Option<FlagReason> {
        let key = normalize_ip(ip);
        let thresholds = *self.thresholds.read();

        let (spike, rapid) = {
            let mut window = self.windows.entry(key.clone()).or_default();
            let now = self.clock.now_ms();
            window.retain(|&t| now.saturating_sub(t) < thresholds.spike_window_ms);
            window.push_back(now);

            let len = window.len();
            let spike = len >= thresholds.spike_threshold;
            let rapid = len > 3
                && window[len - 1].saturating_sub(window[len - 3]) < thresholds.pattern_span_ms();
            (spike, rapid)
        };

        let mut flagged = None;
        if spike && self.flag(&key, FlagReason::TrafficSpike) {
            flagged = Some(FlagReason::TrafficSpike);
        }
        if rapid && self.flag(&key, FlagReason::AbnormalPattern) {
            flagged = Some(FlagReason::AbnormalPattern);
        }
        flagged
    }

    /// Flag a key and escalate to a block.
    ///
    /// Only the first flag for a key takes effect; returns whether this call
    /// created it.
    pub fn flag(&self, key: &str, reason: FlagReason) -> bool {
        match self.flags.entries().entry(key.to_string()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(vacant) => {
                vacant.insert(FlagRecord {
                    reason,
                    timestamp: self.clock.now_utc(),
                });
            }
        }

        warn!("Flagged {} as suspicious: {}", key, reason);
        self.flags.persist_best_effort();
        self.blocks.block(key, reason);
        true
    }

    /// Lift a block; flags and failure counters stay
    pub fn unblock(&self, key: &str) -> Result<bool, AdmissionError> {
        self.blocks.unblock(key)
    }

    pub fn is_flagged(&self, ip: &str, user_id: Option<&str>) -> bool {
        self.flags.contains(&resolve_client_key(ip, user_id))
    }

    pub fn is_blocked(&self, ip: &str, user_id: Option<&str>) -> bool {
        self.blocks.is_blocked(&resolve_client_key(ip, user_id))
    }

    pub fn get_flag_info(&self, ip: &str, user_id: Option<&str>) -> Option<FlagRecord> {
        self.flags.get(&resolve_client_key(ip, user_id))
    }

    pub fn get_block_info(&self, ip: &str, user_id: Option<&str>) -> Option<BlockRecord> {
        self.blocks.get_block_info(&resolve_client_key(ip, user_id))
    }

    /// Current failure count for a resolved key
    pub fn failure_count(&self, key: &str) -> u32 {
        self.failures.get(key).unwrap_or(0)
    }

    /// All flags
    pub fn flags(&self) -> HashMap<String, FlagRecord> {
        self.flags.snapshot()
    }

    /// Whether a response status counts as a failure
    pub fn is_failure_status(&self, status: u16) -> bool {
        status >= self.thresholds.read().failure_status_threshold
    }

    pub fn thresholds(&self) -> SuspiciousConfig {
        *self.thresholds.read()
    }

    /// Apply new thresholds; existing counters, flags and blocks are kept
    pub fn update_thresholds(&self, thresholds: SuspiciousConfig) {
        *self.thresholds.write() = thresholds;
    }

    /// Drop request windows with no request inside the spike window
    pub fn prune_idle_windows(&self) -> usize {
        let now = self.clock.now_ms();
        let span = self.thresholds.read().spike_window_ms;
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            window
                .back()
                .is_some_and(|&last| now.saturating_sub(last) < span)
        });
        before.saturating_sub(self.windows.len())
    }

    pub fn blocks(&self) -> &Arc<BlockStore> {
        &self.blocks
    }

    /// Write failures, flags and blocks now, bypassing background writes
    pub fn flush(&self) -> Result<(), StoreError> {
        self.failures.persist()?;
        self.flags.persist()?;
        self.blocks.flush()
    }

    pub fn get_stats(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            failure_keys: self.failures.len(),
            flagged_keys: self.flags.len(),
            blocked_keys: self.blocks.len(),
            tracked_windows: self.windows.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{JsonFileStore, MemoryStore};

    struct Fixture {
        tracker: SuspiciousActivityTracker,
        clock: Arc<ManualClock>,
        block_store: Arc<MemoryStore<BlockRecord>>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let block_store = Arc::new(MemoryStore::new());
        let blocks = Arc::new(BlockStore::new(block_store.clone(), clock.clone()));
        let tracker = SuspiciousActivityTracker::new(
            SuspiciousConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
            blocks,
            clock.clone(),
        );
        Fixture {
            tracker,
            clock,
            block_store,
        }
    }

    #[test]
    fn test_first_flag_reason_wins() {
        let f = fixture();

        assert!(f.tracker.flag("10.0.0.1", FlagReason::TrafficSpike));
        f.clock.advance_ms(5_000);
        assert!(!f.tracker.flag("10.0.0.1", FlagReason::RepeatedFailures));

        let info = f.tracker.get_flag_info("10.0.0.1", None).unwrap();
        assert_eq!(info.reason, FlagReason::TrafficSpike);

        let blocks = f.block_store.snapshot();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks["10.0.0.1"].reason, FlagReason::TrafficSpike);
    }

    #[test]
    fn test_fifth_failure_flags_and_blocks() {
        let f = fixture();

        for _ in 0..4 {
            assert_eq!(f.tracker.track_failure("10.0.0.1", Some("u1")), None);
        }
        assert!(!f.tracker.is_flagged("10.0.0.1", Some("u1")));
        assert!(!f.tracker.is_blocked("10.0.0.1", Some("u1")));

        assert_eq!(
            f.tracker.track_failure("10.0.0.1", Some("u1")),
            Some(FlagReason::RepeatedFailures)
        );
        assert!(f.tracker.is_flagged("10.0.0.1", Some("u1")));
        assert!(f.tracker.is_blocked("10.0.0.2", Some("u1")));
        // Keyed by user id, not by IP
        assert!(!f.tracker.is_blocked("10.0.0.1", None));
        assert_eq!(f.tracker.failure_count("u1"), 5);
    }

    #[test]
    fn test_failures_keyed_by_normalized_ip() {
        let f = fixture();
        f.tracker.track_failure("::1", None);
        f.tracker.track_failure("::ffff:127.0.0.1", None);
        f.tracker.track_failure("127.0.0.1", None);
        assert_eq!(f.tracker.failure_count("127.0.0.1"), 3);
    }

    #[test]
    fn test_traffic_spike_on_twentieth_request() {
        let f = fixture();

        for i in 1..20 {
            assert_eq!(f.tracker.track_request("10.0.0.5"), None, "request {}", i);
            f.clock.advance_ms(400);
        }
        assert_eq!(
            f.tracker.track_request("10.0.0.5"),
            Some(FlagReason::TrafficSpike)
        );
        assert!(f.tracker.is_blocked("10.0.0.5", None));
        assert_eq!(
            f.tracker.get_block_info("10.0.0.5", None).unwrap().reason,
            FlagReason::TrafficSpike
        );
    }

    #[test]
    fn test_spike_window_prunes_old_requests() {
        let f = fixture();

        // 600ms spacing keeps at most 17 requests inside a 10s window
        for _ in 0..40 {
            assert_eq!(f.tracker.track_request("10.0.0.6"), None);
            f.clock.advance_ms(600);
        }
        assert!(!f.tracker.is_flagged("10.0.0.6", None));
    }

    #[test]
    fn test_rapid_fire_pattern() {
        let f = fixture();

        for _ in 0..3 {
            assert_eq!(f.tracker.track_request("10.0.0.7"), None);
            f.clock.advance_ms(50);
        }
        assert_eq!(
            f.tracker.track_request("10.0.0.7"),
            Some(FlagReason::AbnormalPattern)
        );
        assert_eq!(
            f.tracker.get_flag_info("10.0.0.7", None).unwrap().reason,
            FlagReason::AbnormalPattern
        );
    }

    fn pattern_outcomes(f: &Fixture, ip: &str, spacing_ms: u64, count: usize) -> Vec<Option<FlagReason>> {
        (0..count)
            .map(|_| {
                let outcome = f.tracker.track_request(ip);
                f.clock.advance_ms(spacing_ms);
                outcome
            })
            .collect()
    }

    #[test]
    fn test_pattern_span_comparison_is_strict() {
        // 150 ms apart: the last three requests span exactly 300 ms
        let f = fixture();
        assert_eq!(pattern_outcomes(&f, "10.0.0.20", 150, 10), vec![None; 10]);
        assert!(!f.tracker.is_flagged("10.0.0.20", None));

        // 149 ms apart: 298 ms span, flagged on the fourth request
        let f = fixture();
        assert_eq!(
            pattern_outcomes(&f, "10.0.0.21", 149, 4),
            vec![None, None, None, Some(FlagReason::AbnormalPattern)]
        );
    }

    #[test]
    fn test_pattern_on_fourth_request_just_under_limit() {
        let f = fixture();
        let ip = "10.0.0.22";

        assert_eq!(f.tracker.track_request(ip), None);
        f.clock.advance_ms(1_000);
        assert_eq!(f.tracker.track_request(ip), None);
        f.clock.advance_ms(100);
        assert_eq!(f.tracker.track_request(ip), None);
        // Third-most-recent to latest: 299 ms
        f.clock.advance_ms(199);
        assert_eq!(
            f.tracker.track_request(ip),
            Some(FlagReason::AbnormalPattern)
        );

        let f = fixture();
        assert_eq!(f.tracker.track_request(ip), None);
        f.clock.advance_ms(1_000);
        assert_eq!(f.tracker.track_request(ip), None);
        f.clock.advance_ms(100);
        assert_eq!(f.tracker.track_request(ip), None);
        f.clock.advance_ms(200);
        assert_eq!(f.tracker.track_request(ip), None);
    }

    #[test]
    fn test_pattern_needs_more_than_three_requests() {
        let f = fixture();
        for _ in 0..3 {
            assert_eq!(f.tracker.track_request("10.0.0.8"), None);
        }
        assert!(!f.tracker.is_flagged("10.0.0.8", None));
    }

    #[test]
    fn test_unblock_keeps_flag_and_counter() {
        let f = fixture();
        for _ in 0..5 {
            f.tracker.track_failure("10.0.0.1", None);
        }
        assert!(f.tracker.unblock("10.0.0.1").unwrap());
        assert!(!f.tracker.is_blocked("10.0.0.1", None));
        assert!(!f.tracker.unblock("10.0.0.1").unwrap());

        assert!(f.tracker.is_flagged("10.0.0.1", None));
        assert_eq!(f.tracker.failure_count("10.0.0.1"), 5);

        // The flag is already set, so further failures do not re-block
        f.tracker.track_failure("10.0.0.1", None);
        assert!(!f.tracker.is_blocked("10.0.0.1", None));
    }

    #[test]
    fn test_concurrent_flag_creates_single_block() {
        let f = fixture();
        let created = std::sync::atomic::AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for reason in [
                FlagReason::TrafficSpike,
                FlagReason::AbnormalPattern,
                FlagReason::RepeatedFailures,
                FlagReason::TrafficSpike,
            ] {
                let tracker = &f.tracker;
                let created = &created;
                scope.spawn(move || {
                    if tracker.flag("10.0.0.3", reason) {
                        created.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(created.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(f.block_store.snapshot().len(), 1);
    }

    #[test]
    fn test_concurrent_failures_never_undercount() {
        let f = fixture();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        f.tracker.track_failure("10.0.0.4", None);
                    }
                });
            }
        });
        assert_eq!(f.tracker.failure_count("10.0.0.4"), 200);
        assert_eq!(f.block_store.snapshot().len(), 1);
    }

    #[test]
    fn test_prune_idle_windows() {
        let f = fixture();
        f.tracker.track_request("10.0.0.1");
        f.clock.advance_ms(10_000);
        f.tracker.track_request("10.0.0.2");

        assert_eq!(f.tracker.prune_idle_windows(), 1);
        assert_eq!(f.tracker.get_stats().tracked_windows, 1);
    }

    #[test]
    fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));

        let build = || {
            let blocks = Arc::new(BlockStore::new(
                Arc::new(JsonFileStore::in_dir(dir.path(), "blocked.json")),
                clock.clone(),
            ));
            SuspiciousActivityTracker::new(
                SuspiciousConfig::default(),
                Arc::new(JsonFileStore::in_dir(dir.path(), "failures.json")),
                Arc::new(JsonFileStore::in_dir(dir.path(), "suspicious.json")),
                blocks,
                clock.clone(),
            )
        };

        let tracker = build();
        for _ in 0..5 {
            tracker.track_failure("10.0.0.1", Some("u1"));
        }
        tracker.track_failure("10.0.0.9", None);
        drop(tracker);

        let restarted = build();
        assert!(restarted.is_flagged("1.1.1.1", Some("u1")));
        assert!(restarted.is_blocked("1.1.1.1", Some("u1")));
        assert_eq!(restarted.failure_count("u1"), 5);
        assert_eq!(restarted.failure_count("10.0.0.9"), 1);

        let flags = std::fs::read_to_string(dir.path().join("suspicious.json")).unwrap();
        assert!(flags.contains("\"repeated_failures\""));
    }

    #[test]
    fn test_threshold_update_applies() {
        let f = fixture();
        f.tracker.update_thresholds(SuspiciousConfig {
            max_failures: 2,
            ..SuspiciousConfig::default()
        });
        f.tracker.track_failure("10.0.0.1", None);
        assert_eq!(
            f.tracker.track_failure("10.0.0.1", None),
            Some(FlagReason::RepeatedFailures)
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(SuspiciousConfig::default().validate().is_ok());
        let bad = SuspiciousConfig {
            failure_status_threshold: 42,
            ..SuspiciousConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = SuspiciousConfig {
            max_failures: 0,
            ..SuspiciousConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
