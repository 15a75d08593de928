//! Per-endpoint rate rules
//!
//! Rules are admin-settable at runtime. Every update validates first, then
//! rewrites the whole persisted rule table before returning.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::AdmissionError;
use crate::store::{PersistentTable, StateStore};

/// Quota for one endpoint: `max_requests` per fixed window of `window_ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateRule {
    #[serde(rename = "maxRequests", alias = "max_requests")]
    pub max_requests: u32,
    #[serde(rename = "windowMs", alias = "window_ms")]
    pub window_ms: u64,
}

impl RateRule {
    /// Validated constructor
    pub fn new(max_requests: u32, window_ms: u64) -> Result<Self, AdmissionError> {
        if max_requests == 0 {
            return Err(AdmissionError::validation(
                "maxRequests",
                "must be greater than 0",
            ));
        }
        if window_ms == 0 {
            return Err(AdmissionError::validation("windowMs", "must be greater than 0"));
        }
        Ok(Self {
            max_requests,
            window_ms,
        })
    }
}

/// Endpoint -> rule table with a process-wide default
pub struct RuleStore {
    rules: PersistentTable<RateRule>,
    default_rule: RwLock<RateRule>,
}

impl RuleStore {
    /// Load persisted rules; unreadable tables start empty
    pub fn new(default_rule: RateRule, store: Arc<dyn StateStore<RateRule>>) -> Self {
        Self {
            rules: PersistentTable::load("rate rules", store),
            default_rule: RwLock::new(default_rule),
        }
    }

    /// Upsert a rule and persist the full table.
    ///
    /// Invalid parameters are rejected before any mutation. A persistence
    /// failure is returned to the caller; the in-memory rule stays applied.
    pub fn set_rule(
        &self,
        endpoint: &str,
        max_requests: u32,
        window_ms: u64,
    ) -> Result<RateRule, AdmissionError> {
        if endpoint.is_empty() {
            return Err(AdmissionError::validation("endpoint", "must not be empty"));
        }
        let rule = RateRule::new(max_requests, window_ms)?;

        self.rules.entries().insert(endpoint.to_string(), rule);
        self.rules.persist()?;

        info!(
            "Rate rule for {} set to {} requests / {} ms",
            endpoint, rule.max_requests, rule.window_ms
        );
        Ok(rule)
    }

    /// Stored rule for the endpoint, or the default
    pub fn get_rule(&self, endpoint: &str) -> RateRule {
        self.rules
            .get(endpoint)
            .unwrap_or_else(|| *self.default_rule.read())
    }

    pub fn default_rule(&self) -> RateRule {
        *self.default_rule.read()
    }

    /// Replace the fallback rule (config reload)
    pub fn set_default_rule(&self, rule: RateRule) {
        *self.default_rule.write() = rule;
    }

    /// All explicitly configured rules
    pub fn rules(&self) -> HashMap<String, RateRule> {
        self.rules.snapshot()
    }
}
