//! Admission Gate - HTTP request admission pipeline
//!
//! Decides per request whether it reaches application logic:
//! - Fixed-window rate limiting per (client IP, endpoint) with admin-settable rules
//! - Abusive content detection on path, query, a custom header and the body
//! - Suspicious activity tracking (repeated failures, traffic spikes, rapid-fire
//!   patterns) escalating to persistent blocks
//! - Admin API for rules and unblocking, plus a shared-secret emergency unblock

pub mod abuse;
pub mod admin;
pub mod audit_logger;
pub mod blocks;
pub mod client_key;
pub mod clock;
pub mod config;
pub mod error;
pub mod http_listener;
pub mod pipeline;
pub mod rate_limiter;
pub mod rules;
pub mod store;
pub mod suspicious;

// Re-export commonly used types
pub use abuse::AbuseDetector;
pub use audit_logger::{AuditEvent, AuditLogger};
pub use blocks::{BlockRecord, BlockStore};
pub use client_key::{normalize_ip, AuthenticatedUser, ClientIdentity};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{AdmissionConfig, ConfigManager, ConfigReloadEvent};
pub use error::{AdmissionError, StoreError};
pub use http_listener::{
    application_routes, build_router, build_router_with_auth, run_http_listener,
};
pub use pipeline::{
    admission_middleware, AdmissionDecision, AdmissionPipeline, Denial, PipelineStores,
    SuspiciousMark,
};
pub use rate_limiter::{FixedWindowLimiter, RateDecision};
pub use rules::{RateRule, RuleStore};
pub use store::{JsonFileStore, MemoryStore, PersistentTable, StateStore};
pub use suspicious::{FlagReason, FlagRecord, SuspiciousActivityTracker, SuspiciousConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
