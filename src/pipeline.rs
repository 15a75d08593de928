//! Admission pipeline
//!
//! Per request, in order:
//! 1. resolve the client identity
//! 2. fixed-window rate limit on (IP, endpoint)
//! 3. abusive content check
//! 4. record the request for spike/pattern detection
//! 5. block gate on the client key (admin paths exempt)
//!
//! After the handler responds, [`AdmissionPipeline::on_response_complete`]
//! records failures. The decision logic is transport independent; the axum
//! middleware at the bottom of this module only shapes requests and
//! responses around it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use ipnet::IpNet;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::abuse::{AbuseDetector, AbuseLocation, AbuseRequest, AbuseVerdict};
use crate::audit_logger::{AuditEvent, AuditLogger};
use crate::blocks::{BlockRecord, BlockStore};
use crate::client_key::{extract_client_ip, AuthenticatedUser, ClientIdentity};
use crate::clock::SharedClock;
use crate::config::{AdmissionConfig, StorageConfig};
use crate::error::{AdmissionError, StoreError};
use crate::rate_limiter::{FixedWindowLimiter, RateDecision};
use crate::rules::{RateRule, RuleStore};
use crate::store::{JsonFileStore, MemoryStore, StateStore};
use crate::suspicious::{FlagReason, FlagRecord, SuspiciousActivityTracker};

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// Request extension set on admitted requests from a flagged client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuspiciousMark {
    pub reason: FlagReason,
}

/// What the pipeline sees of a request
pub struct AdmissionRequest<'a> {
    pub identity: &'a ClientIdentity,
    /// Endpoint identifier (request path)
    pub endpoint: &'a str,
    pub query: &'a str,
    pub headers: &'a HeaderMap,
    pub body: Option<&'a [u8]>,
}

/// Terminal denial
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    RateLimited { endpoint: String, limit: u32 },
    Abusive { location: AbuseLocation },
    Blocked { reason: FlagReason },
}

impl Denial {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Abusive { .. } | Self::Blocked { .. } => StatusCode::FORBIDDEN,
        }
    }

    /// Whether the response outcome is fed back as a failure.
    ///
    /// Only the block gate runs after request tracking starts.
    pub fn tracks_outcome(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

impl IntoResponse for Denial {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match self {
            Self::RateLimited { endpoint, .. } => json!({
                "error": "Too Many Requests",
                "message": "Rate limit exceeded for this endpoint. Please try again later.",
                "endpoint": endpoint,
                "remaining": 0,
            }),
            Self::Abusive { .. } => json!({
                "error": "Forbidden",
                "message": "Abusive content detected. Request blocked.",
            }),
            Self::Blocked { reason } => json!({
                "error": "Access Blocked",
                "message": "Your account/IP has been blocked due to suspicious activity. Contact admin.",
                "reason": reason,
            }),
        };
        (status, Json(body)).into_response()
    }
}

/// Admitted request details
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub rate: RateDecision,
    /// Flag reason when the client key is flagged
    pub suspicious: Option<FlagReason>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admitted(Admission),
    Denied(Denial),
}

/// Backing stores for the four persisted tables
pub struct PipelineStores {
    pub rules: Arc<dyn StateStore<RateRule>>,
    pub failures: Arc<dyn StateStore<u32>>,
    pub flags: Arc<dyn StateStore<FlagRecord>>,
    pub blocks: Arc<dyn StateStore<BlockRecord>>,
}

impl PipelineStores {
    /// JSON files inside `data_dir`
    pub fn json_files(data_dir: &Path) -> Self {
        Self {
            rules: Arc::new(JsonFileStore::in_dir(data_dir, StorageConfig::RULES_FILE)),
            failures: Arc::new(JsonFileStore::in_dir(data_dir, StorageConfig::FAILURES_FILE)),
            flags: Arc::new(JsonFileStore::in_dir(data_dir, StorageConfig::FLAGS_FILE)),
            blocks: Arc::new(JsonFileStore::in_dir(data_dir, StorageConfig::BLOCKS_FILE)),
        }
    }

    /// Non-durable stores
    pub fn in_memory() -> Self {
        Self {
            rules: Arc::new(MemoryStore::new()),
            failures: Arc::new(MemoryStore::new()),
            flags: Arc::new(MemoryStore::new()),
            blocks: Arc::new(MemoryStore::new()),
        }
    }
}

/// Admission service shared by every request
pub struct AdmissionPipeline {
    rules: Arc<RuleStore>,
    limiter: Arc<FixedWindowLimiter>,
    tracker: Arc<SuspiciousActivityTracker>,
    blocks: Arc<BlockStore>,
    abuse: ArcSwap<AbuseDetector>,
    audit: Arc<AuditLogger>,
    admin_prefix: String,
    trusted_proxies: Vec<IpNet>,
    clock: SharedClock,
}

impl AdmissionPipeline {
    pub fn new(
        config: &AdmissionConfig,
        stores: PipelineStores,
        clock: SharedClock,
        audit: Arc<AuditLogger>,
    ) -> Self {
        let rules = Arc::new(RuleStore::new(
            config.rate_limiting.default_rule(),
            stores.rules,
        ));
        let limiter = Arc::new(FixedWindowLimiter::new(rules.clone(), clock.clone()));
        let blocks = Arc::new(BlockStore::new(stores.blocks, clock.clone()));
        let tracker = Arc::new(SuspiciousActivityTracker::new(
            config.suspicious,
            stores.failures,
            stores.flags,
            blocks.clone(),
            clock.clone(),
        ));

        Self {
            rules,
            limiter,
            tracker,
            blocks,
            abuse: ArcSwap::from_pointee(AbuseDetector::new(&config.abuse)),
            audit,
            admin_prefix: config.admin.path_prefix.clone(),
            trusted_proxies: config.trusted_proxies(),
            clock,
        }
    }

    /// Pipeline backed by JSON files in the configured data directory
    pub fn from_config(
        config: &AdmissionConfig,
        clock: SharedClock,
        audit: Arc<AuditLogger>,
    ) -> Self {
        let stores = PipelineStores::json_files(&config.storage.data_dir);
        Self::new(config, stores, clock, audit)
    }

    /// Apply rules from configuration through the validated rule path
    pub fn seed_rules(&self, rules: &HashMap<String, RateRule>) -> Result<(), AdmissionError> {
        for (endpoint, rule) in rules {
            self.rules
                .set_rule(endpoint, rule.max_requests, rule.window_ms)?;
        }
        Ok(())
    }

    /// Re-seed only the rules that differ between two configurations.
    ///
    /// Endpoints whose configured rule is unchanged keep whatever an admin
    /// set at runtime. Returns the number of rules written.
    pub fn seed_changed_rules(
        &self,
        previous: &HashMap<String, RateRule>,
        current: &HashMap<String, RateRule>,
    ) -> Result<usize, AdmissionError> {
        let mut written = 0;
        for (endpoint, rule) in current {
            if previous.get(endpoint) == Some(rule) {
                continue;
            }
            self.rules
                .set_rule(endpoint, rule.max_requests, rule.window_ms)?;
            written += 1;
        }
        Ok(written)
    }

    /// Apply reloadable settings. Records, flags and blocks are kept.
    pub fn apply_config(&self, config: &AdmissionConfig) {
        self.rules.set_default_rule(config.rate_limiting.default_rule());
        self.tracker.update_thresholds(config.suspicious);
        self.abuse
            .store(Arc::new(AbuseDetector::new(&config.abuse)));
        info!(
            "Admission settings applied: default {} requests / {} ms, {} failures to flag",
            config.rate_limiting.default_max_requests,
            config.rate_limiting.default_window_ms,
            config.suspicious.max_failures
        );
    }

    /// Stage 2: fixed-window rate limit on (IP, endpoint)
    pub fn check_rate(
        &self,
        identity: &ClientIdentity,
        endpoint: &str,
    ) -> Result<RateDecision, Denial> {
        let decision = self.limiter.check(&identity.ip, endpoint);
        if decision.allowed {
            return Ok(decision);
        }

        warn!(
            "Rate limit exceeded for {} on {} ({} per {} ms)",
            identity.ip, endpoint, decision.limit, decision.window_ms
        );
        self.audit.log(AuditEvent::RateLimitHit {
            ip: identity.ip.clone(),
            endpoint: endpoint.to_string(),
            limit: decision.limit,
        });
        Err(Denial::RateLimited {
            endpoint: endpoint.to_string(),
            limit: decision.limit,
        })
    }

    /// Stages 3 to 5 for a request that passed the rate limit
    pub fn screen(&self, req: &AdmissionRequest<'_>, rate: RateDecision) -> AdmissionDecision {
        let identity = req.identity;

        let verdict = self.abuse.load().inspect(&AbuseRequest {
            path: req.endpoint,
            query: req.query,
            headers: req.headers,
            body: req.body,
        });
        if let AbuseVerdict::Abusive { location, matched } = verdict {
            warn!(
                "Abusive content from {} on {} ({}: {})",
                identity.ip,
                req.endpoint,
                location.as_str(),
                matched
            );
            self.audit.log(AuditEvent::AbuseBlocked {
                ip: identity.ip.clone(),
                path: req.endpoint.to_string(),
                location: location.as_str().to_string(),
            });
            return AdmissionDecision::Denied(Denial::Abusive { location });
        }

        if let Some(reason) = self.tracker.track_request(&identity.ip) {
            self.audit.log_flagged(&identity.ip, reason);
        }

        let user_id = identity.user_id.as_deref();
        if !req.endpoint.starts_with(&self.admin_prefix) {
            if let Some(block) = self.tracker.get_block_info(&identity.ip, user_id) {
                let key = identity.key();
                warn!(
                    "Blocked request from {} on {} ({})",
                    key, req.endpoint, block.reason
                );
                self.audit.log(AuditEvent::KeyBlocked {
                    key,
                    reason: block.reason,
                    path: req.endpoint.to_string(),
                });
                return AdmissionDecision::Denied(Denial::Blocked {
                    reason: block.reason,
                });
            }
        }

        let suspicious = self
            .tracker
            .get_flag_info(&identity.ip, user_id)
            .map(|flag| flag.reason);

        AdmissionDecision::Admitted(Admission { rate, suspicious })
    }

    /// Run every stage for a request
    pub fn admit(&self, req: &AdmissionRequest<'_>) -> AdmissionDecision {
        match self.check_rate(req.identity, req.endpoint) {
            Ok(rate) => self.screen(req, rate),
            Err(denial) => AdmissionDecision::Denied(denial),
        }
    }

    /// Feed the final response status back into failure tracking
    pub fn on_response_complete(&self, identity: &ClientIdentity, status: StatusCode) {
        if !self.tracker.is_failure_status(status.as_u16()) {
            return;
        }
        debug!("Failure status {} for {}", status.as_u16(), identity.key());
        if let Some(reason) = self
            .tracker
            .track_failure(&identity.ip, identity.user_id.as_deref())
        {
            self.audit.log_flagged(&identity.key(), reason);
        }
    }

    /// Synchronously persist the best-effort tables (shutdown, tests)
    pub fn flush(&self) -> Result<(), StoreError> {
        self.tracker.flush()
    }

    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    pub fn limiter(&self) -> &Arc<FixedWindowLimiter> {
        &self.limiter
    }

    pub fn tracker(&self) -> &Arc<SuspiciousActivityTracker> {
        &self.tracker
    }

    pub fn blocks(&self) -> &Arc<BlockStore> {
        &self.blocks
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn admin_prefix(&self) -> &str {
        &self.admin_prefix
    }

    pub fn trusted_proxies(&self) -> &[IpNet] {
        &self.trusted_proxies
    }
}

/// Admission middleware wrapping the application router
pub async fn admission_middleware(
    State(pipeline): State<Arc<AdmissionPipeline>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let ip = extract_client_ip(peer.ip(), request.headers(), pipeline.trusted_proxies());
    let user_id = request
        .extensions()
        .get::<AuthenticatedUser>()
        .map(|user| user.0.clone());
    let identity = ClientIdentity::new(&ip, user_id);
    let endpoint = request.uri().path().to_string();

    let rate = match pipeline.check_rate(&identity, &endpoint) {
        Ok(rate) => rate,
        Err(denial) => return denial.into_response(),
    };

    // Buffer the body for inspection, then hand it back to the handler
    let detector = pipeline.abuse.load_full();
    let (mut parts, body) = request.into_parts();
    let (body, scanned) = if detector.is_enabled() {
        match axum::body::to_bytes(body, detector.max_body_scan_bytes()).await {
            Ok(bytes) => (Body::from(bytes.clone()), Some(bytes)),
            Err(e) => {
                debug!("Request body from {} not buffered: {}", identity.ip, e);
                return payload_too_large_response(detector.max_body_scan_bytes());
            }
        }
    } else {
        (body, None)
    };

    let decision = pipeline.screen(
        &AdmissionRequest {
            identity: &identity,
            endpoint: &endpoint,
            query: parts.uri.query().unwrap_or_default(),
            headers: &parts.headers,
            body: scanned.as_deref(),
        },
        rate,
    );

    let admission = match decision {
        AdmissionDecision::Admitted(admission) => admission,
        AdmissionDecision::Denied(denial) => {
            let tracked = denial.tracks_outcome();
            let response = denial.into_response();
            if tracked {
                pipeline.on_response_complete(&identity, response.status());
            }
            return response;
        }
    };

    if let Some(reason) = admission.suspicious {
        parts.extensions.insert(SuspiciousMark { reason });
    }
    parts.extensions.insert(identity.clone());

    let mut response = next.run(Request::from_parts(parts, body)).await;
    pipeline.on_response_complete(&identity, response.status());

    let headers = response.headers_mut();
    headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(admission.rate.limit));
    headers.insert(
        RATE_LIMIT_REMAINING_HEADER,
        HeaderValue::from(admission.rate.remaining),
    );
    headers.insert(
        RATE_LIMIT_RESET_HEADER,
        HeaderValue::from(admission.rate.reset_epoch_secs()),
    );

    response
}

fn payload_too_large_response(limit: usize) -> Response {
    (
        StatusCode::PAYLOAD_TOO_LARGE,
        Json(json!({
            "error": "Payload Too Large",
            "message": format!("Request body exceeds {} bytes", limit),
        })),
    )
        .into_response()
}
