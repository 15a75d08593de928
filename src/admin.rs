//! Admin HTTP API for rate rules, blocks and flags
//!
//! Endpoints (mounted under the admin prefix, exempt from the block gate):
//! - POST /rate-limits - Create or update an endpoint rule
//! - GET /rate-limits - Default rule and all endpoint rules
//! - DELETE /blocked/{key} - Lift a block
//! - GET /blocked - All blocks
//! - GET /flagged - All flags
//! - GET /stats - Limiter and tracker counters
//!
//! `POST /emergency-unblock` lives outside the admission layer and is
//! authenticated by a shared secret instead of the admin token.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get};
use axum::Router;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::audit_logger::{AuditEvent, AuditLogger};
use crate::client_key::{extract_client_ip, normalize_ip, ClientIdentity};
use crate::config::AdminConfig;
use crate::error::AdmissionError;
use crate::pipeline::AdmissionPipeline;

/// Admin API state
pub struct AdminState {
    /// Admission services
    pub pipeline: Arc<AdmissionPipeline>,
    /// Shared secret for emergency unblock (None = disabled)
    pub unblock_secret: Option<String>,
    /// Server start time
    pub start_time: Instant,
}

impl AdminState {
    pub fn new(pipeline: Arc<AdmissionPipeline>, config: &AdminConfig) -> Self {
        Self {
            pipeline,
            unblock_secret: config.unblock_secret.clone(),
            start_time: Instant::now(),
        }
    }
}

/// Shared state for the admin authentication middleware.
///
/// Tracks per-IP failed attempts in a 1-minute window, plus a global failure
/// counter so distributed guessing from many IPs also triggers a cooldown.
pub struct AdminAuthState {
    allowed_ips: Vec<String>,
    auth_token: Option<String>,
    /// Client IP -> (failure_count, window_start)
    failed_attempts: Arc<DashMap<String, (u32, Instant)>>,
    global_failure_count: AtomicU32,
    global_cooldown_until: RwLock<Option<Instant>>,
    audit: Arc<AuditLogger>,
}

/// Maximum failed authentication attempts per IP per minute before lockout.
const ADMIN_AUTH_MAX_FAILURES: u32 = 10;
/// Length of the failed-attempt window.
const ADMIN_AUTH_WINDOW: Duration = Duration::from_secs(60);
/// Total failures across all IPs before a global cooldown is triggered.
const ADMIN_GLOBAL_MAX_FAILURES: u32 = 50;
/// Duration of the global cooldown.
const ADMIN_GLOBAL_COOLDOWN: Duration = Duration::from_secs(30);

impl AdminAuthState {
    pub fn new(config: &AdminConfig, audit: Arc<AuditLogger>) -> Self {
        Self {
            allowed_ips: config.allowed_ips.iter().map(|ip| normalize_ip(ip)).collect(),
            auth_token: config.auth_token.clone(),
            failed_attempts: Arc::new(DashMap::new()),
            global_failure_count: AtomicU32::new(0),
            global_cooldown_until: RwLock::new(None),
            audit,
        }
    }

    /// Evict failed-attempt entries idle for two full windows
    pub fn spawn_eviction_task(&self) -> JoinHandle<()> {
        let map = Arc::clone(&self.failed_attempts);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ADMIN_AUTH_WINDOW);
            loop {
                interval.tick().await;
                let cutoff = Instant::now()
                    .checked_sub(ADMIN_AUTH_WINDOW * 2)
                    .unwrap_or_else(Instant::now);
                map.retain(|_, (_, window_start)| *window_start > cutoff);
            }
        })
    }

    fn record_failure(&self, client_ip: &str, reason: &str) {
        let now = Instant::now();
        let attempt = {
            let mut entry = self
                .failed_attempts
                .entry(client_ip.to_string())
                .or_insert((0, now));
            let (ref mut count, ref mut window_start) = *entry;
            if now.duration_since(*window_start) >= ADMIN_AUTH_WINDOW {
                *count = 0;
                *window_start = now;
            }
            *count += 1;
            *count
        };
        warn!(
            "Admin API unauthorized access attempt from {} ({}/{})",
            client_ip, attempt, ADMIN_AUTH_MAX_FAILURES
        );
        self.audit.log_auth_failure(client_ip, reason, attempt);

        let global = self
            .global_failure_count
            .fetch_add(1, Ordering::Relaxed)
            .saturating_add(1);
        if global >= ADMIN_GLOBAL_MAX_FAILURES {
            *self.global_cooldown_until.write() = Some(Instant::now() + ADMIN_GLOBAL_COOLDOWN);
            self.global_failure_count.store(0, Ordering::Relaxed);
            warn!(
                "Admin API: global failure threshold reached ({} total), {}s cooldown",
                global,
                ADMIN_GLOBAL_COOLDOWN.as_secs()
            );
        }
    }

    fn locked_out(&self, client_ip: &str) -> bool {
        if let Some(until) = *self.global_cooldown_until.read() {
            if Instant::now() < until {
                warn!(
                    "Admin API: global auth cooldown active, rejecting {}",
                    client_ip
                );
                return true;
            }
        }

        let now = Instant::now();
        let mut entry = self
            .failed_attempts
            .entry(client_ip.to_string())
            .or_insert((0, now));
        let (ref mut count, ref mut window_start) = *entry;
        if now.duration_since(*window_start) >= ADMIN_AUTH_WINDOW {
            *count = 0;
            *window_start = now;
        }
        if *count >= ADMIN_AUTH_MAX_FAILURES {
            warn!(
                "Admin API: {} locked out ({} failures in 60s)",
                client_ip, count
            );
            return true;
        }
        false
    }
}

/// Client IP as resolved by the admission layer, else the peer address
fn request_client_ip(request: &Request) -> String {
    if let Some(identity) = request.extensions().get::<ClientIdentity>() {
        return identity.ip.clone();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| normalize_ip(&addr.ip().to_string()))
        .unwrap_or_default()
}

/// Authentication middleware for admin API
pub async fn auth_middleware(
    State(auth): State<Arc<AdminAuthState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let client_ip = request_client_ip(&request);

    if !auth.allowed_ips.is_empty() && !auth.allowed_ips.contains(&client_ip) {
        warn!("Admin API access denied for IP: {}", client_ip);
        return StatusCode::FORBIDDEN.into_response();
    }

    if let Some(ref expected_token) = auth.auth_token {
        if auth.locked_out(&client_ip) {
            return StatusCode::TOO_MANY_REQUESTS.into_response();
        }

        let provided_token = headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.strip_prefix("Bearer ").unwrap_or(v));

        let provided_bytes = provided_token.unwrap_or("").as_bytes();
        let authorized: bool = provided_bytes.ct_eq(expected_token.as_bytes()).into();

        if !authorized {
            let reason = if provided_token.is_some() {
                "invalid token"
            } else {
                "missing token"
            };
            auth.record_failure(&client_ip, reason);
            return StatusCode::UNAUTHORIZED.into_response();
        }

        auth.failed_attempts.remove(&client_ip);
        auth.global_failure_count.store(0, Ordering::Relaxed);
    }

    next.run(request).await
}

/// Admin routes, relative to the admin prefix
pub fn admin_routes(state: Arc<AdminState>, auth: Arc<AdminAuthState>) -> Router {
    Router::new()
        .route(
            "/rate-limits",
            get(list_rules_handler).post(set_rule_handler),
        )
        .route("/blocked", get(list_blocked_handler))
        .route("/blocked/{key}", delete(unblock_handler))
        .route("/flagged", get(list_flagged_handler))
        .route("/stats", get(stats_handler))
        .layer(axum::middleware::from_fn_with_state(auth, auth_middleware))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetRuleRequest {
    endpoint: Option<String>,
    max_requests: Option<Value>,
    window_ms: Option<Value>,
}

/// Accept integers and integer strings
fn integer_field(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

/// Create or update an endpoint rule
async fn set_rule_handler(
    State(state): State<Arc<AdminState>>,
    request: Request,
) -> Response {
    let client_ip = request_client_ip(&request);
    let body = match axum::body::to_bytes(request.into_body(), 64 * 1024).await {
        Ok(body) => body,
        Err(_) => return bad_request("request body too large"),
    };
    let payload: SetRuleRequest = serde_json::from_slice(&body).unwrap_or_default();

    let (Some(endpoint), Some(max_requests), Some(window_ms)) = (
        payload.endpoint.filter(|e| !e.is_empty()),
        payload.max_requests,
        payload.window_ms,
    ) else {
        return bad_request("endpoint, maxRequests, windowMs required");
    };

    let max_requests = match integer_field(&max_requests).and_then(|v| u32::try_from(v).ok()) {
        Some(v) => v,
        None => {
            return AdmissionError::validation("maxRequests", "must be a positive integer")
                .into_response()
        }
    };
    let window_ms = match integer_field(&window_ms).and_then(|v| u64::try_from(v).ok()) {
        Some(v) => v,
        None => {
            return AdmissionError::validation("windowMs", "must be a positive integer")
                .into_response()
        }
    };

    match state
        .pipeline
        .rules()
        .set_rule(&endpoint, max_requests, window_ms)
    {
        Ok(rule) => {
            state.pipeline.audit().log(AuditEvent::RuleUpdated {
                ip: client_ip,
                endpoint: endpoint.clone(),
                max_requests: rule.max_requests,
                window_ms: rule.window_ms,
            });
            Json(json!({
                "message": format!("Rate limit rule set for {}", endpoint),
                "rule": rule,
            }))
            .into_response()
        }
        Err(e) => {
            warn!("Rejected rule update for {}: {}", endpoint, e);
            e.into_response()
        }
    }
}

async fn list_rules_handler(State(state): State<Arc<AdminState>>) -> Json<Value> {
    let rules = state.pipeline.rules();
    Json(json!({
        "default": rules.default_rule(),
        "rules": rules.rules(),
    }))
}

/// Lift a block; flags and failure counters are kept
async fn unblock_handler(
    State(state): State<Arc<AdminState>>,
    Path(key): Path<String>,
    request: Request,
) -> Result<Json<Value>, AdmissionError> {
    let was_blocked = state.pipeline.tracker().unblock(&key)?;
    state.pipeline.audit().log(AuditEvent::KeyUnblocked {
        key: key.clone(),
        ip: request_client_ip(&request),
        was_blocked,
    });

    Ok(Json(json!({
        "message": format!("Unblocked {} (was blocked: {})", key, was_blocked),
        "key": key,
        "wasBlocked": was_blocked,
    })))
}

async fn list_blocked_handler(State(state): State<Arc<AdminState>>) -> Json<Value> {
    let blocked = state.pipeline.blocks().list();
    Json(json!({
        "count": blocked.len(),
        "blocked": blocked,
    }))
}

async fn list_flagged_handler(State(state): State<Arc<AdminState>>) -> Json<Value> {
    let flagged = state.pipeline.tracker().flags();
    Json(json!({
        "count": flagged.len(),
        "flagged": flagged,
    }))
}

async fn stats_handler(State(state): State<Arc<AdminState>>) -> Json<Value> {
    Json(json!({
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "rate_limiter": state.pipeline.limiter().get_stats(),
        "suspicious": state.pipeline.tracker().get_stats(),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct EmergencyUnblockRequest {
    secret: Option<String>,
    key: Option<String>,
}

/// Shared-secret unblock for operators locked out of the admin surface
pub async fn emergency_unblock_handler(
    State(state): State<Arc<AdminState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client_ip = extract_client_ip(peer.ip(), &headers, state.pipeline.trusted_proxies());
    let payload: EmergencyUnblockRequest = serde_json::from_slice(&body).unwrap_or_default();

    let secret_ok = match (&state.unblock_secret, &payload.secret) {
        (Some(expected), Some(provided)) => {
            bool::from(provided.as_bytes().ct_eq(expected.as_bytes()))
        }
        _ => false,
    };
    let key = payload.key.filter(|k| !k.is_empty());

    let Some(key) = key.filter(|_| secret_ok) else {
        warn!("Emergency unblock rejected for {}", client_ip);
        state.pipeline.audit().log(AuditEvent::EmergencyUnblock {
            ip: client_ip,
            key: None,
            success: false,
        });
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "Invalid secret or key" })),
        )
            .into_response();
    };

    match state.pipeline.tracker().unblock(&key) {
        Ok(was_blocked) => {
            info!("Emergency unblock of {} by {}", key, client_ip);
            state.pipeline.audit().log(AuditEvent::EmergencyUnblock {
                ip: client_ip,
                key: Some(key.clone()),
                success: true,
            });
            Json(json!({
                "message": format!("Emergency unblock for {} (was blocked: {})", key, was_blocked),
                "key": key,
                "wasBlocked": was_blocked,
            }))
            .into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::AdmissionConfig;
    use crate::pipeline::PipelineStores;
    use crate::suspicious::FlagReason;
    use axum::body::Body;
    use tower::ServiceExt;

    fn setup(token: Option<&str>) -> (Router, Arc<AdmissionPipeline>) {
        let config = AdmissionConfig::default();
        let pipeline = Arc::new(AdmissionPipeline::new(
            &config,
            PipelineStores::in_memory(),
            Arc::new(ManualClock::new(1_700_000_000_000)),
            Arc::new(AuditLogger::disabled()),
        ));
        let admin_config = AdminConfig {
            auth_token: token.map(str::to_string),
            ..config.admin
        };
        let state = Arc::new(AdminState::new(pipeline.clone(), &admin_config));
        let auth = Arc::new(AdminAuthState::new(
            &admin_config,
            Arc::new(AuditLogger::disabled()),
        ));
        (admin_routes(state, auth), pipeline)
    }

    fn request(method: &str, uri: &str, peer: &str, body: Body) -> Request {
        let mut req = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let addr: SocketAddr = peer.parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
        req
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_set_rule_validation() {
        let (app, pipeline) = setup(None);

        let missing = app
            .clone()
            .oneshot(request(
                "POST",
                "/rate-limits",
                "127.0.0.1:5000",
                Body::from(r#"{"endpoint":"/api/submit","maxRequests":5}"#),
            ))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(missing).await["error"],
            "endpoint, maxRequests, windowMs required"
        );

        let negative = app
            .clone()
            .oneshot(request(
                "POST",
                "/rate-limits",
                "127.0.0.1:5000",
                Body::from(r#"{"endpoint":"/api/submit","maxRequests":-1,"windowMs":1000}"#),
            ))
            .await
            .unwrap();
        assert_eq!(negative.status(), StatusCode::BAD_REQUEST);

        let ok = app
            .oneshot(request(
                "POST",
                "/rate-limits",
                "127.0.0.1:5000",
                Body::from(r#"{"endpoint":"/api/submit","maxRequests":"5","windowMs":10000}"#),
            ))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let body = json_body(ok).await;
        assert_eq!(body["rule"]["maxRequests"], 5);
        assert_eq!(pipeline.rules().get_rule("/api/submit").window_ms, 10_000);
    }

    #[tokio::test]
    async fn test_ip_allow_list() {
        let (app, _pipeline) = setup(None);
        let response = app
            .clone()
            .oneshot(request("GET", "/blocked", "203.0.113.9:5000", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // IPv6 loopback is normalized before the allow-list check
        let response = app
            .oneshot(request("GET", "/blocked", "[::1]:5000", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_token_required_and_lockout() {
        let (app, _pipeline) = setup(Some("s3cret-admin-token"));

        let mut ok = request("GET", "/stats", "127.0.0.1:5000", Body::empty());
        ok.headers_mut()
            .insert("Authorization", "Bearer s3cret-admin-token".parse().unwrap());
        assert_eq!(app.clone().oneshot(ok).await.unwrap().status(), StatusCode::OK);

        for _ in 0..ADMIN_AUTH_MAX_FAILURES {
            let mut bad = request("GET", "/stats", "127.0.0.1:5000", Body::empty());
            bad.headers_mut()
                .insert("Authorization", "Bearer wrong".parse().unwrap());
            assert_eq!(
                app.clone().oneshot(bad).await.unwrap().status(),
                StatusCode::UNAUTHORIZED
            );
        }

        let mut locked = request("GET", "/stats", "127.0.0.1:5000", Body::empty());
        locked
            .headers_mut()
            .insert("Authorization", "Bearer s3cret-admin-token".parse().unwrap());
        assert_eq!(
            app.oneshot(locked).await.unwrap().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test]
    async fn test_unblock_endpoint() {
        let (app, pipeline) = setup(None);
        pipeline.tracker().flag("u1", FlagReason::RepeatedFailures);

        let response = app
            .clone()
            .oneshot(request("DELETE", "/blocked/u1", "127.0.0.1:5000", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["wasBlocked"], true);
        assert_eq!(body["key"], "u1");

        let response = app
            .clone()
            .oneshot(request("DELETE", "/blocked/u1", "127.0.0.1:5000", Body::empty()))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["wasBlocked"], false);

        // The flag survives the unblock
        let response = app
            .oneshot(request("GET", "/flagged", "127.0.0.1:5000", Body::empty()))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["flagged"]["u1"]["reason"], "repeated_failures");
    }
}
