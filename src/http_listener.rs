//! HTTP listener: router assembly and serving
//!
//! Layout (outside to inside):
//! - `TraceLayer` request spans
//! - `POST /emergency-unblock`, outside the admission layer
//! - admission middleware wrapping `/health`, the application routes, the
//!   admin routes and the 404 fallback

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::admin::{admin_routes, emergency_unblock_handler, AdminAuthState, AdminState};
use crate::client_key::AuthenticatedUser;
use crate::config::AdmissionConfig;
use crate::pipeline::{admission_middleware, AdmissionPipeline, SuspiciousMark};

/// Path of the shared-secret unblock endpoint
pub const EMERGENCY_UNBLOCK_PATH: &str = "/emergency-unblock";

/// Build the full router around an application router.
///
/// `app` is admitted through the pipeline together with `/health` and the
/// admin routes.
pub fn build_router(
    pipeline: Arc<AdmissionPipeline>,
    config: &AdmissionConfig,
    app: Router,
) -> Router {
    let admin_auth = Arc::new(AdminAuthState::new(&config.admin, pipeline.audit().clone()));
    build_router_with_auth(pipeline, config, admin_auth, app)
}

/// Same as [`build_router`] with a caller-owned admin lockout table, so the
/// caller can run its eviction task.
pub fn build_router_with_auth(
    pipeline: Arc<AdmissionPipeline>,
    config: &AdmissionConfig,
    admin_auth: Arc<AdminAuthState>,
    app: Router,
) -> Router {
    let admin_state = Arc::new(AdminState::new(pipeline.clone(), &config.admin));
    let admin_mount = admin_mount_path(&config.admin.path_prefix);

    let admitted = Router::new()
        .route("/health", get(health_handler))
        .with_state(pipeline.clone())
        .merge(app)
        .nest(&admin_mount, admin_routes(admin_state.clone(), admin_auth))
        .fallback(not_found_handler)
        .layer(middleware::from_fn_with_state(
            pipeline,
            admission_middleware,
        ));

    Router::new()
        .route(EMERGENCY_UNBLOCK_PATH, post(emergency_unblock_handler))
        .with_state(admin_state)
        .merge(admitted)
        .layer(TraceLayer::new_for_http())
}

/// Demo application routes served behind the pipeline
pub fn application_routes() -> Router {
    Router::new().route("/api/submit", post(submit_handler))
}

/// Serve until `shutdown` resolves
pub async fn run_http_listener(
    addr: SocketAddr,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Admission gate listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| anyhow::anyhow!("HTTP server error: {e}"))
}

/// `"/admin/"` -> `"/admin"`
fn admin_mount_path(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/admin".to_string()
    } else {
        trimmed.to_string()
    }
}

async fn health_handler(State(pipeline): State<Arc<AdmissionPipeline>>) -> Json<Value> {
    let default = pipeline.rules().default_rule();
    Json(json!({
        "status": "healthy",
        "timestamp": pipeline.clock().now_utc().to_rfc3339(),
        "rateLimit": {
            "max": default.max_requests,
            "windowMs": default.window_ms,
        },
    }))
}

async fn submit_handler(request: Request) -> Response {
    let mark = request.extensions().get::<SuspiciousMark>().copied();
    let user_id = request
        .extensions()
        .get::<AuthenticatedUser>()
        .map(|user| user.0.clone());

    let payload: Option<Value> = match axum::body::to_bytes(request.into_body(), usize::MAX).await
    {
        Ok(bytes) => serde_json::from_slice(&bytes).ok(),
        Err(_) => None,
    };
    let Some(payload) = payload.filter(Value::is_object) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Bad Request",
                "message": "Expected a JSON object body",
            })),
        )
            .into_response();
    };

    Json(json!({
        "success": true,
        "message": "Data received and logged",
        "data": {
            "message": payload.get("message"),
            "userId": user_id,
        },
        "suspicious": mark.map(|m| m.reason),
        "timestamp": Utc::now().to_rfc3339(),
    }))
    .into_response()
}

async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Not Found",
        })),
    )
}
