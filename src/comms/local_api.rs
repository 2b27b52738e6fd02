use anyhow::Result;
use axum::{
    extract::{ConnectInfo, FromRequestParts, Query, Request, State},
    http::{request::Parts, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::connector::store::{FileSettingsStore, SettingsStore};
use crate::security::audit_log::{AuditLogger, ClientInfo, JsonlAuditSink};
use crate::security::endpoints::{EndpointRegistry, NAMESPACE};
use crate::security::gate::{AuthRequest, AuthorizationGate, DenyReason, Grant};
use crate::security::rate_limit::RateLimiter;

pub const API_KEY_HEADER: &str = "x-llm-api-key";
pub const WARNING_HEADER: &str = "x-llm-security-warning";
pub const READ_ONLY_HEADER: &str = "x-llm-read-only";

/// How often expired rate-limit windows are swept.
const PURGE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Upper bound on draining queued audit records at shutdown.
const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type SharedState = Arc<AppState>;

#[derive(Debug, Clone)]
pub struct AppState {
    pub gate: AuthorizationGate,
}

impl AppState {
    pub fn new(gate: AuthorizationGate) -> Self {
        Self { gate }
    }
}

/// Caller identity taken from the TCP peer only; forwarding headers are
/// client-controlled and ignored.
#[derive(Debug, Clone)]
struct ClientIdentity(ClientInfo);

impl<S> FromRequestParts<S> for ClientIdentity
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let address = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
            .unwrap_or(IpAddr::from([0, 0, 0, 0]))
            .to_string();

        let agent = parts
            .headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        Ok(ClientIdentity(ClientInfo { address, agent }))
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub status: u16,
}

fn transport_is_encrypted(request: &Request) -> bool {
    if request.uri().scheme_str() == Some("https") {
        return true;
    }
    request
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|proto| proto.trim().eq_ignore_ascii_case("https"))
        .unwrap_or(false)
}

fn deny_response(reason: &DenyReason) -> Response {
    let status = StatusCode::from_u16(reason.status_code()).unwrap_or(StatusCode::FORBIDDEN);
    let body = Json(ErrorResponse {
        code: reason.code().to_string(),
        message: reason.to_string(),
        status: status.as_u16(),
    });
    let mut headers = HeaderMap::new();
    if let DenyReason::RateLimitExceeded {
        retry_after: Some(wait),
    } = reason
    {
        let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
        headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(secs));
    }
    (status, headers, body).into_response()
}

// Runs the gate in front of every data route and records the final status.
async fn require_authorization(
    State(state): State<SharedState>,
    ClientIdentity(client): ClientIdentity,
    mut request: Request,
    next: Next,
) -> Response {
    // Non-visible-ASCII bytes are kept (lossily) so the key is rejected as
    // invalid and audited, not treated as absent.
    let raw_secret = request
        .headers()
        .get(API_KEY_HEADER)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());
    let route = request.uri().path().to_string();
    let auth = AuthRequest {
        raw_secret: raw_secret.as_deref(),
        route: &route,
        transport_is_encrypted: transport_is_encrypted(&request),
        client: &client,
    };

    let grant = match state.gate.authorize(&auth).await {
        Ok(grant) => grant,
        Err(reason) => return deny_response(&reason),
    };

    let params = Query::<HashMap<String, String>>::try_from_uri(request.uri())
        .map(|Query(q)| json!(q))
        .unwrap_or_else(|_| json!({}));
    request.extensions_mut().insert(grant.clone());

    let mut response = next.run(request).await;

    for warning in &grant.warnings {
        if let Ok(value) = HeaderValue::from_str(warning) {
            response.headers_mut().append(WARNING_HEADER, value);
        }
    }
    if grant.read_only {
        response
            .headers_mut()
            .insert(READ_ONLY_HEADER, HeaderValue::from_static("true"));
    }

    let status = response.status();
    if status.is_success() {
        let label = grant.slug.as_deref().unwrap_or(route.as_str());
        state
            .gate
            .record_completion(&grant, &client, label, &params, status.as_u16());
    }
    response
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "timestamp": Utc::now().to_rfc3339()}))
}

// Serves the host-supplied document for the route's permission slug.
async fn host_data(State(state): State<SharedState>, Extension(grant): Extension<Grant>) -> Response {
    let settings = match state.gate.store().snapshot() {
        Ok(s) => s,
        Err(e) => {
            error!("settings read failed while serving data: {}", e);
            return deny_response(&DenyReason::StoreUnavailable);
        }
    };
    let data = grant
        .slug
        .as_deref()
        .and_then(|slug| settings.host.get(slug))
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    Json(data).into_response()
}

pub fn create_router(state: SharedState) -> Router {
    let mut gated = Router::new();
    for (segment, _) in state.gate.registry().routes() {
        gated = gated.route(&format!("/{NAMESPACE}/{segment}"), get(host_data));
    }
    let gated = gated.route_layer(middleware::from_fn_with_state(
        state.clone(),
        require_authorization,
    ));

    Router::new()
        .route(&format!("/{NAMESPACE}/health"), get(health))
        .merge(gated)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wire the file-backed settings store and audit log into a gate.
///
/// The returned handle is the audit writer task. It finishes once every
/// clone of the state is dropped and the queued records are on disk.
pub async fn build_state(
    settings_path: &Path,
    audit_path: &Path,
    limiter: RateLimiter,
) -> Result<(SharedState, JoinHandle<()>)> {
    let store: Arc<dyn SettingsStore> = Arc::new(FileSettingsStore::open(settings_path)?);
    let (sink, writer) = JsonlAuditSink::open(audit_path).await?;
    let gate = AuthorizationGate::new(
        store,
        EndpointRegistry::default(),
        limiter,
        AuditLogger::new(Arc::new(sink)),
    );
    Ok((Arc::new(AppState::new(gate)), writer))
}

/// Wait for the audit writer to flush what is still queued.
pub async fn drain_audit(writer: JoinHandle<()>) {
    match tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, writer).await {
        Ok(Ok(())) => info!("audit log drained"),
        Ok(Err(e)) => error!("audit writer failed: {}", e),
        Err(_) => warn!("audit writer did not drain within {:?}", AUDIT_DRAIN_TIMEOUT),
    }
}

pub async fn serve(settings_path: &Path, audit_path: &Path, port: u16) -> Result<()> {
    let limiter = RateLimiter::new_per_hour();
    let (state, writer) = build_state(settings_path, audit_path, limiter.clone()).await?;
    let purge = limiter.spawn_purge(PURGE_INTERVAL);
    let app = create_router(state).into_make_service_with_connect_info::<SocketAddr>();

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .into_future()
        .await;

    // The server owned the last state clone, so the audit channel is closed now.
    purge.abort();
    drain_audit(writer).await;
    served?;
    Ok(())
}
