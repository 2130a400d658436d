//! Gateway proxy - single fixed-port HTTP front door
//!
//! Every request with a path-embedded token is validated against the session
//! store, resolved to its backend host:port, and forwarded with the token
//! injected as both a query parameter and a bearer Authorization header.
//! Each request runs the pipeline independently; the only persistent state
//! consulted is the session store.

mod error;
pub mod forward;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{Request, Response},
    response::Json,
    routing::{any, delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::error::SessionError;
use crate::session::{token_fingerprint, BackendAddr, Session, SessionManager, SessionStats};

use error::GatewayError;
use forward::{apply_forward_headers, classify, forward_url, is_safe_method, RouteClass};

/// Shared state for the gateway server
#[derive(Clone)]
pub struct GatewayState {
    /// Session orchestration (shared with the sweep task)
    manager: Arc<SessionManager>,
    /// HTTP client for forwarding requests
    client: reqwest::Client,
    /// Default host for backends registered without an explicit address
    backend_host: String,
    /// Scheme reported in X-Forwarded-Proto
    protocol: String,
    /// Applied when a create-session request names no server
    default_server_name: Option<String>,
    /// Couple session activity to mutating API traffic (config knob; see
    /// DESIGN.md). Polling GETs and static assets never extend a session.
    extend_on_api_traffic: bool,
}

/// Start the gateway server
pub async fn start_gateway(
    config: Config,
    manager: Arc<SessionManager>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let bind_addr = config.bind_addr;

    // Bounded per-request timeout so a dead backend cannot stall the worker
    // pool; this is unrelated to session expiry, which is a data lifecycle.
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(config.forward_timeout_secs))
        .pool_max_idle_per_host(10)
        // Force HTTP/1.1 to avoid HTTP/2 connection reset issues with
        // single-session backend servers
        .http1_only()
        .build()
        .context("Failed to create HTTP client")?;

    let state = GatewayState {
        manager,
        client,
        backend_host: config.backend_host.clone(),
        protocol: config.protocol.clone(),
        default_server_name: config.server_name.clone(),
        extend_on_api_traffic: config.extend_on_api_traffic,
    };

    // Administrative surface, independent of any session
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/stats", get(get_stats))
        .route("/create-session", post(create_session))
        .route("/session/:session_id", delete(terminate_session));

    // Proxy routes only exist in gateway mode; direct-mode clients connect
    // straight to the allocated ports
    if let Some(prefix) = &config.proxy_prefix {
        // One catch-all under the prefix; the token is split off the
        // captured path so `/p/T`, `/p/T/` and `/p/T/api/data` all land here
        app = app.route(&format!("/{prefix}/*rest"), any(proxy_handler));
        tracing::info!(prefix = %prefix, "Gateway proxy routes enabled");
    } else {
        tracing::info!("Direct mode: no proxy prefix configured, serving admin routes only");
    }

    let app = app.with_state(state);

    tracing::info!("Starting gateway on {}", bind_addr);

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!("Gateway listening on {}", bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_rx.await.ok();
    })
    .await
    .context("Server error")?;

    tracing::info!("Gateway shut down gracefully");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Administrative handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn get_stats(
    State(state): State<GatewayState>,
) -> Result<Json<SessionStats>, GatewayError> {
    Ok(Json(state.manager.stats().await?))
}

/// Backend descriptor in a create-session request
#[derive(Debug, Deserialize)]
struct CreateBackend {
    /// "managed" (gateway allocates a port) or "external"; informational
    #[serde(rename = "type")]
    #[allow(dead_code)]
    kind: Option<String>,
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    user_id: String,
    server_name: Option<String>,
    backend: Option<CreateBackend>,
}

/// `POST /create-session` - administrative/internal session creation
///
/// Returns the full session descriptor including token and access URL.
async fn create_session(
    State(state): State<GatewayState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<Session>, GatewayError> {
    let backend = req.backend.and_then(|b| {
        b.port.map(|port| BackendAddr {
            host: b.host.unwrap_or_else(|| state.backend_host.clone()),
            port,
        })
    });

    let server_name = req
        .server_name
        .or_else(|| state.default_server_name.clone());

    let session = state
        .manager
        .create_session(&req.user_id, server_name, backend)
        .await?;
    Ok(Json(session))
}

/// `DELETE /session/:session_id` - administrative termination
async fn terminate_session(
    State(state): State<GatewayState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let terminated = state.manager.terminate_session(&session_id).await?;
    Ok(Json(json!({ "terminated": terminated })))
}

// ─────────────────────────────────────────────────────────────────────────────
// Proxy handlers
// ─────────────────────────────────────────────────────────────────────────────

/// `ANY /<prefix>/*rest` where `rest` is `<token>[/<path>]`
///
/// A path with an empty or garbled token never reaches a backend; it fails
/// token verification below.
async fn proxy_handler(
    State(state): State<GatewayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(rest): Path<String>,
    req: Request<Body>,
) -> Result<Response<Body>, GatewayError> {
    let (token, rest) = match rest.split_once('/') {
        Some((token, rest)) => (token.to_string(), rest.to_string()),
        None => (rest, String::new()),
    };
    proxy(state, addr, token, rest, req).await
}

/// Per-request pipeline: verify token, resolve session, classify route,
/// forward, stream the backend's response back verbatim
async fn proxy(
    state: GatewayState,
    client_addr: SocketAddr,
    token: String,
    rest: String,
    req: Request<Body>,
) -> Result<Response<Body>, GatewayError> {
    let method = req.method().clone();
    let headers = req.headers().clone();
    let query = req.uri().query().map(String::from);

    let class = classify(&rest);

    // Background polling and asset fetches must not keep an idle session
    // alive; only mutating API traffic counts as activity, and only when
    // configured to.
    let update_activity =
        class == RouteClass::Dynamic && state.extend_on_api_traffic && !is_safe_method(&method);

    // Invalid or expired tokens are rejected here, before any backend
    // connection is attempted
    let session = state
        .manager
        .get_session_by_token(&token, update_activity)
        .await?;

    tracing::debug!(
        token_fp = %token_fingerprint(&token),
        backend = %session.backend,
        path = %rest,
        route = ?class,
        "Proxying {} /{}",
        method,
        rest
    );

    let body_bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| GatewayError::BodyRead(e.to_string()))?;

    let url = forward_url(&session.backend, &rest, query.as_deref(), &token);

    let forward_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|e| GatewayError::BodyRead(format!("Invalid HTTP method: {e}")))?;

    let forward_req = apply_forward_headers(
        state.client.request(forward_method, &url),
        &headers,
        &token,
        &client_addr.ip().to_string(),
        &state.protocol,
        &session.backend,
    )
    .body(body_bytes.to_vec());

    // Connection refused or timeout here is an upstream failure (502),
    // distinct from an auth failure; the resolved address goes into the
    // error for diagnosis
    let response = forward_req.send().await.map_err(|e| {
        SessionError::BackendUnavailable {
            addr: session.backend.to_string(),
            reason: e.to_string(),
        }
    })?;

    match class {
        RouteClass::Static => build_static_response(response),
        RouteClass::Dynamic => build_dynamic_response(response),
    }
}

/// Representation and caching headers an asset response needs to stay
/// intact; the body stream is forwarded as received, so a compressed body
/// must keep its content-encoding
const STATIC_PASS_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "content-encoding",
    "cache-control",
    "etag",
    "last-modified",
    "vary",
];

/// Static-asset path: only the status and the representation headers come
/// through, so an HTML fallback header set never leaks onto a .js or .css
/// file
fn build_static_response(response: reqwest::Response) -> Result<Response<Body>, GatewayError> {
    let status = response.status();
    let mut builder = Response::builder().status(status.as_u16());

    for name in STATIC_PASS_HEADERS {
        if let Some(value) = response.headers().get(*name) {
            builder = builder.header(*name, value.as_bytes().to_vec());
        }
    }

    builder
        .body(Body::from_stream(response.bytes_stream()))
        .map_err(|e| GatewayError::ResponseBuild(e.to_string()))
}

/// Dynamic route: status, headers and body stream back unmodified apart
/// from hop-by-hop headers
fn build_dynamic_response(response: reqwest::Response) -> Result<Response<Body>, GatewayError> {
    let status = response.status();
    let mut builder = Response::builder().status(status.as_u16());

    for (key, value) in response.headers().iter() {
        if key == "transfer-encoding" || key == "connection" {
            continue;
        }
        builder = builder.header(key.as_str(), value.as_bytes().to_vec());
    }

    builder
        .body(Body::from_stream(response.bytes_stream()))
        .map_err(|e| GatewayError::ResponseBuild(e.to_string()))
}
