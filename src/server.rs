//!
//! kvgate HTTP server
//! ------------------
//! Axum frontend over the batch operations.
//!
//! Responsibilities:
//! - Bearer-token authentication against the session manager and identity records.
//! - Per-client fixed-window rate limiting on the storage routes.
//! - JSON request parsing and `AppError` rendering (`{"status":"error",...}`).
//! - Panic isolation per request, request ids in the tracing span.
//! - Startup (store, identities, snapshot loop) and graceful shutdown with a final snapshot.

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Extension, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::FutureExt; // for catch_unwind on async blocks
use serde_json::{json, Value as JsonValue};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::admin;
use crate::batch;
use crate::config::ServerConfig;
use crate::error::{AppError, AppResult};
use crate::filter::RequestBody;
use crate::identity::{IdentityDirectory, Principal, SessionManager};
use crate::storage::{ItemStore, PersistenceSettings};

pub mod rate_limit;
use rate_limit::RateLimiter;

/// Request bodies above this size are rejected before parsing.
pub const BODY_LIMIT_BYTES: usize = 1024 * 1024;

const RATE_LIMIT_MAX_CLIENTS: usize = 16_384;

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: ItemStore,
    pub identities: IdentityDirectory,
    pub sessions: SessionManager,
    pub config: Arc<ServerConfig>,
    pub limiter: RateLimiter,
}

impl AppState {
    /// Open the store and identity records under the configured data directory,
    /// import the identity seed file if any, and register pre-shared tokens.
    pub fn open(config: ServerConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create or access data dir: {}", config.data_dir.display()))?;
        let settings = PersistenceSettings {
            enabled: config.persist_interval_ms > 0,
            interval_ms: config.persist_interval_ms,
        };
        let store = ItemStore::open(&config.data_dir, settings)
            .with_context(|| format!("While opening item store under {}", config.data_dir.display()))?;
        let identities = IdentityDirectory::open(&config.data_dir)?;
        if let Some(seed) = &config.identities_file {
            identities.import(seed)?;
        }
        let sessions = SessionManager::new(config.session_ttl());
        let registered = identities.register_sessions(&sessions);
        info!(target: "kvgate::startup", identities = identities.len(), tokens = registered, items = store.len(), "state loaded");
        let limiter = RateLimiter::new(config.rate_window(), config.rate_limit, RATE_LIMIT_MAX_CLIENTS);
        Ok(Self { store, identities, sessions, config: Arc::new(config), limiter })
    }

    /// Volatile state with nothing on disk.
    pub fn in_memory(config: ServerConfig) -> Self {
        let limiter = RateLimiter::new(config.rate_window(), config.rate_limit, RATE_LIMIT_MAX_CLIENTS);
        Self {
            store: ItemStore::in_memory(),
            identities: IdentityDirectory::in_memory(),
            sessions: SessionManager::new(config.session_ttl()),
            config: Arc::new(config),
            limiter,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({
            "status": "error",
            "code": self.code_str(),
            "message": self.message(),
        });
        if let AppError::Forbidden { denied, .. } = &self {
            body["denied"] = serde_json::to_value(denied).unwrap_or_default();
        }
        (status, Json(body)).into_response()
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    // Rate limiting runs before authentication so unauthenticated floods are throttled too.
    let storage_routes = Router::new()
        .route("/setItem", post(set_item))
        .route("/getItem", post(get_item))
        .route("/removeItem", post(remove_item))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_identity))
        .route("/clearAll", post(clear_all))
        .route_layer(middleware::from_fn_with_state(state.clone(), limit_by_client));

    Router::new()
        .route("/", get(|| async { "kvgate ok" }))
        .merge(storage_routes)
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .layer(middleware::from_fn(trace_request))
        .with_state(state)
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: tokio::net::TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Start the server with the given configuration and block until Ctrl-C.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    info!(
        target: "kvgate::startup",
        "kvgate starting: bind={}, http_port={}, data_dir={}, persist_interval_ms={}, rate_limit={}/{}s, clear_all={}",
        config.bind, config.http_port, config.data_dir.display(), config.persist_interval_ms,
        config.rate_limit, config.rate_window_secs, config.clear_all_key.is_some()
    );
    let addr = config.addr();
    let state = AppState::open(config)?;
    state.store.ensure_persistence_loop();

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(target: "kvgate::startup", "Listening on {}", listener.local_addr()?);

    serve(listener, state.clone(), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(target: "kvgate::server", "failed to listen for shutdown signal: {e}");
        }
        info!(target: "kvgate::server", "shutdown requested");
    })
    .await?;

    state.store.save_snapshot().context("While writing the final snapshot")?;
    info!(target: "kvgate::server", items = state.store.len(), "final snapshot written");
    Ok(())
}

/// Attach a request id to the span covering the whole request and echo it back.
async fn trace_request(req: Request, next: Next) -> Response {
    let id = Uuid::new_v4().to_string();
    let span = info_span!("request", id = %id, method = %req.method(), path = %req.uri().path());
    async move {
        let mut resp = next.run(req).await;
        debug!(status = resp.status().as_u16(), "request.done");
        if let Ok(v) = HeaderValue::from_str(&id) {
            resp.headers_mut().insert("x-request-id", v);
        }
        resp
    }
    .instrument(span)
    .await
}

async fn limit_by_client(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let client = req.extensions().get::<ConnectInfo<SocketAddr>>().map(|c| c.0.ip());
    if let Some(ip) = client {
        if !state.limiter.allow(ip) {
            warn!(target: "kvgate::server", client = %ip, "rate limit exceeded");
            return AppError::rate_limited("rate_limited", "Too many requests, please try again later.").into_response();
        }
    }
    next.run(req).await
}

fn bearer_token(raw: &str) -> Option<&str> {
    let (scheme, token) = raw.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Resolve the caller from `Authorization: Bearer <token>`.
/// Tokens from identity records are re-registered when their session has lapsed.
fn authenticate(state: &AppState, headers: &HeaderMap) -> AppResult<Arc<Principal>> {
    let Some(raw) = headers.get(header::AUTHORIZATION) else {
        return Err(AppError::auth("no_token", "No token provided"));
    };
    let invalid = || AppError::auth("invalid_token", "Invalid or expired token");
    let token = raw.to_str().ok().and_then(bearer_token).ok_or_else(invalid)?;
    if let Some(p) = state.sessions.validate(token) {
        return Ok(p);
    }
    let rec = state.identities.find_by_token(token).ok_or_else(invalid)?;
    Ok(state.sessions.issue_with_token(rec.principal(), token.to_string()).principal)
}

async fn require_identity(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    match authenticate(&state, req.headers()) {
        Ok(principal) => {
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Err(e) => {
            debug!(target: "kvgate::server", code = e.code_str(), "authentication failed");
            e.into_response()
        }
    }
}

fn read_json(payload: Result<Json<JsonValue>, JsonRejection>) -> AppResult<JsonValue> {
    match payload {
        Ok(Json(v)) => Ok(v),
        Err(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            Err(AppError::user("payload_too_large".to_string(), format!("Request body exceeds {} bytes", BODY_LIMIT_BYTES)))
        }
        Err(e) => Err(AppError::user("bad_json".to_string(), e.body_text())),
    }
}

fn read_body(payload: Result<Json<JsonValue>, JsonRejection>) -> AppResult<RequestBody> {
    RequestBody::from_json(&read_json(payload)?)
}

/// Run a handler body, converting errors and panics into JSON responses.
async fn guarded<F>(op: &'static str, fut: F) -> Response
where
    F: Future<Output = AppResult<Response>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            if e.is_client_error() {
                debug!(target: "kvgate::server", op, code = e.code_str(), "request rejected");
            } else {
                error!(target: "kvgate::server", op, "request failed: {e}");
            }
            e.into_response()
        }
        Err(panic_payload) => {
            let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() { *s }
                      else if let Some(s) = panic_payload.downcast_ref::<String>() { s.as_str() }
                      else { "panic" };
            error!(target: "panic", "HTTP {} panic: {}", op, msg);
            AppError::internal("internal_panic", "internal server error").into_response()
        }
    }
}

async fn set_item(
    State(state): State<AppState>,
    Extension(principal): Extension<Arc<Principal>>,
    payload: Result<Json<JsonValue>, JsonRejection>,
) -> Response {
    guarded("setItem", async move {
        let body = read_body(payload)?;
        let res = batch::set_items(&state.store, &principal, &body)?;
        Ok(Json(json!({
            "status": "ok",
            "message": "Items saved/updated successfully",
            "affectedCount": res.affected(),
        }))
        .into_response())
    })
    .await
}

async fn get_item(
    State(state): State<AppState>,
    Extension(principal): Extension<Arc<Principal>>,
    payload: Result<Json<JsonValue>, JsonRejection>,
) -> Response {
    guarded("getItem", async move {
        let body = read_body(payload)?;
        let nested = batch::get_items(&state.store, &principal, &body)?;
        Ok(Json(nested).into_response())
    })
    .await
}

async fn remove_item(
    State(state): State<AppState>,
    Extension(principal): Extension<Arc<Principal>>,
    payload: Result<Json<JsonValue>, JsonRejection>,
) -> Response {
    guarded("removeItem", async move {
        let body = read_body(payload)?;
        let deleted = batch::remove_items(&state.store, &principal, &body)?;
        Ok(Json(json!({
            "status": "ok",
            "message": "Items removed successfully",
            "deletedCount": deleted,
        }))
        .into_response())
    })
    .await
}

async fn clear_all(State(state): State<AppState>, payload: Result<Json<JsonValue>, JsonRejection>) -> Response {
    guarded("clearAll", async move {
        let v = read_json(payload)?;
        let password = v.get("password").and_then(JsonValue::as_str);
        admin::check_secret(state.config.clear_all_key.as_deref(), password)?;
        let outcome = admin::clear_all(&state.store, &state.identities, &state.sessions)?;
        Ok(Json(json!({
            "status": "ok",
            "message": "All data cleared.",
            "result": outcome,
        }))
        .into_response())
    })
    .await
}

async fn not_found(uri: Uri) -> Response {
    AppError::not_found("not_found".to_string(), format!("No route for {}", uri.path())).into_response()
}
