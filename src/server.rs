//! JSON HTTP server.
//!
//! Every operation is a tool in a [`ToolRegistry`] and is dispatched through
//! the same `POST /tools/{name}` handler, so the guardrail envelope in
//! [`Service`] applies to HTTP callers exactly as it does to the CLI.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/tools/list` | All tools with parameter schemas |
//! | `POST` | `/tools/{name}` | Call a tool; body is its JSON parameters |
//!
//! # Caller identity
//!
//! Rate limits and audit records are keyed by the peer IP address. A
//! loopback peer (a local UI or a reverse proxy on the same host) may name
//! itself with a well-formed `x-caller-id` header instead.
//!
//! Calls rejected before reaching a tool (unknown name, malformed body or
//! parameters) still take a rate-limit token and leave an audit record.
//!
//! # Error contract
//!
//! ```json
//! { "error": { "code": "access_denied", "message": "..." } }
//! ```
//!
//! Codes and statuses come from [`ApiError::code`] and [`ApiError::status`].

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::error::ApiError;
use crate::guard::OpClass;
use crate::service::Service;
use crate::tools::{ToolContext, ToolInfo, ToolRegistry};

const CALLER_HEADER: &str = "x-caller-id";
const MAX_CALLER_LEN: usize = 128;
/// Audit operation name for calls to an unregistered tool.
const UNKNOWN_TOOL: &str = "unknownTool";

#[derive(Clone)]
struct AppState {
    service: Arc<Service>,
    tools: Arc<ToolRegistry>,
}

/// Bind `[server].bind` and serve until the process is stopped.
pub async fn run_server(service: Arc<Service>) -> anyhow::Result<()> {
    let bind_addr = service.config().server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    serve(listener, service).await
}

/// Serve on an already-bound listener.
pub async fn serve(listener: tokio::net::TcpListener, service: Arc<Service>) -> anyhow::Result<()> {
    let app = router(service);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

pub fn router(service: Arc<Service>) -> Router {
    let state = AppState {
        service,
        tools: Arc::new(ToolRegistry::with_builtins()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/tools/list", get(handle_list_tools))
        .route("/tools/{name}", post(handle_tool_call))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
            },
        };
        (self.status(), Json(body)).into_response()
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /tools/list ============

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolInfo>,
}

async fn handle_list_tools(State(state): State<AppState>) -> Json<ToolListResponse> {
    Json(ToolListResponse {
        tools: state.tools.infos(),
    })
}

// ============ POST /tools/{name} ============

async fn handle_tool_call(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = caller_identity(&headers, peer);
    let Some(tool) = state.tools.find(&name) else {
        let err = ApiError::NotFound(format!("no tool registered with name: {}", name));
        return Err(state.service.reject(UNKNOWN_TOOL, OpClass::Roots, &caller, err));
    };

    let params = match parse_body(&body) {
        Ok(params) => params,
        Err(e) => return Err(state.service.reject(tool.name(), tool.class(), &caller, e)),
    };

    let ctx = ToolContext {
        service: state.service.clone(),
        caller,
    };
    let result = tool.execute(params, &ctx).await?;
    Ok(Json(serde_json::json!({ "result": result })))
}

/// An empty body is `null`; anything else must be a JSON object or `null`.
fn parse_body(body: &[u8]) -> Result<serde_json::Value, ApiError> {
    if body.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    let params: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| ApiError::validation(format!("body is not valid JSON: {}", e)))?;
    if !(params.is_null() || params.is_object()) {
        return Err(ApiError::validation("parameters must be a JSON object"));
    }
    Ok(params)
}

/// Only loopback peers may name themselves with the header; everyone else
/// is keyed by IP so a remote client cannot mint fresh rate-limit buckets.
fn caller_identity(headers: &HeaderMap, peer: SocketAddr) -> String {
    if !peer.ip().is_loopback() {
        return peer.ip().to_string();
    }
    headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| {
            !v.is_empty()
                && v.len() <= MAX_CALLER_LEN
                && v.chars().all(|c| c.is_ascii_graphic())
        })
        .map(|v| v.to_string())
        .unwrap_or_else(|| peer.ip().to_string())
}
