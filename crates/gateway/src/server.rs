//! JSON-RPC 2.0 over `POST /mcp`, bearer-token protected.

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::Gateway;

pub const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_VERSION: &str = "2024-11-05";
const TOOL_NAME: &str = "domshell";

#[derive(Clone)]
pub struct ServerState {
    pub gateway: Arc<Gateway>,
    pub token: String,
}

#[derive(Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

const PARSE_ERROR: i64 = -32700;
const INVALID_PARAMS: i64 = -32602;
const METHOD_NOT_FOUND: i64 = -32601;
const SESSION_NOT_FOUND: i64 = -32001;

impl RpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

fn secure_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (&x, &y) in a.as_bytes().iter().zip(b.as_bytes().iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ---------------------------------------------------------------------------
// Bearer token authentication middleware
// ---------------------------------------------------------------------------

async fn auth_middleware(
    State(state): State<ServerState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if req.uri().path() == "/health" {
        return next.run(req).await;
    }

    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| secure_eq(t.trim(), &state.token))
        .unwrap_or(false);

    if authorized {
        next.run(req).await
    } else {
        debug!(path = %req.uri().path(), "Rejected unauthenticated request");
        (StatusCode::UNAUTHORIZED, "Unauthorized: invalid or missing Bearer token").into_response()
    }
}

pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/mcp", post(handle_rpc).delete(handle_delete))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(CorsLayer::permissive().allow_credentials(false))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    state: ServerState,
    host: &str,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let bind_addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "Gateway listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

async fn handle_delete(State(state): State<ServerState>, headers: HeaderMap) -> StatusCode {
    match session_id(&headers) {
        Some(id) if state.gateway.close_session(&id).await => StatusCode::NO_CONTENT,
        Some(_) => StatusCode::NOT_FOUND,
        None => StatusCode::BAD_REQUEST,
    }
}

async fn handle_rpc(State(state): State<ServerState>, headers: HeaderMap, body: Bytes) -> Response {
    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            let resp = RpcResponse::err(Value::Null, PARSE_ERROR, format!("parse error: {}", e));
            return (StatusCode::BAD_REQUEST, Json(resp)).into_response();
        }
    };
    let id = request.id.clone().unwrap_or(Value::Null);

    if request.method == "initialize" {
        let session = state.gateway.create_session();
        let result = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "sessionId": session,
            "serverInfo": { "name": "domshell", "version": env!("CARGO_PKG_VERSION") },
            "capabilities": { "tools": {} },
        });
        let mut response = Json(RpcResponse::ok(id, result)).into_response();
        if let Ok(value) = HeaderValue::from_str(&session) {
            response.headers_mut().insert(SESSION_HEADER, value);
        }
        return response;
    }

    let Some(session) = session_id(&headers).filter(|s| state.gateway.has_session(s)) else {
        let resp = RpcResponse::err(id, SESSION_NOT_FOUND, "unknown or missing session; call initialize first");
        return (StatusCode::NOT_FOUND, Json(resp)).into_response();
    };

    match request.method.as_str() {
        "notifications/initialized" => StatusCode::ACCEPTED.into_response(),
        "ping" => Json(RpcResponse::ok(id, json!({}))).into_response(),
        "tools/list" => Json(RpcResponse::ok(id, json!({ "tools": [tool_descriptor()] }))).into_response(),
        "tools/call" => {
            let params = request.params.unwrap_or(Value::Null);
            let name = params.get("name").and_then(|v| v.as_str()).unwrap_or(TOOL_NAME);
            if name != TOOL_NAME {
                let resp = RpcResponse::err(id, INVALID_PARAMS, format!("unknown tool: {}", name));
                return Json(resp).into_response();
            }
            let Some(command) = params
                .get("arguments")
                .and_then(|a| a.get("command"))
                .and_then(|c| c.as_str())
            else {
                let resp = RpcResponse::err(id, INVALID_PARAMS, "missing arguments.command");
                return Json(resp).into_response();
            };

            let reply = state.gateway.invoke(&session, command).await;
            let result = json!({
                "content": [{ "type": "text", "text": reply.text }],
                "isError": reply.is_error,
            });
            Json(RpcResponse::ok(id, result)).into_response()
        }
        other => {
            let resp = RpcResponse::err(id, METHOD_NOT_FOUND, format!("method not found: {}", other));
            Json(resp).into_response()
        }
    }
}

fn tool_descriptor() -> Value {
    json!({
        "name": TOOL_NAME,
        "description": "Run one shell command against the browser. The page is a filesystem: \
                        `ls`, `cd tabs/<id>`, `cat`, `text`, `grep`, `find`, `tree`, \
                        `click`, `type`, `navigate`. Run `help` for the full list.",
        "inputSchema": {
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "e.g. `ls -l`, `cd tabs/42`, `click submit_btn`" }
            },
            "required": ["command"]
        }
    })
}
