//! JSON-RPC 2.0 surface of the redactor.
//!
//! The pruner can run as a standalone loopback service (`tokengate-pruner`).
//! Requests are `POST /rpc` with a JSON-RPC envelope:
//!
//! | Method | Params | Result |
//! |--------|--------|--------|
//! | `prune_text` | [`PruneRequest`], `options` optional | [`PruneResponse`] |
//! | `recover_text` | [`RecoverRequest`] | `{"text": ...}` |
//! | `recover_range` | alias of `recover_text` | |
//! | `health` | none | [`HealthReport`] |
//!
//! A `prune_text` call without `options` gets the service's default
//! [`PruneOptions`] (see [`RpcState::with_default_options`]).
//!
//! [`RemotePruner`] is the matching client. It implements [`Redactor`] and
//! fails open locally when the service can't be reached.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::engine::{Pruner, PrunerConfig};
use super::rerank::CacheStats;
use super::types::{PruneOptions, PruneRequest, PruneResponse, RecoverRequest, SourceType};
use super::{RedactFuture, Redactor};
use crate::error::{CapabilityError, GateError, Result};
use crate::pipeline::StageWarning;

pub const JSONRPC_VERSION: &str = "2.0";

/// Features reported by `health`; `rerank` is added when a reranker is set.
const CAPABILITIES: &[&str] = &[
    "prune_text",
    "recover_text",
    "recover_range",
    "annotate_lines",
    "include_markers",
];

/// JSON-RPC error codes used by the service.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const RECORD_NOT_FOUND: i64 = -32004;
    pub const RECORD_EXPIRED: i64 = -32010;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// Result of the `health` method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    /// Name of the configured reranker, if any.
    pub reranker: Option<String>,
    pub records: usize,
    pub rerank_cache: CacheStats,
    /// Features this service supports.
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecoverResult {
    text: String,
}

/// `prune_text` params as sent on the wire.
#[derive(Debug, Deserialize)]
struct PruneParams {
    text: String,
    #[serde(default)]
    goal_hint: String,
    #[serde(default)]
    source_type: SourceType,
    options: Option<PruneOptions>,
}

impl PruneParams {
    fn into_request(self, defaults: &PruneOptions) -> PruneRequest {
        PruneRequest {
            text: self.text,
            goal_hint: self.goal_hint,
            source_type: self.source_type,
            options: self.options.unwrap_or_else(|| defaults.clone()),
        }
    }
}

/// Shared state of the RPC router.
#[derive(Clone)]
pub struct RpcState {
    pruner: Arc<Pruner>,
    default_options: PruneOptions,
    started: Instant,
}

impl RpcState {
    pub fn new(pruner: Arc<Pruner>) -> Self {
        Self {
            pruner,
            default_options: PruneOptions::default(),
            started: Instant::now(),
        }
    }

    /// Options applied to `prune_text` calls that omit `options`.
    pub fn with_default_options(mut self, options: PruneOptions) -> Self {
        self.default_options = options;
        self
    }
}

/// Build the `/rpc` router around a pruner with stock default options.
pub fn router(pruner: Arc<Pruner>) -> Router {
    router_with_state(RpcState::new(pruner))
}

pub fn router_with_state(state: RpcState) -> Router {
    Router::new()
        .route("/rpc", post(rpc_handler))
        .with_state(state)
}

async fn rpc_handler(State(state): State<RpcState>, body: String) -> Json<RpcResponse> {
    Json(handle_body(&state, &body).await)
}

/// Parse and dispatch one raw request body.
pub async fn handle_body(state: &RpcState, body: &str) -> RpcResponse {
    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            debug!("Unparseable RPC body: {e}");
            let message = format!("parse error: {e}");
            return RpcResponse::err(Value::Null, codes::PARSE_ERROR, message);
        }
    };
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let request: RpcRequest = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(e) => {
            let message = format!("invalid request: {e}");
            return RpcResponse::err(id, codes::INVALID_REQUEST, message);
        }
    };
    if request.jsonrpc != JSONRPC_VERSION {
        return RpcResponse::err(id, codes::INVALID_REQUEST, "jsonrpc must be \"2.0\"");
    }
    dispatch(state, request).await
}

fn params<T: DeserializeOwned>(id: &Value, params: Value) -> std::result::Result<T, RpcResponse> {
    serde_json::from_value(params).map_err(|e| {
        let message = format!("invalid params: {e}");
        RpcResponse::err(id.clone(), codes::INVALID_PARAMS, message)
    })
}

fn to_value<T: Serialize>(id: Value, value: &T) -> RpcResponse {
    match serde_json::to_value(value) {
        Ok(v) => RpcResponse::ok(id, v),
        Err(e) => RpcResponse::err(id, codes::INTERNAL_ERROR, e.to_string()),
    }
}

/// Route a parsed request to the pruner.
pub async fn dispatch(state: &RpcState, request: RpcRequest) -> RpcResponse {
    let RpcRequest {
        id,
        method,
        params: raw,
        ..
    } = request;
    debug!("RPC {method} (id={id})");
    match method.as_str() {
        "prune_text" => match params::<PruneParams>(&id, raw) {
            Ok(params) => {
                let req = params.into_request(&state.default_options);
                let resp = state.pruner.prune(&req).await;
                to_value(id, &resp)
            }
            Err(resp) => resp,
        },
        "recover_text" | "recover_range" => match params::<RecoverRequest>(&id, raw) {
            Ok(req) => match state.pruner.recover(&req) {
                Ok(text) => to_value(id, &RecoverResult { text }),
                Err(e) => {
                    let code = match e {
                        GateError::RecordNotFound(_) => codes::RECORD_NOT_FOUND,
                        GateError::RecordExpired(_) => codes::RECORD_EXPIRED,
                        _ => codes::INTERNAL_ERROR,
                    };
                    RpcResponse::err(id, code, e.to_string())
                }
            },
            Err(resp) => resp,
        },
        "health" => {
            let report = HealthReport {
                status: "ok".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                uptime_secs: state.started.elapsed().as_secs(),
                reranker: state.pruner.reranker_name().map(str::to_string),
                records: state.pruner.store().len(),
                rerank_cache: state.pruner.cache_stats(),
                capabilities: CAPABILITIES
                    .iter()
                    .copied()
                    .chain(state.pruner.reranker_name().map(|_| "rerank"))
                    .map(str::to_string)
                    .collect(),
            };
            to_value(id, &report)
        }
        other => {
            let message = format!("method not found: {other}");
            RpcResponse::err(id, codes::METHOD_NOT_FOUND, message)
        }
    }
}

// ── Client ─────────────────────────────────────────────────────────

/// Failure of one client call.
#[derive(Debug)]
enum CallError {
    Transport(CapabilityError),
    Rpc(RpcError),
}

impl CallError {
    fn malformed(e: impl std::fmt::Display) -> Self {
        CallError::Transport(CapabilityError::Malformed(e.to_string()))
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Transport(e) => write!(f, "{e}"),
            CallError::Rpc(e) => write!(f, "RPC error {}: {}", e.code, e.message),
        }
    }
}

/// [`Redactor`] backed by a remote `tokengate-pruner` service.
///
/// Transport failures during `prune` fail open: the text is recorded in a
/// local store under a fresh `prune_id` and returned unchanged with a
/// `redactor_unreachable` warning. `recover` consults that local store before
/// asking the service.
pub struct RemotePruner {
    client: reqwest::Client,
    endpoint: String,
    next_id: AtomicU64,
    local: Pruner,
}

impl std::fmt::Debug for RemotePruner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePruner")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl RemotePruner {
    /// `endpoint` is the full URL of the `/rpc` route.
    pub fn new(
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> std::result::Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tokengate/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            next_id: AtomicU64::new(1),
            local: Pruner::new(PrunerConfig::default()),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> std::result::Result<T, CallError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "method": method,
            "params": params
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::Transport(e.into()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| CallError::Transport(e.into()))?;
        if !status.is_success() {
            let error = CapabilityError::from_status(status.as_u16(), &text);
            return Err(CallError::Transport(error));
        }
        let reply: RpcResponse = serde_json::from_str(&text).map_err(CallError::malformed)?;
        if let Some(error) = reply.error {
            return Err(CallError::Rpc(error));
        }
        let Some(result) = reply.result else {
            return Err(CallError::malformed("missing result"));
        };
        serde_json::from_value(result).map_err(CallError::malformed)
    }

    /// Ask the service for its health report.
    pub async fn health(&self) -> std::result::Result<HealthReport, CapabilityError> {
        self.call("health", Value::Null).await.map_err(|e| match e {
            CallError::Transport(e) => e,
            CallError::Rpc(e) => CapabilityError::Malformed(e.message),
        })
    }

    async fn prune_remote(&self, request: PruneRequest) -> PruneResponse {
        let params = match serde_json::to_value(&request) {
            Ok(p) => p,
            Err(e) => {
                let warning = StageWarning::new("internal_error", e.to_string());
                return self.local.passthrough(&request, warning);
            }
        };
        match self.call::<PruneResponse>("prune_text", params).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Remote pruner failed, passing text through: {e}");
                let warning = StageWarning::new("redactor_unreachable", e.to_string());
                self.local.passthrough(&request, warning)
            }
        }
    }

    async fn recover_remote(&self, request: RecoverRequest) -> Result<String> {
        match self.local.recover(&request) {
            Err(GateError::RecordNotFound(_)) => {}
            local => return local,
        }
        let params = serde_json::to_value(&request).map_err(|e| {
            GateError::RemoteCapabilityFailure(CapabilityError::Malformed(e.to_string()))
        })?;
        match self.call::<RecoverResult>("recover_text", params).await {
            Ok(r) => Ok(r.text),
            Err(CallError::Rpc(e)) => Err(match e.code {
                codes::RECORD_NOT_FOUND => GateError::RecordNotFound(request.prune_id),
                codes::RECORD_EXPIRED => GateError::RecordExpired(request.prune_id),
                _ => GateError::RemoteCapabilityFailure(CapabilityError::Malformed(e.message)),
            }),
            Err(CallError::Transport(e)) => Err(GateError::RemoteCapabilityFailure(e)),
        }
    }
}

impl Redactor for RemotePruner {
    fn prune<'a>(&'a self, request: PruneRequest) -> RedactFuture<'a, PruneResponse> {
        Box::pin(self.prune_remote(request))
    }

    fn recover<'a>(&'a self, request: RecoverRequest) -> RedactFuture<'a, Result<String>> {
        Box::pin(self.recover_remote(request))
    }
}
