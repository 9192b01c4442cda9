//! RPC method handlers organized by domain.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clause_core::ClauseError;
use clause_engine::{LifecycleManager, QueryBridge, StatusAggregator};
use clause_store::{DocumentStore, NewDocument, StoreError};
use clause_telemetry::{LogQuery, MetricsRecorder, TelemetryGuard};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::rpc::{self, RpcResponse};

const ENGINE_PING_TIMEOUT: Duration = Duration::from_secs(3);

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub lifecycle: Arc<LifecycleManager>,
    pub bridge: Arc<QueryBridge>,
    pub status: Arc<StatusAggregator>,
    pub store: Arc<DocumentStore>,
    pub telemetry: Option<Arc<TelemetryGuard>>,
    pub metrics: Arc<MetricsRecorder>,
}

impl HandlerState {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        bridge: Arc<QueryBridge>,
        status: Arc<StatusAggregator>,
        store: Arc<DocumentStore>,
    ) -> Self {
        Self {
            lifecycle,
            bridge,
            status,
            store,
            telemetry: None,
            metrics: Arc::new(MetricsRecorder::new()),
        }
    }

    /// Share the process-wide metrics recorder and log sink.
    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryGuard>) -> Self {
        self.metrics = Arc::clone(telemetry.metrics());
        self.telemetry = Some(telemetry);
        self
    }
}

/// Dispatch an RPC method to the appropriate handler and record metrics.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    method: &str,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let started = Instant::now();
    let resp = route(state, method, params, id).await;

    let label = if resp.error_code() == Some("METHOD_NOT_FOUND") {
        "unknown"
    } else {
        method
    };
    state
        .metrics
        .increment_counter("rpc_requests_total", &[("method", label)], 1);
    if let Some(code) = resp.error_code() {
        state
            .metrics
            .increment_counter("rpc_errors_total", &[("method", label), ("code", code)], 1);
    }
    state.metrics.record_histogram(
        "rpc_duration_ms",
        &[("method", label)],
        started.elapsed().as_secs_f64() * 1000.0,
    );
    debug!(method, success = resp.success, "rpc handled");
    resp
}

async fn route(
    state: &Arc<HandlerState>,
    method: &str,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    match method {
        // Instance
        "instance.ensure" => instance_ensure(state, id).await,
        "instance.stop" => instance_stop(state, id).await,
        "instance.status" | "status" | "health" => instance_status(state, id).await,
        "instance.logs" => instance_logs(state, params, id).await,

        // Query
        "query.run" => query_run(state, params, id).await,

        // Documents
        "document.create" => document_create(state, params, id).await,
        "document.append" => document_append(state, params, id).await,
        "document.list" => document_list(state, id).await,
        "document.read" => document_read(state, params, id).await,
        "document.delete" => document_delete(state, params, id).await,
        "document.export" => document_export(state, params, id).await,

        // System
        "system.ping" => system_ping(id),
        "system.getInfo" => system_get_info(state, id).await,

        // Telemetry
        "telemetry.logs" => telemetry_logs(state, params, id),
        "telemetry.metrics" => telemetry_metrics(state, id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

fn to_response<T: Serialize>(id: Option<serde_json::Value>, value: &T) -> RpcResponse {
    match serde_json::to_value(value) {
        Ok(v) => RpcResponse::success(id, v),
        Err(e) => RpcResponse::internal_error(id, format!("Failed to encode result: {e}")),
    }
}

/// Run a store call off the async workers; file writes fsync.
async fn blocking<T, F>(f: F) -> Result<T, ClauseError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ClauseError::Internal(format!("store task failed: {e}")))?
        .map_err(ClauseError::from)
}

// ── Instance handlers ──

async fn instance_ensure(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    match state.lifecycle.ensure().await {
        Ok(_) => to_response(id, &state.status.status().await),
        Err(e) => RpcResponse::from_error(id, &e),
    }
}

async fn instance_stop(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    match state.lifecycle.teardown().await {
        Ok(()) => RpcResponse::success(
            id,
            json!({
                "stopped": true,
                "state": state.lifecycle.snapshot().state,
            }),
        ),
        Err(e) => RpcResponse::from_error(id, &e),
    }
}

async fn instance_status(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    to_response(id, &state.status.status().await)
}

async fn instance_logs(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let tail = rpc::optional_u64(params, "tail")
        .map(|t| t as usize)
        .unwrap_or(state.lifecycle.config().log_tail);
    match state.lifecycle.logs(tail).await {
        Ok(logs) => RpcResponse::success(
            id,
            json!({
                "container": state.lifecycle.container_name(),
                "tail": tail,
                "logs": logs,
            }),
        ),
        Err(e) => RpcResponse::from_error(id, &e),
    }
}

// ── Query handler ──

async fn query_run(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let document = match rpc::require_str(params, &["document", "documentName"]) {
        Ok(d) => d,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let query = match rpc::require_str(params, &["query", "queryText"]) {
        Ok(q) => q,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let timeout_ms = rpc::optional_u64(params, "timeoutMs");

    let started = Instant::now();
    let outcome = state.bridge.execute(document, query, timeout_ms).await;
    let label = match &outcome {
        Ok(result) => result.outcome(),
        Err(_) => "failed",
    };
    state.metrics.record_histogram(
        "query_duration_ms",
        &[("outcome", label)],
        started.elapsed().as_secs_f64() * 1000.0,
    );

    match outcome.and_then(|result| result.into_answer(document)) {
        Ok(answer) => to_response(id, &answer),
        Err(e) => {
            warn!(document, code = e.code(), error = %e, "query failed");
            RpcResponse::from_error(id, &e)
        }
    }
}

// ── Document handlers ──

async fn document_create(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let name = match rpc::require_str(params, &["name", "document"]) {
        Ok(n) => n.to_owned(),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let background = match rpc::optional_str_list(params, &["background", "backgroundFacts"]) {
        Ok(b) => b,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let init = NewDocument {
        title: rpc::optional_str(params, "title").map(str::to_owned),
        description: rpc::optional_str(params, "description").map(str::to_owned),
        background,
    };

    let store = Arc::clone(&state.store);
    match blocking(move || store.create(&name, init)).await {
        Ok(doc) => to_response(id, &doc.summary()),
        Err(e) => RpcResponse::from_error(id, &e),
    }
}

async fn document_append(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let name = match rpc::require_str(params, &["document", "documentName", "name"]) {
        Ok(n) => n.to_owned(),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let text = match rpc::require_str(params, &["text", "content", "factOrRuleText"]) {
        Ok(t) => t.to_owned(),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let store = Arc::clone(&state.store);
    match blocking(move || store.append_background(&name, &text)).await {
        Ok(cell) => to_response(id, &cell),
        Err(e) => RpcResponse::from_error(id, &e),
    }
}

async fn document_list(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    let store = Arc::clone(&state.store);
    match blocking(move || store.list()).await {
        Ok(documents) => RpcResponse::success(
            id,
            json!({
                "totalCount": documents.len(),
                "documents": documents,
            }),
        ),
        Err(e) => RpcResponse::from_error(id, &e),
    }
}

async fn document_read(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let name = match rpc::require_str(params, &["name", "document"]) {
        Ok(n) => n.to_owned(),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let store = Arc::clone(&state.store);
    match blocking(move || store.read(&name)).await {
        Ok(doc) => to_response(id, &doc),
        Err(e) => RpcResponse::from_error(id, &e),
    }
}

async fn document_delete(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let name = match rpc::require_str(params, &["name", "document"]) {
        Ok(n) => n.to_owned(),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let store = Arc::clone(&state.store);
    let target = name.clone();
    match blocking(move || store.delete(&target)).await {
        Ok(()) => RpcResponse::success(id, json!({ "deleted": true, "name": name })),
        Err(e) => RpcResponse::from_error(id, &e),
    }
}

async fn document_export(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let name = match rpc::require_str(params, &["name", "document"]) {
        Ok(n) => n.to_owned(),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let store = Arc::clone(&state.store);
    match blocking(move || store.export_notebook(&name)).await {
        Ok(exported) => to_response(id, &exported),
        Err(e) => RpcResponse::from_error(id, &e),
    }
}

// ── System handlers ──

fn system_ping(id: Option<serde_json::Value>) -> RpcResponse {
    RpcResponse::success(
        id,
        json!({
            "pong": true,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }),
    )
}

async fn system_get_info(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    let engine = state.lifecycle.engine();
    let engine_available = matches!(
        tokio::time::timeout(ENGINE_PING_TIMEOUT, engine.ping()).await,
        Ok(Ok(()))
    );
    let snapshot = state.lifecycle.snapshot();
    let data_dir = state
        .store
        .knowledge_dir()
        .parent()
        .map(|p| p.display().to_string());

    RpcResponse::success(
        id,
        json!({
            "name": "clause",
            "version": env!("CARGO_PKG_VERSION"),
            "dataDir": data_dir,
            "containerName": snapshot.spec.name,
            "image": snapshot.spec.image,
            "endpoint": state.lifecycle.base_url(),
            "authMode": snapshot.spec.auth_mode.as_str(),
            "engineAvailable": engine_available,
            "instanceState": snapshot.state,
        }),
    )
}

// ── Telemetry handlers ──

fn telemetry_logs(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let disabled = || {
        RpcResponse::success(
            id.clone(),
            json!({
                "logs": [],
                "totalCount": 0,
                "enabled": false,
            }),
        )
    };
    let Some(ref telemetry) = state.telemetry else {
        return disabled();
    };
    let Some(log_sink) = telemetry.logs() else {
        return disabled();
    };

    let parsed = if params.is_null() {
        Ok(LogQuery::default())
    } else {
        serde_json::from_value(params.clone())
    };
    let query: LogQuery = match parsed {
        Ok(q) => q,
        Err(e) => return RpcResponse::invalid_params(id, format!("Invalid log query: {e}")),
    };
    match log_sink.query(&query) {
        Ok(records) => RpcResponse::success(
            id,
            json!({
                "totalCount": records.len(),
                "logs": records,
                "enabled": true,
            }),
        ),
        Err(e) => RpcResponse::internal_error(id, format!("Failed to query logs: {e}")),
    }
}

fn telemetry_metrics(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    to_response(id, &state.metrics.snapshot())
}
