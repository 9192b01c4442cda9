//! HTTP client for SWISH's pengine API.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use clause_core::errors::ErrorKind;
use clause_core::instance::ConnectionInfo;
use clause_core::interpreter::{Interpreter, InterpreterError};
use clause_core::query::{Bindings, QueryRequest, QueryResult};
use serde_json::{json, Value};
use tracing::{debug, warn};

const MAX_ERROR_BODY: usize = 2_000;

pub struct SwishClient {
    client: reqwest::Client,
}

impl SwishClient {
    /// `accept_invalid_certs` is needed for SWISH's self-signed `--https`.
    pub fn new(accept_invalid_certs: bool) -> Self {
        let client = match build_client(accept_invalid_certs) {
            Ok(client) => client,
            Err(e) => {
                warn!(
                    error = %e,
                    accept_invalid_certs,
                    "http client setup failed, falling back to defaults"
                );
                reqwest::Client::new()
            }
        };
        Self { client }
    }
}

fn build_client(accept_invalid_certs: bool) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("clause/", env!("CARGO_PKG_VERSION")))
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
}

fn map_transport(e: reqwest::Error, timeout: Duration) -> InterpreterError {
    if e.is_timeout() {
        InterpreterError::Timeout(timeout)
    } else if e.is_connect() || e.is_request() {
        InterpreterError::Unreachable(e.to_string())
    } else if e.is_decode() {
        InterpreterError::Protocol(e.to_string())
    } else {
        InterpreterError::Unreachable(e.to_string())
    }
}

#[async_trait]
impl Interpreter for SwishClient {
    async fn ping(
        &self,
        conn: &ConnectionInfo,
        timeout: Duration,
    ) -> Result<Duration, InterpreterError> {
        let url = format!("{}/", conn.base_url.trim_end_matches('/'));
        let start = Instant::now();
        let resp = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_transport(e, timeout))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(InterpreterError::Status {
                status: status.as_u16(),
                body: String::new(),
            });
        }
        Ok(start.elapsed())
    }

    async fn run(
        &self,
        conn: &ConnectionInfo,
        request: &QueryRequest,
    ) -> Result<QueryResult, InterpreterError> {
        let url = format!("{}/pengine/create", conn.base_url.trim_end_matches('/'));
        let body = json!({
            "src_text": request.program,
            "ask": request.query,
            "format": "json",
            "chunk": request.max_solutions,
            "destroy": true,
            "application": "swish",
        });
        debug!(
            correlation_id = %request.correlation_id,
            program_bytes = request.program.len(),
            "submitting pengine query"
        );

        let resp = self
            .client
            .post(&url)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport(e, request.timeout))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| map_transport(e, request.timeout))?;
        if !status.is_success() {
            let mut body = text;
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(InterpreterError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let event: Value = serde_json::from_str(&text)
            .map_err(|e| InterpreterError::Protocol(format!("invalid JSON: {e}")))?;
        parse_pengine_event(&event, request.timeout)
    }
}

/// Map a pengine `create` event (or a bare answer event) to a result.
pub fn parse_pengine_event(event: &Value, timeout: Duration) -> Result<QueryResult, InterpreterError> {
    let answer = match event.get("event").and_then(Value::as_str) {
        Some("create") => event
            .get("answer")
            .ok_or_else(|| InterpreterError::Protocol("create event without answer".into()))?,
        _ => event,
    };
    let kind = answer
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| InterpreterError::Protocol("answer without event field".into()))?;

    match kind {
        "success" => {
            let data = answer
                .get("data")
                .and_then(Value::as_array)
                .ok_or_else(|| InterpreterError::Protocol("success without data".into()))?;
            let solutions: Vec<Bindings> = data.iter().map(binding_set).collect();
            if solutions.iter().all(|b| b.is_empty()) {
                return Ok(QueryResult::Success);
            }
            let truncated = answer.get("more").and_then(Value::as_bool).unwrap_or(false);
            Ok(QueryResult::Bindings { solutions, truncated })
        }
        "failure" => Ok(QueryResult::Failure),
        "error" => Ok(classify_error(answer, timeout)),
        other => Err(InterpreterError::Protocol(format!(
            "unexpected pengine event {other:?}"
        ))),
    }
}

fn binding_set(solution: &Value) -> Bindings {
    solution
        .as_object()
        .map(|obj| {
            obj.iter()
                .map(|(var, term)| (var.clone(), render_term(term)))
                .collect()
        })
        .unwrap_or_default()
}

fn classify_error(answer: &Value, timeout: Duration) -> QueryResult {
    let code = answer.get("code").and_then(Value::as_str).unwrap_or("");
    let message = match answer.get("data") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => render_term(other),
        None => code.to_owned(),
    };
    let kind = match code {
        "existence_error" if !message.contains("source_sink") => ErrorKind::UndefinedProcedure,
        "syntax_error" => ErrorKind::QuerySyntaxError,
        "time_limit_exceeded" => {
            return QueryResult::TimedOut {
                timeout_ms: timeout.as_millis() as u64,
            }
        }
        _ if message.contains("Unknown procedure") || message.contains("procedure `") => {
            ErrorKind::UndefinedProcedure
        }
        _ if message.to_lowercase().contains("syntax error") => ErrorKind::QuerySyntaxError,
        _ => ErrorKind::QueryError,
    };
    QueryResult::Error { kind, message }
}

/// Render a JSON-encoded Prolog term back to Prolog text.
pub fn render_term(term: &Value) -> String {
    match term {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "[]".into(),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(render_term).collect();
            format!("[{}]", inner.join(","))
        }
        Value::Object(obj) => match (obj.get("functor").and_then(Value::as_str), obj.get("args")) {
            (Some(functor), Some(Value::Array(args))) => {
                let inner: Vec<String> = args.iter().map(render_term).collect();
                format!("{functor}({})", inner.join(","))
            }
            _ => term.to_string(),
        },
    }
}
