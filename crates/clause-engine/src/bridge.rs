//! Query Execution Bridge.
//!
//! Every execution re-submits the document's whole program. The interpreter
//! keeps nothing between calls, so the background cells are the only state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clause_core::ids::CorrelationId;
use clause_core::instance::ConnectionInfo;
use clause_core::interpreter::{Interpreter, InterpreterError};
use clause_core::query::{normalize_query, QueryRequest, QueryResult};
use clause_core::ClauseError;
use clause_settings::ClauseSettings;
use clause_store::DocumentStore;
use rand::Rng;
use tracing::{debug, info, warn, Instrument};

use crate::lifecycle::LifecycleManager;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);
const JITTER_FACTOR: f64 = 0.2;

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub max_solutions: u32,
    /// Extra attempts after the first, for transient transport failures.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Bring the instance up when a query arrives and none is running.
    pub auto_start: bool,
}

impl BridgeConfig {
    pub fn from_settings(settings: &ClauseSettings) -> Self {
        let q = &settings.query;
        Self {
            default_timeout: Duration::from_millis(q.default_timeout_ms),
            max_timeout: Duration::from_millis(q.max_timeout_ms),
            max_solutions: q.max_solutions,
            max_retries: q.max_retries,
            retry_base_delay: Duration::from_millis(q.retry_base_delay_ms),
            auto_start: q.auto_start,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_settings(&ClauseSettings::default())
    }
}

pub struct QueryBridge {
    lifecycle: Arc<LifecycleManager>,
    interpreter: Arc<dyn Interpreter>,
    store: Arc<DocumentStore>,
    config: BridgeConfig,
}

impl QueryBridge {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        interpreter: Arc<dyn Interpreter>,
        store: Arc<DocumentStore>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            lifecycle,
            interpreter,
            store,
            config,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Run `query_text` against the program held by `document`.
    ///
    /// Interpreter-reported errors and timeouts come back as
    /// [`QueryResult`] values; only transport failures that outlive the
    /// retry budget, missing documents and lifecycle problems are `Err`.
    /// Definitive answers are appended to the document history.
    pub async fn execute(
        &self,
        document: &str,
        query_text: &str,
        timeout_ms: Option<u64>,
    ) -> Result<QueryResult, ClauseError> {
        let query = normalize_query(query_text)
            .ok_or_else(|| ClauseError::InvalidArgument("query must not be empty".into()))?;
        let timeout = self.effective_timeout(timeout_ms)?;
        let correlation_id = CorrelationId::new();
        let span = tracing::info_span!(
            "query",
            document,
            correlation_id = %correlation_id,
        );

        async move {
            let program = self.program_snapshot(document).await?;
            let conn = self.connection().await?;
            let request = QueryRequest {
                program,
                query,
                timeout,
                correlation_id,
                max_solutions: self.config.max_solutions,
            };
            debug!(
                program_bytes = request.program.len(),
                timeout_ms = timeout.as_millis() as u64,
                "submitting query"
            );

            let started = Instant::now();
            let result = self.submit(&conn, &request, document).await?;
            info!(
                outcome = result.outcome(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "query finished"
            );

            if result.is_answer() {
                self.record(document, &request.query, &result).await;
            }
            Ok(result)
        }
        .instrument(span)
        .await
    }

    fn effective_timeout(&self, timeout_ms: Option<u64>) -> Result<Duration, ClauseError> {
        match timeout_ms {
            None => Ok(self.config.default_timeout.min(self.config.max_timeout)),
            Some(0) => Err(ClauseError::InvalidArgument(
                "timeoutMs must be greater than zero".into(),
            )),
            Some(ms) => {
                let asked = Duration::from_millis(ms);
                if asked > self.config.max_timeout {
                    debug!(
                        asked_ms = ms,
                        max_ms = self.config.max_timeout.as_millis() as u64,
                        "clamping query timeout"
                    );
                }
                Ok(asked.min(self.config.max_timeout))
            }
        }
    }

    /// Program text as of now. Appends landing later only affect later calls.
    async fn program_snapshot(&self, document: &str) -> Result<String, ClauseError> {
        let store = Arc::clone(&self.store);
        let name = document.to_owned();
        let text = tokio::task::spawn_blocking(move || store.program_text(&name))
            .await
            .map_err(|e| ClauseError::Internal(format!("document read task failed: {e}")))??;
        Ok(text)
    }

    async fn connection(&self) -> Result<ConnectionInfo, ClauseError> {
        if let Some(conn) = self.lifecycle.connection() {
            return Ok(conn);
        }
        if self.config.auto_start {
            info!("no running instance; starting one");
            return self.lifecycle.ensure().await;
        }
        Err(ClauseError::InstanceNotFound {
            container: self.lifecycle.container_name(),
        })
    }

    /// Submit with bounded retries. The caller's timeout is one budget for
    /// all attempts, backoff included.
    async fn submit(
        &self,
        conn: &ConnectionInfo,
        request: &QueryRequest,
        document: &str,
    ) -> Result<QueryResult, ClauseError> {
        let timeout_ms = request.timeout.as_millis() as u64;
        let deadline = Instant::now() + request.timeout;
        let mut attempt = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(QueryResult::TimedOut { timeout_ms });
            }
            let mut this_try = request.clone();
            this_try.timeout = remaining;

            let outcome =
                tokio::time::timeout(remaining, self.interpreter.run(conn, &this_try)).await;
            let err = match outcome {
                Err(_) | Ok(Err(InterpreterError::Timeout(_))) => {
                    warn!(timeout_ms, "query timed out");
                    return Ok(QueryResult::TimedOut { timeout_ms });
                }
                Ok(Ok(result)) => return Ok(result),
                Ok(Err(e)) => e,
            };

            if !err.is_retryable() {
                warn!(error = %err, "interpreter rejected the request");
                return Err(ClauseError::QueryError {
                    document: document.to_owned(),
                    message: err.to_string(),
                });
            }

            let delay = self.retry_delay(attempt);
            if attempt >= self.config.max_retries || delay >= deadline.saturating_duration_since(Instant::now()) {
                warn!(attempts = attempt + 1, error = %err, "interpreter unavailable");
                return Err(ClauseError::InterpreterUnavailable {
                    url: conn.base_url.clone(),
                    message: format!("{err} (after {} attempts)", attempt + 1),
                });
            }

            attempt += 1;
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient interpreter failure; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Exponential backoff with jitter: base * 2^attempt, +/- 20%.
    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base_delay.as_millis() as f64;
        let exp = (base * 2.0_f64.powi(attempt as i32)).min(MAX_RETRY_DELAY.as_millis() as f64);
        let spread = exp * JITTER_FACTOR;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((exp + jitter).max(0.0) as u64)
    }

    /// Append the answer to the document history. A failure here does not
    /// change the answer the caller gets.
    async fn record(&self, document: &str, query: &str, result: &QueryResult) {
        let store = Arc::clone(&self.store);
        let name = document.to_owned();
        let query = query.to_owned();
        let result = result.clone();
        let outcome =
            tokio::task::spawn_blocking(move || store.append_query_record(&name, &query, &result))
                .await;
        match outcome {
            Ok(Ok(cell)) => debug!(cell = %cell.name, "query recorded"),
            Ok(Err(e)) => warn!(error = %e, "failed to record query in document history"),
            Err(e) => warn!(error = %e, "query record task failed"),
        }
    }
}
