use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clause_core::health::{HealthReport, ProbeReport};
use clause_core::interpreter::Interpreter;
use tracing::debug;

use crate::lifecycle::LifecycleManager;

/// Composes lifecycle state with a fresh probe of the interpreter.
pub struct StatusAggregator {
    lifecycle: Arc<LifecycleManager>,
    interpreter: Arc<dyn Interpreter>,
    probe_timeout: Duration,
}

impl StatusAggregator {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        interpreter: Arc<dyn Interpreter>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            lifecycle,
            interpreter,
            probe_timeout,
        }
    }

    /// Never fails and never waits longer than the probe timeout. An absent
    /// container is a normal report, not an error.
    pub async fn status(&self) -> HealthReport {
        let inst = self.lifecycle.snapshot();
        let target = self.lifecycle.probe_target();
        let ping = self.interpreter.ping(&target, self.probe_timeout);

        let probe = match tokio::time::timeout(self.probe_timeout, ping).await {
            Ok(Ok(latency)) => ProbeReport {
                url: target.base_url,
                reachable: true,
                latency_ms: Some(latency.as_millis() as u64),
                error: None,
            },
            Ok(Err(e)) => ProbeReport {
                url: target.base_url,
                reachable: false,
                latency_ms: None,
                error: Some(e.to_string()),
            },
            Err(_) => ProbeReport {
                url: target.base_url,
                reachable: false,
                latency_ms: None,
                error: Some(format!(
                    "probe timed out after {}ms",
                    self.probe_timeout.as_millis()
                )),
            },
        };
        debug!(state = %inst.state, reachable = probe.reachable, "status computed");
        HealthReport::compose(&inst, probe, Utc::now())
    }
}
