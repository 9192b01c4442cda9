use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::instance::{InstanceState, ManagedInstance};

/// Result of one liveness probe against the interpreter endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub url: String,
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// Lifecycle view included in a health report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceView {
    pub container_name: String,
    pub container_id: Option<String>,
    pub state: InstanceState,
    pub consecutive_failures: u32,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl From<&ManagedInstance> for InstanceView {
    fn from(inst: &ManagedInstance) -> Self {
        Self {
            container_name: inst.spec.name.clone(),
            container_id: inst.id.clone(),
            state: inst.state,
            consecutive_failures: inst.consecutive_failures,
            last_health_check: inst.last_health_check,
        }
    }
}

/// Composed, ephemeral health of the system. Never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub instance: InstanceView,
    pub interpreter: ProbeReport,
    pub last_error: Option<String>,
    pub checked_at: DateTime<Utc>,
    /// Lifecycle says healthy and the fresh probe got through.
    pub ready: bool,
}

impl HealthReport {
    pub fn compose(inst: &ManagedInstance, probe: ProbeReport, now: DateTime<Utc>) -> Self {
        let ready = inst.state == InstanceState::Healthy && probe.reachable;
        let last_error = inst.last_error.clone().or_else(|| probe.error.clone());
        Self {
            instance: InstanceView::from(inst),
            interpreter: probe,
            last_error,
            checked_at: now,
            ready,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::test_spec;

    fn probe(reachable: bool) -> ProbeReport {
        ProbeReport {
            url: "http://127.0.0.1:3050/".into(),
            reachable,
            latency_ms: reachable.then_some(4),
            error: (!reachable).then(|| "connection refused".into()),
        }
    }

    #[test]
    fn absent_instance_is_reportable() {
        let inst = ManagedInstance::new(test_spec());
        let report = HealthReport::compose(&inst, probe(false), Utc::now());
        assert!(!report.ready);
        assert_eq!(report.instance.state, InstanceState::Absent);
        assert_eq!(report.last_error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn healthy_and_reachable_is_ready() {
        let mut inst = ManagedInstance::new(test_spec());
        inst.id = Some("c1".into());
        inst.state = InstanceState::Healthy;
        let report = HealthReport::compose(&inst, probe(true), Utc::now());
        assert!(report.ready);
        assert!(report.last_error.is_none());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["instance"]["state"], "healthy");
        assert_eq!(json["interpreter"]["latencyMs"], 4);
    }

    #[test]
    fn lifecycle_error_takes_precedence() {
        let mut inst = ManagedInstance::new(test_spec());
        inst.state = InstanceState::Failed;
        inst.last_error = Some("exited with code 1".into());
        let report = HealthReport::compose(&inst, probe(false), Utc::now());
        assert_eq!(report.last_error.as_deref(), Some("exited with code 1"));
    }
}
