use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Observed lifecycle state of the managed container.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Absent,
    Creating,
    Starting,
    Healthy,
    Unhealthy,
    Stopping,
    Stopped,
    Failed,
}

impl InstanceState {
    /// Whether moving from `self` to `next` is a legal lifecycle transition.
    ///
    /// Forward edges follow creation order; the only backward edges are the
    /// recovery ones (unhealthy back to healthy, stopped/failed back to
    /// creating, and re-probing an unhealthy instance via starting).
    pub fn can_transition(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Absent, Creating)
                | (Absent, Starting)
                | (Creating, Starting)
                | (Creating, Failed)
                | (Starting, Healthy)
                | (Starting, Unhealthy)
                | (Starting, Failed)
                | (Healthy, Unhealthy)
                | (Healthy, Stopping)
                | (Healthy, Absent)
                | (Unhealthy, Healthy)
                | (Unhealthy, Starting)
                | (Unhealthy, Stopping)
                | (Unhealthy, Absent)
                | (Stopping, Stopped)
                | (Stopping, Absent)
                | (Stopping, Failed)
                | (Stopped, Creating)
                | (Stopped, Absent)
                | (Failed, Creating)
                | (Failed, Stopping)
                | (Failed, Absent)
        )
    }

    /// States an `ensure` in flight passes through. Never left behind.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Creating | Self::Starting | Self::Stopping)
    }

    /// Whether a container is believed to exist and serve requests.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Healthy | Self::Unhealthy)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Creating => "creating",
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("illegal instance transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: InstanceState,
    pub to: InstanceState,
}

/// Interpreter authentication/sandboxing mode, fixed at container creation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Anonymous, sandboxed execution.
    #[default]
    Anon,
    Social,
    Always,
}

impl AuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anon => "anon",
            Self::Social => "social",
            Self::Always => "always",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anon" | "anonymous" => Some(Self::Anon),
            "social" => Some(Self::Social),
            "always" => Some(Self::Always),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindMount {
    pub host_path: PathBuf,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Host identity the containerized process runs as, so files it writes into
/// the shared mount stay owned by the host user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// Desired configuration of the managed container.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub host_port: u16,
    pub container_port: u16,
    pub mounts: Vec<BindMount>,
    pub owner: Option<Owner>,
    pub auth_mode: AuthMode,
    pub https: bool,
    pub labels: BTreeMap<String, String>,
    pub memory_limit: Option<String>,
    pub cpus: Option<f64>,
}

impl ContainerSpec {
    pub fn scheme(&self) -> &'static str {
        if self.https {
            "https"
        } else {
            "http"
        }
    }
}

/// Where a healthy instance can be reached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub container_id: String,
    pub container_name: String,
    pub base_url: String,
    pub host_port: u16,
}

/// The single container owned by the lifecycle manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedInstance {
    pub id: Option<String>,
    pub spec: ContainerSpec,
    pub state: InstanceState,
    pub last_health_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Bumped on every create/adopt/teardown so stale probe results can be
    /// discarded.
    pub generation: u64,
}

impl ManagedInstance {
    pub fn new(spec: ContainerSpec) -> Self {
        Self {
            id: None,
            spec,
            state: InstanceState::Absent,
            last_health_check: None,
            consecutive_failures: 0,
            last_error: None,
            generation: 0,
        }
    }

    pub fn transition(&mut self, next: InstanceState) -> Result<(), InvalidTransition> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Apply a periodic probe result with hysteresis.
    ///
    /// Healthy flips to unhealthy only after `threshold` consecutive
    /// failures; unhealthy flips back on the first success. Returns the new
    /// state when it changed.
    pub fn record_probe(
        &mut self,
        ok: bool,
        threshold: u32,
        at: DateTime<Utc>,
    ) -> Option<InstanceState> {
        self.last_health_check = Some(at);
        let before = self.state;
        if ok {
            self.consecutive_failures = 0;
            if self.state == InstanceState::Unhealthy {
                self.state = InstanceState::Healthy;
            }
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.state == InstanceState::Healthy && self.consecutive_failures >= threshold.max(1)
            {
                self.state = InstanceState::Unhealthy;
            }
        }
        (self.state != before).then_some(self.state)
    }

    /// Forget the container after it was removed.
    pub fn clear(&mut self) {
        self.id = None;
        self.state = InstanceState::Absent;
        self.consecutive_failures = 0;
        self.generation += 1;
    }

    pub fn connection(&self, endpoint_host: &str) -> Option<ConnectionInfo> {
        let id = self.id.as_ref()?;
        Some(ConnectionInfo {
            container_id: id.clone(),
            container_name: self.spec.name.clone(),
            base_url: format!(
                "{}://{}:{}",
                self.spec.scheme(),
                endpoint_host,
                self.spec.host_port
            ),
            host_port: self.spec.host_port,
        })
    }
}

#[cfg(test)]
pub(crate) fn test_spec() -> ContainerSpec {
    ContainerSpec {
        image: "swipl/swish:latest".into(),
        name: "clause-test".into(),
        host_port: 3050,
        container_port: 3050,
        mounts: vec![BindMount {
            host_path: PathBuf::from("/tmp/clause-data"),
            container_path: "/data".into(),
            read_only: false,
        }],
        owner: None,
        auth_mode: AuthMode::Anon,
        https: false,
        labels: BTreeMap::new(),
        memory_limit: None,
        cpus: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy() -> ManagedInstance {
        let mut inst = ManagedInstance::new(test_spec());
        inst.id = Some("abc".into());
        inst.state = InstanceState::Healthy;
        inst
    }

    #[test]
    fn forward_path_is_legal() {
        let mut inst = ManagedInstance::new(test_spec());
        for s in [
            InstanceState::Creating,
            InstanceState::Starting,
            InstanceState::Healthy,
            InstanceState::Stopping,
            InstanceState::Stopped,
            InstanceState::Absent,
        ] {
            inst.transition(s).unwrap();
        }
        assert_eq!(inst.state, InstanceState::Absent);
    }

    #[test]
    fn skipping_creation_is_rejected() {
        let mut inst = ManagedInstance::new(test_spec());
        let err = inst.transition(InstanceState::Healthy).unwrap_err();
        assert_eq!(err.from, InstanceState::Absent);
        assert_eq!(inst.state, InstanceState::Absent);
    }

    #[test]
    fn stopped_cannot_become_healthy_directly() {
        assert!(!InstanceState::Stopped.can_transition(InstanceState::Healthy));
        assert!(InstanceState::Failed.can_transition(InstanceState::Creating));
    }

    #[test]
    fn single_failure_does_not_flip_healthy() {
        let mut inst = healthy();
        assert_eq!(inst.record_probe(false, 3, Utc::now()), None);
        assert_eq!(inst.state, InstanceState::Healthy);
        assert_eq!(inst.consecutive_failures, 1);
    }

    #[test]
    fn threshold_failures_flip_to_unhealthy() {
        let mut inst = healthy();
        inst.record_probe(false, 3, Utc::now());
        inst.record_probe(false, 3, Utc::now());
        let changed = inst.record_probe(false, 3, Utc::now());
        assert_eq!(changed, Some(InstanceState::Unhealthy));
    }

    #[test]
    fn single_success_recovers() {
        let mut inst = healthy();
        for _ in 0..5 {
            inst.record_probe(false, 3, Utc::now());
        }
        assert_eq!(inst.state, InstanceState::Unhealthy);
        assert_eq!(
            inst.record_probe(true, 3, Utc::now()),
            Some(InstanceState::Healthy)
        );
        assert_eq!(inst.consecutive_failures, 0);
    }

    #[test]
    fn success_resets_failure_streak() {
        let mut inst = healthy();
        inst.record_probe(false, 3, Utc::now());
        inst.record_probe(false, 3, Utc::now());
        inst.record_probe(true, 3, Utc::now());
        inst.record_probe(false, 3, Utc::now());
        assert_eq!(inst.state, InstanceState::Healthy);
    }

    #[test]
    fn connection_uses_scheme_and_port() {
        let mut inst = healthy();
        inst.spec.https = true;
        let conn = inst.connection("127.0.0.1").unwrap();
        assert_eq!(conn.base_url, "https://127.0.0.1:3050");
        assert_eq!(conn.container_id, "abc");
    }

    #[test]
    fn no_connection_without_id() {
        let inst = ManagedInstance::new(test_spec());
        assert!(inst.connection("127.0.0.1").is_none());
    }

    #[test]
    fn auth_mode_parse() {
        assert_eq!(AuthMode::parse("ANON"), Some(AuthMode::Anon));
        assert_eq!(AuthMode::parse("social"), Some(AuthMode::Social));
        assert_eq!(AuthMode::parse("bogus"), None);
        assert_eq!(serde_json::to_string(&AuthMode::Always).unwrap(), "\"always\"");
    }

    #[test]
    fn state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&InstanceState::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
        assert!(InstanceState::Creating.is_transient());
        assert!(!InstanceState::Failed.is_transient());
    }
}
