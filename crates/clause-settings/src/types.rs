//! Settings sections. Every section defaults independently so a partial
//! settings file only overrides what it names.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clause_core::instance::{AuthMode, BindMount, ContainerSpec, Owner};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClauseSettings {
    pub server: ServerSettings,
    pub container: ContainerSettings,
    pub lifecycle: LifecycleSettings,
    pub query: QuerySettings,
    pub status: StatusSettings,
    pub logging: LoggingSettings,
}

/// RPC server bind settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Upper bound on a single HTTP RPC request.
    pub request_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9850,
            request_timeout_ms: 330_000,
        }
    }
}

/// Desired shape of the managed interpreter container.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerSettings {
    pub image: String,
    pub name: String,
    pub host_port: u16,
    pub container_port: u16,
    /// Host the published port is reached on.
    pub endpoint_host: String,
    /// Host directory shared with the container; `~` is expanded.
    pub data_dir: String,
    pub mount_path: String,
    pub auth_mode: AuthMode,
    pub https: bool,
    pub pull_image: bool,
    /// Run the container as the host user so the mount stays host-owned.
    pub run_as_host_user: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_gid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
    pub labels: BTreeMap<String, String>,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            image: "swipl/swish:latest".to_string(),
            name: "clause-swish".to_string(),
            host_port: 3050,
            container_port: 3050,
            endpoint_host: "127.0.0.1".to_string(),
            data_dir: "~/.clause/swish-data".to_string(),
            mount_path: "/data".to_string(),
            auth_mode: AuthMode::Anon,
            https: false,
            pull_image: true,
            run_as_host_user: true,
            owner_uid: None,
            owner_gid: None,
            memory_limit: None,
            cpus: None,
            labels: BTreeMap::new(),
        }
    }
}

impl ContainerSettings {
    pub fn data_dir_path(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }

    /// Explicitly configured owner, if both ids are set.
    pub fn explicit_owner(&self) -> Option<Owner> {
        Some(Owner {
            uid: self.owner_uid?,
            gid: self.owner_gid?,
        })
    }

    /// Build the engine-facing spec.
    ///
    /// `host_owner` is the identity of this process, used when
    /// `runAsHostUser` is on and no explicit owner is configured.
    pub fn to_spec(&self, host_owner: Option<Owner>) -> ContainerSpec {
        let owner = self
            .explicit_owner()
            .or(if self.run_as_host_user { host_owner } else { None });
        let mut labels = self.labels.clone();
        labels.insert("managed-by".into(), "clause".into());
        labels.insert("clause-version".into(), env!("CARGO_PKG_VERSION").into());
        ContainerSpec {
            image: self.image.clone(),
            name: self.name.clone(),
            host_port: self.host_port,
            container_port: self.container_port,
            mounts: vec![BindMount {
                host_path: self.data_dir_path(),
                container_path: self.mount_path.clone(),
                read_only: false,
            }],
            owner,
            auth_mode: self.auth_mode,
            https: self.https,
            labels,
            memory_limit: self.memory_limit.clone(),
            cpus: self.cpus,
        }
    }
}

/// Bootstrap, monitoring and teardown timing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LifecycleSettings {
    pub poll_interval_ms: u64,
    pub poll_max_attempts: u32,
    pub probe_timeout_ms: u64,
    pub monitor_interval_ms: u64,
    /// Consecutive failed probes before healthy becomes unhealthy.
    pub unhealthy_threshold: u32,
    pub stop_grace_secs: u64,
    /// Bound on every single engine command (pull excluded).
    pub engine_timeout_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub log_tail: usize,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            poll_max_attempts: 30,
            probe_timeout_ms: 2_000,
            monitor_interval_ms: 10_000,
            unhealthy_threshold: 3,
            stop_grace_secs: 10,
            engine_timeout_ms: 120_000,
            shutdown_timeout_secs: 20,
            log_tail: 50,
        }
    }
}

impl LifecycleSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
    pub fn engine_timeout(&self) -> Duration {
        Duration::from_millis(self.engine_timeout_ms)
    }
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuerySettings {
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub max_solutions: u32,
    /// Retries of transient transport failures per query.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Start the container on first query when it is not running.
    pub auto_start: bool,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_timeout_ms: 300_000,
            max_solutions: 1_000,
            max_retries: 2,
            retry_base_delay_ms: 250,
            auto_start: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusSettings {
    pub probe_timeout_ms: u64,
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 1_500,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub persist_warnings: bool,
    /// Defaults to `~/.clause/logs.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_db_path: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            persist_warnings: true,
            log_db_path: None,
        }
    }
}

impl ClauseSettings {
    /// Clamp out-of-range values back into something workable.
    ///
    /// Returns the list of adjustments made, each also logged.
    pub fn validate(&mut self) -> Vec<String> {
        let mut fixes = Vec::new();
        let mut fix = |what: String| {
            warn!(adjustment = %what, "settings value out of range");
            fixes.push(what);
        };

        if self.container.host_port == 0 {
            fix("container.hostPort 0 -> 3050".into());
            self.container.host_port = 3050;
        }
        if self.container.container_port == 0 {
            fix("container.containerPort 0 -> 3050".into());
            self.container.container_port = 3050;
        }
        if !self.container.mount_path.starts_with('/') {
            fix(format!(
                "container.mountPath {:?} is not absolute -> /data",
                self.container.mount_path
            ));
            self.container.mount_path = "/data".into();
        }
        let lc = &mut self.lifecycle;
        if lc.poll_max_attempts == 0 {
            fix("lifecycle.pollMaxAttempts 0 -> 1".into());
            lc.poll_max_attempts = 1;
        }
        if lc.poll_interval_ms < 50 {
            fix(format!("lifecycle.pollIntervalMs {} -> 50", lc.poll_interval_ms));
            lc.poll_interval_ms = 50;
        }
        if lc.unhealthy_threshold == 0 {
            fix("lifecycle.unhealthyThreshold 0 -> 1".into());
            lc.unhealthy_threshold = 1;
        }
        if lc.monitor_interval_ms < 100 {
            fix(format!("lifecycle.monitorIntervalMs {} -> 100", lc.monitor_interval_ms));
            lc.monitor_interval_ms = 100;
        }
        let q = &mut self.query;
        if q.max_timeout_ms == 0 {
            fix("query.maxTimeoutMs 0 -> 300000".into());
            q.max_timeout_ms = 300_000;
        }
        if q.default_timeout_ms == 0 || q.default_timeout_ms > q.max_timeout_ms {
            let clamped = q.default_timeout_ms.clamp(1, q.max_timeout_ms);
            fix(format!(
                "query.defaultTimeoutMs {} -> {clamped}",
                q.default_timeout_ms
            ));
            q.default_timeout_ms = clamped;
        }
        if q.max_solutions == 0 {
            fix("query.maxSolutions 0 -> 1".into());
            q.max_solutions = 1;
        }
        if self.status.probe_timeout_ms == 0 {
            fix("status.probeTimeoutMs 0 -> 1500".into());
            self.status.probe_timeout_ms = 1_500;
        }
        fixes
    }

    pub fn log_db_path(&self) -> PathBuf {
        self.logging
            .log_db_path
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| clause_home().join("logs.db"))
    }
}

/// `~/.clause`, falling back to `/tmp/.clause` without `HOME`.
pub fn clause_home() -> PathBuf {
    home_dir().join(".clause")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// Expand a leading `~` or `~/`.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return home_dir();
    }
    match path.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None => PathBuf::from(path),
    }
}
