//! Container Lifecycle Manager.
//!
//! Owns the single [`ManagedInstance`]. `ensure`, `teardown` and the
//! monitor's probe results all go through one async mutex, so transitions
//! never interleave. Readers use the `watch` snapshot and never block on an
//! in-flight bootstrap.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clause_core::engine::{ContainerEngine, EngineError};
use clause_core::instance::{ConnectionInfo, ContainerSpec, InstanceState, ManagedInstance};
use clause_core::interpreter::Interpreter;
use clause_core::ClauseError;
use clause_settings::ClauseSettings;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::preflight;

/// Timing and behaviour knobs for bootstrap and teardown.
#[derive(Clone, Debug)]
pub struct LifecycleConfig {
    pub poll_interval: Duration,
    pub poll_max_attempts: u32,
    pub probe_timeout: Duration,
    pub unhealthy_threshold: u32,
    pub stop_grace: Duration,
    pub pull_image: bool,
    pub log_tail: usize,
    /// Host the published port is reached through.
    pub endpoint_host: String,
}

impl LifecycleConfig {
    pub fn from_settings(settings: &ClauseSettings) -> Self {
        let lc = &settings.lifecycle;
        Self {
            poll_interval: lc.poll_interval(),
            poll_max_attempts: lc.poll_max_attempts,
            probe_timeout: lc.probe_timeout(),
            unhealthy_threshold: lc.unhealthy_threshold,
            stop_grace: lc.stop_grace(),
            pull_image: settings.container.pull_image,
            log_tail: lc.log_tail,
            endpoint_host: settings.container.endpoint_host.clone(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::from_settings(&ClauseSettings::default())
    }
}

pub struct LifecycleManager {
    engine: Arc<dyn ContainerEngine>,
    interpreter: Arc<dyn Interpreter>,
    config: LifecycleConfig,
    instance: Mutex<ManagedInstance>,
    snapshot: watch::Sender<ManagedInstance>,
    /// Fired once at process shutdown; interrupts any bootstrap in flight.
    shutdown: CancellationToken,
}

impl LifecycleManager {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        interpreter: Arc<dyn Interpreter>,
        spec: ContainerSpec,
        config: LifecycleConfig,
    ) -> Arc<Self> {
        let inst = ManagedInstance::new(spec);
        let (snapshot, _) = watch::channel(inst.clone());
        Arc::new(Self {
            engine,
            interpreter,
            config,
            instance: Mutex::new(inst),
            snapshot,
            shutdown: CancellationToken::new(),
        })
    }

    /// Stop bringing the instance up. An `ensure` waiting on the
    /// interpreter settles and releases the lifecycle lock so `teardown`
    /// can run; later `ensure` calls are refused.
    pub fn begin_shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(container = %self.container_name(), "lifecycle shutting down");
        }
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Last published instance state. Never waits on the lifecycle lock.
    pub fn snapshot(&self) -> ManagedInstance {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ManagedInstance> {
        self.snapshot.subscribe()
    }

    pub fn container_name(&self) -> String {
        self.snapshot.borrow().spec.name.clone()
    }

    /// Where the interpreter answers once the container is up, whether or
    /// not it is up right now.
    pub fn base_url(&self) -> String {
        let snap = self.snapshot.borrow();
        format!(
            "{}://{}:{}",
            snap.spec.scheme(),
            self.config.endpoint_host,
            snap.spec.host_port
        )
    }

    /// Connection to a container believed to be serving.
    pub fn connection(&self) -> Option<ConnectionInfo> {
        let snap = self.snapshot.borrow();
        if !snap.state.is_running() {
            return None;
        }
        snap.connection(&self.config.endpoint_host)
    }

    /// Connection details for probing, falling back to the configured
    /// endpoint when no container is known.
    pub fn probe_target(&self) -> ConnectionInfo {
        let snap = self.snapshot.borrow();
        snap.connection(&self.config.endpoint_host)
            .unwrap_or_else(|| ConnectionInfo {
                container_id: String::new(),
                container_name: snap.spec.name.clone(),
                base_url: format!(
                    "{}://{}:{}",
                    snap.spec.scheme(),
                    self.config.endpoint_host,
                    snap.spec.host_port
                ),
                host_port: snap.spec.host_port,
            })
    }

    // ── Ensure ──

    /// Bring the instance to `healthy`, creating it if needed.
    ///
    /// The work runs on its own task, so a caller that stops waiting does not
    /// abandon the state machine mid-transition: the bootstrap still runs to
    /// `healthy`, `unhealthy` or `failed`.
    pub async fn ensure(self: &Arc<Self>) -> Result<ConnectionInfo, ClauseError> {
        let this = Arc::clone(self);
        match tokio::spawn(async move { this.ensure_inner().await }).await {
            Ok(result) => result,
            Err(e) => Err(ClauseError::Internal(format!("ensure task failed: {e}"))),
        }
    }

    async fn ensure_inner(&self) -> Result<ConnectionInfo, ClauseError> {
        let mut inst = self.instance.lock().await;
        self.recover_stuck(&mut inst);

        if self.shutdown.is_cancelled() {
            return Err(ClauseError::InstanceFailed {
                container: inst.spec.name.clone(),
                message: "shutting down".into(),
            });
        }

        if inst.state == InstanceState::Healthy {
            if let Some(conn) = inst.connection(&self.config.endpoint_host) {
                debug!(container = %inst.spec.name, "instance already healthy");
                return Ok(conn);
            }
        }

        // Any ping failure, including a hung daemon, means no engine.
        if let Err(e) = self.engine.ping().await {
            inst.last_error = Some(e.to_string());
            self.publish(&inst);
            warn!(container = %inst.spec.name, error = %e, "container engine unavailable");
            let message = match e {
                EngineError::Unavailable(message) => message,
                other => other.to_string(),
            };
            return Err(ClauseError::EngineUnavailable { message });
        }

        self.reconcile(&mut inst).await?;

        if inst.state == InstanceState::Starting {
            return self.bootstrap_probe(&mut inst).await;
        }

        self.adopt_or_clear_by_name(&mut inst).await?;
        if inst.state == InstanceState::Starting {
            return self.bootstrap_probe(&mut inst).await;
        }

        self.create_and_start(&mut inst).await?;
        self.bootstrap_probe(&mut inst).await
    }

    /// Check a remembered container against the engine. A live one is
    /// re-probed; a dead or missing one is forgotten.
    async fn reconcile(&self, inst: &mut ManagedInstance) -> Result<(), ClauseError> {
        let Some(id) = inst.id.clone() else {
            if matches!(inst.state, InstanceState::Stopped | InstanceState::Failed) {
                self.set_state(inst, InstanceState::Absent)?;
            }
            return Ok(());
        };

        match self.engine.inspect(&id).await {
            Ok(state) if state.running && inst.state == InstanceState::Unhealthy => {
                info!(container = %inst.spec.name, "re-probing unhealthy instance");
                self.set_state(inst, InstanceState::Starting)
            }
            Ok(state) => {
                info!(
                    container = %inst.spec.name,
                    status = %state.status,
                    exit_code = ?state.exit_code,
                    "discarding container that is no longer usable"
                );
                self.remove_quietly(&id).await;
                inst.clear();
                self.publish(inst);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!(container = %inst.spec.name, "container vanished; recreating");
                inst.clear();
                self.publish(inst);
                Ok(())
            }
            Err(e) => Err(self.note_engine_error(inst, e)),
        }
    }

    /// Handle a container with our name that this manager did not create.
    async fn adopt_or_clear_by_name(&self, inst: &mut ManagedInstance) -> Result<(), ClauseError> {
        let name = inst.spec.name.clone();
        let existing = match self.engine.find_by_name(&name).await {
            Ok(found) => found,
            Err(e) => return Err(self.note_engine_error(inst, e)),
        };
        let Some(id) = existing else {
            return Ok(());
        };

        match self.engine.inspect(&id).await {
            Ok(state) if state.running => {
                info!(container = %name, id = %id, "adopting running container");
                inst.id = Some(id);
                inst.generation += 1;
                self.set_state(inst, InstanceState::Starting)
            }
            Ok(_) => {
                info!(container = %name, id = %id, "removing stopped container with our name");
                match self.engine.remove(&id).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_not_found() => Ok(()),
                    Err(e) => Err(self.note_engine_error(inst, e)),
                }
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(self.note_engine_error(inst, e)),
        }
    }

    async fn create_and_start(&self, inst: &mut ManagedInstance) -> Result<(), ClauseError> {
        self.set_state(inst, InstanceState::Creating)?;
        let name = inst.spec.name.clone();

        if let Err(e) = preflight::prepare_mounts(&inst.spec) {
            return Err(self.fail(inst, format!("mount preparation failed: {e}")));
        }

        if self.config.pull_image {
            let image = inst.spec.image.clone();
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(self.fail(inst, "startup interrupted by shutdown".into()));
                }
                pulled = self.engine.pull(&image) => {
                    if let Err(e) = pulled {
                        warn!(image = %image, error = %e, "image pull failed; using local image");
                    }
                }
            }
        }

        let id = match self.create_container(&inst.spec).await {
            Ok(id) => id,
            Err(e) => return Err(self.fail_engine(inst, e)),
        };
        info!(container = %name, id = %id, "container created");
        inst.id = Some(id.clone());
        inst.generation += 1;
        self.publish(inst);

        if let Err(e) = self.engine.start(&id).await {
            error!(container = %name, error = %e, "container start failed");
            self.remove_quietly(&id).await;
            self.drop_container(inst);
            return Err(self.fail_engine(inst, e));
        }

        self.set_state(inst, InstanceState::Starting)
    }

    /// Create, clearing one name conflict left behind by an earlier run.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        match self.engine.create(spec).await {
            Err(EngineError::Conflict(message)) => {
                warn!(container = %spec.name, %message, "name conflict; removing stale container");
                match self.engine.remove(&spec.name).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
                self.engine.create(spec).await
            }
            other => other,
        }
    }

    /// Bounded poll of the interpreter root until it answers.
    async fn bootstrap_probe(&self, inst: &mut ManagedInstance) -> Result<ConnectionInfo, ClauseError> {
        let conn = inst
            .connection(&self.config.endpoint_host)
            .ok_or_else(|| ClauseError::Internal("bootstrap probe without a container".into()))?;
        let max = self.config.poll_max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max {
            let probed = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(self.interrupt_bootstrap(inst, &conn, attempt));
                }
                probed = self.interpreter.ping(&conn, self.config.probe_timeout) => probed,
            };
            match probed {
                Ok(latency) => {
                    self.set_state(inst, InstanceState::Healthy)?;
                    inst.consecutive_failures = 0;
                    inst.last_health_check = Some(Utc::now());
                    inst.last_error = None;
                    self.publish(inst);
                    info!(
                        container = %conn.container_name,
                        attempt,
                        latency_ms = latency.as_millis() as u64,
                        "instance healthy"
                    );
                    return Ok(conn);
                }
                Err(e) => {
                    debug!(container = %conn.container_name, attempt, error = %e, "interpreter not ready");
                    last_error = Some(e.to_string());
                }
            }

            match self.engine.inspect(&conn.container_id).await {
                Ok(state) if !state.running => {
                    let message = match state.exit_code {
                        Some(code) => format!("exited during startup with code {code}"),
                        None => format!("stopped during startup ({})", state.status),
                    };
                    return Err(self.abort_bootstrap(inst, &conn, message).await);
                }
                Err(e) if e.is_not_found() => {
                    return Err(self
                        .abort_bootstrap(inst, &conn, "disappeared during startup".into())
                        .await);
                }
                _ => {}
            }

            if attempt < max {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        return Err(self.interrupt_bootstrap(inst, &conn, attempt));
                    }
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        inst.consecutive_failures = max;
        inst.last_health_check = Some(Utc::now());
        inst.last_error = last_error.clone();
        self.set_state(inst, InstanceState::Unhealthy)?;
        warn!(
            container = %conn.container_name,
            attempts = max,
            error = last_error.as_deref().unwrap_or(""),
            "instance did not become healthy"
        );
        Err(ClauseError::InstanceStartTimeout {
            container: conn.container_name,
            attempts: max,
            last_error,
        })
    }

    /// Shutdown arrived mid-bootstrap. The container is kept for `teardown`
    /// to collect; the state settles at `unhealthy`.
    fn interrupt_bootstrap(
        &self,
        inst: &mut ManagedInstance,
        conn: &ConnectionInfo,
        attempt: u32,
    ) -> ClauseError {
        let message = "startup interrupted by shutdown".to_owned();
        inst.last_error = Some(message.clone());
        inst.last_health_check = Some(Utc::now());
        if inst.transition(InstanceState::Unhealthy).is_err() {
            inst.state = InstanceState::Unhealthy;
        }
        self.publish(inst);
        info!(container = %conn.container_name, attempt, "bootstrap interrupted");
        ClauseError::InstanceFailed {
            container: conn.container_name.clone(),
            message,
        }
    }

    /// The container died before answering: keep its last words, remove it.
    async fn abort_bootstrap(
        &self,
        inst: &mut ManagedInstance,
        conn: &ConnectionInfo,
        message: String,
    ) -> ClauseError {
        let tail = self
            .engine
            .logs(&conn.container_id, self.config.log_tail)
            .await
            .unwrap_or_default();
        let message = if tail.trim().is_empty() {
            message
        } else {
            format!("{message}; last log lines:\n{}", tail.trim_end())
        };
        self.remove_quietly(&conn.container_id).await;
        self.drop_container(inst);
        self.fail(inst, message)
    }

    // ── Teardown ──

    /// Stop and remove the container. Already absent counts as success.
    ///
    /// Runs on its own task for the same reason as [`Self::ensure`].
    pub async fn teardown(self: &Arc<Self>) -> Result<(), ClauseError> {
        let this = Arc::clone(self);
        match tokio::spawn(async move { this.teardown_inner().await }).await {
            Ok(result) => result,
            Err(e) => Err(ClauseError::Internal(format!("teardown task failed: {e}"))),
        }
    }

    async fn teardown_inner(&self) -> Result<(), ClauseError> {
        let mut inst = self.instance.lock().await;
        self.recover_stuck(&mut inst);
        let name = inst.spec.name.clone();

        let target = match inst.id.clone() {
            Some(id) => Some(id),
            None => match self.engine.find_by_name(&name).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(container = %name, error = %e, "cannot look up container; nothing to tear down");
                    None
                }
            },
        };

        let Some(id) = target else {
            if inst.state == InstanceState::Failed {
                self.set_state(&mut inst, InstanceState::Absent)?;
            }
            debug!(container = %name, "teardown: already absent");
            return Ok(());
        };

        let owned = inst.id.is_some();
        if owned {
            self.set_state(&mut inst, InstanceState::Stopping)?;
        }

        match self.engine.stop(&id, self.config.stop_grace).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e @ EngineError::Unavailable(_)) => {
                return Err(self.fail_teardown(&mut inst, owned, e));
            }
            Err(e) => warn!(container = %name, error = %e, "graceful stop failed; forcing removal"),
        }

        match self.engine.remove(&id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(self.fail_teardown(&mut inst, owned, e)),
        }

        self.drop_container(&mut inst);
        inst.last_error = None;
        if owned {
            self.set_state(&mut inst, InstanceState::Stopped)?;
        } else {
            self.publish(&inst);
        }
        info!(container = %name, id = %id, "container stopped and removed");
        Ok(())
    }

    fn fail_teardown(&self, inst: &mut ManagedInstance, owned: bool, e: EngineError) -> ClauseError {
        error!(container = %inst.spec.name, error = %e, "teardown failed");
        inst.last_error = Some(e.to_string());
        if owned {
            let _ = inst.transition(InstanceState::Failed);
        }
        self.publish(inst);
        e.into_clause_error(&inst.spec.name)
    }

    // ── Monitoring ──

    /// One periodic liveness probe, applied with hysteresis.
    ///
    /// The probe itself runs without the lifecycle lock; its result is
    /// dropped if the instance was recreated or torn down meanwhile.
    /// Returns the new state when it changed.
    pub async fn probe_once(&self) -> Option<InstanceState> {
        let snap = self.snapshot();
        if !snap.state.is_running() {
            return None;
        }
        let conn = snap.connection(&self.config.endpoint_host)?;
        let outcome = self.interpreter.ping(&conn, self.config.probe_timeout).await;

        let mut inst = self.instance.lock().await;
        if inst.generation != snap.generation || !inst.state.is_running() {
            debug!(container = %conn.container_name, "discarding stale probe result");
            return None;
        }
        let changed = inst.record_probe(outcome.is_ok(), self.config.unhealthy_threshold, Utc::now());
        match &outcome {
            Ok(_) => inst.last_error = None,
            Err(e) => inst.last_error = Some(e.to_string()),
        }
        self.publish(&inst);

        match (changed, &outcome) {
            (Some(InstanceState::Unhealthy), Err(e)) => warn!(
                container = %conn.container_name,
                failures = inst.consecutive_failures,
                error = %e,
                "instance marked unhealthy"
            ),
            (Some(InstanceState::Healthy), _) => {
                info!(container = %conn.container_name, "instance recovered")
            }
            (None, Err(e)) => debug!(
                container = %conn.container_name,
                failures = inst.consecutive_failures,
                error = %e,
                "probe failed"
            ),
            _ => {}
        }
        changed
    }

    // ── Logs ──

    pub async fn logs(&self, tail: usize) -> Result<String, ClauseError> {
        let name = self.container_name();
        let id = match self.snapshot().id {
            Some(id) => id,
            None => self
                .engine
                .find_by_name(&name)
                .await
                .map_err(|e| e.into_clause_error(&name))?
                .ok_or_else(|| ClauseError::InstanceNotFound {
                    container: name.clone(),
                })?,
        };
        self.engine
            .logs(&id, tail)
            .await
            .map_err(|e| e.into_clause_error(&name))
    }

    // ── State helpers ──

    fn publish(&self, inst: &ManagedInstance) {
        self.snapshot.send_replace(inst.clone());
    }

    fn set_state(&self, inst: &mut ManagedInstance, next: InstanceState) -> Result<(), ClauseError> {
        let from = inst.state;
        inst.transition(next)
            .map_err(|e| ClauseError::Internal(e.to_string()))?;
        if from != next {
            debug!(container = %inst.spec.name, %from, to = %next, "instance transition");
        }
        self.publish(inst);
        Ok(())
    }

    /// A transient state can only be observed here if the task driving it
    /// panicked. Settle it so the next operation starts from a known place.
    fn recover_stuck(&self, inst: &mut ManagedInstance) {
        if !inst.state.is_transient() {
            return;
        }
        let settled = if inst.id.is_some() {
            InstanceState::Unhealthy
        } else {
            InstanceState::Failed
        };
        warn!(container = %inst.spec.name, from = %inst.state, to = %settled, "settling interrupted transition");
        inst.state = settled;
        self.publish(inst);
    }

    fn drop_container(&self, inst: &mut ManagedInstance) {
        inst.id = None;
        inst.consecutive_failures = 0;
        inst.generation += 1;
    }

    fn fail(&self, inst: &mut ManagedInstance, message: String) -> ClauseError {
        error!(container = %inst.spec.name, %message, "instance failed");
        inst.last_error = Some(message.clone());
        if inst.transition(InstanceState::Failed).is_err() {
            inst.state = InstanceState::Failed;
        }
        self.publish(inst);
        ClauseError::InstanceFailed {
            container: inst.spec.name.clone(),
            message,
        }
    }

    /// Unrecoverable engine error while creating or starting.
    fn fail_engine(&self, inst: &mut ManagedInstance, e: EngineError) -> ClauseError {
        match e {
            EngineError::Unavailable(_) => {
                inst.last_error = Some(e.to_string());
                let _ = inst.transition(InstanceState::Failed);
                self.publish(inst);
                e.into_clause_error(&inst.spec.name)
            }
            other => self.fail(inst, other.to_string()),
        }
    }

    fn note_engine_error(&self, inst: &mut ManagedInstance, e: EngineError) -> ClauseError {
        warn!(container = %inst.spec.name, error = %e, "engine call failed");
        inst.last_error = Some(e.to_string());
        self.publish(inst);
        e.into_clause_error(&inst.spec.name)
    }

    async fn remove_quietly(&self, id: &str) {
        match self.engine.remove(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(id, error = %e, "best-effort container removal failed"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mock::{FakeEngine, ScriptedInterpreter};
    use clause_core::errors::ErrorKind;
    use clause_core::instance::{AuthMode, BindMount};
    use std::collections::BTreeMap;
    use std::path::Path;

    pub(crate) fn spec_in(dir: &Path) -> ContainerSpec {
        ContainerSpec {
            image: "swipl/swish:latest".into(),
            name: "clause-test".into(),
            host_port: 3050,
            container_port: 3050,
            mounts: vec![BindMount {
                host_path: dir.join("swish-data"),
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

    pub(crate) fn fast_config() -> LifecycleConfig {
        LifecycleConfig {
            poll_interval: Duration::from_millis(5),
            poll_max_attempts: 5,
            probe_timeout: Duration::from_millis(50),
            unhealthy_threshold: 3,
            stop_grace: Duration::ZERO,
            pull_image: true,
            log_tail: 10,
            endpoint_host: "127.0.0.1".into(),
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        engine: Arc<FakeEngine>,
        interp: Arc<ScriptedInterpreter>,
        mgr: Arc<LifecycleManager>,
    }

    fn harness_with(engine: FakeEngine) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(engine);
        let interp = Arc::new(ScriptedInterpreter::new());
        let mgr = LifecycleManager::new(
            engine.clone(),
            interp.clone(),
            spec_in(dir.path()),
            fast_config(),
        );
        Harness {
            _dir: dir,
            engine,
            interp,
            mgr,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeEngine::new())
    }

    #[tokio::test]
    async fn ensure_creates_and_reports_healthy() {
        let h = harness();
        let conn = h.mgr.ensure().await.unwrap();
        assert_eq!(conn.base_url, "http://127.0.0.1:3050");
        assert_eq!(conn.container_name, "clause-test");
        let snap = h.mgr.snapshot();
        assert_eq!(snap.state, InstanceState::Healthy);
        assert_eq!(snap.id.as_deref(), Some(conn.container_id.as_str()));
        assert!(snap.last_health_check.is_some());
        assert_eq!(h.engine.create_count(), 1);
        assert_eq!(h.engine.start_count(), 1);
        assert_eq!(h.engine.pull_count(), 1);
        assert!(h._dir.path().join("swish-data/knowledge").is_dir());
    }

    #[tokio::test]
    async fn sequential_ensure_is_a_noop() {
        let h = harness();
        let first = h.mgr.ensure().await.unwrap();
        let second = h.mgr.ensure().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.engine.create_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_ensures_create_one_container() {
        let h = harness_with(FakeEngine::new().with_create_delay(Duration::from_millis(30)));
        let mut tasks = Vec::new();
        for _ in 0..10 {
            let mgr = h.mgr.clone();
            tasks.push(tokio::spawn(async move { mgr.ensure().await }));
        }
        let mut ids = Vec::new();
        for t in tasks {
            ids.push(t.await.unwrap().unwrap().container_id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(h.engine.create_count(), 1);
        assert_eq!(h.engine.container_count(), 1);
    }

    #[tokio::test]
    async fn engine_unavailable_is_not_retryable() {
        let h = harness();
        h.engine.set_unavailable(true);
        let err = h.mgr.ensure().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EngineUnavailable);
        assert!(!err.is_retryable());
        assert_eq!(h.engine.create_count(), 0);
        assert_eq!(h.mgr.snapshot().state, InstanceState::Absent);
    }

    #[tokio::test]
    async fn hung_engine_is_reported_unavailable() {
        let h = harness();
        h.engine.set_ping_hangs(true);
        let err = h.mgr.ensure().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EngineUnavailable);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("timed out"));
        assert_eq!(h.engine.create_count(), 0);
        assert_eq!(h.mgr.snapshot().state, InstanceState::Absent);
    }

    #[tokio::test]
    async fn shutdown_interrupts_bootstrap_so_teardown_collects_container() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let interp = Arc::new(ScriptedInterpreter::new());
        interp.set_healthy(false);
        let mgr = LifecycleManager::new(
            engine.clone(),
            interp.clone(),
            spec_in(dir.path()),
            LifecycleConfig {
                poll_interval: Duration::from_millis(200),
                poll_max_attempts: 30,
                ..fast_config()
            },
        );

        let ensuring = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.ensure().await })
        };
        let mut rx = mgr.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|i| i.state == InstanceState::Starting),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(engine.running_count(), 1);

        mgr.begin_shutdown();
        tokio::time::timeout(Duration::from_secs(1), mgr.teardown())
            .await
            .expect("teardown must not wait for the bootstrap poll")
            .unwrap();
        assert_eq!(engine.running_count(), 0);
        assert_eq!(engine.container_count(), 0);
        assert_eq!(mgr.snapshot().state, InstanceState::Stopped);

        let err = ensuring.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InstanceFailed);
        assert!(err.to_string().contains("interrupted by shutdown"));

        assert!(mgr.ensure().await.is_err());
        assert_eq!(engine.create_count(), 1);
    }

    #[tokio::test]
    async fn start_timeout_leaves_unhealthy_and_reprobe_recovers() {
        let h = harness();
        h.interp.set_healthy(false);
        let err = h.mgr.ensure().await.unwrap_err();
        match &err {
            ClauseError::InstanceStartTimeout {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(*attempts, 5);
                assert!(last_error.as_deref().unwrap().contains("refused"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_retryable());
        assert_eq!(h.mgr.snapshot().state, InstanceState::Unhealthy);
        assert_eq!(h.interp.ping_count(), 5);

        h.interp.set_healthy(true);
        h.mgr.ensure().await.unwrap();
        assert_eq!(h.mgr.snapshot().state, InstanceState::Healthy);
        assert_eq!(h.engine.create_count(), 1);
    }

    #[tokio::test]
    async fn exit_during_bootstrap_fails_with_logs_and_cleans_up() {
        let h = harness();
        h.engine.exit_on_start(1);
        h.interp.set_healthy(false);
        let err = h.mgr.ensure().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InstanceFailed);
        let msg = err.to_string();
        assert!(msg.contains("code 1"), "{msg}");
        assert!(msg.contains("could not bind port"), "{msg}");
        assert_eq!(h.engine.container_count(), 0);
        let snap = h.mgr.snapshot();
        assert_eq!(snap.state, InstanceState::Failed);
        assert!(snap.id.is_none());
    }

    #[tokio::test]
    async fn start_failure_is_cleaned_up_and_retried_next_time() {
        let h = harness();
        h.engine.fail_next_start("port is already allocated");
        let err = h.mgr.ensure().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InstanceFailed);
        assert!(err.to_string().contains("port is already allocated"));
        assert_eq!(h.engine.container_count(), 0);
        assert_eq!(h.mgr.snapshot().state, InstanceState::Failed);

        h.mgr.ensure().await.unwrap();
        assert_eq!(h.engine.create_count(), 2);
        assert_eq!(h.mgr.snapshot().state, InstanceState::Healthy);
    }

    #[tokio::test]
    async fn teardown_is_idempotent_and_leaves_nothing_running() {
        let h = harness();
        h.mgr.teardown().await.unwrap();

        let conn = h.mgr.ensure().await.unwrap();
        h.mgr.teardown().await.unwrap();
        h.mgr.teardown().await.unwrap();

        assert_eq!(h.engine.container_count(), 0);
        assert!(h.engine.container(&conn.container_id).is_none());
        let snap = h.mgr.snapshot();
        assert_eq!(snap.state, InstanceState::Stopped);
        assert!(snap.id.is_none());
    }

    #[tokio::test]
    async fn ensure_after_teardown_creates_fresh_container() {
        let h = harness();
        let first = h.mgr.ensure().await.unwrap();
        h.mgr.teardown().await.unwrap();
        let second = h.mgr.ensure().await.unwrap();
        assert_ne!(first.container_id, second.container_id);
        assert_eq!(h.engine.container_count(), 1);
    }

    #[tokio::test]
    async fn adopts_running_container_with_same_name() {
        let h = harness();
        let existing = h.engine.insert_existing("clause-test", true);
        let conn = h.mgr.ensure().await.unwrap();
        assert_eq!(conn.container_id, existing);
        assert_eq!(h.engine.create_count(), 0);
        assert_eq!(h.mgr.snapshot().state, InstanceState::Healthy);
    }

    #[tokio::test]
    async fn replaces_stopped_container_with_same_name() {
        let h = harness();
        let stale = h.engine.insert_existing("clause-test", false);
        let conn = h.mgr.ensure().await.unwrap();
        assert_ne!(conn.container_id, stale);
        assert_eq!(h.engine.create_count(), 1);
        assert_eq!(h.engine.container_count(), 1);
        assert!(h.engine.container(&stale).is_none());
    }

    #[tokio::test]
    async fn teardown_removes_unowned_container_by_name() {
        let h = harness();
        h.engine.insert_existing("clause-test", true);
        h.mgr.teardown().await.unwrap();
        assert_eq!(h.engine.container_count(), 0);
    }

    #[tokio::test]
    async fn probe_hysteresis_needs_repeated_failures() {
        let h = harness();
        h.mgr.ensure().await.unwrap();

        h.interp.set_healthy(false);
        assert_eq!(h.mgr.probe_once().await, None);
        assert_eq!(h.mgr.probe_once().await, None);
        assert_eq!(h.mgr.snapshot().state, InstanceState::Healthy);
        assert_eq!(h.mgr.probe_once().await, Some(InstanceState::Unhealthy));
        assert!(h.mgr.snapshot().last_error.is_some());

        h.interp.set_healthy(true);
        assert_eq!(h.mgr.probe_once().await, Some(InstanceState::Healthy));
        let snap = h.mgr.snapshot();
        assert_eq!(snap.consecutive_failures, 0);
        assert!(snap.last_error.is_none());
    }

    #[tokio::test]
    async fn probe_skips_instance_that_is_not_running() {
        let h = harness();
        assert_eq!(h.mgr.probe_once().await, None);
        assert_eq!(h.interp.ping_count(), 0);
    }

    #[tokio::test]
    async fn dead_container_is_recreated_on_next_ensure() {
        let h = harness();
        let first = h.mgr.ensure().await.unwrap();
        h.engine.kill(&first.container_id, 137);
        h.interp.set_healthy(false);
        for _ in 0..3 {
            h.mgr.probe_once().await;
        }
        assert_eq!(h.mgr.snapshot().state, InstanceState::Unhealthy);

        h.interp.set_healthy(true);
        let second = h.mgr.ensure().await.unwrap();
        assert_ne!(first.container_id, second.container_id);
        assert_eq!(h.engine.create_count(), 2);
        assert_eq!(h.engine.container_count(), 1);
    }

    #[tokio::test]
    async fn cancelled_ensure_still_settles() {
        let h = harness();
        h.interp.set_healthy(false);
        let mut rx = h.mgr.subscribe();

        let cancelled = tokio::time::timeout(Duration::from_millis(10), h.mgr.ensure()).await;
        assert!(cancelled.is_err());

        let settled = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|i| !i.state.is_transient() && i.state != InstanceState::Absent),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(settled.state, InstanceState::Unhealthy);
        assert_eq!(h.engine.container_count(), 1);
    }

    #[tokio::test]
    async fn logs_without_instance_is_not_found() {
        let h = harness();
        let err = h.mgr.logs(10).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InstanceNotFound);

        h.mgr.ensure().await.unwrap();
        let logs = h.mgr.logs(10).await.unwrap();
        assert!(logs.contains("Started server"));
    }

    #[tokio::test]
    async fn probe_target_falls_back_to_configured_endpoint() {
        let h = harness();
        let target = h.mgr.probe_target();
        assert_eq!(target.container_id, "");
        assert_eq!(target.base_url, h.mgr.base_url());
        assert!(h.mgr.connection().is_none());
    }
}
