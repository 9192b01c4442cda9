//! In-memory test doubles for the container engine and the interpreter.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use clause_core::engine::{ContainerEngine, EngineError, InspectState};
use clause_core::instance::{ConnectionInfo, ContainerSpec};
use clause_core::interpreter::{Interpreter, InterpreterError};
use clause_core::query::{QueryRequest, QueryResult};
use parking_lot::Mutex;

#[derive(Clone, Debug)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub exit_code: Option<i64>,
    pub logs: String,
}

#[derive(Default)]
struct EngineState {
    containers: HashMap<String, FakeContainer>,
    next_id: u64,
    unavailable: bool,
    ping_hangs: bool,
    fail_start: Option<String>,
    exit_on_start: Option<i64>,
}

/// Container engine that keeps containers in a map.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
    create_delay: Duration,
    creates: AtomicU32,
    starts: AtomicU32,
    stops: AtomicU32,
    removes: AtomicU32,
    pulls: AtomicU32,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `create` yield for a while, widening race windows in tests.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// `ping` times out the way a wedged daemon does.
    pub fn set_ping_hangs(&self, hangs: bool) {
        self.state.lock().ping_hangs = hangs;
    }

    pub fn fail_next_start(&self, message: impl Into<String>) {
        self.state.lock().fail_start = Some(message.into());
    }

    /// Started containers exit immediately with `code`.
    pub fn exit_on_start(&self, code: i64) {
        self.state.lock().exit_on_start = Some(code);
    }

    /// Seed a container that existed before the manager started.
    pub fn insert_existing(&self, name: &str, running: bool) -> String {
        let mut st = self.state.lock();
        st.next_id += 1;
        let id = format!("pre{:09}", st.next_id);
        st.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: name.to_owned(),
                running,
                exit_code: (!running).then_some(0),
                logs: String::new(),
            },
        );
        id
    }

    /// Simulate the container dying underneath the manager.
    pub fn kill(&self, id: &str, code: i64) {
        if let Some(c) = self.state.lock().containers.get_mut(id) {
            c.running = false;
            c.exit_code = Some(code);
        }
    }

    pub fn create_count(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> u32 {
        self.removes.load(Ordering::SeqCst)
    }

    pub fn pull_count(&self) -> u32 {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().containers.len()
    }

    pub fn running_count(&self) -> usize {
        self.state.lock().containers.values().filter(|c| c.running).count()
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.state.lock().containers.get(id).cloned()
    }

    fn check_available(&self) -> Result<(), EngineError> {
        if self.state.lock().unavailable {
            Err(EngineError::Unavailable("fake daemon is down".into()))
        } else {
            Ok(())
        }
    }

    fn resolve(st: &EngineState, key: &str) -> Option<String> {
        if st.containers.contains_key(key) {
            return Some(key.to_owned());
        }
        st.containers
            .values()
            .find(|c| c.name == key)
            .map(|c| c.id.clone())
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        if self.state.lock().ping_hangs {
            return Err(EngineError::Timeout {
                op: "ping".into(),
                timeout_ms: 10_000,
            });
        }
        self.check_available()
    }

    async fn pull(&self, _image: &str) -> Result<(), EngineError> {
        self.check_available()?;
        self.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        self.check_available()?;
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        let mut st = self.state.lock();
        if st.containers.values().any(|c| c.name == spec.name) {
            return Err(EngineError::Conflict(format!(
                "container name {:?} is already in use",
                spec.name
            )));
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        st.next_id += 1;
        let id = format!("fake{:012}", st.next_id);
        st.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: spec.name.clone(),
                running: false,
                exit_code: None,
                logs: String::new(),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), EngineError> {
        self.check_available()?;
        self.starts.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state.lock();
        if let Some(message) = st.fail_start.take() {
            return Err(EngineError::Command {
                op: "start".into(),
                message,
            });
        }
        let exit = st.exit_on_start;
        let c = st
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_owned()))?;
        match exit {
            Some(code) => {
                c.running = false;
                c.exit_code = Some(code);
                c.logs = "Welcome to SWISH\nERROR: could not bind port\n".into();
            }
            None => {
                c.running = true;
                c.exit_code = None;
                c.logs = "Welcome to SWISH\n% Started server at http://localhost:3050/\n".into();
            }
        }
        Ok(())
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<(), EngineError> {
        self.check_available()?;
        self.stops.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state.lock();
        let key = Self::resolve(&st, id).ok_or_else(|| EngineError::NotFound(id.to_owned()))?;
        if let Some(c) = st.containers.get_mut(&key) {
            c.running = false;
            c.exit_code = Some(0);
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), EngineError> {
        self.check_available()?;
        let mut st = self.state.lock();
        let key = Self::resolve(&st, id).ok_or_else(|| EngineError::NotFound(id.to_owned()))?;
        st.containers.remove(&key);
        self.removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<InspectState, EngineError> {
        self.check_available()?;
        let st = self.state.lock();
        let key = Self::resolve(&st, id).ok_or_else(|| EngineError::NotFound(id.to_owned()))?;
        let c = &st.containers[&key];
        Ok(InspectState {
            running: c.running,
            exit_code: c.exit_code,
            status: if c.running { "running" } else { "exited" }.into(),
        })
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<String>, EngineError> {
        self.check_available()?;
        let st = self.state.lock();
        Ok(st
            .containers
            .values()
            .find(|c| c.name == name)
            .map(|c| c.id.clone()))
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<String, EngineError> {
        self.check_available()?;
        let st = self.state.lock();
        let key = Self::resolve(&st, id).ok_or_else(|| EngineError::NotFound(id.to_owned()))?;
        let lines: Vec<&str> = st.containers[&key].logs.lines().collect();
        let from = lines.len().saturating_sub(tail);
        Ok(lines[from..].join("\n"))
    }
}

/// Interpreter whose liveness and answers are scripted by the test.
pub struct ScriptedInterpreter {
    healthy: AtomicBool,
    ping_failures: Mutex<VecDeque<InterpreterError>>,
    answers: Mutex<VecDeque<Result<QueryResult, InterpreterError>>>,
    requests: Mutex<Vec<QueryRequest>>,
    pings: AtomicU32,
    ping_delay: Mutex<Option<Duration>>,
    run_delay: Mutex<Option<Duration>>,
}

impl Default for ScriptedInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedInterpreter {
    /// Healthy, answering `Success` to everything.
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            ping_failures: Mutex::new(VecDeque::new()),
            answers: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            pings: AtomicU32::new(0),
            ping_delay: Mutex::new(None),
            run_delay: Mutex::new(None),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// The next `n` pings fail with a refused connection.
    pub fn fail_pings(&self, n: usize) {
        let mut q = self.ping_failures.lock();
        for _ in 0..n {
            q.push_back(InterpreterError::Unreachable("connection refused".into()));
        }
    }

    pub fn set_ping_delay(&self, delay: Duration) {
        *self.ping_delay.lock() = Some(delay);
    }

    /// Every `run` takes this long before answering.
    pub fn set_run_delay(&self, delay: Duration) {
        *self.run_delay.lock() = Some(delay);
    }

    pub fn push_answer(&self, answer: Result<QueryResult, InterpreterError>) {
        self.answers.lock().push_back(answer);
    }

    pub fn requests(&self) -> Vec<QueryRequest> {
        self.requests.lock().clone()
    }

    pub fn ping_count(&self) -> u32 {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Interpreter for ScriptedInterpreter {
    async fn ping(
        &self,
        _conn: &ConnectionInfo,
        timeout: Duration,
    ) -> Result<Duration, InterpreterError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let delay = *self.ping_delay.lock();
        if let Some(delay) = delay {
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(InterpreterError::Timeout(timeout));
            }
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.ping_failures.lock().pop_front() {
            return Err(err);
        }
        if self.healthy.load(Ordering::SeqCst) {
            Ok(Duration::from_millis(1))
        } else {
            Err(InterpreterError::Unreachable("connection refused".into()))
        }
    }

    async fn run(
        &self,
        _conn: &ConnectionInfo,
        request: &QueryRequest,
    ) -> Result<QueryResult, InterpreterError> {
        self.requests.lock().push(request.clone());
        let delay = *self.run_delay.lock();
        if let Some(delay) = delay {
            if delay > request.timeout {
                tokio::time::sleep(request.timeout).await;
                return Err(InterpreterError::Timeout(request.timeout));
            }
            tokio::time::sleep(delay).await;
        }
        self.answers
            .lock()
            .pop_front()
            .unwrap_or(Ok(QueryResult::Success))
    }
}
