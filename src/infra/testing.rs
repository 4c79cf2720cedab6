//! In-memory doubles for the runtime, fetcher and probe.
//!
//! They record every call and let tests inject failures without a container
//! engine or network.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::fetch::{FetchFailure, SourceFetcher};
use super::probe::{HealthProbe, ProbeOutcome};
use super::runtime::{
    ContainerHealth, ContainerRuntime, ContainerState, ContainerStatus, ExecOutput, RuntimeError,
    ServiceAction, StackHealth, StackSpec,
};
use crate::config::BaseSystemConfig;

#[derive(Debug, Clone)]
struct FakeContainer {
    project: String,
    service: String,
    status: ContainerStatus,
}

#[derive(Default)]
struct FakeState {
    networks: HashSet<String>,
    /// project -> running
    stacks: HashMap<String, bool>,
    containers: HashMap<String, FakeContainer>,
    calls: Vec<String>,
    /// project prefix -> error returned by `up`
    up_failures: Vec<(String, RuntimeError)>,
    /// transient `up` failures left to inject
    transient_up_failures: u32,
    /// project prefixes whose containers never become healthy
    unhealthy: HashSet<String>,
    exec_inputs: Vec<(String, String)>,
}

/// Container runtime double
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    up_delay: Mutex<Option<Duration>>,
    engine_down: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the shared-service containers so `inspect` can see them after `up`
    pub fn with_base_system(config: &BaseSystemConfig) -> Self {
        let fake = Self::new();
        fake.declare_container(&config.project, "traefik", &config.proxy_container);
        fake.declare_container(&config.project, "mysql", &config.mysql_container);
        fake.declare_container(&config.project, "redis", &config.redis_container);
        fake
    }

    pub fn declare_container(&self, project: &str, service: &str, container: &str) {
        self.lock().containers.insert(
            container.to_string(),
            FakeContainer {
                project: project.to_string(),
                service: service.to_string(),
                status: ContainerStatus::NotFound,
            },
        );
    }

    pub fn fail_up_for(&self, project_prefix: &str, error: RuntimeError) {
        self.lock()
            .up_failures
            .push((project_prefix.to_string(), error));
    }

    pub fn fail_up_transient(&self, times: u32) {
        self.lock().transient_up_failures = times;
    }

    pub fn set_unhealthy(&self, project_prefix: &str) {
        self.lock().unhealthy.insert(project_prefix.to_string());
    }

    pub fn set_up_delay(&self, delay: Duration) {
        if let Ok(mut slot) = self.up_delay.lock() {
            *slot = Some(delay);
        }
    }

    /// Make `engine_version` fail as if the daemon were gone
    pub fn set_engine_down(&self, down: bool) {
        self.engine_down.store(down, Ordering::SeqCst);
    }

    /// Externally kill a container, as if it crashed
    pub fn crash_container(&self, container: &str) {
        if let Some(c) = self.lock().containers.get_mut(container) {
            c.status = ContainerStatus::Exited;
        }
    }

    pub fn running_stacks(&self) -> Vec<String> {
        let mut running: Vec<String> = self
            .lock()
            .stacks
            .iter()
            .filter(|(_, running)| **running)
            .map(|(p, _)| p.clone())
            .collect();
        running.sort();
        running
    }

    pub fn existing_stacks(&self) -> Vec<String> {
        let mut all: Vec<String> = self.lock().stacks.keys().cloned().collect();
        all.sort();
        all
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn exec_inputs(&self) -> Vec<(String, String)> {
        self.lock().exec_inputs.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: String) {
        self.lock().calls.push(call);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn network_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        Ok(self.lock().networks.contains(name))
    }

    async fn create_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(format!("create_network {}", name));
        self.lock().networks.insert(name.to_string());
        Ok(())
    }

    async fn up(&self, stack: &StackSpec, cancel: &CancellationToken) -> Result<(), RuntimeError> {
        self.record(format!("up {}", stack.project));

        let delay = self.up_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }

        let mut state = self.lock();
        if state.transient_up_failures > 0 {
            state.transient_up_failures -= 1;
            return Err(RuntimeError::CommandFailed {
                operation: "compose up",
                target: stack.project.clone(),
                message: "Cannot connect to the Docker daemon".to_string(),
                transient: true,
            });
        }
        let failure = state
            .up_failures
            .iter()
            .find(|(prefix, _)| stack.project.starts_with(prefix.as_str()))
            .map(|(_, err)| err.clone());
        if let Some(err) = failure {
            // compose may leave created containers behind on failure
            state.stacks.insert(stack.project.clone(), false);
            return Err(err);
        }

        state.stacks.insert(stack.project.clone(), true);
        for c in state.containers.values_mut() {
            if c.project == stack.project {
                c.status = ContainerStatus::Running;
            }
        }
        Ok(())
    }

    async fn down(&self, stack: &StackSpec, remove_volumes: bool) -> Result<(), RuntimeError> {
        self.record(format!("down {} volumes={}", stack.project, remove_volumes));
        let mut state = self.lock();
        state.stacks.remove(&stack.project);
        for c in state.containers.values_mut() {
            if c.project == stack.project {
                c.status = ContainerStatus::NotFound;
            }
        }
        Ok(())
    }

    async fn control(
        &self,
        stack: &StackSpec,
        service: Option<&str>,
        action: ServiceAction,
    ) -> Result<(), RuntimeError> {
        self.record(format!(
            "{} {}{}",
            action.as_str(),
            stack.project,
            service.map(|s| format!("/{}", s)).unwrap_or_default()
        ));
        let mut state = self.lock();
        if !state.stacks.contains_key(&stack.project) {
            return Err(RuntimeError::NotFound(stack.project.clone()));
        }
        let status = match action {
            ServiceAction::Stop => ContainerStatus::Exited,
            ServiceAction::Start | ServiceAction::Restart => ContainerStatus::Running,
        };
        for c in state.containers.values_mut() {
            if c.project == stack.project && service.map_or(true, |s| s == c.service) {
                c.status = status.clone();
            }
        }
        if service.is_none() {
            state
                .stacks
                .insert(stack.project.clone(), action != ServiceAction::Stop);
        }
        Ok(())
    }

    async fn stack_health(&self, stack: &StackSpec) -> Result<StackHealth, RuntimeError> {
        let state = self.lock();
        let Some(running) = state.stacks.get(&stack.project) else {
            return Ok(StackHealth::default());
        };
        let unhealthy = state
            .unhealthy
            .iter()
            .any(|p| stack.project.starts_with(p.as_str()));
        let container = ContainerState {
            name: format!("{}-app-1", stack.project),
            status: if *running {
                ContainerStatus::Running
            } else {
                ContainerStatus::Exited
            },
            health: Some(if unhealthy {
                ContainerHealth::Starting
            } else {
                ContainerHealth::Healthy
            }),
        };
        Ok(StackHealth {
            containers: vec![container],
        })
    }

    async fn inspect(&self, container: &str) -> Result<ContainerState, RuntimeError> {
        let state = self.lock();
        Ok(match state.containers.get(container) {
            Some(c) => ContainerState {
                name: container.to_string(),
                status: c.status.clone(),
                health: None,
            },
            None => ContainerState::not_found(container),
        })
    }

    async fn attach_network(&self, stack: &StackSpec, network: &str) -> Result<(), RuntimeError> {
        self.record(format!("attach {} {}", stack.project, network));
        let state = self.lock();
        if !state.networks.contains(network) {
            return Err(RuntimeError::NotFound(network.to_string()));
        }
        if !state.stacks.contains_key(&stack.project) {
            return Err(RuntimeError::NotFound(stack.project.clone()));
        }
        Ok(())
    }

    async fn exec(
        &self,
        container: &str,
        command: &[String],
        input: Option<&str>,
    ) -> Result<ExecOutput, RuntimeError> {
        self.record(format!("exec {} {}", container, command.join(" ")));
        let mut state = self.lock();
        let running = state
            .containers
            .get(container)
            .map(|c| c.status == ContainerStatus::Running)
            .unwrap_or(false);
        if !running {
            return Err(RuntimeError::NotFound(container.to_string()));
        }
        state
            .exec_inputs
            .push((container.to_string(), input.unwrap_or_default().to_string()));
        Ok(ExecOutput {
            exit_code: 0,
            output: String::new(),
        })
    }

    async fn logs(&self, stack: &StackSpec, tail: usize) -> Result<String, RuntimeError> {
        if !self.lock().stacks.contains_key(&stack.project) {
            return Err(RuntimeError::NotFound(stack.project.clone()));
        }
        Ok(format!("{} last {} lines", stack.project, tail))
    }

    async fn engine_version(&self) -> Result<String, RuntimeError> {
        if self.engine_down.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable(
                "Cannot connect to the Docker daemon".to_string(),
            ));
        }
        Ok("27.0.3-fake".to_string())
    }
}

/// Source fetcher double; writes a marker file into the destination
#[derive(Default)]
pub struct FakeFetcher {
    transient_failures: AtomicU32,
    permanent_failure: AtomicBool,
    fetches: Mutex<Vec<(String, Option<String>, PathBuf)>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_transient(&self, times: u32) {
        self.transient_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_permanently(&self) {
        self.permanent_failure.store(true, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        if let Ok(mut slot) = self.delay.lock() {
            *slot = Some(delay);
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().map(|f| f.len()).unwrap_or_default()
    }

    pub fn fetches(&self) -> Vec<(String, Option<String>, PathBuf)> {
        self.fetches.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn fetch(
        &self,
        repo: &str,
        branch: Option<&str>,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), FetchFailure> {
        if let Ok(mut fetches) = self.fetches.lock() {
            fetches.push((repo.to_string(), branch.map(String::from), dest.to_path_buf()));
        }

        let delay = self.delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchFailure::permanent("cancelled")),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.permanent_failure.load(Ordering::SeqCst) {
            return Err(FetchFailure::permanent("repository not found"));
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(FetchFailure::transient("Could not resolve host"));
        }

        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| FetchFailure::permanent(e.to_string()))?;
        tokio::fs::write(dest.join("index.html"), repo)
            .await
            .map_err(|e| FetchFailure::permanent(e.to_string()))?;
        Ok(())
    }
}

/// Probe double; ready unless told otherwise
pub struct FakeProbe {
    ready: AtomicBool,
    probes: AtomicUsize,
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self {
            ready: AtomicBool::new(true),
            probes: AtomicUsize::new(0),
        }
    }
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn probe(&self, _domain: &str) -> ProbeOutcome {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.ready.load(Ordering::SeqCst) {
            ProbeOutcome::Ready
        } else {
            ProbeOutcome::NotReady("HTTP 502 Bad Gateway".to_string())
        }
    }
}
