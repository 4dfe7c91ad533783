//! In-process runtime that keeps containers in a map. Serves local demos
//! without an engine and lets tests inject faults.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::types::{ContainerSpec, ObservedState, RuntimeAdapter, RuntimeError, RuntimeStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeOp {
    Pull,
    Create,
    Start,
    Stop,
    Inspect,
    Logs,
}

#[derive(Debug, Clone)]
pub struct MemoryContainer {
    pub spec: ContainerSpec,
    pub running: bool,
    pub ready: bool,
    pub exit_code: Option<i64>,
    pub logs: Vec<String>,
}

#[derive(Default)]
struct MemoryState {
    containers: HashMap<String, MemoryContainer>,
    failures: HashMap<RuntimeOp, VecDeque<RuntimeError>>,
    calls: HashMap<RuntimeOp, usize>,
    unreachable: bool,
    delay: Duration,
}

#[derive(Default)]
pub struct MemoryRuntime {
    state: Mutex<MemoryState>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        MemoryRuntime::default()
    }

    /// Queues `err` as the result of the next call to `op`.
    pub async fn fail_next(&self, op: RuntimeOp, err: RuntimeError) {
        self.state
            .lock()
            .await
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub async fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().await.unreachable = unreachable;
    }

    /// Every call sleeps this long before doing anything.
    pub async fn set_delay(&self, delay: Duration) {
        self.state.lock().await.delay = delay;
    }

    /// Simulates the container process exiting on its own.
    pub async fn exit(&self, handle: &str, code: i64) {
        if let Some(container) = self.state.lock().await.containers.get_mut(handle) {
            container.running = false;
            container.ready = false;
            container.exit_code = Some(code);
            container.logs.push(format!("process exited with code {}", code));
        }
    }

    pub async fn set_ready(&self, handle: &str, ready: bool) {
        if let Some(container) = self.state.lock().await.containers.get_mut(handle) {
            container.ready = ready;
        }
    }

    pub async fn container(&self, handle: &str) -> Option<MemoryContainer> {
        self.state.lock().await.containers.get(handle).cloned()
    }

    pub async fn running_count(&self) -> usize {
        self.state
            .lock()
            .await
            .containers
            .values()
            .filter(|c| c.running)
            .count()
    }

    pub async fn calls(&self, op: RuntimeOp) -> usize {
        self.state
            .lock()
            .await
            .calls
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    async fn enter(&self, op: RuntimeOp) -> Result<(), RuntimeError> {
        let delay = {
            let mut state = self.state.lock().await;
            *state.calls.entry(op).or_default() += 1;
            state.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if state.unreachable {
            return Err(RuntimeError::Transient("engine unreachable".to_string()));
        }
        match state.failures.get_mut(&op).and_then(|queue| queue.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RuntimeAdapter for MemoryRuntime {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        self.enter(RuntimeOp::Pull).await?;
        debug!(image = reference, "Pretending to pull image");
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.enter(RuntimeOp::Create).await?;
        let mut state = self.state.lock().await;

        // a same-name container of the same owner is stale and gets replaced
        let clash = state
            .containers
            .iter()
            .find(|(_, c)| c.spec.name == spec.name)
            .map(|(handle, c)| (handle.clone(), spec.same_owner(&c.spec.labels)));
        match clash {
            Some((handle, true)) => {
                state.containers.remove(&handle);
            }
            Some((_, false)) => {
                return Err(RuntimeError::Failed(format!(
                    "container name {} is held by another owner",
                    spec.name
                )));
            }
            None => {}
        }

        let taken = state
            .containers
            .values()
            .filter(|c| c.running)
            .flat_map(|c| c.spec.port_map.iter().map(|(_, host)| *host))
            .find(|host| spec.port_map.iter().any(|(_, wanted)| wanted == host));
        if let Some(port) = taken {
            return Err(RuntimeError::Failed(format!(
                "host port {} is already allocated",
                port
            )));
        }

        let handle = uuid::Uuid::new_v4().simple().to_string();
        state.containers.insert(
            handle.clone(),
            MemoryContainer {
                spec: spec.clone(),
                running: false,
                ready: false,
                exit_code: None,
                logs: vec![format!("created {}", spec.name)],
            },
        );
        debug!(name = %spec.name, %handle, "Created in-memory container");
        Ok(handle)
    }

    async fn start(&self, handle: &str) -> Result<(), RuntimeError> {
        self.enter(RuntimeOp::Start).await?;
        let mut state = self.state.lock().await;
        let container = state
            .containers
            .get_mut(handle)
            .ok_or_else(|| RuntimeError::NotFound(handle.to_string()))?;
        container.running = true;
        container.ready = true;
        container.exit_code = None;
        for env in &container.spec.env {
            container.logs.push(format!("env {}", env));
        }
        container.logs.push("listening".to_string());
        Ok(())
    }

    async fn stop(&self, handle: &str) -> Result<(), RuntimeError> {
        self.enter(RuntimeOp::Stop).await?;
        self.state
            .lock()
            .await
            .containers
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(handle.to_string()))
    }

    async fn inspect(&self, handle: &str) -> Result<RuntimeStatus, RuntimeError> {
        self.enter(RuntimeOp::Inspect).await?;
        let state = self.state.lock().await;
        let container = state
            .containers
            .get(handle)
            .ok_or_else(|| RuntimeError::NotFound(handle.to_string()))?;

        let observed = match (container.running, container.exit_code) {
            (true, _) => ObservedState::Running,
            (false, Some(_)) => ObservedState::Exited,
            (false, None) => ObservedState::Created,
        };
        Ok(RuntimeStatus {
            state: observed,
            ready: container.running && container.ready,
            exit_code: container.exit_code,
        })
    }

    async fn logs(&self, handle: &str, tail: usize) -> Result<String, RuntimeError> {
        self.enter(RuntimeOp::Logs).await?;
        let state = self.state.lock().await;
        let container = state
            .containers
            .get(handle)
            .ok_or_else(|| RuntimeError::NotFound(handle.to_string()))?;

        let skip = container.logs.len().saturating_sub(tail);
        Ok(container.logs[skip..].join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::runtime::types::{IMAGE_LABEL, TEAM_LABEL};

    fn owned_spec(name: &str, team: &str, host: u16) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image_reference: "example/sim:latest".to_string(),
            env: vec![format!("SIM_2000={}", host)],
            port_map: vec![(2000, host)],
            labels: HashMap::from([
                (TEAM_LABEL.to_string(), team.to_string()),
                (IMAGE_LABEL.to_string(), "sim".to_string()),
            ]),
        }
    }

    fn spec(name: &str, host: u16) -> ContainerSpec {
        let team = name.split('-').next().unwrap_or(name);
        owned_spec(name, team, host)
    }

    #[tokio::test]
    async fn same_name_replaces_only_the_same_owner() {
        let runtime = MemoryRuntime::new();
        let first = runtime.create(&spec("alpha-sim", 30000)).await.unwrap();
        let second = runtime.create(&spec("alpha-sim", 30001)).await.unwrap();
        assert!(runtime.container(&first).await.is_none());
        runtime.start(&second).await.unwrap();

        let err = runtime
            .create(&owned_spec("alpha-sim", "intruder", 30002))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Failed(_)));
        assert!(runtime.container(&second).await.unwrap().running);
    }

    #[tokio::test]
    async fn create_start_inspect_stop() {
        let runtime = MemoryRuntime::new();
        let handle = runtime.create(&spec("alpha-sim", 30000)).await.unwrap();
        assert_eq!(
            runtime.inspect(&handle).await.unwrap().state,
            ObservedState::Created
        );

        runtime.start(&handle).await.unwrap();
        let status = runtime.inspect(&handle).await.unwrap();
        assert_eq!(status.state, ObservedState::Running);
        assert!(status.ready);

        let logs = runtime.logs(&handle, 2).await.unwrap();
        assert_eq!(logs, "env SIM_2000=30000\nlistening");

        runtime.stop(&handle).await.unwrap();
        assert!(matches!(
            runtime.inspect(&handle).await,
            Err(RuntimeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn host_port_conflicts_are_rejected() {
        let runtime = MemoryRuntime::new();
        let handle = runtime.create(&spec("alpha-sim", 30000)).await.unwrap();
        runtime.start(&handle).await.unwrap();

        let err = runtime.create(&spec("beta-sim", 30000)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Failed(_)));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_once() {
        let runtime = MemoryRuntime::new();
        runtime
            .fail_next(RuntimeOp::Create, RuntimeError::Transient("reset".into()))
            .await;

        assert!(runtime.create(&spec("alpha-sim", 30000)).await.is_err());
        assert!(runtime.create(&spec("alpha-sim", 30000)).await.is_ok());
        assert_eq!(runtime.calls(RuntimeOp::Create).await, 2);
    }

    #[tokio::test]
    async fn exit_is_observed() {
        let runtime = MemoryRuntime::new();
        let handle = runtime.create(&spec("alpha-sim", 30000)).await.unwrap();
        runtime.start(&handle).await.unwrap();
        runtime.exit(&handle, 1).await;

        let status = runtime.inspect(&handle).await.unwrap();
        assert_eq!(status.state, ObservedState::Exited);
        assert_eq!(status.exit_code, Some(1));
        assert_eq!(runtime.running_count().await, 0);
    }
}
