use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::Arc,
    time::SystemTime,
};

use tokio::{
    sync::Mutex,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use super::types::{Operation, Orchestrator, RetryPolicy, StatusReport};
use crate::lib::{
    config::types::{ImageCatalog, ImageDefinition},
    containers::types::{ContainerRecord, ContainerState, RecordKey, Registry},
    error::{ArenaError, ArenaResult},
    ports::types::{PortAllocator, PortBinding},
    runtime::types::{
        ContainerSpec, IMAGE_LABEL, MANAGED_LABEL, ObservedState, RuntimeAdapter, RuntimeError,
        RuntimeStatus, TEAM_LABEL,
    },
};

/// Variables injected into every team container: `TEAMNAME`, one
/// `<PREFIX>_<role>` per declared port and `<PREFIX>_SERVER` for the
/// primary port.
pub fn container_environment(
    team: &str,
    image: &ImageDefinition,
    bindings: &[PortBinding],
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("TEAMNAME".to_string(), team.to_string());
    for binding in bindings {
        let port = binding.host_port.to_string();
        if binding.logical_port == image.primary() {
            env.insert(format!("{}_SERVER", image.env_prefix), port.clone());
        }
        env.insert(
            format!("{}_{}", image.env_prefix, binding.logical_port),
            port,
        );
    }
    env
}

pub fn container_spec(record: &ContainerRecord, image: &ImageDefinition) -> ContainerSpec {
    ContainerSpec {
        name: record.container_name.clone(),
        image_reference: image.reference.clone(),
        env: record
            .environment
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect(),
        port_map: record
            .port_bindings
            .iter()
            .map(|binding| (binding.logical_port, binding.host_port))
            .collect(),
        labels: HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (TEAM_LABEL.to_string(), record.team.clone()),
            (IMAGE_LABEL.to_string(), record.image.clone()),
        ]),
    }
}

/// Caller-facing description of a runtime failure. Engine text stays in
/// the logs.
fn describe(call: &str, err: &RuntimeError) -> String {
    match err {
        RuntimeError::Timeout(_) => format!("{} timed out", call),
        RuntimeError::Transient(_) => format!("{}: container runtime unreachable", call),
        RuntimeError::NotFound(_) => format!("{}: container no longer exists", call),
        RuntimeError::Failed(_) => format!("{} rejected by the container runtime", call),
    }
}

impl StatusReport {
    pub fn fresh(record: ContainerRecord) -> Self {
        StatusReport {
            record,
            observed: None,
            stale: false,
        }
    }
}

impl Orchestrator {
    pub fn new(
        images: Arc<ImageCatalog>,
        registry: Arc<Registry>,
        ports: Arc<PortAllocator>,
        runtime: Arc<dyn RuntimeAdapter>,
        policy: RetryPolicy,
    ) -> Self {
        Orchestrator {
            images,
            registry,
            ports,
            runtime,
            guards: Mutex::new(HashMap::new()),
            policy,
        }
    }

    pub async fn operate(
        &self,
        team: &str,
        image: &str,
        operation: Operation,
    ) -> ArenaResult<StatusReport> {
        match operation {
            Operation::Start => self.start(team, image).await.map(StatusReport::fresh),
            Operation::Stop => self.stop(team, image).await.map(StatusReport::fresh),
            Operation::Status => self.status(team, image).await,
        }
    }

    async fn guard(&self, key: &RecordKey) -> Arc<Mutex<()>> {
        self.guards
            .lock()
            .await
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Runs one runtime call under the timeout, retrying once after the
    /// backoff when it fails transiently.
    async fn call<T, F, Fut>(&self, key: &RecordKey, what: &'static str, op: F) -> Result<T, RuntimeError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RuntimeError>>,
    {
        let mut retried = false;
        loop {
            let result = match timeout(self.policy.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(RuntimeError::Timeout(format!(
                    "{} did not answer within {:?}",
                    what, self.policy.call_timeout
                ))),
            };

            match result {
                Err(err) if err.is_transient() && !retried => {
                    warn!(%key, call = what, %err, "Transient runtime failure, retrying once");
                    retried = true;
                    sleep(self.policy.backoff).await;
                }
                other => return other,
            }
        }
    }

    async fn current(&self, key: &RecordKey) -> ArenaResult<ContainerRecord> {
        self.registry
            .get(key)
            .await
            .ok_or_else(|| ArenaError::NotFound(key.to_string()))
    }

    pub async fn start(&self, team: &str, image_name: &str) -> ArenaResult<ContainerRecord> {
        let image = self.images.get(image_name)?;
        let key = RecordKey::new(team, &image.name);
        let guard = self.guard(&key).await;
        let _held = guard.lock().await;

        let record = self.registry.get_or_create(&key).await;
        if record.state == ContainerState::Running {
            debug!(%key, "Start on a running record, nothing to do");
            return Ok(record);
        }

        if let Some(handle) = record.runtime_handle.clone() {
            if record.state == ContainerState::Starting {
                let observed = self
                    .call(&key, "inspect", || self.runtime.inspect(&handle))
                    .await;
                if let Ok(RuntimeStatus {
                    state: ObservedState::Running,
                    ..
                }) = observed
                {
                    info!(%key, %handle, "Container from an interrupted start is up");
                    return self.mark_running(&key).await;
                }
            }
            self.discard(&key, &handle).await;
        }
        self.ports.release_owner(&key).await;

        self.registry
            .transition(&key, ContainerState::Starting, |record| {
                record.runtime_handle = None;
                record.port_bindings.clear();
                record.environment.clear();
                record.last_error = None;
                record.exit_code = None;
                record.start_time = Some(SystemTime::now());
                record.finish_time = None;
            })
            .await?;

        let bindings = match self.ports.allocate(&key, &image.ports).await {
            Ok(bindings) => bindings,
            Err(err) => {
                warn!(%key, %err, "Cannot allocate host ports");
                let message = err.to_string();
                self.registry
                    .transition(&key, ContainerState::Pending, |record| {
                        record.last_error = Some(message)
                    })
                    .await?;
                return Err(err);
            }
        };

        let environment = container_environment(team, image, &bindings);
        let record = self
            .registry
            .update(&key, |record| {
                record.port_bindings = bindings;
                record.environment = environment;
                Ok(())
            })
            .await?;

        let spec = container_spec(&record, image);
        let handle = match self
            .call(&key, "create", || self.runtime.create(&spec))
            .await
        {
            Ok(handle) => handle,
            Err(err) => return self.start_failed(&key, "create", err).await,
        };
        self.registry
            .update(&key, |record| {
                record.runtime_handle = Some(handle.clone());
                Ok(())
            })
            .await?;

        if let Err(err) = self
            .call(&key, "start", || self.runtime.start(&handle))
            .await
        {
            return self.start_failed(&key, "start", err).await;
        }

        match self
            .call(&key, "inspect", || self.runtime.inspect(&handle))
            .await
        {
            Ok(status) => match status.state {
                ObservedState::Running => {
                    info!(%key, %handle, "Container running");
                    self.mark_running(&key).await
                }
                ObservedState::Exited | ObservedState::Missing => {
                    self.fail(
                        &key,
                        "container exited during startup".to_string(),
                        status.exit_code,
                    )
                    .await
                }
                ObservedState::Created => self.current(&key).await,
            },
            Err(err) => {
                warn!(%key, %err, "Could not confirm container start, leaving it to the poll loop");
                self.current(&key).await
            }
        }
    }

    pub async fn stop(&self, team: &str, image_name: &str) -> ArenaResult<ContainerRecord> {
        let image = self.images.get(image_name)?;
        let key = RecordKey::new(team, &image.name);
        let guard = self.guard(&key).await;
        let _held = guard.lock().await;

        let Some(record) = self.registry.get(&key).await else {
            let mut absent = ContainerRecord::new(&key);
            absent.state = ContainerState::Stopped;
            return Ok(absent);
        };
        if record.state == ContainerState::Stopped {
            return Ok(record);
        }

        let Some(handle) = record.runtime_handle.clone() else {
            // nothing was ever created, or the create timed out
            self.release(&key, &record.port_bindings).await;
            if record.state == ContainerState::Starting {
                self.registry
                    .transition(&key, ContainerState::Stopping, |_| {})
                    .await?;
            }
            return self.mark_stopped(&key).await;
        };

        self.registry
            .transition(&key, ContainerState::Stopping, |_| {})
            .await?;

        match self
            .call(&key, "stop", || self.runtime.stop(&handle))
            .await
        {
            Ok(()) => {}
            Err(RuntimeError::NotFound(_)) => {
                debug!(%key, %handle, "Container already gone");
            }
            Err(err) => {
                warn!(%key, %handle, %err, "Container stop failed");
                // the container may still hold its ports, keep them bound
                let message = describe("stop", &err);
                let transient = err.is_transient();
                let record = self
                    .registry
                    .transition(&key, ContainerState::Failed, |record| {
                        record.last_error = Some(message.clone())
                    })
                    .await?;
                return if transient {
                    Err(ArenaError::RuntimeUnavailable(message))
                } else {
                    Ok(record)
                };
            }
        }

        self.release(&key, &record.port_bindings).await;
        info!(%key, %handle, "Container stopped");
        self.mark_stopped(&key).await
    }

    /// Returns the freshest known record without taking the per-key guard.
    /// A failed poll yields the last known record flagged as stale.
    pub async fn status(&self, team: &str, image_name: &str) -> ArenaResult<StatusReport> {
        let image = self.images.get(image_name)?;
        let key = RecordKey::new(team, &image.name);
        let record = self.registry.get_or_create(&key).await;

        let Some(handle) = record.runtime_handle.clone() else {
            return Ok(StatusReport::fresh(record));
        };

        let observed = match timeout(self.policy.call_timeout, self.runtime.inspect(&handle)).await
        {
            Ok(Ok(status)) => status,
            Ok(Err(RuntimeError::NotFound(_))) => RuntimeStatus {
                state: ObservedState::Missing,
                ready: false,
                exit_code: None,
            },
            Ok(Err(err)) => {
                debug!(%key, %err, "Status poll failed, serving last known state");
                return Ok(StatusReport {
                    record,
                    observed: None,
                    stale: true,
                });
            }
            Err(_) => {
                debug!(%key, "Status poll timed out, serving last known state");
                return Ok(StatusReport {
                    record,
                    observed: None,
                    stale: true,
                });
            }
        };

        let record = self
            .registry
            .update(&key, |record| {
                if record.runtime_handle.as_deref() == Some(handle.as_str()) {
                    record.last_observed_at = Some(SystemTime::now());
                }
                Ok(())
            })
            .await?;

        Ok(StatusReport {
            record,
            observed: Some(observed),
            stale: false,
        })
    }

    /// Folds an observation of `handle` into its record. Returns `None` when
    /// the record moved on to another handle since the observation was
    /// taken, and `ConflictingOperation` while a start or stop holds the key.
    pub async fn reconcile(
        &self,
        key: &RecordKey,
        handle: &str,
        status: &RuntimeStatus,
    ) -> ArenaResult<Option<ContainerRecord>> {
        let guard = self.guard(key).await;
        let Ok(_held) = guard.try_lock() else {
            return Err(ArenaError::ConflictingOperation(key.to_string()));
        };

        let Some(record) = self.registry.get(key).await else {
            return Ok(None);
        };
        if record.runtime_handle.as_deref() != Some(handle) {
            return Ok(None);
        }

        let record = match (record.state, status.state) {
            (ContainerState::Starting, ObservedState::Running) => {
                info!(%key, %handle, "Container confirmed up");
                self.mark_running(key).await?
            }
            (
                ContainerState::Running | ContainerState::Starting,
                ObservedState::Exited | ObservedState::Missing,
            ) => {
                let message = match status.exit_code {
                    Some(code) => format!("container exited with code {}", code),
                    None => "container disappeared".to_string(),
                };
                self.fail(key, message, status.exit_code).await?
            }
            _ => {
                self.registry
                    .update(key, |record| {
                        record.last_observed_at = Some(SystemTime::now());
                        Ok(())
                    })
                    .await?
            }
        };
        Ok(Some(record))
    }

    async fn mark_running(&self, key: &RecordKey) -> ArenaResult<ContainerRecord> {
        self.registry
            .transition(key, ContainerState::Running, |record| {
                record.last_observed_at = Some(SystemTime::now());
                record.last_error = None;
            })
            .await
    }

    async fn mark_stopped(&self, key: &RecordKey) -> ArenaResult<ContainerRecord> {
        self.registry
            .transition(key, ContainerState::Stopped, |record| {
                record.runtime_handle = None;
                record.port_bindings.clear();
                record.environment.clear();
                record.finish_time = Some(SystemTime::now());
            })
            .await
    }

    /// Moves the record to `failed` and gives its ports back.
    async fn fail(
        &self,
        key: &RecordKey,
        message: String,
        exit_code: Option<i64>,
    ) -> ArenaResult<ContainerRecord> {
        let record = self.current(key).await?;
        self.release(key, &record.port_bindings).await;

        warn!(%key, error = %message, "Container failed");
        self.registry
            .transition(key, ContainerState::Failed, |record| {
                record.port_bindings.clear();
                record.environment.clear();
                record.last_error = Some(message);
                record.exit_code = exit_code;
                record.finish_time = Some(SystemTime::now());
            })
            .await
    }

    async fn start_failed(
        &self,
        key: &RecordKey,
        call: &str,
        err: RuntimeError,
    ) -> ArenaResult<ContainerRecord> {
        warn!(%key, call, %err, "Container start failed");
        let message = describe(call, &err);

        match err {
            // the engine may still bring it up; a later start or stop cleans up
            RuntimeError::Timeout(_) => {
                self.registry
                    .update(key, |record| {
                        record.last_error = Some(message.clone());
                        Ok(())
                    })
                    .await?;
                Err(ArenaError::RuntimeUnavailable(message))
            }
            RuntimeError::Transient(_) => {
                self.fail(key, message.clone(), None).await?;
                Err(ArenaError::RuntimeUnavailable(message))
            }
            RuntimeError::NotFound(_) | RuntimeError::Failed(_) => {
                self.fail(key, message, None).await
            }
        }
    }

    async fn release(&self, key: &RecordKey, bindings: &[PortBinding]) {
        if let Err(err) = self.ports.release(bindings).await {
            warn!(%key, %err, "Record bindings out of sync with the port pool");
        }
        self.ports.release_owner(key).await;
    }

    /// Best-effort removal of a container from an earlier cycle.
    async fn discard(&self, key: &RecordKey, handle: &str) {
        match self.call(key, "stop", || self.runtime.stop(handle)).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {
                debug!(%key, %handle, "Discarded previous container")
            }
            Err(err) => warn!(%key, %handle, %err, "Could not remove previous container"),
        }
    }

    /// Pulls every catalog image. Not bounded by the call timeout; a failed
    /// pull is logged and the image is tried again by the engine on create.
    pub async fn pull_images(&self) -> usize {
        let mut pulled = 0;
        for image in self.images.list() {
            match self.runtime.pull_image(&image.reference).await {
                Ok(()) => pulled += 1,
                Err(err) => warn!(image = %image.name, reference = %image.reference, %err, "Image pull failed"),
            }
        }
        pulled
    }

    pub async fn sweep_orphans(&self) -> ArenaResult<usize> {
        self.runtime.sweep_orphans().await.map_err(|err| {
            warn!(%err, "Orphan sweep failed");
            ArenaError::RuntimeUnavailable(describe("sweep", &err))
        })
    }

    /// Stops every container that still holds a runtime handle.
    pub async fn shutdown(&self) {
        for record in self.registry.all().await {
            if record.runtime_handle.is_none() {
                continue;
            }
            if let Err(err) = self.stop(&record.team, &record.image).await {
                warn!(key = %record.key(), %err, "Could not stop container on shutdown");
            }
        }
    }
}
