use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
        LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    },
    errors::Error as BollardError,
    image::CreateImageOptions,
    secret::{
        ContainerInspectResponse, ContainerStateStatusEnum, HealthStatusEnum, HostConfig,
        PortBinding as HostPortBinding, RestartPolicy, RestartPolicyNameEnum,
    },
};
use futures_util::stream::{StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use super::types::{
    ContainerSpec, DockerRuntime, MANAGED_LABEL, ObservedState, RuntimeAdapter, RuntimeError,
    RuntimeStatus,
};

fn classify(err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Failed(format!("engine returned {}: {}", status_code, message)),
        BollardError::RequestTimeoutError => {
            RuntimeError::Timeout("request to engine timed out".to_string())
        }
        err @ (BollardError::IOError { .. } | BollardError::HyperResponseError { .. }) => {
            RuntimeError::Transient(err.to_string())
        }
        other => RuntimeError::Failed(other.to_string()),
    }
}

fn is_status(err: &BollardError, code: u16) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

pub fn container_config(spec: &ContainerSpec) -> Config<String> {
    let port_bindings: HashMap<String, Option<Vec<HostPortBinding>>> = spec
        .port_map
        .iter()
        .map(|(container_port, host_port)| {
            (
                format!("{}/tcp", container_port),
                Some(vec![HostPortBinding {
                    host_ip: None,
                    host_port: Some(host_port.to_string()),
                }]),
            )
        })
        .collect();

    let host_config = HostConfig {
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::NO),
            maximum_retry_count: None,
        }),
        port_bindings: Some(port_bindings),
        ..Default::default()
    };

    Config {
        image: Some(spec.image_reference.clone()),
        env: Some(spec.env.clone()),
        exposed_ports: Some(
            spec.port_map
                .iter()
                .map(|(container_port, _)| (format!("{}/tcp", container_port), HashMap::new()))
                .collect(),
        ),
        labels: Some(spec.labels.clone()),
        host_config: Some(host_config),
        ..Default::default()
    }
}

pub fn status_from_inspect(response: &ContainerInspectResponse) -> RuntimeStatus {
    let Some(state) = response.state.as_ref() else {
        return RuntimeStatus {
            state: ObservedState::Missing,
            ready: false,
            exit_code: None,
        };
    };

    let observed = match (state.running, state.status.as_ref()) {
        (Some(true), _) => ObservedState::Running,
        (_, Some(ContainerStateStatusEnum::CREATED)) => ObservedState::Created,
        (_, Some(ContainerStateStatusEnum::RUNNING))
        | (_, Some(ContainerStateStatusEnum::RESTARTING)) => ObservedState::Running,
        _ => ObservedState::Exited,
    };
    let health = state.health.as_ref().and_then(|health| health.status.as_ref());
    let ready = observed == ObservedState::Running
        && !matches!(
            health,
            Some(HealthStatusEnum::STARTING) | Some(HealthStatusEnum::UNHEALTHY)
        );

    RuntimeStatus {
        state: observed,
        ready,
        exit_code: match observed {
            ObservedState::Exited => state.exit_code,
            _ => None,
        },
    }
}

impl DockerRuntime {
    pub fn connect(stop_grace_secs: i64) -> Result<Self, RuntimeError> {
        let client = Docker::connect_with_unix_defaults().map_err(classify)?;
        Ok(DockerRuntime {
            client,
            stop_grace_secs,
        })
    }

    async fn remove(&self, handle: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.client.remove_container(handle, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    /// Removes a container squatting on `spec.name` if it was created for
    /// the same team and image. Anything else is left alone.
    async fn remove_stale(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        let existing = self
            .client
            .inspect_container(&spec.name, None::<InspectContainerOptions>)
            .await
            .map_err(classify)?;
        let labels = existing
            .config
            .and_then(|config| config.labels)
            .unwrap_or_default();
        if !spec.same_owner(&labels) {
            return Err(RuntimeError::Failed(format!(
                "container name {} is held by another owner",
                spec.name
            )));
        }

        warn!(name = %spec.name, "Removing stale container with the same name");
        self.remove(&spec.name).await
    }
}

#[async_trait]
impl RuntimeAdapter for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        info!(image = reference, "Pulling image");

        let mut stream = self.client.create_image(
            Some(CreateImageOptions {
                from_image: reference.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(msg) = stream.next().await {
            let info = msg.map_err(classify)?;
            if let Some(status) = info.status {
                debug!(image = reference, %status, "Pull progress");
            }
        }

        info!(image = reference, "Image pulled");
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let options = || {
            Some(CreateContainerOptions {
                name: spec.name.clone(),
                ..Default::default()
            })
        };

        let response = match self
            .client
            .create_container(options(), container_config(spec))
            .await
        {
            Ok(response) => response,
            Err(e) if is_status(&e, 409) => {
                self.remove_stale(spec).await?;
                self.client
                    .create_container(options(), container_config(spec))
                    .await
                    .map_err(classify)?
            }
            Err(e) => return Err(classify(e)),
        };

        for warning in &response.warnings {
            warn!(name = %spec.name, %warning, "Engine warning on create");
        }
        info!(name = %spec.name, handle = %response.id, "Container created");
        Ok(response.id)
    }

    async fn start(&self, handle: &str) -> Result<(), RuntimeError> {
        match self
            .client
            .start_container(handle, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // already started
            Err(e) if is_status(&e, 304) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn stop(&self, handle: &str) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: self.stop_grace_secs,
        };
        match self.client.stop_container(handle, Some(options)).await {
            Ok(()) => {}
            Err(e) if is_status(&e, 304) => {}
            Err(e) => return Err(classify(e)),
        }
        self.remove(handle).await
    }

    async fn inspect(&self, handle: &str) -> Result<RuntimeStatus, RuntimeError> {
        let response = self
            .client
            .inspect_container(handle, None::<InspectContainerOptions>)
            .await
            .map_err(classify)?;
        Ok(status_from_inspect(&response))
    }

    async fn logs(&self, handle: &str, tail: usize) -> Result<String, RuntimeError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let chunks: Vec<_> = self
            .client
            .logs(handle, Some(options))
            .try_collect()
            .await
            .map_err(classify)?;

        Ok(chunks
            .into_iter()
            .map(|chunk| chunk.to_string())
            .collect::<Vec<_>>()
            .join(""))
    }

    async fn sweep_orphans(&self) -> Result<usize, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)]);

        let containers = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(classify)?;

        let mut removed = 0;
        for id in containers.into_iter().filter_map(|c| c.id) {
            self.remove(&id).await?;
            removed += 1;
        }
        if removed > 0 {
            info!(removed, "Removed containers left by a previous run");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::runtime::types::{IMAGE_LABEL, TEAM_LABEL};
    use bollard::secret::{ContainerState as EngineState, Health};

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "alpha-carla".to_string(),
            image_reference: "carlasim/carla:0.9.15".to_string(),
            env: vec!["TEAMNAME=alpha".to_string(), "CARLA_2000=32000".to_string()],
            port_map: vec![(2000, 32000), (8888, 38800)],
            labels: HashMap::from([
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (TEAM_LABEL.to_string(), "alpha".to_string()),
                (IMAGE_LABEL.to_string(), "carla".to_string()),
            ]),
        }
    }

    #[test]
    fn name_clash_replaces_only_same_owner() {
        let spec = spec();
        assert!(spec.same_owner(&spec.labels));

        let mut foreign = spec.labels.clone();
        foreign.insert(TEAM_LABEL.to_string(), "alpha_b".to_string());
        assert!(!spec.same_owner(&foreign));
        assert!(!spec.same_owner(&HashMap::new()));
    }

    #[test]
    fn config_maps_declared_ports_to_host_ports() {
        let config = container_config(&spec());
        let host = config.host_config.unwrap();
        let bindings = host.port_bindings.unwrap();
        let rpc = bindings["2000/tcp"].as_ref().unwrap();
        assert_eq!(rpc[0].host_port.as_deref(), Some("32000"));
        assert!(config.exposed_ports.unwrap().contains_key("8888/tcp"));
        assert_eq!(config.env.unwrap()[0], "TEAMNAME=alpha");
    }

    #[test]
    fn exited_container_reports_exit_code() {
        let response = ContainerInspectResponse {
            state: Some(EngineState {
                running: Some(false),
                status: Some(ContainerStateStatusEnum::EXITED),
                exit_code: Some(137),
                ..Default::default()
            }),
            ..Default::default()
        };
        let status = status_from_inspect(&response);
        assert_eq!(status.state, ObservedState::Exited);
        assert_eq!(status.exit_code, Some(137));
        assert!(!status.ready);
    }

    #[test]
    fn starting_health_check_is_not_ready() {
        let response = ContainerInspectResponse {
            state: Some(EngineState {
                running: Some(true),
                status: Some(ContainerStateStatusEnum::RUNNING),
                health: Some(Health {
                    status: Some(HealthStatusEnum::STARTING),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let status = status_from_inspect(&response);
        assert_eq!(status.state, ObservedState::Running);
        assert!(!status.ready);
    }

    #[test]
    fn engine_errors_are_classified() {
        let missing = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "no such container".into(),
        };
        assert!(matches!(classify(missing), RuntimeError::NotFound(_)));
        assert!(matches!(
            classify(BollardError::RequestTimeoutError),
            RuntimeError::Timeout(_)
        ));
        let conflict = BollardError::DockerResponseServerError {
            status_code: 500,
            message: "boom".into(),
        };
        assert!(matches!(classify(conflict), RuntimeError::Failed(_)));
    }
}
