use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MANAGED_LABEL: &str = "simarena.managed";
pub const TEAM_LABEL: &str = "simarena.team";
pub const IMAGE_LABEL: &str = "simarena.image";

/// Everything the engine needs to create one team container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image_reference: String,
    /// `KEY=VALUE` entries.
    pub env: Vec<String>,
    /// `(container port, host port)` pairs, TCP.
    pub port_map: Vec<(u16, u16)>,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// Whether `labels` belong to a container created for the same team
    /// and image. Only such a container may be replaced on a name clash.
    pub fn same_owner(&self, labels: &HashMap<String, String>) -> bool {
        [TEAM_LABEL, IMAGE_LABEL].iter().all(|label| {
            self.labels
                .get(*label)
                .is_some_and(|value| labels.get(*label) == Some(value))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservedState {
    Created,
    Running,
    Exited,
    Missing,
}

/// What the engine reported on the last inspect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub state: ObservedState,
    /// False while a declared health check is still starting or failing.
    pub ready: bool,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// Connection-level faults. Worth one retry.
    #[error("transient runtime error: {0}")]
    Transient(String),
    /// The call did not answer within its bound. Also retried once.
    #[error("runtime call timed out: {0}")]
    Timeout(String),
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("runtime error: {0}")]
    Failed(String),
}

impl RuntimeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::Transient(_) | RuntimeError::Timeout(_))
    }
}

/// Capability boundary to the container engine.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Makes `reference` available locally. Runs outside the per-call
    /// timeout since image downloads can take minutes.
    async fn pull_image(&self, _reference: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Creates the container and returns its engine handle.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, handle: &str) -> Result<(), RuntimeError>;

    /// Stops and removes the container.
    async fn stop(&self, handle: &str) -> Result<(), RuntimeError>;

    async fn inspect(&self, handle: &str) -> Result<RuntimeStatus, RuntimeError>;

    /// Last `tail` lines of combined stdout and stderr.
    async fn logs(&self, handle: &str, tail: usize) -> Result<String, RuntimeError>;

    /// Removes containers left behind by an earlier process.
    async fn sweep_orphans(&self) -> Result<usize, RuntimeError> {
        Ok(0)
    }
}

pub struct DockerRuntime {
    pub client: Docker,
    pub stop_grace_secs: i64,
}
