use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::Mutex;

use super::stats::{megabytes, percent};
use crate::lib::{
    containers::types::ContainerState, orchestrator::types::Orchestrator,
    runtime::types::RuntimeStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    /// Engine answered, container is not ready or has exited.
    Unhealthy,
    /// Engine could not be asked.
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub container_name: String,
    pub state: ContainerState,
    pub health: Health,
    pub observed: Option<RuntimeStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortView {
    pub role: u16,
    pub host_port: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortsStatus {
    pub container_name: String,
    pub image: String,
    pub state: ContainerState,
    pub ports: Vec<PortView>,
}

/// Host figures plus the arena's own counts, as served by `GET /stats`.
#[derive(Debug, Serialize)]
pub struct SystemStats {
    #[serde(serialize_with = "percent")]
    pub cpu_usage: f32,
    #[serde(serialize_with = "megabytes")]
    pub total_memory: u64,
    #[serde(serialize_with = "megabytes")]
    pub used_memory: u64,
    #[serde(serialize_with = "megabytes")]
    pub total_swap: u64,
    #[serde(serialize_with = "megabytes")]
    pub used_swap: u64,
    pub system_name: String,
    pub hostname: String,
    pub total_cpus: u64,
    #[serde(serialize_with = "percent")]
    pub disk_usage: f32,
    pub running_containers: usize,
    pub allocated_ports: usize,
    pub free_ports: usize,
}

/// Read-side view over the orchestrator. Never takes a per-key guard
/// except through the non-blocking reconcile.
pub struct Monitor {
    pub orchestrator: Arc<Orchestrator>,
    pub log_tail: usize,
    pub sysinfo: Mutex<System>,
}
