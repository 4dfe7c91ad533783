use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::lib::{
    config::types::ImageCatalog,
    containers::types::{ContainerRecord, RecordKey, Registry},
    ports::types::PortAllocator,
    runtime::types::{RuntimeAdapter, RuntimeStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Start,
    Stop,
    Status,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Bound on every runtime call.
    pub call_timeout: Duration,
    /// Delay before the single retry of a transient failure.
    pub backoff: Duration,
}

/// Freshest known record plus what the engine said about it.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub record: ContainerRecord,
    pub observed: Option<RuntimeStatus>,
    /// Set when the poll failed and `record` is the last known state.
    pub stale: bool,
}

/// Serializes lifecycle operations per `(team, image)` and keeps records in
/// line with what the runtime actually did.
pub struct Orchestrator {
    pub images: Arc<ImageCatalog>,
    pub registry: Arc<Registry>,
    pub ports: Arc<PortAllocator>,
    pub runtime: Arc<dyn RuntimeAdapter>,
    /// One guard per record key, created on first use.
    pub guards: Mutex<HashMap<RecordKey, Arc<Mutex<()>>>>,
    pub policy: RetryPolicy,
}
