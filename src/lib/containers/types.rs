use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
    time::SystemTime,
};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::lib::ports::types::PortBinding;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Absent,
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Identity of a container record: one per team and image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub team: String,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub team: String,
    pub image: String,
    pub container_name: String,
    pub state: ContainerState,
    pub port_bindings: Vec<PortBinding>,
    pub environment: BTreeMap<String, String>,
    pub runtime_handle: Option<String>,
    pub last_observed_at: Option<SystemTime>,
    pub last_error: Option<String>,
    pub exit_code: Option<i64>,
    pub start_time: Option<SystemTime>,
    pub finish_time: Option<SystemTime>,
}

/// Bookkeeping store for every record ever requested. Each record sits
/// behind its own lock so updates to different keys never contend.
#[derive(Default)]
pub struct Registry {
    pub records: RwLock<HashMap<RecordKey, Arc<RwLock<ContainerRecord>>>>,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerState::Absent => "absent",
            ContainerState::Pending => "pending",
            ContainerState::Starting => "starting",
            ContainerState::Running => "running",
            ContainerState::Stopping => "stopping",
            ContainerState::Stopped => "stopped",
            ContainerState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.team, self.image)
    }
}
