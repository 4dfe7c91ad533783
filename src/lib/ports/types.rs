use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, time::Instant};

/// A concrete host port lent to one `(team, image, logical port)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortBinding {
    pub team: String,
    pub image: String,
    pub logical_port: u16,
    pub host_port: u16,
}

#[derive(Debug)]
pub struct RolePool {
    pub role: u16,
    pub start: u16,
    pub end: u16,
    pub bound: BTreeMap<u16, PortBinding>,
    /// Released ports and the instant they were released.
    pub quarantined: HashMap<u16, Instant>,
}

pub struct PortAllocator {
    pub pools: Mutex<HashMap<u16, RolePool>>,
    pub quarantine: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolUsage {
    pub role: u16,
    pub capacity: usize,
    pub bound: usize,
    pub quarantined: usize,
}
