use std::collections::HashMap;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub runtime: RuntimeConfig,
    pub monitor: MonitorConfig,
    pub pools: Vec<PoolConfig>,
    pub images: Vec<ImageDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token_ttl_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub kind: RuntimeKind,
    pub call_timeout_secs: u64,
    pub retry_backoff_ms: u64,
    pub stop_grace_secs: i64,
    pub pull_images: bool,
    pub sweep_on_startup: bool,
    pub stop_on_shutdown: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
    /// Falls back to the poll interval when unset.
    pub quarantine_secs: Option<u64>,
    pub log_tail: usize,
}

/// Host port range reserved for one logical port role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub role: u16,
    pub start: u16,
    pub end: u16,
}

/// A container template teams may start. Read-only after load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDefinition {
    pub name: String,
    pub reference: String,
    #[serde(default)]
    pub description: String,
    pub env_prefix: String,
    /// Logical port roles, in declaration order.
    pub ports: Vec<u16>,
    #[serde(default)]
    pub primary_port: Option<u16>,
}

/// Image definitions indexed by name.
#[derive(Debug, Clone, Default)]
pub struct ImageCatalog {
    pub images: HashMap<String, ImageDefinition>,
    pub order: Vec<String>,
}
