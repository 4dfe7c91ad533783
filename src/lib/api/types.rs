use std::{collections::BTreeMap, sync::Arc};

use axum::{Json, extract::FromRequest};
use serde::{Deserialize, Serialize};

use crate::lib::{
    auth::types::{InMemoryAuth, Team, TokenResolver},
    containers::types::ContainerState,
    error::ArenaError,
    monitor::types::{Monitor, PortView},
    orchestrator::types::{Operation, Orchestrator},
    runtime::types::RuntimeStatus,
};

/// Everything a handler can reach. Built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub monitor: Arc<Monitor>,
    pub accounts: Arc<InMemoryAuth>,
    pub tokens: Arc<dyn TokenResolver>,
}

pub struct ArenaServer {
    pub state: AppState,
    pub address: String,
    pub port: u16,
}

/// Team resolved from the `Authorization: Bearer` header.
pub struct AuthTeam(pub Team);

/// JSON request body. Malformed or incomplete bodies are `bad_request`.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(ArenaError))]
pub struct JsonBody<T>(pub T);

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub teamname: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
}

#[derive(Debug, Serialize)]
pub struct ImageView {
    pub name: String,
    pub description: String,
    pub ports: Vec<u16>,
}

#[derive(Debug, Deserialize)]
pub struct OperationRequest {
    pub imagename: String,
    pub operation: Operation,
}

#[derive(Debug, Deserialize)]
pub struct ContainerNameRequest {
    pub container_name: String,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub container_name: String,
    pub logs: String,
}

/// Caller-facing projection of a container record.
#[derive(Debug, Serialize)]
pub struct ContainerView {
    pub container_name: String,
    pub image: String,
    pub state: ContainerState,
    pub ports: Vec<PortView>,
    pub environment: BTreeMap<String, String>,
    pub last_error: Option<String>,
    /// Unix seconds.
    pub last_observed_at: Option<u64>,
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed: Option<RuntimeStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale: Option<bool>,
}
