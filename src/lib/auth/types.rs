use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{sync::RwLock, time::Instant};

use crate::lib::error::ArenaResult;

/// Tenant identity. Also the prefix of every container name the team owns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Team {
    pub name: String,
}

/// Maps an opaque access token to the team it was issued to.
#[async_trait]
pub trait TokenResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> ArenaResult<Team>;
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub salt: String,
    /// Hex SHA-256 of salt followed by password.
    pub hash: String,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub team: Team,
    pub expires_at: Instant,
}

pub struct InMemoryAuth {
    pub teams: RwLock<HashMap<String, Credentials>>,
    pub sessions: RwLock<HashMap<String, Session>>,
    pub token_ttl: Duration,
}
