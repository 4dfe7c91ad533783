use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::{sync::RwLock, time::Instant};
use tracing::{debug, info};
use uuid::Uuid;

use super::types::{Credentials, InMemoryAuth, Session, Team, TokenResolver};
use crate::lib::error::{ArenaError, ArenaResult};

const MAX_TEAM_NAME: usize = 32;

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Team names end up in container names and environment values. No `-`,
/// so `<team>-<image>` always splits at the first dash.
pub fn validate_team_name(name: &str) -> ArenaResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_TEAM_NAME
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ArenaError::BadRequest(format!(
            "team name must be 1 to {} characters of letters, digits or '_'",
            MAX_TEAM_NAME
        )))
    }
}

impl InMemoryAuth {
    pub fn new(token_ttl: Duration) -> Self {
        InMemoryAuth {
            teams: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            token_ttl,
        }
    }

    pub async fn register(&self, name: &str, password: &str) -> ArenaResult<Team> {
        validate_team_name(name)?;
        if password.is_empty() {
            return Err(ArenaError::BadRequest("password must not be empty".to_string()));
        }

        let mut teams = self.teams.write().await;
        if teams.contains_key(name) {
            return Err(ArenaError::TeamExists(name.to_string()));
        }

        let salt = Uuid::new_v4().simple().to_string();
        let hash = hash_password(&salt, password);
        teams.insert(name.to_string(), Credentials { salt, hash });
        info!(team = name, "Registered team");

        Ok(Team {
            name: name.to_string(),
        })
    }

    /// Checks the password and issues a fresh token.
    pub async fn login(&self, name: &str, password: &str) -> ArenaResult<String> {
        let matches = self
            .teams
            .read()
            .await
            .get(name)
            .is_some_and(|creds| hash_password(&creds.salt, password) == creds.hash);
        if !matches {
            debug!(team = name, "Rejected login");
            return Err(ArenaError::InvalidCredentials);
        }

        let token = Uuid::new_v4().to_string();
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, session| session.expires_at > now);
        sessions.insert(
            token.clone(),
            Session {
                team: Team {
                    name: name.to_string(),
                },
                expires_at: now + self.token_ttl,
            },
        );
        info!(team = name, "Issued access token");
        Ok(token)
    }
}

#[async_trait]
impl TokenResolver for InMemoryAuth {
    async fn resolve(&self, token: &str) -> ArenaResult<Team> {
        let now = Instant::now();
        let session = self.sessions.read().await.get(token).cloned();

        match session {
            Some(session) if session.expires_at > now => Ok(session.team),
            Some(_) => {
                self.sessions.write().await.remove(token);
                Err(ArenaError::Unauthorized("token expired".to_string()))
            }
            None => Err(ArenaError::Unauthorized("unknown token".to_string())),
        }
    }
}
