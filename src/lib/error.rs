//! Error kinds surfaced by the arena core and the HTTP layer.

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

pub type ArenaResult<T> = Result<T, ArenaError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArenaError {
    /// Missing, unknown or expired access token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("no such image: {0}")]
    ImageNotFound(String),

    /// No free host port left for one of the image's logical roles.
    #[error("port pool exhausted for role {role} (image {image})")]
    PoolExhausted { image: String, role: u16 },

    /// The container engine could not be reached after the retry.
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("container is not running: {0}")]
    NotRunning(String),

    /// Another lifecycle operation holds the key. Callers queue on it
    /// instead of seeing it.
    #[error("conflicting operation in flight for {0}")]
    ConflictingOperation(String),

    #[error("no such container record: {0}")]
    NotFound(String),

    #[error("host port {0} is not allocated")]
    NotAllocated(u16),

    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("team already registered: {0}")]
    TeamExists(String),

    #[error("invalid team name or password")]
    InvalidCredentials,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ArenaError {
    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ArenaError::Unauthorized(_) => "unauthorized",
            ArenaError::ImageNotFound(_) => "image_not_found",
            ArenaError::PoolExhausted { .. } => "pool_exhausted",
            ArenaError::RuntimeUnavailable(_) => "runtime_unavailable",
            ArenaError::NotRunning(_) => "not_running",
            ArenaError::ConflictingOperation(_) => "conflicting_operation",
            ArenaError::NotFound(_) => "not_found",
            ArenaError::NotAllocated(_) => "not_allocated",
            ArenaError::InvalidTransition(_) => "invalid_transition",
            ArenaError::TeamExists(_) => "team_exists",
            ArenaError::InvalidCredentials => "invalid_credentials",
            ArenaError::BadRequest(_) => "bad_request",
            ArenaError::Config(_) => "config",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ArenaError::Unauthorized(_) | ArenaError::InvalidCredentials => {
                StatusCode::UNAUTHORIZED
            }
            ArenaError::ImageNotFound(_) | ArenaError::NotFound(_) => StatusCode::NOT_FOUND,
            ArenaError::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ArenaError::RuntimeUnavailable(_) => StatusCode::BAD_GATEWAY,
            ArenaError::NotRunning(_)
            | ArenaError::ConflictingOperation(_)
            | ArenaError::TeamExists(_) => StatusCode::CONFLICT,
            ArenaError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ArenaError::NotAllocated(_)
            | ArenaError::InvalidTransition(_)
            | ArenaError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<JsonRejection> for ArenaError {
    fn from(rejection: JsonRejection) -> Self {
        ArenaError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ArenaError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
