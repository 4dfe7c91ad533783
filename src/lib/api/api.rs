use std::{
    future::Future,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use axum::{
    Json, Router,
    extract::{FromRequestParts, State as AxumState},
    http::{StatusCode, header::AUTHORIZATION, request::Parts},
    response::IntoResponse,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tracing::info;

use super::types::{
    AppState, ArenaServer, AuthTeam, ContainerNameRequest, ContainerView, CredentialsRequest,
    ImageView, JsonBody, LogsResponse, OperationRequest, TokenResponse,
};
use crate::lib::{
    auth::types::InMemoryAuth,
    config::types::{Config, ImageCatalog},
    containers::types::{ContainerRecord, Registry},
    error::{ArenaError, ArenaResult},
    monitor::types::{Monitor, PortView},
    orchestrator::types::{Operation, Orchestrator, RetryPolicy, StatusReport},
    ports::types::PortAllocator,
    runtime::types::RuntimeAdapter,
};

fn unix_secs(at: Option<SystemTime>) -> Option<u64> {
    at.and_then(|at| at.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_secs())
}

impl From<ContainerRecord> for ContainerView {
    fn from(record: ContainerRecord) -> Self {
        ContainerView {
            ports: record
                .port_bindings
                .iter()
                .map(|binding| PortView {
                    role: binding.logical_port,
                    host_port: binding.host_port,
                })
                .collect(),
            last_observed_at: unix_secs(record.last_observed_at),
            container_name: record.container_name,
            image: record.image,
            state: record.state,
            environment: record.environment,
            last_error: record.last_error,
            exit_code: record.exit_code,
            observed: None,
            stale: None,
        }
    }
}

impl From<StatusReport> for ContainerView {
    fn from(report: StatusReport) -> Self {
        ContainerView {
            observed: report.observed,
            stale: Some(report.stale),
            ..ContainerView::from(report.record)
        }
    }
}

impl FromRequestParts<AppState> for AuthTeam {
    type Rejection = ArenaError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ArenaError::Unauthorized("missing bearer token".to_string()))?;

        state.tokens.resolve(token).await.map(AuthTeam)
    }
}

impl AppState {
    /// Wires the core once from configuration. The runtime is chosen by
    /// the caller.
    pub fn new(config: &Config, runtime: Arc<dyn RuntimeAdapter>) -> Self {
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(ImageCatalog::new(config.images.clone())),
            Arc::new(Registry::new()),
            Arc::new(PortAllocator::new(&config.pools, config.quarantine())),
            runtime,
            RetryPolicy {
                call_timeout: config.call_timeout(),
                backoff: config.retry_backoff(),
            },
        ));
        let monitor = Arc::new(Monitor::new(orchestrator.clone(), config.monitor.log_tail));
        let accounts = Arc::new(InMemoryAuth::new(config.token_ttl()));

        AppState {
            orchestrator,
            monitor,
            tokens: accounts.clone(),
            accounts,
        }
    }
}

impl ArenaServer {
    pub fn new(state: AppState, address: &str, port: u16) -> Self {
        Self {
            state,
            address: address.to_string(),
            port,
        }
    }

    async fn register(
        AxumState(state): AxumState<AppState>,
        JsonBody(body): JsonBody<CredentialsRequest>,
    ) -> ArenaResult<impl IntoResponse> {
        let team = state.accounts.register(&body.teamname, &body.password).await?;
        Ok((
            StatusCode::CREATED,
            Json(serde_json::json!({ "teamname": team.name })),
        ))
    }

    async fn login(
        AxumState(state): AxumState<AppState>,
        JsonBody(body): JsonBody<CredentialsRequest>,
    ) -> ArenaResult<Json<TokenResponse>> {
        let access_token = state.accounts.login(&body.teamname, &body.password).await?;
        Ok(Json(TokenResponse {
            access_token,
            token_type: "bearer".to_string(),
        }))
    }

    async fn list_images(AxumState(state): AxumState<AppState>) -> Json<Vec<ImageView>> {
        let images = state
            .orchestrator
            .images
            .list()
            .into_iter()
            .map(|image| ImageView {
                name: image.name,
                description: image.description,
                ports: image.ports,
            })
            .collect();
        Json(images)
    }

    async fn list_containers(
        AxumState(state): AxumState<AppState>,
        AuthTeam(team): AuthTeam,
    ) -> Json<Vec<ContainerView>> {
        let records = state.orchestrator.registry.list(&team.name).await;
        Json(records.into_iter().map(ContainerView::from).collect())
    }

    async fn operate(
        AxumState(state): AxumState<AppState>,
        AuthTeam(team): AuthTeam,
        JsonBody(body): JsonBody<OperationRequest>,
    ) -> ArenaResult<Json<ContainerView>> {
        info!(team = %team.name, image = %body.imagename, operation = ?body.operation, "Container operation");
        let report = state
            .orchestrator
            .operate(&team.name, &body.imagename, body.operation)
            .await?;

        let view = match body.operation {
            Operation::Status => ContainerView::from(report),
            Operation::Start | Operation::Stop => ContainerView::from(report.record),
        };
        Ok(Json(view))
    }

    async fn health(
        AxumState(state): AxumState<AppState>,
        AuthTeam(team): AuthTeam,
        JsonBody(body): JsonBody<ContainerNameRequest>,
    ) -> ArenaResult<impl IntoResponse> {
        let report = state.monitor.health(&team.name, &body.container_name).await?;
        Ok(Json(report))
    }

    async fn logs(
        AxumState(state): AxumState<AppState>,
        AuthTeam(team): AuthTeam,
        JsonBody(body): JsonBody<ContainerNameRequest>,
    ) -> ArenaResult<Json<LogsResponse>> {
        let image = state.monitor.resolve(&team.name, &body.container_name)?;
        let container_name = format!("{}-{}", team.name, image.name);
        let logs = state.monitor.logs(&team.name, &body.container_name).await?;
        Ok(Json(LogsResponse {
            container_name,
            logs,
        }))
    }

    async fn ports_status(
        AxumState(state): AxumState<AppState>,
        AuthTeam(team): AuthTeam,
    ) -> impl IntoResponse {
        Json(state.monitor.ports_status(&team.name).await)
    }

    async fn stats(AxumState(state): AxumState<AppState>) -> impl IntoResponse {
        Json(state.monitor.stats().await)
    }

    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/register", post(ArenaServer::register))
            .route("/login", post(ArenaServer::login))
            .route("/images", get(ArenaServer::list_images))
            .route("/containers", post(ArenaServer::list_containers))
            .route("/containers/operation", post(ArenaServer::operate))
            .route("/containers/health", post(ArenaServer::health))
            .route("/logs", post(ArenaServer::logs))
            .route("/ports/status", post(ArenaServer::ports_status))
            .route("/stats", get(ArenaServer::stats))
            .with_state(state)
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests.
    pub async fn start_server<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let address = format!("{}:{}", self.address, self.port);
        let app = ArenaServer::router(self.state);

        let listener = TcpListener::bind(&address).await?;
        info!(%address, "Listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
    }
}
