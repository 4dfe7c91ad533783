use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::lib::{
    api::types::{AppState, ArenaServer},
    config::types::{Config, RuntimeKind},
    runtime::{
        memory::MemoryRuntime,
        types::{DockerRuntime, RuntimeAdapter},
    },
};

mod lib {
    pub mod api;
    pub mod auth;
    pub mod config;
    pub mod containers;
    pub mod error;
    pub mod monitor;
    pub mod orchestrator;
    pub mod ports;
    pub mod runtime;
}

/// Per-team simulator containers with collision-free host ports.
#[derive(Debug, Parser)]
#[command(name = "simarena", version)]
struct Args {
    /// TOML configuration file. Built-in defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    address: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long, value_enum)]
    runtime: Option<RuntimeKind>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(address) = &self.address {
            config.server.address = address.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(kind) = self.runtime {
            config.runtime.kind = kind;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(err) => {
                warn!(%err, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("simarena=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    let runtime: Arc<dyn RuntimeAdapter> = match config.runtime.kind {
        RuntimeKind::Docker => Arc::new(
            DockerRuntime::connect(config.runtime.stop_grace_secs)
                .context("connecting to the Docker engine")?,
        ),
        RuntimeKind::Memory => Arc::new(MemoryRuntime::new()),
    };
    info!(
        address = %config.bind_address(),
        runtime = runtime.name(),
        images = config.images.len(),
        "Starting simarena"
    );

    let state = AppState::new(&config, runtime);

    if config.runtime.sweep_on_startup {
        match state.orchestrator.sweep_orphans().await {
            Ok(removed) => info!(removed, "Orphan sweep finished"),
            Err(err) => warn!(%err, "Orphan sweep failed, continuing"),
        }
    }

    if config.runtime.pull_images {
        let pulled = state.orchestrator.pull_images().await;
        info!(pulled, images = config.images.len(), "Image pulls finished");
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let poller = tokio::spawn(
        state
            .monitor
            .clone()
            .run_poll_loop(config.poll_interval(), stop_rx),
    );

    let orchestrator = state.orchestrator.clone();
    ArenaServer::new(state, &config.server.address, config.server.port)
        .start_server(shutdown_signal())
        .await
        .context("serving HTTP")?;

    let _ = stop_tx.send(true);
    if let Err(err) = poller.await {
        warn!(%err, "Poll loop ended abnormally");
    }
    if config.runtime.stop_on_shutdown {
        info!("Stopping team containers");
        orchestrator.shutdown().await;
    }

    Ok(())
}
