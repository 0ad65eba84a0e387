//! termbridge - WebSocket terminal bridge
//!
//! Serves terminal upgrades and the session API on one port. Each attached
//! terminal drives its own process; by default that is `ssh` to the
//! session's host.

use clap::Parser as ClapParser;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use termbridge::{
    config::{Config, ConfigError, Overrides},
    server::Server,
    session::SessionRegistry,
};

/// termbridge - WebSocket terminal bridge
#[derive(ClapParser, Debug)]
#[command(name = "termbridge", version, about, long_about = None)]
struct Cli {
    /// Address to bind the WebSocket/HTTP server
    #[arg(long, env = "TERMBRIDGE_BIND")]
    bind: Option<SocketAddr>,

    /// Path to a TOML config file
    #[arg(long, env = "TERMBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Path that accepts terminal upgrades
    #[arg(long)]
    terminal_path: Option<String>,

    /// ssh client to launch for each terminal
    #[arg(long)]
    ssh_program: Option<String>,

    /// Run this shell command for each terminal instead of ssh
    #[arg(long, conflicts_with = "ssh_program")]
    command: Option<String>,
}

#[derive(Error, Debug)]
pub enum TermbridgeError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

#[tokio::main]
async fn main() -> Result<(), TermbridgeError> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = Config::load_or_default(cli.config.as_deref())?;
    config.apply(Overrides {
        bind: cli.bind,
        terminal_path: cli.terminal_path,
        ssh_program: cli.ssh_program,
        command: cli.command,
    });
    config.validate()?;

    run_server(config).await
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "termbridge=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_server(config: Config) -> Result<(), TermbridgeError> {
    tracing::info!("termbridge starting");

    let registry = SessionRegistry::new();
    let server = Server::from_config(&config, registry.clone())?;
    let listener = tokio::net::TcpListener::bind(config.server.bind).await?;

    let cancel = CancellationToken::new();
    let serve_handle = tokio::spawn(server.serve(listener, cancel.clone()));

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(?e, "failed to listen for Ctrl+C");
    }
    tracing::info!("shutting down");
    cancel.cancel();

    let removed = registry.shutdown();
    tracing::info!(sessions = removed, "sessions closed");

    serve_handle.await??;
    Ok(())
}
