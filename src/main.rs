//! ccw - control-plane agent
//!
//! Serves the authenticated control socket (`/ws`) for interactive shells,
//! filesystem watches and port monitors, plus the one-shot REST API under
//! `/api`. On Ctrl+C every control socket is closed and every session still
//! registered is terminated.

use clap::Parser as ClapParser;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use ccw::{
    api,
    config::{self, AgentConfig, ConfigError, SessionSettings},
};

/// ccw - control-plane agent
///
/// Exposes shells, filesystem watches and port monitors over one
/// authenticated WebSocket per client, plus one-shot file, exec and network
/// endpoints over HTTP.
#[derive(ClapParser, Debug)]
#[command(name = "ccw", version, about, long_about = None)]
struct Cli {
    /// Address to bind the HTTP/WebSocket server
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Port to listen on (overrides the port of --bind)
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Shared secret for the control socket and the REST API
    #[arg(long, env = "AUTH_TOKEN")]
    token: Option<String>,

    /// Config file (default: <config_dir>/ccw/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Shell to spawn when a request names no command (overrides $SHELL)
    #[arg(long)]
    shell: Option<String>,

    /// Root of the proc filesystem read by the port monitor
    #[arg(long)]
    proc_root: Option<PathBuf>,

    /// Per-IP requests per second allowed on /api
    #[arg(long)]
    rate_limit: Option<u32>,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("no auth token configured (use --token, AUTH_TOKEN or the config file)")]
    MissingToken,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

const DEFAULT_BIND: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> Result<(), AgentError> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config_path = cli.config.clone().or_else(config::default_config_path);
    let file_config = match config_path {
        Some(ref path) => AgentConfig::load(path)?.unwrap_or_default(),
        None => AgentConfig::default(),
    };
    let merged = merge(cli, file_config);

    let token = merged
        .token
        .clone()
        .filter(|t| !t.is_empty())
        .ok_or(AgentError::MissingToken)?;
    let bind = merged
        .bind
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

    let settings = SessionSettings::from_config(&merged);
    tracing::info!(
        %bind,
        shell = %settings.shell,
        proc_root = %settings.proc_root.display(),
        "ccw starting"
    );

    let state = api::AppState::new(settings);
    let registry = state.registry.clone();
    let shutdown = state.shutdown.clone();
    let app = api::router(
        state,
        api::RouterConfig {
            token,
            rate_limit: merged.rate_limit,
        },
    );

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        tracing::info!("received Ctrl+C, shutting down");
        shutdown.shutdown();
    })
    .await?;

    let report = registry.drain();
    tracing::info!(
        terminated = report.terminated,
        failed = report.failed,
        "sessions drained, exiting"
    );
    Ok(())
}

/// Command-line flags win over the config file.
fn merge(cli: Cli, file: AgentConfig) -> AgentConfig {
    let mut bind = cli.bind.or(file.bind).or_else(|| DEFAULT_BIND.parse().ok());
    if let (Some(port), Some(addr)) = (cli.port, bind.as_mut()) {
        addr.set_port(port);
    }
    AgentConfig {
        bind,
        token: cli.token.or(file.token),
        shell: cli.shell.or(file.shell),
        proc_root: cli.proc_root.or(file.proc_root),
        kill_grace_ms: file.kill_grace_ms,
        monitor_interval_secs: file.monitor_interval_secs,
        rate_limit: cli.rate_limit.or(file.rate_limit),
    }
}

fn init_tracing(debug: bool) {
    let default = if debug {
        "ccw=debug,tower_http=debug"
    } else {
        "ccw=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
