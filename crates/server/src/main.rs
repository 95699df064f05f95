// crates/server/src/main.rs
//! pi-brain binary: runs the daemon and the HTTP/WS API in one process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use pi_brain_core::Config;
use pi_brain_daemon::{Daemon, PiCliAnalyzer};
use pi_brain_db::Database;
use pi_brain_server::{create_app, AppState};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Shutdown deadline for draining workers and in-flight responses.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(20);

#[derive(Parser)]
#[command(name = "pi-brain", version, about = "Local second brain for coding-agent sessions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon and API server in the foreground.
    Start {
        /// Override the API port from config.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Query a running daemon's status.
    Status,
    /// Print the config file path.
    ConfigPath,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Start { port } => start(port).await,
        Command::Status => status().await,
        Command::ConfigPath => {
            let path = pi_brain_core::paths::config_path()
                .context("could not determine home directory")?;
            println!("{}", path.display());
            Ok(())
        }
    }
}

fn init_tracing(log_dir: Option<PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt::layer().compact();

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, "daemon.log");
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(env_filter).with(fmt).init();
            None
        }
    }
}

async fn start(port_override: Option<u16>) -> Result<()> {
    let brain_home = pi_brain_core::paths::brain_home().context("no home directory")?;
    std::fs::create_dir_all(&brain_home)?;
    let _log_guard = init_tracing(Some(brain_home.clone()));

    // Fail fast on a bad config file.
    let config = Config::load_default()?;
    let config_path = pi_brain_core::paths::config_path();

    // Open the store: integrity check, migrations.
    let db = Database::open_default().await?;

    // PID file for external tooling.
    let pid_path = brain_home.join("daemon.pid");
    std::fs::write(&pid_path, std::process::id().to_string())?;

    let analyzer = Arc::new(PiCliAnalyzer::default());
    let daemon = Daemon::start(config.clone(), db.clone(), analyzer)
        .await
        .context("daemon failed to start")?;

    let state = AppState::with_daemon(db, config.clone(), config_path, daemon);
    let app = create_app(state.clone());

    let port = port_override.unwrap_or(config.api.port);
    let host = if config.api.host == "localhost" {
        "127.0.0.1".to_string()
    } else {
        config.api.host.clone()
    };
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("could not bind {addr}"))?;
    info!(%addr, "pi-brain API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // API is down; drain the daemon.
    if let Some(daemon) = state.daemon.write().await.take() {
        daemon.shutdown(SHUTDOWN_DEADLINE).await;
    }
    if let Err(e) = std::fs::remove_file(&pid_path) {
        warn!(error = %e, "could not remove pid file");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown requested");
}

async fn status() -> Result<()> {
    let config = Config::load_default()?;
    let url = format!("http://127.0.0.1:{}/daemon/status", config.api.port);
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("daemon not reachable at {url}"))?;
    let body: serde_json::Value = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
