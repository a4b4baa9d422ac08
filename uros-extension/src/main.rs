//! micro-ROS agent extension - supervises the agent and serves its control API

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use uros_core::{ExtensionConfig, SettingsStore};
use uros_supervisor::{LogCapture, ProcessSupervisor, launch_command_line};

#[derive(Parser)]
#[command(name = "uros-extension")]
#[command(about = "BlueOS extension supervising the micro-ROS agent", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the extension: control API plus the supervised agent
    Serve {
        /// Configuration file (TOML)
        #[arg(short, long, env = "UROS_CONFIG")]
        config: Option<PathBuf>,

        /// Override the listen address
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },
    /// Print the agent command line the saved settings produce
    Args {
        /// Configuration file (TOML)
        #[arg(short, long, env = "UROS_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, bind } => serve(config, bind).await?,
        Commands::Args { config } => {
            let config = ExtensionConfig::load(config.as_deref())
                .context("Failed to load extension configuration")?;
            let settings = SettingsStore::open(&config.settings.path);
            let agent = settings.get();
            agent
                .validate()
                .context("Saved settings cannot be launched")?;
            println!("{}", launch_command_line(&config.agent, &agent).join(" "));
        }
        Commands::Version => {
            println!("uros-extension {}", env!("CARGO_PKG_VERSION"));
            println!("uros-core {}", uros_core::VERSION);
        }
    }

    Ok(())
}

async fn serve(config_path: Option<PathBuf>, bind: Option<SocketAddr>) -> Result<()> {
    let mut config = ExtensionConfig::load(config_path.as_deref())
        .context("Failed to load extension configuration")?;
    if let Some(bind) = bind {
        config.server.bind = bind;
    }

    let settings = Arc::new(SettingsStore::open(&config.settings.path));
    info!("Using settings file {}", settings.path().display());
    let logs = Arc::new(LogCapture::new(&config.logs));
    let supervisor = ProcessSupervisor::new(config.agent.clone(), settings, logs);
    info!("micro-ROS agent extension started");

    // Auto-start in the background so the API is reachable during the grace window.
    // Failures are logged by resume and visible through /status.
    tokio::spawn({
        let supervisor = supervisor.clone();
        async move {
            let _ = supervisor.resume().await;
        }
    });

    // Flipped to true once a shutdown signal arrives; ends open log streams
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = uros_extension::app(
        Arc::new(supervisor.clone()),
        shutdown_rx,
        config.server.static_dir.as_deref(),
    );

    let listener = tokio::net::TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!("Control API listening on http://{}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown requested, closing log streams");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("HTTP server error")?;

    info!("Shutting down, stopping micro-ROS agent");
    supervisor.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
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
}
