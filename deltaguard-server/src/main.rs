use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use deltaguard_server::{
    AppState,
    infra::{
        config::{Config, ConfigLoader},
        startup::{build_hub, spawn_dispatcher},
    },
    routes,
    watch::{WatchArgs, run_watch},
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time allowed past the scanner grace period for supervisors to finish.
const SCAN_DRAIN_MARGIN: Duration = Duration::from_secs(5);

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "deltaguard-server")]
#[command(about = "Scan job server with live job and progress streams")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long)]
    host: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Follow a running server's job and progress streams
    Watch(WatchArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_runtime_config(&cli.serve)?;

    match cli.command {
        Some(Command::Watch(args)) => run_watch(args, config.client.clone()).await,
        None => run_server(config).await,
    }
}

fn load_runtime_config(args: &ServeArgs) -> anyhow::Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_config_path(path);
    }
    let mut config = loader.load().context("failed to load configuration")?;

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host.clone() {
        config.server.host = host;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Override via RUST_LOG.
                "info,deltaguard_core=info,tower_http=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    match &config.metadata.config_path {
        Some(path) => info!(path = %path.display(), "configuration file loaded"),
        None => info!("no deltaguard.toml found; using environment and defaults"),
    }

    Ok(config)
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let hub = build_hub(&config).await?;
    let state = AppState::new(Arc::clone(&hub), Arc::clone(&config));

    let scans = state.scans.clone();
    let dispatcher = spawn_dispatcher(
        Arc::clone(&hub),
        scans.clone(),
        config.server.dispatch_interval,
        state.shutdown.child_token(),
    );

    let addr = config
        .socket_addr()
        .with_context(|| format!("invalid listen address {}:{}", config.server.host, config.server.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        "Starting deltaguard server on {}:{}",
        config.server.host, config.server.port
    );

    let shutdown = state.shutdown.clone();
    let app = routes::create_app(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await
        .context("server error")?;

    info!("shutting down");
    if let Err(err) = dispatcher.await {
        warn!(error = %err, "job dispatcher ended abnormally");
    }
    hub.shutdown().await;
    let limit = config.runner.grace_period + SCAN_DRAIN_MARGIN;
    for (job, result) in scans.drain(limit).await {
        if let Err(err) = result {
            warn!(job = %job, error = %err, "scan ended with an error during shutdown");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
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
