use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use runner_relay::bus::LocalBus;
use runner_relay::config::{CoordinatorArgs, RunnerArgs};
use runner_relay::coordinator::{Coordinator, MemoryStore};
use runner_relay::runner::{CommandExecutor, HttpCoordinatorClient, Runner, runner_routes};
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "runner-relay", version, about = "Distribute script and tool work to remote runners")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept runner connections and route work to them
    Coordinator(CoordinatorArgs),
    /// Poll a coordinator for tasks and execute them
    Runner(RunnerArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Coordinator(args) => run_coordinator(args).await,
        Command::Runner(args) => run_runner(args).await,
    }
}

async fn run_coordinator(args: CoordinatorArgs) -> anyhow::Result<()> {
    let config = args.to_config()?;
    let coordinator = Coordinator::new(&config, Arc::new(LocalBus::new()), Arc::new(MemoryStore::new()));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind coordinator to {addr}"))?;
    info!(
        addr = %addr,
        token_required = config.runner_token.is_some(),
        request_timeout_secs = config.request_timeout.as_secs(),
        "Coordinator listening"
    );

    let bridge = Arc::clone(coordinator.bridge());
    axum::serve(listener, coordinator.router())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!(sessions = bridge.session_count(), "Closing runner sessions");
            bridge.shutdown();
        })
        .await
        .context("Coordinator server failed")?;

    info!("Coordinator stopped");
    Ok(())
}

async fn run_runner(args: RunnerArgs) -> anyhow::Result<()> {
    let config = args.to_config()?;
    let client = HttpCoordinatorClient::new(config.api_host.clone(), config.api_token.clone())?;
    let executor = CommandExecutor::new(
        args.executor_command.clone(),
        args.executor_args.clone(),
        Duration::from_secs(args.executor_timeout_seconds),
    );

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind runner server to {addr}"))?;

    let runner = Runner::new(config, Arc::new(client), Arc::new(executor));
    runner
        .initialize()
        .await
        .context("Initial state report to the coordinator failed")?;

    let app = runner_routes(Arc::clone(&runner));
    let server = tokio::spawn(async move {
        info!(addr = %addr, "Runner server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Runner server failed");
        }
    });

    let control = tokio::spawn(Arc::clone(&runner).run());

    shutdown_signal().await;
    info!("Shutting down runner");
    runner.shutdown();
    control.await.context("Runner control loop panicked")?;
    server.abort();

    info!("Runner stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
