// Entry point for a standalone runner manager.
//
// Serves a runner pool: remote hosts configured with the remote backend ask
// this process to start, stop and probe runners on its local or container
// backend.

use anyhow::{Context, Result};
use clap::Parser;
use coderun_common::settings::{BackendKind, RuntimeSettings};
use coderun_common::HostContext;
use coderun_manager::{build_backend, ManagerOptions, RunnerManager, RunnerPoolServer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Command-line arguments for the runner manager.
#[derive(Parser, Debug)]
#[command(name = "coderun-manager", version, about = "coderun runner pool manager")]
struct Args {
    /// Address the pool server listens on.
    #[arg(long, default_value = "0.0.0.0:9400")]
    listen: String,

    /// Settings file. Defaults to $CODERUN_SETTINGS, then built-in defaults.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Runner backend for this pool: local or container.
    #[arg(long)]
    backend: Option<BackendKind>,
}

fn main() {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build Tokio runtime");

    let exit_code = runtime.block_on(async move {
        match run(args).await {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!("Runner manager failed: {:#}", e);
                1
            }
        }
    });

    std::process::exit(exit_code);
}

async fn run(args: Args) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let mut settings = RuntimeSettings::load(args.settings.as_deref())?;
    if let Some(backend) = args.backend {
        settings.backend = backend;
    }
    anyhow::ensure!(
        settings.backend != BackendKind::Remote,
        "a runner pool must provision runners itself; use the local or container backend"
    );

    tracing::info!("Runner manager starting.");
    tracing::info!("  Backend = {}", settings.backend);
    tracing::info!("  Listen  = {}", args.listen);

    let context = HostContext::new("Manager", settings.clone());
    let backend = build_backend(&context, &settings).await?;
    backend
        .health()
        .await
        .context("runner backend is not usable")?;

    // Runners started for remote hosts dial the address carried by each
    // start request, so the pool has no worker address of its own.
    let manager = Arc::new(RunnerManager::new(
        &context,
        backend,
        ManagerOptions::from_settings(&settings, String::new()),
    ));

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to listen on {}", args.listen))?;
    let server = RunnerPoolServer::new(manager.clone(), &context);
    let serving = tokio::spawn(server.serve(listener, context.shutdown_token()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for ctrl-c")?;
    context.shutdown();
    serving.await.context("pool server task panicked")??;

    manager.shutdown().await?;
    tracing::info!("Runner manager stopped.");
    Ok(())
}
