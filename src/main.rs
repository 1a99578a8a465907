// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use converge::{
    api::{self, AppState},
    config::{Config, StoreBackend},
    constants::TOKIO_WORKER_THREADS,
    events::EventBus,
    gateway::WriteGateway,
    registry::{ReconcilerContext, ReconcilerRegistry},
    scheduler::Scheduler,
    store::{memory::MemStore, postgres::PgStore, Store},
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Declarative control plane for external infrastructure.
#[derive(Parser, Debug)]
#[command(name = "converge", version, about)]
struct Args {
    /// Port for the REST API and SSE streams (overrides CONVERGE_API_PORT)
    #[arg(long)]
    api_port: Option<u16>,

    /// Store backend (overrides CONVERGE_STORE_BACKEND)
    #[arg(long, value_enum)]
    store_backend: Option<StoreBackend>,

    /// PostgreSQL host (overrides CONVERGE_DB_HOST)
    #[arg(long)]
    db_host: Option<String>,

    /// PostgreSQL database name (overrides CONVERGE_DB_NAME)
    #[arg(long)]
    db_name: Option<String>,
}

fn main() -> Result<()> {
    // Build Tokio runtime with custom thread names
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(TOKIO_WORKER_THREADS)
        .thread_name("converge")
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

/// Initialize logging with custom format
///
/// Respects `RUST_LOG` environment variable if set, otherwise defaults to
/// INFO level. Respects `RUST_LOG_FORMAT` for output format (json or text).
fn initialize_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let log_format = std::env::var("RUST_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    match log_format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .with_ansi(true)
                .compact()
                .init();
        }
    }

    info!("Starting Converge control plane");
    debug!("Logging initialized with file and line number tracking");
}

/// Resolve configuration from environment with CLI overrides.
fn load_config(args: &Args) -> Config {
    let mut cfg = Config::from_env();
    if let Some(port) = args.api_port {
        cfg.api_port = port;
    }
    if let Some(backend) = args.store_backend {
        cfg.store_backend = backend;
    }
    if let Some(host) = &args.db_host {
        cfg.db_host = host.clone();
    }
    if let Some(name) = &args.db_name {
        cfg.db_name = name.clone();
    }
    cfg
}

/// Build the store backend.
async fn initialize_store(cfg: &Config) -> Result<Arc<dyn Store>> {
    match cfg.store_backend {
        StoreBackend::Postgres => {
            info!(
                host = %cfg.db_host,
                port = cfg.db_port,
                dbname = %cfg.db_name,
                "Connecting to PostgreSQL"
            );
            let store = PgStore::connect(cfg)?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store backend; state will not survive a restart");
            Ok(Arc::new(MemStore::new()))
        }
    }
}

/// Populate the reconciler registry.
///
/// Reconcilers and action plugins are an extension point: embedders register
/// their implementations here (or link this crate as a library and build
/// their own binary). The stock binary ships none.
fn build_registry() -> Result<ReconcilerRegistry> {
    let registry = ReconcilerRegistry::new();
    Ok(registry)
}

async fn async_main() -> Result<()> {
    let args = Args::parse();
    initialize_logging();
    let cfg = load_config(&args);

    let store = initialize_store(&cfg).await?;
    let bus = Arc::new(EventBus::new(cfg.event_queue_capacity));
    let registry = Arc::new(build_registry()?);
    if registry.is_empty() {
        warn!("No reconciler plugins registered; resource creation will be rejected");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = Arc::new(ReconcilerContext::new(
        Arc::clone(&store),
        registry.actions(),
        shutdown_rx.clone(),
        cfg.drift_interval_chrono(),
    ));

    let gateway = Arc::new(WriteGateway::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&registry),
    )?);

    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&bus),
        Arc::clone(&ctx),
        cfg.clone(),
        shutdown_rx.clone(),
    );

    registry.start_all(Arc::clone(&ctx)).await;
    let scheduler_handle = tokio::spawn(scheduler.run());

    let state = Arc::new(AppState {
        store,
        gateway,
        bus: Arc::clone(&bus),
        registry: Arc::clone(&registry),
    });
    let api_port = cfg.api_port;
    let mut api_handle = tokio::spawn(api::serve(state, api_port));

    // Run until a termination signal arrives or the API server dies
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            result?;
        }
        result = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate())?;
                sigterm.recv().await;
                Ok::<(), anyhow::Error>(())
            }
            #[cfg(not(unix))]
            {
                // On non-Unix platforms, just wait forever
                std::future::pending::<()>().await;
                Ok::<(), anyhow::Error>(())
            }
        } => {
            info!("Received SIGTERM, initiating graceful shutdown...");
            result?;
        }
        result = &mut api_handle => {
            match result {
                Ok(inner) => inner?,
                Err(e) => anyhow::bail!("API server task failed: {e}"),
            }
            anyhow::bail!("API server exited unexpectedly");
        }
    }

    // Signal everything, then drain in dependency order
    shutdown_tx.send(true).ok();
    registry.stop_all(cfg.shutdown_grace).await;
    if let Err(e) = scheduler_handle.await {
        warn!(error = %e, "Scheduler task ended abnormally");
    }
    bus.shutdown();
    api_handle.abort();

    info!("Graceful shutdown completed successfully");
    Ok(())
}
