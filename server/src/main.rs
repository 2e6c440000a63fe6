// Skymirror - Main Entry Point
//
// This file contains only the application bootstrap logic, CLI commands,
// and initialization. The ingestion loops live in separate modules.

mod consumer;
mod health;
mod metrics;
mod mirror;
mod supervisor;

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenvy::{Error as DotenvError, dotenv, from_filename};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking;
use tracing_subscriber::EnvFilter;

use skymirror_core::config::AppConfig;
use skymirror_core::db::index_store::IndexStore;
use skymirror_core::db::pglock::AdvisoryLock;
use skymirror_core::db::{create_pool, run_migrations};
use skymirror_core::schema;

use crate::consumer::Consumer;
use crate::health::{AppState, build_router};
use crate::metrics::Metrics;
use crate::mirror::{Mirror, MirrorTask};

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

static TRACING_GUARD: OnceLock<non_blocking::WorkerGuard> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(author, version, about = "Skymirror indexer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the mirror and the firehose consumers
    Serve,
    /// Run database migrations
    Migrate,
    /// Register a repository host to consume from
    AddHost {
        /// Base URL of the host, e.g. https://pds.example.com
        url: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_status = load_env_file();
    init_tracing();
    report_env_status(&env_status);

    let cli = Cli::parse();
    let config = AppConfig::load()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_serve(config).await,
        Command::Migrate => run_migrate(config).await,
        Command::AddHost { url } => run_add_host(config, url).await,
    }
}

async fn run_serve(config: AppConfig) -> anyhow::Result<()> {
    info!(
        bind_address = %config.bind_address,
        database_max_connections = config.database_max_connections,
        plc_upstream = %config.plc_upstream,
        plc_lock_id = config.plc_lock_id,
        plc_head_trigger = config.plc_head_trigger,
        "starting skymirror"
    );

    let pool = create_pool(
        config.require_database_url()?,
        config.database_max_connections,
    )
    .await?;
    run_migrations(&pool).await?;

    let (version, plc_db) = schema::connect(&pool, config.plc_head_trigger).await?;
    info!(schema = %version, "directory log schema detected");

    let metrics = Arc::new(Metrics::new());
    let shutdown = CancellationToken::new();

    let mirror = Arc::new(Mirror::new(&config, plc_db, metrics.clone())?);
    let leader_lock = AdvisoryLock::new(pool.clone(), config.plc_lock_id);
    let _ = supervisor::spawn(
        MirrorTask {
            mirror: mirror.clone(),
            lock: leader_lock,
        },
        shutdown.clone(),
    );

    let store = IndexStore::new(pool.clone());
    let hosts = store.list_hosts().await?;
    if hosts.is_empty() {
        warn!("no repository hosts registered; run `skymirror add-host <url>`");
    }
    for host in hosts {
        info!(host = %host.host, cursor = host.cursor, "starting consumer");
        let _ = supervisor::spawn(
            Consumer::new(store.clone(), host, metrics.clone()),
            shutdown.clone(),
        );
    }

    let app = build_router(AppState {
        mirror,
        metrics,
    });
    let listener = TcpListener::bind(config.bind_address)
        .await
        .context("failed to bind socket")?;
    let actual_addr = listener
        .local_addr()
        .context("failed to read local address")?;
    info!("listening on {actual_addr}");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    shutdown.cancel();
    result.context("server terminated with error")
}

async fn run_migrate(config: AppConfig) -> anyhow::Result<()> {
    let pool = create_pool(
        config.require_database_url()?,
        config.database_max_connections,
    )
    .await?;
    run_migrations(&pool).await?;
    let (version, _plc_db) = schema::connect(&pool, config.plc_head_trigger).await?;
    info!(schema = %version, "migrations completed");
    Ok(())
}

async fn run_add_host(config: AppConfig, url: String) -> anyhow::Result<()> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        anyhow::bail!("host URL must not be empty");
    }

    let pool = create_pool(
        config.require_database_url()?,
        config.database_max_connections,
    )
    .await?;
    run_migrations(&pool).await?;

    let store = IndexStore::new(pool);
    let host = store.ensure_host(trimmed).await?;
    info!(host = %host.host, id = host.id, "registered repository host");
    println!("Registered host {} ({})", host.host, host.id);
    Ok(())
}

fn init_tracing() {
    // Emit compact JSON to a rolling file by default; stdout is opt-in for
    // local debugging. Use RUST_LOG to control the level.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let log_to_stdout = std::env::var("SKYMIRROR_LOG_TO_STDOUT")
        .map(|v| !v.trim().is_empty() && v.trim() != "0")
        .unwrap_or(false);

    if log_to_stdout {
        if tracing_subscriber::fmt()
            .with_env_filter(env_filter.clone())
            .with_ansi(false)
            .json()
            .with_writer(std::io::stdout)
            .try_init()
            .is_ok()
        {
            return;
        }
    }

    let log_dir = std::env::var("SKYMIRROR_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    if let Err(err) = std::fs::create_dir_all(&log_dir) {
        eprintln!("failed to create log dir '{log_dir}': {err}");
        std::process::exit(1);
    }
    let file_appender = tracing_appender::rolling::daily(&log_dir, "skymirror.log");
    let (writer, guard) = non_blocking(file_appender);

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .json()
        .with_writer(writer)
        .try_init()
        .is_ok()
    {
        let _ = TRACING_GUARD.set(guard);
    }
}

enum EnvLoadStatus {
    Loaded(PathBuf),
    NotFound,
    Failed(DotenvError),
}

fn load_env_file() -> EnvLoadStatus {
    if let Ok(env_file) = std::env::var("SKYMIRROR_ENV_FILE") {
        let trimmed = env_file.trim();
        if !trimmed.is_empty() {
            let path = PathBuf::from(trimmed);
            return match from_filename(&path) {
                Ok(_) => {
                    let display_path = make_relative(&path).unwrap_or_else(|| path.clone());
                    EnvLoadStatus::Loaded(display_path)
                }
                Err(err) => EnvLoadStatus::Failed(err),
            };
        }
    }

    match dotenv() {
        Ok(path) => {
            let display_path = make_relative(&path).unwrap_or_else(|| path.clone());
            EnvLoadStatus::Loaded(display_path)
        }
        Err(DotenvError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            EnvLoadStatus::NotFound
        }
        Err(err) => EnvLoadStatus::Failed(err),
    }
}

fn report_env_status(status: &EnvLoadStatus) {
    match status {
        EnvLoadStatus::Loaded(path) => {
            info!("Loaded environment variables from {}", path.display());
        }
        EnvLoadStatus::NotFound => {
            info!("No .env file found; using process environment only");
        }
        EnvLoadStatus::Failed(err) => {
            warn!("Failed to load .env file: {err:?}");
        }
    }
}

fn make_relative(path: &Path) -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    path.strip_prefix(&cwd).map(|p| p.to_path_buf()).ok()
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = term.recv() => {},
            _ = int.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
