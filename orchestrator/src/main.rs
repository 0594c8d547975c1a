use anyhow::Context;
use clap::Parser;
use orchestrator::engine::SimulatedEngine;
use orchestrator::{api, observability, AppState, Config, Database, Orchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

/// Transcription Orchestrator - resumable single-engine job runner
#[derive(Parser, Debug)]
#[command(name = "transcribe-orchestrator")]
#[command(about = "Runs transcription jobs with checkpointing and crash recovery")]
#[command(version)]
struct Cli {
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path (default: ~/.transcribe/orchestrator.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Write a default config file to the config path and exit
    #[arg(long)]
    write_default_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if cli.write_default_config {
        observability::init_simple_logging(cli.log_level.as_deref().unwrap_or("info"))?;
        Config::default()
            .save(&config_path)
            .with_context(|| format!("writing {}", config_path.display()))?;
        println!("Wrote default configuration to {}", config_path.display());
        return Ok(());
    }

    let mut config = Config::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    if config.logging.log_to_file {
        observability::init_production_logging(&config.logging.level, config.logging.log_dir.clone())?;
    } else {
        observability::init_simple_logging(&config.logging.level)?;
    }

    info!("Starting Transcription Orchestrator");

    // Initialize database
    let db_path = config.database_path();
    info!(path = %db_path.display(), "Using database");
    let db_path_str = db_path.to_str().with_context(|| {
        format!(
            "Invalid database path (contains invalid UTF-8): {}",
            db_path.display()
        )
    })?;
    let db = Database::new(db_path_str)?;
    db.migrate()?;

    let engine = Arc::new(SimulatedEngine::new(config.engine.simulated.clone()));
    let orchestrator = Arc::new(
        Orchestrator::open(db, engine, config.orchestrator_config())
            .await
            .context("opening orchestrator")?,
    );

    let report = orchestrator.start().await?;
    info!(
        resumed = report.resumed(),
        restarted = report.restarted(),
        failed = report.errors.len(),
        "Startup recovery complete"
    );

    let app = api::create_router(AppState::new(orchestrator.clone()));

    let addr = format!("{}:{}", config.server.bind_address, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(address = %addr, "Orchestrator listening");

    // Start server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    orchestrator.shutdown().await;
    info!("Orchestrator shut down");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
