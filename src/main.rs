use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use buildcache::breaker::CircuitBreaker;
use buildcache::cache::MemoryCache;
use buildcache::config::{self, Config};
use buildcache::http::create_router;
use buildcache::idle::IdleWatchdog;
use buildcache::shutdown::{ShutdownCoordinator, ShutdownReason};
use buildcache::spool::UploadSpooler;
use buildcache::storage::{ObjectStore, S3Store};
use buildcache::AppState;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "buildcache", about = "S3 Build Cache Proxy")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "buildcache.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

fn init_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file: {path}"))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// S3 client setup
// ---------------------------------------------------------------------------

async fn build_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let mut loader = aws_config::from_env();
    if let Some(region) = &config.s3.region {
        loader = loader.region(aws_config::Region::new(region.clone()));
    }
    let aws_config = loader.load().await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(true)
        .build();

    aws_sdk_s3::Client::from_conf(s3_config)
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI + config ----
    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    init_tracing(&config)?;
    tracing::info!(config_path = %cli.config, "starting buildcache");

    // ---- Spool directory ----
    // Leftovers from a previous run are stale; the tree is purged before the
    // listener accepts its first request.
    let spooler = Arc::new(UploadSpooler::new(
        &config.async_upload.cache_dir,
        config.async_upload.max_pending_upload_mb,
    ));
    spooler.purge_all().await.with_context(|| {
        format!(
            "failed to purge spool directory: {}",
            config.async_upload.cache_dir
        )
    })?;
    spooler.ensure_root().await.with_context(|| {
        format!(
            "failed to create spool directory: {}",
            config.async_upload.cache_dir
        )
    })?;

    // ---- S3 client ----
    let s3 = build_s3_client(&config).await;
    tracing::info!(
        bucket = %config.s3.bucket,
        prefix = %config.s3.prefix,
        "S3 client initialised"
    );
    let store: Arc<dyn ObjectStore> = Arc::new(S3Store::new(
        s3,
        config.s3.bucket.clone(),
        config.s3.prefix.clone(),
    ));

    // ---- Shutdown + idle watchdog ----
    let shutdown = ShutdownCoordinator::new();
    let idle = Arc::new(IdleWatchdog::new(
        (config.proxy.idle_minutes > 0)
            .then(|| Duration::from_secs(config.proxy.idle_minutes * 60)),
    ));
    Arc::clone(&idle).spawn(shutdown.clone());

    // Signals request a clean shutdown through the same coordinator the idle
    // watchdog and the /shutdown route use.
    {
        let coordinator = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            coordinator.trigger(ShutdownReason::Requested);
        });
    }

    // ---- App state ----
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        store,
        cache: MemoryCache::new(
            config.memory_cache.max_total_bytes,
            config.memory_cache.max_entry_bytes,
        ),
        spooler: Arc::clone(&spooler),
        breaker: CircuitBreaker::new(
            config.breaker.errors_before_pausing,
            Duration::from_secs(config.breaker.pause_minutes * 60),
        ),
        idle,
        shutdown: shutdown.clone(),
    });

    // ---- HTTP server ----
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind((config.proxy.host.as_str(), config.proxy.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.proxy.host, config.proxy.port))?;
    tracing::info!(host = %config.proxy.host, port = config.proxy.port, "listening");

    let graceful = {
        let coordinator = shutdown.clone();
        async move {
            coordinator.wait().await;
        }
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(graceful)
        .await
        .context("HTTP server error")?;

    // ---- Teardown ----
    let reason = shutdown.reason().unwrap_or(ShutdownReason::Requested);
    tracing::info!(reason = reason.as_str(), "shutting down");
    if let Err(e) = spooler.purge_all().await {
        tracing::warn!(error = %e, "failed to purge spool directory on shutdown");
    }
    std::process::exit(reason.exit_code());
}
