use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use turnstile::config::AdmissionConfig;
use turnstile::http::{router, HttpServer};
use turnstile::ratelimit::{Clock, MemoryStore, SystemClock, Tiers};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Tiered request-admission control service.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration
    #[arg(short, long)]
    listen: Option<String>,

    /// Behaviour when the window store fails, overriding the configuration
    #[arg(long, value_parser = ["fail_open", "fail_closed"])]
    on_store_error: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init(),
    }

    info!("Starting Turnstile admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut overrides = Vec::new();
    if let Some(listen) = cli.listen {
        overrides.push(("server.listen_addr", listen));
    }
    if let Some(mode) = cli.on_store_error {
        overrides.push(("rate_limiting.on_store_error", mode));
    }

    let config = AdmissionConfig::load(cli.config.as_deref(), &overrides)?;
    info!(
        listen_addr = %config.server.listen_addr,
        trust_forwarded_for = config.server.trust_forwarded_for,
        on_store_error = ?config.rate_limiting.on_store_error,
        bypass_env_var = %config.rate_limiting.bypass_env_var,
        "Configuration loaded"
    );

    // One store shared by every tier
    let store = Arc::new(MemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let tiers = Tiers::from_config(&config.rate_limiting, store.clone(), clock.clone())?;
    info!("Rate limit tiers initialized");

    let gc = tokio::spawn(purge_expired(
        store,
        clock,
        config.rate_limiting.gc_interval(),
    ));

    let server = HttpServer::new(
        config.server.listen_addr,
        router(tiers, config.server.trust_forwarded_for),
    );
    server.serve_with_shutdown(shutdown_signal()).await?;

    gc.abort();
    info!("Turnstile admission service stopped");
    Ok(())
}

/// Periodically drop windows that have elapsed.
async fn purge_expired(store: Arc<MemoryStore>, clock: Arc<dyn Clock>, every: std::time::Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let removed = store.purge_expired(clock.now());
        debug!(removed = removed, tracked = store.len(), "Window purge complete");
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
