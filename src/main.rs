use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use turnstile::config::{LogFormat, LoggingConfig, StoreBackend, StoreConfig, TurnstileConfig};
use turnstile::http::HttpServer;
use turnstile::ratelimit::{
    BreakerStore, CounterStore, MemoryCounterStore, PolicySelector, RedisCounterStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Turnstile request admission limiter")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, value_name = "FILE", env = "TURNSTILE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long, value_name = "ADDR")]
    http_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = TurnstileConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.http_addr {
        config.server.http_addr = addr;
    }

    init_tracing(&config.logging);

    info!("Starting Turnstile Request Admission Limiter");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        http_addr = %config.server.http_addr,
        store = ?config.store.backend,
        roles = config.policies.roles.len(),
        "Configuration loaded"
    );

    let (store, memory_store) = if config.policies.uses_shared_store() {
        let (store, memory) = build_store(&config.store).await?;
        (Some(store), memory)
    } else {
        info!("No policy uses the shared store; counting in process only");
        (None, None)
    };

    let selector = Arc::new(
        config
            .policies
            .build_selector(store.clone(), &config.limiter)?,
    );
    info!("Rate limit policies initialized");

    spawn_sweeper(
        selector.clone(),
        memory_store,
        Duration::from_secs(config.limiter.sweep_interval_secs.max(1)),
    );

    let mut server = HttpServer::new(config.server.http_addr, selector)
        .trust_forwarded_for(config.server.trust_forwarded_for)
        .trust_identity_headers(config.server.trust_identity_headers);
    if let Some(store) = store {
        server = server.with_store(store);
    }

    if let Err(e) = server.serve_with_shutdown(shutdown_signal()).await {
        error!(error = %e, "Server exited with error");
        return Err(e.into());
    }

    info!("Turnstile stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_current_span(true)
            .init(),
    }
}

/// Build the counter store. The in-memory store is also returned on its own
/// so that expired counters can be purged.
async fn build_store(
    config: &StoreConfig,
) -> anyhow::Result<(Arc<dyn CounterStore>, Option<Arc<MemoryCounterStore>>)> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory counter store; counts are not shared between instances");
            let memory = Arc::new(MemoryCounterStore::new());
            let store: Arc<dyn CounterStore> = memory.clone();
            Ok((store, Some(memory)))
        }
        StoreBackend::Redis => {
            let redis = RedisCounterStore::connect(&config.redis_url, config.key_prefix.clone())
                .await?;
            let store: Arc<dyn CounterStore> =
                Arc::new(BreakerStore::new(redis, &config.circuit_breaker));
            Ok((store, None))
        }
    }
}

/// Periodically drop idle token buckets and expired in-memory counters.
fn spawn_sweeper(
    selector: Arc<PolicySelector>,
    memory_store: Option<Arc<MemoryCounterStore>>,
    every: Duration,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            interval.tick().await;
            let buckets = selector.sweep(Instant::now());
            let counters = memory_store.as_ref().map_or(0, |store| store.purge_expired());
            if buckets > 0 || counters > 0 {
                debug!(buckets, counters, "Swept idle rate limit state");
            }
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
