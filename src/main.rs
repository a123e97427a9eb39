use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{Settings, StoreBackend};
use gatekeeper::http;
use gatekeeper::ratelimit::{LimitRegistry, RateLimiter};
use gatekeeper::store::{CounterStore, LocalStore, RedisBackend, RemoteStore};

#[derive(Parser, Debug)]
#[command(name = "gatekeeper")]
#[command(about = "Per-client fixed-window rate limiting service", version)]
struct Args {
    /// Path to a YAML settings file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref())?;

    init_tracing(settings.logging.json);

    info!("Starting Gatekeeper Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        listen_addr = %settings.server.listen_addr,
        backend = ?settings.store.backend,
        failure_policy = ?settings.limits.failure_policy,
        clients = settings.limits.clients.len(),
        "Configuration loaded"
    );

    let limits = Arc::new(LimitRegistry::new(settings.limits.table()));

    // Kept so the sweeper can be stopped once the server has drained.
    let mut local_store = None;
    let store: Arc<dyn CounterStore> = match settings.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(LocalStore::new(settings.store.local_store_config())?);
            local_store = Some(Arc::clone(&store));
            store
        }
        StoreBackend::Redis => {
            let backend = RedisBackend::connect(&settings.store.redis_url).await?;
            Arc::new(
                RemoteStore::new(backend).with_command_timeout(settings.store.command_timeout()),
            )
        }
    };

    let rate_limiter = Arc::new(
        RateLimiter::new(store, limits).with_failure_policy(settings.limits.failure_policy),
    );
    info!("Rate limiter initialized");

    let app = http::router(rate_limiter);
    let listener = tokio::net::TcpListener::bind(settings.server.listen_addr).await?;
    info!("Starting HTTP server on {}", settings.server.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(store) = local_store {
        store.shutdown();
    }

    info!("Gatekeeper Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
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
