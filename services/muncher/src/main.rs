// muncher: subscribes to configured label publishers and ingests their
// signed labels into the relational label store.

use muncher::{Config, Muncher, PgLabelStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt().with_env_filter(EnvFilter::new(log_level)).init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    info!(
        publishers = config.labeler_dids.len(),
        takedowns = config.mod_service_did.is_some(),
        "muncher starting"
    );

    let sink = match PgLabelStore::connect(&config.database_url, &config.database_schema).await {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("FATAL: failed to connect to label store: {e}");
            std::process::exit(1);
        }
    };

    let mut muncher = Muncher::new(config, sink);
    if let Err(e) = muncher.start() {
        eprintln!("FATAL: startup failed: {e}");
        std::process::exit(1);
    }

    shutdown_signal().await;
    muncher.stop().await;
    info!("muncher shut down cleanly");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
