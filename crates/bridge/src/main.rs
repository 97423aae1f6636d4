//! Bridge daemon entry point.
//!
//! Wires a southbound and a northbound backend into the exchange and runs
//! until SIGINT/SIGTERM. Concrete MQTT/gRPC transports plug in through
//! the backend traits; the default wiring uses the in-memory backend on
//! both sides, which is enough to exercise the whole relay path locally.

use anyhow::Result;
use auth::MemoryAuthStore;
use backend::DummyBackend;
use exchange::Exchange;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting gateway bridge");

    let workers: usize = env::var("BRIDGE_WORKERS")
        .unwrap_or_else(|_| "4".to_string())
        .parse()
        .expect("BRIDGE_WORKERS must be a number");
    let poll_interval_secs: u64 = env::var("BRIDGE_POLL_INTERVAL_SECS")
        .unwrap_or_else(|_| "60".to_string())
        .parse()
        .expect("BRIDGE_POLL_INTERVAL_SECS must be a number");
    let metrics_port: u16 = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9090".to_string())
        .parse()
        .expect("METRICS_PORT must be a number");

    info!("Configuration:");
    info!("  BRIDGE_WORKERS: {}", workers);
    info!("  BRIDGE_POLL_INTERVAL_SECS: {}", poll_interval_secs);
    info!("  METRICS_PORT: {}", metrics_port);

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
        .expect("Failed to start Prometheus exporter");
    info!("Prometheus metrics server started on port {}", metrics_port);

    let gateways = Arc::new(DummyBackend::new("gateways"));
    let router = Arc::new(DummyBackend::new("router"));

    let mut exchange = Exchange::new(Arc::new(MemoryAuthStore::new()));
    exchange.add_southbound(gateways);
    exchange.add_northbound(router);
    let exchange = Arc::new(exchange);

    exchange
        .start(workers, Duration::from_secs(poll_interval_secs))
        .await?;
    info!("Bridge running");

    shutdown_signal().await;

    info!("Shutting down bridge...");
    exchange.stop().await;
    info!("Bridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
