mod acceptor;
mod config;
mod http_api;
mod models;
mod mqtt_service;
mod reconciler;
mod service_utils;
mod throttle;

use crate::acceptor::MessageAcceptor;
use crate::config::Config;
use crate::http_api::HttpApi;
use crate::mqtt_service::{ConnectionOptions, ConnectionPool};
use crate::reconciler::{Reconciler, ReconcilerOptions};
use crate::service_utils::{handle_shutdown, start_reconciler};
use crate::throttle::ThrottleState;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing_subscriber::fmt().init();
            error!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging; the level was validated with the config
    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level().unwrap_or(tracing::Level::INFO))
        .init();

    let api = match HttpApi::from_config(&config) {
        Ok(api) => Arc::new(api),
        Err(e) => {
            error!("Failed to create HTTP client: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let throttle = Arc::new(ThrottleState::new());
    let acceptor = Arc::new(MessageAcceptor::new(api.clone(), throttle.clone()));
    let pool = Arc::new(ConnectionPool::new(ConnectionOptions::from_config(&config)));

    let reconciler = Arc::new(Reconciler::new(
        api,
        pool.clone(),
        acceptor,
        throttle,
        ReconcilerOptions {
            prune_stale: config.prune_stale_devices,
            dedup_retention: config.dedup_retention(),
        },
    ));

    info!(
        "Relay started, refreshing settings from {} every {:?}",
        config.settings_api_url,
        config.refresh_interval()
    );
    let reconciler_task = start_reconciler(reconciler, config.refresh_interval());

    handle_shutdown(pool, reconciler_task).await;
    info!("All connections closed.");
    ExitCode::SUCCESS
}
