use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;

mod track17_logic;
use track17_logic::{config, logger, routes, scheduler, state};

use lib_common::tracking::{
    CoordinatorOptions, DOMAIN, JsonFileStore, SensorRegistry, TrackingClient, TrackingCoordinator,
};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::load_config()?;
    logger::setup_logging(&settings.log_dir, &settings.log_level)?;
    log::info!("Starting server_track17 v{}", lib_common::tracking::VERSION);

    let client = TrackingClient::new(settings.client_config()).context("Invalid 17TRACK client settings")?;
    let sensors = Arc::new(SensorRegistry::new());
    let coordinator = Arc::new(TrackingCoordinator::new(
        client,
        JsonFileStore::new(&settings.storage_path),
        sensors.clone(),
        CoordinatorOptions {
            concurrency_limit: settings.concurrency_limit,
        },
    ));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let projection_handle = tokio::spawn(scheduler::sync_projection(
        coordinator.clone(),
        sensors.clone(),
        shutdown_tx.subscribe(),
    ));
    let delivery_handle = tokio::spawn(scheduler::log_deliveries(
        coordinator.subscribe_events(),
        shutdown_tx.subscribe(),
    ));

    coordinator.load().await;
    // First refresh before serving, so the API never shows an empty snapshot.
    coordinator.request_refresh().await;

    let scheduler_handle = tokio::spawn(scheduler::run(
        coordinator.clone(),
        settings.scan_interval,
        shutdown_tx.subscribe(),
    ));

    let app_state = state::AppState::new(coordinator.clone(), sensors, DOMAIN);
    let routes_handle = tokio::spawn(routes::run(settings.clone(), app_state, shutdown_tx.subscribe()));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate() => {
            log::info!("SIGTERM received, initiating shutdown.");
        }
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    // Wait for components to shut down
    let (_, _, _, served) = tokio::try_join!(projection_handle, delivery_handle, scheduler_handle, routes_handle)?;
    if let Err(e) = served {
        log::error!("Operator API stopped with an error: {:#}", e);
    }

    coordinator.close();
    log::info!("Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term_signal) => {
            term_signal.recv().await;
        }
        Err(e) => {
            log::warn!("Cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    // On non-unix platforms, just wait forever.
    std::future::pending::<()>().await;
}
