//! Background tasks: the periodic refresh, entity sync and the delivery log.
//! Each runs until the shutdown broadcast fires.

use std::sync::Arc;
use std::time::Duration;

use lib_common::tracking::{DeliveredEvent, IdentifierStore, SensorRegistry, TrackingApi, TrackingCoordinator};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// Refreshes every `every`, starting one period from now.
pub async fn run<A, S>(coordinator: Arc<TrackingCoordinator<A, S>>, every: Duration, mut shutdown: broadcast::Receiver<()>)
where
    A: TrackingApi,
    S: IdentifierStore,
{
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    log::info!("Scheduled refresh every {:?}", every);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Scheduler received shutdown signal.");
                break;
            }
            _ = ticker.tick() => {
                log::debug!("Scheduled refresh starting");
                coordinator.request_refresh().await;
            }
        }
    }
}

/// Registers a sensor for every tracked number each time a snapshot is published.
pub async fn sync_projection<A, S>(
    coordinator: Arc<TrackingCoordinator<A, S>>,
    sensors: Arc<SensorRegistry>,
    mut shutdown: broadcast::Receiver<()>,
) where
    A: TrackingApi,
    S: IdentifierStore,
{
    let mut snapshots = coordinator.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let numbers = coordinator.tracking_numbers().await;
                let added = sensors.sync_entities(&numbers);
                if added > 0 {
                    log::info!("Registered {} new package sensors", added);
                }
            }
        }
    }
}

/// Logs every delivered event.
pub async fn log_deliveries(mut events: broadcast::Receiver<DeliveredEvent>, mut shutdown: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            event = events.recv() => match event {
                Ok(event) => log::info!(
                    "{}: package {} delivered (carrier: {})",
                    event.event_type(),
                    event.tracking_number,
                    event.data.carrier().map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string())
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Delivery log lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
