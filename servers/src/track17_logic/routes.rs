use crate::track17_logic::config::Settings;
use crate::track17_logic::state::AppState;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use lib_common::tracking::{
    IdentifierStore, SensorState, TrackingApi, projection::{DeviceInfo, device_info}, validate_identifier,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use tokio::sync::broadcast;

#[derive(Debug, Deserialize)]
pub struct AddPackage {
    pub tracking_number: String,
}

#[derive(Debug, Serialize)]
pub struct PackagesView {
    pub device: DeviceInfo,
    pub sensors: Vec<SensorState>,
}

pub fn router<A, S>(state: AppState<A, S>) -> Router
where
    A: TrackingApi,
    S: IdentifierStore,
{
    Router::new()
        .route("/health", get(health_handler::<A, S>))
        .route("/api/packages", get(list_packages::<A, S>).post(add_package::<A, S>))
        .route("/api/packages/{tracking_number}", delete(remove_package::<A, S>))
        .route("/api/packages/{tracking_number}/refresh", post(refresh_package::<A, S>))
        .route("/api/refresh", post(refresh_all::<A, S>))
        .with_state(state)
}

pub async fn run<A, S>(settings: Settings, state: AppState<A, S>, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()>
where
    A: TrackingApi,
    S: IdentifierStore,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Operator API listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Operator API shutting down.");
        })
        .await?;
    Ok(())
}

async fn health_handler<A, S>(State(state): State<AppState<A, S>>) -> impl IntoResponse
where
    A: TrackingApi,
    S: IdentifierStore,
{
    let tracked = state.coordinator.tracking_numbers().await.len();
    Json(json!({
        "status": "ok",
        "tracked": tracked,
        "refreshing": state.coordinator.is_refreshing(),
    }))
}

async fn list_packages<A, S>(State(state): State<AppState<A, S>>) -> Json<PackagesView>
where
    A: TrackingApi,
    S: IdentifierStore,
{
    let numbers = state.coordinator.tracking_numbers().await;
    let snapshot = state.coordinator.snapshot();
    Json(PackagesView {
        device: device_info(&state.entry_id),
        sensors: state.sensors.render(&numbers, &snapshot),
    })
}

async fn add_package<A, S>(State(state): State<AppState<A, S>>, Json(body): Json<AddPackage>) -> impl IntoResponse
where
    A: TrackingApi,
    S: IdentifierStore,
{
    if let Err(e) = validate_identifier(&body.tracking_number) {
        return (StatusCode::BAD_REQUEST, Json(json!({ "success": false, "error": e.to_string() })));
    }

    let success = state.coordinator.add(&body.tracking_number).await;
    if success {
        let numbers = state.coordinator.tracking_numbers().await;
        state.sensors.sync_entities(&numbers);
    }
    (StatusCode::OK, Json(json!({ "success": success })))
}

async fn remove_package<A, S>(State(state): State<AppState<A, S>>, Path(tracking_number): Path<String>) -> Json<serde_json::Value>
where
    A: TrackingApi,
    S: IdentifierStore,
{
    let success = state.coordinator.remove(&tracking_number).await;
    Json(json!({ "success": success }))
}

async fn refresh_package<A, S>(State(state): State<AppState<A, S>>, Path(tracking_number): Path<String>) -> Json<serde_json::Value>
where
    A: TrackingApi,
    S: IdentifierStore,
{
    let success = state.coordinator.refresh_one(&tracking_number).await;
    Json(json!({ "success": success }))
}

async fn refresh_all<A, S>(State(state): State<AppState<A, S>>) -> impl IntoResponse
where
    A: TrackingApi,
    S: IdentifierStore,
{
    match state.coordinator.refresh_all().await {
        Ok(snapshot) => (
            StatusCode::OK,
            Json(json!({ "success": true, "packages": snapshot.len() })),
        ),
        Err(e) => {
            log::error!("Manual refresh failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": e.to_string() })),
            )
        }
    }
}
