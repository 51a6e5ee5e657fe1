//! # Entity Projection
//!
//! Renders the coordinator's state as sensor-style entities: one "Tracked
//! Packages" list sensor plus one sensor per tracking number. The coordinator
//! only sees the [`ProjectionRegistry`] trait, which it uses to delete the
//! entity of a removed package.

use std::sync::{PoisonError, RwLock};

use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

use super::model::TrackingSnapshot;
use super::DOMAIN;

/// Failure to reach the entity registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The registry could not be consulted or modified.
    #[error("Entity registry unavailable: {0}")]
    Unavailable(String),
}

/// The coordinator's view of the entity layer.
pub trait ProjectionRegistry: Send + Sync {
    /// Deletes the entity of `tracking_number`. `Ok(false)` when there was none.
    fn remove_projection(&self, tracking_number: &str) -> Result<bool, RegistryError>;
}

/// Entity id of the sensor for `tracking_number`, e.g. `sensor.track17_LP1`.
pub fn entity_id(tracking_number: &str) -> String {
    format!("sensor.{}_{}", DOMAIN, tracking_number)
}

/// Public tracking page for `tracking_number`.
pub fn tracking_url(tracking_number: &str) -> String {
    format!("https://t.17track.net/en#nums={}", tracking_number)
}

/// Device grouping all sensors of one integration entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    /// `(domain, entry id)` pairs.
    pub identifiers: Vec<(String, String)>,
    /// Display name.
    pub name: String,
    /// Manufacturer shown in the UI.
    pub manufacturer: String,
    /// Model shown in the UI.
    pub model: String,
    /// Link to the provider's site.
    pub configuration_url: String,
}

/// Device info for the entry `entry_id`.
pub fn device_info(entry_id: &str) -> DeviceInfo {
    DeviceInfo {
        identifiers: vec![(DOMAIN.to_string(), entry_id.to_string())],
        name: "17TRACK Packages".to_string(),
        manufacturer: "17TRACK".to_string(),
        model: "Package Tracking".to_string(),
        configuration_url: "https://t.17track.net".to_string(),
    }
}

/// One rendered entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorState {
    /// `sensor.<...>` id.
    pub entity_id: String,
    /// Stable unique id.
    pub unique_id: String,
    /// Friendly name.
    pub name: String,
    /// Sensor state (count or package status).
    pub state: Value,
    /// Extra state attributes.
    pub attributes: Map<String, Value>,
}

/// The list sensor: state is the number of tracked packages.
pub fn package_list_sensor(tracking_numbers: &[String]) -> SensorState {
    let mut attributes = Map::new();
    attributes.insert("packages".to_string(), json!(tracking_numbers));
    SensorState {
        entity_id: format!("sensor.{}_packages", DOMAIN),
        unique_id: format!("{}_packages", DOMAIN),
        name: "Tracked Packages".to_string(),
        state: json!(tracking_numbers.len()),
        attributes,
    }
}

/// The sensor of one package. Missing fields render as `null`.
pub fn package_sensor(tracking_number: &str, snapshot: &TrackingSnapshot) -> SensorState {
    let record = snapshot.record(tracking_number);
    let field = |value: Option<&Value>| value.cloned().unwrap_or(Value::Null);

    let mut attributes = Map::new();
    attributes.insert("tracking_number".to_string(), json!(tracking_number));
    attributes.insert("carrier".to_string(), field(record.and_then(|r| r.carrier())));
    attributes.insert("country".to_string(), field(record.and_then(|r| r.country())));
    attributes.insert("last_event".to_string(), field(record.and_then(|r| r.last_event())));
    attributes.insert("delivered_at".to_string(), field(record.and_then(|r| r.delivered_at())));
    attributes.insert("url".to_string(), json!(tracking_url(tracking_number)));
    if let Some(err) = snapshot.error(tracking_number) {
        attributes.insert("error".to_string(), json!(err.message));
    }

    SensorState {
        entity_id: entity_id(tracking_number),
        unique_id: format!("{}_{}", DOMAIN, tracking_number),
        name: format!("Package {}", tracking_number),
        state: field(record.and_then(|r| r.get("status"))),
        attributes,
    }
}

/// In-process registry of per-package sensors.
///
/// Entities are created by [`SensorRegistry::sync_entities`] whenever a new
/// tracking number shows up and deleted only through `remove_projection`.
#[derive(Debug, Default)]
pub struct SensorRegistry {
    entities: RwLock<Vec<String>>,
}

impl SensorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sensor for every number that lacks one. Returns how many were added.
    pub fn sync_entities(&self, tracking_numbers: &[String]) -> usize {
        let mut entities = self.entities.write().unwrap_or_else(PoisonError::into_inner);
        let mut added = 0;
        for number in tracking_numbers {
            let id = entity_id(number);
            if !entities.contains(&id) {
                log::debug!("Registering entity {}", id);
                entities.push(id);
                added += 1;
            }
        }
        added
    }

    /// Registered entity ids in registration order.
    pub fn entity_ids(&self) -> Vec<String> {
        self.entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Renders the list sensor followed by one sensor per registered, tracked number.
    pub fn render(&self, tracking_numbers: &[String], snapshot: &TrackingSnapshot) -> Vec<SensorState> {
        let entities = self.entities.read().unwrap_or_else(PoisonError::into_inner);
        let mut sensors = vec![package_list_sensor(tracking_numbers)];
        sensors.extend(
            tracking_numbers
                .iter()
                .filter(|number| entities.contains(&entity_id(number)))
                .map(|number| package_sensor(number, snapshot)),
        );
        sensors
    }
}

impl ProjectionRegistry for SensorRegistry {
    fn remove_projection(&self, tracking_number: &str) -> Result<bool, RegistryError> {
        let id = entity_id(tracking_number);
        let mut entities = self.entities.write().unwrap_or_else(PoisonError::into_inner);
        match entities.iter().position(|e| *e == id) {
            Some(index) => {
                entities.remove(index);
                log::info!("Removed entity {}", id);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
