use std::sync::Arc;

use lib_common::tracking::{SensorRegistry, TrackingCoordinator};

pub struct AppState<A, S> {
    pub coordinator: Arc<TrackingCoordinator<A, S>>,
    pub sensors: Arc<SensorRegistry>,
    pub entry_id: String,
}

impl<A, S> AppState<A, S> {
    pub fn new(coordinator: Arc<TrackingCoordinator<A, S>>, sensors: Arc<SensorRegistry>, entry_id: impl Into<String>) -> Self {
        Self {
            coordinator,
            sensors,
            entry_id: entry_id.into(),
        }
    }
}

// Derived Clone would require A: Clone and S: Clone.
impl<A, S> Clone for AppState<A, S> {
    fn clone(&self) -> Self {
        Self {
            coordinator: Arc::clone(&self.coordinator),
            sensors: Arc::clone(&self.sensors),
            entry_id: self.entry_id.clone(),
        }
    }
}
