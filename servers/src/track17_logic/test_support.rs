use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use lib_common::tracking::{
    CoordinatorOptions, FetchError, FetchResult, MemoryStore, SensorRegistry, TrackingApi, TrackingCoordinator,
    TrackingRecord,
};
use serde_json::json;

/// Answers from a fixed table and counts calls. Unknown numbers fail with a transport error.
#[derive(Default)]
pub struct StubApi {
    results: HashMap<String, FetchResult>,
    calls: AtomicUsize,
    closed: AtomicUsize,
}

impl StubApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, number: &str, result: FetchResult) -> Self {
        self.results.insert(number.to_string(), result);
        self
    }

    pub fn with_status(self, number: &str, status: &str) -> Self {
        let record: TrackingRecord = serde_json::from_value(json!({ "status": status })).unwrap();
        self.with_result(number, Ok(record))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl TrackingApi for StubApi {
    async fn fetch_one(&self, tracking_number: &str) -> FetchResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.results
            .get(tracking_number)
            .cloned()
            .unwrap_or_else(|| Err(FetchError::transport("connection refused")))
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn coordinator_with(
    api: StubApi,
    stored: &[&str],
    sensors: Arc<SensorRegistry>,
) -> Arc<TrackingCoordinator<StubApi, MemoryStore>> {
    let store = MemoryStore::with_identifiers(stored.iter().map(|s| s.to_string()).collect());
    Arc::new(TrackingCoordinator::new(api, store, sensors, CoordinatorOptions::default()))
}
