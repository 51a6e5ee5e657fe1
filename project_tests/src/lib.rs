//! # Coordinator Test Fixtures
//!
//! Stand-ins for the seams of [`TrackingCoordinator`]: a scripted API that
//! records concurrency, a projection registry that counts removals, a
//! store that always fails and one that saves slowly.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lib_common::tracking::{
    CoordinatorOptions, FetchError, FetchResult, IdentifierStore, JsonFileStore, MemoryStore,
    ProjectionRegistry, RegistryError, StoreError, TrackingApi, TrackingCoordinator, TrackingRecord,
};
use serde_json::Value;

/// Builds a record from a JSON object literal.
pub fn record(value: Value) -> TrackingRecord {
    serde_json::from_value(value).expect("record fixtures must be JSON objects")
}

/// # Scripted API
///
/// Each tracking number answers from a queue of results; the last result
/// repeats once the queue is down to one. Unscripted numbers fail with a
/// transport error. Every call sleeps for `delay` while counted as in flight.
#[derive(Default)]
pub struct ScriptedApi {
    scripts: Mutex<HashMap<String, VecDeque<FetchResult>>>,
    delay: Duration,
    panic_on: Option<String>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<Vec<String>>,
    closed: AtomicUsize,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a result to the script of `number`.
    pub fn respond(self, number: &str, result: FetchResult) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(number.to_string())
            .or_default()
            .push_back(result);
        self
    }

    /// Shorthand for a successful response with the given JSON body.
    pub fn respond_ok(self, number: &str, body: Value) -> Self {
        self.respond(number, Ok(record(body)))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Makes every fetch of `number` panic.
    pub fn panic_on(mut self, number: &str) -> Self {
        self.panic_on = Some(number.to_string());
        self
    }

    /// Highest number of simultaneous fetches observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Tracking numbers fetched, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn next_result(&self, number: &str) -> FetchResult {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(number) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| Err(FetchError::transport("no scripted response"))),
            None => Err(FetchError::transport("connection refused")),
        }
    }
}

impl TrackingApi for ScriptedApi {
    async fn fetch_one(&self, tracking_number: &str) -> FetchResult {
        self.calls.lock().unwrap().push(tracking_number.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.panic_on.as_deref() == Some(tracking_number) {
            panic!("scripted panic for {tracking_number}");
        }
        self.next_result(tracking_number)
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// # Recording Registry
///
/// Counts `remove_projection` calls per tracking number. Reports no matching
/// entity by default; can be told to fail every call instead.
#[derive(Default)]
pub struct RecordingRegistry {
    removals: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn removals(&self) -> Vec<String> {
        self.removals.lock().unwrap().clone()
    }
}

impl ProjectionRegistry for RecordingRegistry {
    fn remove_projection(&self, tracking_number: &str) -> Result<bool, RegistryError> {
        self.removals.lock().unwrap().push(tracking_number.to_string());
        if self.fail {
            return Err(RegistryError::Unavailable("registry offline".to_string()));
        }
        Ok(false)
    }
}

/// A store whose every operation fails with an I/O error.
#[derive(Default)]
pub struct FailingStore {
    saves: AtomicUsize,
}

impl FailingStore {
    pub fn save_attempts(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn error() -> StoreError {
        StoreError::Io {
            path: "/unavailable/track17_packages".into(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "read-only filesystem"),
        }
    }
}

impl IdentifierStore for FailingStore {
    async fn load(&self) -> Result<Vec<String>, StoreError> {
        Err(Self::error())
    }

    async fn save(&self, _identifiers: &[String]) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Err(Self::error())
    }
}

/// An in-memory store whose saves take `delay`, flagged while in progress.
pub struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
    saving: AtomicBool,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryStore::default(),
            delay,
            saving: AtomicBool::new(false),
        }
    }

    pub fn is_saving(&self) -> bool {
        self.saving.load(Ordering::SeqCst)
    }

    pub fn identifiers(&self) -> Vec<String> {
        self.inner.identifiers()
    }
}

impl IdentifierStore for SlowStore {
    async fn load(&self) -> Result<Vec<String>, StoreError> {
        self.inner.load().await
    }

    async fn save(&self, identifiers: &[String]) -> Result<(), StoreError> {
        self.saving.store(true, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let saved = self.inner.save(identifiers).await;
        self.saving.store(false, Ordering::SeqCst);
        saved
    }
}

/// A coordinator over a JSON file store in `dir`, already loaded.
pub async fn file_coordinator(
    api: ScriptedApi,
    dir: &Path,
    registry: Arc<RecordingRegistry>,
) -> TrackingCoordinator<ScriptedApi, JsonFileStore> {
    let coordinator = TrackingCoordinator::new(
        api,
        JsonFileStore::in_dir(dir),
        registry,
        CoordinatorOptions::default(),
    );
    coordinator.load().await;
    coordinator
}
