//! # Polling Coordinator
//!
//! Owns the tracked-number list and the published [`TrackingSnapshot`].
//!
//! ## Cycle
//! [`TrackingCoordinator::refresh_all`] spawns one task per tracking number
//! into a `JoinSet`. Each task takes a permit from a shared semaphore before
//! it talks to the API, so no more than `concurrency_limit` requests are ever
//! in flight, whichever path issued them. The set is drained in completion
//! order; the new snapshot is built off to the side and swapped in with a
//! single `watch` send. A fetch task that panics only loses its own entry.
//! Dropping a cycle midway drops the `JoinSet`, which aborts the remaining
//! fetches.
//!
//! ## Single flight
//! Cycles run under `cycle_lock`. A caller records how many cycles had started
//! when it asked; if by the time it holds the lock another cycle has started
//! (and, holding the lock, finished) since then, that cycle already reflects
//! the caller's request and its snapshot is returned as is.
//!
//! ## Delivered notifications
//! A record with status `"Delivered"` fires one [`DeliveredEvent`] the first
//! time it is seen by a cycle. The set of notified numbers lives in memory
//! only, so a restart notifies again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{broadcast, watch, AcquireError, RwLock, Semaphore};
use tokio::task::{JoinError, JoinSet};

use super::client::TrackingApi;
use super::model::{
    validate_identifier, DeliveredEvent, FetchError, FetchResult, TrackingRecord, TrackingSnapshot,
};
use super::projection::ProjectionRegistry;
use super::store::IdentifierStore;
use super::DEFAULT_CONCURRENCY_LIMIT;

/// Buffered delivered events per subscriber before the slowest one lags.
const EVENT_CAPACITY: usize = 64;

/// Structural failure of a refresh cycle. Individual fetch failures never
/// surface here.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// A fetch task was cancelled from outside the cycle.
    #[error("Fetch task failed: {0}")]
    Task(#[from] JoinError),

    /// The coordinator was closed; no further fetches are issued.
    #[error("Coordinator closed")]
    Closed,
}

impl From<AcquireError> for CoordinatorError {
    fn from(_: AcquireError) -> Self {
        CoordinatorError::Closed
    }
}

/// Tuning for [`TrackingCoordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Maximum simultaneous requests against the API. Values below 1 count as 1.
    pub concurrency_limit: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
        }
    }
}

/// The polling coordinator.
pub struct TrackingCoordinator<A, S> {
    api: Arc<A>,
    store: S,
    registry: Arc<dyn ProjectionRegistry>,
    limiter: Arc<Semaphore>,
    concurrency_limit: usize,
    tracking_numbers: RwLock<Vec<String>>,
    snapshot_tx: watch::Sender<Arc<TrackingSnapshot>>,
    events_tx: broadcast::Sender<DeliveredEvent>,
    delivered: Mutex<HashSet<String>>,
    cycle_lock: tokio::sync::Mutex<()>,
    cycles_started: AtomicU64,
    save_lock: tokio::sync::Mutex<()>,
}

impl<A, S> TrackingCoordinator<A, S>
where
    A: TrackingApi,
    S: IdentifierStore,
{
    /// Creates an idle coordinator with an empty list and an empty snapshot.
    /// Call [`TrackingCoordinator::load`] before the first cycle.
    pub fn new(
        api: A,
        store: S,
        registry: Arc<dyn ProjectionRegistry>,
        options: CoordinatorOptions,
    ) -> Self {
        let concurrency_limit = options.concurrency_limit.max(1);
        let (snapshot_tx, _) = watch::channel(Arc::new(TrackingSnapshot::new()));
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            api: Arc::new(api),
            store,
            registry,
            limiter: Arc::new(Semaphore::new(concurrency_limit)),
            concurrency_limit,
            tracking_numbers: RwLock::new(Vec::new()),
            snapshot_tx,
            events_tx,
            delivered: Mutex::new(HashSet::new()),
            cycle_lock: tokio::sync::Mutex::new(()),
            cycles_started: AtomicU64::new(0),
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The API client in use.
    pub fn api(&self) -> &A {
        &self.api
    }

    /// The identifier store in use.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Effective concurrency limit.
    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// Tracked numbers in insertion order.
    pub async fn tracking_numbers(&self) -> Vec<String> {
        self.tracking_numbers.read().await.clone()
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> Arc<TrackingSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Receiver notified on every snapshot publication.
    pub fn subscribe(&self) -> watch::Receiver<Arc<TrackingSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Receiver of `track17_delivered` events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<DeliveredEvent> {
        self.events_tx.subscribe()
    }

    /// Whether a full cycle is running right now.
    pub fn is_refreshing(&self) -> bool {
        self.cycle_lock.try_lock().is_err()
    }

    /// Populates the list from the store. Storage failures leave it empty;
    /// duplicates and invalid entries are dropped.
    pub async fn load(&self) {
        let stored = match self.store.load().await {
            Ok(stored) => stored,
            Err(e) => {
                log::error!("Failed to load tracked packages, starting empty: {}", e);
                Vec::new()
            }
        };

        let mut seen = HashSet::new();
        let mut numbers = Vec::with_capacity(stored.len());
        for raw in &stored {
            match validate_identifier(raw) {
                Ok(number) if seen.insert(number.to_string()) => numbers.push(number.to_string()),
                Ok(number) => log::warn!("Dropping duplicate stored tracking number {}", number),
                Err(e) => log::warn!("Dropping stored tracking number {:?}: {}", raw, e),
            }
        }

        log::info!("Loaded {} tracked packages", numbers.len());
        *self.tracking_numbers.write().await = numbers;
    }

    /// Starts tracking a package after verifying it against the API.
    ///
    /// Returns `false` for invalid input, an already tracked number, or a
    /// verification fetch that failed.
    pub async fn add(&self, tracking_number: &str) -> bool {
        let number = match validate_identifier(tracking_number) {
            Ok(number) => number,
            Err(e) => {
                log::warn!("Rejected tracking number {:?}: {}", tracking_number, e);
                return false;
            }
        };
        if self.is_tracked(number).await {
            return false;
        }

        if let Err(e) = self.fetch(number).await {
            log::warn!("Cannot add {}: {}", number, e);
            return false;
        }

        let (updated, saving) = {
            let mut numbers = self.tracking_numbers.write().await;
            // Another add may have won while we were verifying.
            if numbers.iter().any(|n| n == number) {
                return false;
            }
            numbers.push(number.to_string());
            (numbers.clone(), self.save_lock.lock().await)
        };
        self.persist(&updated).await;
        drop(saving);

        log::info!("Added tracking number {}", number);
        self.request_refresh().await;
        true
    }

    /// Stops tracking a package and deletes its entity. Entity removal
    /// failures are logged; the number is dropped regardless.
    pub async fn remove(&self, tracking_number: &str) -> bool {
        let number = tracking_number.trim();
        let (updated, saving) = {
            let mut numbers = self.tracking_numbers.write().await;
            let Some(index) = numbers.iter().position(|n| n == number) else {
                return false;
            };
            numbers.remove(index);
            (numbers.clone(), self.save_lock.lock().await)
        };
        self.persist(&updated).await;
        drop(saving);
        log::info!("Removed tracking number {}", number);

        match self.registry.remove_projection(number) {
            Ok(true) => {}
            Ok(false) => log::debug!("No entity registered for {}", number),
            Err(e) => log::warn!("Failed to remove entity for {}: {}", number, e),
        }

        self.request_refresh().await;
        true
    }

    /// Fetches one tracked package and merges the outcome, error or not,
    /// into a copy of the current snapshot.
    ///
    /// Returns `false` without publishing if the number is not tracked, or
    /// stopped being tracked while the fetch was in flight.
    pub async fn refresh_one(&self, tracking_number: &str) -> bool {
        let number = tracking_number.trim();
        if !self.is_tracked(number).await {
            return false;
        }

        let outcome = self.fetch(number).await;
        if let Err(e) = &outcome {
            log::warn!("Refresh of {} returned an error: {}", number, e);
        }

        // Held through the publish so a concurrent remove cannot slip in between.
        let numbers = self.tracking_numbers.read().await;
        if !numbers.iter().any(|n| n == number) {
            log::debug!("{} was removed during its refresh; discarding result", number);
            return false;
        }
        self.snapshot_tx.send_modify(|current| {
            *current = Arc::new(current.with_entry(number, outcome));
        });
        true
    }

    /// Runs a cycle (or joins the one that answers this request) and logs a
    /// structural failure instead of returning it.
    pub async fn request_refresh(&self) {
        if let Err(e) = self.refresh_all().await {
            log::error!("Refresh cycle failed: {}", e);
        }
    }

    /// Fetches every tracked package and publishes the result as the new snapshot.
    ///
    /// Transport, timeout and malformed-body failures drop that package from
    /// this cycle's snapshot; upstream errors are kept so they can be shown.
    ///
    /// A fetch task that panics is logged and its package left out, like a
    /// transport failure.
    ///
    /// # Errors
    /// `CoordinatorError::Closed` after [`TrackingCoordinator::close`]
    /// and `CoordinatorError::Task` if a fetch task was cancelled. The
    /// published snapshot is left untouched in either case.
    pub async fn refresh_all(&self) -> Result<Arc<TrackingSnapshot>, CoordinatorError> {
        let requested_at = self.cycles_started.load(Ordering::Acquire);
        let _cycle = self.cycle_lock.lock().await;
        if self.cycles_started.load(Ordering::Acquire) > requested_at {
            log::debug!("Refresh request coalesced into the cycle that just finished");
            return Ok(self.snapshot());
        }
        self.cycles_started.fetch_add(1, Ordering::AcqRel);

        let numbers = self.tracking_numbers().await;
        let started = Instant::now();

        if self.limiter.is_closed() {
            return Err(CoordinatorError::Closed);
        }

        let mut tasks = JoinSet::new();
        let mut owners = HashMap::with_capacity(numbers.len());
        for number in numbers {
            let api = Arc::clone(&self.api);
            let limiter = Arc::clone(&self.limiter);
            let task_number = number.clone();
            let handle = tasks.spawn(async move { limited_fetch(api.as_ref(), &limiter, &task_number).await });
            owners.insert(handle.id(), number);
        }

        let mut entries = Vec::with_capacity(tasks.len());
        let mut failed = 0usize;
        while let Some(joined) = tasks.join_next_with_id().await {
            let (number, outcome) = match joined {
                Ok((id, outcome)) => (owners.remove(&id).unwrap_or_default(), outcome),
                Err(e) if e.is_panic() => {
                    let number = owners.remove(&e.id()).unwrap_or_default();
                    log::error!("Error fetching 17TRACK data for {}: fetch task panicked", number);
                    failed += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            match outcome? {
                Ok(record) => entries.push((number, Ok(record))),
                Err(e) if e.is_upstream() => {
                    log::warn!("17TRACK reported an error for {}: {}", number, e);
                    entries.push((number, Err(e)));
                }
                Err(e) => {
                    log::error!("Error fetching 17TRACK data for {}: {}", number, e);
                    failed += 1;
                }
            }
        }

        let deliveries: Vec<DeliveredEvent> = entries
            .iter()
            .filter_map(|(number, outcome)| match outcome {
                Ok(record) if self.mark_delivered(number, record) => Some(DeliveredEvent {
                    tracking_number: number.clone(),
                    data: record.clone(),
                }),
                _ => None,
            })
            .collect();

        let snapshot: Arc<TrackingSnapshot> = Arc::new(entries.into_iter().collect());
        self.snapshot_tx.send_replace(Arc::clone(&snapshot));
        log::info!(
            "Refreshed {} packages ({} failed) in {:?}",
            snapshot.len(),
            failed,
            started.elapsed()
        );

        for event in deliveries {
            log::info!("Package {} delivered", event.tracking_number);
            if self.events_tx.send(event).is_err() {
                log::debug!("No listeners for delivered events");
            }
        }

        Ok(snapshot)
    }

    /// Releases the API session and stops issuing fetches: later cycles fail
    /// with `CoordinatorError::Closed` and later single fetches come
    /// back as transport errors. Safe to call more than once.
    pub fn close(&self) {
        self.limiter.close();
        self.api.close();
        log::info!("Tracking coordinator closed");
    }

    async fn is_tracked(&self, number: &str) -> bool {
        self.tracking_numbers.read().await.iter().any(|n| n == number)
    }

    async fn fetch(&self, number: &str) -> FetchResult {
        limited_fetch(self.api.as_ref(), &self.limiter, number)
            .await
            .unwrap_or_else(|_| Err(FetchError::transport("coordinator closed")))
    }

    /// Records a first sighting of a delivered package. True only once per number.
    fn mark_delivered(&self, number: &str, record: &TrackingRecord) -> bool {
        record.is_delivered()
            && self
                .delivered
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(number.to_string())
    }

    async fn persist(&self, numbers: &[String]) {
        if let Err(e) = self.store.save(numbers).await {
            log::error!("Failed to save tracked packages: {}", e);
        }
    }
}

/// One fetch under the shared concurrency limit.
async fn limited_fetch<A: TrackingApi>(
    api: &A,
    limiter: &Semaphore,
    number: &str,
) -> Result<FetchResult, AcquireError> {
    let _permit = limiter.acquire().await?;
    Ok(api.fetch_one(number).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::projection::SensorRegistry;
    use crate::tracking::store::MemoryStore;
    use serde_json::{json, Value};
    use std::collections::HashMap;

    /// Answers from a fixed table; unknown numbers fail with a transport error.
    struct TableApi(HashMap<String, FetchResult>);

    impl TrackingApi for TableApi {
        async fn fetch_one(&self, tracking_number: &str) -> FetchResult {
            self.0
                .get(tracking_number)
                .cloned()
                .unwrap_or_else(|| Err(FetchError::transport("connection refused")))
        }
    }

    fn record(value: Value) -> TrackingRecord {
        serde_json::from_value(value).unwrap()
    }

    fn coordinator(
        table: Vec<(&str, FetchResult)>,
        stored: &[&str],
    ) -> TrackingCoordinator<TableApi, MemoryStore> {
        let api = TableApi(table.into_iter().map(|(k, v)| (k.to_string(), v)).collect());
        let store = MemoryStore::with_identifiers(stored.iter().map(|s| s.to_string()).collect());
        TrackingCoordinator::new(api, store, Arc::new(SensorRegistry::new()), CoordinatorOptions::default())
    }

    #[tokio::test]
    async fn test_load_drops_duplicates_and_invalid_entries() {
        let coord = coordinator(vec![], &["LP1", "", "LP2", "LP1", "{{ x }}"]);
        coord.load().await;
        assert_eq!(coord.tracking_numbers().await, vec!["LP1", "LP2"]);
    }

    #[tokio::test]
    async fn test_refresh_all_keeps_upstream_errors_and_drops_transport_errors() {
        let coord = coordinator(
            vec![
                ("LP1", Ok(record(json!({"status": "InTransit"})))),
                ("LP2", Err(FetchError::upstream("not found"))),
                ("LP3", Err(FetchError::invalid_json())),
            ],
            &["LP1", "LP2", "LP3", "LP4"],
        );
        coord.load().await;

        let snapshot = coord.refresh_all().await.unwrap();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.record("LP1").unwrap().status(), Some("InTransit"));
        assert_eq!(snapshot.error("LP2"), Some(&FetchError::upstream("not found")));
        assert!(!snapshot.contains("LP3"));
        assert!(!snapshot.contains("LP4"));
        assert!(Arc::ptr_eq(&snapshot, &coord.snapshot()));
    }

    #[tokio::test]
    async fn test_refresh_one_merges_without_dropping_entries() {
        let coord = coordinator(
            vec![
                ("LP1", Ok(record(json!({"status": "InTransit"})))),
                ("LP2", Ok(record(json!({"status": "Delivered"})))),
            ],
            &["LP1", "LP2"],
        );
        coord.load().await;
        coord.refresh_all().await.unwrap();
        let before = coord.snapshot();

        assert!(coord.refresh_one("LP2").await);
        assert!(!coord.refresh_one("LP9").await);

        let after = coord.snapshot();
        assert_eq!(after.len(), 2);
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(*before, *after);
    }

    #[tokio::test]
    async fn test_refresh_one_merges_error_outcome() {
        let coord = coordinator(vec![], &["LP1"]);
        coord.load().await;

        assert!(coord.refresh_one("LP1").await);
        assert_eq!(
            coord.snapshot().error("LP1"),
            Some(&FetchError::transport("connection refused"))
        );
    }

    #[tokio::test]
    async fn test_snapshot_subscribers_see_each_publication() {
        let coord = coordinator(vec![("LP1", Ok(record(json!({"status": "InTransit"}))))], &["LP1"]);
        coord.load().await;
        let mut rx = coord.subscribe();

        coord.refresh_all().await.unwrap();

        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().contains("LP1"));
    }

    #[tokio::test]
    async fn test_zero_concurrency_limit_is_clamped() {
        let coord = TrackingCoordinator::new(
            TableApi(HashMap::new()),
            MemoryStore::default(),
            Arc::new(SensorRegistry::new()),
            CoordinatorOptions { concurrency_limit: 0 },
        );
        assert_eq!(coord.concurrency_limit(), 1);
    }
}
