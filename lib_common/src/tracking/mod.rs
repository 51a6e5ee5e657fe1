//! # 17TRACK Package Tracking
//!
//! Polls the 17TRACK API for a persisted list of tracking numbers and
//! publishes the results as immutable snapshots.
//!
//! - [`model`]: identifiers, records, fetch outcomes, snapshots.
//! - [`client`]: the HTTP client and the [`TrackingApi`] seam.
//! - [`store`]: identifier persistence.
//! - [`projection`]: sensor entities derived from snapshots.
//! - [`coordinator`]: refresh cycles, list mutations, delivered events.

use std::time::Duration;

pub mod client;
pub mod coordinator;
pub mod model;
pub mod projection;
pub mod store;

pub use client::{TrackingApi, TrackingClient, TrackingClientConfig};
pub use coordinator::{CoordinatorError, CoordinatorOptions, TrackingCoordinator};
pub use model::{
    validate_identifier, DeliveredEvent, FetchError, FetchErrorKind, FetchResult, InvalidIdentifier,
    TrackingRecord, TrackingSnapshot,
};
pub use projection::{ProjectionRegistry, RegistryError, SensorRegistry, SensorState};
pub use store::{IdentifierStore, JsonFileStore, MemoryStore, StoreError};

pub const DOMAIN: &str = "track17";
pub const STORAGE_KEY: &str = "track17_packages";
pub const STORAGE_VERSION: u32 = 1;
pub const EVENT_DELIVERED: &str = "track17_delivered";
pub const DEFAULT_SCAN_INTERVAL_HOURS: u64 = 24;
pub const DEFAULT_API_URL: &str = "https://api.17track.net/track/v2.4/";
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 5;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Sent with every API request.
pub const USER_AGENT: &str = concat!("Track17-Integration/", env!("CARGO_PKG_VERSION"));
