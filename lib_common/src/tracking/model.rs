//! # Tracking Data Model
//!
//! Identifiers, per-package records, tagged fetch outcomes and the published
//! snapshot. Records are open JSON objects: the well-known fields have typed
//! accessors and everything else the provider sends is carried untouched.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::EVENT_DELIVERED;

/// Status value that marks a package as delivered.
pub const DELIVERED_STATUS: &str = "Delivered";

/// Substrings that betray an unrendered front-end template bound to the input.
const TEMPLATE_MARKERS: [&str; 3] = ["{{", "}}", "states("];

/// Reasons an identifier is refused before any I/O happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidIdentifier {
    /// Empty or whitespace-only input.
    #[error("tracking number is empty")]
    Empty,
    /// Input that looks like a template expression rather than a tracking number.
    #[error("tracking number looks like a template expression: {0}")]
    Template(String),
}

/// Validates a tracking number and returns it with surrounding whitespace trimmed.
pub fn validate_identifier(raw: &str) -> Result<&str, InvalidIdentifier> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(InvalidIdentifier::Empty);
    }
    if TEMPLATE_MARKERS.iter().any(|marker| trimmed.contains(marker)) {
        return Err(InvalidIdentifier::Template(trimmed.to_string()));
    }
    Ok(trimmed)
}

/// # Tracking Record
///
/// The provider's answer for one tracking number. Serializes as the exact
/// object it was parsed from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackingRecord(Map<String, Value>);

impl TrackingRecord {
    /// Wraps an already-parsed JSON object.
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Current status, when the provider sent it as a string.
    pub fn status(&self) -> Option<&str> {
        self.0.get("status").and_then(Value::as_str)
    }

    /// Carrier name or code.
    pub fn carrier(&self) -> Option<&Value> {
        self.0.get("carrier")
    }

    /// Origin or destination country as reported upstream.
    pub fn country(&self) -> Option<&Value> {
        self.0.get("country")
    }

    /// Most recent tracking event.
    pub fn last_event(&self) -> Option<&Value> {
        self.0.get("lastEvent")
    }

    /// Delivery timestamp, once delivered.
    pub fn delivered_at(&self) -> Option<&Value> {
        self.0.get("deliveredAt")
    }

    /// Any field by name, including ones without a dedicated accessor.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// All fields as received.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// True when `status` is exactly `"Delivered"`.
    pub fn is_delivered(&self) -> bool {
        self.status() == Some(DELIVERED_STATUS)
    }
}

impl From<Map<String, Value>> for TrackingRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// Failure classes of a single fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    /// Connection, DNS, TLS or non-2xx status without an upstream error body.
    Transport,
    /// The per-request timeout elapsed.
    Timeout,
    /// The body was not JSON.
    InvalidJson,
    /// The body was JSON but not an object.
    UnexpectedFormat,
    /// The provider answered with an `error` for this tracking number.
    Upstream,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FetchErrorKind::Transport => "transport",
            FetchErrorKind::Timeout => "timeout",
            FetchErrorKind::InvalidJson => "invalid_json",
            FetchErrorKind::UnexpectedFormat => "unexpected_format",
            FetchErrorKind::Upstream => "upstream",
        };
        f.write_str(name)
    }
}

/// A fetch failure for one tracking number. `Display` yields the user-facing message.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{message}")]
pub struct FetchError {
    /// Failure class.
    pub kind: FetchErrorKind,
    /// Human-readable message, stable per class except for `Transport` and `Upstream`.
    pub message: String,
}

impl FetchError {
    /// `HTTP error: <detail>`
    pub fn transport(detail: impl fmt::Display) -> Self {
        Self {
            kind: FetchErrorKind::Transport,
            message: format!("HTTP error: {}", detail),
        }
    }

    /// `API request timed out`
    pub fn timeout() -> Self {
        Self {
            kind: FetchErrorKind::Timeout,
            message: "API request timed out".to_string(),
        }
    }

    /// `Invalid JSON response`
    pub fn invalid_json() -> Self {
        Self {
            kind: FetchErrorKind::InvalidJson,
            message: "Invalid JSON response".to_string(),
        }
    }

    /// `Unexpected data format`
    pub fn unexpected_format() -> Self {
        Self {
            kind: FetchErrorKind::UnexpectedFormat,
            message: "Unexpected data format".to_string(),
        }
    }

    /// The provider's own error text, verbatim.
    pub fn upstream(text: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Upstream,
            message: text.into(),
        }
    }

    /// Whether the provider itself reported the failure, as opposed to the
    /// request or the response body failing.
    pub fn is_upstream(&self) -> bool {
        self.kind == FetchErrorKind::Upstream
    }
}

/// Outcome of fetching one tracking number.
pub type FetchResult = Result<TrackingRecord, FetchError>;

/// # Tracking Snapshot
///
/// Identifier → latest outcome. Published values are never mutated; a
/// single-package refresh derives a new snapshot with [`TrackingSnapshot::with_entry`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackingSnapshot {
    entries: HashMap<String, FetchResult>,
}

impl TrackingSnapshot {
    /// An empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// The outcome stored for `id`.
    pub fn get(&self, id: &str) -> Option<&FetchResult> {
        self.entries.get(id)
    }

    /// The record for `id`, if its last fetch succeeded.
    pub fn record(&self, id: &str) -> Option<&TrackingRecord> {
        self.entries.get(id).and_then(|r| r.as_ref().ok())
    }

    /// The error for `id`, if its last fetch failed.
    pub fn error(&self, id: &str) -> Option<&FetchError> {
        self.entries.get(id).and_then(|r| r.as_ref().err())
    }

    /// Whether `id` has any entry.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no package has been fetched yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FetchResult)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// A copy of this snapshot with `id` set to `result`; other entries are kept.
    pub fn with_entry(&self, id: &str, result: FetchResult) -> Self {
        let mut entries = self.entries.clone();
        entries.insert(id.to_string(), result);
        Self { entries }
    }
}

impl FromIterator<(String, FetchResult)> for TrackingSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, FetchResult)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Payload of the `track17_delivered` event, fired once per package per process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveredEvent {
    /// The delivered package.
    pub tracking_number: String,
    /// The record that showed the delivery.
    pub data: TrackingRecord,
}

impl DeliveredEvent {
    /// Event type name on the host bus.
    pub fn event_type(&self) -> &'static str {
        EVENT_DELIVERED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> TrackingRecord {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_validate_identifier_accepts_and_trims() {
        assert_eq!(validate_identifier("  LP00123 \n"), Ok("LP00123"));
    }

    #[test]
    fn test_validate_identifier_rejects_empty_and_templates() {
        assert_eq!(validate_identifier(""), Err(InvalidIdentifier::Empty));
        assert_eq!(validate_identifier("   "), Err(InvalidIdentifier::Empty));
        for raw in ["{{ states('input_text.x') }}", "abc}}", "{{abc", "states(input_text.x)"] {
            assert!(
                matches!(validate_identifier(raw), Err(InvalidIdentifier::Template(_))),
                "{} should be rejected",
                raw
            );
        }
    }

    #[test]
    fn test_record_keeps_unknown_fields() {
        let rec = record(json!({
            "status": "InTransit",
            "carrier": "DHL",
            "lastEvent": {"time": "2024-05-01", "desc": "Departed"},
            "sub_status": "InTransit_PickedUp"
        }));

        assert_eq!(rec.status(), Some("InTransit"));
        assert_eq!(rec.carrier(), Some(&json!("DHL")));
        assert_eq!(rec.last_event().unwrap()["desc"], "Departed");
        assert_eq!(rec.get("sub_status"), Some(&json!("InTransit_PickedUp")));
        assert!(rec.delivered_at().is_none());
        assert_eq!(
            serde_json::to_value(&rec).unwrap()["sub_status"],
            "InTransit_PickedUp"
        );
    }

    #[test]
    fn test_is_delivered_requires_exact_status() {
        assert!(record(json!({"status": "Delivered"})).is_delivered());
        assert!(!record(json!({"status": "delivered"})).is_delivered());
        assert!(!record(json!({"status": 40})).is_delivered());
        assert!(!record(json!({})).is_delivered());
    }

    #[test]
    fn test_fetch_error_messages() {
        assert_eq!(FetchError::transport("connection refused").to_string(), "HTTP error: connection refused");
        assert_eq!(FetchError::timeout().to_string(), "API request timed out");
        assert_eq!(FetchError::invalid_json().to_string(), "Invalid JSON response");
        assert_eq!(FetchError::unexpected_format().to_string(), "Unexpected data format");
        assert_eq!(FetchError::upstream("not found").to_string(), "not found");
        assert!(FetchError::upstream("x").is_upstream());
        assert!(!FetchError::timeout().is_upstream());
    }

    #[test]
    fn test_with_entry_keeps_other_entries_and_original() {
        let original: TrackingSnapshot = vec![
            ("A".to_string(), Ok(record(json!({"status": "InTransit"})))),
            ("B".to_string(), Err(FetchError::timeout())),
        ]
        .into_iter()
        .collect();

        let merged = original.with_entry("B", Ok(record(json!({"status": "Delivered"}))));

        assert_eq!(merged.len(), 2);
        assert_eq!(merged.record("A").unwrap().status(), Some("InTransit"));
        assert!(merged.record("B").unwrap().is_delivered());
        assert_eq!(original.error("B"), Some(&FetchError::timeout()));
    }
}
