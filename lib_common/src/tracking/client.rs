//! # Remote Tracking Client
//!
//! Wraps the provider's `POST <base>/trackings` endpoint on top of the generic
//! [`ApiClient`]. Every expected failure mode comes back as a [`FetchError`];
//! nothing here returns early with an error the caller has to unwrap.
//!
//! The client owns one session (connection pool plus cancellation token),
//! opened lazily on the first request. [`TrackingClient::close`] drops the
//! session and cancels whatever is still in flight; the next request opens a
//! fresh one.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::model::{FetchError, FetchResult, TrackingRecord};
use super::{DEFAULT_API_URL, DEFAULT_REQUEST_TIMEOUT, USER_AGENT};
use crate::retrieve::ky_http::{ApiClient, ApiResponse, ClientOptions, HttpError};

/// Relative path of the tracking endpoint.
const TRACKINGS_PATH: &str = "trackings";

/// Header carrying the API key.
const TOKEN_HEADER: &str = "17token";

/// Anything that can fetch one tracking number. The coordinator is generic
/// over this so tests can swap the network out.
pub trait TrackingApi: Send + Sync + 'static {
    /// Fetches the current state of one package.
    fn fetch_one(&self, tracking_number: &str) -> impl Future<Output = FetchResult> + Send;

    /// Releases network resources. Must be safe to call repeatedly.
    fn close(&self) {}
}

/// Settings for [`TrackingClient`].
#[derive(Debug, Clone)]
pub struct TrackingClientConfig {
    /// Absolute base URL; `trackings` is joined onto it.
    pub base_url: String,
    /// API key sent in the `17token` header.
    pub api_key: String,
    /// Budget for each request.
    pub timeout: Duration,
    /// Transient-failure retries per request.
    pub max_retries: u32,
}

impl TrackingClientConfig {
    /// Production endpoint with default timeout and no retries.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            api_key: api_key.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retries: 0,
        }
    }
}

struct Session {
    api: ApiClient,
    cancel: CancellationToken,
}

/// HTTP client for the tracking provider.
pub struct TrackingClient {
    base_url: String,
    options: ClientOptions,
    session: Mutex<Option<Session>>,
}

impl TrackingClient {
    /// Builds a client. No connection is made until the first fetch.
    ///
    /// # Errors
    /// `HttpError::InvalidUrl` for a non-absolute base URL and
    /// `HttpError::InvalidHeader` for an API key that cannot be a header value.
    pub fn new(config: TrackingClientConfig) -> Result<Self, HttpError> {
        Url::parse(&config.base_url)?;

        let mut token = HeaderValue::from_str(&config.api_key)?;
        token.set_sensitive(true);
        let mut default_headers = HeaderMap::new();
        default_headers.insert(TOKEN_HEADER, token);

        Ok(Self {
            base_url: config.base_url,
            options: ClientOptions {
                timeout: Some(config.timeout),
                max_retries: config.max_retries,
                user_agent: Some(USER_AGENT.to_string()),
                default_headers,
            },
            session: Mutex::new(None),
        })
    }

    /// Returns the live session, opening one if needed.
    fn session(&self) -> Result<(ApiClient, CancellationToken), HttpError> {
        let mut guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = guard.as_ref() {
            return Ok((session.api.clone(), session.cancel.clone()));
        }

        let api = ApiClient::new(&self.base_url, self.options.clone())?;
        let cancel = CancellationToken::new();
        log::debug!("Opened tracking API session for {}", api.base_url());
        *guard = Some(Session {
            api: api.clone(),
            cancel: cancel.clone(),
        });
        Ok((api, cancel))
    }

    /// Whether a session is currently open.
    pub fn is_open(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Fetches one tracking number. One round trip, bounded by the timeout.
    pub async fn fetch_one(&self, tracking_number: &str) -> FetchResult {
        let (api, cancel) = self.session().map_err(FetchError::transport)?;
        let body = json!({ "tracking_number": tracking_number });

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::transport("session closed")),
            res = api.request_raw(Method::POST, TRACKINGS_PATH, None, Some(body)) => res,
        };

        match outcome {
            Ok(response) => parse_response(response),
            Err(HttpError::Timeout) => Err(FetchError::timeout()),
            Err(e) => Err(FetchError::transport(e)),
        }
    }

    /// Fetches several tracking numbers one request at a time and keys the
    /// outcomes by tracking number.
    pub async fn fetch_batch(&self, tracking_numbers: &[String]) -> HashMap<String, FetchResult> {
        let mut results = HashMap::with_capacity(tracking_numbers.len());
        for number in tracking_numbers {
            let outcome = self.fetch_one(number).await;
            results.insert(number.clone(), outcome);
        }
        results
    }

    /// Drops the session and cancels in-flight requests. Idempotent.
    pub fn close(&self) {
        let previous = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = previous {
            session.cancel.cancel();
            log::debug!("Closed tracking API session");
        }
    }
}

impl TrackingApi for TrackingClient {
    async fn fetch_one(&self, tracking_number: &str) -> FetchResult {
        TrackingClient::fetch_one(self, tracking_number).await
    }

    fn close(&self) {
        TrackingClient::close(self)
    }
}

impl Drop for TrackingClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Maps a raw response onto a record or one of the fetch error classes.
fn parse_response(response: ApiResponse<String>) -> FetchResult {
    let text = response
        .data
        .as_deref()
        .or(response.error_body.as_deref())
        .unwrap_or_default();
    let parsed = serde_json::from_str::<Value>(text);

    if !response.success {
        if let Ok(Value::Object(map)) = &parsed {
            if let Some(err) = upstream_error(map) {
                return Err(FetchError::upstream(err));
            }
        }
        let reason = StatusCode::from_u16(response.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("");
        return Err(FetchError::transport(
            format!("{} {}", response.status, reason).trim_end(),
        ));
    }

    match parsed {
        Err(_) => Err(FetchError::invalid_json()),
        Ok(Value::Object(map)) => match upstream_error(&map) {
            Some(err) => Err(FetchError::upstream(err)),
            None => Ok(TrackingRecord::new(map)),
        },
        Ok(_) => Err(FetchError::unexpected_format()),
    }
}

/// Text of a non-null `error` field; strings verbatim, anything else as JSON.
fn upstream_error(map: &serde_json::Map<String, Value>) -> Option<String> {
    match map.get("error")? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
