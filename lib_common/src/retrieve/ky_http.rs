//! # HTTP Retrieval Utilities
//! 
//! This module provides a robust, asynchronous API client wrapper around `reqwest`.
//! It includes middleware support for exponential backoff retries, a per-client
//! timeout budget, and raw-body response handling left to the caller to parse.

use std::time::Duration;

use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::Serialize;
use thiserror::Error;

/// Failures surfaced by [`ApiClient`].
///
/// Non-2xx statuses are not errors; they come back as an [`ApiResponse`]
/// with `success == false`.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The base URL or a joined path could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The underlying `reqwest::Client` could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),

    /// A configured header value contains characters HTTP does not allow.
    #[error("Invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),

    /// The request body could not be serialized to JSON.
    #[error("Failed to encode request body: {0}")]
    Encode(#[source] serde_json::Error),

    /// The request exceeded the client's timeout budget.
    #[error("Request timed out")]
    Timeout,

    /// Connection, DNS, TLS or body-transfer failure.
    #[error("{0}")]
    Transport(String),
}

impl From<reqwest::Error> for HttpError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            HttpError::Timeout
        } else {
            HttpError::Transport(e.to_string())
        }
    }
}

impl From<reqwest_middleware::Error> for HttpError {
    fn from(e: reqwest_middleware::Error) -> Self {
        match e {
            reqwest_middleware::Error::Reqwest(inner) => inner.into(),
            reqwest_middleware::Error::Middleware(inner) => {
                // The retry layer wraps the last reqwest error after exhausting its attempts.
                let timed_out = inner
                    .chain()
                    .filter_map(|cause| cause.downcast_ref::<reqwest::Error>())
                    .any(reqwest::Error::is_timeout);
                if timed_out {
                    HttpError::Timeout
                } else {
                    HttpError::Transport(inner.to_string())
                }
            }
        }
    }
}

/// A standardized container for API responses.
/// 
/// This struct wraps the response body along with metadata about the 
/// HTTP transaction, such as status codes and headers.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The response body of a 2xx reply.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

/// Construction options for [`ApiClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Total budget for one request, connection through body. `None` disables it.
    pub timeout: Option<Duration>,
    /// Retries applied by the exponential backoff middleware on transient failures.
    pub max_retries: u32,
    /// Value of the `User-Agent` header.
    pub user_agent: Option<String>,
    /// Headers attached to every request (API tokens, accept headers, ...).
    pub default_headers: HeaderMap,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            max_retries: 3,
            user_agent: None,
            default_headers: HeaderMap::new(),
        }
    }
}

/// A flexible asynchronous HTTP client.
/// 
/// Built on top of `reqwest_middleware`, it handles base URLs,
/// default headers, timeouts and automatic retries. Cloning is cheap and
/// shares the underlying connection pool.
#[derive(Clone, Debug)]
pub struct ApiClient {
    /// The underlying middleware-enabled client.
    inner: ClientWithMiddleware,
    /// The base URL to which all relative paths are joined.
    base_url: Url,
}

impl ApiClient {
    /// Creates a new `ApiClient` instance with a retry policy.
    ///
    /// # Arguments
    /// * `base_url` - The absolute base URL for the API (e.g., "https://api.example.com/v1/").
    ///   A missing trailing slash is added so relative paths extend the base path.
    /// * `options` - Timeout, retry and header settings.
    ///
    /// # Errors
    /// Returns `HttpError::InvalidUrl` if `base_url` is not absolute, or
    /// `HttpError::Build` if the TLS backend cannot be initialized.
    pub fn new(base_url: &str, options: ClientOptions) -> Result<Self, HttpError> {
        // Parse the base URL to ensure it is valid and absolute
        let mut url = Url::parse(base_url)?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }

        let mut builder = reqwest::Client::builder().default_headers(options.default_headers);
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(agent) = options.user_agent {
            builder = builder.user_agent(agent);
        }
        let client = builder.build().map_err(HttpError::Build)?;

        // Configure an exponential backoff policy with the requested retries
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(options.max_retries);

        // Construct the client with the retry middleware
        let client = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: client,
            base_url: url,
        })
    }

    /// The normalized base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Performs a request and returns the body as text, whatever the status.
    ///
    /// On a 2xx status the text lands in `data`, otherwise in `error_body`.
    ///
    /// # Arguments
    /// * `method` - The HTTP verb (GET, POST, etc.).
    /// * `path` - The relative path to append to the base URL.
    /// * `headers` - Optional additional headers for this specific request.
    /// * `body` - Optional serializable object to send as the JSON body.
    ///
    /// # Errors
    /// Returns an `HttpError` if URL joining, body encoding or network execution fails.
    pub async fn request_raw<B>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<B>,
    ) -> Result<ApiResponse<String>, HttpError>
    where
        B: Serialize,
    {
        // 1. Construct the full absolute URL
        let full_url = self.base_url.join(path)?;
        let mut req = self.inner.request(method, full_url);

        // 2. Add Custom Headers if provided
        if let Some(h) = headers {
            req = req.headers(h);
        }

        // 3. Serialize and attach the JSON body if present
        if let Some(b) = body {
            let json_body = serde_json::to_string(&b).map_err(HttpError::Encode)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        // 4. Execute the request and capture response metadata
        let response: reqwest::Response = req.send().await?;
        let status = response.status();
        let resp_headers = response.headers().clone();
        let success = status.is_success();
        let text = response.text().await?;

        Ok(ApiResponse {
            data: success.then(|| text.clone()),
            error_body: (!success).then_some(text),
            status: status.as_u16(),
            success,
            headers: resp_headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve;

    fn no_retry() -> ClientOptions {
        ClientOptions {
            max_retries: 0,
            timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        }
    }

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let client = ApiClient::new("https://example.com/v2.4", no_retry()).unwrap();
        assert_eq!(client.base_url().as_str(), "https://example.com/v2.4/");
    }

    #[test]
    fn test_relative_base_url_is_rejected() {
        let result = ApiClient::new("not a url", no_retry());
        assert!(matches!(result, Err(HttpError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_post_json_body_and_join_path() {
        let (base, handle) = serve(vec![("200 OK", r#"{"ok":true}"#.to_string())], None);
        let client = ApiClient::new(&base, no_retry()).unwrap();

        let res = client
            .request_raw(
                Method::POST,
                "trackings",
                None,
                Some(serde_json::json!({"tracking_number": "LP1"})),
            )
            .await
            .unwrap();

        let requests = handle.join().unwrap();
        assert!(res.success);
        assert_eq!(res.data.as_deref(), Some(r#"{"ok":true}"#));
        assert!(requests[0].starts_with("POST /api/trackings"));
        assert!(requests[0].contains(r#"{"tracking_number":"LP1"}"#));
    }

    #[tokio::test]
    async fn test_non_success_status_is_not_an_error() {
        let (base, handle) = serve(vec![("404 Not Found", r#"{"error":"missing"}"#.to_string())], None);
        let client = ApiClient::new(&base, no_retry()).unwrap();

        let res = client
            .request_raw::<()>(Method::GET, "status", None, None)
            .await
            .unwrap();
        handle.join().unwrap();

        assert!(!res.success);
        assert_eq!(res.status, 404);
        assert!(res.data.is_none());
        assert_eq!(res.error_body.as_deref(), Some(r#"{"error":"missing"}"#));
    }

    #[tokio::test]
    async fn test_slow_server_maps_to_timeout() {
        let (base, _handle) = serve(
            vec![("200 OK", "{}".to_string())],
            Some(Duration::from_millis(800)),
        );
        let client = ApiClient::new(
            &base,
            ClientOptions {
                timeout: Some(Duration::from_millis(200)),
                max_retries: 0,
                ..Default::default()
            },
        )
        .unwrap();

        let res = client.request_raw::<()>(Method::GET, "slow", None, None).await;
        assert!(matches!(res, Err(HttpError::Timeout)), "got {:?}", res);
    }
}
