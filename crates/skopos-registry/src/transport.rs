//! HTTP transport seam.
//!
//! The client treats the transport as a pure request/response function with
//! header access. [`ReqwestTransport`] is the production implementation; tests
//! substitute scripted transports.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::redirect;
use thiserror::Error;
use url::Url;

/// An outbound GET request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Target URL.
    pub url: Url,
    /// Request headers.
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    /// Creates a GET request without headers.
    #[must_use]
    pub const fn get(url: Url) -> Self {
        Self {
            url,
            headers: Vec::new(),
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns a header value by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A response with lower-cased header names.
#[derive(Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Headers keyed by lower-case name.
    pub headers: HashMap<String, String>,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response, lower-casing header names.
    #[must_use]
    pub fn new<I, K, V>(status: u16, headers: I, body: impl Into<Vec<u8>>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
                .collect(),
            body: body.into(),
        }
    }

    /// Returns a header value by name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// True for 2xx statuses.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// True for redirect statuses that carry a `Location`.
    #[must_use]
    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308) && self.header("location").is_some()
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Failure below the HTTP layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The request did not complete within its timeout.
    #[error("Request to {url} timed out")]
    Timeout {
        /// Request URL.
        url: String,
    },

    /// Connection could not be established or was reset.
    #[error("Connection to {url} failed: {message}")]
    Connect {
        /// Request URL.
        url: String,
        /// Error message.
        message: String,
    },

    /// Any other transport failure.
    #[error("Request to {url} failed: {message}")]
    Other {
        /// Request URL.
        url: String,
        /// Error message.
        message: String,
    },
}

/// Performs HTTP requests for the registry client.
#[async_trait]
pub trait HttpTransport: Send + Sync + fmt::Debug {
    /// Sends a GET request.
    ///
    /// Non-2xx statuses are responses, not errors.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if no response was received.
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// [`HttpTransport`] backed by `reqwest` with rustls.
///
/// Follows at most one redirect and only to the same host; other redirects
/// are returned to the caller. No cookie store is kept.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds a transport with a per-request timeout and user agent.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(user_agent)
            .redirect(redirect::Policy::custom(same_host_single_hop))
            .build()
            .map_err(|e| TransportError::Other {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

fn same_host_single_hop(attempt: redirect::Attempt<'_>) -> redirect::Action {
    let previous = attempt.previous();
    let same_host = previous
        .first()
        .is_some_and(|origin| origin.host_str() == attempt.url().host_str()
            && origin.port_or_known_default() == attempt.url().port_or_known_default());
    if previous.len() == 1 && same_host {
        attempt.follow()
    } else {
        attempt.stop()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = request.url.to_string();
        let mut builder = self.client.get(request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| classify(&url, &e))?;
        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(|e| classify(&url, &e))?;

        Ok(HttpResponse::new(status, headers, body.to_vec()))
    }
}

fn classify(url: &str, err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout {
            url: url.to_string(),
        }
    } else if err.is_connect() || err.is_request() {
        TransportError::Connect {
            url: url.to_string(),
            message: err.to_string(),
        }
    } else {
        TransportError::Other {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}
