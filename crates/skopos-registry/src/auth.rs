//! Authentication negotiation state and helpers.
//!
//! Flow for a Bearer registry:
//! 1. Request without credentials (or with a cached token) → `401` with
//!    `WWW-Authenticate: Bearer realm="...",service="...",scope="..."`
//! 2. Request a token from the realm, anonymously or with the configured
//!    credential, and cache it by host and scope
//! 3. Retry the original request once with `Authorization: Bearer <token>`
//!
//! The challenge is remembered per host so later scopes skip step 1.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::RegistryCredential;
use crate::error::RegistryError;
use crate::reference::ImageReference;

/// Seconds shaved off a token's lifetime so it is refreshed before the registry rejects it.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 10;

/// Authentication scheme a host uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    /// No authentication seen yet, or none required.
    #[default]
    None,
    /// HTTP Basic on every request.
    Basic,
    /// Token obtained from a realm.
    Bearer,
}

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Challenge scheme.
    pub scheme: AuthScheme,
    /// Parameters keyed by lower-case name.
    pub params: BTreeMap<String, String>,
}

impl Challenge {
    /// Parses a `WWW-Authenticate` header value.
    ///
    /// Scheme and parameter names are case-insensitive; quoted values may
    /// contain commas and escaped quotes.
    ///
    /// # Examples
    ///
    /// ```
    /// use skopos_registry::{AuthScheme, Challenge};
    ///
    /// let c = Challenge::parse(
    ///     r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull""#,
    /// ).unwrap();
    /// assert_eq!(c.scheme, AuthScheme::Bearer);
    /// assert_eq!(c.realm(), Some("https://auth.docker.io/token"));
    /// assert_eq!(c.scope(), Some("repository:library/nginx:pull"));
    /// ```
    #[must_use]
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, rest) = header
            .split_once(char::is_whitespace)
            .unwrap_or((header, ""));
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "bearer" => AuthScheme::Bearer,
            "basic" => AuthScheme::Basic,
            _ => return None,
        };

        Some(Self {
            scheme,
            params: parse_params(rest),
        })
    }

    /// Builds a bearer challenge for a known token endpoint.
    #[must_use]
    pub fn bearer(realm: &str, service: &str) -> Self {
        Self {
            scheme: AuthScheme::Bearer,
            params: BTreeMap::from([
                ("realm".to_string(), realm.to_string()),
                ("service".to_string(), service.to_string()),
            ]),
        }
    }

    /// Token endpoint.
    #[must_use]
    pub fn realm(&self) -> Option<&str> {
        self.params.get("realm").map(String::as_str)
    }

    /// Service name to present to the token endpoint.
    #[must_use]
    pub fn service(&self) -> Option<&str> {
        self.params.get("service").map(String::as_str)
    }

    /// Scope requested by the registry.
    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.params.get("scope").map(String::as_str)
    }

    /// Builds the token request URL for a scope.
    ///
    /// # Errors
    ///
    /// Returns an error if the challenge has no realm or the realm is not a URL.
    pub fn token_url(&self, scope: &str) -> Result<Url, RegistryError> {
        let realm = self.realm().ok_or_else(|| RegistryError::InvalidDocument {
            url: "WWW-Authenticate".to_string(),
            message: "bearer challenge without realm".to_string(),
        })?;
        let mut url = Url::parse(realm).map_err(|_| RegistryError::InvalidUrl {
            url: realm.to_string(),
        })?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = self.service() {
                query.append_pair("service", service);
            }
            query.append_pair("scope", scope);
        }
        Ok(url)
    }
}

fn parse_params(input: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace() || *c == ',').is_some() {}

        let mut name = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && *c != ',') {
            name.push(c);
        }
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            break;
        }
        if chars.next_if_eq(&'=').is_none() {
            continue;
        }

        let mut value = String::new();
        if chars.next_if_eq(&'"').is_some() {
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| *c != ',') {
                value.push(c);
            }
            value = value.trim().to_string();
        }
        params.insert(name, value);
    }
    params
}

/// Default pull scope for a repository.
#[must_use]
pub fn pull_scope(repository: &str) -> String {
    format!("repository:{repository}:pull")
}

/// `Authorization` value for HTTP Basic.
#[must_use]
pub fn basic_header(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}

/// `Authorization` value for a bearer token.
#[must_use]
pub fn bearer_header(token: &str) -> String {
    format!("Bearer {token}")
}

/// How a provider expects a bare personal-access token to be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStyle {
    /// Basic with a fixed placeholder username.
    BasicWithUser(&'static str),
    /// Sent as a bearer token.
    Bearer,
}

/// `Authorization` header for a token request.
///
/// `None` means the request is anonymous.
#[must_use]
pub fn token_request_header(
    credential: Option<&RegistryCredential>,
    style: TokenStyle,
) -> Option<String> {
    match credential? {
        RegistryCredential::Basic { username, password } => Some(basic_header(username, password)),
        RegistryCredential::Token(token) => Some(match style {
            TokenStyle::BasicWithUser(user) => basic_header(user, token),
            TokenStyle::Bearer => bearer_header(token),
        }),
    }
}

/// Body of a token endpoint response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    /// Token (Docker distribution spelling).
    #[serde(default)]
    pub token: Option<String>,
    /// Token (OAuth2 spelling).
    #[serde(default)]
    pub access_token: Option<String>,
    /// Lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenResponse {
    /// Converts into a token, preferring `token` over `access_token`.
    ///
    /// Without `expires_in` the token lives for `default_ttl`.
    #[must_use]
    pub fn into_token(
        self,
        scope: &str,
        now: DateTime<Utc>,
        default_ttl: Duration,
    ) -> Option<AuthToken> {
        let token = self
            .token
            .filter(|t| !t.is_empty())
            .or(self.access_token.filter(|t| !t.is_empty()))?;
        let lifetime = match self.expires_in {
            Some(secs) if secs > 0 => {
                let margin = TOKEN_EXPIRY_MARGIN_SECS.min(secs / 2);
                Duration::seconds(secs - margin)
            }
            _ => default_ttl,
        };
        Some(AuthToken {
            token,
            scope: scope.to_string(),
            expires_at: now + lifetime,
        })
    }
}

/// A bearer token for one host and scope.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    /// Opaque token.
    pub token: String,
    /// Scope the token was issued for.
    pub scope: String,
    /// Instant after which the token must not be used.
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    /// Remaining lifetime at `now`, zero if expired.
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.expires_at - now).to_std().unwrap_or_default()
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthToken")
            .field("token", &"<redacted>")
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// What is known about a registry host's authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostAuthState {
    /// Scheme in use.
    pub scheme: AuthScheme,
    /// Last bearer challenge issued by the host.
    pub challenge: Option<Challenge>,
}

/// Per-host authentication state, created lazily on first contact.
#[derive(Debug, Clone, Default)]
pub struct AuthStates {
    hosts: Arc<Mutex<HashMap<String, HostAuthState>>>,
}

impl AuthStates {
    /// Creates an empty registry of host states.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the state for a host.
    #[must_use]
    pub fn get(&self, host: &str) -> HostAuthState {
        self.hosts.lock().get(host).cloned().unwrap_or_default()
    }

    /// Records a challenge from a `401`.
    pub fn remember_challenge(&self, host: &str, challenge: Challenge) {
        let mut hosts = self.hosts.lock();
        let state = hosts.entry(host.to_string()).or_default();
        state.scheme = challenge.scheme;
        state.challenge = (challenge.scheme == AuthScheme::Bearer).then_some(challenge);
    }

    /// Marks a host as using Basic on every request.
    pub fn mark_basic(&self, host: &str) {
        let mut hosts = self.hosts.lock();
        let state = hosts.entry(host.to_string()).or_default();
        state.scheme = AuthScheme::Basic;
        state.challenge = None;
    }

    /// Number of hosts seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.lock().len()
    }

    /// True if no host has been contacted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.lock().is_empty()
    }
}

/// Supplies credentials per host or per workload.
pub trait CredentialSource: Send + Sync + std::fmt::Debug {
    /// Returns the credential for an image, if any.
    fn credential(&self, reference: &ImageReference) -> Option<RegistryCredential>;
}

/// Credentials from a fixed host map.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    by_host: HashMap<String, RegistryCredential>,
}

impl StaticCredentials {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a credential for a host.
    #[must_use]
    pub fn with(mut self, host: impl Into<String>, credential: RegistryCredential) -> Self {
        self.by_host
            .insert(host.into().to_ascii_lowercase(), credential);
        self
    }
}

impl CredentialSource for StaticCredentials {
    fn credential(&self, reference: &ImageReference) -> Option<RegistryCredential> {
        self.by_host.get(&reference.registry).cloned()
    }
}
