//! Configuration types for the registry engine.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::error::RegistryError;
use crate::reference::Platform;
use crate::throttle::ThrottleConfig;

/// Configuration for the update engine and its registry client.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-request timeout for every outbound call.
    pub request_timeout: Duration,

    /// User agent string.
    pub user_agent: String,

    /// Maximum workloads resolved concurrently by `resolve_all`.
    pub max_concurrency: usize,

    /// Platform used when a request does not name one.
    pub default_platform: Platform,

    /// Cache TTLs and sweep interval.
    pub cache: CacheConfig,

    /// Throttle defaults and wait behavior.
    pub throttle: ThrottleConfig,

    /// Retry behavior for transient failures.
    pub retry: RetryConfig,

    /// Per-host overrides keyed by registry host.
    pub hosts: HashMap<String, HostOverride>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            user_agent: format!("skopos-registry/{}", env!("CARGO_PKG_VERSION")),
            max_concurrency: 8,
            default_platform: Platform::default(),
            cache: CacheConfig::default(),
            throttle: ThrottleConfig::default(),
            retry: RetryConfig::default(),
            hosts: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with default settings.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use skopos_registry::EngineConfig;
    ///
    /// let config = EngineConfig::new();
    /// assert_eq!(config.max_concurrency, 8);
    /// assert_eq!(config.request_timeout, Duration::from_secs(30));
    /// ```
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Sets the concurrency cap. Values below one are raised to one.
    #[must_use]
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Sets the default platform.
    #[must_use]
    pub fn with_default_platform(mut self, platform: Platform) -> Self {
        self.default_platform = platform;
        self
    }

    /// Sets the cache configuration.
    #[must_use]
    pub const fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the throttle configuration.
    #[must_use]
    pub const fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Adds or replaces an override for a host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>, host_override: HostOverride) -> Self {
        self.hosts
            .insert(host.into().to_ascii_lowercase(), host_override);
        self
    }

    /// Returns the override for a host, or the defaults.
    #[must_use]
    pub fn host(&self, host: &str) -> HostOverride {
        self.hosts
            .get(&host.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }
}

/// Whether fetched documents are checked against the digest they were fetched by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestVerification {
    /// Recompute and compare every digest-addressed document.
    #[default]
    Full,
    /// Trust the registry. Must be configured explicitly per host.
    Skip,
}

impl fmt::Display for DigestVerification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Skip => f.write_str("skip"),
        }
    }
}

impl FromStr for DigestVerification {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "skip" => Ok(Self::Skip),
            other => Err(RegistryError::InvalidDocument {
                url: "digest_verification".to_string(),
                message: format!("unknown verification mode '{other}'"),
            }),
        }
    }
}

/// Credential presented to a registry.
#[derive(Clone, PartialEq, Eq)]
pub enum RegistryCredential {
    /// Username and password (or username and token).
    Basic {
        /// Username.
        username: String,
        /// Password or token.
        password: String,
    },

    /// Bare personal-access token, presented in the provider's token style.
    Token(String),
}

impl RegistryCredential {
    /// Creates a username/password credential.
    ///
    /// # Examples
    ///
    /// ```
    /// use skopos_registry::RegistryCredential;
    ///
    /// let credential = RegistryCredential::basic("user", "pass");
    /// assert!(matches!(credential, RegistryCredential::Basic { .. }));
    /// ```
    #[must_use]
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Creates a personal-access token credential.
    #[must_use]
    pub fn token(token: impl Into<String>) -> Self {
        Self::Token(token.into())
    }
}

impl fmt::Debug for RegistryCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Token(_) => f.debug_tuple("Token").field(&"<redacted>").finish(),
        }
    }
}

/// Settings that apply to one registry host.
#[derive(Debug, Clone, Default)]
pub struct HostOverride {
    /// Digest verification mode.
    pub verification: DigestVerification,

    /// Talk plain HTTP instead of HTTPS (local registries, tests).
    pub plain_http: bool,

    /// Credential used when the workload does not supply one.
    pub credential: Option<RegistryCredential>,
}

impl HostOverride {
    /// Creates an override with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the digest verification mode.
    #[must_use]
    pub const fn with_verification(mut self, verification: DigestVerification) -> Self {
        self.verification = verification;
        self
    }

    /// Uses plain HTTP for this host.
    #[must_use]
    pub const fn with_plain_http(mut self, plain_http: bool) -> Self {
        self.plain_http = plain_http;
        self
    }

    /// Sets the host credential.
    #[must_use]
    pub fn with_credential(mut self, credential: RegistryCredential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// URL scheme for this host.
    #[must_use]
    pub const fn scheme(&self) -> &'static str {
        if self.plain_http {
            "http"
        } else {
            "https"
        }
    }
}

/// Retry behavior for transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Randomizes each delay by up to `±factor * delay`.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.5,
        }
    }
}

impl RetryConfig {
    /// A single attempt with no retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_factor: 0.0,
        }
    }

    /// Sets the maximum attempts. Values below one are raised to one.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the initial and maximum delays.
    #[must_use]
    pub const fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    /// Sets the jitter factor, clamped to `0.0..=1.0`.
    #[must_use]
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait before the given retry (1 = first retry).
    ///
    /// Exponential: `initial * 2^(retry-1)`, capped at `max_delay`, then jittered.
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let base = self
            .initial_delay
            .saturating_mul(1 << (retry - 1).min(10))
            .min(self.max_delay);

        if self.jitter_factor <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = self.jitter_factor * rand::thread_rng().gen_range(-1.0..=1.0);
        base.mul_f64((1.0 + spread).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults() {
        let config = EngineConfig::new();
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.user_agent.starts_with("skopos-registry/"));
        assert_eq!(config.default_platform.to_string(), "linux/amd64");
    }

    #[test]
    fn test_max_concurrency_floor() {
        assert_eq!(EngineConfig::new().with_max_concurrency(0).max_concurrency, 1);
    }

    #[test]
    fn test_host_override_lookup_is_case_insensitive() {
        let config = EngineConfig::new().with_host(
            "Registry.Local:5000",
            HostOverride::new()
                .with_verification(DigestVerification::Skip)
                .with_plain_http(true),
        );
        let host = config.host("registry.local:5000");
        assert_eq!(host.verification, DigestVerification::Skip);
        assert_eq!(host.scheme(), "http");

        let other = config.host("ghcr.io");
        assert_eq!(other.verification, DigestVerification::Full);
        assert_eq!(other.scheme(), "https");
    }

    #[test]
    fn test_digest_verification_parse() {
        assert_eq!(
            "FULL".parse::<DigestVerification>().unwrap(),
            DigestVerification::Full
        );
        assert_eq!(
            "skip".parse::<DigestVerification>().unwrap(),
            DigestVerification::Skip
        );
        assert!("sometimes".parse::<DigestVerification>().is_err());
    }

    #[test]
    fn test_credential_debug_redacts_secrets() {
        let basic = format!("{:?}", RegistryCredential::basic("bob", "hunter2"));
        assert!(basic.contains("bob"));
        assert!(!basic.contains("hunter2"));

        let token = format!("{:?}", RegistryCredential::token("ghp_secret"));
        assert!(!token.contains("ghp_secret"));
    }

    #[test]
    fn test_retry_delay_without_jitter() {
        let retry = RetryConfig::default()
            .with_jitter(0.0)
            .with_delays(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(retry.delay_for_retry(0), Duration::ZERO);
        assert_eq!(retry.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_retry(3), Duration::from_millis(350));
    }

    #[test]
    fn test_retry_delay_jitter_bounds() {
        let retry = RetryConfig::default()
            .with_jitter(0.5)
            .with_delays(Duration::from_millis(1000), Duration::from_secs(10));
        for _ in 0..100 {
            let delay = retry.delay_for_retry(1);
            assert!(delay >= Duration::from_millis(500), "{delay:?}");
            assert!(delay <= Duration::from_millis(1500), "{delay:?}");
        }
    }
}
