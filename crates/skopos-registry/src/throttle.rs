//! Per-host rate-limit backoff.
//!
//! A `429`, or a `503` carrying `Retry-After`, suspends calls to that host
//! until a resume instant. Other hosts are unaffected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tracing::info;

use crate::clock::{Clock, SystemClock};

/// What a caller does when its host is throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleMode {
    /// Sleep until the resume instant if it is within `max_wait`, else fail.
    Wait {
        /// Longest acceptable wait.
        max_wait: Duration,
    },
    /// Fail immediately with `RateLimited`.
    Abandon,
}

/// Configuration for the throttle controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Backoff used when `Retry-After` is missing or unparseable.
    pub default_backoff: Duration,

    /// Wait behavior of the client.
    pub mode: ThrottleMode,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            default_backoff: Duration::from_secs(30),
            mode: ThrottleMode::Wait {
                max_wait: Duration::from_secs(60),
            },
        }
    }
}

impl ThrottleConfig {
    /// Sets the default backoff.
    #[must_use]
    pub const fn with_default_backoff(mut self, backoff: Duration) -> Self {
        self.default_backoff = backoff;
        self
    }

    /// Sets the wait behavior.
    #[must_use]
    pub const fn with_mode(mut self, mode: ThrottleMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Answer to [`ThrottleController::may_call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Call now.
    Proceed,
    /// Do not call before this instant.
    WaitUntil(DateTime<Utc>),
}

/// Active backoff for a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleState {
    /// Registry host.
    pub host: String,
    /// No call before this instant.
    pub not_before: DateTime<Utc>,
    /// Why the host was throttled.
    pub reason: String,
}

/// Tracks per-host backoff.
#[derive(Debug, Clone)]
pub struct ThrottleController {
    config: ThrottleConfig,
    clock: Arc<dyn Clock>,
    hosts: Arc<Mutex<HashMap<String, ThrottleState>>>,
}

impl ThrottleController {
    /// Creates a controller using the system clock.
    #[must_use]
    pub fn new(config: ThrottleConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a controller using the given clock.
    #[must_use]
    pub fn with_clock(config: ThrottleConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            hosts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Checks whether a host may be called now. Expired state is cleared.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::collections::HashMap;
    /// use skopos_registry::{Permit, ThrottleConfig, ThrottleController};
    ///
    /// let throttle = ThrottleController::new(ThrottleConfig::default());
    /// assert_eq!(throttle.may_call("ghcr.io"), Permit::Proceed);
    ///
    /// let headers = HashMap::from([("retry-after".to_string(), "120".to_string())]);
    /// throttle.record_response("ghcr.io", 429, &headers);
    /// assert!(matches!(throttle.may_call("ghcr.io"), Permit::WaitUntil(_)));
    /// assert_eq!(throttle.may_call("quay.io"), Permit::Proceed);
    /// ```
    #[must_use]
    pub fn may_call(&self, host: &str) -> Permit {
        let now = self.clock.now();
        let mut hosts = self.hosts.lock();
        match hosts.get(host) {
            Some(state) if now < state.not_before => Permit::WaitUntil(state.not_before),
            Some(_) => {
                hosts.remove(host);
                info!(host, "Throttle expired, resuming calls");
                Permit::Proceed
            }
            None => Permit::Proceed,
        }
    }

    /// Inspects a response and throttles the host if it signals a rate limit.
    ///
    /// Returns the resume instant when the host was throttled.
    pub fn record_response(
        &self,
        host: &str,
        status: u16,
        headers: &HashMap<String, String>,
    ) -> Option<DateTime<Utc>> {
        let retry_after = headers.get("retry-after").map(String::as_str);
        let limited = status == 429 || (status == 503 && retry_after.is_some());
        if !limited {
            return None;
        }

        let now = self.clock.now();
        let backoff = retry_after
            .and_then(|value| parse_retry_after(value, now))
            .unwrap_or(self.config.default_backoff);
        let reason = match retry_after {
            Some(value) => format!("HTTP {status}, Retry-After: {value}"),
            None => format!("HTTP {status}"),
        };
        Some(self.throttle(host, backoff, reason))
    }

    /// Throttles a host for a duration, never shortening an existing backoff.
    pub fn throttle(&self, host: &str, backoff: Duration, reason: impl Into<String>) -> DateTime<Utc> {
        let now = self.clock.now();
        let until = chrono::Duration::from_std(backoff)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut hosts = self.hosts.lock();
        let state = hosts.entry(host.to_string()).or_insert_with(|| ThrottleState {
            host: host.to_string(),
            not_before: now,
            reason: String::new(),
        });
        if until > state.not_before {
            state.not_before = until;
            state.reason = reason.into();
        }
        let not_before = state.not_before;
        drop(hosts);

        info!(host, resume_at = %not_before, backoff_secs = backoff.as_secs(), "Host throttled");
        not_before
    }

    /// Removes throttle state for a host.
    pub fn clear(&self, host: &str) {
        if self.hosts.lock().remove(host).is_some() {
            info!(host, "Throttle cleared");
        }
    }

    /// Lists hosts that are currently throttled.
    #[must_use]
    pub fn throttled_hosts(&self) -> Vec<ThrottleState> {
        let now = self.clock.now();
        let mut states: Vec<ThrottleState> = self
            .hosts
            .lock()
            .values()
            .filter(|s| now < s.not_before)
            .cloned()
            .collect();
        states.sort_by(|a, b| a.host.cmp(&b.host));
        states
    }
}

/// Parses `Retry-After` as delta-seconds or an HTTP-date.
///
/// Returns `None` for unparseable values and for dates not in the future.
#[must_use]
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return (secs > 0).then(|| Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    (at - now).to_std().ok().filter(|d| !d.is_zero())
}

/// Randomizes processing order so throttled hosts do not starve the same workloads.
pub fn shuffle_workloads<T>(items: &mut [T]) {
    items.shuffle(&mut rand::thread_rng());
}
