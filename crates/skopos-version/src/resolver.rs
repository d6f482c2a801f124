//! Reduction of current and latest signal sets into a [`ResolvedVersion`].

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::policy::VersionPolicy;
use crate::revision::RevisionStatus;
use crate::rules::{self, RuleId, Selection};
use crate::signal::SignalSet;

/// Auditable record of how a resolution was produced.
///
/// Renders as `<requested>[><applied>]/<rule>[+suffix]...`, for example
/// `auto/annotation_version`, `version>auto/digest` or
/// `digest/digest+pinned`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonCode {
    /// Policy the caller asked for.
    pub requested: VersionPolicy,
    /// Policy whose rule table produced the latest value.
    pub applied: VersionPolicy,
    /// Rule that produced the latest value.
    pub rule: RuleId,
    /// Rule that produced the current value, when it differs.
    pub current_rule: Option<RuleId>,
    /// Latest was forced to equal current by an explicit pin.
    pub pinned: bool,
    /// Equal versions with differing digests were recomposed as `version:digest`.
    pub rebuilt: bool,
}

impl ReasonCode {
    fn new(requested: VersionPolicy, applied: VersionPolicy, rule: RuleId) -> Self {
        Self {
            requested,
            applied,
            rule,
            current_rule: None,
            pinned: false,
            rebuilt: false,
        }
    }

    /// True when the requested policy's own rules could not produce a value.
    #[must_use]
    pub fn fell_back(&self) -> bool {
        self.requested != self.applied
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.requested.as_str().to_ascii_lowercase())?;
        if self.fell_back() {
            write!(f, ">{}", self.applied.as_str().to_ascii_lowercase())?;
        }
        write!(f, "/{}", self.rule)?;
        if let Some(current) = self.current_rule {
            write!(f, "+current:{current}")?;
        }
        if self.rebuilt {
            f.write_str("+rebuilt")?;
        }
        if self.pinned {
            f.write_str("+pinned")?;
        }
        Ok(())
    }
}

/// Final version fact for one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedVersion {
    /// Version text of what is running.
    pub current: String,
    /// Version text of what is available.
    pub latest: String,
    /// Policy actually applied after any fall-through.
    pub policy: VersionPolicy,
    /// Which rules produced the values.
    pub reason: ReasonCode,
    /// Whether the workload should be reported as updatable.
    pub update_available: bool,
}

/// Reduces signal sets into resolved versions.
///
/// Stateless; resolution never fails on partial data.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionResolver;

impl VersionResolver {
    /// Creates a new resolver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Resolves a registry workload.
    ///
    /// When `explicit_pin` is set the latest side is forced to equal the
    /// current side regardless of policy.
    ///
    /// # Examples
    ///
    /// ```
    /// use skopos_version::{SignalSet, VersionPolicy, VersionResolver};
    ///
    /// let current = SignalSet::new().with_tag("1.24").with_digest("sha256:aaaaaaaaaaaaaaaa");
    /// let latest = SignalSet::new().with_tag("1.25").with_digest("sha256:bbbbbbbbbbbbbbbb");
    ///
    /// let resolved = VersionResolver::new().resolve(&current, &latest, VersionPolicy::Auto, false);
    /// assert_eq!(resolved.current, "1.24");
    /// assert_eq!(resolved.latest, "1.25");
    /// assert!(resolved.update_available);
    /// assert_eq!(resolved.reason.to_string(), "auto/tag_version");
    /// ```
    #[must_use]
    pub fn resolve(
        &self,
        current: &SignalSet,
        latest: &SignalSet,
        policy: VersionPolicy,
        explicit_pin: bool,
    ) -> ResolvedVersion {
        let mut current_sel = rules::select(current, policy);
        let mut latest_sel = if explicit_pin {
            current_sel.clone()
        } else {
            rules::select(latest, policy)
        };

        let mut reason = ReasonCode::new(policy, latest_sel.applied, latest_sel.rule);
        reason.pinned = explicit_pin;
        if current_sel.rule != latest_sel.rule {
            reason.current_rule = Some(current_sel.rule);
        }

        if !explicit_pin && Self::needs_rebuild_marker(&current_sel, &latest_sel, current, latest)
        {
            current_sel.value = Self::with_short_digest(&current_sel.value, current);
            latest_sel.value = Self::with_short_digest(&latest_sel.value, latest);
            reason.rebuilt = true;
        }

        // Without a signal on both sides there is nothing to compare.
        let comparable = current_sel.rule != RuleId::NoSignal && latest_sel.rule != RuleId::NoSignal;
        let update_available = !explicit_pin && comparable && current_sel.value != latest_sel.value;

        debug!(
            policy = %policy,
            current = %current_sel.value,
            latest = %latest_sel.value,
            reason = %reason,
            update_available,
            "Resolved version"
        );

        ResolvedVersion {
            current: current_sel.value,
            latest: latest_sel.value,
            policy: latest_sel.applied,
            reason,
            update_available,
        }
    }

    /// Resolves a single signal set against itself.
    ///
    /// Useful for reporting a version where there is nothing to compare.
    #[must_use]
    pub fn resolve_single(&self, signals: &SignalSet, policy: VersionPolicy) -> ResolvedVersion {
        self.resolve(signals, signals, policy, false)
    }

    /// Resolves a locally built workload from its revision-control status.
    ///
    /// Current is `git:<rev>`; latest is `git:<rev>+<n>` when `n` upstream
    /// commits are unseen, otherwise equal to current.
    ///
    /// # Examples
    ///
    /// ```
    /// use skopos_version::{RevisionStatus, VersionPolicy, VersionResolver};
    ///
    /// let status = RevisionStatus::new("a1b2c3d", 3);
    /// let resolved = VersionResolver::new().resolve_local(&status, VersionPolicy::Auto);
    /// assert_eq!(resolved.current, "git:a1b2c3d");
    /// assert_eq!(resolved.latest, "git:a1b2c3d+3");
    /// assert!(resolved.update_available);
    /// ```
    #[must_use]
    pub fn resolve_local(&self, status: &RevisionStatus, policy: VersionPolicy) -> ResolvedVersion {
        let current = format!("git:{}", status.short_rev);
        let latest = if status.unseen_commits > 0 {
            format!("{current}+{}", status.unseen_commits)
        } else {
            current.clone()
        };

        let reason = ReasonCode::new(policy, VersionPolicy::Auto, RuleId::LocalRevision);
        let update_available = status.unseen_commits > 0;

        debug!(
            revision = %status.short_rev,
            unseen_commits = status.unseen_commits,
            reason = %reason,
            "Resolved local build"
        );

        ResolvedVersion {
            current,
            latest,
            policy: VersionPolicy::Auto,
            reason,
            update_available,
        }
    }

    /// Same version text on both sides but different content.
    fn needs_rebuild_marker(
        current_sel: &Selection,
        latest_sel: &Selection,
        current: &SignalSet,
        latest: &SignalSet,
    ) -> bool {
        if latest_sel.applied != VersionPolicy::Auto
            || !current_sel.rule.is_version()
            || !latest_sel.rule.is_version()
            || current_sel.value != latest_sel.value
        {
            return false;
        }
        matches!(
            (current.short_digest(), latest.short_digest()),
            (Some(a), Some(b)) if a != b
        )
    }

    fn with_short_digest(version: &str, signals: &SignalSet) -> String {
        signals
            .short_digest()
            .map_or_else(|| version.to_string(), |d| format!("{version}:{d}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn fixed_signals() -> SignalSet {
        SignalSet::new()
            .with_annotation_version("2.3.1")
            .with_digest("abc123def456")
            .with_created(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap())
    }

    #[test]
    fn test_policy_determinism() {
        let resolver = VersionResolver::new();
        let signals = fixed_signals();

        let auto = resolver.resolve_single(&signals, VersionPolicy::Auto);
        assert_eq!(auto.current, "2.3.1");
        assert_eq!(auto.latest, "2.3.1");
        assert!(!auto.update_available);

        let digest = resolver.resolve_single(&signals, VersionPolicy::Digest);
        assert_eq!(digest.latest, "abc123def456");

        let both = resolver.resolve_single(&signals, VersionPolicy::VersionDigest);
        assert_eq!(both.latest, "2.3.1:abc123def456");
        assert_eq!(both.reason.to_string(), "version_digest/version_digest");
    }

    #[test]
    fn test_explicit_pin_forces_latest_to_current() {
        let resolver = VersionResolver::new();
        let current = SignalSet::new()
            .with_tag("1.0")
            .with_digest("sha256:111111111111111111");
        let latest = SignalSet::new()
            .with_tag("2.0")
            .with_digest("sha256:222222222222222222");

        for policy in VersionPolicy::ALL {
            let resolved = resolver.resolve(&current, &latest, policy, true);
            assert_eq!(resolved.latest, resolved.current, "policy {policy}");
            assert!(!resolved.update_available);
            assert!(resolved.reason.pinned);
            assert!(resolved.reason.to_string().ends_with("+pinned"));
        }
    }

    #[test]
    fn test_local_build_with_unseen_commits() {
        let resolved = VersionResolver::new()
            .resolve_local(&RevisionStatus::new("a1b2c3d", 3), VersionPolicy::Auto);
        assert_eq!(resolved.current, "git:a1b2c3d");
        assert_eq!(resolved.latest, "git:a1b2c3d+3");
        assert!(resolved.update_available);
        assert_eq!(resolved.reason.rule, RuleId::LocalRevision);
    }

    #[test]
    fn test_local_build_up_to_date() {
        let resolved = VersionResolver::new()
            .resolve_local(&RevisionStatus::new("a1b2c3d", 0), VersionPolicy::Digest);
        assert_eq!(resolved.current, "git:a1b2c3d");
        assert_eq!(resolved.latest, "git:a1b2c3d");
        assert!(!resolved.update_available);
        assert_eq!(resolved.reason.to_string(), "digest>auto/local_revision");
    }

    #[test]
    fn test_rebuild_with_same_version_shows_digest() {
        let current = SignalSet::new()
            .with_annotation_version("1.4.2")
            .with_digest("sha256:aaaaaaaaaaaaaaaaaaaa");
        let latest = SignalSet::new()
            .with_annotation_version("1.4.2")
            .with_digest("sha256:bbbbbbbbbbbbbbbbbbbb");

        let resolved = VersionResolver::new().resolve(&current, &latest, VersionPolicy::Auto, false);
        assert_eq!(resolved.current, "1.4.2:aaaaaaaaaaaa");
        assert_eq!(resolved.latest, "1.4.2:bbbbbbbbbbbb");
        assert!(resolved.update_available);
        assert!(resolved.reason.rebuilt);
        assert_eq!(resolved.reason.to_string(), "auto/annotation_version+rebuilt");
    }

    #[test]
    fn test_version_policy_does_not_mark_rebuilds() {
        let current = SignalSet::new()
            .with_tag("1.4.2")
            .with_digest("sha256:aaaaaaaaaaaaaaaaaaaa");
        let latest = SignalSet::new()
            .with_tag("1.4.2")
            .with_digest("sha256:bbbbbbbbbbbbbbbbbbbb");

        let resolved =
            VersionResolver::new().resolve(&current, &latest, VersionPolicy::Version, false);
        assert_eq!(resolved.current, "1.4.2");
        assert!(!resolved.update_available);
    }

    #[test]
    fn test_fallback_is_recorded() {
        let current = SignalSet::new().with_tag("latest").with_digest("sha256:0123456789abcdef");
        let latest = SignalSet::new().with_tag("latest").with_digest("sha256:fedcba9876543210");

        let resolved =
            VersionResolver::new().resolve(&current, &latest, VersionPolicy::Version, false);
        assert_eq!(resolved.policy, VersionPolicy::Auto);
        assert!(resolved.reason.fell_back());
        assert_eq!(resolved.reason.to_string(), "version>auto/digest");
        assert!(resolved.update_available);
    }

    #[test]
    fn test_mixed_rules_recorded() {
        let current = SignalSet::new().with_digest("sha256:0123456789abcdef");
        let latest = SignalSet::new().with_annotation_version("3.0.0");

        let resolved = VersionResolver::new().resolve(&current, &latest, VersionPolicy::Auto, false);
        assert_eq!(resolved.reason.current_rule, Some(RuleId::Digest));
        assert_eq!(
            resolved.reason.to_string(),
            "auto/annotation_version+current:digest"
        );
    }

    #[test]
    fn test_reason_code_never_empty() {
        let resolved = VersionResolver::new().resolve_single(&SignalSet::new(), VersionPolicy::Auto);
        assert_eq!(resolved.current, "unknown");
        assert_eq!(resolved.reason.to_string(), "auto/no_signal");
    }

    #[test]
    fn test_unknown_current_is_never_an_update() {
        let resolver = VersionResolver::new();
        let latest = SignalSet::new().with_annotation_version("1.1");

        for policy in VersionPolicy::ALL {
            let resolved = resolver.resolve(&SignalSet::new(), &latest, policy, false);
            assert_eq!(resolved.current, "unknown", "policy {policy}");
            assert!(!resolved.update_available, "policy {policy}");
            assert_eq!(resolved.reason.current_rule, Some(RuleId::NoSignal));
        }

        let resolved = resolver.resolve(&latest, &SignalSet::new(), VersionPolicy::Auto, false);
        assert_eq!(resolved.latest, "unknown");
        assert!(!resolved.update_available);
    }
}
