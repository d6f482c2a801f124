//! Ordered rule tables for each version policy.
//!
//! Each policy maps to a list of rules evaluated top to bottom; the first
//! rule that yields a value wins and its [`RuleId`] is recorded in the
//! reason code. Policies other than `AUTO` fall through to the `AUTO` table
//! when none of their own rules fire.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::parse::ParsedVersion;
use crate::policy::VersionPolicy;
use crate::signal::{SignalKind, SignalSet};

/// Identifies the rule that produced a version value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    /// Parseable version from annotations.
    AnnotationVersion,
    /// Parseable version from the reference tag.
    TagVersion,
    /// `version:shortdigest` composition.
    VersionDigest,
    /// Shortened content digest.
    Digest,
    /// Source-control revision.
    SourceRevision,
    /// Creation timestamp.
    CreationTimestamp,
    /// Locally built tree: `git:<rev>` and unseen upstream commits.
    LocalRevision,
    /// No usable signal on this side.
    NoSignal,
}

impl RuleId {
    /// Returns the snake-case rule name used in reason codes.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AnnotationVersion => "annotation_version",
            Self::TagVersion => "tag_version",
            Self::VersionDigest => "version_digest",
            Self::Digest => "digest",
            Self::SourceRevision => "source_revision",
            Self::CreationTimestamp => "creation_timestamp",
            Self::LocalRevision => "local_revision",
            Self::NoSignal => "no_signal",
        }
    }

    /// True for rules whose value is a plain parsed version.
    #[must_use]
    pub const fn is_version(&self) -> bool {
        matches!(self, Self::AnnotationVersion | Self::TagVersion)
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entry in a rule table.
#[derive(Clone, Copy)]
pub struct Rule {
    /// Recorded when this rule fires.
    pub id: RuleId,
    extract: fn(&SignalSet) -> Option<String>,
}

impl Rule {
    const fn new(id: RuleId, extract: fn(&SignalSet) -> Option<String>) -> Self {
        Self { id, extract }
    }

    /// Applies the rule to a signal set.
    #[must_use]
    pub fn apply(&self, signals: &SignalSet) -> Option<String> {
        (self.extract)(signals)
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule").field("id", &self.id).finish()
    }
}

fn parsed(signals: &SignalSet, kind: SignalKind) -> Option<String> {
    signals
        .value(kind)
        .and_then(ParsedVersion::parse)
        .map(|v| v.as_str().to_string())
}

fn annotation_version(signals: &SignalSet) -> Option<String> {
    parsed(signals, SignalKind::AnnotationVersion)
}

fn tag_version(signals: &SignalSet) -> Option<String> {
    parsed(signals, SignalKind::ExplicitTag)
}

/// Best parseable version: annotation first, then tag.
pub(crate) fn best_version(signals: &SignalSet) -> Option<String> {
    annotation_version(signals).or_else(|| tag_version(signals))
}

fn digest(signals: &SignalSet) -> Option<String> {
    signals.short_digest().filter(|d| !d.is_empty())
}

fn version_digest(signals: &SignalSet) -> Option<String> {
    Some(format!("{}:{}", best_version(signals)?, digest(signals)?))
}

fn source_revision(signals: &SignalSet) -> Option<String> {
    signals
        .value(SignalKind::SourceRevision)
        .map(|rev| format!("git:{rev}"))
}

fn creation_timestamp(signals: &SignalSet) -> Option<String> {
    signals
        .value(SignalKind::CreationTimestamp)
        .map(ToString::to_string)
}

const AUTO_RULES: &[Rule] = &[
    Rule::new(RuleId::AnnotationVersion, annotation_version),
    Rule::new(RuleId::TagVersion, tag_version),
    Rule::new(RuleId::SourceRevision, source_revision),
    Rule::new(RuleId::Digest, digest),
    Rule::new(RuleId::CreationTimestamp, creation_timestamp),
];

const VERSION_RULES: &[Rule] = &[
    Rule::new(RuleId::AnnotationVersion, annotation_version),
    Rule::new(RuleId::TagVersion, tag_version),
];

const DIGEST_RULES: &[Rule] = &[Rule::new(RuleId::Digest, digest)];

const VERSION_DIGEST_RULES: &[Rule] = &[
    Rule::new(RuleId::VersionDigest, version_digest),
    Rule::new(RuleId::AnnotationVersion, annotation_version),
    Rule::new(RuleId::TagVersion, tag_version),
    Rule::new(RuleId::Digest, digest),
];

const TIMESTAMP_RULES: &[Rule] = &[Rule::new(RuleId::CreationTimestamp, creation_timestamp)];

/// Returns the ordered rule table for a policy.
#[must_use]
pub const fn rules_for(policy: VersionPolicy) -> &'static [Rule] {
    match policy {
        VersionPolicy::Auto => AUTO_RULES,
        VersionPolicy::Version => VERSION_RULES,
        VersionPolicy::Digest => DIGEST_RULES,
        VersionPolicy::VersionDigest => VERSION_DIGEST_RULES,
        VersionPolicy::Timestamp => TIMESTAMP_RULES,
    }
}

/// Value placed on a side with no usable signal.
pub const UNKNOWN_VERSION: &str = "unknown";

/// Outcome of evaluating one side's signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Selected version text.
    pub value: String,
    /// Rule that fired.
    pub rule: RuleId,
    /// Policy whose table the rule came from.
    pub applied: VersionPolicy,
}

/// Evaluates a policy's rules against a signal set, falling through to `AUTO`.
///
/// Never fails: with no usable signal the value is [`UNKNOWN_VERSION`].
///
/// # Examples
///
/// ```
/// use skopos_version::{select, RuleId, SignalSet, VersionPolicy};
///
/// let signals = SignalSet::new().with_tag("latest").with_digest("sha256:0123456789abcdef");
/// let selection = select(&signals, VersionPolicy::Version);
/// assert_eq!(selection.value, "0123456789ab");
/// assert_eq!(selection.rule, RuleId::Digest);
/// assert_eq!(selection.applied, VersionPolicy::Auto);
/// ```
#[must_use]
pub fn select(signals: &SignalSet, policy: VersionPolicy) -> Selection {
    let tables = [policy, VersionPolicy::Auto];
    let chain = if policy == VersionPolicy::Auto {
        &tables[..1]
    } else {
        &tables[..]
    };

    for &applied in chain {
        if let Some((rule, value)) = rules_for(applied)
            .iter()
            .find_map(|rule| rule.apply(signals).map(|value| (rule.id, value)))
        {
            return Selection {
                value,
                rule,
                applied,
            };
        }
    }

    Selection {
        value: UNKNOWN_VERSION.to_string(),
        rule: RuleId::NoSignal,
        applied: VersionPolicy::Auto,
    }
}
