//! Version signals.
//!
//! A signal is one piece of evidence about which version a workload runs
//! (or could run): a tag, an annotation, a digest, a source revision or a
//! build timestamp. Signals are gathered per side (current and latest) into a
//! [`SignalSet`] and reduced by the resolver.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Number of hex characters kept in a shortened digest.
pub const SHORT_DIGEST_LEN: usize = 12;

/// The kind of evidence a signal carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Tag from the image reference (`1.25`, `latest`).
    ExplicitTag,
    /// Version declared in image annotations or labels.
    AnnotationVersion,
    /// Content digest of the index or manifest.
    ContentDigest,
    /// Source-control revision of the build.
    SourceRevision,
    /// Image creation time.
    CreationTimestamp,
}

impl SignalKind {
    /// Returns the snake-case name used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ExplicitTag => "explicit_tag",
            Self::AnnotationVersion => "annotation_version",
            Self::ContentDigest => "content_digest",
            Self::SourceRevision => "source_revision",
            Self::CreationTimestamp => "creation_timestamp",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much a signal should be trusted relative to others of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Inferred or derived from a fallback source.
    Low,
    /// Reported by a source that may be stale or floating.
    Medium,
    /// Reported by the authoritative source for this kind.
    High,
}

/// A single piece of version evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSignal {
    /// What the value represents.
    pub kind: SignalKind,
    /// Literal value as observed.
    pub value: String,
    /// Trust ordinal, used to choose between signals of the same kind.
    pub confidence: Confidence,
}

impl VersionSignal {
    /// Creates a new signal.
    #[must_use]
    pub fn new(kind: SignalKind, value: impl Into<String>, confidence: Confidence) -> Self {
        Self {
            kind,
            value: value.into(),
            confidence,
        }
    }
}

/// All signals known for one side of a resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalSet {
    signals: Vec<VersionSignal>,
}

impl SignalSet {
    /// Creates an empty signal set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a signal. Blank values are ignored.
    pub fn push(&mut self, signal: VersionSignal) {
        if signal.value.trim().is_empty() {
            return;
        }
        self.signals.push(signal);
    }

    /// Adds the reference tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.push(VersionSignal::new(
            SignalKind::ExplicitTag,
            tag,
            Confidence::Medium,
        ));
        self
    }

    /// Adds an annotation-declared version.
    #[must_use]
    pub fn with_annotation_version(mut self, version: impl Into<String>) -> Self {
        self.push(VersionSignal::new(
            SignalKind::AnnotationVersion,
            version,
            Confidence::High,
        ));
        self
    }

    /// Adds a content digest (`sha256:...` or bare hex).
    #[must_use]
    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.push(VersionSignal::new(
            SignalKind::ContentDigest,
            digest,
            Confidence::High,
        ));
        self
    }

    /// Adds a source-control revision.
    #[must_use]
    pub fn with_source_revision(mut self, revision: impl Into<String>) -> Self {
        self.push(VersionSignal::new(
            SignalKind::SourceRevision,
            revision,
            Confidence::High,
        ));
        self
    }

    /// Adds the creation time, normalized to RFC 3339 UTC with second precision.
    #[must_use]
    pub fn with_created(mut self, created: DateTime<Utc>) -> Self {
        self.push(VersionSignal::new(
            SignalKind::CreationTimestamp,
            created.to_rfc3339_opts(SecondsFormat::Secs, true),
            Confidence::Medium,
        ));
        self
    }

    /// Returns the most trusted signal of a kind.
    ///
    /// Ties go to the signal added first.
    #[must_use]
    pub fn get(&self, kind: SignalKind) -> Option<&VersionSignal> {
        self.signals
            .iter()
            .filter(|s| s.kind == kind)
            .fold(None, |best: Option<&VersionSignal>, s| match best {
                Some(b) if b.confidence >= s.confidence => Some(b),
                _ => Some(s),
            })
    }

    /// Returns the value of the most trusted signal of a kind.
    #[must_use]
    pub fn value(&self, kind: SignalKind) -> Option<&str> {
        self.get(kind).map(|s| s.value.as_str())
    }

    /// Returns the shortened digest, if a digest signal is present.
    #[must_use]
    pub fn short_digest(&self) -> Option<String> {
        self.value(SignalKind::ContentDigest).map(short_digest)
    }

    /// Returns true if no signals are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Iterates over all signals in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &VersionSignal> {
        self.signals.iter()
    }
}

impl FromIterator<VersionSignal> for SignalSet {
    fn from_iter<I: IntoIterator<Item = VersionSignal>>(iter: I) -> Self {
        let mut set = Self::new();
        for signal in iter {
            set.push(signal);
        }
        set
    }
}

/// Shortens a digest to its first [`SHORT_DIGEST_LEN`] hex characters.
///
/// The algorithm prefix is dropped.
///
/// # Examples
///
/// ```
/// use skopos_version::short_digest;
///
/// assert_eq!(short_digest("sha256:0123456789abcdef0123"), "0123456789ab");
/// assert_eq!(short_digest("abc123def456"), "abc123def456");
/// ```
#[must_use]
pub fn short_digest(digest: &str) -> String {
    let hex = digest
        .split_once(':')
        .map_or(digest, |(_, hex)| hex)
        .trim();
    hex.chars().take(SHORT_DIGEST_LEN).collect()
}
