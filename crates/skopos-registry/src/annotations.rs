//! Annotation merging and source hints.

use serde::{Deserialize, Serialize};

use crate::oci::Annotations;

/// OCI version annotation.
pub const VERSION_KEY: &str = "org.opencontainers.image.version";
/// OCI source revision annotation.
pub const REVISION_KEY: &str = "org.opencontainers.image.revision";
/// OCI source repository annotation.
pub const SOURCE_KEY: &str = "org.opencontainers.image.source";
/// OCI creation time annotation.
pub const CREATED_KEY: &str = "org.opencontainers.image.created";

/// Merges annotations from the levels of an image.
///
/// Manifest annotations win over index annotations; config labels only fill
/// keys neither level set. Aliased keys are then copied to their OCI key
/// unless the OCI key is already present.
///
/// # Examples
///
/// ```
/// use skopos_registry::{merge_annotations, Annotations, LABEL_SCHEMA_ALIASES};
///
/// let index = Annotations::from([("org.opencontainers.image.version".into(), "1.0".into())]);
/// let manifest = Annotations::from([("org.opencontainers.image.version".into(), "1.1".into())]);
/// let labels = Annotations::from([("org.label-schema.vcs-ref".into(), "abc123".into())]);
///
/// let merged = merge_annotations(Some(&index), Some(&manifest), Some(&labels), LABEL_SCHEMA_ALIASES);
/// assert_eq!(merged["org.opencontainers.image.version"], "1.1");
/// assert_eq!(merged["org.opencontainers.image.revision"], "abc123");
/// ```
#[must_use]
pub fn merge_annotations(
    index: Option<&Annotations>,
    manifest: Option<&Annotations>,
    labels: Option<&Annotations>,
    aliases: &[(&str, &str)],
) -> Annotations {
    let mut merged = Annotations::new();
    for level in [index, manifest].into_iter().flatten() {
        merged.extend(level.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    for (key, value) in labels.into_iter().flatten() {
        merged.entry(key.clone()).or_insert_with(|| value.clone());
    }
    normalize_aliases(&mut merged, aliases);
    merged
}

/// Copies aliased keys to their OCI equivalents without overriding them.
pub fn normalize_aliases(annotations: &mut Annotations, aliases: &[(&str, &str)]) {
    for (alias, key) in aliases {
        let Some(value) = annotations.get(*alias).filter(|v| !v.trim().is_empty()) else {
            continue;
        };
        if !annotations.contains_key(*key) {
            let value = value.clone();
            annotations.insert((*key).to_string(), value);
        }
    }
}

/// Hosting platform recognized from a source URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourcePlatform {
    /// github.com
    GitHub,
}

impl SourcePlatform {
    const PREFIXES: &'static [(&'static str, Self)] = &[("https://github.com/", Self::GitHub)];

    /// Recognizes the platform of a source URL.
    #[must_use]
    pub fn detect(source: &str) -> Option<Self> {
        Self::PREFIXES
            .iter()
            .find(|(prefix, _)| source.starts_with(prefix))
            .map(|(_, platform)| *platform)
    }
}

/// Where an image's source lives and links derived from it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceHint {
    /// Source repository URL without fragment.
    pub source: Option<String>,
    /// Source revision the image was built from.
    pub revision: Option<String>,
    /// Version annotation.
    pub version: Option<String>,
    /// Recognized hosting platform.
    pub platform: Option<SourcePlatform>,
    /// Link to the revision's commit page.
    pub diff_url: Option<String>,
    /// Link to the version's release page.
    pub release_url: Option<String>,
}

impl SourceHint {
    /// Derives a hint from merged annotations. No network access.
    ///
    /// Links are only derived for a recognized platform.
    ///
    /// # Examples
    ///
    /// ```
    /// use skopos_registry::{Annotations, SourceHint, SourcePlatform};
    ///
    /// let annotations = Annotations::from([
    ///     ("org.opencontainers.image.source".into(), "https://github.com/acme/app#main".into()),
    ///     ("org.opencontainers.image.revision".into(), "9f8e7d".into()),
    ///     ("org.opencontainers.image.version".into(), "v2.1.0".into()),
    /// ]);
    /// let hint = SourceHint::from_annotations(&annotations);
    /// assert_eq!(hint.platform, Some(SourcePlatform::GitHub));
    /// assert_eq!(hint.diff_url.as_deref(), Some("https://github.com/acme/app/commit/9f8e7d"));
    /// assert_eq!(hint.release_url.as_deref(), Some("https://github.com/acme/app/releases/tag/v2.1.0"));
    /// ```
    #[must_use]
    pub fn from_annotations(annotations: &Annotations) -> Self {
        let field = |key: &str| {
            annotations
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let source = field(SOURCE_KEY).map(|s| {
            let base = s.split('#').next().unwrap_or(s.as_str());
            base.trim_end_matches('/').to_string()
        });
        let revision = field(REVISION_KEY);
        let version = field(VERSION_KEY);
        let platform = source.as_deref().and_then(SourcePlatform::detect);

        let (diff_url, release_url) = match (&source, platform) {
            (Some(source), Some(_)) => (
                revision.as_ref().map(|r| format!("{source}/commit/{r}")),
                version.as_ref().map(|v| format!("{source}/releases/tag/{v}")),
            ),
            _ => (None, None),
        };

        Self {
            source,
            revision,
            version,
            platform,
            diff_url,
            release_url,
        }
    }

    /// True if nothing was found.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.source.is_none() && self.revision.is_none() && self.version.is_none()
    }
}
