//! OCI and Docker v2 distribution document types.
//!
//! Only the fields needed for metadata resolution are modelled; unknown
//! fields are ignored on decode.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::reference::Platform;

/// Key/value metadata attached to documents and descriptors.
pub type Annotations = BTreeMap<String, String>;

/// Media types understood by the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaType(String);

impl MediaType {
    /// OCI image manifest media type.
    pub const OCI_MANIFEST: &'static str = "application/vnd.oci.image.manifest.v1+json";

    /// OCI image index media type.
    pub const OCI_INDEX: &'static str = "application/vnd.oci.image.index.v1+json";

    /// OCI image config media type.
    pub const OCI_CONFIG: &'static str = "application/vnd.oci.image.config.v1+json";

    /// Docker v2 manifest media type.
    pub const DOCKER_MANIFEST: &'static str = "application/vnd.docker.distribution.manifest.v2+json";

    /// Docker v2 manifest list media type.
    pub const DOCKER_MANIFEST_LIST: &'static str =
        "application/vnd.docker.distribution.manifest.list.v2+json";

    /// Docker v2 container config media type.
    pub const DOCKER_CONFIG: &'static str = "application/vnd.docker.container.image.v1+json";

    /// Creates a new media type.
    #[must_use]
    pub fn new(media_type: impl Into<String>) -> Self {
        Self(media_type.into())
    }

    /// Returns the media type string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for OCI indexes and Docker manifest lists.
    #[must_use]
    pub fn is_index(&self) -> bool {
        self.0 == Self::OCI_INDEX || self.0 == Self::DOCKER_MANIFEST_LIST
    }

    /// True for single-image manifests.
    #[must_use]
    pub fn is_manifest(&self) -> bool {
        self.0 == Self::OCI_MANIFEST || self.0 == Self::DOCKER_MANIFEST
    }

    /// `Accept` header value for top-level lookups by tag.
    #[must_use]
    pub fn accept_index() -> String {
        [
            Self::OCI_INDEX,
            Self::DOCKER_MANIFEST_LIST,
            Self::OCI_MANIFEST,
            Self::DOCKER_MANIFEST,
        ]
        .join(", ")
    }

    /// `Accept` header value for manifests fetched by digest.
    #[must_use]
    pub fn accept_manifest() -> String {
        [Self::OCI_MANIFEST, Self::DOCKER_MANIFEST].join(", ")
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MediaType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl Serialize for MediaType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MediaType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self(s))
    }
}

/// Platform of an index entry as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorPlatform {
    /// CPU architecture.
    pub architecture: String,

    /// Operating system.
    pub os: String,

    /// Architecture variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl DescriptorPlatform {
    /// Attestation manifests are listed with `unknown/unknown`.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.os == "unknown" || self.architecture == "unknown"
    }

    /// Checks whether this entry satisfies a requested platform.
    #[must_use]
    pub fn satisfies(&self, wanted: &Platform) -> bool {
        wanted.matches(&self.os, &self.architecture, self.variant.as_deref())
    }
}

impl std::fmt::Display for DescriptorPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

/// OCI content descriptor.
///
/// A descriptor describes the disposition of targeted content. It includes
/// the type of the content, a content identifier (digest), and the byte-size
/// of the raw content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: MediaType,

    /// Digest of the targeted content.
    pub digest: String,

    /// Size in bytes of the content.
    #[serde(default)]
    pub size: u64,

    /// Platform, for index entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<DescriptorPlatform>,

    /// Optional annotations (key-value metadata).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

impl Descriptor {
    /// Creates a new descriptor.
    ///
    /// # Examples
    ///
    /// ```
    /// use skopos_registry::{Descriptor, MediaType};
    ///
    /// let desc = Descriptor::new(MediaType::OCI_MANIFEST.into(), "sha256:abc123", 1024);
    /// assert_eq!(desc.size, 1024);
    /// ```
    #[must_use]
    pub fn new(media_type: MediaType, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type,
            digest: digest.into(),
            size,
            platform: None,
            annotations: None,
        }
    }

    /// Sets the platform.
    #[must_use]
    pub fn with_platform(mut self, platform: &Platform) -> Self {
        self.platform = Some(DescriptorPlatform {
            architecture: platform.architecture.clone(),
            os: platform.os.clone(),
            variant: platform.variant.clone(),
        });
        self
    }

    /// Adds an annotation to the descriptor.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations
            .get_or_insert_with(Annotations::new)
            .insert(key.into(), value.into());
        self
    }
}

/// OCI image index or Docker manifest list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Schema version (always 2).
    pub schema_version: u32,

    /// Media type of this index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,

    /// Per-platform manifests.
    pub manifests: Vec<Descriptor>,

    /// Index-level annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

impl ImageIndex {
    /// Returns the first entry matching a platform, skipping attestations.
    #[must_use]
    pub fn select(&self, platform: &Platform) -> Option<&Descriptor> {
        self.manifests.iter().find(|d| {
            d.platform
                .as_ref()
                .is_some_and(|p| !p.is_unknown() && p.satisfies(platform))
        })
    }

    /// Lists the real platforms offered, for error reporting.
    #[must_use]
    pub fn platforms(&self) -> Vec<String> {
        self.manifests
            .iter()
            .filter_map(|d| d.platform.as_ref())
            .filter(|p| !p.is_unknown())
            .map(ToString::to_string)
            .collect()
    }
}

/// OCI Image Manifest.
///
/// This structure describes a single container image.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Schema version (always 2).
    pub schema_version: u32,

    /// Media type of this manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,

    /// Configuration descriptor.
    pub config: Descriptor,

    /// Layers that make up the image.
    #[serde(default)]
    pub layers: Vec<Descriptor>,

    /// Manifest-level annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

/// Runtime configuration section of an image config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Image labels.
    #[serde(rename = "Labels", default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Annotations>,
}

/// One build step in the image history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the step ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    /// Command that produced the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    /// Step produced no layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

/// OCI image configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Creation time as RFC 3339 text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    /// Author.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    /// CPU architecture.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,

    /// Operating system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,

    /// Architecture variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,

    /// Runtime configuration, including labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ContainerConfig>,

    /// Build history.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
}

impl ImageConfig {
    /// Returns the image labels, if any.
    #[must_use]
    pub fn labels(&self) -> Option<&Annotations> {
        self.config.as_ref().and_then(|c| c.labels.as_ref())
    }

    /// Parses the creation time.
    #[must_use]
    pub fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.created
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
    }
}

/// A document fetched by tag: either an index or a single manifest.
#[derive(Debug, Clone)]
pub enum TopLevelDocument {
    /// Multi-platform index.
    Index(ImageIndex),
    /// Single-platform manifest served directly.
    Manifest(ImageManifest),
}

impl TopLevelDocument {
    /// Decodes a document using the content type, falling back to its shape.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the body matches neither form.
    pub fn decode(content_type: Option<&str>, body: &[u8]) -> Result<Self, serde_json::Error> {
        let media_type = content_type
            .map(|ct| MediaType::new(ct.split(';').next().unwrap_or(ct).trim()));

        match media_type {
            Some(mt) if mt.is_index() => serde_json::from_slice(body).map(Self::Index),
            Some(mt) if mt.is_manifest() => serde_json::from_slice(body).map(Self::Manifest),
            _ => {
                let value: serde_json::Value = serde_json::from_slice(body)?;
                if value.get("manifests").is_some() {
                    serde_json::from_value(value).map(Self::Index)
                } else {
                    serde_json::from_value(value).map(Self::Manifest)
                }
            }
        }
    }
}

/// Error response from registry API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// List of errors.
    #[serde(default)]
    pub errors: Vec<RegistryApiError>,
}

impl ErrorResponse {
    /// Joins the error messages, if the body is a registry error document.
    #[must_use]
    pub fn summarize(body: &[u8]) -> Option<String> {
        let response: Self = serde_json::from_slice(body).ok()?;
        let text = response
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.code, e.message))
            .collect::<Vec<_>>()
            .join("; ");
        (!text.is_empty()).then_some(text)
    }
}

/// Individual error from registry API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryApiError {
    /// Error code.
    pub code: String,

    /// Human-readable message.
    #[serde(default)]
    pub message: String,

    /// Additional details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}
