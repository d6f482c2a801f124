//! Image references and platforms.
//!
//! Reference grammar, simplified:
//! - `nginx` → `docker.io/library/nginx:latest`
//! - `ghcr.io/org/app:1.2` → host `ghcr.io`, repository `org/app`, tag `1.2`
//! - `registry.local:5000/app@sha256:...` → pinned by digest
//! - `app:1.2@sha256:...` → tag and digest; the digest wins for fetching

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Registry assumed when a reference names none.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag assumed when a reference names none.
pub const DEFAULT_TAG: &str = "latest";

const DOCKER_HUB_ALIASES: &[&str] = &["index.docker.io", "registry-1.docker.io", "registry.hub.docker.com"];

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    /// Registry host, with port when present.
    pub registry: String,
    /// Repository path within the registry.
    pub repository: String,
    /// Tag, if one was given.
    pub tag: Option<String>,
    /// Pinned digest, if one was given.
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parses an image reference.
    ///
    /// # Examples
    ///
    /// ```
    /// use skopos_registry::ImageReference;
    ///
    /// let r = ImageReference::parse("nginx").unwrap();
    /// assert_eq!(r.registry, "docker.io");
    /// assert_eq!(r.repository, "library/nginx");
    /// assert_eq!(r.tag(), "latest");
    /// assert!(!r.is_pinned());
    ///
    /// let r = ImageReference::parse("ghcr.io/org/app:1.2").unwrap();
    /// assert_eq!(r.to_string(), "ghcr.io/org/app:1.2");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidReference`] if the text is not a
    /// valid reference.
    pub fn parse(input: &str) -> Result<Self, RegistryError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(RegistryError::invalid_reference(input, "empty reference"));
        }

        let (name, digest) = match input.rsplit_once('@') {
            Some((name, digest)) => {
                validate_digest(input, digest)?;
                (name, Some(digest.to_string()))
            }
            None => (input, None),
        };

        let (registry, remainder) = match name.split_once('/') {
            Some((first, rest)) if is_registry_host(first) => (first.to_ascii_lowercase(), rest),
            _ => (DEFAULT_REGISTRY.to_string(), name),
        };
        let registry = if DOCKER_HUB_ALIASES.contains(&registry.as_str()) {
            DEFAULT_REGISTRY.to_string()
        } else {
            registry
        };

        // A colon after the last slash separates the tag
        let last_slash = remainder.rfind('/').map_or(0, |i| i + 1);
        let (repository, tag) = match remainder[last_slash..].find(':') {
            Some(i) => {
                let split = last_slash + i;
                (&remainder[..split], Some(remainder[split + 1..].to_string()))
            }
            None => (remainder, None),
        };

        validate_repository(input, repository)?;
        if let Some(tag) = &tag {
            validate_tag(input, tag)?;
        }

        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository.to_string()
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Tag, or `latest` when none was given.
    #[must_use]
    pub fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// True if the reference pins a digest.
    #[must_use]
    pub const fn is_pinned(&self) -> bool {
        self.digest.is_some()
    }

    /// The tag or digest used to fetch the top-level document.
    #[must_use]
    pub fn reference(&self) -> &str {
        self.digest.as_deref().unwrap_or_else(|| self.tag())
    }

    /// Returns a copy with a different tag and no pinned digest.
    #[must_use]
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            digest: None,
            ..self.clone()
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl FromStr for ImageReference {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn is_registry_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn validate_repository(input: &str, repository: &str) -> Result<(), RegistryError> {
    if repository.is_empty() {
        return Err(RegistryError::invalid_reference(input, "missing repository"));
    }
    let valid_component = |c: &str| {
        !c.is_empty()
            && c.chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || "._-".contains(ch))
    };
    if repository.split('/').all(valid_component) {
        Ok(())
    } else {
        Err(RegistryError::invalid_reference(
            input,
            format!("invalid repository '{repository}'"),
        ))
    }
}

fn validate_tag(input: &str, tag: &str) -> Result<(), RegistryError> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && !tag.starts_with(['.', '-'])
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c));
    if valid {
        Ok(())
    } else {
        Err(RegistryError::invalid_reference(input, format!("invalid tag '{tag}'")))
    }
}

fn validate_digest(input: &str, digest: &str) -> Result<(), RegistryError> {
    let valid = digest.split_once(':').is_some_and(|(algorithm, hex)| {
        !algorithm.is_empty()
            && !hex.is_empty()
            && hex.chars().all(|c| c.is_ascii_hexdigit())
    });
    if valid {
        Ok(())
    } else {
        Err(RegistryError::invalid_reference(input, format!("invalid digest '{digest}'")))
    }
}

/// Target platform of an image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system (`linux`).
    pub os: String,
    /// CPU architecture (`amd64`, `arm64`).
    pub architecture: String,
    /// Architecture variant (`v7`), if any.
    pub variant: Option<String>,
}

impl Default for Platform {
    fn default() -> Self {
        Self::new("linux", "amd64")
    }
}

impl Platform {
    /// Creates a platform without a variant.
    #[must_use]
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            variant: None,
        }
    }

    /// Sets the variant.
    #[must_use]
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// True if an index entry's platform satisfies this one.
    ///
    /// The variant is compared only when this platform names one.
    #[must_use]
    pub fn matches(&self, os: &str, architecture: &str, variant: Option<&str>) -> bool {
        self.os == os
            && self.architecture == architecture
            && self
                .variant
                .as_deref()
                .map_or(true, |wanted| variant == Some(wanted))
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = RegistryError;

    /// Parses `os/arch[/variant]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self::new(*os, *arch)),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Self::new(*os, *arch).with_variant(*variant))
            }
            _ => Err(RegistryError::invalid_reference(
                s,
                "platform must be os/arch[/variant]",
            )),
        }
    }
}
