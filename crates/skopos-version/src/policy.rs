//! Version policies.
//!
//! A policy decides which of the available signals becomes the reported
//! version text for a workload.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::VersionError;

/// Configured rule set for choosing the reported version string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VersionPolicy {
    /// Parseable version, then source revision, then digest, then timestamp.
    #[default]
    Auto,

    /// Prefer a parseable annotation or tag version; falls through to `Auto`.
    Version,

    /// Always the shortened content digest.
    Digest,

    /// `version:shortdigest` when both are known.
    VersionDigest,

    /// Image creation timestamp.
    Timestamp,
}

impl VersionPolicy {
    /// All policies, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Auto,
        Self::Version,
        Self::Digest,
        Self::VersionDigest,
        Self::Timestamp,
    ];

    /// Returns the canonical upper-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::Version => "VERSION",
            Self::Digest => "DIGEST",
            Self::VersionDigest => "VERSION_DIGEST",
            Self::Timestamp => "TIMESTAMP",
        }
    }
}

impl fmt::Display for VersionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionPolicy {
    type Err = VersionError;

    /// Parses a policy name, ignoring case and accepting `-` for `_`.
    ///
    /// # Examples
    ///
    /// ```
    /// use skopos_version::VersionPolicy;
    ///
    /// let policy: VersionPolicy = "version-digest".parse().unwrap();
    /// assert_eq!(policy, VersionPolicy::VersionDigest);
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| VersionError::UnknownPolicy {
                name: s.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_auto() {
        assert_eq!(VersionPolicy::default(), VersionPolicy::Auto);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("auto".parse::<VersionPolicy>().unwrap(), VersionPolicy::Auto);
        assert_eq!(
            "VERSION_DIGEST".parse::<VersionPolicy>().unwrap(),
            VersionPolicy::VersionDigest
        );
        assert_eq!(
            " timestamp ".parse::<VersionPolicy>().unwrap(),
            VersionPolicy::Timestamp
        );
        assert!("newest".parse::<VersionPolicy>().is_err());
    }

    #[test]
    fn test_display_roundtrips_through_from_str() {
        for policy in VersionPolicy::ALL {
            assert_eq!(policy.to_string().parse::<VersionPolicy>().unwrap(), policy);
        }
    }

    #[test]
    fn test_serde_uses_upper_snake_case() {
        let json = serde_json::to_string(&VersionPolicy::VersionDigest).unwrap();
        assert_eq!(json, "\"VERSION_DIGEST\"");
        let policy: VersionPolicy = serde_json::from_str("\"DIGEST\"").unwrap();
        assert_eq!(policy, VersionPolicy::Digest);
    }
}
