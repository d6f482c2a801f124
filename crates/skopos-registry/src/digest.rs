//! Content digests (`algorithm:hex`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::error::RegistryError;

/// A content digest such as `sha256:4c5f...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest {
    algorithm: String,
    hex: String,
}

impl ContentDigest {
    /// Parses `algorithm:hex`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidReference`] if the text is not a digest.
    pub fn parse(input: &str) -> Result<Self, RegistryError> {
        let input = input.trim();
        let (algorithm, hex) = input
            .split_once(':')
            .ok_or_else(|| RegistryError::invalid_reference(input, "digest missing algorithm"))?;

        let valid_algorithm = !algorithm.is_empty()
            && algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c));
        let valid_hex = !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit());
        if !valid_algorithm || !valid_hex {
            return Err(RegistryError::invalid_reference(input, "malformed digest"));
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            hex: hex.to_ascii_lowercase(),
        })
    }

    /// Computes the SHA-256 digest of content.
    ///
    /// # Examples
    ///
    /// ```
    /// use skopos_registry::ContentDigest;
    ///
    /// let digest = ContentDigest::sha256(b"");
    /// assert_eq!(
    ///     digest.to_string(),
    ///     "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    /// );
    /// assert_eq!(digest.short(), "e3b0c44298fc");
    /// ```
    #[must_use]
    pub fn sha256(content: &[u8]) -> Self {
        Self {
            algorithm: "sha256".to_string(),
            hex: hex::encode(Sha256::digest(content)),
        }
    }

    /// Computes the SHA-512 digest of content.
    #[must_use]
    pub fn sha512(content: &[u8]) -> Self {
        Self {
            algorithm: "sha512".to_string(),
            hex: hex::encode(Sha512::digest(content)),
        }
    }

    /// Recomputes a digest of content with the same algorithm as `self`.
    ///
    /// Returns `None` for algorithms this crate cannot compute.
    #[must_use]
    pub fn recompute(&self, content: &[u8]) -> Option<Self> {
        match self.algorithm.as_str() {
            "sha256" => Some(Self::sha256(content)),
            "sha512" => Some(Self::sha512(content)),
            _ => None,
        }
    }

    /// Checks content against this digest.
    ///
    /// `None` means the algorithm is unsupported and nothing was checked.
    #[must_use]
    pub fn verify(&self, content: &[u8]) -> Option<bool> {
        self.recompute(content).map(|actual| actual == *self)
    }

    /// Digest algorithm.
    #[must_use]
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Lower-case hex value.
    #[must_use]
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// First twelve hex characters.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.hex[..self.hex.len().min(skopos_version::SHORT_DIGEST_LEN)]
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for ContentDigest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ContentDigest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let d = ContentDigest::parse("sha256:ABCDEF0123").unwrap();
        assert_eq!(d.algorithm(), "sha256");
        assert_eq!(d.hex(), "abcdef0123");
        assert_eq!(d.to_string(), "sha256:abcdef0123");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ContentDigest::parse("abcdef").is_err());
        assert!(ContentDigest::parse("sha256:").is_err());
        assert!(ContentDigest::parse(":abc").is_err());
        assert!(ContentDigest::parse("sha256:xyz").is_err());
        assert!(ContentDigest::parse("SHA256:abc").is_err());
    }

    #[test]
    fn test_verify_roundtrip() {
        let body = br#"{"schemaVersion":2}"#;
        let d = ContentDigest::sha256(body);
        assert_eq!(d.verify(body), Some(true));
        assert_eq!(d.verify(b"tampered"), Some(false));

        let d512 = ContentDigest::sha512(body);
        assert_eq!(d512.hex().len(), 128);
        assert_eq!(d512.verify(body), Some(true));
    }

    #[test]
    fn test_unsupported_algorithm_is_not_checked() {
        let d = ContentDigest::parse("blake3:00ff").unwrap();
        assert_eq!(d.verify(b"anything"), None);
    }

    #[test]
    fn test_short_form() {
        let d = ContentDigest::sha256(b"hello");
        assert_eq!(d.short().len(), 12);
        assert!(d.hex().starts_with(d.short()));

        let tiny = ContentDigest::parse("sha256:abc").unwrap();
        assert_eq!(tiny.short(), "abc");
    }

    #[test]
    fn test_serde_as_string() {
        let d = ContentDigest::sha256(b"x");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{d}\""));
        let back: ContentDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
        assert!(serde_json::from_str::<ContentDigest>("\"nope\"").is_err());
    }
}
