//! Recognition of version-like text in tags and annotations.
//!
//! Accepts semantic versions and plain numeric versions:
//! - `1.2.3`, `v1.2.3`, `V2`, `r10` → numeric components with optional prefix
//! - `22.04`, `2024.01.15` → plain numeric versions
//! - `1.25-alpine`, `1.2.3+build.5`, `3.9_rc1` → numeric core with a suffix
//!
//! Floating names such as `latest`, `stable` or `nightly` are not versions.

use std::fmt;

/// A tag or annotation value that parses as a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedVersion {
    original: String,
    components: Vec<u64>,
    suffix: String,
}

impl ParsedVersion {
    /// Parses version-like text, returning `None` for anything else.
    ///
    /// # Examples
    ///
    /// ```
    /// use skopos_version::ParsedVersion;
    ///
    /// let v = ParsedVersion::parse("v1.25.3-alpine").unwrap();
    /// assert_eq!(v.components(), &[1, 25, 3]);
    /// assert_eq!(v.suffix(), "-alpine");
    /// assert!(v.is_semver());
    ///
    /// assert!(ParsedVersion::parse("latest").is_none());
    /// ```
    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();

        // Optional single-letter prefix, only when followed by a digit
        let rest = match input.as_bytes() {
            [b'v' | b'V' | b'r', next, ..] if next.is_ascii_digit() => &input[1..],
            _ => input,
        };

        let end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (numeric, suffix) = rest.split_at(end);

        if numeric.is_empty() {
            return None;
        }

        let components = numeric
            .split('.')
            .map(|part| part.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()?;

        if !(suffix.is_empty() || suffix.starts_with(['-', '+', '_'])) {
            return None;
        }

        Some(Self {
            original: input.to_string(),
            components,
            suffix: suffix.to_string(),
        })
    }

    /// Numeric components in order (`1.25.3` → `[1, 25, 3]`).
    #[must_use]
    pub fn components(&self) -> &[u64] {
        &self.components
    }

    /// Text following the numeric core, including its separator.
    #[must_use]
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// The text as originally supplied (trimmed).
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// True for `MAJOR.MINOR.PATCH` with an optional `-pre` or `+build` suffix.
    #[must_use]
    pub fn is_semver(&self) -> bool {
        self.components.len() == 3 && !self.suffix.starts_with('_')
    }
}

impl fmt::Display for ParsedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

/// Returns true if the text is recognizable as a version.
#[must_use]
pub fn is_version_like(text: &str) -> bool {
    ParsedVersion::parse(text).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_semver() {
        let v = ParsedVersion::parse("2.3.1").unwrap();
        assert_eq!(v.components(), &[2, 3, 1]);
        assert!(v.suffix().is_empty());
        assert!(v.is_semver());
    }

    #[test]
    fn test_parse_prefixed() {
        assert_eq!(ParsedVersion::parse("v1.2.3").unwrap().components(), &[1, 2, 3]);
        assert_eq!(ParsedVersion::parse("V2").unwrap().components(), &[2]);
        assert_eq!(ParsedVersion::parse("r10").unwrap().components(), &[10]);
    }

    #[test]
    fn test_parse_plain_numeric() {
        let v = ParsedVersion::parse("22.04").unwrap();
        assert_eq!(v.components(), &[22, 4]);
        assert!(!v.is_semver());
        assert_eq!(v.as_str(), "22.04");
    }

    #[test]
    fn test_parse_suffixes() {
        assert_eq!(ParsedVersion::parse("1.25-alpine").unwrap().suffix(), "-alpine");
        assert_eq!(
            ParsedVersion::parse("1.2.3+build.5").unwrap().suffix(),
            "+build.5"
        );
        assert_eq!(ParsedVersion::parse("3.9_rc1").unwrap().suffix(), "_rc1");
    }

    #[test]
    fn test_rejects_floating_names() {
        for tag in ["latest", "stable", "nightly", "edge", "main", ""] {
            assert!(ParsedVersion::parse(tag).is_none(), "{tag} should not parse");
        }
    }

    #[test]
    fn test_rejects_digests_and_malformed() {
        assert!(ParsedVersion::parse("abc123def456").is_none());
        assert!(ParsedVersion::parse("123abc").is_none());
        assert!(ParsedVersion::parse("sha256:0123").is_none());
        assert!(ParsedVersion::parse("1..2").is_none());
        assert!(ParsedVersion::parse(".1").is_none());
        assert!(ParsedVersion::parse("1.").is_none());
        assert!(ParsedVersion::parse("v").is_none());
        assert!(ParsedVersion::parse("version").is_none());
    }

    proptest! {
        #[test]
        fn dotted_numbers_always_parse(parts in prop::collection::vec(0u32..100_000, 1..5)) {
            let text = parts.iter().map(ToString::to_string).collect::<Vec<_>>().join(".");
            let parsed = ParsedVersion::parse(&text).unwrap();
            let expected: Vec<u64> = parts.iter().map(|p| u64::from(*p)).collect();
            prop_assert_eq!(parsed.components(), expected.as_slice());
        }

        #[test]
        fn alphabetic_words_never_parse(word in "[a-uw-z][a-z]{0,12}") {
            prop_assert!(ParsedVersion::parse(&word).is_none());
        }
    }
}
