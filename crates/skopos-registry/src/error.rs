//! Error types for registry operations.
//!
//! Errors are `Clone` so that every caller attached to a coalesced fetch
//! receives the same error; underlying transport errors are therefore kept
//! as rendered messages rather than sources.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias using [`RegistryError`].
pub type Result<T> = std::result::Result<T, RegistryError>;

/// How serious an error is for the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Expected and self-healing, e.g. rate limiting.
    Warning,
    /// The resolution failed for this workload.
    Error,
    /// Integrity or trust problem that needs attention.
    Critical,
}

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Credential rejected after one retry.
    #[error("Authentication failed for {host}: {message}")]
    AuthFailure {
        /// Registry host.
        host: String,
        /// Error message.
        message: String,
    },

    /// Host is throttled and the caller chose not to wait.
    #[error("Rate limited by {host} until {resume_at}")]
    RateLimited {
        /// Registry host.
        host: String,
        /// Instant at which calls may resume.
        resume_at: DateTime<Utc>,
    },

    /// No such tag, digest or repository.
    #[error("Not found: {reference}")]
    NotFound {
        /// Reference or URL that was not found.
        reference: String,
    },

    /// Document content does not hash to the digest it was fetched by.
    #[error("Digest mismatch for {reference}: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Reference being resolved.
        reference: String,
        /// Digest from the index or descriptor.
        expected: String,
        /// Digest of the received content.
        actual: String,
    },

    /// Timeout, connection reset or server error, after retries.
    #[error("Transient failure talking to {host}: {message}")]
    Transient {
        /// Registry host.
        host: String,
        /// Error message.
        message: String,
    },

    /// The index has no manifest for the requested platform.
    #[error("Platform {platform} not available for {reference} (available: {})", available.join(", "))]
    PlatformNotAvailable {
        /// Reference being resolved.
        reference: String,
        /// Requested platform.
        platform: String,
        /// Platforms listed by the index.
        available: Vec<String>,
    },

    /// Image reference could not be parsed.
    #[error("Invalid reference format: {reference}: {message}")]
    InvalidReference {
        /// Reference string.
        reference: String,
        /// What is wrong with it.
        message: String,
    },

    /// A registry document could not be decoded.
    #[error("Invalid document from {url}: {message}")]
    InvalidDocument {
        /// URL the document came from.
        url: String,
        /// Decoding error.
        message: String,
    },

    /// The registry answered with a status the client does not handle.
    #[error("Unexpected HTTP status {status} from {url}")]
    UnexpectedStatus {
        /// URL requested.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// A URL could not be built.
    #[error("Invalid URL: {url}")]
    InvalidUrl {
        /// URL string.
        url: String,
    },
}

impl RegistryError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Creates an authentication failure.
    #[must_use]
    pub fn auth(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AuthFailure {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid-reference error.
    #[must_use]
    pub fn invalid_reference(reference: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidReference {
            reference: reference.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid-document error.
    #[must_use]
    pub fn invalid_document(url: impl Into<String>, message: impl ToString) -> Self {
        Self::InvalidDocument {
            url: url.into(),
            message: message.to_string(),
        }
    }

    /// Returns true if retrying the same request may succeed.
    ///
    /// # Examples
    ///
    /// ```
    /// use skopos_registry::RegistryError;
    ///
    /// assert!(RegistryError::transient("ghcr.io", "connection reset").is_retryable());
    /// assert!(!RegistryError::auth("ghcr.io", "denied").is_retryable());
    /// ```
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns the operator-facing severity.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::DigestMismatch { .. } => Severity::Critical,
            Self::RateLimited { .. } => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

impl From<url::ParseError> for RegistryError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl {
            url: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = RegistryError::NotFound {
            reference: "docker.io/library/nginx:9.9".to_string(),
        };
        assert_eq!(err.to_string(), "Not found: docker.io/library/nginx:9.9");
    }

    #[test]
    fn test_error_display_digest_mismatch() {
        let err = RegistryError::DigestMismatch {
            reference: "ghcr.io/org/app:1.0".to_string(),
            expected: "sha256:abc123".to_string(),
            actual: "sha256:def456".to_string(),
        };
        assert!(err.to_string().contains("Digest mismatch"));
        assert_eq!(err.severity(), Severity::Critical);
    }

    #[test]
    fn test_error_display_platform() {
        let err = RegistryError::PlatformNotAvailable {
            reference: "app:1".to_string(),
            platform: "linux/riscv64".to_string(),
            available: vec!["linux/amd64".to_string(), "linux/arm64".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Platform linux/riscv64 not available for app:1 (available: linux/amd64, linux/arm64)"
        );
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(RegistryError::transient("h", "timeout").is_retryable());
        assert!(!RegistryError::NotFound {
            reference: "x".to_string()
        }
        .is_retryable());
        assert!(!RegistryError::RateLimited {
            host: "h".to_string(),
            resume_at: Utc::now(),
        }
        .is_retryable());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Error > Severity::Warning);
    }
}
