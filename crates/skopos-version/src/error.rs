//! Error types for version resolution.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using [`VersionError`].
pub type Result<T> = std::result::Result<T, VersionError>;

/// Errors raised by policy parsing and revision-control status lookups.
///
/// Resolution itself never fails; these errors come from the edges.
#[derive(Debug, Error)]
pub enum VersionError {
    /// Policy name not recognized.
    #[error("Unknown version policy: {name}")]
    UnknownPolicy {
        /// The name that failed to parse.
        name: String,
    },

    /// A revision-control command could not be started.
    #[error("Failed to run `{command}` in {path}: {source}")]
    CommandFailed {
        /// Command line that was attempted.
        command: String,
        /// Working tree path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A revision-control command exited unsuccessfully.
    #[error("`{command}` exited with status {status} in {path}: {stderr}")]
    CommandStatus {
        /// Command line that was run.
        command: String,
        /// Working tree path.
        path: PathBuf,
        /// Exit status code, `-1` if killed by a signal.
        status: i32,
        /// Captured standard error.
        stderr: String,
    },

    /// A revision-control command did not finish in time.
    #[error("`{command}` timed out after {timeout:?} in {path}")]
    CommandTimeout {
        /// Command line that was run.
        command: String,
        /// Working tree path.
        path: PathBuf,
        /// Configured timeout.
        timeout: Duration,
    },

    /// Command output could not be interpreted.
    #[error("Unexpected output from `{command}`: {output}")]
    UnexpectedOutput {
        /// Command line that was run.
        command: String,
        /// Offending output.
        output: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_unknown_policy() {
        let err = VersionError::UnknownPolicy {
            name: "newest".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown version policy: newest");
    }

    #[test]
    fn test_error_display_timeout() {
        let err = VersionError::CommandTimeout {
            command: "git fetch".to_string(),
            path: PathBuf::from("/srv/app"),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.to_string(), "`git fetch` timed out after 5s in /srv/app");
    }
}
