//! Revision-control status for locally built workloads.
//!
//! A locally built workload has no registry to ask; its "latest" is the
//! upstream branch of the checked-out tree. [`RevisionControl`] is the seam,
//! [`GitCli`] the implementation that shells out to `git`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, VersionError};

/// State of a checked-out tree relative to its upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionStatus {
    /// Abbreviated id of the checked-out revision.
    pub short_rev: String,
    /// Upstream commits not yet merged locally.
    pub unseen_commits: u32,
    /// Committer time of the checked-out revision, when known.
    pub last_commit: Option<DateTime<Utc>>,
}

impl RevisionStatus {
    /// Creates a status without a commit timestamp.
    #[must_use]
    pub fn new(short_rev: impl Into<String>, unseen_commits: u32) -> Self {
        Self {
            short_rev: short_rev.into(),
            unseen_commits,
            last_commit: None,
        }
    }

    /// Sets the commit timestamp.
    #[must_use]
    pub const fn with_last_commit(mut self, at: DateTime<Utc>) -> Self {
        self.last_commit = Some(at);
        self
    }
}

/// Provides revision status for a working tree.
#[async_trait]
pub trait RevisionControl: Send + Sync {
    /// Returns the current revision and the count of unseen upstream commits.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be inspected.
    async fn status(&self, path: &Path) -> Result<RevisionStatus>;
}

/// [`RevisionControl`] backed by the `git` command line.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
    fetch: bool,
    fetch_timeout: Duration,
    command_timeout: Duration,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
            fetch: true,
            fetch_timeout: Duration::from_secs(120),
            command_timeout: Duration::from_secs(10),
        }
    }
}

impl GitCli {
    /// Creates a client using `git` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a different executable.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Enables or disables `git fetch` before counting upstream commits.
    #[must_use]
    pub const fn with_fetch(mut self, fetch: bool) -> Self {
        self.fetch = fetch;
        self
    }

    /// Sets the timeout for `git fetch`.
    #[must_use]
    pub const fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Sets the timeout for local commands.
    #[must_use]
    pub const fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Returns the committer time of `HEAD`.
    ///
    /// # Errors
    ///
    /// Returns an error if `git log` fails or prints an unparseable date.
    pub async fn last_commit_timestamp(&self, path: &Path) -> Result<DateTime<Utc>> {
        let args = ["log", "-1", "--format=%cI", "--no-show-signature"];
        let output = self.run(path, &args, self.command_timeout).await?;
        parse_commit_time(&output).ok_or_else(|| VersionError::UnexpectedOutput {
            command: self.describe(&args),
            output,
        })
    }

    async fn run(&self, path: &Path, args: &[&str], timeout: Duration) -> Result<String> {
        let command = self.describe(args);
        debug!(command = %command, path = %path.display(), "Running revision-control command");

        let child = Command::new(&self.program)
            .args(args)
            .current_dir(path)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| VersionError::CommandTimeout {
                command: command.clone(),
                path: path.to_path_buf(),
                timeout,
            })?
            .map_err(|source| VersionError::CommandFailed {
                command: command.clone(),
                path: path.to_path_buf(),
                source,
            })?;

        if !output.status.success() {
            return Err(VersionError::CommandStatus {
                command,
                path: path.to_path_buf(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn describe(&self, args: &[&str]) -> String {
        std::iter::once(self.program.as_str())
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl RevisionControl for GitCli {
    async fn status(&self, path: &Path) -> Result<RevisionStatus> {
        if self.fetch {
            // A failed fetch only means the upstream view may be stale
            if let Err(e) = self.run(path, &["fetch", "--quiet"], self.fetch_timeout).await {
                warn!(path = %path.display(), error = %e, "git fetch failed, using last known upstream");
            }
        }

        let short_rev = self
            .run(path, &["rev-parse", "--short", "HEAD"], self.command_timeout)
            .await?;
        if short_rev.is_empty() {
            return Err(VersionError::UnexpectedOutput {
                command: self.describe(&["rev-parse", "--short", "HEAD"]),
                output: short_rev,
            });
        }

        let count_args = ["rev-list", "--count", "HEAD..@{upstream}"];
        let unseen_commits = match self.run(path, &count_args, self.command_timeout).await {
            Ok(output) => parse_count(&output).ok_or_else(|| VersionError::UnexpectedOutput {
                command: self.describe(&count_args),
                output,
            })?,
            Err(VersionError::CommandStatus { stderr, .. }) => {
                // No upstream configured for this branch
                debug!(path = %path.display(), stderr = %stderr, "No upstream, assuming up to date");
                0
            }
            Err(e) => return Err(e),
        };

        let mut status = RevisionStatus::new(short_rev, unseen_commits);
        match self.last_commit_timestamp(path).await {
            Ok(at) => status = status.with_last_commit(at),
            Err(e) => debug!(path = %path.display(), error = %e, "No commit timestamp"),
        }

        debug!(
            path = %path.display(),
            revision = %status.short_rev,
            unseen_commits = status.unseen_commits,
            "Revision status"
        );
        Ok(status)
    }
}

fn parse_count(output: &str) -> Option<u32> {
    output.trim().parse().ok()
}

fn parse_commit_time(output: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(output.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("3\n"), Some(3));
        assert_eq!(parse_count("0"), Some(0));
        assert_eq!(parse_count("three"), None);
    }

    #[test]
    fn test_parse_commit_time_normalizes_to_utc() {
        let at = parse_commit_time("2024-02-10T14:00:00+02:00\n").unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2024, 2, 10, 12, 0, 0).unwrap());
        assert!(parse_commit_time("yesterday").is_none());
    }

    #[test]
    fn test_describe_command() {
        let git = GitCli::new().with_program("/usr/bin/git");
        assert_eq!(
            git.describe(&["rev-list", "--count", "HEAD..@{upstream}"]),
            "/usr/bin/git rev-list --count HEAD..@{upstream}"
        );
    }

    #[tokio::test]
    async fn test_missing_tree_fails() {
        let git = GitCli::new().with_fetch(false);
        let err = git
            .status(Path::new("/nonexistent/skopos/tree"))
            .await
            .unwrap_err();
        assert!(matches!(err, VersionError::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let git = GitCli::new()
            .with_program("skopos-no-such-git")
            .with_fetch(false);
        let err = git.status(Path::new("/")).await.unwrap_err();
        assert!(matches!(err, VersionError::CommandFailed { .. }));
    }

    struct Fixed(RevisionStatus);

    #[async_trait]
    impl RevisionControl for Fixed {
        async fn status(&self, _path: &Path) -> Result<RevisionStatus> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_trait_object() {
        let provider: Box<dyn RevisionControl> = Box::new(Fixed(RevisionStatus::new("abc1234", 2)));
        let status = provider.status(Path::new(".")).await.unwrap();
        assert_eq!(status.short_rev, "abc1234");
        assert_eq!(status.unseen_commits, 2);
    }
}
