//! Update engine: registry metadata reduced to comparable versions.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use skopos_version::{
    GitCli, ResolvedVersion, RevisionControl, SignalKind, SignalSet, VersionPolicy, VersionResolver,
};
use tracing::{debug, info, warn};

use crate::client::{ImageMetadata, RegistryClient, RegistryContext};
use crate::clock::Clock;
use crate::config::{EngineConfig, RegistryCredential};
use crate::digest::ContentDigest;
use crate::error::{RegistryError, Result, Severity};
use crate::reference::{ImageReference, Platform};
use crate::stats::HostStatsSnapshot;
use crate::throttle::shuffle_workloads;
use crate::transport::HttpTransport;

/// Facts about the image a workload currently runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstalledImage {
    /// Repository digests, as `name@sha256:...` or bare digests.
    pub repo_digests: Vec<String>,
    /// Version label of the installed image.
    pub version_label: Option<String>,
    /// Creation time of the installed image.
    pub created: Option<DateTime<Utc>>,
}

impl InstalledImage {
    /// Creates an empty description.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a repository digest.
    #[must_use]
    pub fn with_repo_digest(mut self, digest: impl Into<String>) -> Self {
        self.repo_digests.push(digest.into());
        self
    }

    /// Sets the version label.
    #[must_use]
    pub fn with_version_label(mut self, version: impl Into<String>) -> Self {
        self.version_label = Some(version.into());
        self
    }

    /// Sets the creation time.
    #[must_use]
    pub const fn with_created(mut self, created: DateTime<Utc>) -> Self {
        self.created = Some(created);
        self
    }

    /// The installed digest to compare with `latest`.
    ///
    /// The digest equal to `latest` when present, otherwise the first one.
    #[must_use]
    pub fn matching_digest(&self, latest: &str) -> Option<&str> {
        let digests: Vec<&str> = self.repo_digests.iter().map(|d| bare_digest(d)).collect();
        digests
            .iter()
            .find(|d| **d == latest)
            .or_else(|| digests.first())
            .copied()
    }
}

fn bare_digest(text: &str) -> &str {
    text.rsplit_once('@').map_or(text, |(_, digest)| digest)
}

/// One workload to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRequest {
    /// Image reference text, e.g. `ghcr.io/org/app:1.2`.
    pub image_reference: String,
    /// Platform; the engine default when unset.
    pub platform: Option<Platform>,
    /// Version policy.
    pub policy: VersionPolicy,
    /// Pin set by the operator. Forces `latest == current`.
    pub explicit_pin: Option<String>,
    /// Credential for this workload only.
    pub credential: Option<RegistryCredential>,
    /// What is installed now.
    pub installed: Option<InstalledImage>,
}

impl WorkloadRequest {
    /// Creates a request with the default policy.
    #[must_use]
    pub fn new(image_reference: impl Into<String>) -> Self {
        Self {
            image_reference: image_reference.into(),
            platform: None,
            policy: VersionPolicy::default(),
            explicit_pin: None,
            credential: None,
            installed: None,
        }
    }

    /// Sets the platform.
    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Sets the version policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: VersionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Pins the workload.
    #[must_use]
    pub fn with_pin(mut self, pin: impl Into<String>) -> Self {
        self.explicit_pin = Some(pin.into());
        self
    }

    /// Sets a workload credential.
    #[must_use]
    pub fn with_credential(mut self, credential: RegistryCredential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Describes the installed image.
    #[must_use]
    pub fn with_installed(mut self, installed: InstalledImage) -> Self {
        self.installed = Some(installed);
        self
    }
}

/// Result of one workload in [`UpdateEngine::resolve_all`].
#[derive(Debug, Clone)]
pub struct WorkloadOutcome {
    /// The request.
    pub request: WorkloadRequest,
    /// Resolved version or the typed failure.
    pub result: std::result::Result<ResolvedVersion, RegistryError>,
}

impl WorkloadOutcome {
    /// True if the workload resolved.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Severity of the failure, if any.
    #[must_use]
    pub fn severity(&self) -> Option<Severity> {
        self.result.as_ref().err().map(RegistryError::severity)
    }
}

/// Resolves workloads to current and latest versions.
///
/// # Examples
///
/// ```no_run
/// use skopos_registry::{EngineConfig, UpdateEngine, WorkloadRequest};
/// use skopos_version::VersionPolicy;
///
/// # async fn example() -> Result<(), skopos_registry::RegistryError> {
/// let engine = UpdateEngine::new(EngineConfig::default())?;
/// let resolved = engine
///     .resolve_version(&WorkloadRequest::new("nginx:1.25").with_policy(VersionPolicy::Version))
///     .await?;
/// println!("{} -> {}", resolved.current, resolved.latest);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct UpdateEngine {
    client: RegistryClient,
    resolver: VersionResolver,
    revision: Arc<dyn RevisionControl>,
}

impl std::fmt::Debug for UpdateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateEngine")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl UpdateEngine {
    /// Creates an engine with the `reqwest` transport and `git` revision control.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Ok(Self::from_client(RegistryClient::new(config)?))
    }

    /// Creates an engine over a transport and clock.
    #[must_use]
    pub fn with_parts(config: EngineConfig, transport: Arc<dyn HttpTransport>, clock: Arc<dyn Clock>) -> Self {
        Self::from_context(RegistryContext::new(config, transport, clock))
    }

    /// Creates an engine over a prepared context.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::time::Duration;
    /// use skopos_registry::{
    ///     EngineConfig, RegistryContext, RegistryCredential, ReqwestTransport, StaticCredentials,
    ///     SystemClock, UpdateEngine,
    /// };
    ///
    /// let transport = Arc::new(ReqwestTransport::new(Duration::from_secs(5), "doc").unwrap());
    /// let creds = StaticCredentials::new().with("ghcr.io", RegistryCredential::token("ghp_x"));
    /// let context = RegistryContext::new(EngineConfig::default(), transport, Arc::new(SystemClock))
    ///     .with_credentials(Arc::new(creds));
    /// let engine = UpdateEngine::from_context(context);
    /// assert!(engine.stats_snapshot().is_empty());
    /// ```
    #[must_use]
    pub fn from_context(context: RegistryContext) -> Self {
        Self::from_client(RegistryClient::from_context(context))
    }

    /// Creates an engine over an existing client.
    #[must_use]
    pub fn from_client(client: RegistryClient) -> Self {
        Self {
            client,
            resolver: VersionResolver::new(),
            revision: Arc::new(GitCli::new()),
        }
    }

    /// Replaces the revision-control collaborator.
    #[must_use]
    pub fn with_revision_control(mut self, revision: Arc<dyn RevisionControl>) -> Self {
        self.revision = revision;
        self
    }

    /// The registry client.
    #[must_use]
    pub const fn client(&self) -> &RegistryClient {
        &self.client
    }

    /// Resolves one registry workload.
    ///
    /// # Errors
    ///
    /// Returns the registry error that prevented metadata retrieval.
    pub async fn resolve_version(&self, request: &WorkloadRequest) -> Result<ResolvedVersion> {
        let reference = ImageReference::parse(&request.image_reference)?;
        let platform = request
            .platform
            .clone()
            .unwrap_or_else(|| self.client.context().config().default_platform.clone());

        let metadata = self
            .client
            .resolve_metadata_with(&reference, &platform, request.credential.as_ref())
            .await?;

        let latest = metadata.signals();
        let current = current_signals(request, &reference, &metadata);
        let pinned = request.explicit_pin.is_some() || reference.is_pinned();
        let resolved = self.resolver.resolve(&current, &latest, request.policy, pinned);

        debug!(
            image = %reference,
            current = %resolved.current,
            latest = %resolved.latest,
            reason = %resolved.reason,
            "Resolved workload"
        );
        Ok(resolved)
    }

    /// Resolves a locally built workload from its working tree.
    ///
    /// # Errors
    ///
    /// Returns the revision-control error.
    pub async fn resolve_local_build(
        &self,
        path: &Path,
        policy: VersionPolicy,
    ) -> skopos_version::Result<ResolvedVersion> {
        let status = self.revision.status(path).await?;
        Ok(self.resolver.resolve_local(&status, policy))
    }

    /// Resolves many workloads concurrently.
    ///
    /// Order is shuffled and concurrency capped by `max_concurrency`. A failed
    /// workload never aborts the others.
    pub async fn resolve_all(&self, requests: Vec<WorkloadRequest>) -> Vec<WorkloadOutcome> {
        let mut requests = requests;
        shuffle_workloads(&mut requests);
        let limit = self.client.context().config().max_concurrency.max(1);
        let total = requests.len();

        let outcomes: Vec<WorkloadOutcome> = stream::iter(requests)
            .map(|request| async move {
                let result = self.resolve_version(&request).await;
                if let Err(err) = &result {
                    warn!(image = %request.image_reference, error = %err, "Workload resolution failed");
                }
                WorkloadOutcome { request, result }
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
        info!(total, failed, "Resolved workloads");
        outcomes
    }

    /// Resolves metadata without version reduction.
    ///
    /// # Errors
    ///
    /// See [`RegistryClient::resolve_metadata_with`].
    pub async fn resolve_metadata(&self, image_reference: &str, platform: Option<&Platform>) -> Result<ImageMetadata> {
        let reference = ImageReference::parse(image_reference)?;
        let default_platform = &self.client.context().config().default_platform;
        self.client
            .resolve_metadata(&reference, platform.unwrap_or(default_platform))
            .await
    }

    /// Per-host call statistics.
    #[must_use]
    pub fn stats_snapshot(&self) -> Vec<HostStatsSnapshot> {
        self.client.context().stats().snapshot()
    }

    /// Purges expired cache entries, returning how many were removed.
    pub fn sweep_expired(&self) -> usize {
        self.client.sweep_expired()
    }
}

/// The digest named by an explicit pin, if the pin is one.
fn pinned_digest(pin: &str) -> Option<&str> {
    let digest = bare_digest(pin);
    ContentDigest::parse(digest).is_ok().then_some(digest)
}

/// Signals describing what the workload runs now.
fn current_signals(request: &WorkloadRequest, reference: &ImageReference, metadata: &ImageMetadata) -> SignalSet {
    let mut signals = SignalSet::new();
    if let Some(tag) = &reference.tag {
        signals = signals.with_tag(tag);
    }
    if let Some(installed) = &request.installed {
        if let Some(version) = &installed.version_label {
            signals = signals.with_annotation_version(version);
        }
        if let Some(digest) = installed.matching_digest(&metadata.index_digest) {
            signals = signals.with_digest(digest);
        }
        if let Some(created) = installed.created {
            signals = signals.with_created(created);
        }
    }

    if signals.value(SignalKind::ContentDigest).is_none() {
        let pinned = request
            .explicit_pin
            .as_deref()
            .and_then(pinned_digest)
            .or(reference.digest.as_deref());
        if let Some(digest) = pinned {
            signals = signals.with_digest(digest);
        }
    }
    signals
}
