//! Registry metadata client.
//!
//! Resolves an image reference to its index, platform manifest and config
//! through the distribution API. Every document fetch goes through the
//! tiered cache (coalescing concurrent callers), the per-host throttle and
//! the authentication negotiator, in that order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use skopos_version::SignalSet;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::annotations::{merge_annotations, SourceHint, CREATED_KEY, VERSION_KEY};
use crate::auth::{
    bearer_header, pull_scope, token_request_header, AuthScheme, AuthStates, AuthToken, Challenge,
    CredentialSource, TokenResponse,
};
use crate::cache::{CacheKey, CacheTier, FetchSource, TieredCache};
use crate::clock::{Clock, SystemClock};
use crate::config::{DigestVerification, EngineConfig, RegistryCredential};
use crate::digest::ContentDigest;
use crate::error::{RegistryError, Result};
use crate::oci::{Annotations, ErrorResponse, ImageConfig, ImageManifest, MediaType, TopLevelDocument};
use crate::provider::{provider_for, ProviderFamily, ProviderQuirks};
use crate::reference::{ImageReference, Platform};
use crate::stats::CallStats;
use crate::throttle::{Permit, ThrottleController, ThrottleMode};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};

/// Shortest sleep between two checks of a closed throttle gate.
const MIN_THROTTLE_SLEEP: Duration = Duration::from_millis(10);

/// A registry document as received, after digest verification.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    /// URL the document was requested from.
    pub url: String,
    /// `Content-Type` of the response.
    pub content_type: Option<String>,
    /// Digest the document is known by.
    pub digest: ContentDigest,
    /// Raw body.
    pub body: Arc<[u8]>,
}

/// Shared state behind a [`RegistryClient`].
///
/// Holds the transport, caches, throttle, authentication state and call
/// statistics. Everything here is shared by `Arc` between the client, its
/// clones and in-flight fetches.
pub struct RegistryContext {
    config: EngineConfig,
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    documents: TieredCache<FetchedDocument>,
    tokens: TieredCache<AuthToken>,
    throttle: ThrottleController,
    auth: AuthStates,
    stats: CallStats,
    credentials: Option<Arc<dyn CredentialSource>>,
}

impl std::fmt::Debug for RegistryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryContext")
            .field("transport", &self.transport)
            .field("documents", &self.documents.len())
            .field("tokens", &self.tokens.len())
            .field("auth_hosts", &self.auth.len())
            .finish_non_exhaustive()
    }
}

impl RegistryContext {
    /// Creates a context with a transport and clock.
    #[must_use]
    pub fn new(config: EngineConfig, transport: Arc<dyn HttpTransport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            documents: TieredCache::with_clock(config.cache.clone(), Arc::clone(&clock)),
            tokens: TieredCache::with_clock(config.cache.clone(), Arc::clone(&clock)),
            throttle: ThrottleController::with_clock(config.throttle.clone(), Arc::clone(&clock)),
            auth: AuthStates::new(),
            stats: CallStats::new(),
            credentials: None,
            config,
            transport,
            clock,
        }
    }

    /// Adds a credential source consulted when a workload brings none.
    #[must_use]
    pub fn with_credentials(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(source);
        self
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Document cache.
    #[must_use]
    pub const fn documents(&self) -> &TieredCache<FetchedDocument> {
        &self.documents
    }

    /// Token cache.
    #[must_use]
    pub const fn tokens(&self) -> &TieredCache<AuthToken> {
        &self.tokens
    }

    /// Throttle controller.
    #[must_use]
    pub const fn throttle(&self) -> &ThrottleController {
        &self.throttle
    }

    /// Per-host authentication state.
    #[must_use]
    pub const fn auth(&self) -> &AuthStates {
        &self.auth
    }

    /// Call statistics.
    #[must_use]
    pub const fn stats(&self) -> &CallStats {
        &self.stats
    }

    fn credential_for(
        &self,
        reference: &ImageReference,
        explicit: Option<&RegistryCredential>,
    ) -> Option<RegistryCredential> {
        explicit
            .cloned()
            .or_else(|| {
                self.credentials
                    .as_ref()
                    .and_then(|source| source.credential(reference))
            })
            .or_else(|| self.config.host(&reference.registry).credential)
    }

    /// How long a caller may wait for a throttled host, `None` if it may not.
    fn allowed_wait(&self, resume_at: DateTime<Utc>) -> Option<Duration> {
        match self.config.throttle.mode {
            ThrottleMode::Abandon => None,
            ThrottleMode::Wait { max_wait } => {
                let wait = (resume_at - self.clock.now()).to_std().unwrap_or_default();
                (wait <= max_wait).then_some(wait)
            }
        }
    }

    /// Holds the caller until the host's gate opens.
    ///
    /// The gate is re-checked after every sleep, so a backoff extended while
    /// waiting is honoured. Fails once the total wait would exceed `max_wait`.
    async fn wait_for_permit(&self, host: &str) -> Result<()> {
        let started = self.clock.now();
        let mut slept = Duration::ZERO;
        loop {
            let Permit::WaitUntil(resume_at) = self.throttle.may_call(host) else {
                return Ok(());
            };
            let now = self.clock.now();
            let remaining = (resume_at - now).to_std().unwrap_or_default();
            let waited = (now - started).to_std().unwrap_or_default().max(slept);
            let within_budget = match self.config.throttle.mode {
                ThrottleMode::Abandon => false,
                ThrottleMode::Wait { max_wait } => waited + remaining <= max_wait,
            };
            if !within_budget {
                debug!(host, resume_at = %resume_at, "Host throttled, abandoning call");
                return Err(RegistryError::RateLimited {
                    host: host.to_string(),
                    resume_at,
                });
            }

            let wait = remaining.max(MIN_THROTTLE_SLEEP);
            debug!(host, wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX), "Host throttled, waiting");
            tokio::time::sleep(wait).await;
            slept += wait;
        }
    }

    fn rate_limited(&self, host: &str) -> RegistryError {
        let resume_at = match self.throttle.may_call(host) {
            Permit::WaitUntil(at) => at,
            Permit::Proceed => self.clock.now(),
        };
        RegistryError::RateLimited {
            host: host.to_string(),
            resume_at,
        }
    }

    /// Sends one request through the throttle gate, recording stats.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let host = host_key(&request.url);
        self.wait_for_permit(&host).await?;

        let url = request.url.to_string();
        let timeout = self.config.request_timeout;
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.transport.get(request)).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(response)) => {
                self.stats.record_call(&host, response.status, elapsed);
                self.throttle
                    .record_response(&host, response.status, &response.headers);
                debug!(host = %host, status = response.status, url = %url, "Registry response");
                Ok(response)
            }
            Ok(Err(err)) => {
                self.stats.record_transport_error(&host, elapsed);
                Err(RegistryError::transient(host, err.to_string()))
            }
            Err(_) => {
                self.stats.record_transport_error(&host, elapsed);
                Err(RegistryError::transient(
                    host,
                    format!("request to {url} timed out after {}s", timeout.as_secs()),
                ))
            }
        }
    }

    /// `Authorization` to send before any challenge on this request.
    async fn authorization(&self, request: &DocumentRequest) -> Result<Option<String>> {
        if request.quirks.anonymous {
            return Ok(None);
        }
        let state = self.auth.get(&request.api_host);
        match state.scheme {
            AuthScheme::Basic => Ok(token_request_header(
                request.credential.as_ref(),
                request.quirks.token_style,
            )),
            AuthScheme::Bearer => match state.challenge {
                Some(challenge) => {
                    let token = self.bearer_token(request, &challenge).await?;
                    Ok(Some(bearer_header(&token.token)))
                }
                None => Ok(None),
            },
            AuthScheme::None => {
                if let Some(known) = request.quirks.known_realm {
                    let challenge = Challenge::bearer(known.realm, known.service);
                    self.auth
                        .remember_challenge(&request.api_host, challenge.clone());
                    let token = self.bearer_token(request, &challenge).await?;
                    return Ok(Some(bearer_header(&token.token)));
                }
                Ok(match &request.credential {
                    Some(credential @ RegistryCredential::Basic { .. }) => {
                        token_request_header(Some(credential), request.quirks.token_style)
                    }
                    _ => None,
                })
            }
        }
    }

    /// Returns a cached token for the request's scope or fetches one.
    async fn bearer_token(&self, request: &DocumentRequest, challenge: &Challenge) -> Result<AuthToken> {
        let scope = pull_scope(&request.repository);
        let key = request.token_key(&scope);
        if let Some(token) = self.tokens.get(&key) {
            debug!(host = %request.api_host, scope = %scope, "Using cached token");
            return Ok(token);
        }

        let url = challenge.token_url(&scope)?;
        let token_host = host_key(&url);
        let token_url = url.to_string();
        let mut http = HttpRequest::get(url);
        if let Some(header) = token_request_header(request.credential.as_ref(), request.quirks.token_style) {
            http = http.with_header("Authorization", header);
        }

        let response = self.send(http).await?;
        match response.status {
            200..=299 => {}
            401 | 403 => {
                warn!(host = %request.api_host, status = response.status, "Token endpoint rejected credentials");
                return Err(RegistryError::auth(
                    &request.api_host,
                    format!("token endpoint answered HTTP {}", response.status),
                ));
            }
            _ => return Err(self.status_error(&token_url, &token_host, &response)),
        }

        let body: TokenResponse = serde_json::from_slice(&response.body)
            .map_err(|e| RegistryError::invalid_document(&token_url, e))?;
        let now = self.clock.now();
        let default_ttl = chrono::Duration::from_std(self.config.cache.token_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let token = body
            .into_token(&scope, now, default_ttl)
            .ok_or_else(|| RegistryError::auth(&request.api_host, "token endpoint returned no token"))?;

        self.tokens
            .put_with_ttl(key, token.clone(), CacheTier::Token, token.remaining(now));
        debug!(host = %request.api_host, scope = %scope, "Obtained registry token");
        Ok(token)
    }

    /// Answers a `401` by negotiating credentials and retrying once.
    async fn answer_challenge(
        &self,
        request: &DocumentRequest,
        response: &HttpResponse,
    ) -> Result<(HttpResponse, String)> {
        let host = &request.api_host;
        let Some(challenge) = response.header("www-authenticate").and_then(Challenge::parse) else {
            warn!(host = %host, "Unauthorized without a usable challenge");
            return Err(RegistryError::auth(host, "401 without a usable WWW-Authenticate challenge"));
        };

        let authorization = match challenge.scheme {
            AuthScheme::Bearer => {
                self.auth.remember_challenge(host, challenge.clone());
                self.tokens
                    .invalidate(&request.token_key(&pull_scope(&request.repository)));
                let token = self.bearer_token(request, &challenge).await?;
                bearer_header(&token.token)
            }
            AuthScheme::Basic | AuthScheme::None => {
                let Some(header) =
                    token_request_header(request.credential.as_ref(), request.quirks.token_style)
                else {
                    warn!(host = %host, "Registry requires credentials, none configured");
                    return Err(RegistryError::auth(host, "registry requires credentials"));
                };
                self.auth.mark_basic(host);
                header
            }
        };

        let retried = self.send(request.http(Some(&authorization))).await?;
        if retried.status == 401 {
            let message = ErrorResponse::summarize(&retried.body)
                .unwrap_or_else(|| "credentials rejected".to_string());
            warn!(host = %host, repository = %request.repository, "Authentication failed after retry");
            return Err(RegistryError::auth(host, message));
        }
        Ok((retried, authorization))
    }

    /// Follows one redirect. Authorization is only kept on the same host.
    async fn follow_redirect(
        &self,
        request: &DocumentRequest,
        response: &HttpResponse,
        authorization: Option<&str>,
    ) -> Result<HttpResponse> {
        let location = response.header("location").unwrap_or_default();
        let target = request.url.join(location)?;
        let same_host = host_key(&target) == host_key(&request.url);
        debug!(from = %request.url, to = %target, same_host, "Following redirect");

        let mut http = HttpRequest::get(target.clone());
        if let Some(accept) = &request.accept {
            http = http.with_header("Accept", accept.as_str());
        }
        if let (true, Some(authorization)) = (same_host, authorization) {
            http = http.with_header("Authorization", authorization);
        }

        let next = self.send(http).await?;
        if next.is_redirect() {
            return Err(RegistryError::UnexpectedStatus {
                url: target.to_string(),
                status: next.status,
            });
        }
        Ok(next)
    }

    fn status_error(&self, url: &str, host: &str, response: &HttpResponse) -> RegistryError {
        let status = response.status;
        match status {
            404 => RegistryError::NotFound {
                reference: url.to_string(),
            },
            401 | 403 => RegistryError::auth(
                host,
                ErrorResponse::summarize(&response.body).unwrap_or_else(|| format!("HTTP {status}")),
            ),
            429 => self.rate_limited(host),
            503 if response.header("retry-after").is_some() => self.rate_limited(host),
            500..=599 => RegistryError::transient(host, format!("HTTP {status} from {url}")),
            _ => RegistryError::UnexpectedStatus {
                url: url.to_string(),
                status,
            },
        }
    }

    fn should_retry(&self, err: &RegistryError) -> bool {
        match err {
            RegistryError::RateLimited { resume_at, .. } => self.allowed_wait(*resume_at).is_some(),
            other => other.is_retryable(),
        }
    }
}

/// Which document a request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentKind {
    /// Index or manifest fetched by tag or pinned digest.
    TopLevel,
    /// Platform manifest fetched by digest.
    Manifest,
    /// Config blob.
    Blob,
}

impl DocumentKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::TopLevel => "top",
            Self::Manifest => "manifest",
            Self::Blob => "blob",
        }
    }
}

/// A fully described document fetch; owned so it can outlive the caller.
#[derive(Debug, Clone)]
struct DocumentRequest {
    kind: DocumentKind,
    api_host: String,
    repository: String,
    reference: String,
    path: String,
    url: Url,
    accept: Option<String>,
    expected: Option<ContentDigest>,
    verification: DigestVerification,
    credential: Option<RegistryCredential>,
    quirks: ProviderQuirks,
}

impl DocumentRequest {
    fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.api_host, &self.path, self.kind.as_str())
    }

    fn token_key(&self, scope: &str) -> CacheKey {
        CacheKey::new(&self.api_host, scope, credential_fingerprint(self))
    }

    fn http(&self, authorization: Option<&str>) -> HttpRequest {
        let mut http = HttpRequest::get(self.url.clone());
        if let Some(accept) = &self.accept {
            http = http.with_header("Accept", accept.as_str());
        }
        if let Some(authorization) = authorization {
            http = http.with_header("Authorization", authorization);
        }
        http
    }

    /// Checks the body against the digest it is addressed by.
    fn verify(&self, digest_header: Option<&str>, body: &[u8]) -> Result<ContentDigest> {
        let claimed = match (&self.expected, digest_header.and_then(|v| ContentDigest::parse(v).ok())) {
            (Some(expected), _) => expected.clone(),
            (None, Some(header)) => header,
            (None, None) => return Ok(ContentDigest::sha256(body)),
        };
        if self.verification == DigestVerification::Skip {
            return Ok(claimed);
        }

        match claimed.verify(body) {
            Some(true) => Ok(claimed),
            Some(false) => {
                let actual = claimed
                    .recompute(body)
                    .map_or_else(String::new, |d| d.to_string());
                warn!(
                    host = %self.api_host,
                    repository = %self.repository,
                    expected = %claimed,
                    actual = %actual,
                    "Digest mismatch"
                );
                Err(RegistryError::DigestMismatch {
                    reference: format!("{}/{}@{}", self.api_host, self.repository, self.reference),
                    expected: claimed.to_string(),
                    actual,
                })
            }
            None => {
                debug!(algorithm = claimed.algorithm(), "Digest algorithm not supported, content not verified");
                Ok(claimed)
            }
        }
    }
}

fn credential_fingerprint(request: &DocumentRequest) -> String {
    token_request_header(request.credential.as_ref(), request.quirks.token_style).map_or_else(
        || "anonymous".to_string(),
        |header| hex::encode(&Sha256::digest(header.as_bytes())[..8]),
    )
}

/// `host[:port]` of a URL, the key for throttle and stats.
fn host_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    url.port()
        .map_or_else(|| host.to_string(), |port| format!("{host}:{port}"))
}

/// Per-resolution addressing for one image.
struct Target {
    quirks: ProviderQuirks,
    api_host: String,
    repository: String,
    base: Url,
    verification: DigestVerification,
    credential: Option<RegistryCredential>,
}

impl Target {
    fn new(
        ctx: &RegistryContext,
        reference: &ImageReference,
        credential: Option<&RegistryCredential>,
    ) -> Result<Self> {
        let quirks = provider_for(&reference.registry);
        let host = ctx.config.host(&reference.registry);
        let api_host = quirks.api_host(&reference.registry).to_string();
        let base = Url::parse(&format!("{}://{api_host}/", host.scheme()))?;

        Ok(Self {
            quirks,
            repository: reference.repository.clone(),
            base,
            verification: host.verification,
            credential: ctx.credential_for(reference, credential),
            api_host,
        })
    }

    fn request(
        &self,
        kind: DocumentKind,
        reference: &str,
        expected: Option<ContentDigest>,
    ) -> Result<DocumentRequest> {
        let (segment, accept) = match kind {
            DocumentKind::TopLevel => ("manifests", Some(MediaType::accept_index())),
            DocumentKind::Manifest => ("manifests", Some(MediaType::accept_manifest())),
            DocumentKind::Blob => ("blobs", None),
        };
        let path = format!("v2/{}/{segment}/{reference}", self.repository);
        let url = self.base.join(&path)?;

        Ok(DocumentRequest {
            kind,
            api_host: self.api_host.clone(),
            repository: self.repository.clone(),
            reference: reference.to_string(),
            path,
            url,
            accept,
            expected,
            verification: self.verification,
            credential: self.credential.clone(),
            quirks: self.quirks,
        })
    }
}

/// One network fetch of a document: auth, redirect, status, verification.
async fn fetch_once(ctx: &RegistryContext, request: &DocumentRequest) -> Result<FetchedDocument> {
    let mut authorization = ctx.authorization(request).await?;
    let mut response = ctx.send(request.http(authorization.as_deref())).await?;

    if response.status == 401 {
        let (retried, used) = ctx.answer_challenge(request, &response).await?;
        response = retried;
        authorization = Some(used);
    }
    if response.is_redirect() {
        response = ctx
            .follow_redirect(request, &response, authorization.as_deref())
            .await?;
    }
    if !response.is_success() {
        return Err(ctx.status_error(request.url.as_str(), &request.api_host, &response));
    }

    let digest = request.verify(response.header("docker-content-digest"), &response.body)?;
    let content_type = response.header("content-type").map(str::to_string);
    Ok(FetchedDocument {
        url: request.url.to_string(),
        content_type,
        digest,
        body: response.body.into(),
    })
}

async fn fetch_with_retry(ctx: Arc<RegistryContext>, request: DocumentRequest) -> Result<FetchedDocument> {
    let max_attempts = ctx.config.retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match fetch_once(&ctx, &request).await {
            Err(err) if attempt < max_attempts && ctx.should_retry(&err) => {
                // A throttled retry waits in the gate, not here.
                let delay = if matches!(err, RegistryError::RateLimited { .. }) {
                    Duration::ZERO
                } else {
                    ctx.config.retry.delay_for_retry(attempt)
                };
                warn!(
                    host = %request.api_host,
                    repository = %request.repository,
                    attempt,
                    error = %err,
                    "Retrying registry request"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Metadata of one image for one platform.
#[derive(Debug, Clone, Serialize)]
pub struct ImageMetadata {
    /// Reference that was resolved.
    pub reference: ImageReference,
    /// Provider family of the registry.
    pub provider: ProviderFamily,
    /// Platform that was selected.
    pub platform: Platform,
    /// Digest of the top-level document (index, or manifest when served directly).
    pub index_digest: String,
    /// Digest of the platform manifest.
    pub manifest_digest: String,
    /// Platform manifest.
    pub manifest: ImageManifest,
    /// Image config.
    pub config: ImageConfig,
    /// Merged annotations.
    pub annotations: Annotations,
    /// Source repository hint derived from the annotations.
    pub source_hint: SourceHint,
}

impl ImageMetadata {
    /// Version annotation, if set.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.annotations.get(VERSION_KEY).map(String::as_str)
    }

    /// Creation time from the config, else from the annotations.
    #[must_use]
    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.config.created_at().or_else(|| {
            self.annotations
                .get(CREATED_KEY)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        })
    }

    /// Version signals describing the registry side of a workload.
    #[must_use]
    pub fn signals(&self) -> SignalSet {
        let mut signals = SignalSet::new();
        if let Some(tag) = &self.reference.tag {
            signals = signals.with_tag(tag);
        }
        if let Some(version) = self.version() {
            signals = signals.with_annotation_version(version);
        }
        signals = signals.with_digest(&self.index_digest);
        if let Some(created) = self.created() {
            signals = signals.with_created(created);
        }
        signals
    }
}

/// Client for registry metadata.
///
/// Cheap to clone; clones share caches, throttle and auth state.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    ctx: Arc<RegistryContext>,
}

impl RegistryClient {
    /// Creates a client using `reqwest` and the system clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use skopos_registry::{EngineConfig, RegistryClient};
    ///
    /// let client = RegistryClient::new(EngineConfig::default())?;
    /// # Ok::<(), skopos_registry::RegistryError>(())
    /// ```
    pub fn new(config: EngineConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(config.request_timeout, &config.user_agent)
            .map_err(|e| RegistryError::transient("local", e.to_string()))?;
        Ok(Self::from_context(RegistryContext::new(
            config,
            Arc::new(transport),
            Arc::new(SystemClock),
        )))
    }

    /// Creates a client over an existing context.
    #[must_use]
    pub fn from_context(context: RegistryContext) -> Self {
        Self {
            ctx: Arc::new(context),
        }
    }

    /// Shared state.
    #[must_use]
    pub fn context(&self) -> &RegistryContext {
        &self.ctx
    }

    /// Resolves metadata with the configured credentials.
    ///
    /// # Errors
    ///
    /// See [`resolve_metadata_with`](Self::resolve_metadata_with).
    pub async fn resolve_metadata(
        &self,
        reference: &ImageReference,
        platform: &Platform,
    ) -> Result<ImageMetadata> {
        self.resolve_metadata_with(reference, platform, None).await
    }

    /// Resolves an image reference to its metadata for a platform.
    ///
    /// A pinned digest is fetched directly; otherwise the tag is resolved to
    /// an index and the platform's manifest is selected from it.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::NotFound`] for an unknown repository, tag or digest
    /// - [`RegistryError::PlatformNotAvailable`] if the index lacks the platform
    /// - [`RegistryError::DigestMismatch`] if content does not match its digest
    /// - [`RegistryError::AuthFailure`], [`RegistryError::RateLimited`] or
    ///   [`RegistryError::Transient`] from the negotiation and transport
    pub async fn resolve_metadata_with(
        &self,
        reference: &ImageReference,
        platform: &Platform,
        credential: Option<&RegistryCredential>,
    ) -> Result<ImageMetadata> {
        let target = Target::new(&self.ctx, reference, credential)?;
        debug!(
            host = %target.api_host,
            repository = %reference.repository,
            reference = reference.reference(),
            platform = %platform,
            "Resolving image metadata"
        );

        let (top_request, tier) = match &reference.digest {
            Some(digest) => (
                target.request(DocumentKind::TopLevel, digest, Some(ContentDigest::parse(digest)?))?,
                CacheTier::Immutable,
            ),
            None => (
                target.request(DocumentKind::TopLevel, reference.tag(), None)?,
                CacheTier::Mutable,
            ),
        };
        let top = self.document(top_request, tier).await?;
        let index_digest = top.digest.to_string();
        let decoded = TopLevelDocument::decode(top.content_type.as_deref(), &top.body)
            .map_err(|e| RegistryError::invalid_document(&top.url, e))?;

        let (manifest, manifest_digest, index_annotations) = match decoded {
            TopLevelDocument::Manifest(manifest) => (manifest, index_digest.clone(), None),
            TopLevelDocument::Index(index) => {
                let descriptor =
                    index
                        .select(platform)
                        .ok_or_else(|| RegistryError::PlatformNotAvailable {
                            reference: reference.to_string(),
                            platform: platform.to_string(),
                            available: index.platforms(),
                        })?;
                let expected = ContentDigest::parse(&descriptor.digest)?;
                let request = target.request(DocumentKind::Manifest, &descriptor.digest, Some(expected))?;
                let doc = self.document(request, CacheTier::Immutable).await?;
                let manifest: ImageManifest = serde_json::from_slice(&doc.body)
                    .map_err(|e| RegistryError::invalid_document(&doc.url, e))?;

                let mut annotations = index.annotations.clone().unwrap_or_default();
                if let Some(selected) = &descriptor.annotations {
                    annotations.extend(selected.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                (manifest, descriptor.digest.clone(), Some(annotations))
            }
        };

        let expected = ContentDigest::parse(&manifest.config.digest)?;
        let request = target.request(DocumentKind::Blob, &manifest.config.digest, Some(expected))?;
        let doc = self.document(request, CacheTier::Immutable).await?;
        let config: ImageConfig = serde_json::from_slice(&doc.body)
            .map_err(|e| RegistryError::invalid_document(&doc.url, e))?;

        let annotations = merge_annotations(
            index_annotations.as_ref(),
            manifest.annotations.as_ref(),
            config.labels(),
            target.quirks.annotation_aliases,
        );
        let source_hint = SourceHint::from_annotations(&annotations);

        debug!(
            host = %target.api_host,
            repository = %reference.repository,
            digest = %index_digest,
            manifest_digest = %manifest_digest,
            "Resolved image metadata"
        );

        Ok(ImageMetadata {
            reference: reference.clone(),
            provider: target.quirks.family,
            platform: platform.clone(),
            index_digest,
            manifest_digest,
            manifest,
            config,
            annotations,
            source_hint,
        })
    }

    async fn document(&self, request: DocumentRequest, tier: CacheTier) -> Result<FetchedDocument> {
        let key = request.cache_key();
        let host = request.api_host.clone();
        let ctx = Arc::clone(&self.ctx);
        let (document, source) = self
            .ctx
            .documents
            .get_or_fetch(&key, tier, move || fetch_with_retry(ctx, request))
            .await?;

        match source {
            FetchSource::Cache => {
                self.ctx.stats.record_cache_hit(&host);
                debug!(key = %key, "Cache hit");
            }
            FetchSource::Coalesced => {
                self.ctx.stats.record_coalesced(&host);
                debug!(key = %key, "Joined in-flight fetch");
            }
            FetchSource::Network => {}
        }
        Ok(document)
    }

    /// Purges expired documents and tokens, returning how many were removed.
    pub fn sweep_expired(&self) -> usize {
        self.ctx.documents.invalidate_expired() + self.ctx.tokens.invalidate_expired()
    }

    /// Spawns background expiry sweeps for the document and token caches.
    #[must_use]
    pub fn spawn_sweepers(&self) -> [JoinHandle<()>; 2] {
        [
            self.ctx.documents.spawn_sweeper(),
            self.ctx.tokens.spawn_sweeper(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostOverride;
    use crate::transport::TransportError;

    #[derive(Debug)]
    struct Offline;

    #[async_trait::async_trait]
    impl HttpTransport for Offline {
        async fn get(&self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
            Err(TransportError::Connect {
                url: request.url.to_string(),
                message: "offline".to_string(),
            })
        }
    }

    fn context(config: EngineConfig) -> RegistryContext {
        RegistryContext::new(config, Arc::new(Offline), Arc::new(SystemClock))
    }

    fn request(verification: DigestVerification, expected: Option<ContentDigest>) -> DocumentRequest {
        let ctx = context(
            EngineConfig::default()
                .with_host("registry.local", HostOverride::new().with_verification(verification)),
        );
        let reference = ImageReference::parse("registry.local/team/app:1.0").unwrap();
        Target::new(&ctx, &reference, None)
            .unwrap()
            .request(DocumentKind::Blob, "sha256:00", expected)
            .unwrap()
    }

    #[test]
    fn test_request_urls() {
        let req = request(DigestVerification::Full, None);
        assert_eq!(req.url.as_str(), "https://registry.local/v2/team/app/blobs/sha256:00");
        assert_eq!(req.cache_key().variant, "blob");
        assert!(req.accept.is_none());
    }

    #[test]
    fn test_docker_hub_uses_api_host() {
        let ctx = context(EngineConfig::default());
        let reference = ImageReference::parse("nginx:1.25").unwrap();
        let req = Target::new(&ctx, &reference, None)
            .unwrap()
            .request(DocumentKind::TopLevel, reference.tag(), None)
            .unwrap();
        assert_eq!(
            req.url.as_str(),
            "https://registry-1.docker.io/v2/library/nginx/manifests/1.25"
        );
        assert!(req.accept.unwrap().contains(MediaType::OCI_INDEX));
    }

    #[test]
    fn test_verify_uses_expected_digest() {
        let body = b"{\"schemaVersion\":2}";
        let good = ContentDigest::sha256(body);
        assert_eq!(request(DigestVerification::Full, Some(good.clone())).verify(None, body).unwrap(), good);

        let bad = ContentDigest::sha256(b"other");
        let err = request(DigestVerification::Full, Some(bad.clone()))
            .verify(None, body)
            .unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { ref actual, .. } if *actual == good.to_string()));

        assert_eq!(request(DigestVerification::Skip, Some(bad.clone())).verify(None, body).unwrap(), bad);
    }

    #[test]
    fn test_verify_header_or_computed() {
        let body = b"index";
        let computed = ContentDigest::sha256(body);
        assert_eq!(request(DigestVerification::Full, None).verify(None, body).unwrap(), computed);
        assert_eq!(
            request(DigestVerification::Full, None)
                .verify(Some(&computed.to_string()), body)
                .unwrap(),
            computed
        );
        assert!(request(DigestVerification::Full, None)
            .verify(Some(&ContentDigest::sha256(b"x").to_string()), body)
            .is_err());
    }

    #[test]
    fn test_host_key_keeps_port() {
        assert_eq!(host_key(&Url::parse("http://127.0.0.1:5000/v2/").unwrap()), "127.0.0.1:5000");
        assert_eq!(host_key(&Url::parse("https://ghcr.io/token").unwrap()), "ghcr.io");
    }

    #[test]
    fn test_credential_fingerprint_separates_credentials() {
        let mut req = request(DigestVerification::Full, None);
        assert_eq!(credential_fingerprint(&req), "anonymous");
        req.credential = Some(RegistryCredential::token("a"));
        let a = credential_fingerprint(&req);
        req.credential = Some(RegistryCredential::token("b"));
        assert_ne!(a, credential_fingerprint(&req));
        assert_eq!(a.len(), 16);
    }
}
