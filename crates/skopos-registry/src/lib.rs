//! # Skopos Registry
//!
//! Container registry metadata retrieval for Skopos update detection.
//!
//! This crate resolves image references against OCI distribution registries
//! (Docker Hub, GHCR, GitLab, lscr.io, MCR, Gitea/Forgejo and any generic
//! registry) and reduces the result to comparable versions.
//!
//! ## Features
//!
//! - **Metadata resolution**: index → platform manifest → config, with
//!   digest verification and annotation merging
//! - **Tiered cache**: mutable, immutable and token tiers with request coalescing
//! - **Throttling**: per-host backoff from `429`/`Retry-After`
//! - **Auth negotiation**: anonymous, Basic and Bearer token flows
//! - **Version resolution**: policy-driven via `skopos-version`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use skopos_registry::{EngineConfig, InstalledImage, UpdateEngine, WorkloadRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = UpdateEngine::new(EngineConfig::default())?;
//!
//!     let request = WorkloadRequest::new("ghcr.io/home-assistant/home-assistant:stable")
//!         .with_installed(InstalledImage::new().with_repo_digest("sha256:..."));
//!     let resolved = engine.resolve_version(&request).await?;
//!
//!     if resolved.update_available {
//!         println!("{} -> {} ({})", resolved.current, resolved.latest, resolved.reason);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      UpdateEngine                           │
//! │  ┌──────────────────────────┐  ┌─────────────────────────┐  │
//! │  │     RegistryClient       │  │    VersionResolver      │  │
//! │  │  ┌───────┐ ┌──────────┐  │  │    RevisionControl      │  │
//! │  │  │ Cache │ │ Throttle │  │  └─────────────────────────┘  │
//! │  │  └───────┘ └──────────┘  │                               │
//! │  │  ┌───────┐ ┌──────────┐  │                               │
//! │  │  │ Auth  │ │ Provider │  │                               │
//! │  │  └───────┘ └──────────┘  │                               │
//! │  └──────────────────────────┘                               │
//! └─────────────────────────────────────────────────────────────┘
//!                          │ HttpTransport
//!                          ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   OCI Registries                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod annotations;
mod auth;
mod cache;
mod client;
mod clock;
mod config;
mod digest;
mod engine;
mod error;
mod oci;
mod provider;
mod reference;
mod stats;
mod throttle;
mod transport;

pub use annotations::{
    merge_annotations, normalize_aliases, SourceHint, SourcePlatform, CREATED_KEY, REVISION_KEY,
    SOURCE_KEY, VERSION_KEY,
};
pub use auth::{
    basic_header, bearer_header, pull_scope, token_request_header, AuthScheme, AuthStates,
    AuthToken, Challenge, CredentialSource, HostAuthState, StaticCredentials, TokenResponse,
    TokenStyle,
};
pub use cache::{CacheConfig, CacheKey, CacheTier, FetchSource, TieredCache};
pub use client::{FetchedDocument, ImageMetadata, RegistryClient, RegistryContext};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    DigestVerification, EngineConfig, HostOverride, RegistryCredential, RetryConfig,
};
pub use digest::ContentDigest;
pub use engine::{InstalledImage, UpdateEngine, WorkloadOutcome, WorkloadRequest};
pub use error::{RegistryError, Result, Severity};
pub use oci::{
    Annotations, ContainerConfig, Descriptor, DescriptorPlatform, ErrorResponse, HistoryEntry,
    ImageConfig, ImageIndex, ImageManifest, MediaType, RegistryApiError, TopLevelDocument,
};
pub use provider::{
    provider_for, HostPattern, KnownRealm, ProviderFamily, ProviderQuirks, ProviderRule,
    LABEL_SCHEMA_ALIASES, PROVIDER_RULES,
};
pub use reference::{ImageReference, Platform, DEFAULT_REGISTRY, DEFAULT_TAG};
pub use stats::{CallStats, HostStatsSnapshot};
pub use throttle::{
    parse_retry_after, shuffle_workloads, Permit, ThrottleConfig, ThrottleController,
    ThrottleMode, ThrottleState,
};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError};
