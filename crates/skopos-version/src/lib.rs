//! # Skopos Version
//!
//! Reduces competing version signals into one canonical "current" and
//! "latest" version per workload, with an auditable reason code.
//!
//! ## Signals
//!
//! | Kind                 | Typical source                          |
//! |----------------------|-----------------------------------------|
//! | `ExplicitTag`        | tag in the image reference              |
//! | `AnnotationVersion`  | `org.opencontainers.image.version`      |
//! | `ContentDigest`      | index or manifest digest                |
//! | `SourceRevision`     | revision-controlled source tree         |
//! | `CreationTimestamp`  | image config `created`                  |
//!
//! ## Quick Start
//!
//! ```rust
//! use skopos_version::{SignalSet, VersionPolicy, VersionResolver};
//!
//! let installed = SignalSet::new()
//!     .with_annotation_version("2.3.0")
//!     .with_digest("sha256:0123456789abcdef0123");
//! let available = SignalSet::new()
//!     .with_annotation_version("2.3.1")
//!     .with_digest("sha256:fedcba9876543210fedc");
//!
//! let resolved = VersionResolver::new().resolve(&installed, &available, VersionPolicy::Auto, false);
//! assert_eq!(resolved.latest, "2.3.1");
//! assert!(resolved.update_available);
//! assert_eq!(resolved.reason.to_string(), "auto/annotation_version");
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod parse;
mod policy;
mod resolver;
mod revision;
mod rules;
mod signal;

pub use error::{Result, VersionError};
pub use parse::{is_version_like, ParsedVersion};
pub use policy::VersionPolicy;
pub use resolver::{ReasonCode, ResolvedVersion, VersionResolver};
pub use revision::{GitCli, RevisionControl, RevisionStatus};
pub use rules::{rules_for, select, Rule, RuleId, Selection, UNKNOWN_VERSION};
pub use signal::{short_digest, Confidence, SignalKind, SignalSet, VersionSignal, SHORT_DIGEST_LEN};
