//! Registry provider quirks as data.
//!
//! Every provider speaks the same distribution protocol; differences such as
//! API host, token realm and personal-access-token style live in an ordered
//! rule table matched by host pattern. The first matching rule wins and the
//! last rule matches everything.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::auth::TokenStyle;

/// Legacy `org.label-schema.*` keys and their OCI equivalents.
pub const LABEL_SCHEMA_ALIASES: &[(&str, &str)] = &[
    ("org.label-schema.version", "org.opencontainers.image.version"),
    ("org.label-schema.vcs-ref", "org.opencontainers.image.revision"),
    ("org.label-schema.vcs-url", "org.opencontainers.image.source"),
    ("org.label-schema.build-date", "org.opencontainers.image.created"),
    ("org.label-schema.url", "org.opencontainers.image.url"),
    ("org.label-schema.usage", "org.opencontainers.image.documentation"),
    ("org.label-schema.vendor", "org.opencontainers.image.vendor"),
    ("org.label-schema.name", "org.opencontainers.image.title"),
    ("org.label-schema.description", "org.opencontainers.image.description"),
    ("org.label-schema.license", "org.opencontainers.image.licenses"),
];

/// Provider family of a registry host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    /// Docker Hub.
    DockerHub,
    /// GitHub Container Registry.
    Ghcr,
    /// GitLab container registry.
    GitLab,
    /// LinuxServer.io vendor shortcut.
    LinuxServer,
    /// Microsoft Container Registry.
    Mcr,
    /// Gitea, Forgejo or Codeberg package registry.
    Forge,
    /// Any other registry.
    Generic,
}

impl fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DockerHub => "docker_hub",
            Self::Ghcr => "ghcr",
            Self::GitLab => "gitlab",
            Self::LinuxServer => "linuxserver",
            Self::Mcr => "mcr",
            Self::Forge => "forge",
            Self::Generic => "generic",
        })
    }
}

/// How a rule matches a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPattern {
    /// Host equals the text.
    Exact(&'static str),
    /// Host starts with the text.
    Prefix(&'static str),
    /// Host contains the text.
    Contains(&'static str),
    /// Any host.
    Any,
}

impl HostPattern {
    /// Checks a lower-case host (port ignored).
    #[must_use]
    pub fn matches(&self, host: &str) -> bool {
        let host = host.split(':').next().unwrap_or(host);
        match self {
            Self::Exact(text) => host == *text,
            Self::Prefix(text) => host.starts_with(text),
            Self::Contains(text) => host.contains(text),
            Self::Any => true,
        }
    }
}

/// Known token endpoint, used to fetch a token before the first request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownRealm {
    /// Token endpoint URL.
    pub realm: &'static str,
    /// Service name.
    pub service: &'static str,
}

/// Quirks of one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderQuirks {
    /// Provider family.
    pub family: ProviderFamily,
    /// Host that serves the `/v2/` API, when different from the reference host.
    pub api_host: Option<&'static str>,
    /// Registry never requires authentication.
    pub anonymous: bool,
    /// Token endpoint known ahead of any challenge.
    pub known_realm: Option<KnownRealm>,
    /// How a bare personal-access token is presented.
    pub token_style: TokenStyle,
    /// Annotation key aliases normalized to OCI keys.
    pub annotation_aliases: &'static [(&'static str, &'static str)],
}

impl ProviderQuirks {
    /// API host for a reference host.
    #[must_use]
    pub fn api_host<'a>(&self, registry: &'a str) -> &'a str {
        self.api_host.unwrap_or(registry)
    }
}

/// One row of the provider table.
#[derive(Debug, Clone, Copy)]
pub struct ProviderRule {
    /// Host pattern.
    pub pattern: HostPattern,
    /// Quirks applied when the pattern matches.
    pub quirks: ProviderQuirks,
}

const fn rule(pattern: HostPattern, quirks: ProviderQuirks) -> ProviderRule {
    ProviderRule { pattern, quirks }
}

const fn quirks(family: ProviderFamily, token_style: TokenStyle) -> ProviderQuirks {
    ProviderQuirks {
        family,
        api_host: None,
        anonymous: false,
        known_realm: None,
        token_style,
        annotation_aliases: LABEL_SCHEMA_ALIASES,
    }
}

const GHCR_REALM: KnownRealm = KnownRealm {
    realm: "https://ghcr.io/token",
    service: "ghcr.io",
};

/// Provider rules in evaluation order.
pub const PROVIDER_RULES: &[ProviderRule] = &[
    rule(
        HostPattern::Exact("docker.io"),
        ProviderQuirks {
            api_host: Some("registry-1.docker.io"),
            known_realm: Some(KnownRealm {
                realm: "https://auth.docker.io/token",
                service: "registry.docker.io",
            }),
            ..quirks(ProviderFamily::DockerHub, TokenStyle::Bearer)
        },
    ),
    rule(
        HostPattern::Exact("ghcr.io"),
        ProviderQuirks {
            known_realm: Some(GHCR_REALM),
            ..quirks(ProviderFamily::Ghcr, TokenStyle::BasicWithUser("token"))
        },
    ),
    rule(
        HostPattern::Exact("lscr.io"),
        ProviderQuirks {
            known_realm: Some(GHCR_REALM),
            ..quirks(ProviderFamily::LinuxServer, TokenStyle::BasicWithUser("token"))
        },
    ),
    rule(
        HostPattern::Exact("mcr.microsoft.com"),
        ProviderQuirks {
            anonymous: true,
            ..quirks(ProviderFamily::Mcr, TokenStyle::Bearer)
        },
    ),
    rule(
        HostPattern::Prefix("registry.gitlab."),
        quirks(ProviderFamily::GitLab, TokenStyle::BasicWithUser("oauth2")),
    ),
    rule(
        HostPattern::Contains("gitlab"),
        quirks(ProviderFamily::GitLab, TokenStyle::BasicWithUser("oauth2")),
    ),
    rule(
        HostPattern::Exact("codeberg.org"),
        quirks(ProviderFamily::Forge, TokenStyle::BasicWithUser("token")),
    ),
    rule(
        HostPattern::Contains("gitea"),
        quirks(ProviderFamily::Forge, TokenStyle::BasicWithUser("token")),
    ),
    rule(
        HostPattern::Contains("forgejo"),
        quirks(ProviderFamily::Forge, TokenStyle::BasicWithUser("token")),
    ),
    rule(HostPattern::Any, quirks(ProviderFamily::Generic, TokenStyle::Bearer)),
];

/// Looks up the quirks for a registry host.
///
/// # Examples
///
/// ```
/// use skopos_registry::{provider_for, ProviderFamily};
///
/// assert_eq!(provider_for("docker.io").family, ProviderFamily::DockerHub);
/// assert_eq!(provider_for("docker.io").api_host("docker.io"), "registry-1.docker.io");
/// assert_eq!(provider_for("registry.example.com:5000").family, ProviderFamily::Generic);
/// ```
#[must_use]
pub fn provider_for(host: &str) -> ProviderQuirks {
    let host = host.to_ascii_lowercase();
    PROVIDER_RULES
        .iter()
        .find(|r| r.pattern.matches(&host))
        .map_or_else(
            || quirks(ProviderFamily::Generic, TokenStyle::Bearer),
            |r| r.quirks,
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_hosts() {
        assert_eq!(provider_for("ghcr.io").family, ProviderFamily::Ghcr);
        assert_eq!(provider_for("lscr.io").family, ProviderFamily::LinuxServer);
        assert_eq!(provider_for("mcr.microsoft.com").family, ProviderFamily::Mcr);
        assert_eq!(provider_for("registry.gitlab.com").family, ProviderFamily::GitLab);
        assert_eq!(provider_for("gitlab.internal:5050").family, ProviderFamily::GitLab);
        assert_eq!(provider_for("codeberg.org").family, ProviderFamily::Forge);
        assert_eq!(provider_for("gitea.home.lan").family, ProviderFamily::Forge);
        assert_eq!(provider_for("forgejo.example.net").family, ProviderFamily::Forge);
        assert_eq!(provider_for("quay.io").family, ProviderFamily::Generic);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!(provider_for("GHCR.IO").family, ProviderFamily::Ghcr);
    }

    #[test]
    fn test_docker_hub_quirks() {
        let hub = provider_for("docker.io");
        assert_eq!(hub.api_host("docker.io"), "registry-1.docker.io");
        let realm = hub.known_realm.unwrap();
        assert_eq!(realm.realm, "https://auth.docker.io/token");
        assert_eq!(realm.service, "registry.docker.io");
    }

    #[test]
    fn test_linuxserver_uses_ghcr_tokens() {
        let lscr = provider_for("lscr.io");
        assert_eq!(lscr.api_host("lscr.io"), "lscr.io");
        assert_eq!(lscr.known_realm.unwrap().realm, "https://ghcr.io/token");
    }

    #[test]
    fn test_mcr_is_anonymous() {
        let mcr = provider_for("mcr.microsoft.com");
        assert!(mcr.anonymous);
        assert!(mcr.known_realm.is_none());
    }

    #[test]
    fn test_last_rule_matches_everything() {
        let last = PROVIDER_RULES.last().unwrap();
        assert_eq!(last.pattern, HostPattern::Any);
        assert_eq!(last.quirks.family, ProviderFamily::Generic);
    }

    #[test]
    fn test_pattern_ignores_port() {
        assert!(HostPattern::Exact("registry.local").matches("registry.local:5000"));
        assert!(!HostPattern::Prefix("registry.gitlab.").matches("my.registry.gitlab.com"));
    }
}
