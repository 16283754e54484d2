//! Domain authorization
//!
//! Every callback URL must resolve to an active, verified, unexpired
//! authorized domain and satisfy its path/HTTPS restrictions before any
//! network call is made. Positive decisions are cached in an explicit map
//! with a per-entry TTL and a size cap; invalidation on domain mutation is
//! best-effort and freshness is bounded by the TTL.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, error, warn};
use url::Url;

use cb_store::ConfigStore;

/// Why a URL was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Malformed,
    UnknownDomain,
    Inactive,
    Unverified,
    Expired,
    HttpsRequired,
    PathDisallowed,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Malformed => "malformed",
            DenyReason::UnknownDomain => "unknown_domain",
            DenyReason::Inactive => "inactive",
            DenyReason::Unverified => "unverified",
            DenyReason::Expired => "expired",
            DenyReason::HttpsRequired => "https_required",
            DenyReason::PathDisallowed => "path_disallowed",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an authorization check. `domain` carries the derived domain
/// key whenever the URL parsed far enough to have one, so callers can
/// attribute counters without re-deriving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthzDecision {
    Allow { domain: String },
    Deny { reason: DenyReason, domain: Option<String> },
}

impl AuthzDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthzDecision::Allow { .. })
    }

    /// Domain key, when one could be derived. A deny with a known domain
    /// still counts against that domain's failure counter.
    pub fn known_domain(&self) -> Option<&str> {
        match self {
            AuthzDecision::Allow { domain } => Some(domain),
            AuthzDecision::Deny { domain, .. } => domain.as_deref(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthzCacheConfig {
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for AuthzCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            max_entries: 10_000,
        }
    }
}

struct CachedAllow {
    domain: String,
    inserted_at: Instant,
}

pub struct DomainAuthorizer {
    store: Arc<dyn ConfigStore>,
    cache: DashMap<String, CachedAllow>,
    config: AuthzCacheConfig,
}

/// Derives the lookup key for a parsed URL: lowercased host plus `:port`
/// when a non-default port is present (`Url::port` already elides scheme
/// defaults).
pub fn domain_key(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_lowercase();
    if host.is_empty() {
        return None;
    }
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}

impl DomainAuthorizer {
    pub fn new(store: Arc<dyn ConfigStore>, config: AuthzCacheConfig) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            config,
        }
    }

    pub async fn authorize(&self, raw_url: &str) -> AuthzDecision {
        let Ok(url) = Url::parse(raw_url) else {
            return AuthzDecision::Deny {
                reason: DenyReason::Malformed,
                domain: None,
            };
        };
        if !matches!(url.scheme(), "http" | "https") {
            return AuthzDecision::Deny {
                reason: DenyReason::Malformed,
                domain: None,
            };
        }
        let Some(key) = domain_key(&url) else {
            return AuthzDecision::Deny {
                reason: DenyReason::Malformed,
                domain: None,
            };
        };

        if let Some(cached) = self.cache.get(raw_url) {
            if cached.inserted_at.elapsed() < self.config.ttl {
                debug!(url = %raw_url, "Authorization cache hit");
                return AuthzDecision::Allow {
                    domain: cached.domain.clone(),
                };
            }
            drop(cached);
            self.cache.remove(raw_url);
        }

        let domain = match self.store.get_domain_by_name(&key).await {
            Ok(Some(domain)) => domain,
            Ok(None) => {
                warn!(url = %raw_url, domain = %key, "Callback URL not authorized: unknown domain");
                return AuthzDecision::Deny {
                    reason: DenyReason::UnknownDomain,
                    domain: None,
                };
            }
            Err(e) => {
                error!(url = %raw_url, error = %e, "Domain lookup failed, denying");
                return AuthzDecision::Deny {
                    reason: DenyReason::UnknownDomain,
                    domain: None,
                };
            }
        };

        let deny = |reason| AuthzDecision::Deny {
            reason,
            domain: Some(key.clone()),
        };

        if !domain.active {
            return deny(DenyReason::Inactive);
        }
        if !domain.verified {
            return deny(DenyReason::Unverified);
        }
        if domain.is_expired(Utc::now()) {
            return deny(DenyReason::Expired);
        }
        if domain.require_https && url.scheme() != "https" {
            return deny(DenyReason::HttpsRequired);
        }
        if !domain.is_path_allowed(url.path()) {
            return deny(DenyReason::PathDisallowed);
        }

        self.cache_allow(raw_url, &key);
        AuthzDecision::Allow { domain: key }
    }

    /// Drops cached decisions for one domain. Called when the domain record
    /// mutates; entries for other domains stay warm.
    pub fn invalidate(&self, domain: &str) {
        self.cache.retain(|_, cached| cached.domain != domain);
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    fn cache_allow(&self, raw_url: &str, domain: &str) {
        if self.cache.len() >= self.config.max_entries {
            let ttl = self.config.ttl;
            self.cache.retain(|_, cached| cached.inserted_at.elapsed() < ttl);
            if self.cache.len() >= self.config.max_entries {
                return;
            }
        }
        self.cache.insert(
            raw_url.to_string(),
            CachedAllow {
                domain: domain.to_string(),
                inserted_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cb_common::AuthorizedDomain;
    use cb_store::MemoryStore;
    use chrono::Duration as ChronoDuration;

    async fn authorizer_with(domains: Vec<AuthorizedDomain>) -> DomainAuthorizer {
        let store = Arc::new(MemoryStore::new());
        for domain in &domains {
            store.insert_domain(domain).await.unwrap();
        }
        DomainAuthorizer::new(store, AuthzCacheConfig::default())
    }

    fn deny_reason(decision: &AuthzDecision) -> Option<DenyReason> {
        match decision {
            AuthzDecision::Deny { reason, .. } => Some(*reason),
            AuthzDecision::Allow { .. } => None,
        }
    }

    #[tokio::test]
    async fn allows_active_verified_domain() {
        let authorizer =
            authorizer_with(vec![AuthorizedDomain::new("api.example.com").verified()]).await;
        let decision = authorizer.authorize("https://api.example.com/hooks/orders").await;
        assert_eq!(
            decision,
            AuthzDecision::Allow {
                domain: "api.example.com".to_string()
            }
        );
    }

    #[tokio::test]
    async fn denies_malformed_urls() {
        let authorizer = authorizer_with(vec![]).await;
        for url in ["not a url", "ftp://example.com/x", "/relative/path"] {
            let decision = authorizer.authorize(url).await;
            assert_eq!(deny_reason(&decision), Some(DenyReason::Malformed), "{url}");
        }
    }

    #[tokio::test]
    async fn denies_unknown_domain_without_attribution() {
        let authorizer = authorizer_with(vec![]).await;
        let decision = authorizer.authorize("https://evil.com/hook").await;
        assert_eq!(deny_reason(&decision), Some(DenyReason::UnknownDomain));
        assert_eq!(decision.known_domain(), None);
    }

    #[tokio::test]
    async fn denies_inactive_unverified_and_expired() {
        let mut inactive = AuthorizedDomain::new("inactive.example.com").verified();
        inactive.active = false;
        let unverified = AuthorizedDomain::new("unverified.example.com");
        let expired = AuthorizedDomain::new("expired.example.com")
            .verified()
            .with_expiry(Utc::now() - ChronoDuration::hours(1));

        let authorizer = authorizer_with(vec![inactive, unverified, expired]).await;

        let decision = authorizer.authorize("https://inactive.example.com/x").await;
        assert_eq!(deny_reason(&decision), Some(DenyReason::Inactive));

        let decision = authorizer.authorize("https://unverified.example.com/x").await;
        assert_eq!(deny_reason(&decision), Some(DenyReason::Unverified));

        let decision = authorizer.authorize("https://expired.example.com/x").await;
        assert_eq!(deny_reason(&decision), Some(DenyReason::Expired));
        // A known domain is still attributed on deny.
        assert_eq!(decision.known_domain(), Some("expired.example.com"));
    }

    #[tokio::test]
    async fn enforces_https_and_paths() {
        let strict = AuthorizedDomain::new("secure.example.com")
            .verified()
            .with_require_https(true)
            .with_allowed_paths(vec!["/webhooks/*".to_string()]);
        let authorizer = authorizer_with(vec![strict]).await;

        let decision = authorizer.authorize("http://secure.example.com/webhooks/a").await;
        assert_eq!(deny_reason(&decision), Some(DenyReason::HttpsRequired));

        let decision = authorizer.authorize("https://secure.example.com/admin").await;
        assert_eq!(deny_reason(&decision), Some(DenyReason::PathDisallowed));

        let decision = authorizer
            .authorize("https://secure.example.com/webhooks/a/b")
            .await;
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn nonstandard_port_is_part_of_the_key() {
        let authorizer =
            authorizer_with(vec![AuthorizedDomain::new("api.example.com:8443").verified()]).await;

        let decision = authorizer.authorize("https://api.example.com:8443/x").await;
        assert!(decision.is_allowed());

        // Default port folds into the bare host, which is not authorized.
        let decision = authorizer.authorize("https://api.example.com/x").await;
        assert_eq!(deny_reason(&decision), Some(DenyReason::UnknownDomain));
    }

    #[tokio::test]
    async fn host_is_case_insensitive() {
        let authorizer =
            authorizer_with(vec![AuthorizedDomain::new("api.example.com").verified()]).await;
        let decision = authorizer.authorize("https://API.Example.COM/x").await;
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn repeated_authorization_is_idempotent() {
        let authorizer =
            authorizer_with(vec![AuthorizedDomain::new("api.example.com").verified()]).await;
        let first = authorizer.authorize("https://api.example.com/x").await;
        for _ in 0..5 {
            let again = authorizer.authorize("https://api.example.com/x").await;
            assert_eq!(again, first);
        }
        assert_eq!(authorizer.cached_len(), 1);
    }

    #[tokio::test]
    async fn invalidation_drops_only_the_mutated_domain() {
        let authorizer = authorizer_with(vec![
            AuthorizedDomain::new("a.example.com").verified(),
            AuthorizedDomain::new("b.example.com").verified(),
        ])
        .await;

        authorizer.authorize("https://a.example.com/x").await;
        authorizer.authorize("https://b.example.com/x").await;
        assert_eq!(authorizer.cached_len(), 2);

        authorizer.invalidate("a.example.com");
        assert_eq!(authorizer.cached_len(), 1);
    }

    #[tokio::test]
    async fn negative_decisions_are_not_cached() {
        let authorizer = authorizer_with(vec![]).await;
        authorizer.authorize("https://evil.com/x").await;
        assert_eq!(authorizer.cached_len(), 0);
    }
}
