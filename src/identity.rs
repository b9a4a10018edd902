//! Identity resolution: deriving a stable rate-limit key from a request.

use std::fmt;

use http::HeaderMap;

/// Stable key identifying the rate-limited subject.
///
/// `auth:<user>` when an authenticated session was resolved upstream,
/// `anon:<address>` otherwise. Derived per request and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Key for an authenticated user.
    pub fn authenticated(user_id: &str) -> Self {
        Self(format!("auth:{user_id}"))
    }

    /// Key for an unauthenticated caller, scoped by client address.
    pub fn anonymous(address: &str) -> Self {
        Self(format!("anon:{address}"))
    }

    /// The raw key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives an [`Identity`] from request headers.
///
/// Forwarded-IP headers are only meaningful when a trusted reverse proxy
/// sets them; a caller reaching the process directly can forge both
/// `x-forwarded-for` and `x-real-ip`. Deployments without such a proxy
/// should turn `trust_proxy_headers` off, which collapses all anonymous
/// traffic onto the `unknown` key.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    trust_proxy_headers: bool,
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self { trust_proxy_headers: true }
    }
}

impl IdentityResolver {
    /// Resolver that trusts proxy-set forwarding headers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle whether `x-forwarded-for` / `x-real-ip` are honored.
    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }

    /// Resolve the rate-limit key for a request.
    ///
    /// A present `user_id` means the caller authenticated upstream and wins
    /// outright. Otherwise the first entry of `x-forwarded-for` is used,
    /// then `x-real-ip`, then the literal `unknown`. Always succeeds.
    pub fn resolve(&self, headers: &HeaderMap, user_id: Option<&str>) -> Identity {
        if let Some(user) = user_id {
            return Identity::authenticated(user);
        }

        if self.trust_proxy_headers {
            if let Some(addr) = forwarded_client(headers) {
                return Identity::anonymous(addr);
            }
        }

        Identity::anonymous("unknown")
    }
}

/// First usable client address from forwarding headers.
fn forwarded_client(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|list| list.split(',').map(str::trim).find(|entry| !entry.is_empty()))
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|addr| !addr.is_empty())
        })
}
