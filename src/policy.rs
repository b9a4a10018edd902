//! Endpoint policy table: per-prefix admission limits with a global default.

use std::time::Duration;

/// Admission limits for one endpoint prefix.
///
/// `authenticated_limit >= anonymous_limit` is convention, not enforced:
/// a deployment may deliberately throttle logged-in users harder on an
/// endpoint that is expensive only for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPolicy {
    /// Max requests per window for unauthenticated identities.
    pub anonymous_limit: u32,
    /// Max requests per window for authenticated identities.
    pub authenticated_limit: u32,
    /// Max tokens in the burst bucket.
    pub burst_size: u32,
    /// Length of the sliding window.
    pub window: Duration,
}

impl Default for EndpointPolicy {
    fn default() -> Self {
        Self {
            anonymous_limit: 200,
            authenticated_limit: 500,
            burst_size: 50,
            window: Duration::from_secs(60),
        }
    }
}

impl EndpointPolicy {
    /// Construct a policy. Validation happens when the table is built.
    pub fn new(
        anonymous_limit: u32,
        authenticated_limit: u32,
        burst_size: u32,
        window: Duration,
    ) -> Self {
        Self { anonymous_limit, authenticated_limit, burst_size, window }
    }

    /// The window quota that applies to the given auth state.
    pub fn limit_for(&self, authenticated: bool) -> u32 {
        if authenticated {
            self.authenticated_limit
        } else {
            self.anonymous_limit
        }
    }

    pub(crate) fn window_millis(&self) -> u64 {
        self.window.as_millis() as u64
    }

    /// Bucket refill rate: one full burst per window.
    pub(crate) fn refill_per_ms(&self) -> f64 {
        f64::from(self.burst_size) / self.window_millis() as f64
    }

    fn validate(&self, prefix: &str) -> Result<(), PolicyError> {
        if self.window.as_millis() == 0 {
            return Err(PolicyError::ZeroWindow { prefix: prefix.to_owned() });
        }
        if self.burst_size == 0 {
            return Err(PolicyError::ZeroBurst { prefix: prefix.to_owned() });
        }
        if self.anonymous_limit == 0 || self.authenticated_limit == 0 {
            return Err(PolicyError::ZeroLimit { prefix: prefix.to_owned() });
        }
        Ok(())
    }
}

/// Rejected policy-table configuration.
///
/// Raised once at construction; a malformed policy must never surface as a
/// per-request failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// Window length must be at least one millisecond.
    #[error("policy for `{prefix}` has a zero-length window")]
    ZeroWindow {
        /// Offending rule prefix (`default` for the fallback policy).
        prefix: String,
    },
    /// Burst size must be > 0 or nothing is ever admitted.
    #[error("policy for `{prefix}` has a zero burst size")]
    ZeroBurst {
        /// Offending rule prefix.
        prefix: String,
    },
    /// Both window limits must be > 0.
    #[error("policy for `{prefix}` has a zero request limit")]
    ZeroLimit {
        /// Offending rule prefix.
        prefix: String,
    },
    /// Two rules share a prefix; the table would silently shadow one.
    #[error("duplicate policy rule for prefix `{prefix}`")]
    DuplicatePrefix {
        /// The repeated prefix.
        prefix: String,
    },
}

/// Static, validated mapping from path prefixes to [`EndpointPolicy`] values.
///
/// Rules are sorted by descending prefix length at build time so a linear
/// first-match scan is also a longest-prefix match. Tables are small (a few
/// dozen rules at most); no index structure is warranted.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    rules: Vec<(String, EndpointPolicy)>,
    fallback: EndpointPolicy,
}

impl PolicyTable {
    /// Start building a table.
    pub fn builder() -> PolicyTableBuilder {
        PolicyTableBuilder::default()
    }

    /// A table with no per-prefix rules; every path gets the default policy.
    pub fn default_only() -> Self {
        Self { rules: Vec::new(), fallback: EndpointPolicy::default() }
    }

    /// Resolve the policy for a request path.
    ///
    /// Longest matching prefix wins; unmatched paths get the fallback.
    pub fn policy_for(&self, path: &str) -> &EndpointPolicy {
        self.rules
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, policy)| policy)
            .unwrap_or(&self.fallback)
    }
}

/// Builder validating every rule (and the fallback) eagerly.
#[derive(Debug, Default)]
pub struct PolicyTableBuilder {
    rules: Vec<(String, EndpointPolicy)>,
    fallback: Option<EndpointPolicy>,
}

impl PolicyTableBuilder {
    /// Add a rule for a path prefix.
    pub fn rule(mut self, prefix: impl Into<String>, policy: EndpointPolicy) -> Self {
        self.rules.push((prefix.into(), policy));
        self
    }

    /// Override the fallback policy applied to unmatched paths.
    pub fn default_policy(mut self, policy: EndpointPolicy) -> Self {
        self.fallback = Some(policy);
        self
    }

    /// Validate every policy and freeze the table.
    pub fn build(self) -> Result<PolicyTable, PolicyError> {
        let fallback = self.fallback.unwrap_or_default();
        fallback.validate("default")?;

        let mut rules = self.rules;
        for (prefix, policy) in &rules {
            policy.validate(prefix)?;
        }
        for (i, (prefix, _)) in rules.iter().enumerate() {
            if rules.iter().skip(i + 1).any(|(other, _)| other == prefix) {
                return Err(PolicyError::DuplicatePrefix { prefix: prefix.clone() });
            }
        }

        // Stable sort keeps insertion order among equal-length prefixes.
        rules.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));

        Ok(PolicyTable { rules, fallback })
    }
}
