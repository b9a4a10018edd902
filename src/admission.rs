//! Admission controller: burst guard first, sliding-window quota second.

use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use serde::Serialize;
use tracing::debug;

use crate::clock::{Clock, WallClock};
use crate::identity::{Identity, IdentityResolver};
use crate::metrics::{AdmissionMetrics, MetricsSnapshot};
use crate::policy::PolicyTable;
use crate::sliding_window::SlidingWindowStore;
use crate::token_bucket::TokenBucketStore;

/// Backoff hint for burst rejections. The bucket refills continuously, so a
/// short fixed hint is reported instead of one derived from the window
/// length.
const BURST_RETRY_AFTER_SECS: u64 = 1;

/// The allow/deny decision for one request, with quota metadata.
///
/// Quota exhaustion is a value, never an error: the controller performs no
/// I/O and has nothing to retry internally. `retry_after` is the caller's
/// signal for backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdmissionDecision {
    /// Whether the request may proceed to business logic.
    pub allowed: bool,
    /// The window quota that applied (`X-RateLimit-Limit`).
    pub limit: u32,
    /// Requests left in the current window (`X-RateLimit-Remaining`).
    pub remaining: u32,
    /// Epoch milliseconds at which capacity next frees up
    /// (`X-RateLimit-Reset`).
    pub reset_at: u64,
    /// Whole seconds to wait before retrying; present only on denials
    /// (`Retry-After`).
    pub retry_after: Option<u64>,
}

/// Store sizes and rough footprint, for dashboards and leak checks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AdmissionStats {
    /// Live token buckets.
    pub total_buckets: usize,
    /// Live sliding-window logs.
    pub total_logs: usize,
    /// Estimated heap usage of both stores.
    pub approx_memory_kb: f64,
}

/// Composes identity resolution, the policy table, the burst guard, and the
/// sliding-window quota into a single per-request check.
///
/// The controller is an explicit, constructed instance: the embedding
/// application builds one, wraps it in an [`Arc`], and injects it into its
/// HTTP layer. Both state stores are exclusively owned here.
///
/// Scope is one process. Horizontally scaled deployments enforce an
/// independent quota per instance; coordinating quotas through a shared
/// store is out of scope for this crate.
#[derive(Debug)]
pub struct AdmissionController {
    policies: PolicyTable,
    resolver: IdentityResolver,
    buckets: TokenBucketStore,
    windows: SlidingWindowStore,
    metrics: AdmissionMetrics,
    clock: Arc<dyn Clock>,
}

impl AdmissionController {
    /// Controller over a validated policy table, with the wall clock and a
    /// proxy-trusting identity resolver.
    pub fn new(policies: PolicyTable) -> Self {
        Self {
            policies,
            resolver: IdentityResolver::new(),
            buckets: TokenBucketStore::new(),
            windows: SlidingWindowStore::new(),
            metrics: AdmissionMetrics::default(),
            clock: Arc::new(WallClock),
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Override the identity resolver (e.g. to distrust proxy headers).
    pub fn with_resolver(mut self, resolver: IdentityResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Check a request given its headers and normalized route path.
    ///
    /// `user_id` is the identifier the caller's auth layer resolved
    /// upstream; `Some` marks the request authenticated.
    pub fn check(&self, headers: &HeaderMap, path: &str, user_id: Option<&str>) -> AdmissionDecision {
        let identity = self.resolver.resolve(headers, user_id);
        self.check_identity(&identity, path, user_id.is_some())
    }

    /// Check a request for an already-resolved identity.
    ///
    /// Evaluation order is fixed: the burst bucket is consulted before the
    /// window, so a burst violation never also consumes window quota.
    pub fn check_identity(
        &self,
        identity: &Identity,
        path: &str,
        authenticated: bool,
    ) -> AdmissionDecision {
        let policy = self.policies.policy_for(path);
        let limit = policy.limit_for(authenticated);
        let now = self.clock.now_millis();
        let key = format!("{identity}:{path}");

        let burst = self
            .buckets
            .try_consume(&key, policy.burst_size, policy.refill_per_ms(), now);
        if !burst.allowed {
            self.metrics.record_rejected_burst();
            debug!(identity = %identity, path, "burst guard rejected request");
            return AdmissionDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at: now + BURST_RETRY_AFTER_SECS * 1_000,
                retry_after: Some(BURST_RETRY_AFTER_SECS),
            };
        }

        let window = self.windows.try_record(&key, limit, policy.window_millis(), now);
        if !window.allowed {
            self.metrics.record_rejected_window();
            debug!(identity = %identity, path, reset_at = window.reset_at, "window quota exhausted");
            let wait_ms = window.reset_at.saturating_sub(now);
            return AdmissionDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at: window.reset_at,
                retry_after: Some(wait_ms.div_ceil(1_000)),
            };
        }

        self.metrics.record_allowed();
        AdmissionDecision {
            allowed: true,
            limit,
            remaining: window.remaining,
            reset_at: window.reset_at,
            retry_after: None,
        }
    }

    /// Evict state idle for at least `max_idle`. Returns `(buckets, logs)`
    /// eviction counts.
    ///
    /// Safe to run while requests are in flight; eviction takes the same
    /// per-shard locks as the request path.
    pub fn purge_stale(&self, max_idle: Duration) -> (usize, usize) {
        let now = self.clock.now_millis();
        let max_idle_ms = max_idle.as_millis() as u64;
        let buckets = self.buckets.purge_idle(now, max_idle_ms);
        let logs = self.windows.purge_idle(now, max_idle_ms);
        if buckets + logs > 0 {
            debug!(buckets, logs, "evicted idle admission state");
        }
        (buckets, logs)
    }

    /// Spawn a background task running [`purge_stale`](Self::purge_stale)
    /// every `every`. Abort the returned handle to stop sweeping.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        max_idle: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so the initial
            // sweep happens one full interval after startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                controller.purge_stale(max_idle);
            }
        })
    }

    /// Current store sizes and approximate footprint.
    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            total_buckets: self.buckets.len(),
            total_logs: self.windows.len(),
            approx_memory_kb: (self.buckets.approx_bytes() + self.windows.approx_bytes()) as f64
                / 1024.0,
        }
    }

    /// Counter snapshot for the metrics recorder.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Drop all buckets, logs, and counters (tests and manual ops resets).
    pub fn clear(&self) {
        self.buckets.clear();
        self.windows.clear();
        self.metrics.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::policy::{EndpointPolicy, PolicyTable};

    const T0: u64 = 1_700_000_000_000;

    fn controller(clock: &ManualClock) -> AdmissionController {
        let table = PolicyTable::builder()
            .rule("/api/test", EndpointPolicy::new(3, 10, 2, Duration::from_secs(1)))
            // Burst above the window limit, so the window quota is the
            // binding constraint on this endpoint.
            .rule("/api/bulk", EndpointPolicy::new(3, 10, 10, Duration::from_secs(1)))
            .build()
            .unwrap();
        AdmissionController::new(table).with_clock(clock.clone())
    }

    fn anon() -> Identity {
        Identity::anonymous("1.2.3.4")
    }

    #[test]
    fn burst_rejection_does_not_touch_the_window_log() {
        let clock = ManualClock::new(T0);
        let controller = controller(&clock);
        let identity = anon();

        assert!(controller.check_identity(&identity, "/api/test", false).allowed);
        assert!(controller.check_identity(&identity, "/api/test", false).allowed);
        let denied = controller.check_identity(&identity, "/api/test", false);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(1));

        let key = format!("{}:/api/test", identity);
        assert_eq!(controller.windows.recorded(&key), 2);
    }

    #[test]
    fn burst_rejection_reports_a_one_second_backoff() {
        let clock = ManualClock::new(T0);
        let controller = controller(&clock);
        let identity = anon();

        controller.check_identity(&identity, "/api/test", false);
        controller.check_identity(&identity, "/api/test", false);
        let denied = controller.check_identity(&identity, "/api/test", false);

        assert_eq!(denied.retry_after, Some(1));
        assert_eq!(denied.reset_at, T0 + 1_000);
        assert_eq!(denied.remaining, 0);
    }

    #[test]
    fn identities_are_isolated() {
        let clock = ManualClock::new(T0);
        let controller = controller(&clock);
        let user = Identity::authenticated("userA");
        let visitor = anon();

        // Exhaust the authenticated user's burst allowance.
        controller.check_identity(&user, "/api/test", true);
        controller.check_identity(&user, "/api/test", true);
        assert!(!controller.check_identity(&user, "/api/test", true).allowed);

        let decision = controller.check_identity(&visitor, "/api/test", false);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
    }

    #[test]
    fn authenticated_and_anonymous_limits_differ() {
        let clock = ManualClock::new(T0);
        let controller = controller(&clock);

        let auth = controller.check_identity(&Identity::authenticated("u"), "/api/test", true);
        assert_eq!(auth.limit, 10);

        let visitor = controller.check_identity(&anon(), "/api/test", false);
        assert_eq!(visitor.limit, 3);
    }

    #[test]
    fn unmatched_paths_use_the_default_policy() {
        let clock = ManualClock::new(T0);
        let controller = controller(&clock);

        let decision = controller.check_identity(&anon(), "/api/unknown/path", false);
        assert_eq!(decision.limit, 200);
    }

    #[test]
    fn burst_scenario_refill_reopens_admission() {
        let clock = ManualClock::new(T0);
        let controller = controller(&clock);
        let identity = anon();

        // Burst capacity 2: two instant requests pass.
        assert!(controller.check_identity(&identity, "/api/test", false).allowed);
        assert!(controller.check_identity(&identity, "/api/test", false).allowed);

        // Third instant request trips the burst guard.
        let burst_denied = controller.check_identity(&identity, "/api/test", false);
        assert!(!burst_denied.allowed);
        assert_eq!(burst_denied.retry_after, Some(1));

        // 600 ms refills 1.2 tokens; the third request lands and fills the
        // window to its limit of 3 (the two T0 entries are still inside it).
        clock.advance(600);
        let third = controller.check_identity(&identity, "/api/test", false);
        assert!(third.allowed);
        assert_eq!(third.remaining, 0);
        assert_eq!(third.reset_at, T0 + 1_000);
    }

    #[test]
    fn window_scenario_rejects_with_reset_of_oldest_entry() {
        let clock = ManualClock::new(T0);
        let controller = controller(&clock);
        let identity = anon();

        for _ in 0..3 {
            assert!(controller.check_identity(&identity, "/api/bulk", false).allowed);
        }

        // Fourth request inside the same window is quota-rejected; capacity
        // frees up one window after the first recorded request.
        let denied = controller.check_identity(&identity, "/api/bulk", false);
        assert!(!denied.allowed);
        assert_eq!(denied.reset_at, T0 + 1_000);
        assert_eq!(denied.retry_after, Some(1));

        clock.advance(1_001);
        assert!(controller.check_identity(&identity, "/api/bulk", false).allowed);
    }

    #[test]
    fn check_resolves_identity_from_headers() {
        let clock = ManualClock::new(T0);
        let controller = controller(&clock);
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", http::HeaderValue::from_static("9.9.9.9"));

        let decision = controller.check(&headers, "/api/test", None);
        assert!(decision.allowed);
        assert_eq!(controller.windows.recorded("anon:9.9.9.9:/api/test"), 1);
    }

    #[test]
    fn purge_returns_stats_to_baseline() {
        let clock = ManualClock::new(T0);
        let controller = controller(&clock);
        controller.check_identity(&anon(), "/api/test", false);
        assert_eq!(controller.stats().total_buckets, 1);
        assert_eq!(controller.stats().total_logs, 1);

        clock.advance(10 * 60 * 1_000);
        let (buckets, logs) = controller.purge_stale(Duration::from_secs(600));
        assert_eq!((buckets, logs), (1, 1));

        let stats = controller.stats();
        assert_eq!(stats.total_buckets, 0);
        assert_eq!(stats.total_logs, 0);
        assert_eq!(stats.approx_memory_kb, 0.0);
    }

    #[test]
    fn clear_resets_state_and_counters() {
        let clock = ManualClock::new(T0);
        let controller = controller(&clock);
        let identity = anon();
        for _ in 0..3 {
            controller.check_identity(&identity, "/api/test", false);
        }
        assert!(controller.metrics().rejected() > 0 || controller.metrics().allowed > 0);

        controller.clear();
        assert_eq!(controller.stats().total_buckets, 0);
        assert_eq!(controller.metrics().allowed, 0);
        assert_eq!(controller.metrics().rejected(), 0);
    }

    #[test]
    fn metrics_attribute_rejections_to_the_right_guard() {
        let clock = ManualClock::new(T0);
        let controller = controller(&clock);
        let identity = anon();

        // Two allowed, one burst-rejected.
        controller.check_identity(&identity, "/api/test", false);
        controller.check_identity(&identity, "/api/test", false);
        controller.check_identity(&identity, "/api/test", false);

        // Three allowed, one window-rejected.
        for _ in 0..4 {
            controller.check_identity(&identity, "/api/bulk", false);
        }

        let snap = controller.metrics();
        assert_eq!(snap.allowed, 5);
        assert_eq!(snap.rejected_burst, 1);
        assert_eq!(snap.rejected_window, 1);
    }

    #[tokio::test]
    async fn sweeper_evicts_idle_state() {
        let clock = ManualClock::new(T0);
        let controller = Arc::new(controller(&clock));
        controller.check_identity(&anon(), "/api/test", false);

        clock.advance(20 * 60 * 1_000);
        let handle = controller.spawn_sweeper(Duration::from_millis(10), Duration::from_secs(600));

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert_eq!(controller.stats().total_buckets, 0);
        assert_eq!(controller.stats().total_logs, 0);
    }
}
