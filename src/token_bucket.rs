//! Token bucket burst guard with lazy elapsed-time refill.

use dashmap::DashMap;

/// Outcome of a burst-guard check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstOutcome {
    /// Whether a whole token was consumed.
    pub allowed: bool,
    /// Whole tokens left in the bucket after this check.
    pub remaining: u32,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    last_refill: u64,
}

/// Keyed store of token buckets.
///
/// Refill is computed lazily from elapsed time on each check; no ticking
/// task is involved. Tokens are a continuous quantity so fractional refill
/// accumulates between checks, but consumption is always exactly one whole
/// token. The invariant `0 <= tokens <= max_tokens` holds after every call.
///
/// Each check is a single read-modify-write under the map's per-shard lock,
/// so concurrent requests against the same key never lose updates.
#[derive(Debug, Default)]
pub struct TokenBucketStore {
    buckets: DashMap<String, BucketState>,
}

impl TokenBucketStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to consume one token from `key`'s bucket.
    ///
    /// Buckets start full, so the first `max_tokens` checks on an idle key
    /// all pass. Never errors; a denial is a value.
    pub fn try_consume(
        &self,
        key: &str,
        max_tokens: u32,
        refill_per_ms: f64,
        now_ms: u64,
    ) -> BurstOutcome {
        let max = f64::from(max_tokens);
        let mut bucket = self
            .buckets
            .entry(key.to_owned())
            .or_insert(BucketState { tokens: max, last_refill: now_ms });

        let elapsed = now_ms.saturating_sub(bucket.last_refill) as f64;
        bucket.tokens = (bucket.tokens + elapsed * refill_per_ms).min(max);
        bucket.last_refill = now_ms;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            BurstOutcome { allowed: true, remaining: bucket.tokens as u32 }
        } else {
            BurstOutcome { allowed: false, remaining: 0 }
        }
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no buckets are tracked.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop all buckets.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    /// Evict buckets untouched for at least `max_idle_ms`. Returns how many
    /// were removed.
    pub fn purge_idle(&self, now_ms: u64, max_idle_ms: u64) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, state| now_ms.saturating_sub(state.last_refill) < max_idle_ms);
        before.saturating_sub(self.buckets.len())
    }

    pub(crate) fn approx_bytes(&self) -> usize {
        self.buckets
            .iter()
            .map(|entry| entry.key().len() + std::mem::size_of::<BucketState>())
            .sum()
    }
}
