//! Sliding window quota: a pruned log of request timestamps per key.

use std::collections::VecDeque;

use dashmap::DashMap;

/// Outcome of a window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Whether the request fit inside the rolling quota.
    pub allowed: bool,
    /// Requests left in the current window after this check.
    pub remaining: u32,
    /// Epoch milliseconds at which the oldest counted request expires.
    pub reset_at: u64,
}

/// Keyed store of sliding-window request logs.
///
/// Each log holds the timestamps of admitted requests inside the trailing
/// window; entries are pruned lazily on every check, so log length always
/// equals the request count attributed to that key. Denied requests are
/// never recorded: an attacker hammering an exhausted key cannot hold its
/// quota down with requests that were turned away.
#[derive(Debug, Default)]
pub struct SlidingWindowStore {
    logs: DashMap<String, VecDeque<u64>>,
}

impl SlidingWindowStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request against `key`'s rolling window, if it fits.
    ///
    /// An entry aged exactly `window_ms` no longer counts: expiry is
    /// inclusive, which keeps a request from being double counted at the
    /// window edge.
    pub fn try_record(&self, key: &str, limit: u32, window_ms: u64, now_ms: u64) -> WindowOutcome {
        let mut log = self.logs.entry(key.to_owned()).or_default();

        if let Some(cutoff) = now_ms.checked_sub(window_ms) {
            while log.front().is_some_and(|&ts| ts <= cutoff) {
                log.pop_front();
            }
        }

        if log.len() < limit as usize {
            log.push_back(now_ms);
            WindowOutcome {
                allowed: true,
                remaining: limit - log.len() as u32,
                reset_at: log.front().copied().unwrap_or(now_ms) + window_ms,
            }
        } else {
            WindowOutcome {
                allowed: false,
                remaining: 0,
                reset_at: log.front().copied().unwrap_or(now_ms) + window_ms,
            }
        }
    }

    /// Number of live logs.
    pub fn len(&self) -> usize {
        self.logs.len()
    }

    /// Whether no logs are tracked.
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    /// Drop all logs.
    pub fn clear(&self) {
        self.logs.clear();
    }

    /// Evict logs that are empty or whose newest entry is older than
    /// `max_idle_ms`. Returns how many were removed.
    pub fn purge_idle(&self, now_ms: u64, max_idle_ms: u64) -> usize {
        let before = self.logs.len();
        self.logs
            .retain(|_, log| log.back().is_some_and(|&newest| now_ms.saturating_sub(newest) < max_idle_ms));
        before.saturating_sub(self.logs.len())
    }

    /// Observed log length for a key (0 when absent).
    #[cfg(test)]
    pub(crate) fn recorded(&self, key: &str) -> usize {
        self.logs.get(key).map_or(0, |log| log.len())
    }

    pub(crate) fn approx_bytes(&self) -> usize {
        self.logs
            .iter()
            .map(|entry| entry.key().len() + entry.value().capacity() * std::mem::size_of::<u64>())
            .sum()
    }
}
