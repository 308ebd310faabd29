use std::collections::BTreeMap;
use std::time::Duration;

/// Retry behaviour for failed endpoint requests.
///
/// Only transport failures are retried, and always before anything from the
/// batch is merged, so a retried batch can never append rows twice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per batch, including the first one. `1` disables retries.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for the exponentially growing delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Exponential backoff starting at `initial_backoff`, doubling up to `max_backoff`.
    pub fn exponential(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Configuration options supplied when creating a [`super::DataSource`].
#[derive(Clone, Debug)]
pub struct DataSourceOptions {
    /// Rows requested per parent when a level is first fetched.
    pub page_size: usize,
    /// Per-level overrides of `page_size`, keyed by 1-based level.
    pub level_page_sizes: BTreeMap<usize, usize>,
    /// Retry policy for failed batches.
    pub retry: RetryPolicy,
}

impl DataSourceOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self {
            page_size: 20,
            level_page_sizes: BTreeMap::new(),
            retry: RetryPolicy::none(),
        }
    }

    /// Sets the default first-page size.
    pub fn page_size(mut self, rows: usize) -> Self {
        self.page_size = rows.max(1);
        self
    }

    /// Overrides the first-page size for one level.
    pub fn level_page_size(mut self, level: usize, rows: usize) -> Self {
        self.level_page_sizes.insert(level, rows.max(1));
        self
    }

    /// Sets the retry policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// First-page size for `level`.
    pub fn page_size_for(&self, level: usize) -> usize {
        self.level_page_sizes
            .get(&level)
            .copied()
            .unwrap_or(self.page_size)
    }
}

impl Default for DataSourceOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_overrides_fall_back_to_default() {
        let opts = DataSourceOptions::default().page_size(50).level_page_size(3, 5);
        assert_eq!(opts.page_size_for(1), 50);
        assert_eq!(opts.page_size_for(3), 5);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy =
            RetryPolicy::exponential(5, Duration::from_millis(10), Duration::from_millis(35));
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(35));
        assert_eq!(policy.backoff(40), Duration::from_millis(35));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::exponential(0, Duration::ZERO, Duration::ZERO).max_attempts, 1);
    }
}
