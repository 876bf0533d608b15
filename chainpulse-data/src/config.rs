use crate::retry::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, RetryPolicy};
use std::{str::FromStr, time::Duration};
use tracing::warn;

/// Default number of points requested per history page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Default time-to-live of a cached history page (5 minutes).
pub const DEFAULT_HISTORY_TTL: Duration = Duration::from_secs(5 * 60);

/// Default debounce window applied to manual refreshes.
pub const DEFAULT_REFRESH_DEBOUNCE: Duration = Duration::from_millis(500);

/// Default interval of the automatic background refresh (1 minute).
pub const DEFAULT_AUTO_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Longest accepted automatic refresh interval (1 day).
pub const MAX_AUTO_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default percentage deviation from baseline that counts as a spike.
pub const DEFAULT_SPIKE_THRESHOLD_PERCENT: f64 = 10.0;

/// Configuration of the history fetcher and aggregation orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct DataConfig {
    /// Retry policy of category fetches and initial history loads
    pub retry: RetryPolicy,
    /// Points requested per history page
    pub page_size: usize,
    /// Cache time-to-live of a history page
    pub history_ttl: Duration,
    /// Window during which repeated manual refreshes collapse into one
    pub refresh_debounce: Duration,
    /// Interval of the automatic background refresh
    pub auto_refresh_interval: Duration,
    /// Percentage deviation from baseline that counts as a spike
    pub spike_threshold_percent: f64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            page_size: DEFAULT_PAGE_SIZE,
            history_ttl: DEFAULT_HISTORY_TTL,
            refresh_debounce: DEFAULT_REFRESH_DEBOUNCE,
            auto_refresh_interval: DEFAULT_AUTO_REFRESH_INTERVAL,
            spike_threshold_percent: DEFAULT_SPIKE_THRESHOLD_PERCENT,
        }
    }
}

impl DataConfig {
    /// Build a configuration from defaults overridden by environment variables:
    ///
    /// | variable                               | default |
    /// |----------------------------------------|---------|
    /// | `CHAINPULSE_RETRY_COUNT`               | 3       |
    /// | `CHAINPULSE_RETRY_BASE_DELAY_MS`       | 1000    |
    /// | `CHAINPULSE_PAGE_SIZE`                 | 100     |
    /// | `CHAINPULSE_HISTORY_TTL_SECS`          | 300     |
    /// | `CHAINPULSE_REFRESH_DEBOUNCE_MS`       | 500     |
    /// | `CHAINPULSE_AUTO_REFRESH_SECS`         | 60      |
    /// | `CHAINPULSE_SPIKE_THRESHOLD_PERCENT`   | 10.0    |
    pub fn from_env() -> Self {
        Self {
            retry: RetryPolicy::new(
                env_or("CHAINPULSE_RETRY_COUNT", DEFAULT_MAX_ATTEMPTS),
                Duration::from_millis(env_or(
                    "CHAINPULSE_RETRY_BASE_DELAY_MS",
                    DEFAULT_BASE_DELAY.as_millis() as u64,
                )),
            ),
            page_size: env_or("CHAINPULSE_PAGE_SIZE", DEFAULT_PAGE_SIZE),
            history_ttl: Duration::from_secs(env_or(
                "CHAINPULSE_HISTORY_TTL_SECS",
                DEFAULT_HISTORY_TTL.as_secs(),
            )),
            refresh_debounce: Duration::from_millis(env_or(
                "CHAINPULSE_REFRESH_DEBOUNCE_MS",
                DEFAULT_REFRESH_DEBOUNCE.as_millis() as u64,
            )),
            auto_refresh_interval: Duration::from_secs(env_or(
                "CHAINPULSE_AUTO_REFRESH_SECS",
                DEFAULT_AUTO_REFRESH_INTERVAL.as_secs(),
            ))
            .min(MAX_AUTO_REFRESH_INTERVAL),
            spike_threshold_percent: env_or(
                "CHAINPULSE_SPIKE_THRESHOLD_PERCENT",
                DEFAULT_SPIKE_THRESHOLD_PERCENT,
            ),
        }
    }

    /// Set retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set history page size
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Set history page time-to-live
    pub fn with_history_ttl(mut self, ttl: Duration) -> Self {
        self.history_ttl = ttl;
        self
    }

    /// Set manual refresh debounce window
    pub fn with_refresh_debounce(mut self, debounce: Duration) -> Self {
        self.refresh_debounce = debounce;
        self
    }

    /// Set automatic refresh interval, capped at [`MAX_AUTO_REFRESH_INTERVAL`]
    pub fn with_auto_refresh_interval(mut self, interval: Duration) -> Self {
        self.auto_refresh_interval = interval.min(MAX_AUTO_REFRESH_INTERVAL);
        self
    }

    /// Set spike threshold
    pub fn with_spike_threshold_percent(mut self, threshold: f64) -> Self {
        self.spike_threshold_percent = threshold;
        self
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring unparseable environment override");
            default
        }),
        Err(_) => default,
    }
}
