//! Process-lifetime TTL cache shared by the history fetcher and the orchestrator.
//!
//! Values are stored as serialised JSON so a single store can hold bundles, pages and
//! arbitrary consumer data, and so `entry_info` can report an accurate payload size.

use crate::error::DataError;
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Serialize, de::DeserializeOwned};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    size: usize,
    written_at: Instant,
    written_at_utc: DateTime<Utc>,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.written_at) > self.ttl
    }
}

/// Observability data for a single live cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub timestamp: DateTime<Utc>,
    pub size: usize,
}

/// Lookup counters since the store was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
struct Inner {
    entries: FnvHashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

/// TTL key/value store with pattern based bulk eviction.
///
/// Every operation holds the lock for its own duration only, so each call is atomic and no
/// caller can observe a half-applied write.
#[derive(Debug, Default)]
pub struct CacheStore {
    inner: Mutex<Inner>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the value stored under `key`.
    ///
    /// Absent and expired entries both yield `None`; an expired entry is evicted on the way out.
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let lookup = inner
            .entries
            .get(key)
            .map(|entry| (entry.is_expired(now), entry.value.clone()));

        let value = match lookup {
            Some((false, value)) => value,
            Some((true, _)) => {
                debug!(key, "cache entry expired");
                inner.entries.remove(key);
                inner.misses += 1;
                return None;
            }
            None => {
                inner.misses += 1;
                return None;
            }
        };

        match serde_json::from_value(value) {
            Ok(value) => {
                inner.hits += 1;
                Some(value)
            }
            Err(error) => {
                warn!(key, %error, "cache entry has unexpected shape, evicting");
                inner.entries.remove(key);
                inner.misses += 1;
                None
            }
        }
    }

    /// Store `value` under `key` for `ttl`, replacing any previous entry.
    pub fn set<T>(&self, key: impl Into<String>, value: &T, ttl: Duration) -> Result<(), DataError>
    where
        T: Serialize + ?Sized,
    {
        let value =
            serde_json::to_value(value).map_err(|error| DataError::Cache(error.to_string()))?;
        let size = serde_json::to_vec(&value)
            .map(|bytes| bytes.len())
            .map_err(|error| DataError::Cache(error.to_string()))?;

        let entry = CacheEntry {
            value,
            size,
            written_at: Instant::now(),
            written_at_utc: Utc::now(),
            ttl,
        };

        self.inner.lock().entries.insert(key.into(), entry);
        Ok(())
    }

    /// Remove a single key, returning whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().entries.remove(key).is_some()
    }

    /// Remove every key matching `pattern` in one pass, returning how many were removed.
    pub fn delete_by_pattern(&self, pattern: &Regex) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !pattern.is_match(key));
        let removed = before - inner.entries.len();

        debug!(pattern = pattern.as_str(), removed, "cache invalidated by pattern");
        removed
    }

    /// Write time and serialised size of a live entry.
    pub fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        let now = Instant::now();
        let inner = self.inner.lock();

        inner
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| EntryInfo {
                timestamp: entry.written_at_utc,
                size: entry.size,
            })
    }

    /// Eagerly drop every expired entry.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired(now));
        before - inner.entries.len()
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            entries: inner.entries.len(),
        }
    }
}

/// Regex matching every cached page of a history key.
pub fn page_pattern(key: &str) -> Result<Regex, DataError> {
    Regex::new(&format!("^{}-page-\\d+$", regex::escape(key)))
        .map_err(|error| DataError::Cache(error.to_string()))
}
