//! In-process TTL cache shared by resolved menus, tools config, and
//! permission checks.
//!
//! Expired entries are evicted lazily on access; [`CacheLayer::clear_expired`]
//! sweeps eagerly for callers that want periodic cleanup. Writes are
//! last-writer-wins per key and there is no cross-key transaction: a reader
//! may observe a fresh menu snapshot next to a stale tools snapshot.

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::metrics::Metrics;

/// Default TTL (5 minutes).
const DEFAULT_TTL_SECS: u64 = 300;

/// Maximum number of entries.
const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Hit rate below which the cache reports itself unhealthy.
const DEFAULT_HEALTH_THRESHOLD: f64 = 0.5;

/// Lookups required before health is judged.
const DEFAULT_MIN_SAMPLES: u64 = 20;

/// Cache tuning knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL used when a caller passes a zero TTL.
    pub default_ttl: Duration,
    /// Entry count bound.
    pub max_entries: usize,
    /// Minimum healthy hit rate (0.0 - 1.0).
    pub health_threshold: f64,
    /// Minimum lookups before the hit rate is meaningful.
    pub min_samples: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            max_entries: DEFAULT_MAX_ENTRIES,
            health_threshold: DEFAULT_HEALTH_THRESHOLD,
            min_samples: DEFAULT_MIN_SAMPLES,
        }
    }
}

/// A stored value with its insertion time.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    inserted_at_ms: u64,
    ttl_ms: u64,
}

impl CacheEntry {
    /// Expired once strictly more than `ttl` has elapsed.
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.inserted_at_ms) > self.ttl_ms
    }
}

/// TTL cache layer.
///
/// Clone is cheap; all clones share the same store and counters.
#[derive(Clone)]
pub struct CacheLayer {
    inner: Arc<CacheLayerInner>,
}

struct CacheLayerInner {
    entries: DashMap<String, CacheEntry>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

impl CacheLayer {
    /// Create a cache backed by the system clock.
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a cache with an explicit clock.
    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self::build(config, clock, None)
    }

    /// Create a cache that also reports hits and misses to Prometheus.
    pub fn with_metrics(config: CacheConfig, clock: Arc<dyn Clock>, metrics: Arc<Metrics>) -> Self {
        Self::build(config, clock, Some(metrics))
    }

    fn build(config: CacheConfig, clock: Arc<dyn Clock>, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            inner: Arc::new(CacheLayerInner {
                entries: DashMap::new(),
                config,
                clock,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                metrics,
            }),
        }
    }

    /// Get a value.
    ///
    /// An expired entry counts as a miss and is evicted on the spot.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = self.inner.clock.now_ms();

        let value = match self.inner.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
            Some(_) => None,
            None => {
                self.record_miss();
                return None;
            }
        };

        match value {
            Some(v) => {
                self.record_hit();
                debug!(key = %key, "cache hit");
                Some(v)
            }
            None => {
                self.inner
                    .entries
                    .remove_if(key, |_, entry| entry.is_expired(now));
                self.record_miss();
                debug!(key = %key, "cache entry expired, evicted");
                None
            }
        }
    }

    /// Get and decode a JSON value.
    ///
    /// Undecodable entries are evicted and reported as misses.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key = %key, error = %e, "discarding undecodable cache entry");
                self.inner.entries.remove(key);
                None
            }
        }
    }

    /// Store a value. A zero `ttl` uses the configured default.
    pub fn set(&self, key: &str, value: impl Into<String>, ttl: Duration) -> Result<(), CacheError> {
        let ttl = if ttl.is_zero() {
            self.inner.config.default_ttl
        } else {
            ttl
        };

        if !self.inner.entries.contains_key(key)
            && self.inner.entries.len() >= self.inner.config.max_entries
        {
            self.clear_expired();
            if self.inner.entries.len() >= self.inner.config.max_entries {
                warn!(key = %key, capacity = self.inner.config.max_entries, "cache full");
                return Err(CacheError::CapacityExceeded {
                    key: key.to_string(),
                    capacity: self.inner.config.max_entries,
                });
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        let entry = CacheEntry {
            value: value.into(),
            inserted_at_ms: self.inner.clock.now_ms(),
            ttl_ms: ttl.as_millis() as u64,
        };
        let ttl_ms = entry.ttl_ms;
        self.inner.entries.insert(key.to_string(), entry);

        debug!(key = %key, ttl_ms, "cache set");
        Ok(())
    }

    /// Encode a value as JSON and store it.
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value).map_err(|e| CacheError::Encoding {
            key: key.to_string(),
            details: e.to_string(),
        })?;
        self.set(key, raw, ttl)
    }

    /// Remove a single key. Returns whether it was present.
    pub fn invalidate_key(&self, key: &str) -> bool {
        self.inner.entries.remove(key).is_some()
    }

    /// Remove every key matching `pattern`, returning how many were removed.
    ///
    /// See [`KeyPattern::parse`] for the accepted syntax. Matching scans all
    /// keys.
    pub fn invalidate(&self, pattern: &str) -> Result<usize, CacheError> {
        let pattern = KeyPattern::parse(pattern)?;
        let before = self.inner.entries.len();
        self.inner.entries.retain(|key, _| !pattern.matches(key));
        let removed = before.saturating_sub(self.inner.entries.len());

        debug!(pattern = ?pattern, removed, "cache pattern invalidated");
        Ok(removed)
    }

    /// Eagerly drop every expired entry.
    pub fn clear_expired(&self) -> usize {
        let now = self.inner.clock.now_ms();
        let before = self.inner.entries.len();
        self.inner.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.inner.entries.len());
        if removed > 0 {
            debug!(removed, "expired cache entries cleared");
        }
        removed
    }

    /// Drop everything and reset counters.
    pub fn clear(&self) {
        self.inner.entries.clear();
        self.inner.hits.store(0, Ordering::Relaxed);
        self.inner.misses.store(0, Ordering::Relaxed);
    }

    /// Hit/miss counters and current size.
    pub fn stats(&self) -> CacheStats {
        let hit_count = self.inner.hits.load(Ordering::Relaxed);
        let miss_count = self.inner.misses.load(Ordering::Relaxed);
        CacheStats {
            hit_count,
            miss_count,
            hit_rate: hit_rate(hit_count, miss_count),
            size: self.inner.entries.len(),
        }
    }

    /// Informational health status. Never affects reads or writes.
    pub fn health(&self) -> CacheHealth {
        let stats = self.stats();
        let samples = stats.hit_count + stats.miss_count;
        let threshold = self.inner.config.health_threshold;
        let healthy = samples < self.inner.config.min_samples || stats.hit_rate >= threshold;

        CacheHealth {
            healthy,
            hit_rate: stats.hit_rate,
            samples,
            threshold,
        }
    }

    fn record_hit(&self) {
        self.inner.hits.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_cache_hit();
        }
    }

    fn record_miss(&self) {
        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_cache_miss();
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer")
            .field("size", &self.inner.entries.len())
            .finish()
    }
}

/// Cache statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Lookups that returned a live entry.
    pub hit_count: u64,

    /// Lookups that found nothing or an expired entry.
    pub miss_count: u64,

    /// `hit_count / (hit_count + miss_count)`, 0.0 before any lookup.
    pub hit_rate: f64,

    /// Stored entries, including expired ones not yet evicted.
    pub size: usize,
}

/// Cache health snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheHealth {
    pub healthy: bool,
    pub hit_rate: f64,
    pub samples: u64,
    pub threshold: f64,
}

/// Key filter for bulk invalidation.
#[derive(Debug, Clone)]
pub enum KeyPattern {
    /// Keys starting with the given text.
    Prefix(String),
    /// Keys matching the regular expression anywhere.
    Regex(Regex),
}

impl KeyPattern {
    /// Parse a pattern.
    ///
    /// - `/expr/` is a regular expression
    /// - `prefix*` matches keys starting with `prefix` (`*` alone matches all)
    /// - anything else is treated as a literal prefix
    pub fn parse(pattern: &str) -> Result<Self, CacheError> {
        if pattern.len() >= 2 && pattern.starts_with('/') && pattern.ends_with('/') {
            let expr = &pattern[1..pattern.len() - 1];
            let re = Regex::new(expr).map_err(|e| CacheError::InvalidPattern {
                pattern: pattern.to_string(),
                details: e.to_string(),
            })?;
            return Ok(Self::Regex(re));
        }

        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        Ok(Self::Prefix(prefix.to_string()))
    }

    /// Whether `key` matches.
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
            Self::Regex(re) => re.is_match(key),
        }
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn cache_with_clock() -> (CacheLayer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = CacheLayer::with_clock(CacheConfig::default(), clock.clone());
        (cache, clock)
    }

    #[test]
    fn set_then_get_round_trips() {
        let (cache, _) = cache_with_clock();
        cache.set("menu:config:student", "[]", Duration::from_secs(10)).unwrap();
        assert_eq!(cache.get("menu:config:student").as_deref(), Some("[]"));
    }

    #[test]
    fn expired_entry_is_a_miss_and_evicted() {
        let (cache, clock) = cache_with_clock();
        cache.set("k", "v", Duration::from_secs(5)).unwrap();

        clock.advance(Duration::from_secs(5));
        assert_eq!(cache.get("k").as_deref(), Some("v"));

        clock.advance(Duration::from_millis(1));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn zero_ttl_uses_default() {
        let (cache, clock) = cache_with_clock();
        cache.set("k", "v", Duration::ZERO).unwrap();
        clock.advance(Duration::from_secs(DEFAULT_TTL_SECS));
        assert!(cache.get("k").is_some());
        clock.advance(Duration::from_secs(1));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn invalidate_by_glob_prefix() {
        let (cache, _) = cache_with_clock();
        cache.set("perm:student:a", "true", Duration::ZERO).unwrap();
        cache.set("perm:student:b", "false", Duration::ZERO).unwrap();
        cache.set("menu:version", "3", Duration::ZERO).unwrap();

        assert_eq!(cache.invalidate("perm:*").unwrap(), 2);
        assert!(cache.get("menu:version").is_some());
    }

    #[test]
    fn invalidate_by_regex() {
        let (cache, _) = cache_with_clock();
        cache.set("menu:config:student", "[]", Duration::ZERO).unwrap();
        cache.set("menu:tools:student", "[]", Duration::ZERO).unwrap();
        cache.set("menu:config:teacher", "[]", Duration::ZERO).unwrap();

        assert_eq!(cache.invalidate("/:student$/").unwrap(), 2);
        assert_eq!(cache.stats().size, 1);
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let (cache, _) = cache_with_clock();
        assert!(matches!(
            cache.invalidate("/(unclosed/"),
            Err(CacheError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn clear_expired_sweeps_only_expired() {
        let (cache, clock) = cache_with_clock();
        cache.set("short", "1", Duration::from_secs(1)).unwrap();
        cache.set("long", "2", Duration::from_secs(60)).unwrap();
        clock.advance(Duration::from_secs(2));

        assert_eq!(cache.clear_expired(), 1);
        assert!(cache.get("long").is_some());
    }

    #[test]
    fn full_cache_rejects_new_keys_but_accepts_overwrites() {
        let clock = Arc::new(ManualClock::new(0));
        let config = CacheConfig {
            max_entries: 2,
            ..CacheConfig::default()
        };
        let cache = CacheLayer::with_clock(config, clock.clone());
        cache.set("a", "1", Duration::from_secs(1)).unwrap();
        cache.set("b", "2", Duration::from_secs(60)).unwrap();

        assert!(matches!(
            cache.set("c", "3", Duration::ZERO),
            Err(CacheError::CapacityExceeded { .. })
        ));
        cache.set("b", "22", Duration::ZERO).unwrap();

        // Expired entries are swept to make room.
        clock.advance(Duration::from_secs(2));
        cache.set("c", "3", Duration::ZERO).unwrap();
    }

    #[test]
    fn stats_and_health() {
        let clock = Arc::new(ManualClock::new(0));
        let config = CacheConfig {
            min_samples: 4,
            ..CacheConfig::default()
        };
        let cache = CacheLayer::with_clock(config, clock);
        cache.set("k", "v", Duration::ZERO).unwrap();

        assert!(cache.get("missing").is_none());
        assert!(cache.health().healthy, "too few samples to judge");

        assert!(cache.get("missing").is_none());
        assert!(cache.get("missing").is_none());
        assert!(cache.get("k").is_some());

        let stats = cache.stats();
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 3);
        assert!((stats.hit_rate - 0.25).abs() < f64::EPSILON);
        assert!(!cache.health().healthy);
    }

    #[test]
    fn json_helpers() {
        let (cache, _) = cache_with_clock();
        cache.set_json("v", &vec![1u64, 2, 3], Duration::ZERO).unwrap();
        assert_eq!(cache.get_json::<Vec<u64>>("v"), Some(vec![1, 2, 3]));

        cache.set("bad", "not json", Duration::ZERO).unwrap();
        assert!(cache.get_json::<Vec<u64>>("bad").is_none());
        assert!(!cache.invalidate_key("bad"));
    }

    #[test]
    fn key_pattern_parsing() {
        assert!(KeyPattern::parse("*").unwrap().matches("anything"));
        assert!(KeyPattern::parse("menu:").unwrap().matches("menu:version"));
        assert!(!KeyPattern::parse("menu:*").unwrap().matches("perm:x"));
        assert!(KeyPattern::parse("/^perm:.*:all$/").unwrap().matches("perm:a:all"));
    }
}
