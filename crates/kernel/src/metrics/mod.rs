//! Prometheus metrics collection.
//!
//! Tracks cache effectiveness and menu sync activity in Prometheus format.

use prometheus_client::encoding::{EncodeLabelSet, text::encode};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

/// Sync outcome labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SyncLabels {
    pub outcome: String,
}

/// Push event labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PushLabels {
    pub event: String,
}

/// Application metrics.
pub struct Metrics {
    registry: Registry,

    /// Version syncs by outcome.
    pub syncs: Family<SyncLabels, Counter>,

    /// Version sync duration.
    pub sync_duration_seconds: Histogram,

    /// Full reloads of menu and tools config.
    pub full_reloads: Counter,

    /// Incremental update batches applied.
    pub incremental_updates: Counter,

    /// Incremental update batches that fell back to a full reload.
    pub incremental_fallbacks: Counter,

    /// Push notifications received, by event name.
    pub push_events: Family<PushLabels, Counter>,

    /// Cache hit counter.
    pub cache_hits: Counter,

    /// Cache miss counter.
    pub cache_misses: Counter,
}

impl Metrics {
    /// Create a new metrics registry.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let syncs = Family::<SyncLabels, Counter>::default();
        registry.register("menu_syncs_total", "Menu version syncs", syncs.clone());

        let sync_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 12));
        registry.register(
            "menu_sync_duration_seconds",
            "Menu version sync duration in seconds",
            sync_duration_seconds.clone(),
        );

        let full_reloads = Counter::default();
        registry.register(
            "menu_full_reloads_total",
            "Full reloads of menu and tools config",
            full_reloads.clone(),
        );

        let incremental_updates = Counter::default();
        registry.register(
            "menu_incremental_updates_total",
            "Incremental menu update batches applied",
            incremental_updates.clone(),
        );

        let incremental_fallbacks = Counter::default();
        registry.register(
            "menu_incremental_fallbacks_total",
            "Incremental update batches replaced by a full reload",
            incremental_fallbacks.clone(),
        );

        let push_events = Family::<PushLabels, Counter>::default();
        registry.register(
            "menu_push_events_total",
            "Push notifications received",
            push_events.clone(),
        );

        let cache_hits = Counter::default();
        registry.register("cache_hits_total", "Cache hit count", cache_hits.clone());

        let cache_misses = Counter::default();
        registry.register(
            "cache_misses_total",
            "Cache miss count",
            cache_misses.clone(),
        );

        Self {
            registry,
            syncs,
            sync_duration_seconds,
            full_reloads,
            incremental_updates,
            incremental_fallbacks,
            push_events,
            cache_hits,
            cache_misses,
        }
    }

    /// Record a finished sync.
    pub fn record_sync(&self, outcome: &str, duration_secs: f64) {
        let labels = SyncLabels {
            outcome: outcome.to_string(),
        };
        self.syncs.get_or_create(&labels).inc();
        self.sync_duration_seconds.observe(duration_secs);
    }

    /// Record a full reload.
    pub fn record_full_reload(&self) {
        self.full_reloads.inc();
    }

    /// Record an incremental batch and whether it fell back.
    pub fn record_incremental(&self, fell_back: bool) {
        if fell_back {
            self.incremental_fallbacks.inc();
        } else {
            self.incremental_updates.inc();
        }
    }

    /// Record an inbound push event.
    pub fn record_push(&self, event: &str) {
        let labels = PushLabels {
            event: event.to_string(),
        };
        self.push_events.get_or_create(&labels).inc();
    }

    /// Record a cache hit.
    pub fn record_cache_hit(&self) {
        self.cache_hits.inc();
    }

    /// Record a cache miss.
    pub fn record_cache_miss(&self) {
        self.cache_misses.inc();
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Panics
    ///
    /// Panics if Prometheus metric encoding to a `String` buffer fails.
    /// The `fmt::Write` impl for `String` is infallible.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        // Prometheus encoding to String buffer is infallible
        #[allow(clippy::expect_used)]
        encode(&mut buffer, &self.registry).expect("encoding metrics");
        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish()
    }
}
