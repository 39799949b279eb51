//! Prometheus export of engine statistics
//!
//! Components keep plain atomic counters; the collector copies a snapshot of
//! them into a private registry whenever `/metrics` is scraped.

use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};

use crate::engine::EngineStats;
use crate::error::{Error, Result};

fn metric_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {e}"))
}

struct Counters {
    cache_accesses: IntCounter,
    cache_misses: IntCounter,
    cache_evictions: IntCounter,
    cache_sync_waits: IntCounter,
    local_flushes: IntCounter,
    local_bytes_flushed: IntCounter,
    local_flush_failures: IntCounter,
    local_evictions: IntCounter,
    local_capacity_rejections: IntCounter,
    uploads_completed: IntCounter,
    upload_failures: IntCounter,
    bytes_uploaded: IntCounter,
    durable_loads: IntCounter,
    coalesced_appends: IntCounter,
    coalesce_cycles: IntCounter,
}

struct Gauges {
    cache_entries: IntGauge,
    cache_referenced: IntGauge,
    cache_hit_ratio: Gauge,
    pool_free: IntGauge,
    local_resident: IntGauge,
    local_free_slots: IntGauge,
    local_queue_depth: IntGauge,
    open_handles: IntGauge,
    uploads_pending: IntGauge,
    armed_segments: IntGauge,
}

/// Registry mirroring [`EngineStats`]
pub struct EngineCollector {
    registry: Registry,
    counters: Counters,
    gauges: Gauges,
}

impl EngineCollector {
    /// Create and register every metric
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::new(format!("strata_{name}"), help).map_err(metric_err)?;
            registry.register(Box::new(c.clone())).map_err(metric_err)?;
            Ok(c)
        };
        let counters = Counters {
            cache_accesses: counter("cache_accesses_total", "Cache lookups")?,
            cache_misses: counter("cache_misses_total", "Cache lookups that created an entry")?,
            cache_evictions: counter("cache_evictions_total", "Blocks evicted from the cache")?,
            cache_sync_waits: counter(
                "cache_sync_waits_total",
                "Admissions that waited for a dirty block",
            )?,
            local_flushes: counter("local_flushes_total", "Local write-back flushes")?,
            local_bytes_flushed: counter("local_flushed_bytes_total", "Bytes written locally")?,
            local_flush_failures: counter("local_flush_failures_total", "Failed local flushes")?,
            local_evictions: counter("local_evictions_total", "Local files deleted")?,
            local_capacity_rejections: counter(
                "local_capacity_rejections_total",
                "Slot requests refused for lack of space",
            )?,
            uploads_completed: counter("uploads_total", "Durable uploads completed")?,
            upload_failures: counter("upload_failures_total", "Failed upload attempts")?,
            bytes_uploaded: counter("uploaded_bytes_total", "Bytes uploaded to the durable tier")?,
            durable_loads: counter("durable_loads_total", "Loads from the durable tier")?,
            coalesced_appends: counter("coalescer_appends_total", "Appends through the coalescer")?,
            coalesce_cycles: counter(
                "coalescer_cycles_total",
                "Acquire/release cycles of the coalescer",
            )?,
        };

        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let g = IntGauge::new(format!("strata_{name}"), help).map_err(metric_err)?;
            registry.register(Box::new(g.clone())).map_err(metric_err)?;
            Ok(g)
        };
        let hit_ratio = Gauge::new("strata_cache_hit_ratio", "Cache hit ratio").map_err(metric_err)?;
        registry
            .register(Box::new(hit_ratio.clone()))
            .map_err(metric_err)?;
        let gauges = Gauges {
            cache_entries: gauge("cache_entries", "Cached blocks")?,
            cache_referenced: gauge("cache_referenced", "Cached blocks currently pinned")?,
            cache_hit_ratio: hit_ratio,
            pool_free: gauge("segment_pool_free", "Free segment buffers")?,
            local_resident: gauge("local_resident_files", "Local files holding a slot")?,
            local_free_slots: gauge("local_free_slots", "Free local slots")?,
            local_queue_depth: gauge("local_queue_depth", "Blocks waiting for write-back")?,
            open_handles: gauge("local_open_handles", "Cached open file handles")?,
            uploads_pending: gauge("uploads_pending", "Blocks with an unconfirmed upload")?,
            armed_segments: gauge("coalescer_armed", "Segments held by the coalescer")?,
        };

        Ok(Self {
            registry,
            counters,
            gauges,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Copy a stats snapshot into the registry
    pub fn update(&self, stats: &EngineStats) {
        let c = &self.counters;
        advance(&c.cache_accesses, stats.cache.accesses);
        advance(&c.cache_misses, stats.cache.misses);
        advance(&c.cache_evictions, stats.cache.evictions);
        advance(&c.cache_sync_waits, stats.cache.sync_waits);
        advance(&c.local_flushes, stats.local.flushes);
        advance(&c.local_bytes_flushed, stats.local.bytes_flushed);
        advance(&c.local_flush_failures, stats.local.flush_failures);
        advance(&c.local_evictions, stats.local.evictions);
        advance(&c.local_capacity_rejections, stats.local.capacity_rejections);
        advance(&c.uploads_completed, stats.global.uploads_completed);
        advance(&c.upload_failures, stats.global.upload_failures);
        advance(&c.bytes_uploaded, stats.global.bytes_uploaded);
        advance(&c.durable_loads, stats.global.loads);
        advance(&c.coalesced_appends, stats.coalescer.appends);
        advance(&c.coalesce_cycles, stats.coalescer.cycles);

        let g = &self.gauges;
        g.cache_entries.set(stats.cache.entries as i64);
        g.cache_referenced.set(stats.cache.referenced as i64);
        g.cache_hit_ratio.set(stats.cache.hit_ratio());
        g.pool_free.set(stats.pool.free as i64);
        g.local_resident.set(stats.local.resident as i64);
        g.local_free_slots.set(stats.local.available_slots as i64);
        g.local_queue_depth.set(stats.local.queue_depth as i64);
        g.open_handles.set(stats.local.handles.open_handles as i64);
        g.uploads_pending.set(stats.global.pending as i64);
        g.armed_segments.set(stats.coalescer.armed as i64);
    }

    /// Render the registry in the text exposition format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_err)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics: {e}")))
    }
}

/// Move a counter up to an absolute value taken from a snapshot
fn advance(counter: &IntCounter, value: u64) {
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}
