// Copyright 2025 Kiln Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::snapshot::{
    BuildMetrics, CacheMetrics, ComponentMetrics, MetricsSnapshot, SandboxMetrics, WatcherMetrics,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Instant;

/// Ten bins per decade, ten decades: 1µs up to ~2.7 hours.
const NUM_HISTOGRAM_BINS: usize = 100;

/// Limits on per-component bookkeeping.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Maximum number of components tracked individually. When exceeded, the
    /// component rendered least recently is dropped from the table.
    pub max_components: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_components: 1000,
        }
    }
}

/// Logarithmic latency histogram.
///
/// Bin `d * 10 + k` holds samples in `[k * 10^d, (k + 1) * 10^d)` for a
/// leading digit `k` in 1..=9, so relative resolution is the same in every
/// decade. Bin 0 holds zero-length samples. Recording is a handful of relaxed
/// atomic adds; percentile queries scan every bin.
#[derive(Debug)]
struct LatencyHistogram {
    bins: [AtomicU64; NUM_HISTOGRAM_BINS],
    total_latency: AtomicU64,
    sample_count: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_latency: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
        }
    }

    fn record(&self, latency_us: u64) {
        self.bins[Self::bin_for(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.total_latency.fetch_add(latency_us, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
    }

    fn bin_for(latency_us: u64) -> usize {
        if latency_us == 0 {
            return 0;
        }
        let decade = latency_us.ilog10() as usize;
        let leading = (latency_us / 10u64.pow(decade as u32)) as usize;
        (decade * 10 + leading).min(NUM_HISTOGRAM_BINS - 1)
    }

    /// Inclusive lower bound of a bin.
    fn lower_bound(bin: usize) -> u64 {
        if bin == 0 {
            return 0;
        }
        let decade = (bin / 10) as u32;
        let leading = (bin % 10).max(1) as u64;
        leading * 10u64.pow(decade)
    }

    fn upper_bound(bin: usize) -> u64 {
        if bin == 0 {
            return 1;
        }
        if bin % 10 == 9 {
            10u64.pow((bin / 10) as u32 + 1)
        } else {
            Self::lower_bound(bin + 1)
        }
    }

    fn percentile(&self, percentile: u64) -> u64 {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        let target = (total * percentile).div_ceil(100).max(1);
        let mut cumulative = 0;
        for (idx, bin) in self.bins.iter().enumerate() {
            let count = bin.load(Ordering::Relaxed);
            if count == 0 {
                continue;
            }
            if cumulative + count >= target {
                let start = Self::lower_bound(idx);
                let end = Self::upper_bound(idx);
                let fraction = (target - cumulative) as f64 / count as f64;
                return start + ((end - start) as f64 * fraction) as u64;
            }
            cumulative += count;
        }

        Self::upper_bound(NUM_HISTOGRAM_BINS - 1)
    }

    /// `(avg, p50, p95, p99)` in microseconds.
    fn summary(&self) -> (u64, u64, u64, u64) {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return (0, 0, 0, 0);
        }
        let avg = self.total_latency.load(Ordering::Relaxed) / total;
        (avg, self.percentile(50), self.percentile(95), self.percentile(99))
    }
}

#[derive(Debug)]
struct ComponentStats {
    render_count: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    latencies: LatencyHistogram,
    /// Registry tick of the most recent render, for eviction order.
    last_render: AtomicU64,
}

impl ComponentStats {
    fn new(tick: u64) -> Self {
        Self {
            render_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            latencies: LatencyHistogram::new(),
            last_render: AtomicU64::new(tick),
        }
    }

    fn record(&self, latency_us: u64, success: bool, tick: u64) {
        self.render_count.fetch_add(1, Ordering::Relaxed);
        if success {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        }
        self.latencies.record(latency_us);
        self.last_render.fetch_max(tick, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ComponentMetrics {
        let (avg_latency_us, p50_latency_us, p95_latency_us, p99_latency_us) =
            self.latencies.summary();
        ComponentMetrics {
            render_count: self.render_count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            avg_latency_us,
            p50_latency_us,
            p95_latency_us,
            p99_latency_us,
        }
    }
}

/// Thread-safe metrics registry for one engine.
///
/// Global counters are plain relaxed atomics. The per-component table sits
/// behind a `RwLock` that is only taken for writing when a component is seen
/// for the first time; everything after that is atomic adds on a shared
/// `Arc<ComponentStats>`. Snapshots are eventually consistent.
///
/// # Example
///
/// ```rust
/// use kiln_metrics::MetricsRegistry;
///
/// let registry = MetricsRegistry::new();
/// registry.record_render("app/pages/home.tsx", 1_250, true);
/// registry.record_cache_hit();
///
/// let snapshot = registry.snapshot();
/// assert_eq!(snapshot.renders_total, 1);
/// assert_eq!(snapshot.cache.hits, 1);
/// ```
#[derive(Debug)]
pub struct MetricsRegistry {
    renders_total: AtomicU64,
    renders_succeeded: AtomicU64,
    renders_failed: AtomicU64,

    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_stale: AtomicU64,

    builds_started: AtomicU64,
    builds_succeeded: AtomicU64,
    builds_failed: AtomicU64,

    sandboxes_created: AtomicU64,
    sandboxes_live: AtomicU64,
    sandboxes_peak: AtomicU64,

    watcher_launches: AtomicU64,
    watcher_failures: AtomicU64,

    components: StdRwLock<HashMap<String, Arc<ComponentStats>>>,
    tick: AtomicU64,
    start_time: Instant,
    config: MetricsConfig,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_config(MetricsConfig::default())
    }

    pub fn with_config(config: MetricsConfig) -> Self {
        Self {
            renders_total: AtomicU64::new(0),
            renders_succeeded: AtomicU64::new(0),
            renders_failed: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_stale: AtomicU64::new(0),
            builds_started: AtomicU64::new(0),
            builds_succeeded: AtomicU64::new(0),
            builds_failed: AtomicU64::new(0),
            sandboxes_created: AtomicU64::new(0),
            sandboxes_live: AtomicU64::new(0),
            sandboxes_peak: AtomicU64::new(0),
            watcher_launches: AtomicU64::new(0),
            watcher_failures: AtomicU64::new(0),
            components: StdRwLock::new(HashMap::new()),
            tick: AtomicU64::new(0),
            start_time: Instant::now(),
            config,
        }
    }

    /// Records one finished render of `component` and its outcome.
    pub fn record_render(&self, component: &str, latency_us: u64, success: bool) {
        self.renders_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.renders_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.renders_failed.fetch_add(1, Ordering::Relaxed);
        }

        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        let existing = self
            .components
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(component)
            .cloned();

        let stats = match existing {
            Some(stats) => stats,
            None => {
                let mut components = self.components.write().unwrap_or_else(|e| e.into_inner());
                let stats = components
                    .entry(component.to_string())
                    .or_insert_with(|| Arc::new(ComponentStats::new(tick)))
                    .clone();
                self.evict_over_limit(&mut components);
                stats
            }
        };

        stats.record(latency_us, success, tick);
    }

    fn evict_over_limit(&self, components: &mut HashMap<String, Arc<ComponentStats>>) {
        if components.len() <= self.config.max_components {
            return;
        }
        let mut entries: Vec<(String, u64)> = components
            .iter()
            .map(|(name, stats)| (name.clone(), stats.last_render.load(Ordering::Relaxed)))
            .collect();
        entries.sort_by_key(|&(_, last)| last);

        let excess = entries.len() - self.config.max_components;
        for (name, _) in entries.into_iter().take(excess) {
            components.remove(&name);
        }
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A miss caused by a stale entry. Counts as a miss as well.
    pub fn record_cache_stale(&self) {
        self.cache_stale.fetch_add(1, Ordering::Relaxed);
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build_started(&self) {
        self.builds_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build_finished(&self, success: bool) {
        if success {
            self.builds_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.builds_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_sandbox_created(&self) {
        self.sandboxes_created.fetch_add(1, Ordering::Relaxed);
        let live = self.sandboxes_live.fetch_add(1, Ordering::Relaxed) + 1;
        self.sandboxes_peak.fetch_max(live, Ordering::Relaxed);
    }

    pub fn record_sandbox_disposed(&self) {
        // saturating: a disposal without a matching creation must not wrap
        let _ = self
            .sandboxes_live
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |live| {
                Some(live.saturating_sub(1))
            });
    }

    pub fn record_watcher_launch(&self) {
        self.watcher_launches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_watcher_failure(&self) {
        self.watcher_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Currently live sandboxes.
    pub fn live_sandboxes(&self) -> u64 {
        self.sandboxes_live.load(Ordering::Relaxed)
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let components = self
            .components
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();

        MetricsSnapshot {
            renders_total: self.renders_total.load(Ordering::Relaxed),
            renders_succeeded: self.renders_succeeded.load(Ordering::Relaxed),
            renders_failed: self.renders_failed.load(Ordering::Relaxed),
            uptime_ms: self.uptime_ms(),
            cache: CacheMetrics {
                hits: self.cache_hits.load(Ordering::Relaxed),
                misses: self.cache_misses.load(Ordering::Relaxed),
                stale: self.cache_stale.load(Ordering::Relaxed),
            },
            builds: BuildMetrics {
                started: self.builds_started.load(Ordering::Relaxed),
                succeeded: self.builds_succeeded.load(Ordering::Relaxed),
                failed: self.builds_failed.load(Ordering::Relaxed),
            },
            sandboxes: SandboxMetrics {
                created: self.sandboxes_created.load(Ordering::Relaxed),
                live: self.sandboxes_live.load(Ordering::Relaxed),
                peak: self.sandboxes_peak.load(Ordering::Relaxed),
            },
            watchers: WatcherMetrics {
                launches: self.watcher_launches.load(Ordering::Relaxed),
                failures: self.watcher_failures.load(Ordering::Relaxed),
            },
            components,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
