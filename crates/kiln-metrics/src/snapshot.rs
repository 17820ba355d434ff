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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Render statistics for one component
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComponentMetrics {
    pub render_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_latency_us: u64,
    pub p50_latency_us: u64,
    pub p95_latency_us: u64,
    pub p99_latency_us: u64,
}

/// Artifact cache lookups
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    /// Misses caused by a changed or deleted dependency.
    pub stale: u64,
}

/// Artifact builds, counted once per (component, mount point) build
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildMetrics {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Script sandboxes
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxMetrics {
    pub created: u64,
    pub live: u64,
    pub peak: u64,
}

/// Background stylesheet watchers
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatcherMetrics {
    pub launches: u64,
    pub failures: u64,
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub renders_total: u64,
    pub renders_succeeded: u64,
    pub renders_failed: u64,
    pub uptime_ms: u64,
    pub cache: CacheMetrics,
    pub builds: BuildMetrics,
    pub sandboxes: SandboxMetrics,
    pub watchers: WatcherMetrics,
    pub components: HashMap<String, ComponentMetrics>,
}

impl MetricsSnapshot {
    /// Fraction of cache lookups that were hits, or 0 before the first lookup.
    pub fn cache_hit_ratio(&self) -> f64 {
        let lookups = self.cache.hits + self.cache.misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache.hits as f64 / lookups as f64
        }
    }
}
