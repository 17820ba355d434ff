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

//! Kiln Metrics
//!
//! Lock-free counters and per-component latency histograms for the kiln
//! render engine: renders, artifact cache lookups, builds, sandbox churn,
//! and stylesheet watcher launches.
//!
//! - [`MetricsRegistry`]: the shared, thread-safe store; record into it from
//!   any task or thread
//! - [`MetricsSnapshot`]: a serializable point-in-time copy
//!
//! ```rust
//! use kiln_metrics::MetricsRegistry;
//! use std::sync::Arc;
//!
//! let metrics = Arc::new(MetricsRegistry::new());
//! metrics.record_sandbox_created();
//! metrics.record_render("app/pages/home.tsx", 840, true);
//! metrics.record_sandbox_disposed();
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.sandboxes.peak, 1);
//! assert_eq!(snapshot.components["app/pages/home.tsx"].render_count, 1);
//! ```

mod registry;
mod snapshot;

pub use registry::{MetricsConfig, MetricsRegistry};
pub use snapshot::{
    BuildMetrics, CacheMetrics, ComponentMetrics, MetricsSnapshot, SandboxMetrics, WatcherMetrics,
};
