// Copyright 2026 tarn Project Authors
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

use std::borrow::Cow;

use super::{registry::noop::NoopMetricsRegistry, BoxedCounter, BoxedGauge, BoxedHistogram, RegistryOps};

/// Metrics of one cache.
#[derive(Debug)]
pub struct Metrics {
    /// Inserts that published a new entry.
    pub memory_insert: BoxedCounter,
    /// Inserts that replaced a live entry.
    pub memory_replace: BoxedCounter,
    /// Reads that found a live entry.
    pub memory_hit: BoxedCounter,
    /// Reads that found nothing or an expired entry.
    pub memory_miss: BoxedCounter,
    /// Entries removed or replaced by callers.
    pub memory_remove: BoxedCounter,
    /// Entries removed on expiration.
    pub memory_expire: BoxedCounter,
    /// Entries trimmed under memory pressure.
    pub memory_trim: BoxedCounter,
    /// Entries removed because their dependency changed.
    pub memory_dependency_changed: BoxedCounter,
    /// Inserts that waited on the closed insert gate.
    pub memory_gate_wait: BoxedCounter,

    /// Approximate bytes held by live entries.
    pub memory_usage: BoxedGauge,
    /// Newest memory pressure sample, in percent.
    pub memory_pressure: BoxedGauge,

    /// Duration of expiration sweeps, in seconds.
    pub memory_sweep_duration: BoxedHistogram,
    /// Duration of trims, in seconds.
    pub memory_trim_duration: BoxedHistogram,
}

impl Metrics {
    /// Create a new metric with the given name.
    pub fn new(name: impl Into<Cow<'static, str>>, registry: &dyn RegistryOps) -> Self {
        let name = name.into();

        let tarn_memory_op_total = registry.register_counter_vec(
            "tarn_memory_op_total".into(),
            "tarn in-memory cache operations".into(),
            &["name", "op"],
        );
        let tarn_memory_usage = registry.register_gauge_vec(
            "tarn_memory_usage".into(),
            "tarn in-memory cache approximate usage in bytes".into(),
            &["name"],
        );
        let tarn_memory_pressure = registry.register_gauge_vec(
            "tarn_memory_pressure".into(),
            "tarn in-memory cache pressure percentage".into(),
            &["name"],
        );
        let tarn_memory_maintenance_duration = registry.register_histogram_vec(
            "tarn_memory_maintenance_duration".into(),
            "tarn in-memory cache maintenance durations".into(),
            &["name", "op"],
        );

        let op = |op: &'static str| tarn_memory_op_total.counter(&[name.clone(), op.into()]);

        let memory_insert = op("insert");
        let memory_replace = op("replace");
        let memory_hit = op("hit");
        let memory_miss = op("miss");
        let memory_remove = op("remove");
        let memory_expire = op("expire");
        let memory_trim = op("trim");
        let memory_dependency_changed = op("dependency_changed");
        let memory_gate_wait = op("gate_wait");

        let memory_usage = tarn_memory_usage.gauge(&[name.clone()]);
        let memory_pressure = tarn_memory_pressure.gauge(&[name.clone()]);

        let memory_sweep_duration = tarn_memory_maintenance_duration.histogram(&[name.clone(), "sweep".into()]);
        let memory_trim_duration = tarn_memory_maintenance_duration.histogram(&[name, "trim".into()]);

        Self {
            memory_insert,
            memory_replace,
            memory_hit,
            memory_miss,
            memory_remove,
            memory_expire,
            memory_trim,
            memory_dependency_changed,
            memory_gate_wait,
            memory_usage,
            memory_pressure,
            memory_sweep_duration,
            memory_trim_duration,
        }
    }

    /// Build noop metrics.
    ///
    /// Note: `noop` is only supposed to be used by tests or disabled metrics.
    pub fn noop() -> Self {
        Self::new("test", &NoopMetricsRegistry)
    }
}
