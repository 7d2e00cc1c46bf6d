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

use std::{
    borrow::Cow,
    collections::HashMap,
    hash::{Hash, Hasher},
    sync::{Arc, LazyLock},
};

use itertools::Itertools;
use parking_lot::Mutex;
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry,
    Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Registry,
};

use crate::{
    metrics::{
        BoxedCounter, BoxedCounterVec, BoxedGauge, BoxedGaugeVec, BoxedHistogram, BoxedHistogramVec, Boxer, CounterOps,
        CounterVecOps, GaugeOps, GaugeVecOps, HistogramOps, HistogramVecOps, RegistryOps,
    },
    scope::Scope,
};

/// Metric vectors registered per prometheus registry, so several caches can share one registry.
static METRICS: LazyLock<Mutex<HashMap<PrometheusMetricsRegistry, HashMap<Metadata, MetricVec>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn get_or_register(
    registry: &PrometheusMetricsRegistry,
    metadata: Metadata,
    register: impl FnOnce(&Metadata, &Registry) -> MetricVec,
) -> MetricVec {
    METRICS.lock().with(|mut metrics| {
        metrics
            .entry(registry.clone())
            .or_default()
            .entry(metadata.clone())
            .or_insert_with(|| register(&metadata, &registry.registry))
            .clone()
    })
}

#[derive(Debug, Clone)]
enum MetricVec {
    Counter(IntCounterVec),
    Gauge(IntGaugeVec),
    Histogram(HistogramVec),
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct Metadata {
    name: Cow<'static, str>,
    desc: Cow<'static, str>,
    label_names: &'static [&'static str],
}

impl CounterOps for IntCounter {
    fn increase(&self, val: u64) {
        self.inc_by(val);
    }
}

impl CounterVecOps for IntCounterVec {
    fn counter(&self, labels: &[Cow<'static, str>]) -> BoxedCounter {
        let labels = labels.iter().map(Cow::as_ref).collect_vec();
        self.with_label_values(&labels).boxed()
    }
}

impl GaugeOps for IntGauge {
    fn increase(&self, val: u64) {
        self.add(val as _);
    }

    fn decrease(&self, val: u64) {
        self.sub(val as _);
    }

    fn absolute(&self, val: u64) {
        self.set(val as _);
    }
}

impl GaugeVecOps for IntGaugeVec {
    fn gauge(&self, labels: &[Cow<'static, str>]) -> BoxedGauge {
        let labels = labels.iter().map(Cow::as_ref).collect_vec();
        self.with_label_values(&labels).boxed()
    }
}

impl HistogramOps for Histogram {
    fn record(&self, val: f64) {
        self.observe(val);
    }
}

impl HistogramVecOps for HistogramVec {
    fn histogram(&self, labels: &[Cow<'static, str>]) -> BoxedHistogram {
        let labels = labels.iter().map(Cow::as_ref).collect_vec();
        self.with_label_values(&labels).boxed()
    }
}

/// Prometheus metric registry with lib `prometheus`.
///
/// The [`PrometheusMetricsRegistry`] can be cloned and used by multiple tarn caches, without worrying about
/// duplicately registering.
#[derive(Debug, Clone)]
pub struct PrometheusMetricsRegistry {
    registry: Arc<Registry>,
}

impl PartialEq for PrometheusMetricsRegistry {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.registry, &other.registry)
    }
}

impl Eq for PrometheusMetricsRegistry {}

impl Hash for PrometheusMetricsRegistry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.registry).hash(state);
    }
}

impl PrometheusMetricsRegistry {
    /// Create an Prometheus metrics registry.
    pub fn new(registry: Registry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }
}

impl RegistryOps for PrometheusMetricsRegistry {
    fn register_counter_vec(
        &self,
        name: Cow<'static, str>,
        desc: Cow<'static, str>,
        label_names: &'static [&'static str],
    ) -> BoxedCounterVec {
        let metadata = Metadata {
            name,
            desc,
            label_names,
        };
        match get_or_register(self, metadata, |m, registry| {
            MetricVec::Counter(
                register_int_counter_vec_with_registry!(m.name.as_ref(), m.desc.as_ref(), m.label_names, registry)
                    .expect("metric names of a registry must be unique"),
            )
        }) {
            MetricVec::Counter(v) => v.boxed(),
            _ => unreachable!(),
        }
    }

    fn register_gauge_vec(
        &self,
        name: Cow<'static, str>,
        desc: Cow<'static, str>,
        label_names: &'static [&'static str],
    ) -> BoxedGaugeVec {
        let metadata = Metadata {
            name,
            desc,
            label_names,
        };
        match get_or_register(self, metadata, |m, registry| {
            MetricVec::Gauge(
                register_int_gauge_vec_with_registry!(m.name.as_ref(), m.desc.as_ref(), m.label_names, registry)
                    .expect("metric names of a registry must be unique"),
            )
        }) {
            MetricVec::Gauge(v) => v.boxed(),
            _ => unreachable!(),
        }
    }

    fn register_histogram_vec(
        &self,
        name: Cow<'static, str>,
        desc: Cow<'static, str>,
        label_names: &'static [&'static str],
    ) -> BoxedHistogramVec {
        let metadata = Metadata {
            name,
            desc,
            label_names,
        };
        match get_or_register(self, metadata, |m, registry| {
            MetricVec::Histogram(
                register_histogram_vec_with_registry!(m.name.as_ref(), m.desc.as_ref(), m.label_names, registry)
                    .expect("metric names of a registry must be unique"),
            )
        }) {
            MetricVec::Histogram(v) => v.boxed(),
            _ => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;

    #[test]
    fn test_prometheus_metrics_registry() {
        let registry = Registry::new();
        let p8s = PrometheusMetricsRegistry::new(registry.clone());

        let metrics = Metrics::new("test", &p8s);
        metrics.memory_insert.increase(3);
        metrics.memory_usage.absolute(1024);
        metrics.memory_sweep_duration.record(0.5);

        let families = registry.gather();
        let names = families.iter().map(|f| f.name().to_string()).collect_vec();
        assert!(names.contains(&"tarn_memory_op_total".to_string()));
        assert!(names.contains(&"tarn_memory_usage".to_string()));
    }

    #[test]
    fn test_shared_prometheus_metrics_registry() {
        let registry = Registry::new();
        let p8s1 = PrometheusMetricsRegistry::new(registry);
        let p8s2 = p8s1.clone();
        let _ = Metrics::new("cache-1", &p8s1);
        let _ = Metrics::new("cache-2", &p8s2);
    }
}
