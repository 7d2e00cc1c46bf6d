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
    fmt::Debug,
    hash::Hash,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use equivalent::Equivalent;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tarn_common::{
    clock::{Clock, SystemClock, Timestamp},
    code::{DefaultHashBuilder, HashBuilder, Key, Value},
    error::{Error, ErrorKind, Result},
    metrics::{Metrics, RegistryOps},
};

use crate::{
    dependency::Dependency,
    gate::Gate,
    pressure::{FootprintSampler, Occupancy, OccupancySampler, PressureMonitor, Thresholds},
    record::{Data, Namespace, Priority, Record, RemovedCallback, RemovedReason},
    router::{Enumerate, Router},
    scheduler::{Maintain, Scheduler},
    shard::{ShardContext, UpdateMode},
};

/// The weighter for the in-memory cache.
///
/// The weighter is used to calculate the approximate size of the cache entry in bytes.
pub trait Weighter<K, V>: Fn(&K, &V) -> usize + Send + Sync + 'static {}
impl<K, V, T> Weighter<K, V> for T where T: Fn(&K, &V) -> usize + Send + Sync + 'static {}

/// Longest accepted sliding expiration.
pub const MAX_SLIDING_EXPIRY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Per-insert options.
pub struct CacheOptions<K, V> {
    /// Remove the entry with [`RemovedReason::DependencyChanged`] once this changes.
    pub dependency: Option<Arc<dyn Dependency>>,
    /// Expire at this time.
    pub absolute_expiry: Option<Timestamp>,
    /// Expire after this long without a read.
    pub sliding_expiry: Option<Duration>,
    /// Priority hint.
    pub priority: Priority,
    /// Called once when the entry leaves the cache.
    pub on_removed: Option<RemovedCallback<K, V>>,
    /// Namespace of the entry.
    pub namespace: Namespace,
}

impl<K, V> Default for CacheOptions<K, V> {
    fn default() -> Self {
        Self {
            dependency: None,
            absolute_expiry: None,
            sliding_expiry: None,
            priority: Priority::default(),
            on_removed: None,
            namespace: Namespace::default(),
        }
    }
}

impl<K, V> Clone for CacheOptions<K, V> {
    fn clone(&self) -> Self {
        Self {
            dependency: self.dependency.clone(),
            absolute_expiry: self.absolute_expiry,
            sliding_expiry: self.sliding_expiry,
            priority: self.priority,
            on_removed: self.on_removed.clone(),
            namespace: self.namespace,
        }
    }
}

impl<K, V> Debug for CacheOptions<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheOptions")
            .field("dependency", &self.dependency.is_some())
            .field("absolute_expiry", &self.absolute_expiry)
            .field("sliding_expiry", &self.sliding_expiry)
            .field("priority", &self.priority)
            .field("on_removed", &self.on_removed.is_some())
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl<K, V> CacheOptions<K, V> {
    /// Set the dependency.
    pub fn with_dependency(mut self, dependency: Arc<dyn Dependency>) -> Self {
        self.dependency = Some(dependency);
        self
    }

    /// Set the absolute expiration.
    pub fn with_absolute_expiry(mut self, expires: Timestamp) -> Self {
        self.absolute_expiry = Some(expires);
        self
    }

    /// Set the sliding expiration.
    pub fn with_sliding_expiry(mut self, sliding: Duration) -> Self {
        self.sliding_expiry = Some(sliding);
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the removal callback.
    pub fn with_on_removed(mut self, on_removed: impl Fn(&K, &V, RemovedReason) + Send + Sync + 'static) -> Self {
        self.on_removed = Some(Arc::new(on_removed));
        self
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: Namespace) -> Self {
        self.namespace = namespace;
        self
    }

    fn validate(&self) -> Result<()> {
        let sliding = self.sliding_expiry.filter(|s| !s.is_zero());
        if self.absolute_expiry.is_some() && sliding.is_some() {
            return Err(Error::invalid_argument(
                "absolute and sliding expiration cannot be used together",
            ));
        }
        if let Some(sliding) = sliding {
            if sliding > MAX_SLIDING_EXPIRY {
                return Err(Error::invalid_argument("sliding expiration cannot be longer than one year")
                    .with_context("sliding", format!("{sliding:?}")));
            }
        }
        Ok(())
    }
}

/// Immutable settings of a cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Byte budget. 0 detects it from physical memory.
    pub memory_limit: usize,
    /// Entry count budget. 0 means unlimited.
    pub item_limit: usize,
    /// Pressure poll interval while pressure is not high, capped at 30s.
    pub poll_interval: Duration,
    /// Honor absolute and sliding expirations.
    pub enable_expiration: bool,
    /// Trim under memory pressure.
    pub enable_memory_eviction: bool,
    /// Shard count, a power of two. 0 picks one from the available parallelism.
    pub shards: usize,
    /// Recently added entries are spared by the first trim pass.
    pub grace_window: Duration,
    /// Minimum time between two usage touches of an entry.
    pub usage_update_interval: Duration,
    /// Longest time a tracked insert waits while pressure is high.
    pub insert_block_timeout: Duration,
    /// Interval between expiration sweeps.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_limit: 0,
            item_limit: 0,
            poll_interval: Duration::from_secs(20),
            enable_expiration: true,
            enable_memory_eviction: true,
            shards: 0,
            grace_window: Duration::from_secs(10),
            usage_update_interval: Duration::from_secs(1),
            insert_block_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(20),
        }
    }
}

impl CacheConfig {
    /// Check the config.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::new(ErrorKind::Config, "poll interval must be positive"));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::new(ErrorKind::Config, "sweep interval must be positive"));
        }
        if self.shards != 0 && !self.shards.is_power_of_two() {
            return Err(Error::new(ErrorKind::Config, "shard count must be a power of two")
                .with_context("shards", self.shards));
        }
        Ok(())
    }
}

struct CacheInner<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    name: Cow<'static, str>,
    config: CacheConfig,

    router: Router<K, V, S>,
    monitor: PressureMonitor,
    gate: Arc<Gate>,

    clock: Arc<dyn Clock>,
    weighter: Arc<dyn Weighter<K, V>>,
    metrics: Arc<Metrics>,

    scheduler: Mutex<Option<Scheduler>>,
    closed: AtomicBool,
}

impl<K, V, S> CacheInner<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    fn record(&self, key: K, value: V, options: CacheOptions<K, V>) -> Result<Arc<Record<K, V>>> {
        options.validate()?;

        let now = self.clock.now();
        let sliding = options.sliding_expiry.filter(|s| !s.is_zero());
        let (expires, sliding) = match (self.config.enable_expiration, options.absolute_expiry, sliding) {
            (false, _, _) => (Timestamp::NEVER, None),
            (true, Some(expires), _) => (expires, None),
            (true, None, Some(sliding)) => (now.saturating_add(sliding), Some(sliding)),
            (true, None, None) => (Timestamp::NEVER, None),
        };

        let hash = self.router.hash(&key);
        let weight = (self.weighter)(&key, &value);

        Ok(Arc::new(Record::new(Data {
            key,
            value,
            namespace: options.namespace,
            hash,
            weight,
            priority: options.priority,
            expires,
            sliding,
            created: now,
            dependency: options.dependency,
            on_removed: options.on_removed,
        })))
    }

    fn insert(&self, key: K, value: V, options: CacheOptions<K, V>, mode: UpdateMode) -> Result<Option<V>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::closed());
        }
        let record = self.record(key, value, options)?;
        let previous = self.router.shard(record.hash()).insert(record, mode)?;
        Ok(previous.map(|r| r.value().clone()))
    }

    fn trim_count(&self, count: usize) -> usize {
        let start = Instant::now();
        let trimmed = self.router.trim(count);
        self.metrics
            .memory_trim_duration
            .record(start.elapsed().as_secs_f64());
        trimmed
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.stop();
        }

        while self.router.is_busy() {
            std::thread::sleep(Duration::from_millis(1));
        }

        let removed = self.router.clear(RemovedReason::Removed);
        self.gate.open();
        tracing::info!("[cache]: cache {} closed, {removed} entries removed", self.name);
    }
}

impl<K, V, S> Maintain for CacheInner<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "tarn::memory::cache::sweep"))]
    fn sweep(&self) {
        if !self.config.enable_expiration {
            return;
        }
        let start = Instant::now();
        let expired = self.router.flush_expired(self.clock.now());
        self.metrics
            .memory_sweep_duration
            .record(start.elapsed().as_secs_f64());
        if expired > 0 {
            tracing::debug!("[cache]: cache {} swept {expired} expired entries", self.name);
        }
    }

    #[cfg_attr(feature = "tracing", fastrace::trace(name = "tarn::memory::cache::poll"))]
    fn poll(&self) -> Duration {
        let pressure = self.monitor.sample();
        self.metrics.memory_pressure.absolute(pressure as _);

        if !self.config.enable_memory_eviction {
            self.gate.open();
            return self.monitor.poll_interval();
        }

        let percent = self.monitor.percent_to_trim();
        let mut trimmed = 0;
        if percent > 0 {
            let target = (self.router.tracked() * percent).div_ceil(100);
            trimmed = self.trim_count(target);
            tracing::debug!(
                "[cache]: cache {} under pressure {pressure}%, trimmed {trimmed} of {target} entries ({percent}%)",
                self.name
            );
        }

        // The sample predates the trim. Let writers through until the next one says otherwise.
        match trimmed == 0 && self.monitor.is_high() {
            true => self.gate.close(),
            false => self.gate.open(),
        }
        self.monitor.poll_interval()
    }
}

impl<K, V, S> Drop for CacheInner<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    fn drop(&mut self) {
        self.close();
    }
}

/// A process-wide in-memory object cache.
///
/// Entries leave the cache when they expire, when their dependency changes, when they are removed or replaced, or when
/// they are trimmed under memory pressure. Values are handed out by clone.
pub struct Cache<K, V, S = DefaultHashBuilder>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    inner: Arc<CacheInner<K, V, S>>,
}

impl<K, V, S> Clone for Cache<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V, S> Debug for Cache<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.inner.name)
            .field("count", &self.count())
            .field("usage", &self.usage())
            .finish()
    }
}

impl<K, V, S> Cache<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    /// Name of the cache.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Config the cache was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Get the value of a public entry.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.get_with_namespace(key, Namespace::Public)
    }

    /// Get the value of an entry.
    ///
    /// Reading renews a sliding expiration and marks the entry as recently used.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "tarn::memory::cache::get"))]
    pub fn get_with_namespace<Q>(&self, key: &Q, namespace: Namespace) -> Option<V>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let hash = self.inner.router.hash(key);
        self.inner
            .router
            .shard(hash)
            .get(hash, key, namespace)
            .map(|r| r.value().clone())
    }

    /// Insert or replace an entry. Returns the replaced value.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "tarn::memory::cache::insert"))]
    pub fn insert(&self, key: K, value: V, options: CacheOptions<K, V>) -> Result<Option<V>> {
        self.inner.insert(key, value, options, UpdateMode::Replace)
    }

    /// Insert an entry unless a live one exists. Returns the existing value, in which case nothing was inserted.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "tarn::memory::cache::insert_if_absent"))]
    pub fn insert_if_absent(&self, key: K, value: V, options: CacheOptions<K, V>) -> Result<Option<V>> {
        self.inner.insert(key, value, options, UpdateMode::IfAbsent)
    }

    /// Remove a public entry. Returns its value.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.remove_with_reason(key, Namespace::Public, RemovedReason::Removed)
    }

    /// Remove an entry, reporting `reason` to its removal callback. Returns its value.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "tarn::memory::cache::remove"))]
    pub fn remove_with_reason<Q>(&self, key: &Q, namespace: Namespace, reason: RemovedReason) -> Option<V>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let hash = self.inner.router.hash(key);
        self.inner
            .router
            .shard(hash)
            .remove(hash, key, namespace, reason)
            .map(|r| r.value().clone())
    }

    /// Trim `percent` of the entries tracked for trimming, coldest first. Returns the trimmed count.
    pub fn trim(&self, percent: usize) -> Result<u64> {
        if percent > 100 {
            return Err(Error::invalid_argument("trim percent must be in [0, 100]").with_context("percent", percent));
        }
        let count = (self.inner.router.tracked() * percent).div_ceil(100);
        Ok(self.inner.trim_count(count) as u64)
    }

    /// Tell `dependency` when the public entry of `key` leaves the cache.
    ///
    /// Returns whether it was accepted and the creation time of the entry. An absent entry is not accepted.
    pub fn add_dependent<Q>(&self, key: &Q, dependency: Arc<dyn Dependency>) -> (bool, Timestamp)
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let hash = self.inner.router.hash(key);
        match self
            .inner
            .router
            .shard(hash)
            .add_dependent(hash, key, Namespace::Public, dependency)
        {
            Some(created) => (true, created),
            None => (false, Timestamp::ZERO),
        }
    }

    /// Undo [`Cache::add_dependent`].
    pub fn remove_dependent<Q>(&self, key: &Q, dependency: &Arc<dyn Dependency>)
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let hash = self.inner.router.hash(key);
        self.inner
            .router
            .shard(hash)
            .remove_dependent(hash, key, Namespace::Public, dependency);
    }

    /// Walk the live entries.
    pub fn enumerate(&self, include_private: bool) -> Enumerate<K, V> {
        self.inner.router.enumerate(include_private)
    }

    /// Live entry count of both namespaces.
    pub fn count(&self) -> usize {
        self.inner.router.count()
    }

    /// Live entry count of the public namespace.
    pub fn public_count(&self) -> usize {
        self.inner.router.public_count()
    }

    /// Approximate bytes used by live entries.
    pub fn usage(&self) -> usize {
        self.inner.router.usage()
    }

    /// Average memory pressure of the recent samples, in percent.
    pub fn pressure(&self) -> u8 {
        self.inner.monitor.pressure()
    }

    /// Effective byte budget, detected from physical memory if it was configured as 0.
    pub fn memory_limit(&self) -> usize {
        self.inner.monitor.limit()
    }

    /// Pressure thresholds in effect.
    pub fn thresholds(&self) -> Thresholds {
        self.inner.monitor.thresholds()
    }

    /// Run one sweep and one pressure poll now.
    pub fn tick(&self) {
        self.inner.sweep();
        self.inner.poll();
    }

    /// Check every shard's table against its indexes. Returns a description of each broken link.
    ///
    /// Only meaningful while no other operation runs on the cache.
    pub fn audit(&self) -> Vec<String> {
        self.inner
            .router
            .shards()
            .iter()
            .flat_map(|s| s.audit())
            .collect()
    }

    /// Stop background maintenance and remove every entry with [`RemovedReason::Removed`].
    ///
    /// Later inserts fail with [`ErrorKind::Closed`]. Dropping the last handle closes the cache as well.
    pub fn close(&self) {
        self.inner.close();
    }
}

/// Builder of [`Cache`].
pub struct CacheBuilder<K, V, S = DefaultHashBuilder>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    name: Cow<'static, str>,
    config: CacheConfig,
    hash_builder: S,
    weighter: Arc<dyn Weighter<K, V>>,
    clock: Arc<dyn Clock>,
    sampler: Option<Arc<dyn FootprintSampler>>,
    registry: Option<Box<dyn RegistryOps>>,
    background: bool,
}

impl<K, V> Default for CacheBuilder<K, V, DefaultHashBuilder>
where
    K: Key,
    V: Value,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> CacheBuilder<K, V, DefaultHashBuilder>
where
    K: Key,
    V: Value,
{
    /// Create a builder with the default config.
    pub fn new() -> Self {
        Self {
            name: "tarn".into(),
            config: CacheConfig::default(),
            hash_builder: DefaultHashBuilder::default(),
            weighter: Arc::new(|_: &K, _: &V| std::mem::size_of::<K>() + std::mem::size_of::<V>()),
            clock: Arc::new(SystemClock),
            sampler: None,
            registry: None,
            background: true,
        }
    }
}

impl<K, V, S> CacheBuilder<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    /// Set the name of the cache, used as a metrics label and in logs.
    pub fn with_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Replace the whole config.
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the byte budget. 0 detects it from physical memory.
    pub fn with_memory_limit(mut self, memory_limit: usize) -> Self {
        self.config.memory_limit = memory_limit;
        self
    }

    /// Set the entry count budget. 0 means unlimited.
    pub fn with_item_limit(mut self, item_limit: usize) -> Self {
        self.config.item_limit = item_limit;
        self
    }

    /// Set the pressure poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.config.poll_interval = poll_interval;
        self
    }

    /// Enable or disable expiration.
    pub fn with_expiration(mut self, enable: bool) -> Self {
        self.config.enable_expiration = enable;
        self
    }

    /// Enable or disable trimming under memory pressure.
    pub fn with_memory_eviction(mut self, enable: bool) -> Self {
        self.config.enable_memory_eviction = enable;
        self
    }

    /// Set the shard count. Entries are distributed to shards by their hash.
    ///
    /// Must be a power of two. The default 0 picks the next power of two of the available parallelism.
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.config.shards = shards;
        self
    }

    /// Set the grace window of the first trim pass.
    pub fn with_grace_window(mut self, grace_window: Duration) -> Self {
        self.config.grace_window = grace_window;
        self
    }

    /// Set the minimum time between two usage touches of an entry.
    pub fn with_usage_update_interval(mut self, interval: Duration) -> Self {
        self.config.usage_update_interval = interval;
        self
    }

    /// Set how long a tracked insert waits while pressure is high.
    pub fn with_insert_block_timeout(mut self, timeout: Duration) -> Self {
        self.config.insert_block_timeout = timeout;
        self
    }

    /// Set the interval between expiration sweeps.
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.config.sweep_interval = sweep_interval;
        self
    }

    /// Set the hash builder.
    pub fn with_hash_builder<OS>(self, hash_builder: OS) -> CacheBuilder<K, V, OS>
    where
        OS: HashBuilder,
    {
        CacheBuilder {
            name: self.name,
            config: self.config,
            hash_builder,
            weighter: self.weighter,
            clock: self.clock,
            sampler: self.sampler,
            registry: self.registry,
            background: self.background,
        }
    }

    /// Set the weighter that estimates an entry's size in bytes.
    pub fn with_weighter(mut self, weighter: impl Weighter<K, V>) -> Self {
        self.weighter = Arc::new(weighter);
        self
    }

    /// Set the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the footprint sampler. The default samples the cache's own entries.
    pub fn with_sampler(mut self, sampler: Arc<dyn FootprintSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Set the metrics registry. Metrics are not recorded by default.
    pub fn with_metrics_registry(mut self, registry: Box<dyn RegistryOps>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Run sweeps and pressure polls on a background thread. Enabled by default.
    ///
    /// Without it, maintenance only runs through [`Cache::tick`].
    pub fn with_background_maintenance(mut self, enable: bool) -> Self {
        self.background = enable;
        self
    }

    /// Build the cache.
    pub fn build(self) -> Result<Cache<K, V, S>> {
        self.config.validate()?;

        let metrics = Arc::new(match self.registry.as_ref() {
            Some(registry) => Metrics::new(self.name.clone(), registry.as_ref()),
            None => Metrics::noop(),
        });
        let occupancy = Arc::new(Occupancy::default());
        let gate = Arc::new(Gate::new());

        let ctx = Arc::new(ShardContext {
            clock: self.clock.clone(),
            metrics: metrics.clone(),
            gate: gate.clone(),
            occupancy: occupancy.clone(),
            memory_eviction: self.config.enable_memory_eviction,
            grace_window: self.config.grace_window,
            usage_update_interval: self.config.usage_update_interval,
            insert_block_timeout: self.config.insert_block_timeout,
        });
        let router = Router::new(self.config.shards, ctx, self.hash_builder)?;

        let sampler = self
            .sampler
            .unwrap_or_else(|| Arc::new(OccupancySampler::new(occupancy)));
        let monitor = PressureMonitor::new(
            sampler,
            self.config.memory_limit,
            (self.config.item_limit > 0).then_some(self.config.item_limit),
            self.config.poll_interval,
        );
        let poll_interval = monitor.poll_interval();

        let inner = Arc::new(CacheInner {
            name: self.name,
            config: self.config,
            router,
            monitor,
            gate,
            clock: self.clock,
            weighter: self.weighter,
            metrics,
            scheduler: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        if self.background {
            let target: Weak<dyn Maintain> = Arc::downgrade(&inner) as Weak<dyn Maintain>;
            let scheduler = Scheduler::spawn(target, inner.config.sweep_interval, poll_interval)?;
            *inner.scheduler.lock() = Some(scheduler);
        }

        tracing::info!(
            "[cache]: cache {} built, shards: {}, memory limit: {} bytes",
            inner.name,
            inner.router.shards().len(),
            inner.monitor.limit()
        );

        Ok(Cache { inner })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tarn_common::clock::ManualClock;

    use super::*;
    use crate::dependency::ManualDependency;

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<Cache<(), ()>>();
        is_send_sync_static::<Cache<String, Arc<Vec<u8>>>>();
    }

    fn cache(clock: &ManualClock) -> Cache<u64, String> {
        CacheBuilder::new()
            .with_name("test")
            .with_clock(Arc::new(clock.clone()))
            .with_memory_limit(1 << 30)
            .with_shards(4)
            .with_background_maintenance(false)
            .build()
            .unwrap()
    }

    #[test_log::test]
    fn test_options_validation() {
        let clock = ManualClock::default();
        let cache = cache(&clock);

        let options = CacheOptions::default()
            .with_absolute_expiry(clock.now().saturating_add(Duration::from_secs(1)))
            .with_sliding_expiry(Duration::from_secs(1));
        let e = cache.insert(1, "1".to_string(), options).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);

        let options = CacheOptions::default().with_sliding_expiry(MAX_SLIDING_EXPIRY + Duration::from_secs(1));
        let e = cache.insert(1, "1".to_string(), options).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
        assert_eq!(cache.count(), 0);

        // A zero sliding expiration means none.
        let options = CacheOptions::default()
            .with_absolute_expiry(clock.now().saturating_add(Duration::from_secs(1)))
            .with_sliding_expiry(Duration::ZERO);
        cache.insert(1, "1".to_string(), options).unwrap();
        assert_eq!(cache.count(), 1);
    }

    #[test_log::test]
    fn test_config_validation() {
        let e = CacheBuilder::<u64, u64>::new().with_shards(3).build().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Config);
        let e = CacheBuilder::<u64, u64>::new()
            .with_poll_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_config_serde() {
        let config = CacheConfig {
            memory_limit: 64 << 20,
            shards: 8,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<CacheConfig>(&json).unwrap(), config);

        let partial: CacheConfig = serde_json::from_str(r#"{ "item_limit": 1000 }"#).unwrap();
        assert_eq!(partial.item_limit, 1000);
        assert_eq!(partial.grace_window, Duration::from_secs(10));
    }

    #[test_log::test]
    fn test_trim_percent() {
        let clock = ManualClock::default();
        let cache = cache(&clock);
        for i in 0..100 {
            cache.insert(i, i.to_string(), CacheOptions::default()).unwrap();
        }
        clock.advance(Duration::from_secs(60));

        assert_eq!(cache.trim(101).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(cache.trim(0).unwrap(), 0);
        assert_eq!(cache.trim(10).unwrap(), 10);
        assert_eq!(cache.count(), 90);
        assert_eq!(cache.trim(100).unwrap(), 90);
        assert!(cache.audit().is_empty());
    }

    #[test_log::test]
    fn test_namespaces() {
        let clock = ManualClock::default();
        let cache = cache(&clock);
        cache.insert(1, "public".to_string(), CacheOptions::default()).unwrap();
        cache
            .insert(
                1,
                "private".to_string(),
                CacheOptions::default().with_namespace(Namespace::Private),
            )
            .unwrap();

        assert_eq!(cache.get(&1).as_deref(), Some("public"));
        assert_eq!(
            cache.get_with_namespace(&1, Namespace::Private).as_deref(),
            Some("private")
        );
        assert_eq!((cache.count(), cache.public_count()), (2, 1));
        assert_eq!(cache.enumerate(false).count(), 1);
        assert_eq!(cache.enumerate(true).count(), 2);

        assert_eq!(cache.remove(&1).as_deref(), Some("public"));
        assert_eq!(
            cache
                .remove_with_reason(&1, Namespace::Private, RemovedReason::Removed)
                .as_deref(),
            Some("private")
        );
        assert_eq!(cache.count(), 0);
    }

    #[test_log::test]
    fn test_add_dependent() {
        let clock = ManualClock::default();
        let cache = cache(&clock);
        let dependency = Arc::new(ManualDependency::new());
        let as_dyn: Arc<dyn Dependency> = dependency.clone();

        assert_eq!(cache.add_dependent(&1, as_dyn.clone()), (false, Timestamp::ZERO));

        cache.insert(1, "1".to_string(), CacheOptions::default()).unwrap();
        assert_eq!(cache.add_dependent(&1, as_dyn.clone()), (true, clock.now()));
        cache.remove_dependent(&1, &as_dyn);
        cache.remove(&1);
        assert!(!dependency.has_changed());

        cache.insert(1, "1".to_string(), CacheOptions::default()).unwrap();
        assert!(cache.add_dependent(&1, as_dyn).0);
        cache.insert(1, "2".to_string(), CacheOptions::default()).unwrap();
        assert!(dependency.has_changed());
    }

    #[test_log::test]
    fn test_key_dependency_chain() {
        let clock = ManualClock::default();
        let cache = cache(&clock);

        // Entry 2 depends on entry 1.
        cache.insert(1, "1".to_string(), CacheOptions::default()).unwrap();
        let link = Arc::new(ManualDependency::new());
        assert!(cache.add_dependent(&1, link.clone()).0);
        cache
            .insert(2, "2".to_string(), CacheOptions::default().with_dependency(link))
            .unwrap();

        cache.remove(&1);
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.count(), 0);
    }

    #[test_log::test]
    fn test_close() {
        let clock = ManualClock::default();
        let cache = CacheBuilder::new()
            .with_clock(Arc::new(clock.clone()))
            .with_memory_limit(1 << 30)
            .with_sweep_interval(Duration::from_millis(5))
            .with_poll_interval(Duration::from_millis(5))
            .build()
            .unwrap();

        let removed = Arc::new(AtomicUsize::new(0));
        for i in 0..10u64 {
            let removed = removed.clone();
            let options = CacheOptions::default().with_on_removed(move |_: &u64, _: &u64, reason: RemovedReason| {
                assert_eq!(reason, RemovedReason::Removed);
                removed.fetch_add(1, Ordering::SeqCst);
            });
            cache.insert(i, i, options).unwrap();
        }

        cache.close();
        cache.close();
        assert_eq!(removed.load(Ordering::SeqCst), 10);
        assert_eq!(cache.count(), 0);
        assert_eq!(
            cache.insert(1, 1, CacheOptions::default()).unwrap_err().kind(),
            ErrorKind::Closed
        );
    }

    #[test_log::test]
    fn test_drop_closes() {
        let removed = Arc::new(AtomicUsize::new(0));
        {
            let cache: Cache<u64, u64> = CacheBuilder::new().with_memory_limit(1 << 30).build().unwrap();
            let r = removed.clone();
            cache
                .insert(
                    1,
                    1,
                    CacheOptions::default().with_on_removed(move |_: &u64, _: &u64, _: RemovedReason| {
                        r.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .unwrap();
        }
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }
}
