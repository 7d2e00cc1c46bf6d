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

use std::{hash::Hash, sync::Arc, time::Duration};

use equivalent::Equivalent;
use hashbrown::hash_table::{Entry as HashTableEntry, HashTable};
use itertools::Itertools;
use parking_lot::RwLock;
use tarn_common::{
    clock::{Clock, Timestamp},
    code::{Key, Value},
    error::Result,
    metrics::Metrics,
    strict_assert,
};

use crate::{
    dependency::Dependency,
    expiration::{ExpirationIndex, MIN_UPDATE_DELTA},
    gate::Gate,
    pressure::Occupancy,
    record::{EntryState, Flags, Namespace, Priority, Record, RemovedReason},
    usage::UsageIndex,
};

/// Everything the shards of one cache share.
#[derive(Debug)]
pub struct ShardContext {
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<Metrics>,
    pub gate: Arc<Gate>,
    pub occupancy: Arc<Occupancy>,
    pub memory_eviction: bool,
    pub grace_window: Duration,
    pub usage_update_interval: Duration,
    pub insert_block_timeout: Duration,
}

/// How an insert treats an existing live entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Replace it.
    Replace,
    /// Keep it and return it.
    IfAbsent,
}

/// Result of one exclusive update section.
enum Outcome<K, V> {
    /// The incoming record is live. The outgoing one, if any, is detached from the table.
    Published { outgoing: Option<Arc<Record<K, V>>> },
    /// The incoming record was not published.
    Retired { existing: Option<Arc<Record<K, V>>> },
    /// An expired entry was detached from the table, try again.
    RetryExpired(Arc<Record<K, V>>),
}

struct ShardInner<K, V> {
    table: HashTable<Arc<Record<K, V>>>,
    weight: usize,
    public: usize,
}

impl<K, V> ShardInner<K, V> {
    fn account_insert(&mut self, record: &Record<K, V>, ctx: &ShardContext) {
        self.weight += record.weight();
        if record.namespace() == Namespace::Public {
            self.public += 1;
        }
        ctx.occupancy.charge(record.weight());
        ctx.metrics.memory_usage.increase(record.weight() as _);
    }

    fn account_remove(&mut self, record: &Record<K, V>, ctx: &ShardContext) {
        self.weight -= record.weight();
        if record.namespace() == Namespace::Public {
            self.public -= 1;
        }
        ctx.occupancy.discharge(record.weight());
        ctx.metrics.memory_usage.decrease(record.weight() as _);
    }
}

/// One slice of the key space: a hash table plus its expiration and usage indexes.
///
/// The table lock and the bucket locks of the indexes are never held at the same time.
pub struct Shard<K, V> {
    inner: RwLock<ShardInner<K, V>>,
    expiration: ExpirationIndex<K, V>,
    usage: UsageIndex<K, V>,
    ctx: Arc<ShardContext>,
}

impl<K, V> Shard<K, V>
where
    K: Key,
    V: Value,
{
    pub fn new(ctx: Arc<ShardContext>) -> Self {
        Self {
            inner: RwLock::new(ShardInner {
                table: HashTable::new(),
                weight: 0,
                public: 0,
            }),
            expiration: ExpirationIndex::new(),
            usage: UsageIndex::new(ctx.usage_update_interval),
            ctx,
        }
    }

    /// Live entry count of both namespaces.
    pub fn len(&self) -> usize {
        self.inner.read().table.len()
    }

    /// Live entry count of the public namespace.
    pub fn public_len(&self) -> usize {
        self.inner.read().public
    }

    /// Sum of the live entries' weights.
    pub fn weight(&self) -> usize {
        self.inner.read().weight
    }

    /// Entries tracked by the usage index.
    pub fn tracked(&self) -> usize {
        self.usage.len()
    }

    /// Entries held by the expiration index.
    pub fn expiring(&self) -> usize {
        self.expiration.len()
    }

    /// Returns `true` while a sweep or a trim walks the indexes.
    pub fn is_busy(&self) -> bool {
        self.expiration.is_sweeping() || self.usage.is_trimming()
    }

    /// Decide whether the record takes part in pressure trimming.
    ///
    /// Entries that are not going to outlive the grace window are left to expiration.
    fn should_track(&self, record: &Record<K, V>, now: Timestamp) -> bool {
        if !self.ctx.memory_eviction || record.priority() == Priority::NotRemovable {
            return false;
        }
        let lifetime = match record.sliding() {
            Some(sliding) => sliding,
            None if record.expires().is_never() => Duration::MAX,
            None => record.expires().saturating_duration_since(now),
        };
        lifetime > self.ctx.grace_window
    }

    #[cfg_attr(feature = "tracing", fastrace::trace(name = "tarn::memory::shard::get"))]
    pub fn get<Q>(&self, hash: u64, key: &Q, namespace: Namespace) -> Option<Arc<Record<K, V>>>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let now = self.ctx.clock.now();
        let record = self
            .inner
            .read()
            .table
            .find(hash, |r| r.namespace() == namespace && key.equivalent(r.key()))
            .cloned();
        let Some(record) = record else {
            self.ctx.metrics.memory_miss.increase(1);
            return None;
        };

        if record.is_expired(now) {
            self.remove_record(&record, RemovedReason::Expired);
            self.ctx.metrics.memory_miss.increase(1);
            return None;
        }

        if let Some(sliding) = record.sliding() {
            self.renew(&record, now, sliding);
        }
        if record.is_tracked() {
            self.usage.touch(&record, now);
        }

        self.ctx.metrics.memory_hit.increase(1);
        Some(record)
    }

    /// Push a sliding expiration forward.
    ///
    /// Moves smaller than [`MIN_UPDATE_DELTA`], or a quarter of the sliding duration if that is shorter, are coalesced.
    fn renew(&self, record: &Arc<Record<K, V>>, now: Timestamp, sliding: Duration) {
        let expires = now.saturating_add(sliding);
        if expires.saturating_duration_since(record.expires()) < MIN_UPDATE_DELTA.min(sliding / 4) {
            return;
        }
        if let Err(e) = self.expiration.reschedule(record, expires) {
            tracing::warn!("[shard]: reschedule record (hash: {}) failed: {e}", record.hash());
        }
        // A concurrent removal may have missed the moved reference.
        if !record.is_added() {
            self.expiration.remove(record);
        }
    }

    /// Publish the record.
    ///
    /// Returns the record it replaced with [`UpdateMode::Replace`], or the live record it yielded to with
    /// [`UpdateMode::IfAbsent`]. Returns `None` as well if the record's dependency had already changed.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "tarn::memory::shard::insert"))]
    pub fn insert(self: &Arc<Self>, record: Arc<Record<K, V>>, mode: UpdateMode) -> Result<Option<Arc<Record<K, V>>>> {
        let now = self.ctx.clock.now();
        record.set_tracked(self.should_track(&record, now));

        if record.is_tracked() && !self.ctx.gate.is_open() {
            self.ctx.metrics.memory_gate_wait.increase(1);
            if !self.ctx.gate.wait(self.ctx.insert_block_timeout) {
                tracing::debug!(
                    "[shard]: insert gate still closed after {:?}, proceed",
                    self.ctx.insert_block_timeout
                );
            }
        }

        let outgoing = loop {
            match self.update(&record, mode, self.ctx.clock.now()) {
                Outcome::RetryExpired(expired) => self.finish_removal(&expired, RemovedReason::Expired),
                Outcome::Retired { existing } => {
                    if existing.is_none() {
                        record.fire_removed(RemovedReason::DependencyChanged);
                    }
                    return Ok(existing);
                }
                Outcome::Published { outgoing } => break outgoing,
            }
        };

        match outgoing.as_ref() {
            Some(outgoing) => {
                self.ctx.metrics.memory_replace.increase(1);
                self.finish_removal(outgoing, RemovedReason::Removed);
            }
            None => self.ctx.metrics.memory_insert.increase(1),
        }

        if let Err(e) = self.attach(&record, now) {
            // Not published after all, the caller gets the error instead of a callback.
            record.set_flags(Flags::CALLBACK_FIRED, true, std::sync::atomic::Ordering::Release);
            self.remove_record(&record, RemovedReason::Removed);
            return Err(e);
        }

        self.subscribe(&record);

        Ok(outgoing)
    }

    /// The exclusive section of an insert.
    fn update(&self, record: &Arc<Record<K, V>>, mode: UpdateMode, now: Timestamp) -> Outcome<K, V> {
        let mut inner = self.inner.write();
        let namespace = record.namespace();

        let entry = inner.table.entry(
            record.hash(),
            |r| r.namespace() == namespace && r.key() == record.key(),
            |r| r.hash(),
        );

        let outgoing = match entry {
            HashTableEntry::Occupied(o) if o.get().is_expired(now) => {
                let (expired, _) = o.remove();
                expired.set_state(EntryState::RemovingFromCache);
                inner.account_remove(&expired, &self.ctx);
                return Outcome::RetryExpired(expired);
            }
            HashTableEntry::Occupied(o) if mode == UpdateMode::IfAbsent => {
                return Outcome::Retired {
                    existing: Some(o.get().clone()),
                };
            }
            _ if record.dependency_changed() => {
                record.set_state(EntryState::RemovedFromCache);
                return Outcome::Retired { existing: None };
            }
            HashTableEntry::Occupied(mut o) => {
                record.set_state(EntryState::AddingToCache);
                let outgoing = std::mem::replace(o.get_mut(), record.clone());
                outgoing.set_state(EntryState::RemovingFromCache);
                Some(outgoing)
            }
            HashTableEntry::Vacant(v) => {
                record.set_state(EntryState::AddingToCache);
                v.insert(record.clone());
                None
            }
        };

        if let Some(outgoing) = outgoing.as_ref() {
            inner.account_remove(outgoing, &self.ctx);
        }
        inner.account_insert(record, &self.ctx);
        record.set_state(EntryState::AddedToCache);

        Outcome::Published { outgoing }
    }

    /// Link a published record into the indexes.
    fn attach(&self, record: &Arc<Record<K, V>>, now: Timestamp) -> Result<()> {
        self.expiration.add(record)?;
        if record.is_tracked() {
            self.usage.add(record, now)?;
        }
        // A removal that ran before the links existed could not detach them.
        if !record.is_added() {
            self.expiration.remove(record);
            self.usage.remove(record);
        }
        Ok(())
    }

    /// Listen to the record's dependency.
    fn subscribe(self: &Arc<Self>, record: &Arc<Record<K, V>>) {
        let Some(dependency) = record.dependency() else {
            return;
        };

        let shard = Arc::downgrade(self);
        let weak = Arc::downgrade(record);
        let id = dependency.add_listener(Box::new(move || {
            if let (Some(shard), Some(record)) = (shard.upgrade(), weak.upgrade()) {
                shard.remove_record(&record, RemovedReason::DependencyChanged);
            }
        }));
        record.set_listener(id);

        // The record may have left, or the dependency may have fired, before the listener was in place.
        if !record.is_added() {
            if let Some(id) = record.take_listener() {
                dependency.remove_listener(id);
            }
        } else if dependency.has_changed() {
            self.remove_record(record, RemovedReason::DependencyChanged);
        }
    }

    #[cfg_attr(feature = "tracing", fastrace::trace(name = "tarn::memory::shard::remove"))]
    pub fn remove<Q>(
        &self,
        hash: u64,
        key: &Q,
        namespace: Namespace,
        reason: RemovedReason,
    ) -> Option<Arc<Record<K, V>>>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let now = self.ctx.clock.now();
        let record = {
            let mut inner = self.inner.write();
            let entry = inner
                .table
                .find_entry(hash, |r| r.namespace() == namespace && key.equivalent(r.key()))
                .ok()?;
            let (record, _) = entry.remove();
            record.set_state(EntryState::RemovingFromCache);
            inner.account_remove(&record, &self.ctx);
            record
        };

        if record.is_expired(now) {
            self.finish_removal(&record, RemovedReason::Expired);
            return None;
        }
        self.finish_removal(&record, reason);
        Some(record)
    }

    /// Remove this very record if it is still in the table. Returns `false` if it has already left.
    pub fn remove_record(&self, record: &Arc<Record<K, V>>, reason: RemovedReason) -> bool {
        {
            let mut inner = self.inner.write();
            let Ok(entry) = inner.table.find_entry(record.hash(), |r| Arc::ptr_eq(r, record)) else {
                return false;
            };
            entry.remove();
            record.set_state(EntryState::RemovingFromCache);
            inner.account_remove(record, &self.ctx);
        }
        self.finish_removal(record, reason);
        true
    }

    /// Everything after the table detach: index links, dependency listener, dependents, callback.
    fn finish_removal(&self, record: &Arc<Record<K, V>>, reason: RemovedReason) {
        strict_assert!(record.state() == EntryState::RemovingFromCache);

        self.expiration.remove(record);
        self.usage.remove(record);

        if let Some(id) = record.take_listener() {
            if let Some(dependency) = record.dependency() {
                dependency.remove_listener(id);
            }
        }
        for dependent in record.take_dependents() {
            dependent.on_dependent_removed();
        }

        record.set_state(EntryState::RemovedFromCache);

        match reason {
            RemovedReason::Removed => self.ctx.metrics.memory_remove.increase(1),
            RemovedReason::Expired => self.ctx.metrics.memory_expire.increase(1),
            RemovedReason::Underused => self.ctx.metrics.memory_trim.increase(1),
            RemovedReason::DependencyChanged => self.ctx.metrics.memory_dependency_changed.increase(1),
        }

        record.fire_removed(reason);
    }

    /// Remove every entry due at `now`. Returns the removed count.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "tarn::memory::shard::flush_expired"))]
    pub fn flush_expired(&self, now: Timestamp) -> usize {
        self.expiration
            .sweep(now)
            .iter()
            .filter(|record| self.remove_record(record, RemovedReason::Expired))
            .count()
    }

    /// Remove up to `count` of the coldest tracked entries. Returns the removed count.
    ///
    /// Unless `forced`, entries added within the grace window are spared.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "tarn::memory::shard::trim"))]
    pub fn trim(&self, count: usize, forced: bool) -> usize {
        let added_before = (!forced).then(|| {
            let now = self.ctx.clock.now();
            Timestamp::from_millis(now.as_millis().saturating_sub(self.ctx.grace_window.as_millis() as u64))
        });
        self.usage
            .trim(count, added_before)
            .iter()
            .filter(|record| self.remove_record(record, RemovedReason::Underused))
            .count()
    }

    /// Remove every entry with `reason`. Returns the removed count.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "tarn::memory::shard::clear"))]
    pub fn clear(&self, reason: RemovedReason) -> usize {
        let records = {
            let mut inner = self.inner.write();
            let records = inner.table.drain().collect_vec();
            for record in records.iter() {
                record.set_state(EntryState::RemovingFromCache);
                inner.account_remove(record, &self.ctx);
            }
            records
        };
        // Do not run callbacks within the lock section.
        for record in records.iter() {
            self.finish_removal(record, reason);
        }
        records.len()
    }

    /// Attach `dependency` to the live entry of `key`. Returns the entry's creation time if it was accepted.
    pub fn add_dependent<Q>(
        &self,
        hash: u64,
        key: &Q,
        namespace: Namespace,
        dependency: Arc<dyn Dependency>,
    ) -> Option<Timestamp>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let record = self.find_live(hash, key, namespace)?;
        record.add_dependent(dependency).then(|| record.created())
    }

    /// Detach a dependency attached with [`Shard::add_dependent`].
    pub fn remove_dependent<Q>(&self, hash: u64, key: &Q, namespace: Namespace, dependency: &Arc<dyn Dependency>)
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        if let Some(record) = self.find_live(hash, key, namespace) {
            record.remove_dependent(dependency);
        }
    }

    fn find_live<Q>(&self, hash: u64, key: &Q, namespace: Namespace) -> Option<Arc<Record<K, V>>>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let now = self.ctx.clock.now();
        self.inner
            .read()
            .table
            .find(hash, |r| r.namespace() == namespace && key.equivalent(r.key()))
            .filter(|r| !r.is_expired(now))
            .cloned()
    }

    /// Live, unexpired entries at this moment.
    pub fn snapshot(&self, include_private: bool) -> Vec<Arc<Record<K, V>>> {
        let now = self.ctx.clock.now();
        self.inner
            .read()
            .table
            .iter()
            .filter(|r| include_private || r.namespace() == Namespace::Public)
            .filter(|r| !r.is_expired(now))
            .cloned()
            .collect_vec()
    }

    /// Check the table against both indexes. Returns a description of each broken link.
    ///
    /// Only meaningful while no other operation runs on the shard.
    pub fn audit(&self) -> Vec<String> {
        let (records, weight, public) = {
            let inner = self.inner.read();
            (inner.table.iter().cloned().collect_vec(), inner.weight, inner.public)
        };

        let mut violations = vec![];
        let mut expiring = 0;
        let mut tracked = 0;
        for record in records.iter() {
            if record.state() != EntryState::AddedToCache {
                violations.push(format!("record {record:?} in table is not live"));
            }
            match record.expires_ref().load() {
                Some(_) if !self.expiration.holds(record) => {
                    violations.push(format!("record {record:?} expiration reference is dangling"))
                }
                Some(_) => expiring += 1,
                None if !record.expires().is_never() => {
                    violations.push(format!("record {record:?} expires but is not indexed"))
                }
                None => {}
            }
            match (record.usage_ref().load(), record.is_tracked()) {
                (Some(_), true) if self.usage.holds(record) => tracked += 1,
                (None, false) => {}
                _ => violations.push(format!("record {record:?} usage reference does not match tracking")),
            }
        }

        if expiring != self.expiration.len() {
            violations.push(format!(
                "expiration index holds {} records, table has {expiring}",
                self.expiration.len()
            ));
        }
        if tracked != self.usage.len() {
            violations.push(format!("usage index holds {} records, table has {tracked}", self.usage.len()));
        }
        if weight != records.iter().map(|r| r.weight()).sum::<usize>() {
            violations.push(format!("shard weight {weight} does not match its records"));
        }
        if public != records.iter().filter(|r| r.namespace() == Namespace::Public).count() {
            violations.push(format!("shard public count {public} does not match its records"));
        }
        violations
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use tarn_common::clock::ManualClock;

    use super::*;
    use crate::{
        dependency::ManualDependency,
        record::{Data, RemovedCallback},
    };

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<Shard<u64, u64>>();
    }

    struct Harness {
        clock: ManualClock,
        gate: Arc<Gate>,
        shard: Arc<Shard<u64, u64>>,
        removed: Arc<Mutex<Vec<(u64, RemovedReason)>>>,
    }

    impl Harness {
        fn new(memory_eviction: bool) -> Self {
            let clock = ManualClock::new(Timestamp::from_millis(1_000_000));
            let gate = Arc::new(Gate::new());
            let ctx = ShardContext {
                clock: Arc::new(clock.clone()),
                metrics: Arc::new(Metrics::noop()),
                gate: gate.clone(),
                occupancy: Arc::new(Occupancy::default()),
                memory_eviction,
                grace_window: Duration::from_secs(10),
                usage_update_interval: Duration::from_secs(1),
                insert_block_timeout: Duration::from_millis(50),
            };
            Self {
                clock,
                gate,
                shard: Arc::new(Shard::new(Arc::new(ctx))),
                removed: Arc::new(Mutex::new(vec![])),
            }
        }

        fn record(&self, key: u64, ttl: Option<Duration>, sliding: Option<Duration>) -> Arc<Record<u64, u64>> {
            let removed = self.removed.clone();
            let callback: RemovedCallback<u64, u64> = Arc::new(move |k: &u64, _: &u64, reason: RemovedReason| {
                removed.lock().unwrap().push((*k, reason));
            });
            self.record_with(key, ttl, sliding, callback)
        }

        /// A record whose removal callback panics.
        fn panicking(&self, key: u64, ttl: Option<Duration>) -> Arc<Record<u64, u64>> {
            let callback: RemovedCallback<u64, u64> = Arc::new(|k: &u64, _: &u64, reason: RemovedReason| {
                panic!("removal callback of {k} failed with {reason:?}");
            });
            self.record_with(key, ttl, None, callback)
        }

        fn record_with(
            &self,
            key: u64,
            ttl: Option<Duration>,
            sliding: Option<Duration>,
            callback: RemovedCallback<u64, u64>,
        ) -> Arc<Record<u64, u64>> {
            let now = self.clock.now();
            let expires = match (ttl, sliding) {
                (Some(ttl), _) => now.saturating_add(ttl),
                (None, Some(sliding)) => now.saturating_add(sliding),
                (None, None) => Timestamp::NEVER,
            };
            Arc::new(Record::new(Data {
                key,
                value: key * 10,
                namespace: Namespace::Public,
                hash: key,
                weight: 8,
                priority: Priority::Normal,
                expires,
                sliding,
                created: now,
                dependency: None,
                on_removed: Some(callback),
            }))
        }

        fn removed(&self) -> Vec<(u64, RemovedReason)> {
            std::mem::take(&mut *self.removed.lock().unwrap())
        }
    }

    #[test_log::test]
    fn test_insert_get_remove() {
        let h = Harness::new(true);
        assert!(h.shard.insert(h.record(1, None, None), UpdateMode::Replace).unwrap().is_none());
        assert_eq!(*h.shard.get(1, &1, Namespace::Public).unwrap().value(), 10);
        assert!(h.shard.get(1, &1, Namespace::Private).is_none());
        assert_eq!((h.shard.len(), h.shard.public_len(), h.shard.weight()), (1, 1, 8));
        assert_eq!(h.shard.tracked(), 1);
        assert!(h.shard.audit().is_empty());

        let removed = h.shard.remove(1, &1, Namespace::Public, RemovedReason::Removed).unwrap();
        assert_eq!(removed.state(), EntryState::RemovedFromCache);
        assert!(h.shard.remove(1, &1, Namespace::Public, RemovedReason::Removed).is_none());
        assert_eq!(h.removed(), vec![(1, RemovedReason::Removed)]);
        assert_eq!((h.shard.len(), h.shard.weight(), h.shard.tracked()), (0, 0, 0));
        assert!(h.shard.audit().is_empty());
    }

    #[test_log::test]
    fn test_replace_and_if_absent() {
        let h = Harness::new(true);
        let first = h.record(1, None, None);
        h.shard.insert(first.clone(), UpdateMode::Replace).unwrap();

        let existing = h.shard.insert(h.record(1, None, None), UpdateMode::IfAbsent).unwrap().unwrap();
        assert!(Arc::ptr_eq(&existing, &first));
        assert!(h.removed().is_empty());

        let outgoing = h.shard.insert(h.record(1, None, None), UpdateMode::Replace).unwrap().unwrap();
        assert!(Arc::ptr_eq(&outgoing, &first));
        assert_eq!(first.state(), EntryState::RemovedFromCache);
        assert!(!first.is_tracked() || first.usage_ref().load().is_none());
        assert_eq!(h.removed(), vec![(1, RemovedReason::Removed)]);
        assert_eq!(h.shard.len(), 1);
        assert!(h.shard.audit().is_empty());
    }

    #[test_log::test]
    fn test_expired_on_get_and_insert() {
        let h = Harness::new(true);
        h.shard
            .insert(h.record(1, Some(Duration::from_secs(5)), None), UpdateMode::Replace)
            .unwrap();
        h.shard
            .insert(h.record(2, Some(Duration::from_secs(5)), None), UpdateMode::Replace)
            .unwrap();
        assert_eq!(h.shard.expiring(), 2);
        // Short-lived entries are left to expiration.
        assert_eq!(h.shard.tracked(), 0);

        h.clock.advance(Duration::from_secs(5));
        assert!(h.shard.get(1, &1, Namespace::Public).is_none());
        assert_eq!(h.removed(), vec![(1, RemovedReason::Expired)]);

        // The expired entry is evicted and the insert goes through.
        assert!(h
            .shard
            .insert(h.record(2, None, None), UpdateMode::IfAbsent)
            .unwrap()
            .is_none());
        assert_eq!(h.removed(), vec![(2, RemovedReason::Expired)]);
        assert_eq!(h.shard.len(), 1);
        assert!(h.shard.audit().is_empty());
    }

    #[test_log::test]
    fn test_flush_expired() {
        let h = Harness::new(true);
        for key in 0..100 {
            let ttl = Duration::from_secs(if key % 2 == 0 { 30 } else { 300 });
            h.shard.insert(h.record(key, Some(ttl), None), UpdateMode::Replace).unwrap();
        }
        h.clock.advance(Duration::from_secs(60));
        assert_eq!(h.shard.flush_expired(h.clock.now()), 50);
        assert_eq!(h.shard.len(), 50);
        assert!(h.removed().iter().all(|(k, r)| k % 2 == 0 && *r == RemovedReason::Expired));
        assert!(h.shard.audit().is_empty());
    }

    #[test_log::test]
    fn test_flush_expired_with_panicking_callback() {
        let h = Harness::new(true);
        let ttl = Some(Duration::from_secs(30));
        for key in 0..5 {
            let record = match key {
                2 => h.panicking(key, ttl),
                _ => h.record(key, ttl, None),
            };
            h.shard.insert(record, UpdateMode::Replace).unwrap();
        }
        h.shard.insert(h.record(5, None, None), UpdateMode::Replace).unwrap();

        h.clock.advance(Duration::from_secs(60));
        assert_eq!(h.shard.flush_expired(h.clock.now()), 5);
        let mut removed = h.removed();
        removed.sort();
        assert_eq!(
            removed,
            [0, 1, 3, 4].into_iter().map(|k| (k, RemovedReason::Expired)).collect_vec()
        );
        for key in 0..5 {
            assert!(h.shard.get(key, &key, Namespace::Public).is_none());
        }
        assert_eq!((h.shard.len(), h.shard.tracked()), (1, 1));
        assert!(h.shard.audit().is_empty());
    }

    #[test_log::test]
    fn test_trim_with_panicking_callback() {
        let h = Harness::new(true);
        for key in 0..5 {
            let record = match key {
                2 => h.panicking(key, None),
                _ => h.record(key, None, None),
            };
            h.shard.insert(record, UpdateMode::Replace).unwrap();
        }
        h.clock.advance(Duration::from_secs(60));

        assert_eq!(h.shard.trim(5, false), 5);
        let mut removed = h.removed();
        removed.sort();
        assert_eq!(
            removed,
            [0, 1, 3, 4].into_iter().map(|k| (k, RemovedReason::Underused)).collect_vec()
        );
        assert_eq!((h.shard.len(), h.shard.weight(), h.shard.tracked()), (0, 0, 0));
        assert!(h.shard.audit().is_empty());
    }

    #[test_log::test]
    fn test_sliding_renewal() {
        let h = Harness::new(true);
        let sliding = Duration::from_secs(30);
        h.shard.insert(h.record(1, None, Some(sliding)), UpdateMode::Replace).unwrap();

        for _ in 0..10 {
            h.clock.advance(Duration::from_secs(20));
            let record = h.shard.get(1, &1, Namespace::Public).unwrap();
            assert_eq!(record.expires(), h.clock.now().saturating_add(sliding));
        }
        assert!(h.shard.audit().is_empty());

        h.clock.advance(sliding);
        assert_eq!(h.shard.flush_expired(h.clock.now()), 1);
        assert!(h.shard.get(1, &1, Namespace::Public).is_none());
    }

    #[test_log::test]
    fn test_sliding_renewal_coalesced() {
        let h = Harness::new(true);
        let sliding = Duration::from_secs(30);
        h.shard.insert(h.record(1, None, Some(sliding)), UpdateMode::Replace).unwrap();
        let expires = h.shard.get(1, &1, Namespace::Public).unwrap().expires();

        h.clock.advance(Duration::from_millis(500));
        assert_eq!(h.shard.get(1, &1, Namespace::Public).unwrap().expires(), expires);

        // Short sliding durations renew on smaller moves.
        let sliding = Duration::from_secs(1);
        h.shard.insert(h.record(2, None, Some(sliding)), UpdateMode::Replace).unwrap();
        h.clock.advance(Duration::from_millis(500));
        let record = h.shard.get(2, &2, Namespace::Public).unwrap();
        assert_eq!(record.expires(), h.clock.now().saturating_add(sliding));
        assert!(h.shard.audit().is_empty());
    }

    #[test_log::test]
    fn test_trim() {
        let h = Harness::new(true);
        for key in 0..10 {
            h.shard.insert(h.record(key, None, None), UpdateMode::Replace).unwrap();
        }
        h.clock.advance(Duration::from_secs(60));
        for key in 0..5 {
            h.shard.get(key, &key, Namespace::Public).unwrap();
        }

        assert_eq!(h.shard.trim(3, false), 3);
        let mut trimmed = h.removed().into_iter().map(|(k, _)| k).collect_vec();
        trimmed.sort();
        assert_eq!(trimmed, vec![5, 6, 7]);
        assert!(h.shard.audit().is_empty());
    }

    #[test_log::test]
    fn test_not_removable_and_disabled_eviction() {
        let h = Harness::new(true);
        let record = h.record(1, None, None);
        let pinned = Arc::new(Record::new(Data {
            key: 2,
            value: 20,
            namespace: Namespace::Private,
            hash: 2,
            weight: 8,
            priority: Priority::NotRemovable,
            expires: Timestamp::NEVER,
            sliding: None,
            created: h.clock.now(),
            dependency: None,
            on_removed: None,
        }));
        h.shard.insert(record, UpdateMode::Replace).unwrap();
        h.shard.insert(pinned, UpdateMode::Replace).unwrap();
        assert_eq!((h.shard.len(), h.shard.public_len(), h.shard.tracked()), (2, 1, 1));
        assert_eq!(h.shard.snapshot(false).len(), 1);
        assert_eq!(h.shard.snapshot(true).len(), 2);

        let h = Harness::new(false);
        h.shard.insert(h.record(1, None, None), UpdateMode::Replace).unwrap();
        assert_eq!(h.shard.tracked(), 0);
        assert_eq!(h.shard.trim(1, true), 0);
    }

    #[test_log::test]
    fn test_dependency() {
        let h = Harness::new(true);
        let dependency = Arc::new(ManualDependency::new());
        let record = Arc::new(Record::new(Data {
            key: 1,
            value: 10,
            namespace: Namespace::Public,
            hash: 1,
            weight: 8,
            priority: Priority::Normal,
            expires: Timestamp::NEVER,
            sliding: None,
            created: h.clock.now(),
            dependency: Some(dependency.clone()),
            on_removed: None,
        }));
        h.shard.insert(record.clone(), UpdateMode::Replace).unwrap();
        assert_eq!(dependency.listeners(), 1);

        dependency.notify_changed();
        assert_eq!(record.state(), EntryState::RemovedFromCache);
        assert_eq!(h.shard.len(), 0);
        assert_eq!(dependency.listeners(), 0);

        // Already changed, never published.
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let retired = Arc::new(Record::new(Data {
            key: 2,
            value: 20,
            namespace: Namespace::Public,
            hash: 2,
            weight: 8,
            priority: Priority::Normal,
            expires: Timestamp::NEVER,
            sliding: None,
            created: h.clock.now(),
            dependency: Some(dependency.clone()),
            on_removed: Some(Arc::new(move |_: &u64, _: &u64, reason: RemovedReason| {
                assert_eq!(reason, RemovedReason::DependencyChanged);
                hits2.fetch_add(1, Ordering::SeqCst);
            })),
        }));
        assert!(h.shard.insert(retired.clone(), UpdateMode::Replace).unwrap().is_none());
        assert_eq!(retired.state(), EntryState::RemovedFromCache);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(h.shard.len(), 0);
        assert!(h.shard.audit().is_empty());
    }

    #[test_log::test]
    fn test_dependents() {
        let h = Harness::new(true);
        h.shard.insert(h.record(1, None, None), UpdateMode::Replace).unwrap();
        let dependent = Arc::new(ManualDependency::new());
        let as_dyn: Arc<dyn Dependency> = dependent.clone();

        assert_eq!(h.shard.add_dependent(1, &1, Namespace::Public, as_dyn.clone()), Some(h.clock.now()));
        assert_eq!(h.shard.add_dependent(2, &2, Namespace::Public, as_dyn.clone()), None);
        assert!(!dependent.has_changed());

        h.shard.remove(1, &1, Namespace::Public, RemovedReason::Removed);
        assert!(dependent.has_changed());
    }

    #[test_log::test]
    fn test_gate_bounds_tracked_inserts() {
        let h = Harness::new(true);
        h.gate.close();
        let start = std::time::Instant::now();
        h.shard.insert(h.record(1, None, None), UpdateMode::Replace).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(h.shard.len(), 1);

        // Short-lived entries are not tracked and do not wait.
        let start = std::time::Instant::now();
        h.shard
            .insert(h.record(2, Some(Duration::from_secs(1)), None), UpdateMode::Replace)
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test_log::test]
    fn test_clear() {
        let h = Harness::new(true);
        for key in 0..20 {
            h.shard
                .insert(h.record(key, Some(Duration::from_secs(600)), None), UpdateMode::Replace)
                .unwrap();
        }
        assert_eq!(h.shard.clear(RemovedReason::Removed), 20);
        assert_eq!((h.shard.len(), h.shard.weight(), h.shard.tracked(), h.shard.expiring()), (0, 0, 0, 0));
        assert_eq!(h.removed().len(), 20);
        assert!(h.shard.audit().is_empty());
    }
}
