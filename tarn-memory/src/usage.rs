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

//! Recency index used by pressure-driven trimming.
//!
//! Entries are partitioned by hash into [`BUCKETS`] buckets. Each bucket threads its entries on a doubly linked list
//! stored in a [`SlotArena`], most recently touched at the head.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tarn_common::{clock::Timestamp, error::Result, scope::Scope, strict_assert};

use crate::{
    record::{IndexRef, Record},
    slab::{SlotArena, SlotRef},
};

/// Bucket count of the usage index.
pub const BUCKETS: usize = 4;

fn bucket_of(hash: u64) -> usize {
    (hash >> 32) as usize & (BUCKETS - 1)
}

struct UsageNode<K, V> {
    record: Arc<Record<K, V>>,
    prev: Option<SlotRef>,
    next: Option<SlotRef>,
    added: Timestamp,
}

struct UsageBucket<K, V> {
    arena: SlotArena<UsageNode<K, V>>,
    head: Option<SlotRef>,
    tail: Option<SlotRef>,
}

impl<K, V> UsageBucket<K, V> {
    fn new() -> Self {
        Self {
            arena: SlotArena::new(),
            head: None,
            tail: None,
        }
    }

    fn node_mut(&mut self, slot: SlotRef) -> &mut UsageNode<K, V> {
        match self.arena.get_mut(slot) {
            Some(node) => node,
            None => unreachable!("a linked slot must be occupied"),
        }
    }

    fn link_front(&mut self, slot: SlotRef) {
        let old = self.head;
        {
            let node = self.node_mut(slot);
            node.prev = None;
            node.next = old;
        }
        match old {
            Some(old) => self.node_mut(old).prev = Some(slot),
            None => self.tail = Some(slot),
        }
        self.head = Some(slot);
    }

    fn unlink(&mut self, slot: SlotRef) {
        let (prev, next) = {
            let node = self.node_mut(slot);
            (node.prev.take(), node.next.take())
        };
        match prev {
            Some(prev) => self.node_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.node_mut(next).prev = prev,
            None => self.tail = prev,
        }
    }

    /// Unlink and release the slot, clearing the record's usage reference.
    fn evict(&mut self, bucket: usize, slot: SlotRef) -> Arc<Record<K, V>> {
        self.unlink(slot);
        let Some(node) = self.arena.remove(slot) else {
            unreachable!("a linked slot must be occupied");
        };
        let cleared = node
            .record
            .usage_ref()
            .compare_exchange(Some(IndexRef::new(bucket, slot)), None);
        strict_assert!(cleared);
        node.record
    }

    /// Walk from the tail and evict up to `quota` live records, skipping those added after `added_before`.
    fn select(
        &mut self,
        bucket: usize,
        quota: usize,
        added_before: Option<Timestamp>,
        victims: &mut Vec<Arc<Record<K, V>>>,
    ) -> usize {
        let mut selected = 0;
        let mut cursor = self.tail;
        while let Some(slot) = cursor {
            if selected >= quota {
                break;
            }
            let (prev, eligible) = match self.arena.get(slot) {
                Some(node) => (
                    node.prev,
                    node.record.is_added() && added_before.is_none_or(|before| node.added <= before),
                ),
                None => unreachable!("a linked slot must be occupied"),
            };
            if eligible {
                victims.push(self.evict(bucket, slot));
                selected += 1;
            }
            cursor = prev;
        }
        selected
    }
}

struct TrimGuard<'a>(&'a AtomicBool);

impl Drop for TrimGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// [`UsageIndex`] keeps tracked entries in recency order and picks trim victims coldest first.
pub struct UsageIndex<K, V> {
    buckets: Vec<Mutex<UsageBucket<K, V>>>,
    len: AtomicUsize,
    trimming: AtomicBool,
    update_interval: Duration,
}

impl<K, V> UsageIndex<K, V> {
    /// Create an empty index. Touches closer than `update_interval` to the previous one are dropped.
    pub fn new(update_interval: Duration) -> Self {
        Self {
            buckets: (0..BUCKETS).map(|_| Mutex::new(UsageBucket::new())).collect(),
            len: AtomicUsize::new(0),
            trimming: AtomicBool::new(false),
            update_interval,
        }
    }

    /// Indexed entry count.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns `true` if no entry is indexed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` while a trim is running.
    pub fn is_trimming(&self) -> bool {
        self.trimming.load(Ordering::Acquire)
    }

    /// Link the record at the head of its bucket.
    ///
    /// Returns `Ok(false)` if the record is already indexed.
    pub fn add(&self, record: &Arc<Record<K, V>>, now: Timestamp) -> Result<bool> {
        let bucket = bucket_of(record.hash());
        self.buckets[bucket].lock().with(|mut b| -> Result<bool> {
            let slot = b.arena.insert(UsageNode {
                record: record.clone(),
                prev: None,
                next: None,
                added: now,
            })?;
            if !record
                .usage_ref()
                .compare_exchange(None, Some(IndexRef::new(bucket, slot)))
            {
                b.arena.remove(slot);
                return Ok(false);
            }
            b.link_front(slot);
            record.set_last_usage_update(now);
            self.len.fetch_add(1, Ordering::Relaxed);
            Ok(true)
        })
    }

    /// Move the record to the head of its bucket, at most once per update interval.
    pub fn touch(&self, record: &Arc<Record<K, V>>, now: Timestamp) {
        if now.saturating_duration_since(record.last_usage_update()) < self.update_interval {
            return;
        }
        let mut bucket = self.buckets[bucket_of(record.hash())].lock();
        let Some(index) = record.usage_ref().load() else {
            return;
        };
        strict_assert!(index.bucket() == bucket_of(record.hash()));
        if bucket.head != Some(index.slot()) {
            bucket.unlink(index.slot());
            bucket.link_front(index.slot());
        }
        record.set_last_usage_update(now);
    }

    /// Unlink the record. Returns `false` if it is not indexed.
    pub fn remove(&self, record: &Arc<Record<K, V>>) -> bool {
        let bucket = bucket_of(record.hash());
        let mut b = self.buckets[bucket].lock();
        let Some(index) = record.usage_ref().load() else {
            return false;
        };
        strict_assert!(index.bucket() == bucket);
        let evicted = b.evict(bucket, index.slot());
        strict_assert!(Arc::ptr_eq(&evicted, record));
        drop(b);
        self.len.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Unlink up to `target` records, coldest first, and return them.
    ///
    /// The target is split across buckets by their size, then buckets with eligible records left make up the
    /// shortfall. Records added after `added_before` are skipped. Concurrent trims return nothing.
    pub fn trim(&self, target: usize, added_before: Option<Timestamp>) -> Vec<Arc<Record<K, V>>> {
        if target == 0 || self.trimming.swap(true, Ordering::AcqRel) {
            return vec![];
        }
        let _guard = TrimGuard(&self.trimming);

        let total = self.len();
        if total == 0 {
            return vec![];
        }

        let mut victims = Vec::with_capacity(target.min(total));
        for id in 0..BUCKETS {
            let remaining = target.saturating_sub(victims.len());
            if remaining == 0 {
                return victims;
            }
            self.select(id, added_before, &mut victims, |len| {
                (target * len).div_ceil(total).min(remaining)
            });
        }
        for id in 0..BUCKETS {
            let remaining = target.saturating_sub(victims.len());
            if remaining == 0 {
                break;
            }
            self.select(id, added_before, &mut victims, |_| remaining);
        }
        victims
    }

    fn select(
        &self,
        id: usize,
        added_before: Option<Timestamp>,
        victims: &mut Vec<Arc<Record<K, V>>>,
        quota: impl FnOnce(usize) -> usize,
    ) {
        let mut bucket = self.buckets[id].lock();
        let quota = quota(bucket.arena.len());
        if quota == 0 {
            return;
        }
        bucket.arena.set_shrink_suppressed(true);
        let selected = bucket.select(id, quota, added_before, victims);
        bucket.arena.set_shrink_suppressed(false);
        bucket.arena.release_empty_pages();
        drop(bucket);

        self.len.fetch_sub(selected, Ordering::Relaxed);
    }

    /// Returns `true` if the record's usage reference names a slot holding this very record.
    pub fn holds(&self, record: &Arc<Record<K, V>>) -> bool {
        let Some(index) = record.usage_ref().load() else {
            return false;
        };
        self.buckets[index.bucket()]
            .lock()
            .arena
            .get(index.slot())
            .is_some_and(|node| Arc::ptr_eq(&node.record, record))
    }

    /// Records of every bucket from head to tail.
    #[cfg(test)]
    fn order(&self) -> Vec<Vec<u64>>
    where
        K: Copy + Into<u64>,
    {
        self.buckets
            .iter()
            .map(|b| {
                let b = b.lock();
                let mut keys = vec![];
                let mut cursor = b.head;
                while let Some(slot) = cursor {
                    let node = b.arena.get(slot).unwrap();
                    keys.push((*node.record.key()).into());
                    cursor = node.next;
                }
                keys
            })
            .collect()
    }
}
