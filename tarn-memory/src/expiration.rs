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

//! Time-bucketed expiration index.
//!
//! The ring has [`BUCKETS`] buckets of [`BUCKET_SPAN`] each, so one cycle covers ten minutes. An entry lives in the
//! bucket its expiration maps to. Entries of later cycles share the bucket, a sweep compares each entry with its own
//! expiration.

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
    slab::SlotArena,
};

/// Bucket count of the ring.
pub const BUCKETS: usize = 30;
/// Time covered by one bucket.
pub const BUCKET_SPAN: Duration = Duration::from_secs(20);
/// Time covered by the whole ring.
pub const CYCLE: Duration = Duration::from_secs(20 * 30);

/// Sliding renewals move the expiration by at least this much, smaller moves are coalesced.
pub const MIN_UPDATE_DELTA: Duration = Duration::from_secs(1);

/// Map an expiration to its bucket.
pub fn bucket_for(expires: Timestamp) -> usize {
    let span = BUCKET_SPAN.as_millis() as u64;
    let cycle = CYCLE.as_millis() as u64;
    ((expires.as_millis() % cycle / span) as usize + 1) % BUCKETS
}

struct ExpiresBucket<K, V> {
    arena: SlotArena<Arc<Record<K, V>>>,
    /// Lower bound of the expirations in the bucket. Raised only by sweeps.
    earliest: Timestamp,
}

impl<K, V> ExpiresBucket<K, V> {
    fn new() -> Self {
        Self {
            arena: SlotArena::new(),
            earliest: Timestamp::NEVER,
        }
    }
}

struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// [`ExpirationIndex`] tracks entries with a real expiration and finds the due ones.
pub struct ExpirationIndex<K, V> {
    buckets: Vec<Mutex<ExpiresBucket<K, V>>>,
    len: AtomicUsize,
    sweeping: AtomicBool,
}

impl<K, V> Default for ExpirationIndex<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ExpirationIndex<K, V> {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKETS).map(|_| Mutex::new(ExpiresBucket::new())).collect(),
            len: AtomicUsize::new(0),
            sweeping: AtomicBool::new(false),
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

    /// Returns `true` while a sweep is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeping.load(Ordering::Acquire)
    }

    /// Index the record by its current expiration.
    ///
    /// Returns `Ok(false)` if the record never expires or is already indexed.
    pub fn add(&self, record: &Arc<Record<K, V>>) -> Result<bool> {
        let expires = record.expires();
        if expires.is_never() {
            return Ok(false);
        }
        let bucket = bucket_for(expires);
        self.buckets[bucket].lock().with(|mut b| -> Result<bool> {
            let slot = b.arena.insert(record.clone())?;
            let index = IndexRef::new(bucket, slot);
            if !record.expires_ref().compare_exchange(None, Some(index)) {
                b.arena.remove(slot);
                return Ok(false);
            }
            if expires < b.earliest {
                b.earliest = expires;
            }
            self.len.fetch_add(1, Ordering::Relaxed);
            Ok(true)
        })
    }

    /// Detach the record. Returns `false` if it is not indexed.
    pub fn remove(&self, record: &Arc<Record<K, V>>) -> bool {
        loop {
            let Some(index) = record.expires_ref().load() else {
                return false;
            };
            let mut bucket = self.buckets[index.bucket()].lock();
            // The reference may have moved between load and lock.
            if record.expires_ref().load() != Some(index) {
                continue;
            }
            let removed = bucket.arena.remove(index.slot());
            strict_assert!(removed.as_ref().is_some_and(|r| Arc::ptr_eq(r, record)));
            let cleared = record.expires_ref().compare_exchange(Some(index), None);
            strict_assert!(cleared);
            drop(bucket);
            self.len.fetch_sub(1, Ordering::Relaxed);
            return true;
        }
    }

    /// Move the record to `expires`.
    ///
    /// The record keeps its slot when the bucket does not change. A record that is not indexed is left alone.
    pub fn reschedule(&self, record: &Arc<Record<K, V>>, expires: Timestamp) -> Result<()> {
        let target = bucket_for(expires);
        loop {
            let Some(index) = record.expires_ref().load() else {
                record.set_expires(expires);
                return Ok(());
            };
            if index.bucket() != target {
                break;
            }
            let mut bucket = self.buckets[index.bucket()].lock();
            if record.expires_ref().load() != Some(index) {
                continue;
            }
            record.set_expires(expires);
            if expires < bucket.earliest {
                bucket.earliest = expires;
            }
            return Ok(());
        }

        if !self.remove(record) {
            record.set_expires(expires);
            return Ok(());
        }
        record.set_expires(expires);
        self.add(record)?;
        Ok(())
    }

    /// Detach every record due at `now` and return them.
    ///
    /// Buckets whose earliest expiration is later than `now` are skipped. Concurrent sweeps return nothing.
    pub fn sweep(&self, now: Timestamp) -> Vec<Arc<Record<K, V>>> {
        if self.sweeping.swap(true, Ordering::AcqRel) {
            return vec![];
        }
        let _guard = SweepGuard(&self.sweeping);

        let mut expired = vec![];
        for (id, bucket) in self.buckets.iter().enumerate() {
            let mut bucket = bucket.lock();
            if bucket.arena.is_empty() || bucket.earliest > now {
                continue;
            }

            bucket.arena.set_shrink_suppressed(true);
            let due = bucket
                .arena
                .iter()
                .filter(|(_, r)| r.is_expired(now))
                .map(|(slot, _)| slot)
                .collect::<Vec<_>>();
            for slot in due {
                let Some(record) = bucket.arena.remove(slot) else {
                    continue;
                };
                let cleared = record
                    .expires_ref()
                    .compare_exchange(Some(IndexRef::new(id, slot)), None);
                strict_assert!(cleared);
                self.len.fetch_sub(1, Ordering::Relaxed);
                expired.push(record);
            }
            bucket.earliest = bucket
                .arena
                .iter()
                .map(|(_, r)| r.expires())
                .min()
                .unwrap_or(Timestamp::NEVER);
            bucket.arena.set_shrink_suppressed(false);
            bucket.arena.release_empty_pages();
        }
        expired
    }

    /// Returns `true` if the record's expiration reference names a slot holding this very record.
    pub fn holds(&self, record: &Arc<Record<K, V>>) -> bool {
        let Some(index) = record.expires_ref().load() else {
            return false;
        };
        self.buckets[index.bucket()]
            .lock()
            .arena
            .get(index.slot())
            .is_some_and(|r| Arc::ptr_eq(r, record))
    }
}
