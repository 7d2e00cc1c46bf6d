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

use std::{hash::Hash, sync::Arc};

use itertools::Itertools;
use tarn_common::{
    clock::Timestamp,
    code::{HashBuilder, Key, Value},
    error::{Error, ErrorKind, Result},
};

use crate::{
    record::{Record, RemovedReason},
    shard::{Shard, ShardContext},
};

/// Shard count for the current machine: the next power of two of the available parallelism.
pub fn default_shards() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .next_power_of_two()
}

/// Splits the key space across a power-of-two number of shards.
pub struct Router<K, V, S> {
    shards: Vec<Arc<Shard<K, V>>>,
    hash_builder: S,
}

impl<K, V, S> Router<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    /// Create `shards` shards, or [`default_shards`] if `shards` is 0.
    pub fn new(shards: usize, ctx: Arc<ShardContext>, hash_builder: S) -> Result<Self> {
        let shards = match shards {
            0 => default_shards(),
            n if n.is_power_of_two() => n,
            n => {
                return Err(Error::new(ErrorKind::Config, "shard count must be a power of two").with_context("shards", n))
            }
        };
        tracing::debug!("[router]: create {shards} shards");
        Ok(Self {
            shards: (0..shards).map(|_| Arc::new(Shard::new(ctx.clone()))).collect(),
            hash_builder,
        })
    }

    /// Hash a key the way the router places it.
    pub fn hash<Q>(&self, key: &Q) -> u64
    where
        Q: Hash + ?Sized,
    {
        self.hash_builder.hash_one(key)
    }

    /// The shard owning `hash`.
    pub fn shard(&self, hash: u64) -> &Arc<Shard<K, V>> {
        &self.shards[hash as usize & (self.shards.len() - 1)]
    }

    /// All shards.
    pub fn shards(&self) -> &[Arc<Shard<K, V>>] {
        &self.shards
    }

    /// Live entry count of both namespaces.
    pub fn count(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    /// Live entry count of the public namespace.
    pub fn public_count(&self) -> usize {
        self.shards.iter().map(|s| s.public_len()).sum()
    }

    /// Approximate bytes used by live entries.
    pub fn usage(&self) -> usize {
        self.shards.iter().map(|s| s.weight()).sum()
    }

    /// Entries tracked for trimming.
    pub fn tracked(&self) -> usize {
        self.shards.iter().map(|s| s.tracked()).sum()
    }

    /// Returns `true` if any shard is sweeping or trimming.
    pub fn is_busy(&self) -> bool {
        self.shards.iter().any(|s| s.is_busy())
    }

    /// Trim `count` tracked entries across shards, in proportion to each shard's tracked entries.
    ///
    /// Larger shards go first. Shards that could not give their share are made up for by the others. Entries in the
    /// grace window are only taken once no shard has older ones left.
    pub fn trim(&self, count: usize) -> usize {
        let total = self.tracked();
        if count == 0 || total == 0 {
            return 0;
        }
        let shards = self
            .shards
            .iter()
            .map(|s| (s.tracked(), s))
            .sorted_by(|a, b| b.0.cmp(&a.0))
            .collect_vec();

        let mut trimmed = 0;
        for (tracked, shard) in shards.iter() {
            let remaining = count.saturating_sub(trimmed);
            if remaining == 0 {
                return trimmed;
            }
            let quota = (count * tracked).div_ceil(total).min(remaining);
            if quota > 0 {
                trimmed += shard.trim(quota, false);
            }
        }
        for forced in [false, true] {
            for (_, shard) in shards.iter() {
                let remaining = count.saturating_sub(trimmed);
                if remaining == 0 {
                    return trimmed;
                }
                trimmed += shard.trim(remaining, forced);
            }
        }
        trimmed
    }

    /// Remove every entry due at `now` from every shard.
    pub fn flush_expired(&self, now: Timestamp) -> usize {
        self.shards.iter().map(|s| s.flush_expired(now)).sum()
    }

    /// Remove every entry from every shard.
    pub fn clear(&self, reason: RemovedReason) -> usize {
        self.shards.iter().map(|s| s.clear(reason)).sum()
    }

    /// Lazily walk the live entries, one shard snapshot at a time.
    pub fn enumerate(&self, include_private: bool) -> Enumerate<K, V> {
        Enumerate {
            shards: self.shards.clone(),
            next: 0,
            include_private,
            current: vec![].into_iter(),
        }
    }
}

/// Iterator over the live `(key, value)` pairs of a cache.
///
/// Each shard is snapshotted when the iterator reaches it. Entries inserted or removed meanwhile may or may not show
/// up.
pub struct Enumerate<K, V> {
    shards: Vec<Arc<Shard<K, V>>>,
    next: usize,
    include_private: bool,
    current: std::vec::IntoIter<Arc<Record<K, V>>>,
}

impl<K, V> Iterator for Enumerate<K, V>
where
    K: Key,
    V: Value,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.current.next() {
                return Some((record.key().clone(), record.value().clone()));
            }
            let shard = self.shards.get(self.next)?;
            self.next += 1;
            self.current = shard.snapshot(self.include_private).into_iter();
        }
    }
}
