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
    fmt::Debug,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use bitflags::bitflags;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tarn_common::clock::Timestamp;

use crate::{
    dependency::{Dependency, ListenerId},
    slab::SlotRef,
};

/// Logical namespace of an entry.
///
/// One physical table serves both namespaces. Private entries are hidden from enumeration unless asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Namespace {
    /// Entries visible to regular callers.
    #[default]
    Public,
    /// Entries used internally by the owner of the cache.
    Private,
}

/// Priority hint of an entry.
///
/// The trimmer does not rank by priority, except that [`Priority::NotRemovable`] entries are never tracked for usage and
/// thus never trimmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    /// Lowest.
    Low,
    /// Below normal.
    BelowNormal,
    /// Default priority.
    #[default]
    Normal,
    /// Above normal.
    AboveNormal,
    /// Highest removable priority.
    High,
    /// Never trimmed under memory pressure. Still expires and can be removed explicitly.
    NotRemovable,
}

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RemovedReason {
    /// Removed or replaced by the caller, or evicted on shutdown.
    Removed,
    /// Its absolute or sliding expiration passed.
    Expired,
    /// Trimmed under memory pressure.
    Underused,
    /// Its dependency reported a change.
    DependencyChanged,
}

/// Callback invoked once when an entry leaves the cache.
pub type RemovedCallback<K, V> = Arc<dyn Fn(&K, &V, RemovedReason) + Send + Sync + 'static>;

/// Lifecycle of an entry.
///
/// `NotInCache -> AddingToCache -> AddedToCache -> RemovingFromCache -> RemovedFromCache`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum EntryState {
    /// Built, not yet seen by the table.
    NotInCache = 0,
    /// Being published under the shard lock.
    AddingToCache = 1,
    /// Live in the table.
    AddedToCache = 2,
    /// Detached from the table, indexes and callback pending.
    RemovingFromCache = 3,
    /// Terminal.
    RemovedFromCache = 4,
}

impl EntryState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NotInCache,
            1 => Self::AddingToCache,
            2 => Self::AddedToCache,
            3 => Self::RemovingFromCache,
            _ => Self::RemovedFromCache,
        }
    }
}

/// Position of an entry in one of the bucketed indexes: bucket id plus slot handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRef {
    bucket: u8,
    slot: SlotRef,
}

impl IndexRef {
    const VALID: u64 = 1 << 63;

    /// Create an index reference.
    pub fn new(bucket: usize, slot: SlotRef) -> Self {
        debug_assert!(bucket <= u8::MAX as usize);
        Self {
            bucket: bucket as u8,
            slot,
        }
    }

    /// Bucket id.
    pub fn bucket(&self) -> usize {
        self.bucket as usize
    }

    /// Slot handle within the bucket.
    pub fn slot(&self) -> SlotRef {
        self.slot
    }

    fn pack(self) -> u64 {
        Self::VALID | (self.bucket as u64) << 40 | (self.slot.page() as u64) << 8 | self.slot.slot() as u64
    }

    fn unpack(v: u64) -> Option<Self> {
        if v & Self::VALID == 0 {
            return None;
        }
        Some(Self {
            bucket: (v >> 40) as u8,
            slot: SlotRef::new((v >> 8) as u32, v as u8),
        })
    }
}

/// Atomic optional [`IndexRef`].
///
/// A reference into bucket `b` only changes while the lock of bucket `b` is held.
#[derive(Debug, Default)]
pub struct AtomicIndexRef(AtomicU64);

impl AtomicIndexRef {
    /// Load the current reference.
    pub fn load(&self) -> Option<IndexRef> {
        IndexRef::unpack(self.0.load(Ordering::SeqCst))
    }

    /// Replace `current` with `new`, returns `false` if the reference is no longer `current`.
    pub fn compare_exchange(&self, current: Option<IndexRef>, new: Option<IndexRef>) -> bool {
        let current = current.map(IndexRef::pack).unwrap_or_default();
        let new = new.map(IndexRef::pack).unwrap_or_default();
        self.0
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

bitflags! {
    /// Atomic flags of a [`Record`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Flags: u8 {
        /// Linked into the usage index.
        const TRACKED = 0b00000001;
        /// The removal callback has run, or must never run.
        const CALLBACK_FIRED = 0b00000010;
    }
}

/// Everything needed to build a [`Record`].
pub struct Data<K, V> {
    pub key: K,
    pub value: V,
    pub namespace: Namespace,
    pub hash: u64,
    pub weight: usize,
    pub priority: Priority,
    pub expires: Timestamp,
    pub sliding: Option<Duration>,
    pub created: Timestamp,
    pub dependency: Option<Arc<dyn Dependency>>,
    pub on_removed: Option<RemovedCallback<K, V>>,
}

/// [`Record`] holds one cached key value pair with its expiration, usage and lifecycle bookkeeping.
pub struct Record<K, V> {
    key: K,
    value: V,
    namespace: Namespace,
    hash: u64,
    weight: usize,
    priority: Priority,
    sliding: Option<Duration>,
    created: Timestamp,
    dependency: Option<Arc<dyn Dependency>>,
    on_removed: Option<RemovedCallback<K, V>>,

    state: AtomicU8,
    flags: AtomicU8,
    expires: AtomicU64,
    last_usage_update: AtomicU64,
    expires_ref: AtomicIndexRef,
    usage_ref: AtomicIndexRef,

    listener: Mutex<Option<ListenerId>>,
    /// `None` once the record has left the cache.
    dependents: Mutex<Option<Vec<Arc<dyn Dependency>>>>,
}

impl<K, V> Debug for Record<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("hash", &self.hash)
            .field("namespace", &self.namespace)
            .field("state", &self.state())
            .field("expires", &self.expires())
            .field("expires_ref", &self.expires_ref.load())
            .field("usage_ref", &self.usage_ref.load())
            .finish()
    }
}

impl<K, V> Record<K, V> {
    /// Create a record with data.
    pub fn new(data: Data<K, V>) -> Self {
        Self {
            key: data.key,
            value: data.value,
            namespace: data.namespace,
            hash: data.hash,
            weight: data.weight,
            priority: data.priority,
            sliding: data.sliding,
            created: data.created,
            dependency: data.dependency,
            on_removed: data.on_removed,
            state: AtomicU8::new(EntryState::NotInCache as u8),
            flags: AtomicU8::new(0),
            expires: AtomicU64::new(data.expires.as_millis()),
            last_usage_update: AtomicU64::new(data.created.as_millis()),
            expires_ref: AtomicIndexRef::default(),
            usage_ref: AtomicIndexRef::default(),
            listener: Mutex::new(None),
            dependents: Mutex::new(Some(vec![])),
        }
    }

    /// Get the immutable reference of the record key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Get the immutable reference of the record value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Get the record namespace.
    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// Get the record hash.
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Get the record weight.
    pub fn weight(&self) -> usize {
        self.weight
    }

    /// Get the record priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Get the sliding expiration, if any.
    pub fn sliding(&self) -> Option<Duration> {
        self.sliding
    }

    /// Get the creation time.
    pub fn created(&self) -> Timestamp {
        self.created
    }

    /// Get the dependency, if any.
    pub fn dependency(&self) -> Option<&Arc<dyn Dependency>> {
        self.dependency.as_ref()
    }

    /// Returns `true` if the dependency has already fired.
    pub fn dependency_changed(&self) -> bool {
        self.dependency.as_ref().is_some_and(|d| d.has_changed())
    }

    /// Get the lifecycle state.
    pub fn state(&self) -> EntryState {
        EntryState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Set the lifecycle state.
    pub fn set_state(&self, state: EntryState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Returns `true` while the record is live in the table.
    pub fn is_added(&self) -> bool {
        self.state() == EntryState::AddedToCache
    }

    /// Get the absolute expiration.
    pub fn expires(&self) -> Timestamp {
        Timestamp::from_millis(self.expires.load(Ordering::SeqCst))
    }

    /// Set the absolute expiration.
    pub fn set_expires(&self, expires: Timestamp) {
        self.expires.store(expires.as_millis(), Ordering::SeqCst);
    }

    /// Returns `true` if the expiration is due at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        let expires = self.expires();
        !expires.is_never() && expires <= now
    }

    /// Get the last time the usage position was refreshed.
    pub fn last_usage_update(&self) -> Timestamp {
        Timestamp::from_millis(self.last_usage_update.load(Ordering::Relaxed))
    }

    /// Set the last time the usage position was refreshed.
    pub fn set_last_usage_update(&self, at: Timestamp) {
        self.last_usage_update.store(at.as_millis(), Ordering::Relaxed);
    }

    /// Position in the expiration index.
    pub fn expires_ref(&self) -> &AtomicIndexRef {
        &self.expires_ref
    }

    /// Position in the usage index.
    pub fn usage_ref(&self) -> &AtomicIndexRef {
        &self.usage_ref
    }

    /// Set tracked flag.
    pub fn set_tracked(&self, val: bool) {
        self.set_flags(Flags::TRACKED, val, Ordering::Release);
    }

    /// Get tracked flag.
    pub fn is_tracked(&self) -> bool {
        self.get_flags(Flags::TRACKED, Ordering::Acquire)
    }

    /// Set the record atomic flags.
    pub fn set_flags(&self, flags: Flags, val: bool, order: Ordering) {
        match val {
            true => self.flags.fetch_or(flags.bits(), order),
            false => self.flags.fetch_and(!flags.bits(), order),
        };
    }

    /// Get the record atomic flags.
    pub fn get_flags(&self, flags: Flags, order: Ordering) -> bool {
        self.flags.load(order) & flags.bits() == flags.bits()
    }

    /// Remember the listener registered on the dependency.
    pub fn set_listener(&self, id: ListenerId) {
        *self.listener.lock() = Some(id);
    }

    /// Take the listener registered on the dependency.
    pub fn take_listener(&self) -> Option<ListenerId> {
        self.listener.lock().take()
    }

    /// Attach a dependency to be told when the record leaves the cache.
    ///
    /// Returns `false` if the record has already left.
    pub fn add_dependent(&self, dependency: Arc<dyn Dependency>) -> bool {
        match self.dependents.lock().as_mut() {
            Some(dependents) if self.is_added() => {
                dependents.push(dependency);
                true
            }
            _ => false,
        }
    }

    /// Detach a dependency attached with [`Record::add_dependent`].
    pub fn remove_dependent(&self, dependency: &Arc<dyn Dependency>) {
        if let Some(dependents) = self.dependents.lock().as_mut() {
            dependents.retain(|d| !std::ptr::addr_eq(Arc::as_ptr(d), Arc::as_ptr(dependency)));
        }
    }

    /// Take all attached dependencies. Later attachments are refused.
    pub fn take_dependents(&self) -> Vec<Arc<dyn Dependency>> {
        self.dependents.lock().take().unwrap_or_default()
    }

    /// Invoke the removal callback, at most once.
    ///
    /// A panicking callback is contained and logged.
    pub fn fire_removed(&self, reason: RemovedReason) {
        if self.flags.fetch_or(Flags::CALLBACK_FIRED.bits(), Ordering::AcqRel) & Flags::CALLBACK_FIRED.bits() != 0 {
            return;
        }
        if let Some(callback) = self.on_removed.as_ref() {
            let res = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&self.key, &self.value, reason)));
            if res.is_err() {
                tracing::warn!(
                    "[record]: removal callback of record (hash: {}) panicked with reason {:?}, ignored",
                    self.hash,
                    reason
                );
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn test_record(key: u64, hash: u64, expires: Timestamp) -> Arc<Record<u64, u64>> {
    let record = Record::new(Data {
        key,
        value: key,
        namespace: Namespace::Public,
        hash,
        weight: 1,
        priority: Priority::Normal,
        expires,
        sliding: None,
        created: Timestamp::ZERO,
        dependency: None,
        on_removed: None,
    });
    record.set_state(EntryState::AddedToCache);
    Arc::new(record)
}
