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
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use itertools::Itertools;
use parking_lot::Mutex;
use tarn_common::clock::{Clock, SystemClock, Timestamp};

/// Callback registered on a [`Dependency`], invoked once when it changes.
pub type DependencyListener = Box<dyn Fn() + Send + Sync + 'static>;

/// Token returned by [`Dependency::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Wrap a raw listener id.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw listener id.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// An external source that can invalidate cache entries out of band.
///
/// The cache only asks whether the source has changed and subscribes to the change. Entries published with a
/// dependency are removed with [`crate::RemovedReason::DependencyChanged`] once it fires.
pub trait Dependency: Send + Sync + 'static {
    /// Returns `true` once the underlying source has changed.
    fn has_changed(&self) -> bool;

    /// The last time the underlying source was modified.
    fn last_modified(&self) -> Timestamp;

    /// Subscribe to the change. The listener may be called from any thread.
    fn add_listener(&self, listener: DependencyListener) -> ListenerId;

    /// Unsubscribe a listener. Unknown ids are ignored.
    fn remove_listener(&self, id: ListenerId);

    /// Called when a cache entry this dependency was attached to via `add_dependent` leaves the cache.
    fn on_dependent_removed(&self) {}
}

/// A [`Dependency`] that changes when told to.
///
/// It also fires when an entry it is attached to with [`crate::Cache::add_dependent`] leaves the cache, which makes it
/// usable as a key dependency between cache entries.
pub struct ManualDependency {
    changed: AtomicBool,
    last_modified: AtomicU64,
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn Fn() + Send + Sync + 'static>)>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ManualDependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualDependency")
            .field("changed", &self.changed.load(Ordering::Relaxed))
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

impl Default for ManualDependency {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualDependency {
    /// Create an unchanged dependency.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an unchanged dependency that stamps modifications with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            changed: AtomicBool::new(false),
            last_modified: AtomicU64::new(clock.now().as_millis()),
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(vec![]),
            clock,
        }
    }

    /// Mark the dependency as changed and notify all listeners once.
    ///
    /// Panicking listeners are contained and logged.
    pub fn notify_changed(&self) {
        if self.changed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.last_modified
            .store(self.clock.now().as_millis(), Ordering::SeqCst);

        // Call listeners outside the lock, they may unsubscribe themselves.
        let listeners = self.listeners.lock().iter().map(|(_, l)| l.clone()).collect_vec();
        for listener in listeners {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
                tracing::warn!("[dependency]: listener panicked, ignored");
            }
        }
    }

    /// Number of registered listeners.
    pub fn listeners(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl Dependency for ManualDependency {
    fn has_changed(&self) -> bool {
        self.changed.load(Ordering::SeqCst)
    }

    fn last_modified(&self) -> Timestamp {
        Timestamp::from_millis(self.last_modified.load(Ordering::SeqCst))
    }

    fn add_listener(&self, listener: DependencyListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::from(listener)));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().retain(|(i, _)| *i != id);
    }

    fn on_dependent_removed(&self) {
        self.notify_changed();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tarn_common::clock::ManualClock;

    use super::*;

    #[test_log::test]
    fn test_notify_once() {
        let dep = ManualDependency::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        dep.add_listener(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(!dep.has_changed());
        dep.notify_changed();
        dep.notify_changed();
        assert!(dep.has_changed());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn test_remove_listener() {
        let dep = ManualDependency::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = dep.add_listener(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(dep.listeners(), 1);
        dep.remove_listener(id);
        dep.remove_listener(id);
        assert_eq!(dep.listeners(), 0);

        dep.notify_changed();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test_log::test]
    fn test_panicking_listener_is_contained() {
        let dep = ManualDependency::new();
        let hits = Arc::new(AtomicUsize::new(0));
        dep.add_listener(Box::new(|| panic!("listener failure")));
        let h = hits.clone();
        dep.add_listener(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        dep.notify_changed();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn test_last_modified() {
        let clock = ManualClock::new(Timestamp::from_millis(1_000));
        let dep = ManualDependency::with_clock(Arc::new(clock.clone()));
        assert_eq!(dep.last_modified(), Timestamp::from_millis(1_000));

        clock.advance(std::time::Duration::from_secs(5));
        dep.on_dependent_removed();
        assert!(dep.has_changed());
        assert_eq!(dep.last_modified(), Timestamp::from_millis(6_000));
    }
}
