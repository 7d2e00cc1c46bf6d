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
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;

/// Number of samples the pressure is averaged over.
pub const HISTORY: usize = 6;
/// Lower bound of the trim percent once trimming is due.
pub const MIN_TRIM_PERCENT: usize = 10;
/// Upper bound of the trim percent.
pub const MAX_TRIM_PERCENT: usize = 50;
/// Poll interval while pressure is high.
pub const HIGH_PRESSURE_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Upper bound of the poll interval.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(30);

const FALLBACK_MEMORY_LIMIT: usize = 1 << 30;
const AUTO_MEMORY_LIMIT_PERCENT: u64 = 60;

/// Approximate cache footprint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Footprint {
    /// Sum of entry weights.
    pub bytes: usize,
    /// Entry count.
    pub items: usize,
}

/// Source of the cache footprint for the [`PressureMonitor`].
pub trait FootprintSampler: Send + Sync + 'static + Debug {
    /// A number that moves whenever the footprint may have changed.
    ///
    /// The monitor skips measuring while it stands still.
    fn generation(&self) -> u64;

    /// Measure the footprint.
    fn sample(&self) -> Footprint;
}

/// Running weight and entry count shared by all shards of a cache.
#[derive(Debug, Default)]
pub struct Occupancy {
    bytes: AtomicUsize,
    items: AtomicUsize,
    generation: AtomicU64,
}

impl Occupancy {
    /// Account a published entry.
    pub fn charge(&self, weight: usize) {
        self.bytes.fetch_add(weight, Ordering::Relaxed);
        self.items.fetch_add(1, Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Account a detached entry.
    pub fn discharge(&self, weight: usize) {
        self.bytes.fetch_sub(weight, Ordering::Relaxed);
        self.items.fetch_sub(1, Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Sum of the weights of published entries.
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Count of published entries.
    pub fn items(&self) -> usize {
        self.items.load(Ordering::Relaxed)
    }
}

/// Default sampler, reads the cache's own [`Occupancy`].
#[derive(Debug, Clone)]
pub struct OccupancySampler(Arc<Occupancy>);

impl OccupancySampler {
    /// Sample `occupancy`.
    pub fn new(occupancy: Arc<Occupancy>) -> Self {
        Self(occupancy)
    }
}

impl FootprintSampler for OccupancySampler {
    fn generation(&self) -> u64 {
        self.0.generation.load(Ordering::Acquire)
    }

    fn sample(&self) -> Footprint {
        Footprint {
            bytes: self.0.bytes(),
            items: self.0.items(),
        }
    }
}

/// A sampler that reports whatever it was last told. Clones share the footprint.
///
/// Useful to drive the trimmer deterministically.
#[derive(Debug, Clone, Default)]
pub struct FixedSampler {
    inner: Arc<FixedInner>,
}

#[derive(Debug, Default)]
struct FixedInner {
    bytes: AtomicUsize,
    items: AtomicUsize,
    generation: AtomicU64,
}

impl FixedSampler {
    /// Create a sampler reporting `footprint`.
    pub fn new(footprint: Footprint) -> Self {
        let sampler = Self::default();
        sampler.set(footprint);
        sampler
    }

    /// Report `footprint` from now on.
    pub fn set(&self, footprint: Footprint) {
        self.inner.bytes.store(footprint.bytes, Ordering::Relaxed);
        self.inner.items.store(footprint.items, Ordering::Relaxed);
        self.inner.generation.fetch_add(1, Ordering::Release);
    }
}

impl FootprintSampler for FixedSampler {
    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    fn sample(&self) -> Footprint {
        Footprint {
            bytes: self.inner.bytes.load(Ordering::Relaxed),
            items: self.inner.items.load(Ordering::Relaxed),
        }
    }
}

/// Pressure percents at which trimming starts, blocking starts and trimming aims for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Trim and close the insert gate at or above.
    pub high: u8,
    /// Considered busy at or above.
    pub medium: u8,
    /// Trimming brings the footprint down to this.
    pub low: u8,
}

impl Thresholds {
    /// Thresholds for an auto-detected limit.
    pub const AUTO: Self = Self {
        high: 99,
        medium: 98,
        low: 97,
    };

    /// Thresholds for a configured limit.
    pub const CONFIGURED: Self = Self {
        high: 100,
        medium: 90,
        low: 80,
    };
}

#[derive(Debug)]
struct History {
    samples: [u8; HISTORY],
    next: usize,
    filled: usize,
    generation: Option<u64>,
    footprint: Footprint,
}

impl History {
    fn push(&mut self, pressure: u8) {
        self.samples[self.next] = pressure;
        self.next = (self.next + 1) % HISTORY;
        self.filled = (self.filled + 1).min(HISTORY);
    }

    fn last(&self) -> u8 {
        match self.filled {
            0 => 0,
            _ => self.samples[(self.next + HISTORY - 1) % HISTORY],
        }
    }

    fn with_last(&self) -> (u8, Footprint) {
        (self.last(), self.footprint)
    }

    fn average(&self) -> u8 {
        match self.filled {
            0 => 0,
            n => {
                let sum = self.samples.iter().take(n).map(|&p| p as usize).sum::<usize>();
                (sum / n) as u8
            }
        }
    }
}

/// [`PressureMonitor`] turns footprint samples into a pressure, a trim percent and a polling cadence.
#[derive(Debug)]
pub struct PressureMonitor {
    sampler: Arc<dyn FootprintSampler>,
    limit: usize,
    item_limit: Option<usize>,
    thresholds: Thresholds,
    poll_interval: Duration,
    history: Mutex<History>,
}

impl PressureMonitor {
    /// Create a monitor.
    ///
    /// A `memory_limit` of 0 detects 60% of physical memory, 1 GiB if it cannot be detected.
    pub fn new(
        sampler: Arc<dyn FootprintSampler>,
        memory_limit: usize,
        item_limit: Option<usize>,
        poll_interval: Duration,
    ) -> Self {
        let (limit, thresholds) = match memory_limit {
            0 => (auto_memory_limit(), Thresholds::AUTO),
            limit => (limit, Thresholds::CONFIGURED),
        };
        tracing::debug!(
            "[pressure]: memory limit {limit} bytes, item limit {item_limit:?}, thresholds {thresholds:?}"
        );
        Self {
            sampler,
            limit,
            item_limit: item_limit.filter(|&l| l > 0),
            thresholds,
            poll_interval,
            history: Mutex::new(History {
                samples: [0; HISTORY],
                next: 0,
                filled: 0,
                generation: None,
                footprint: Footprint::default(),
            }),
        }
    }

    /// The effective byte limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// The effective thresholds.
    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Take a sample and return its pressure.
    ///
    /// The footprint is measured again only if the sampler generation moved since the previous sample.
    pub fn sample(&self) -> u8 {
        let generation = self.sampler.generation();
        let mut history = self.history.lock();
        if history.generation != Some(generation) {
            history.footprint = self.sampler.sample();
            history.generation = Some(generation);
        }
        let pressure = self.pressure_of(history.footprint);
        history.push(pressure);
        pressure
    }

    /// Average pressure of the recent samples.
    pub fn pressure(&self) -> u8 {
        self.history.lock().average()
    }

    /// Pressure of the newest sample.
    pub fn pressure_last(&self) -> u8 {
        self.history.lock().last()
    }

    /// Returns `true` if the newest sample is at or above the high threshold.
    pub fn is_high(&self) -> bool {
        self.pressure_last() >= self.thresholds.high
    }

    /// Returns `true` if the newest sample is at or above the medium threshold.
    pub fn is_medium(&self) -> bool {
        self.pressure_last() >= self.thresholds.medium
    }

    /// Percent of tracked entries to trim, 0 if the pressure is not high.
    pub fn percent_to_trim(&self) -> usize {
        let (last, footprint) = self.history.lock().with_last();
        if last < self.thresholds.high {
            return 0;
        }
        let low = self.thresholds.low as usize;
        let bytes = excess_percent(footprint.bytes, self.limit * low / 100);
        let items = self
            .item_limit
            .map(|limit| excess_percent(footprint.items, limit * low / 100))
            .unwrap_or_default();
        bytes.max(items).clamp(MIN_TRIM_PERCENT, MAX_TRIM_PERCENT)
    }

    /// How long to wait until the next sample.
    pub fn poll_interval(&self) -> Duration {
        match self.is_high() {
            true => HIGH_PRESSURE_POLL_INTERVAL,
            false => self.poll_interval.min(MAX_POLL_INTERVAL),
        }
    }

    fn pressure_of(&self, footprint: Footprint) -> u8 {
        let bytes = percent_of(footprint.bytes, self.limit);
        let items = self
            .item_limit
            .map(|limit| percent_of(footprint.items, limit))
            .unwrap_or_default();
        bytes.max(items)
    }
}

fn percent_of(value: usize, limit: usize) -> u8 {
    if limit == 0 {
        return 0;
    }
    (value as u128 * 100 / limit as u128).min(100) as u8
}

fn excess_percent(value: usize, target: usize) -> usize {
    if value <= target {
        return 0;
    }
    ((value - target) as u128 * 100).div_ceil(value as u128) as usize
}

fn auto_memory_limit() -> usize {
    match physical_memory() {
        Some(total) => (total / 100 * AUTO_MEMORY_LIMIT_PERCENT).try_into().unwrap_or(usize::MAX),
        None => {
            tracing::warn!("[pressure]: cannot detect physical memory, fall back to {FALLBACK_MEMORY_LIMIT} bytes");
            FALLBACK_MEMORY_LIMIT
        }
    }
}

#[cfg(unix)]
fn physical_memory() -> Option<u64> {
    // SAFETY: `sysconf` only reads system configuration.
    let (pages, page_size) = unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };
    match (pages, page_size) {
        (p, s) if p > 0 && s > 0 => Some(p as u64 * s as u64),
        _ => None,
    }
}

#[cfg(not(unix))]
fn physical_memory() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(limit: usize, item_limit: Option<usize>) -> (FixedSampler, PressureMonitor) {
        let sampler = FixedSampler::default();
        let monitor = PressureMonitor::new(Arc::new(sampler.clone()), limit, item_limit, Duration::from_secs(20));
        (sampler, monitor)
    }

    #[test_log::test]
    fn test_auto_limit() {
        let (_, m) = monitor(0, None);
        assert!(m.limit() > 0);
        assert_eq!(m.thresholds(), Thresholds::AUTO);
    }

    #[test_log::test]
    fn test_history() {
        let (sampler, m) = monitor(1000, None);
        assert_eq!(m.pressure(), 0);

        sampler.set(Footprint { bytes: 600, items: 1 });
        assert_eq!(m.sample(), 60);
        sampler.set(Footprint { bytes: 1200, items: 1 });
        assert_eq!(m.sample(), 100);
        assert_eq!(m.pressure_last(), 100);
        assert_eq!(m.pressure(), 80);

        for _ in 0..HISTORY {
            m.sample();
        }
        assert_eq!(m.pressure(), 100);
    }

    #[test_log::test]
    fn test_sample_skips_unchanged_generation() {
        #[derive(Debug, Default)]
        struct Counting {
            samples: AtomicUsize,
        }

        impl FootprintSampler for Counting {
            fn generation(&self) -> u64 {
                7
            }

            fn sample(&self) -> Footprint {
                self.samples.fetch_add(1, Ordering::SeqCst);
                Footprint { bytes: 10, items: 1 }
            }
        }

        let sampler = Arc::new(Counting::default());
        let monitor = PressureMonitor::new(sampler.clone(), 100, None, Duration::from_secs(1));
        for _ in 0..4 {
            assert_eq!(monitor.sample(), 10);
        }
        assert_eq!(sampler.samples.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn test_percent_to_trim() {
        let (sampler, m) = monitor(1000, None);

        sampler.set(Footprint { bytes: 950, items: 1 });
        m.sample();
        assert!(m.is_medium());
        assert!(!m.is_high());
        assert_eq!(m.percent_to_trim(), 0);

        // (1000 - 800) * 100 / 1000
        sampler.set(Footprint { bytes: 1000, items: 1 });
        m.sample();
        assert!(m.is_high());
        assert_eq!(m.percent_to_trim(), 20);

        sampler.set(Footprint { bytes: 10_000, items: 1 });
        m.sample();
        assert_eq!(m.percent_to_trim(), MAX_TRIM_PERCENT);
    }

    #[test_log::test]
    fn test_item_limit() {
        let (sampler, m) = monitor(1000, Some(100));

        // Bytes alone would ask for 6%, items win.
        sampler.set(Footprint { bytes: 850, items: 100 });
        assert_eq!(m.sample(), 100);
        assert_eq!(m.percent_to_trim(), 20);

        sampler.set(Footprint { bytes: 850, items: 50 });
        assert_eq!(m.sample(), 85);
        assert_eq!(m.percent_to_trim(), 0);
    }

    #[test_log::test]
    fn test_poll_interval() {
        let (sampler, m) = monitor(1000, None);
        assert_eq!(m.poll_interval(), Duration::from_secs(20));
        sampler.set(Footprint { bytes: 1000, items: 1 });
        m.sample();
        assert_eq!(m.poll_interval(), HIGH_PRESSURE_POLL_INTERVAL);

        let m = PressureMonitor::new(Arc::new(FixedSampler::default()), 1000, None, Duration::from_secs(120));
        assert_eq!(m.poll_interval(), MAX_POLL_INTERVAL);
    }
}
