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
    sync::Weak,
    thread::JoinHandle,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use flume::RecvTimeoutError;
use parking_lot::Mutex;
use tarn_common::error::{Error, ErrorKind, Result};

use crate::expiration::BUCKET_SPAN;

/// Periodic work driven by the [`Scheduler`].
pub trait Maintain: Send + Sync + 'static {
    /// Remove expired entries.
    fn sweep(&self);

    /// Sample the memory pressure and trim if needed. Returns how long to wait until the next poll.
    fn poll(&self) -> Duration;
}

/// [`Scheduler`] runs sweeps and pressure polls on its own thread.
///
/// The thread only holds a weak reference to its target and exits once the target is gone.
pub struct Scheduler {
    stop: flume::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the scheduler thread.
    pub fn spawn(target: Weak<dyn Maintain>, sweep_interval: Duration, poll_interval: Duration) -> Result<Self> {
        let (tx, rx) = flume::bounded(1);
        let runner = Runner {
            rx,
            target,
            sweep_interval,
            poll_interval,
        };
        let handle = std::thread::Builder::new()
            .name("tarn-scheduler".to_string())
            .spawn(move || runner.run())
            .map_err(|e| Error::new(ErrorKind::External, "failed to spawn scheduler thread").with_source(e))?;
        Ok(Self {
            stop: tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop the thread and wait for it, unless called from the thread itself.
    pub fn stop(&self) {
        let _ = self.stop.try_send(());
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if handle.thread().id() == std::thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::warn!("[scheduler]: scheduler thread panicked");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Runner {
    rx: flume::Receiver<()>,
    target: Weak<dyn Maintain>,
    sweep_interval: Duration,
    poll_interval: Duration,
}

impl Runner {
    fn run(self) {
        tracing::info!(
            "[scheduler]: started, sweep interval: {:?}, poll interval: {:?}",
            self.sweep_interval,
            self.poll_interval
        );

        // Sweeps land on expiration bucket boundaries of the wall clock.
        let span = self.sweep_interval.min(BUCKET_SPAN);
        let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let start = Instant::now();
        let mut next_sweep = start + until_boundary(since_epoch, span);
        let mut next_poll = start + self.poll_interval;

        loop {
            match self.rx.recv_deadline(next_sweep.min(next_poll)) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            let Some(target) = self.target.upgrade() else {
                break;
            };

            let now = Instant::now();
            if now >= next_sweep {
                target.sweep();
                let now = Instant::now();
                while next_sweep <= now {
                    next_sweep += self.sweep_interval;
                }
            }
            if now >= next_poll {
                let interval = target.poll();
                next_poll = Instant::now() + interval;
            }
        }

        tracing::info!("[scheduler]: stopped");
    }
}

/// Time from `since_epoch` to the next multiple of `span`.
fn until_boundary(since_epoch: Duration, span: Duration) -> Duration {
    let span = span.as_millis().max(1);
    let into = since_epoch.as_millis() % span;
    Duration::from_millis((span - into) as u64)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[derive(Default)]
    struct Counting {
        sweeps: AtomicUsize,
        polls: AtomicUsize,
    }

    impl Maintain for Counting {
        fn sweep(&self) {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
        }

        fn poll(&self) -> Duration {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Duration::from_millis(5)
        }
    }

    #[test]
    fn test_until_boundary() {
        let ms = Duration::from_millis;
        assert_eq!(until_boundary(ms(1_700_000_005_000), BUCKET_SPAN), ms(15_000));
        assert_eq!(until_boundary(ms(1_700_000_019_999), BUCKET_SPAN), ms(1));
        // On a boundary the next one is a full span away.
        assert_eq!(until_boundary(ms(1_700_000_000_000), BUCKET_SPAN), BUCKET_SPAN);
        assert_eq!(until_boundary(ms(1_234), ms(5)), ms(1));
        assert_eq!(until_boundary(ms(1_234), Duration::ZERO), ms(1));
    }

    #[test_log::test]
    fn test_scheduler_runs_and_stops() {
        let target = Arc::new(Counting::default());
        let weak: Weak<dyn Maintain> = Arc::downgrade(&target) as Weak<dyn Maintain>;
        let scheduler = Scheduler::spawn(weak, Duration::from_millis(5), Duration::from_millis(5)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while (target.sweeps.load(Ordering::SeqCst) < 3 || target.polls.load(Ordering::SeqCst) < 3)
            && Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(5));
        }
        scheduler.stop();
        scheduler.stop();

        let (sweeps, polls) = (target.sweeps.load(Ordering::SeqCst), target.polls.load(Ordering::SeqCst));
        assert!(sweeps >= 3 && polls >= 3);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(target.sweeps.load(Ordering::SeqCst), sweeps);
    }

    #[test_log::test]
    fn test_scheduler_exits_without_target() {
        let target = Arc::new(Counting::default());
        let weak: Weak<dyn Maintain> = Arc::downgrade(&target) as Weak<dyn Maintain>;
        let scheduler = Scheduler::spawn(weak, Duration::from_millis(1), Duration::from_millis(1)).unwrap();
        drop(target);
        // Joins a thread that has exited on its own.
        drop(scheduler);
    }
}
