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

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Manual-reset gate that holds back tracked inserts while memory pressure is high.
///
/// Waits are always bounded.
#[derive(Debug)]
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    /// Create an open gate.
    pub fn new() -> Self {
        Self {
            open: Mutex::new(true),
            cv: Condvar::new(),
        }
    }

    /// Open the gate and release all waiters.
    pub fn open(&self) {
        let mut open = self.open.lock();
        if !*open {
            *open = true;
            self.cv.notify_all();
        }
    }

    /// Close the gate.
    pub fn close(&self) {
        *self.open.lock() = false;
    }

    /// Returns `true` if the gate is open.
    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    /// Wait until the gate opens or `timeout` elapses. Returns `true` if the gate is open.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut open = self.open.lock();
        while !*open {
            if self.cv.wait_until(&mut open, deadline).timed_out() {
                break;
            }
        }
        *open
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_wait_open() {
        let gate = Gate::new();
        assert!(gate.wait(Duration::ZERO));
    }

    #[test]
    fn test_wait_timeout() {
        let gate = Gate::new();
        gate.close();
        let start = Instant::now();
        assert!(!gate.wait(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_released() {
        let gate = Arc::new(Gate::new());
        gate.close();
        let waiter = {
            let gate = gate.clone();
            std::thread::spawn(move || gate.wait(Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(10));
        gate.open();
        assert!(waiter.join().unwrap());
        assert!(gate.is_open());
    }
}
