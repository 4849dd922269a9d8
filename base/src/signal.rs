// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Blocking primitives the device-model core suspends on (§5 of the spec):
//! VCPU WFI, `execution_paused`, the roundup resume wait, and the virtio
//! RX/TX not-empty/not-full signals. These stand in for the real
//! eventfd/futex primitives a host hypervisor integration would supply.

use std::sync::Condvar;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

/// A level-triggered, stateful wakeup signal.
///
/// `signal()` is idempotent: signalling an already-signalled `Event` is a
/// no-op, matching the "recall is idempotent" rule in spec §5.
pub struct Event {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    pub fn new() -> Self {
        Event {
            state: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        let mut signalled = self.state.lock().unwrap();
        *signalled = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        *self.state.lock().unwrap() = false;
    }

    pub fn is_signalled(&self) -> bool {
        *self.state.lock().unwrap()
    }

    /// Blocks until signalled, consuming the signal.
    pub fn wait(&self) {
        let mut signalled = self.state.lock().unwrap();
        while !*signalled {
            signalled = self.cond.wait(signalled).unwrap();
        }
        *signalled = false;
    }

    /// Blocks until signalled or `deadline` elapses. Returns `true` if
    /// signalled, `false` on timeout. Used by the WFI handler's
    /// `wait_until(CNTV_CVAL + CNTVOFF)` path (spec §4.4.4).
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut signalled = self.state.lock().unwrap();
        loop {
            if *signalled {
                *signalled = false;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, timeout) = self
                .cond
                .wait_timeout(signalled, deadline - now)
                .unwrap();
            signalled = guard;
            if timeout.timed_out() && !*signalled {
                return false;
            }
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }
}

/// A simple counting semaphore, used for `off_semaphore` (spec §4.4.2) and
/// the `roundup_parallel` blocked-waiter protocol (spec §4.4.3).
pub struct Semaphore {
    count: Mutex<isize>,
    cond: Condvar,
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Semaphore {
    pub fn new(initial: isize) -> Self {
        Semaphore {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count <= 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }

    pub fn post_n(&self, n: isize) {
        let mut count = self.count.lock().unwrap();
        *count += n;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn event_wait_consumes_signal() {
        let e = Event::new();
        e.signal();
        assert!(e.is_signalled());
        e.wait();
        assert!(!e.is_signalled());
    }

    #[test]
    fn event_wait_timeout_expires() {
        let e = Event::new();
        assert!(!e.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn event_cross_thread() {
        let e = Arc::new(Event::new());
        let e2 = e.clone();
        let t = thread::spawn(move || {
            e2.wait();
        });
        thread::sleep(Duration::from_millis(5));
        e.signal();
        t.join().unwrap();
    }

    #[test]
    fn semaphore_basic() {
        let s = Semaphore::new(0);
        s.post();
        s.wait();
        s.post_n(3);
        s.wait();
        s.wait();
        s.wait();
    }
}
