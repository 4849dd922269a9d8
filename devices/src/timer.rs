// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-VCPU virtual timer (spec.md §4.7, component C6).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use bitflags::bitflags;

bitflags! {
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct TimerCtl: u32 {
        const ENABLED = 1 << 0;
        const MASKED  = 1 << 1;
        const STATUS  = 1 << 2;
    }
}

/// Callback invoked from the timer thread when the deadline fires: asserts
/// the timer PPI on the GIC for the owning VCPU (spec.md §4.7).
pub trait TimerIrqSink: Send + Sync {
    fn assert_timer_irq(&self);
}

struct Shared {
    cval: AtomicU64,
    ctl: StdMutex<TimerCtl>,
    voff: AtomicU64,
    deadline_changed: Condvar,
    shutdown: StdMutex<bool>,
}

/// A dedicated timer thread per VCPU, parked on the current deadline and
/// woken whenever `set_cval`/`set_ctl` reconfigures it.
pub struct PerCpuTimer {
    shared: Arc<Shared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PerCpuTimer {
    pub fn new(voff: u64, sink: Arc<dyn TimerIrqSink>) -> Self {
        let shared = Arc::new(Shared {
            cval: AtomicU64::new(u64::MAX),
            ctl: StdMutex::new(TimerCtl::empty()),
            voff: AtomicU64::new(voff),
            deadline_changed: Condvar::new(),
            shutdown: StdMutex::new(false),
        });
        let thread_shared = shared.clone();
        let handle = thread::spawn(move || Self::run(thread_shared, sink));
        PerCpuTimer {
            shared,
            handle: Some(handle),
        }
    }

    fn run(shared: Arc<Shared>, sink: Arc<dyn TimerIrqSink>) {
        let mut guard = shared.shutdown.lock().unwrap();
        loop {
            if *guard {
                return;
            }
            let cval = shared.cval.load(Ordering::Acquire);
            let ctl = *shared.ctl.lock().unwrap();
            if cval == u64::MAX || !ctl.contains(TimerCtl::ENABLED) {
                guard = shared.deadline_changed.wait(guard).unwrap();
                continue;
            }
            let now_ticks = tick_now();
            let voff = shared.voff.load(Ordering::Acquire);
            let target = cval.saturating_sub(voff);
            if target <= now_ticks {
                drop(guard);
                let mut ctl_guard = shared.ctl.lock().unwrap();
                *ctl_guard |= TimerCtl::STATUS;
                let masked = ctl_guard.contains(TimerCtl::MASKED);
                drop(ctl_guard);
                if !masked {
                    sink.assert_timer_irq();
                }
                guard = shared.shutdown.lock().unwrap();
                guard = shared
                    .deadline_changed
                    .wait_timeout(guard, Duration::from_millis(1))
                    .unwrap()
                    .0;
                continue;
            }
            let wait_for = Duration::from_nanos((target - now_ticks).min(1_000_000_000));
            let (g, _timeout) = shared.deadline_changed.wait_timeout(guard, wait_for).unwrap();
            guard = g;
        }
    }

    pub fn set_cval(&self, cval: u64) {
        self.shared.cval.store(cval, Ordering::Release);
        self.shared.deadline_changed.notify_all();
    }

    pub fn set_ctl(&self, ctl: u32) {
        let mut guard = self.shared.ctl.lock().unwrap();
        // STATUS is read-only to the guest; preserve it across writes that
        // only intend to touch ENABLED/MASKED.
        let status = guard.contains(TimerCtl::STATUS);
        *guard = TimerCtl::from_bits_truncate(ctl & (TimerCtl::ENABLED | TimerCtl::MASKED).bits());
        if status {
            *guard |= TimerCtl::STATUS;
        }
        drop(guard);
        self.shared.deadline_changed.notify_all();
    }

    pub fn ctl(&self) -> u32 {
        self.shared.ctl.lock().unwrap().bits()
    }

    pub fn cval(&self) -> u64 {
        self.shared.cval.load(Ordering::Acquire)
    }
}

impl Drop for PerCpuTimer {
    fn drop(&mut self) {
        *self.shared.shutdown.lock().unwrap() = true;
        self.shared.deadline_changed.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A monotonic base captured the first time a timer thread runs, so
/// `tick_now` measures elapsed time since then rather than since its own
/// call (which would always read back ~0).
static BASE_INSTANT: OnceLock<Instant> = OnceLock::new();

fn tick_now() -> u64 {
    let base = BASE_INSTANT.get_or_init(Instant::now);
    base.elapsed().as_nanos() as u64
}
