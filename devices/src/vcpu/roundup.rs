// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Global VCPU quiescence protocol (spec.md §4.4.3, component C7).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex};

use base::Semaphore;

use crate::vcpu::state::{AtomicVcpuState, VcpuState};

/// Issues a strong recall to one VCPU and unblocks any WFI wait it may be
/// parked in (spec.md §4.4.3 step 2).
pub trait RecallTarget: Send + Sync {
    fn recall(&self);
}

/// Coordinates `roundup_all`/`resume_all` across every VCPU. Only one
/// roundup is "driving" at a time; concurrent callers block until the
/// driver calls `resume_all` (spec.md §4.4.3 `roundup_parallel`).
pub struct RoundupCoordinator {
    states: Vec<Arc<AtomicVcpuState>>,
    targets: Vec<Arc<dyn RecallTarget>>,
    active: AtomicBool,
    remaining: StdMutex<usize>,
    remaining_cv: Condvar,
    parallel_sem: Semaphore,
    waiters: AtomicUsize,
}

impl RoundupCoordinator {
    pub fn new(states: Vec<Arc<AtomicVcpuState>>, targets: Vec<Arc<dyn RecallTarget>>) -> Self {
        assert_eq!(states.len(), targets.len());
        RoundupCoordinator {
            states,
            targets,
            active: AtomicBool::new(false),
            remaining: StdMutex::new(0),
            remaining_cv: Condvar::new(),
            parallel_sem: Semaphore::new(0),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Entry from a non-VCPU thread. Blocks until every VCPU is quiesced
    /// outside `EMULATE`/`EMULATE_ROUNDEDUP` (spec.md §8 property 8).
    pub fn roundup_all(&self) {
        self.roundup_excluding(None);
    }

    /// A VCPU driving its own roundup must mark itself yielded first so the
    /// "others" accounting is correct (spec.md §4.4.3).
    pub fn roundup_from_vcpu(&self, id: usize) {
        self.roundup_excluding(Some(id));
    }

    fn roundup_excluding(&self, self_id: Option<usize>) {
        if self.active.swap(true, Ordering::AcqRel) {
            // roundup_parallel: another driver is already in progress; block
            // until it calls resume_all.
            self.waiters.fetch_add(1, Ordering::AcqRel);
            self.parallel_sem.wait();
            return;
        }

        let mut to_wait_for = 0;
        for (i, state) in self.states.iter().enumerate() {
            if Some(i) == self_id {
                continue;
            }
            let was_emulating = state.load().is_emulate();
            state.mark_roundedup();
            self.targets[i].recall();
            if was_emulating {
                to_wait_for += 1;
            }
        }

        let mut remaining = self.remaining.lock().unwrap();
        *remaining = to_wait_for;
        while *remaining > 0 {
            remaining = self.remaining_cv.wait(remaining).unwrap();
        }
    }

    /// Called by a VCPU when it finishes the exit handler it was mid-way
    /// through as `EMULATE_ROUNDEDUP` (spec.md §4.4.1 step 7 / §4.4.3 step
    /// 3's "last VCPU leaving EMULATE_ROUNDEDUP notifies").
    pub fn notify_quiesced(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
        }
        if *remaining == 0 {
            self.remaining_cv.notify_all();
        }
    }

    /// Flips every VCPU back to its pre-roundup base state and releases any
    /// `roundup_parallel` waiters (spec.md §4.4.3 step 5, §8 property 8).
    pub fn resume_all(&self) {
        for state in &self.states {
            state.clear_roundedup();
        }
        let waiting = self.waiters.swap(0, Ordering::AcqRel) as isize;
        if waiting > 0 {
            self.parallel_sem.post_n(waiting);
        }
        self.active.store(false, Ordering::Release);
    }

    pub fn state_of(&self, id: usize) -> VcpuState {
        self.states[id].load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingRecall(Arc<AtomicU32>);

    impl RecallTarget for CountingRecall {
        fn recall(&self) {
            self.0.fetch_add(1, Ordering::AcqRel);
        }
    }

    #[test]
    fn roundup_moves_on_vcpus_to_rounded_up_immediately() {
        let recalls = Arc::new(AtomicU32::new(0));
        let states = vec![
            Arc::new(AtomicVcpuState::new(VcpuState::On)),
            Arc::new(AtomicVcpuState::new(VcpuState::On)),
        ];
        let targets: Vec<Arc<dyn RecallTarget>> =
            vec![Arc::new(CountingRecall(recalls.clone())), Arc::new(CountingRecall(recalls.clone()))];
        let coordinator = RoundupCoordinator::new(states, targets);
        coordinator.roundup_all();
        assert_eq!(coordinator.state_of(0), VcpuState::OnRoundedUp);
        assert_eq!(coordinator.state_of(1), VcpuState::OnRoundedUp);
        assert_eq!(recalls.load(Ordering::Acquire), 2);
        coordinator.resume_all();
        assert_eq!(coordinator.state_of(0), VcpuState::On);
    }

    #[test]
    fn waits_for_emulating_vcpu_to_notify() {
        let recalls = Arc::new(AtomicU32::new(0));
        let states = vec![Arc::new(AtomicVcpuState::new(VcpuState::Emulate))];
        let targets: Vec<Arc<dyn RecallTarget>> = vec![Arc::new(CountingRecall(recalls))];
        let coordinator = Arc::new(RoundupCoordinator::new(states, targets));
        assert_eq!(coordinator.state_of(0), VcpuState::Emulate);

        let c2 = coordinator.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert_eq!(c2.state_of(0), VcpuState::EmulateRoundedUp);
            c2.notify_quiesced();
        });
        coordinator.roundup_all();
        handle.join().unwrap();
        assert_eq!(coordinator.state_of(0), VcpuState::EmulateRoundedUp);
    }
}
