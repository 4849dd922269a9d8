// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The packed 64-bit `InjectionInfo` word (spec.md §3/§9): target CPU
//! encoding plus banked pending/injected bitmasks, mutated exclusively
//! through CAS loops so every update is one atomic linearization point.

use std::sync::atomic::{AtomicU64, Ordering};

const TARGET_SHIFT: u32 = 0;
const TARGET_MASK: u64 = 0xffff_ffff;
const PENDING_SHIFT: u32 = 32;
const PENDING_MASK: u64 = 0xff;
const INJECTED_SHIFT: u32 = 40;
const INJECTED_MASK: u64 = 0xff;

/// For non-SGI IRQs only sender slot 0 is used (spec.md §3).
pub const UNBANKED_SENDER: u8 = 0;

#[derive(Default)]
pub struct InjectionInfo(AtomicU64);

impl InjectionInfo {
    pub fn new() -> Self {
        InjectionInfo(AtomicU64::new(0))
    }

    pub fn raw(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn target(&self) -> u32 {
        ((self.raw() >> TARGET_SHIFT) & TARGET_MASK) as u32
    }

    pub fn pending_mask(&self) -> u8 {
        ((self.raw() >> PENDING_SHIFT) & PENDING_MASK) as u8
    }

    pub fn injected_mask(&self) -> u8 {
        ((self.raw() >> INJECTED_SHIFT) & INJECTED_MASK) as u8
    }

    pub fn is_pending(&self, sender: u8) -> bool {
        self.pending_mask() & (1 << sender) != 0
    }

    pub fn is_injected(&self, sender: u8) -> bool {
        self.injected_mask() & (1 << sender) != 0
    }

    pub fn pending_any(&self) -> bool {
        self.pending_mask() != 0
    }

    fn cas_update(&self, f: impl Fn(u64) -> u64) -> u64 {
        let mut cur = self.raw();
        loop {
            let new = f(cur);
            match self.0.compare_exchange_weak(
                cur,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return new,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Sets the target CPU encoding and marks `sender` pending, one CAS
    /// (spec.md §4.3.3 SPI assert / §4.3.2 SGI assert).
    pub fn assert(&self, target: u32, sender: u8) {
        self.cas_update(|cur| {
            let cleared_target = cur & !(TARGET_MASK << TARGET_SHIFT);
            let with_target = cleared_target | ((target as u64 & TARGET_MASK) << TARGET_SHIFT);
            with_target | (1u64 << (PENDING_SHIFT + sender as u32))
        });
    }

    /// Clears both the pending and injected bits for `sender` (SGI
    /// deassert, spec.md §4.3.2).
    pub fn deassert(&self, sender: u8) {
        self.cas_update(|cur| {
            cur & !(1u64 << (PENDING_SHIFT + sender as u32))
                & !(1u64 << (INJECTED_SHIFT + sender as u32))
        });
    }

    /// Injection commit: clears `pending[sender]`, sets `injected[sender]`.
    /// Fails (returns false, no mutation) if `sender` was not pending
    /// (spec.md §4.3.4).
    pub fn commit_injection(&self, sender: u8) -> bool {
        let mut cur = self.raw();
        loop {
            if cur & (1u64 << (PENDING_SHIFT + sender as u32)) == 0 {
                return false;
            }
            let new = (cur & !(1u64 << (PENDING_SHIFT + sender as u32)))
                | (1u64 << (INJECTED_SHIFT + sender as u32));
            match self.0.compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Completion path (spec.md §4.3.5): `INACTIVE` clears `injected` and,
    /// if the guest re-raised the IRQ meanwhile (`pending` set again for
    /// some other reason), leaves it pending. CAS loop terminates when
    /// `is_injected(sender) == false` (spec.md §4.3.5 failure semantics).
    pub fn complete_inactive(&self, sender: u8) {
        loop {
            let cur = self.raw();
            if cur & (1u64 << (INJECTED_SHIFT + sender as u32)) == 0 {
                return;
            }
            let new = cur & !(1u64 << (INJECTED_SHIFT + sender as u32));
            if self
                .0
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// `PENDING`/`ACTIVE_PENDING`/`ACTIVE` completion: the LR came back
    /// without being consumed. Clears `injected`, re-marks `pending`
    /// (spec.md §4.3.5).
    pub fn complete_still_pending(&self, sender: u8) {
        loop {
            let cur = self.raw();
            let new = (cur & !(1u64 << (INJECTED_SHIFT + sender as u32)))
                | (1u64 << (PENDING_SHIFT + sender as u32));
            if cur == new {
                return;
            }
            if self
                .0
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn zero(&self) {
        self.0.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assert_then_commit_then_complete() {
        let info = InjectionInfo::new();
        info.assert(0x1, UNBANKED_SENDER);
        assert!(info.is_pending(UNBANKED_SENDER));
        assert!(info.commit_injection(UNBANKED_SENDER));
        assert!(!info.is_pending(UNBANKED_SENDER));
        assert!(info.is_injected(UNBANKED_SENDER));
        info.complete_inactive(UNBANKED_SENDER);
        assert!(!info.is_injected(UNBANKED_SENDER));
        assert!(!info.is_pending(UNBANKED_SENDER));
    }

    #[test]
    fn commit_fails_if_not_pending() {
        let info = InjectionInfo::new();
        assert!(!info.commit_injection(UNBANKED_SENDER));
    }

    #[test]
    fn sgi_banking_is_independent_per_sender() {
        let info = InjectionInfo::new();
        info.assert(0, 2);
        info.assert(0, 5);
        assert!(info.is_pending(2));
        assert!(info.is_pending(5));
        assert!(!info.is_pending(0));
        info.deassert(2);
        assert!(!info.is_pending(2));
        assert!(info.is_pending(5));
    }

    #[test]
    fn complete_still_pending_restores_pending_bit() {
        let info = InjectionInfo::new();
        info.assert(0, UNBANKED_SENDER);
        info.commit_injection(UNBANKED_SENDER);
        info.complete_still_pending(UNBANKED_SENDER);
        assert!(info.is_pending(UNBANKED_SENDER));
        assert!(!info.is_injected(UNBANKED_SENDER));
    }
}
