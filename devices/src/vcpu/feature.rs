// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! `CpuFeature`: per-requester enable+extra-traps aggregation (spec.md
//! §4.4.2).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const ENABLE_BIT: u64 = 1 << 63;
const REGS_MASK: u64 = !ENABLE_BIT;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Requester {
    Vmm,
    Vmi,
}

/// Aggregates per-requester enable+extra-register-selection state as two
/// 64-bit words (top bit = enable, low 63 bits = trap register bitmask).
pub struct CpuFeature {
    vmm: AtomicU64,
    vmi: AtomicU64,
    dirty: AtomicBool,
}

impl Default for CpuFeature {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuFeature {
    pub fn new() -> Self {
        CpuFeature {
            vmm: AtomicU64::new(0),
            vmi: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    fn word(&self, requester: Requester) -> &AtomicU64 {
        match requester {
            Requester::Vmm => &self.vmm,
            Requester::Vmi => &self.vmi,
        }
    }

    pub fn request(&self, enable: bool, requester: Requester, regs: u64) {
        let packed = if enable {
            ENABLE_BIT | (regs & REGS_MASK)
        } else {
            0
        };
        self.word(requester).store(packed, Ordering::Release);
        self.dirty.store(true, Ordering::Release);
    }

    /// `combined = req[VMM] | req[VMI]`; `enabled` is the top bit of the
    /// combination, `regs` is the low bits if enabled else 0 (spec.md
    /// §4.4.2).
    pub fn read(&self) -> (bool, u64) {
        let combined = self.vmm.load(Ordering::Acquire) | self.vmi.load(Ordering::Acquire);
        let enabled = combined & ENABLE_BIT != 0;
        (enabled, if enabled { combined & REGS_MASK } else { 0 })
    }

    /// Returns and clears the dirty bit (spec.md §4.4.2).
    pub fn check_clean(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combines_requesters() {
        let feature = CpuFeature::new();
        feature.request(true, Requester::Vmm, 0b101);
        feature.request(true, Requester::Vmi, 0b010);
        let (enabled, regs) = feature.read();
        assert!(enabled);
        assert_eq!(regs, 0b111);
    }

    #[test]
    fn disabled_unless_any_requester_enables() {
        let feature = CpuFeature::new();
        feature.request(false, Requester::Vmm, 0xff);
        let (enabled, regs) = feature.read();
        assert!(!enabled);
        assert_eq!(regs, 0);
    }

    #[test]
    fn dirty_bit_clears_once() {
        let feature = CpuFeature::new();
        feature.request(true, Requester::Vmm, 1);
        assert!(feature.check_clean());
        assert!(!feature.check_clean());
    }
}
