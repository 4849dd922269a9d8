// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! One GIC IRQ's state (spec.md §3).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use crate::gic::injection::InjectionInfo;

pub struct GicIrq {
    pub id: u32,
    priority: AtomicU8,
    target: AtomicU32,
    enable: AtomicBool,
    active: AtomicBool,
    group1: AtomicBool,
    /// HW-backed IRQ (forwarded physical interrupt); immutable after
    /// construction.
    pub hw: bool,
    /// Immutable physical edge/level configuration for HW-backed IRQs.
    pub hw_edge: bool,
    /// Guest-configured edge/level, SPIs only.
    sw_edge: AtomicBool,
    line_asserted: AtomicBool,
    pub injection: InjectionInfo,
}

impl GicIrq {
    pub fn new(id: u32) -> Self {
        GicIrq {
            id,
            priority: AtomicU8::new(0),
            target: AtomicU32::new(0),
            enable: AtomicBool::new(false),
            active: AtomicBool::new(false),
            group1: AtomicBool::new(false),
            hw: false,
            hw_edge: false,
            sw_edge: AtomicBool::new(false),
            line_asserted: AtomicBool::new(false),
            injection: InjectionInfo::new(),
        }
    }

    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Acquire)
    }

    pub fn set_priority(&self, p: u8) {
        self.priority.store(p, Ordering::Release);
    }

    pub fn target(&self) -> u32 {
        self.target.load(Ordering::Acquire)
    }

    pub fn set_target(&self, t: u32) {
        self.target.store(t, Ordering::Release);
    }

    pub fn enabled(&self) -> bool {
        self.enable.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, v: bool) {
        self.enable.store(v, Ordering::Release);
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, v: bool) {
        self.active.store(v, Ordering::Release);
    }

    pub fn group1(&self) -> bool {
        self.group1.load(Ordering::Acquire)
    }

    pub fn set_group1(&self, v: bool) {
        self.group1.store(v, Ordering::Release);
    }

    pub fn sw_edge(&self) -> bool {
        self.sw_edge.load(Ordering::Acquire)
    }

    pub fn set_sw_edge(&self, v: bool) {
        self.sw_edge.store(v, Ordering::Release);
    }

    pub fn line_asserted(&self) -> bool {
        self.line_asserted.load(Ordering::Acquire)
    }

    pub fn set_line_asserted(&self, v: bool) {
        self.line_asserted.store(v, Ordering::Release);
    }

    /// `pending()` iff `(!sw_edge && line_asserted) || any pending bit set`
    /// (spec.md §3).
    pub fn pending(&self) -> bool {
        (!self.sw_edge() && self.line_asserted()) || self.injection.pending_any()
    }

    pub fn reset(&self) {
        self.priority.store(0, Ordering::Release);
        self.target.store(0, Ordering::Release);
        self.enable.store(false, Ordering::Release);
        self.active.store(false, Ordering::Release);
        self.group1.store(false, Ordering::Release);
        self.sw_edge.store(false, Ordering::Release);
        self.line_asserted.store(false, Ordering::Release);
        self.injection.zero();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gic::injection::UNBANKED_SENDER;

    #[test]
    fn pending_via_injection_info() {
        let irq = GicIrq::new(32);
        assert!(!irq.pending());
        irq.injection.assert(0x1, UNBANKED_SENDER);
        assert!(irq.pending());
    }

    #[test]
    fn pending_via_level_line() {
        let irq = GicIrq::new(33);
        irq.set_line_asserted(true);
        assert!(irq.pending());
        irq.set_sw_edge(true);
        assert!(!irq.pending());
    }

    #[test]
    fn reset_clears_everything() {
        let irq = GicIrq::new(1);
        irq.set_enabled(true);
        irq.set_priority(5);
        irq.injection.assert(3, UNBANKED_SENDER);
        irq.reset();
        assert!(!irq.enabled());
        assert_eq!(irq.priority(), 0);
        assert!(!irq.pending());
    }
}
