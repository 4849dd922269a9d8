// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-VCPU state machine (spec.md §3): `OFF`/`ON`/`EMULATE`, each
//! crossed with "roundedup".

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum VcpuState {
    Off = 0,
    OffRoundedUp = 1,
    On = 2,
    OnRoundedUp = 3,
    Emulate = 4,
    EmulateRoundedUp = 5,
}

impl VcpuState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => VcpuState::Off,
            1 => VcpuState::OffRoundedUp,
            2 => VcpuState::On,
            3 => VcpuState::OnRoundedUp,
            4 => VcpuState::Emulate,
            5 => VcpuState::EmulateRoundedUp,
            _ => unreachable!("invalid VcpuState encoding"),
        }
    }

    /// `X -> X_ROUNDEDUP`.
    pub fn roundedup(self) -> Self {
        match self {
            VcpuState::Off => VcpuState::OffRoundedUp,
            VcpuState::On => VcpuState::OnRoundedUp,
            VcpuState::Emulate => VcpuState::EmulateRoundedUp,
            already => already,
        }
    }

    /// `X_ROUNDEDUP -> X`.
    pub fn un_roundedup(self) -> Self {
        match self {
            VcpuState::OffRoundedUp => VcpuState::Off,
            VcpuState::OnRoundedUp => VcpuState::On,
            VcpuState::EmulateRoundedUp => VcpuState::Emulate,
            already => already,
        }
    }

    pub fn is_roundedup(self) -> bool {
        matches!(
            self,
            VcpuState::OffRoundedUp | VcpuState::OnRoundedUp | VcpuState::EmulateRoundedUp
        )
    }

    pub fn is_emulate(self) -> bool {
        matches!(self, VcpuState::Emulate | VcpuState::EmulateRoundedUp)
    }
}

pub struct AtomicVcpuState(AtomicU8);

impl AtomicVcpuState {
    pub fn new(initial: VcpuState) -> Self {
        AtomicVcpuState(AtomicU8::new(initial as u8))
    }

    pub fn load(&self) -> VcpuState {
        VcpuState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: VcpuState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Marks this VCPU rounded-up (`X -> X_ROUNDEDUP`).
    pub fn mark_roundedup(&self) {
        let mut cur = self.load();
        loop {
            let new = cur.roundedup();
            match self.0.compare_exchange_weak(
                cur as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => cur = VcpuState::from_u8(observed),
            }
        }
    }

    /// Clears rounded-up (`X_ROUNDEDUP -> X`).
    pub fn clear_roundedup(&self) {
        let mut cur = self.load();
        loop {
            let new = cur.un_roundedup();
            match self.0.compare_exchange_weak(
                cur as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => cur = VcpuState::from_u8(observed),
            }
        }
    }

    /// `ON -> EMULATE`, only if the VCPU is not currently rounded up. Returns
    /// false (stay `ON`/`ON_ROUNDEDUP`) if a roundup is pending (spec.md
    /// §4.4.1 step 1).
    pub fn try_begin_emulation(&self) -> bool {
        self.0
            .compare_exchange(
                VcpuState::On as u8,
                VcpuState::Emulate as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `EMULATE -> ON`, or `EMULATE_ROUNDEDUP -> ON_ROUNDEDUP` if a roundup
    /// began while emulating.
    pub fn end_emulation(&self) {
        let mut cur = self.load();
        loop {
            let new = match cur {
                VcpuState::Emulate => VcpuState::On,
                VcpuState::EmulateRoundedUp => VcpuState::OnRoundedUp,
                other => other,
            };
            match self.0.compare_exchange_weak(
                cur as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => cur = VcpuState::from_u8(observed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_emulation_blocked_during_roundup() {
        let state = AtomicVcpuState::new(VcpuState::On);
        state.mark_roundedup();
        assert_eq!(state.load(), VcpuState::OnRoundedUp);
        assert!(!state.try_begin_emulation());
    }

    #[test]
    fn begin_and_end_emulation_roundtrip() {
        let state = AtomicVcpuState::new(VcpuState::On);
        assert!(state.try_begin_emulation());
        assert_eq!(state.load(), VcpuState::Emulate);
        state.end_emulation();
        assert_eq!(state.load(), VcpuState::On);
    }

    #[test]
    fn roundup_during_emulation_transitions_on_exit() {
        let state = AtomicVcpuState::new(VcpuState::On);
        assert!(state.try_begin_emulation());
        state.mark_roundedup();
        assert_eq!(state.load(), VcpuState::EmulateRoundedUp);
        state.end_emulation();
        assert_eq!(state.load(), VcpuState::OnRoundedUp);
    }
}
