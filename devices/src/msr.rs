// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! System-register dispatch (spec.md §3/§4.1, component C3).

use std::collections::HashMap;
use std::sync::Arc;

use sync::Mutex;
use sync::RwLock;

use crate::bus::AccessKind;
use crate::error::DevError;

/// Carves out an AArch32-only register namespace using an otherwise-unused
/// `op0` encoding (spec.md §3).
pub const OP0_AARCH32: u8 = 0xff;

/// Encodes the ARM `(op0, op1, CRn, CRm, op2)` system-register tuple into a
/// 32-bit id.
pub fn encode_id(op0: u8, op1: u8, crn: u8, crm: u8, op2: u8) -> u32 {
    ((op0 as u32) << 24)
        | ((op1 as u32 & 0x7) << 21)
        | ((crn as u32 & 0xf) << 17)
        | ((crm as u32 & 0xf) << 13)
        | ((op2 as u32 & 0x7) << 10)
}

#[derive(Default, Copy, Clone, Debug)]
pub struct RegisterStats {
    pub reads: u64,
    pub writes: u64,
    pub min_ticks: u64,
    pub max_ticks: u64,
    pub total_ticks: u64,
}

impl RegisterStats {
    fn record(&mut self, kind: AccessKind, ticks: u64) {
        match kind {
            AccessKind::Read => self.reads += 1,
            AccessKind::Write => self.writes += 1,
        }
        if self.min_ticks == 0 || ticks < self.min_ticks {
            self.min_ticks = ticks;
        }
        self.max_ticks = self.max_ticks.max(ticks);
        self.total_ticks += ticks;
    }
}

/// One system register backing a guest MSR/MRS access (spec.md §3).
pub struct Register {
    pub id: u32,
    value: u64,
    reset_value: u64,
    write_mask: u64,
    writable: bool,
    /// "write to reserved bits is an error" (spec.md §3, SPEC_FULL §2).
    strict_write: bool,
    fixed_set: u64,
    fixed_clear: u64,
    stats: RegisterStats,
}

impl Register {
    pub fn new(id: u32, reset_value: u64, write_mask: u64, writable: bool) -> Self {
        Register {
            id,
            value: reset_value,
            reset_value,
            write_mask,
            writable,
            strict_write: false,
            fixed_set: 0,
            fixed_clear: 0,
            stats: RegisterStats::default(),
        }
    }

    pub fn with_strict_write(mut self, strict: bool) -> Self {
        self.strict_write = strict;
        self
    }

    pub fn with_fixed_bits(mut self, fixed_set: u64, fixed_clear: u64) -> Self {
        self.fixed_set = fixed_set;
        self.fixed_clear = fixed_clear;
        self
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Directly seeds the register value, bypassing the write mask. Used to
    /// populate sanitized platform-ID registers at startup (spec.md §6.2).
    pub fn seed(&mut self, value: u64) {
        self.value = value;
    }

    pub fn reset(&mut self) {
        self.value = self.reset_value;
    }

    pub fn stats(&self) -> RegisterStats {
        self.stats
    }

    /// `value <- (value & !mask) | (new & mask) | fixed_set`, clearing
    /// `fixed_clear` (spec.md §3).
    pub fn write(&mut self, new: u64, ticks: u64) -> Result<(), DevError> {
        if !self.writable {
            return Err(DevError::AccessErr);
        }
        if self.strict_write && (new & !self.write_mask & !self.fixed_set) != 0 {
            return Err(DevError::AccessErr);
        }
        self.value = (self.value & !self.write_mask) | (new & self.write_mask) | self.fixed_set;
        self.value &= !self.fixed_clear;
        self.stats.record(AccessKind::Write, ticks);
        Ok(())
    }

    pub fn read(&mut self, ticks: u64) -> u64 {
        self.stats.record(AccessKind::Read, ticks);
        self.value
    }
}

/// `HashMap<u32, Register>`-backed dispatch of guest system-register
/// accesses (spec.md §3/§4.1).
pub struct MsrBus {
    registers: RwLock<HashMap<u32, Arc<Mutex<Register>>>>,
}

impl Default for MsrBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MsrBus {
    pub fn new() -> Self {
        MsrBus {
            registers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, reg: Register) {
        self.registers.write().insert(reg.id, Arc::new(Mutex::new(reg)));
    }

    pub fn get(&self, id: u32) -> Option<Arc<Mutex<Register>>> {
        self.registers.read().get(&id).cloned()
    }

    pub fn access(&self, kind: AccessKind, id: u32, val: &mut u64) -> Result<(), DevError> {
        let reg = self.get(id).ok_or(DevError::NoDevice)?;
        let mut reg = reg.lock();
        match kind {
            AccessKind::Read => {
                *val = reg.read(0);
                Ok(())
            }
            AccessKind::Write => reg.write(*val, 0),
        }
    }

    pub fn reset_all(&self) {
        for reg in self.registers.read().values() {
            reg.lock().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_mask_semantics() {
        let mut reg = Register::new(1, 0xff00, 0x0f0f, true);
        reg.write(0xffff, 0).unwrap();
        assert_eq!(reg.value(), (0xff00 & !0x0f0f) | (0xffff & 0x0f0f));
    }

    #[test]
    fn read_only_write_rejected() {
        let mut reg = Register::new(2, 0, 0xffff, false);
        assert_eq!(reg.write(5, 0), Err(DevError::AccessErr));
    }

    #[test]
    fn strict_write_rejects_reserved_bits() {
        let mut reg = Register::new(3, 0, 0x0f, true).with_strict_write(true);
        assert!(reg.write(0x0f, 0).is_ok());
        assert_eq!(reg.write(0xf0, 0), Err(DevError::AccessErr));
    }

    #[test]
    fn bus_dispatch_roundtrip() {
        let bus = MsrBus::new();
        let id = encode_id(0b11, 0, 0, 0, 0);
        bus.register(Register::new(id, 0, u64::MAX, true));
        let mut val = 42;
        bus.access(AccessKind::Write, id, &mut val).unwrap();
        let mut out = 0;
        bus.access(AccessKind::Read, id, &mut out).unwrap();
        assert_eq!(out, 42);
    }

    #[test]
    fn reset_all_restores_reset_value() {
        let bus = MsrBus::new();
        bus.register(Register::new(9, 0x1234, u64::MAX, true));
        let mut val = 0xdead;
        bus.access(AccessKind::Write, 9, &mut val).unwrap();
        bus.reset_all();
        let mut out = 0;
        bus.access(AccessKind::Read, 9, &mut out).unwrap();
        assert_eq!(out, 0x1234);
    }

    #[test]
    fn aarch32_namespace_distinct_from_aarch64() {
        let a64 = encode_id(0b11, 0, 0, 0, 0);
        let a32 = encode_id(OP0_AARCH32, 0, 0, 0, 0);
        assert_ne!(a64, a32);
    }
}
