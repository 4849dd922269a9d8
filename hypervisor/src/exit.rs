// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The exit classes the core dispatch wrapper consumes (spec.md §6.1's ESR
//! EC table), plus the exception-forwarding constants of spec.md §4.4.5.

/// One host-hypervisor exit, already classified by ESR EC. The raw ESR
/// value is still available from `GuestRegs::el2_esr` for the handlers
/// that need sub-fields (e.g. data-abort ISV decode).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum VcpuExit {
    WaitForInterrupt,
    /// MCR/MRC (EC 0x03/0x05), VMRS (EC 0x08), and MSR/MRS (EC 0x18) all
    /// resolve to a canonical 64-bit MSR-bus register id before dispatch.
    SystemRegister,
    Smc64,
    InstructionAbort,
    DataAbort,
    SoftwareStep,
    /// BKPT (EC 0x38, AArch32) or BRK (EC 0x3C, AArch64).
    Breakpoint { aarch32: bool },
    Startup,
    /// Request-to-stop; the roundup/state-machine wrapper handles this, the
    /// exit itself carries no payload.
    Recall,
    VtimerExpired,
    SystemEventReset,
    Shutdown,
}

/// Exception vector offsets used when the core synthesizes a same-EL or
/// lower-EL exception entry to forward a guest BRK/BKPT (spec.md §4.4.5).
/// Preserved verbatim as named constants.
pub mod vector_offset {
    pub const SAME_EL_SP0: u64 = 0x000;
    pub const SAME_EL_SPX: u64 = 0x200;
    pub const LOWER_EL_AA64: u64 = 0x400;
    pub const LOWER_EL_AA32: u64 = 0x600;

    pub const SYNC: u64 = 0x000;
    pub const IRQ: u64 = 0x080;
    pub const FIQ: u64 = 0x100;
    pub const SERR: u64 = 0x180;
}
