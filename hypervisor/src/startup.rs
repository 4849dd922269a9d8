// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reception and sanitization of the platform ID registers carried in GPRs
//! at the VCPU startup exit (spec.md §6.2).

use crate::regs::GuestRegs;

/// The raw ID-register bundle as packed into GPRs/EL1 "scratch" registers
/// at startup, per spec.md §6.2's GPR layout.
#[derive(Copy, Clone, Default, Debug)]
pub struct RawPlatformRegs {
    pub id_aa64pfr0: u64,
    pub id_aa64pfr1: u64,
    pub id_aa64isar0: u64,
    pub id_aa64isar1: u64,
    pub id_aa64mmfr0: u64,
    pub id_aa64mmfr1: u64,
    pub id_aa64mmfr2: u64,
    pub id_aa64dfr0: u64,
    pub id_aa64dfr1: u64,
    pub id_aa64zfr0: u64,
    /// x16..x24: packed pairs of 32-bit AArch32 ID registers.
    pub aarch32_id_pairs: [u64; 9],
    pub mvfr0: u64,
    pub mvfr1: u64,
    pub mvfr2: u64,
    pub ccsidr_pairs: u64,
    pub ctr: u64,
    pub clidr: u64,
}

impl RawPlatformRegs {
    /// Reads the bundle off a startup exit's `GuestRegs` view, per the GPR
    /// layout spec.md §6.2 specifies (x0..x9, x16..x24, x29/x30, and a
    /// handful of EL1 "scratch" slots reused to ferry CCSIDR/CTR/CLIDR).
    pub fn from_guest_regs(regs: &dyn GuestRegs) -> Self {
        RawPlatformRegs {
            id_aa64pfr0: regs.gpr(0),
            id_aa64pfr1: regs.gpr(1),
            id_aa64isar0: regs.gpr(2),
            id_aa64isar1: regs.gpr(3),
            id_aa64mmfr0: regs.gpr(4),
            id_aa64mmfr1: regs.gpr(5),
            id_aa64mmfr2: regs.gpr(6),
            id_aa64dfr0: regs.gpr(7),
            id_aa64dfr1: regs.gpr(8),
            id_aa64zfr0: regs.gpr(9),
            aarch32_id_pairs: std::array::from_fn(|i| regs.gpr(16 + i as u8)),
            mvfr0: regs.gpr(29),
            mvfr1: regs.gpr(30),
            mvfr2: regs.sp(),
            ccsidr_pairs: regs.el1(crate::regs::El1Reg::Sp),
            ctr: regs.el1(crate::regs::El1Reg::Vbar),
            clidr: regs.el1(crate::regs::El1Reg::Sctlr),
        }
    }
}

// ID_AA64PFR0_EL1 4-bit feature fields (ARM ARM D19.2.64).
const PFR0_RAS_SHIFT: u32 = 28;
const PFR0_SVE_SHIFT: u32 = 32;
const PFR0_AMU_SHIFT: u32 = 44;
const PFR0_MPAM_SHIFT: u32 = 40;
const FIELD_MASK_4BIT: u64 = 0xf;

// ID_AA64MMFR1_EL1.VH (Virtualization Host Extensions).
const MMFR1_VH_SHIFT: u32 = 8;
// ID_AA64MMFR2_EL1.LO (LORegions) and .EVT (Enhanced Virtualization Traps).
const MMFR2_LO_SHIFT: u32 = 16;
const MMFR2_EVT_SHIFT: u32 = 56;
// ID_AA64MMFR2_EL1.NV (Nested Virtualization).
const MMFR2_NV_SHIFT: u32 = 24;

fn clear_field(value: u64, shift: u32, mask: u64) -> u64 {
    value & !(mask << shift)
}

/// The sanitized register set the core actually stores and later serves
/// from the MSR bus. Feature bits that this VMM does not model correctly
/// for a guest (RAS, SVE, MPAM, AMU, VHE, LORegions, Nested-Virt,
/// Enhanced-Virt-Traps) are masked to 0 so the guest does not probe for
/// support this core cannot provide (spec.md §6.2).
#[derive(Copy, Clone, Default, Debug)]
pub struct SanitizedPlatformRegs {
    pub id_aa64pfr0: u64,
    pub id_aa64pfr1: u64,
    pub id_aa64isar0: u64,
    pub id_aa64isar1: u64,
    pub id_aa64mmfr0: u64,
    pub id_aa64mmfr1: u64,
    pub id_aa64mmfr2: u64,
    pub id_aa64dfr0: u64,
    pub id_aa64dfr1: u64,
    pub id_aa64zfr0: u64,
    /// AArch32-only ID registers are not backed by real hardware state in
    /// this core; they are replaced with zeroed stand-ins (spec.md §6.2).
    pub aarch32_id_pairs: [u64; 9],
    pub mvfr0: u64,
    pub mvfr1: u64,
    pub mvfr2: u64,
    pub ctr: u64,
    pub clidr: u64,
}

pub fn sanitize(raw: &RawPlatformRegs) -> SanitizedPlatformRegs {
    let mut pfr0 = raw.id_aa64pfr0;
    pfr0 = clear_field(pfr0, PFR0_RAS_SHIFT, FIELD_MASK_4BIT);
    pfr0 = clear_field(pfr0, PFR0_SVE_SHIFT, FIELD_MASK_4BIT);
    pfr0 = clear_field(pfr0, PFR0_MPAM_SHIFT, FIELD_MASK_4BIT);
    pfr0 = clear_field(pfr0, PFR0_AMU_SHIFT, FIELD_MASK_4BIT);

    let mut mmfr1 = raw.id_aa64mmfr1;
    mmfr1 = clear_field(mmfr1, MMFR1_VH_SHIFT, FIELD_MASK_4BIT);

    let mut mmfr2 = raw.id_aa64mmfr2;
    mmfr2 = clear_field(mmfr2, MMFR2_LO_SHIFT, FIELD_MASK_4BIT);
    mmfr2 = clear_field(mmfr2, MMFR2_NV_SHIFT, FIELD_MASK_4BIT);
    mmfr2 = clear_field(mmfr2, MMFR2_EVT_SHIFT, FIELD_MASK_4BIT);

    SanitizedPlatformRegs {
        id_aa64pfr0: pfr0,
        id_aa64pfr1: raw.id_aa64pfr1,
        id_aa64isar0: raw.id_aa64isar0,
        id_aa64isar1: raw.id_aa64isar1,
        id_aa64mmfr0: raw.id_aa64mmfr0,
        id_aa64mmfr1: mmfr1,
        id_aa64mmfr2: mmfr2,
        id_aa64dfr0: raw.id_aa64dfr0,
        id_aa64dfr1: raw.id_aa64dfr1,
        id_aa64zfr0: 0,
        aarch32_id_pairs: [0; 9],
        mvfr0: raw.mvfr0,
        mvfr1: raw.mvfr1,
        mvfr2: raw.mvfr2,
        ctr: raw.ctr,
        clidr: raw.clidr,
    }
}
