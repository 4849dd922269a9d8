// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The consumed external interface (spec.md §6.1/§6.2): a `GuestRegs` view
//! over one VCPU's architectural state, the classified `VcpuExit` it hands
//! the core on every exit, PSCI version plumbing, and the sanitized
//! platform-ID register set populated at startup.

pub mod exit;
pub mod psci;
pub mod regs;
pub mod startup;

pub use exit::{vector_offset, VcpuExit};
pub use psci::{FirmwareService, PsciVersion, PsciVersionError, PSCI_0_2, PSCI_NOT_SUPPORTED};
pub use regs::{DirtyMask, El1Reg, GuestRegs, VcpuRegAArch64};
pub use startup::{sanitize, RawPlatformRegs, SanitizedPlatformRegs};

#[cfg(any(test, feature = "test-util"))]
pub use regs::test_regs::TestRegs;
