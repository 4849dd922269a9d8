// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The ARMv8-A virtual machine monitor's core device model: the virtual
//! bus, system-register dispatch, GIC, per-VCPU timer, VCPU lifecycle, and
//! virtio MMIO transport + console device (spec.md §1-§4).

pub mod bus;
pub mod error;
pub mod gic;
pub mod msr;
pub mod timer;
pub mod vcpu;
pub mod virtio;

pub use bus::{AccessKind, BusDevice, BusSpace, VBus};
pub use error::{DevError, DevResult};
pub use gic::{CpuIrqInterface, GicConfig, GicD, GicIts, GicR, GicVersion, InjectionInfo, ListRegisterEntry, LrState};
pub use msr::{MsrBus, Register};
pub use timer::{PerCpuTimer, TimerCtl, TimerIrqSink};
pub use vcpu::roundup::{RecallTarget, RoundupCoordinator};
pub use vcpu::state::{AtomicVcpuState, VcpuState};
pub use vcpu::{StartMode, Vcpu, VcpuConfig, VcpuFeatures};
