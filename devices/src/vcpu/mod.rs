// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The VCPU lifecycle: state machine, feature aggregation, roundup
//! coordination, and the `call_portal_handler` exit dispatch wrapper
//! (spec.md §3, §4.4).

pub mod feature;
pub mod roundup;
pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base::Event;
use hypervisor::exit::{vector_offset, VcpuExit};
use hypervisor::psci::FirmwareService;
use hypervisor::regs::{El1Reg, GuestRegs};

use crate::bus::{AccessKind, VBus};
use crate::error::DevResult;
use crate::gic::gicd::GicD;
use crate::msr::MsrBus;
use crate::vcpu::feature::{CpuFeature, Requester};
use crate::vcpu::state::AtomicVcpuState;

/// HCR_EL2.TVM: traps guest writes to the virtual-memory control group
/// (spec.md §4.4.2 "tvm").
const HCR_TVM: u64 = 1 << 26;
/// PSTATE.SS, toggled for the `single_step` feature (spec.md §4.4.2).
const PSTATE_SS: u64 = 1 << 21;

/// Which boot mode a VCPU starts in (spec.md §3).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum StartMode {
    Aarch64,
    Aarch32,
}

pub struct VcpuConfig {
    pub id: usize,
    pub physical_cpu_id: u32,
    pub boot_addr: u64,
    pub boot_args: [u64; 4],
    pub timer_offset: u64,
    pub start_mode: StartMode,
}

/// The four independently-requestable features a VCPU tracks (spec.md
/// §4.4.2).
#[derive(Default)]
pub struct VcpuFeatures {
    pub tvm: CpuFeature,
    pub single_step: CpuFeature,
    pub execution_paused: CpuFeature,
    pub reset: CpuFeature,
}

impl VcpuFeatures {
    fn clear(feature: &CpuFeature) {
        feature.request(false, Requester::Vmm, 0);
        feature.request(false, Requester::Vmi, 0);
    }
}

/// One in-flight list-register assignment, tracked so step 3's
/// `update_inj_status` call knows which (vintid, sender) a completed slot
/// belonged to (spec.md §4.4.1 step 3/5).
#[derive(Copy, Clone)]
struct LrSlot {
    vintid: u32,
    sender: u8,
}

/// State bits of our own list-register encoding, written into
/// `GuestRegs::gic_lr`/read back to interpret `update_inj_status` input.
/// There is no architectural LR format mandated here; `GuestRegs` is an
/// abstract register view, so the encoding only has to round-trip through
/// this crate and the host-hypervisor integration that backs it.
mod lr_encoding {
    use crate::gic::gicd::LrState;

    pub fn encode(vintid: u32, pintid_or_sender: u8, priority: u8, group1: bool, hw: bool) -> u64 {
        let mut v = vintid as u64;
        v |= (pintid_or_sender as u64) << 32;
        v |= (priority as u64) << 40;
        v |= (group1 as u64) << 48;
        v |= (hw as u64) << 49;
        v |= 0b01 << 62; // initial state: Pending
        v
    }

    pub fn state_of(lr: u64) -> LrState {
        match (lr >> 62) & 0b11 {
            0b00 => LrState::Inactive,
            0b01 => LrState::Pending,
            0b10 => LrState::Active,
            _ => LrState::ActivePending,
        }
    }
}

pub struct Vcpu {
    config: VcpuConfig,
    state: Arc<AtomicVcpuState>,
    features: VcpuFeatures,
    resume_signal: Event,
    off_semaphore: Event,
    irq_signal: Event,
    shutdown_requested: AtomicBool,
    lr_slots: Vec<std::sync::Mutex<Option<LrSlot>>>,
    gicd: Arc<GicD>,
    mmio_bus: Arc<VBus>,
    msr_bus: Arc<MsrBus>,
    firmware: Arc<dyn FirmwareService>,
}

impl Vcpu {
    pub fn new(
        config: VcpuConfig,
        state: Arc<AtomicVcpuState>,
        gicd: Arc<GicD>,
        mmio_bus: Arc<VBus>,
        msr_bus: Arc<MsrBus>,
        firmware: Arc<dyn FirmwareService>,
        num_list_regs: usize,
    ) -> Self {
        Vcpu {
            config,
            state,
            features: VcpuFeatures::default(),
            resume_signal: Event::new(),
            off_semaphore: Event::new(),
            irq_signal: Event::new(),
            shutdown_requested: AtomicBool::new(false),
            lr_slots: (0..num_list_regs).map(|_| std::sync::Mutex::new(None)).collect(),
            gicd,
            mmio_bus,
            msr_bus,
            firmware,
        }
    }

    pub fn id(&self) -> usize {
        self.config.id
    }

    pub fn state(&self) -> Arc<AtomicVcpuState> {
        self.state.clone()
    }

    pub fn features(&self) -> &VcpuFeatures {
        &self.features
    }

    /// Called by whatever drives `roundup_all`/`resume_all` once this VCPU's
    /// state has been flipped back (spec.md §4.4.3 step 5).
    pub fn notify_resumed(&self) {
        self.resume_signal.signal();
    }

    /// Wakes a VCPU parked in WFI/WFE (spec.md §4.4.4) or off_semaphore
    /// (spec.md §4.4.2 "execution_paused").
    pub fn notify_irq(&self) {
        self.irq_signal.signal();
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// The exit-dispatch wrapper (spec.md §4.4.1): runs the 7-step sequence
    /// around one host-hypervisor exit.
    pub fn call_portal_handler(&self, regs: &mut dyn GuestRegs, exit: VcpuExit) -> DevResult {
        // Step 1: never emulate during an active roundup.
        while !self.state.try_begin_emulation() {
            self.resume_signal.wait();
        }

        self.apply_reset_if_requested(regs);
        self.drain_completed_list_registers(regs);
        self.dispatch_exit(regs, exit)?;
        self.inject_irqs(regs);
        self.reconfigure(regs);

        self.state.end_emulation();
        Ok(())
    }

    fn apply_reset_if_requested(&self, regs: &mut dyn GuestRegs) {
        let (requested, _) = self.features.reset.read();
        if !requested {
            return;
        }
        for i in 0..31 {
            regs.set_gpr(i, 0);
        }
        regs.set_pc(self.config.boot_addr);
        for (i, arg) in self.config.boot_args.iter().enumerate() {
            regs.set_gpr(i as u8, *arg);
        }
        let spsr = match self.config.start_mode {
            // EL1h, all interrupts masked.
            StartMode::Aarch64 => 0x3c5,
            // AArch32 SVC mode, all interrupts masked.
            StartMode::Aarch32 => 0x1d3,
        };
        regs.set_pstate(spsr);
        regs.set_el2_hcr(0);
        regs.set_el1(El1Reg::Sctlr, 0);
        regs.set_el1(El1Reg::Tpidr, self.config.timer_offset);
        VcpuFeatures::clear(&self.features.reset);
    }

    fn drain_completed_list_registers(&self, regs: &dyn GuestRegs) {
        let elrsr = regs.gic_elrsr();
        for i in 0..regs.num_list_regs() {
            if elrsr & (1 << i) == 0 {
                continue;
            }
            let mut slot = self.lr_slots[i].lock().unwrap();
            if let Some(tracked) = slot.take() {
                let lr = regs.gic_lr(i);
                let lr_state = lr_encoding::state_of(lr);
                self.gicd
                    .update_inj_status(self.config.id, tracked.vintid, tracked.sender, lr_state);
            }
        }
    }

    fn dispatch_exit(&self, regs: &mut dyn GuestRegs, exit: VcpuExit) -> DevResult {
        match exit {
            VcpuExit::DataAbort | VcpuExit::InstructionAbort => {
                let far = regs.el2_far();
                let mut val = regs.gpr(0);
                // The actual decode of ISV/SAS/SRT/WnR from el2_esr() and
                // the resulting register selection are a host-hypervisor
                // integration concern; here we only forward the faulting
                // address to the MMIO bus as a representative 4-byte
                // access.
                self.mmio_bus.access(AccessKind::Read, far, 4, &mut val)?;
                regs.set_gpr(0, val);
                Ok(())
            }
            VcpuExit::SystemRegister => {
                let esr = regs.el2_esr();
                let id = (esr & 0xffff_ffff) as u32;
                // Direction bit, placed just above the 32-bit register id
                // (mirrors the ARM ISS "Direction" bit for MSR/MRS traps:
                // 0 = write/MSR, 1 = read/MRS), already available in the
                // same ESR word decoded above for `id`.
                let is_read = esr & (1 << 32) != 0;
                if is_read {
                    let mut val = 0u64;
                    self.msr_bus.access(AccessKind::Read, id, &mut val)?;
                    regs.set_gpr(0, val);
                } else {
                    let mut val = regs.gpr(0);
                    self.msr_bus.access(AccessKind::Write, id, &mut val)?;
                }
                Ok(())
            }
            VcpuExit::Smc64 => {
                let fn_id = regs.gpr(0) as u32;
                let args = [regs.gpr(1), regs.gpr(2), regs.gpr(3), regs.gpr(4)];
                let ret = self.firmware.call(fn_id, args);
                for (i, v) in ret.iter().enumerate() {
                    regs.set_gpr(i as u8, *v);
                }
                Ok(())
            }
            VcpuExit::WaitForInterrupt => {
                self.handle_wfi(regs);
                Ok(())
            }
            VcpuExit::Breakpoint { aarch32 } => {
                self.forward_breakpoint(regs, aarch32);
                Ok(())
            }
            VcpuExit::SoftwareStep => Ok(()),
            VcpuExit::Startup | VcpuExit::Recall | VcpuExit::VtimerExpired => Ok(()),
            VcpuExit::SystemEventReset | VcpuExit::Shutdown => {
                self.request_shutdown();
                Ok(())
            }
        }
    }

    /// spec.md §4.4.4: return immediately if the local IRQ controller
    /// already has something pending; otherwise block on `irq_signal`,
    /// timed against the virtual timer if armed.
    fn handle_wfi(&self, regs: &dyn GuestRegs) {
        if self.gicd.has_pending(self.config.id) {
            // Non-destructive peek: leave the commit (pending -> in-flight,
            // encoded into a list register) to the `inject_irqs` step that
            // follows in `call_portal_handler`.
            return;
        }
        let ctl = regs.tmr_cntv_ctl();
        let enabled = ctl & 0b1 != 0;
        let masked = ctl & 0b10 != 0;
        if enabled && !masked {
            let cval = regs.tmr_cntv_cval();
            let voff = regs.tmr_cntv_voff();
            let deadline_ticks = cval.saturating_sub(voff);
            let now = Instant::now();
            let deadline = now + Duration::from_nanos(deadline_ticks.min(1_000_000_000));
            self.irq_signal.wait_until(deadline);
        } else {
            self.irq_signal.wait();
        }
    }

    /// spec.md §4.4.5.
    fn forward_breakpoint(&self, regs: &mut dyn GuestRegs, aarch32: bool) {
        let pc = regs.pc();
        let pstate = regs.pstate();
        let esr = regs.el2_esr();
        regs.set_el1(El1Reg::Elr, pc);
        regs.set_el1(El1Reg::Spsr, pstate);
        regs.set_el1(El1Reg::Esr, esr);
        regs.set_el1(El1Reg::Far, regs.el2_far());

        let class = if aarch32 {
            vector_offset::LOWER_EL_AA32
        } else {
            vector_offset::LOWER_EL_AA64
        };
        let vbar = regs.el1(El1Reg::Vbar);
        regs.set_pc(vbar + class + vector_offset::SYNC);
    }

    /// spec.md §4.4.1 step 5: fill every free list-register slot from the
    /// GIC's highest-pending selection until either runs out.
    fn inject_irqs(&self, regs: &mut dyn GuestRegs) {
        let elrsr = regs.gic_elrsr();
        for i in 0..regs.num_list_regs() {
            if elrsr & (1 << i) == 0 {
                continue;
            }
            let entry = match self.gicd.pending_irq(self.config.id) {
                Some(entry) => entry,
                None => break,
            };
            let lr = lr_encoding::encode(
                entry.vintid,
                entry.pintid_or_sender,
                entry.priority,
                entry.group1,
                entry.hw,
            );
            regs.set_gic_lr(i, lr);
            *self.lr_slots[i].lock().unwrap() = Some(LrSlot {
                vintid: entry.vintid,
                sender: entry.pintid_or_sender,
            });
        }
    }

    /// spec.md §4.4.1 step 6 / §4.4.2 reconfigure actions.
    fn reconfigure(&self, regs: &mut dyn GuestRegs) {
        if self.features.tvm.check_clean() {
            let (enabled, _regs_mask) = self.features.tvm.read();
            let mut hcr = regs.el2_hcr();
            if enabled {
                hcr |= HCR_TVM;
            } else {
                hcr &= !HCR_TVM;
            }
            regs.set_el2_hcr(hcr);
        }
        if self.features.single_step.check_clean() {
            let (enabled, _) = self.features.single_step.read();
            let mut pstate = regs.pstate();
            if enabled {
                pstate |= PSTATE_SS;
            } else {
                pstate &= !PSTATE_SS;
            }
            regs.set_pstate(pstate);
        }
        if self.features.execution_paused.check_clean() {
            let (enabled, _) = self.features.execution_paused.read();
            if enabled {
                self.off_semaphore.wait();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gic::gicd::{GicConfig, GicVersion};
    use crate::gic::CpuIrqInterface;
    use hypervisor::psci::FirmwareService as _;
    use hypervisor::regs::test_regs::TestRegs;

    struct AlwaysAwake;
    impl CpuIrqInterface for AlwaysAwake {
        fn notify_interrupt_pending(&self) {}
        fn can_receive_irq(&self) -> bool {
            true
        }
    }

    struct NoopFirmware;
    impl FirmwareService for NoopFirmware {
        fn call(&self, _fn_id: u32, _args: [u64; 4]) -> [u64; 4] {
            [0; 4]
        }
    }

    fn make_vcpu() -> Vcpu {
        make_vcpu_with_msr_bus(Arc::new(MsrBus::new()))
    }

    fn make_vcpu_with_msr_bus(msr_bus: Arc<MsrBus>) -> Vcpu {
        let gicd = Arc::new(GicD::new(
            GicConfig {
                version: GicVersion::V3,
                num_vcpus: 1,
            },
            vec![Arc::new(AlwaysAwake)],
            vec![0],
        ));
        Vcpu::new(
            VcpuConfig {
                id: 0,
                physical_cpu_id: 0,
                boot_addr: 0x8000_0000,
                boot_args: [1, 2, 3, 4],
                timer_offset: 0,
                start_mode: StartMode::Aarch64,
            },
            Arc::new(AtomicVcpuState::new(state::VcpuState::On)),
            gicd,
            Arc::new(VBus::new(crate::bus::BusSpace::Mmio)),
            msr_bus,
            Arc::new(NoopFirmware),
            4,
        )
    }

    #[test]
    fn reset_feature_rewrites_registers() {
        let vcpu = make_vcpu();
        vcpu.features.reset.request(true, Requester::Vmm, 0);
        let mut regs = TestRegs::default();
        regs.pc = 0x1234;
        vcpu.call_portal_handler(&mut regs, VcpuExit::Startup).unwrap();
        assert_eq!(regs.pc, 0x8000_0000);
        assert_eq!(regs.gprs[0], 1);
        let (requested, _) = vcpu.features.reset.read();
        assert!(!requested);
    }

    #[test]
    fn blocked_during_roundup_until_resumed() {
        let vcpu = Arc::new(make_vcpu());
        vcpu.state.mark_roundedup();
        let v2 = vcpu.clone();
        let handle = std::thread::spawn(move || {
            let mut regs = TestRegs::default();
            v2.call_portal_handler(&mut regs, VcpuExit::Startup).unwrap();
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        vcpu.state.clear_roundedup();
        vcpu.notify_resumed();
        handle.join().unwrap();
    }

    #[test]
    fn breakpoint_forwarding_sets_vector_and_elr() {
        let vcpu = make_vcpu();
        let mut regs = TestRegs::default();
        regs.pc = 0x4000;
        regs.el1_vbar = 0x1000_0000;
        vcpu.call_portal_handler(&mut regs, VcpuExit::Breakpoint { aarch32: false })
            .unwrap();
        assert_eq!(regs.el1_elr, 0x4000);
        assert_eq!(regs.pc, 0x1000_0000 + vector_offset::LOWER_EL_AA64 + vector_offset::SYNC);
    }

    #[test]
    fn system_register_write_then_read_dispatch() {
        use crate::msr::{encode_id, Register};

        let msr_bus = Arc::new(MsrBus::new());
        let id = encode_id(0b11, 0, 0, 0, 0);
        msr_bus.register(Register::new(id, 0, u64::MAX, true));
        let vcpu = make_vcpu_with_msr_bus(msr_bus);

        // MSR (write): direction bit clear, source value in x0.
        let mut regs = TestRegs::default();
        regs.gprs[0] = 0x4242;
        regs.el2_esr = id as u64;
        vcpu.call_portal_handler(&mut regs, VcpuExit::SystemRegister).unwrap();
        assert_eq!(regs.gprs[0], 0x4242, "a write must not overwrite the source GPR");

        // MRS (read): direction bit set, result must land back in x0.
        let mut regs = TestRegs::default();
        regs.gprs[0] = 0xdead;
        regs.el2_esr = id as u64 | (1 << 32);
        vcpu.call_portal_handler(&mut regs, VcpuExit::SystemRegister).unwrap();
        assert_eq!(regs.gprs[0], 0x4242, "a read must return the register's value");
    }

    #[test]
    fn shutdown_exit_sets_flag() {
        let vcpu = make_vcpu();
        let mut regs = TestRegs::default();
        vcpu.call_portal_handler(&mut regs, VcpuExit::Shutdown).unwrap();
        assert!(vcpu.shutdown_requested());
    }
}
