// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The GIC Distributor: register interface, SGI/SPI routing, highest-
//! pending selection, and injection completion (spec.md §4.3.1-§4.3.5).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::bus::{AccessKind, BusDevice};
use crate::error::DevError;
use crate::gic::bitset::Bitset;
use crate::gic::injection::UNBANKED_SENDER;
use crate::gic::irq::GicIrq;
use crate::gic::{CpuIrqInterface, MAX_IRQ, MAX_PPI, MAX_SGI, MAX_SPI};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum GicVersion {
    V2,
    V3,
}

pub struct GicConfig {
    pub version: GicVersion,
    pub num_vcpus: usize,
}

const CTLR_GRP0: u32 = 1 << 0;
const CTLR_GRP1: u32 = 1 << 1;
const CTLR_ARE: u32 = 1 << 4;

struct BankedCpu {
    sgi: Vec<GicIrq>,
    ppi: Vec<GicIrq>,
    pending_bitset: Bitset<{ MAX_IRQ as usize }>,
    in_injection_bitset: Bitset<{ MAX_IRQ as usize }>,
    irq_iface: Arc<dyn CpuIrqInterface>,
    /// GICv3 affinity tuple (aff3<<24|aff2<<16|aff1<<8|aff0), used to
    /// resolve `ICC_SGI1R_EL1`/IROUTER target decoding (spec.md §4.3.2).
    affinity: u64,
}

/// A decoded list-register entry, ready for the caller to write into
/// `GuestRegs::set_gic_lr` (spec.md §4.3.4 "Injection commit").
#[derive(Copy, Clone, Debug)]
pub struct ListRegisterEntry {
    pub vintid: u32,
    pub pintid_or_sender: u8,
    pub priority: u8,
    pub group1: bool,
    pub hw: bool,
}

/// The four list-register completion states the host hypervisor reports
/// (spec.md §4.3.5).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LrState {
    Inactive,
    Pending,
    Active,
    ActivePending,
}

/// `irq.id() > MAX_PPI + MAX_SGI` rather than `>=`: IRQ id exactly
/// `MAX_PPI+MAX_SGI` (the first SPI) incorrectly takes the non-routed
/// path. Documented in spec.md §9 as a known-bad but preserved behaviour.
fn takes_spi_routing_path(id: u32) -> bool {
    id > MAX_PPI + MAX_SGI
}

pub struct GicD {
    pub version: GicVersion,
    num_vcpus: usize,
    ctlr: AtomicU32,
    spi: Vec<GicIrq>,
    cpus: Vec<BankedCpu>,
}

impl GicD {
    pub fn new(config: GicConfig, cpu_ifaces: Vec<Arc<dyn CpuIrqInterface>>, affinities: Vec<u64>) -> Self {
        assert_eq!(cpu_ifaces.len(), config.num_vcpus);
        let spi = (MAX_SGI + MAX_PPI..MAX_IRQ).map(GicIrq::new).collect();
        let cpus = cpu_ifaces
            .into_iter()
            .zip(affinities)
            .map(|(iface, affinity)| BankedCpu {
                sgi: (0..MAX_SGI).map(GicIrq::new).collect(),
                ppi: (MAX_SGI..MAX_SGI + MAX_PPI).map(GicIrq::new).collect(),
                pending_bitset: Bitset::new(),
                in_injection_bitset: Bitset::new(),
                irq_iface: iface,
                affinity,
            })
            .collect();
        let ctlr_reset = match config.version {
            GicVersion::V2 => 0,
            GicVersion::V3 => 0,
        };
        GicD {
            version: config.version,
            num_vcpus: config.num_vcpus,
            ctlr: AtomicU32::new(ctlr_reset),
            spi,
            cpus,
        }
    }

    pub fn num_vcpus(&self) -> usize {
        self.num_vcpus
    }

    fn affinity_routing_enabled(&self) -> bool {
        self.version == GicVersion::V3 && self.ctlr.load(Ordering::Acquire) & CTLR_ARE != 0
    }

    fn irq_for(&self, vcpu: usize, id: u32) -> Option<&GicIrq> {
        if id < MAX_SGI {
            self.cpus[vcpu].sgi.get(id as usize)
        } else if id < MAX_SGI + MAX_PPI {
            self.cpus[vcpu].ppi.get((id - MAX_SGI) as usize)
        } else {
            self.spi.get((id - MAX_SGI - MAX_PPI) as usize)
        }
    }

    // ---- identification registers (spec.md §4.3.1, SPEC_FULL §2) ----

    /// `31 | ((num_vcpus-1) << 5) | (9 << 19) | (1 << 24)` (spec.md §4.3.1).
    pub fn typer(&self) -> u32 {
        31 | (((self.num_vcpus as u32 - 1) & 0x7) << 5) | (9 << 19) | (1 << 24)
    }

    /// `(version << 4) | 0xb` (spec.md §4.3.1).
    pub fn pidr2(&self) -> u32 {
        let version = match self.version {
            GicVersion::V2 => 2,
            GicVersion::V3 => 3,
        };
        (version << 4) | 0xb
    }

    /// Fixed implementer-JEP106 constant (SPEC_FULL §2 addendum): no
    /// specific implementer is mandated, so product/variant/revision are
    /// zeroed.
    pub fn iidr(&self) -> u32 {
        0
    }

    fn ctlr_write_mask(&self) -> u32 {
        match self.version {
            GicVersion::V2 => CTLR_GRP0 | CTLR_GRP1,
            GicVersion::V3 => CTLR_GRP0 | CTLR_GRP1 | CTLR_ARE,
        }
    }

    pub fn write_ctlr(&self, val: u32) {
        let mask = self.ctlr_write_mask();
        self.ctlr.store(val & mask, Ordering::Release);
    }

    pub fn read_ctlr(&self) -> u32 {
        self.ctlr.load(Ordering::Acquire)
    }

    // ---- SGI routing (spec.md §4.3.2) ----

    /// GICv2-style banked SGI assert: CAS-sets `pending[sender]` on
    /// `target`'s copy of `sgi`.
    pub fn assert_sgi_v2(&self, sender: usize, target: usize, sgi: u32) {
        let irq = &self.cpus[target].sgi[sgi as usize];
        irq.injection.assert(0, sender as u8);
        self.cpus[target].pending_bitset.set(sgi as usize);
        self.cpus[target].irq_iface.notify_interrupt_pending();
    }

    pub fn deassert_sgi_v2(&self, sender: usize, target: usize, sgi: u32) {
        let irq = &self.cpus[target].sgi[sgi as usize];
        irq.injection.deassert(sender as u8);
        if !irq.injection.pending_any() {
            self.cpus[target].pending_bitset.clear(sgi as usize);
        }
    }

    /// GICv3 `ICC_SGI1R_EL1` decode: resolves `(aff3,aff2,aff1,target_list)`
    /// to VCPU indices by affinity match, then asserts as if each were an
    /// SPI (spec.md §4.3.2).
    pub fn assert_sgi_v3(&self, sender: usize, aff3: u8, aff2: u8, aff1: u8, target_list: u16, sgi: u32) {
        let base_affinity = ((aff3 as u64) << 24) | ((aff2 as u64) << 16) | ((aff1 as u64) << 8);
        for bit in 0..16u64 {
            if target_list & (1 << bit) == 0 {
                continue;
            }
            let want = base_affinity | bit;
            if let Some(target) = self.cpus.iter().position(|c| c.affinity == want) {
                self.assert_sgi_v2(sender, target, sgi);
            }
        }
    }

    // ---- SPI routing (spec.md §4.3.3) ----

    /// `target` is a bitmap of up to 8 VCPUs when affinity routing is
    /// disabled. With affinity routing enabled and `routing_any` set, picks
    /// the first eligible VCPU; otherwise resolves the affinity tuple.
    pub fn assert_spi(&self, id: u32, target_mask: u32, routing_any: bool, affinity: Option<u64>) {
        let irq_idx = (id - MAX_SGI - MAX_PPI) as usize;
        let irq = &self.spi[irq_idx];
        if !self.affinity_routing_enabled() {
            irq.set_target(target_mask);
            irq.injection.assert(target_mask, UNBANKED_SENDER);
            for target in 0..self.num_vcpus {
                if target_mask & (1 << target) != 0 {
                    self.cpus[target].pending_bitset.set(id as usize);
                    self.cpus[target].irq_iface.notify_interrupt_pending();
                }
            }
            return;
        }
        let target = if routing_any {
            (0..self.num_vcpus).find(|&i| self.cpus[i].irq_iface.can_receive_irq())
        } else {
            affinity.and_then(|aff| self.cpus.iter().position(|c| c.affinity == aff))
        };
        if let Some(target) = target {
            irq.set_target(1 << target);
            irq.injection.assert(1 << target, UNBANKED_SENDER);
            self.cpus[target].pending_bitset.set(id as usize);
            self.cpus[target].irq_iface.notify_interrupt_pending();
        }
    }

    /// Lazy re-routing: called from the selector when the originally
    /// targeted VCPU can no longer accept IRQs (spec.md §4.3.3).
    fn redirect_spi(&self, id: u32) {
        let irq_idx = (id - MAX_SGI - MAX_PPI) as usize;
        let irq = &self.spi[irq_idx];
        if let Some(target) = (0..self.num_vcpus).find(|&i| self.cpus[i].irq_iface.can_receive_irq()) {
            irq.set_target(1 << target);
            irq.injection.assert(1 << target, UNBANKED_SENDER);
            self.cpus[target].pending_bitset.set(id as usize);
            self.cpus[target].irq_iface.notify_interrupt_pending();
        }
    }

    /// Non-destructive peek: true iff this VCPU's pending bitset has any
    /// bit set. Used by the WFI handler (spec.md §4.4.4), which must not
    /// commit an injection the way `pending_irq` does — committing here
    /// would move the IRQ to `in_injection` before `inject_irqs` ever
    /// encodes it into a list register, losing it.
    pub fn has_pending(&self, vcpu: usize) -> bool {
        self.cpus[vcpu].pending_bitset.iter_set().next().is_some()
    }

    // ---- highest-pending selection (spec.md §4.3.4) ----

    /// Iterates the calling VCPU's pending bitset, performs lazy SPI
    /// re-routing, and returns the highest-priority eligible IRQ, CAS-
    /// committing it from pending to in-injection. Priority ordering
    /// deliberately preserves the source's "larger numeric priority wins"
    /// comparator, which is the reverse of the real ARM GIC spec (spec.md
    /// §4.3.4, §9).
    pub fn pending_irq(&self, vcpu: usize) -> Option<ListRegisterEntry> {
        let ctlr = self.ctlr.load(Ordering::Acquire);
        let g0 = ctlr & CTLR_GRP0 != 0;
        let g1 = ctlr & CTLR_GRP1 != 0;

        let mut best: Option<(u32, &GicIrq)> = None;
        for id in self.cpus[vcpu].pending_bitset.iter_set() {
            let id = id as u32;
            if takes_spi_routing_path(id) && !self.cpus[vcpu].irq_iface.can_receive_irq() {
                self.redirect_spi(id);
                continue;
            }
            let irq = match self.irq_for(vcpu, id) {
                Some(irq) => irq,
                None => continue,
            };
            if !((irq.group1() && g1) || (!irq.group1() && g0)) {
                continue;
            }
            if !irq.enabled() || self.cpus[vcpu].in_injection_bitset.get(id as usize) {
                continue;
            }
            match best {
                // Preserved source deviation: higher numeric priority wins.
                None => best = Some((id, irq)),
                Some((_, best_irq)) if irq.priority() > best_irq.priority() => best = Some((id, irq)),
                _ => {}
            }
        }

        let (id, irq) = best?;
        let sender = {
            let mask = irq.injection.pending_mask();
            if mask == 0 {
                UNBANKED_SENDER
            } else {
                mask.trailing_zeros() as u8
            }
        };
        if !irq.injection.commit_injection(sender) {
            return None;
        }
        self.cpus[vcpu].pending_bitset.clear(id as usize);
        self.cpus[vcpu].in_injection_bitset.set(id as usize);

        Some(ListRegisterEntry {
            vintid: id,
            pintid_or_sender: sender,
            priority: irq.priority(),
            group1: irq.group1(),
            hw: irq.hw,
        })
    }

    // ---- completion (spec.md §4.3.5) ----

    pub fn update_inj_status(&self, vcpu: usize, id: u32, sender: u8, state: LrState) {
        let irq = match self.irq_for(vcpu, id) {
            Some(irq) => irq,
            None => return,
        };
        self.cpus[vcpu].in_injection_bitset.clear(id as usize);
        match state {
            LrState::Inactive => {
                irq.injection.complete_inactive(sender);
                if irq.injection.is_pending(sender) {
                    self.cpus[vcpu].pending_bitset.set(id as usize);
                }
            }
            LrState::Pending | LrState::ActivePending | LrState::Active => {
                irq.injection.complete_still_pending(sender);
                self.cpus[vcpu].pending_bitset.set(id as usize);
            }
        }
    }

    // ---- register-array helpers (spec.md §4.3.1) ----

    /// Reads a 1-bit-per-IRQ array register (enable/pending/active/group).
    pub fn read_bit_array(&self, vcpu: usize, base_id: u32, word_idx: u32, getter: impl Fn(&GicIrq) -> bool) -> u32 {
        let mut val = 0u32;
        for bit in 0..32 {
            let id = base_id + word_idx * 32 + bit;
            if id >= MAX_IRQ {
                break;
            }
            if let Some(irq) = self.irq_for(vcpu, id) {
                if getter(irq) {
                    val |= 1 << bit;
                }
            }
        }
        val
    }

    pub fn write_bit_array(&self, vcpu: usize, base_id: u32, word_idx: u32, val: u32, setter: impl Fn(&GicIrq, bool)) {
        for bit in 0..32 {
            let id = base_id + word_idx * 32 + bit;
            if id >= MAX_IRQ {
                break;
            }
            if val & (1 << bit) != 0 {
                if let Some(irq) = self.irq_for(vcpu, id) {
                    setter(irq, true);
                }
            }
        }
    }

    /// Reads a one-byte-per-IRQ array register (priority/target), 4 IRQs
    /// packed per 32-bit word.
    pub fn read_byte_array(&self, vcpu: usize, base_id: u32, word_idx: u32, getter: impl Fn(&GicIrq) -> u8) -> u32 {
        let mut val = 0u32;
        for lane in 0..4 {
            let id = base_id + word_idx * 4 + lane;
            if id >= MAX_IRQ {
                break;
            }
            if let Some(irq) = self.irq_for(vcpu, id) {
                val |= (getter(irq) as u32) << (lane * 8);
            }
        }
        val
    }

    pub fn write_byte_array(&self, vcpu: usize, base_id: u32, word_idx: u32, val: u32, setter: impl Fn(&GicIrq, u8)) {
        for lane in 0..4 {
            let id = base_id + word_idx * 4 + lane;
            if id >= MAX_IRQ {
                break;
            }
            if let Some(irq) = self.irq_for(vcpu, id) {
                setter(irq, ((val >> (lane * 8)) & 0xff) as u8);
            }
        }
    }

    /// Reads a 2-bit-per-IRQ config array register (edge/level), 16 IRQs
    /// packed per 32-bit word.
    pub fn read_config_array(&self, vcpu: usize, base_id: u32, word_idx: u32) -> u32 {
        let mut val = 0u32;
        for lane in 0..16 {
            let id = base_id + word_idx * 16 + lane;
            if id >= MAX_IRQ {
                break;
            }
            if let Some(irq) = self.irq_for(vcpu, id) {
                if irq.sw_edge() {
                    val |= 0b10 << (lane * 2);
                }
            }
        }
        val
    }

    pub fn write_config_array(&self, vcpu: usize, base_id: u32, word_idx: u32, val: u32) {
        for lane in 0..16 {
            let id = base_id + word_idx * 16 + lane;
            if id >= MAX_IRQ || id < MAX_SGI + MAX_PPI {
                // SGIs/PPIs have fixed (non-guest-configurable) edge config.
                continue;
            }
            if let Some(irq) = self.irq_for(vcpu, id) {
                irq.set_sw_edge(val & (0b10 << (lane * 2)) != 0);
            }
        }
    }

    pub fn reset(&self) {
        self.ctlr.store(0, Ordering::Release);
        for irq in &self.spi {
            irq.reset();
        }
        for cpu in &self.cpus {
            for irq in cpu.sgi.iter().chain(cpu.ppi.iter()) {
                irq.reset();
            }
        }
    }
}

/// GIC distributor presented as a bus-resident MMIO device. Offset
/// decoding of the full per-register-class map lives in the VMM-glue layer
/// that knows the concrete register offsets for the running GIC version;
/// this `access` implements the common identification/CTLR subset shared
/// by both versions (spec.md §4.3.1).
pub struct GicDDevice {
    pub gicd: Arc<GicD>,
}

const OFFSET_CTLR: u64 = 0x000;
const OFFSET_TYPER: u64 = 0x004;
const OFFSET_IIDR: u64 = 0x008;
const OFFSET_PIDR2: u64 = 0xfe8;

impl BusDevice for GicDDevice {
    fn access(&self, kind: AccessKind, offset: u64, _bytes: usize, val: &mut u64) -> Result<(), DevError> {
        match kind {
            AccessKind::Read => {
                *val = match offset {
                    OFFSET_CTLR => self.gicd.read_ctlr() as u64,
                    OFFSET_TYPER => self.gicd.typer() as u64,
                    OFFSET_IIDR => self.gicd.iidr() as u64,
                    OFFSET_PIDR2 => self.gicd.pidr2() as u64,
                    _ => 0,
                };
                Ok(())
            }
            AccessKind::Write => {
                match offset {
                    OFFSET_CTLR => self.gicd.write_ctlr(*val as u32),
                    // Writes to read-only/reserved regions are write-ignored
                    // (spec.md §4.3.1).
                    _ => {}
                }
                Ok(())
            }
        }
    }

    fn reset(&self) {
        self.gicd.reset();
    }

    fn is_interrupt_controller(&self) -> bool {
        true
    }

    fn device_type(&self) -> &str {
        "arm-gicd"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync::Mutex;

    struct FakeCpu {
        notified: Mutex<u32>,
        awake: Mutex<bool>,
    }

    impl CpuIrqInterface for FakeCpu {
        fn notify_interrupt_pending(&self) {
            *self.notified.lock() += 1;
        }
        fn can_receive_irq(&self) -> bool {
            *self.awake.lock()
        }
    }

    fn make_gic(num_vcpus: usize) -> (GicD, Vec<Arc<FakeCpu>>) {
        let cpus: Vec<Arc<FakeCpu>> = (0..num_vcpus)
            .map(|_| {
                Arc::new(FakeCpu {
                    notified: Mutex::new(0),
                    awake: Mutex::new(true),
                })
            })
            .collect();
        let ifaces: Vec<Arc<dyn CpuIrqInterface>> =
            cpus.iter().map(|c| c.clone() as Arc<dyn CpuIrqInterface>).collect();
        let affinities = (0..num_vcpus as u64).collect();
        let gic = GicD::new(
            GicConfig {
                version: GicVersion::V2,
                num_vcpus,
            },
            ifaces,
            affinities,
        );
        (gic, cpus)
    }

    #[test]
    fn typer_formula() {
        let (gic, _) = make_gic(4);
        assert_eq!(gic.typer(), 31 | (3 << 5) | (9 << 19) | (1 << 24));
    }

    #[test]
    fn pidr2_formula() {
        let (gic, _) = make_gic(1);
        assert_eq!(gic.pidr2(), (2 << 4) | 0xb);
    }

    #[test]
    fn sgi_v2_assert_and_select() {
        let (gic, cpus) = make_gic(2);
        gic.assert_sgi_v2(0, 1, 3);
        assert_eq!(*cpus[1].notified.lock(), 1);
        gic.write_ctlr(CTLR_GRP0 | CTLR_GRP1);
        gic.irq_for(1, 3).unwrap().set_enabled(true);
        let lr = gic.pending_irq(1).unwrap();
        assert_eq!(lr.vintid, 3);
        assert_eq!(lr.pintid_or_sender, 0);
    }

    #[test]
    fn injection_exclusivity_after_selection() {
        let (gic, _) = make_gic(1);
        gic.assert_spi(40, 0b1, false, None);
        gic.write_ctlr(CTLR_GRP0 | CTLR_GRP1);
        gic.irq_for(0, 40).unwrap().set_enabled(true);
        let lr = gic.pending_irq(0).unwrap();
        assert_eq!(lr.vintid, 40);
        assert!(!gic.cpus[0].pending_bitset.get(40));
        assert!(gic.cpus[0].in_injection_bitset.get(40));
        assert!(gic.pending_irq(0).is_none());
    }

    #[test]
    fn completion_inactive_clears_in_injection() {
        let (gic, _) = make_gic(1);
        gic.assert_spi(40, 0b1, false, None);
        gic.write_ctlr(CTLR_GRP0 | CTLR_GRP1);
        gic.irq_for(0, 40).unwrap().set_enabled(true);
        let lr = gic.pending_irq(0).unwrap();
        gic.update_inj_status(0, 40, lr.pintid_or_sender, LrState::Inactive);
        assert!(!gic.cpus[0].in_injection_bitset.get(40));
        assert!(!gic.cpus[0].pending_bitset.get(40));
        assert!(!gic.irq_for(0, 40).unwrap().injection.pending_any());
    }

    #[test]
    fn priority_selection_is_larger_wins() {
        let (gic, _) = make_gic(1);
        gic.write_ctlr(CTLR_GRP0 | CTLR_GRP1);
        gic.assert_spi(40, 0b1, false, None);
        gic.assert_spi(41, 0b1, false, None);
        gic.irq_for(0, 40).unwrap().set_enabled(true);
        gic.irq_for(0, 40).unwrap().set_priority(0x10);
        gic.irq_for(0, 41).unwrap().set_enabled(true);
        gic.irq_for(0, 41).unwrap().set_priority(0x20);
        let lr = gic.pending_irq(0).unwrap();
        assert_eq!(lr.vintid, 41);
    }

    #[test]
    fn has_pending_does_not_commit_injection() {
        let (gic, _) = make_gic(1);
        gic.assert_spi(40, 0b1, false, None);
        assert!(gic.has_pending(0));
        // Peeking must not move the IRQ into in-injection or clear pending.
        assert!(gic.cpus[0].pending_bitset.get(40));
        assert!(!gic.cpus[0].in_injection_bitset.get(40));
        gic.write_ctlr(CTLR_GRP0 | CTLR_GRP1);
        gic.irq_for(0, 40).unwrap().set_enabled(true);
        let lr = gic.pending_irq(0).unwrap();
        assert_eq!(lr.vintid, 40);
    }

    #[test]
    fn spi_boundary_bug_preserved() {
        assert!(!takes_spi_routing_path(32));
        assert!(takes_spi_routing_path(33));
    }
}
