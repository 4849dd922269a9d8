// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The virtio MMIO transport register map (spec.md §4.5.1, §4.5.5).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use sync::Mutex;

use crate::bus::{AccessKind, BusDevice};
use crate::error::{DevError, DevResult};

pub const MAGIC: u32 = 0x74726976;
pub const VERSION: u32 = 2;

pub const IRQ_QUEUE: u32 = 1 << 0;
pub const IRQ_CONFIG: u32 = 1 << 1;

/// `VIRTIO_F_VERSION_1`, always offered (spec.md §4.5.1).
pub const FEATURE_VERSION_1: u64 = 1 << 32;
/// `VIRTIO_F_ACCESS_PLATFORM`, gates whether queue addresses are
/// IO-translated rather than raw GPAs (spec.md §4.5.1).
pub const FEATURE_ACCESS_PLATFORM: u64 = 1 << 33;

const OFF_MAGIC: u64 = 0x00;
const OFF_VERSION: u64 = 0x04;
const OFF_DEVICE_ID: u64 = 0x08;
const OFF_VENDOR_ID: u64 = 0x0c;
const OFF_DEVICE_FEATURES: u64 = 0x10;
const OFF_DEVICE_FEATURES_SEL: u64 = 0x14;
const OFF_DRIVER_FEATURES: u64 = 0x20;
const OFF_DRIVER_FEATURES_SEL: u64 = 0x24;
const OFF_QUEUE_SEL: u64 = 0x30;
const OFF_QUEUE_NUM_MAX: u64 = 0x34;
const OFF_QUEUE_NUM: u64 = 0x38;
const OFF_QUEUE_READY: u64 = 0x44;
const OFF_QUEUE_NOTIFY: u64 = 0x50;
const OFF_IRQ_STATUS: u64 = 0x60;
const OFF_IRQ_ACK: u64 = 0x64;
const OFF_DEVICE_STATUS: u64 = 0x70;
const OFF_QUEUE_DESC_LOW: u64 = 0x80;
const OFF_QUEUE_DESC_HIGH: u64 = 0x84;
const OFF_QUEUE_DRIVER_LOW: u64 = 0x90;
const OFF_QUEUE_DRIVER_HIGH: u64 = 0x94;
const OFF_QUEUE_DEVICE_LOW: u64 = 0xa0;
const OFF_QUEUE_DEVICE_HIGH: u64 = 0xa4;
const OFF_CONFIG_GENERATION: u64 = 0xfc;
const OFF_CONFIG_SPACE: u64 = 0x100;
const OFF_CONFIG_SPACE_END: u64 = 0x164;

/// Shared interrupt-status line between a device's queue/config workers and
/// the transport register that surfaces it to the driver (spec.md §4.5.5).
/// Owned jointly: the device raises bits, the transport's `IrqAck` write
/// clears them; both sides see the same `AtomicU32`.
pub struct Interrupt {
    status: AtomicU32,
    raise: Box<dyn Fn() + Send + Sync>,
}

impl Interrupt {
    pub fn new(raise: impl Fn() + Send + Sync + 'static) -> Self {
        Interrupt {
            status: AtomicU32::new(0),
            raise: Box::new(raise),
        }
    }

    /// Transitions the named bit 0 -> 1 and calls `raise` only on that
    /// transition, so a level line already asserted doesn't re-inject
    /// (spec.md §4.5.5).
    fn assert(&self, bit: u32) {
        let prev = self.status.fetch_or(bit, Ordering::AcqRel);
        if prev & bit == 0 {
            (self.raise)();
        }
    }

    pub fn signal_used_queue(&self) {
        self.assert(IRQ_QUEUE);
    }

    pub fn signal_config_change(&self) {
        self.assert(IRQ_CONFIG);
    }

    fn status(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }

    fn ack(&self, bits: u32) {
        self.status.fetch_and(!bits, Ordering::AcqRel);
    }
}

/// Per-queue transport-visible state before `QueueReady` latches it into a
/// live `DeviceQueue` (spec.md §4.5.2).
#[derive(Default, Clone)]
struct QueueSetup {
    num: u32,
    ready: bool,
    desc_lo: u32,
    desc_hi: u32,
    driver_lo: u32,
    driver_hi: u32,
    device_lo: u32,
    device_hi: u32,
}

/// Implemented by a concrete virtio device (console, etc.) to answer the
/// transport-independent parts of the register interface (spec.md §3).
pub trait VirtioDevice: Send + Sync {
    fn device_id(&self) -> u32;
    fn num_queues(&self) -> usize;
    fn queue_num_max(&self, idx: usize) -> u32;
    fn device_features(&self, page: u32) -> u32;
    fn ack_driver_features(&self, page: u32, bits: u32);
    fn read_config(&self, offset: u64, data: &mut [u8]);
    fn write_config(&self, offset: u64, data: &[u8]);
    /// Called once a queue's four ring addresses and size are known, so the
    /// device can build its `DeviceQueue` (spec.md §4.5.2).
    fn activate_queue(&self, idx: usize, desc: u64, driver: u64, device: u64, num: u32) -> DevResult;
    fn queue_notify(&self, idx: usize);
    fn reset(&self);
}

/// The virtio MMIO register block (spec.md §4.5.1): magic/version/ids,
/// feature negotiation, per-queue setup, status, and config space, backed
/// by a shared `Interrupt` line (spec.md §4.5.5).
pub struct MmioTransport {
    device: Arc<dyn VirtioDevice>,
    interrupt: Arc<Interrupt>,
    device_features_sel: Mutex<u32>,
    driver_features_sel: Mutex<u32>,
    driver_features: Mutex<[u32; 2]>,
    queue_sel: Mutex<u32>,
    queues: Mutex<Vec<QueueSetup>>,
    status: Mutex<u32>,
    config_generation: AtomicU32,
}

impl MmioTransport {
    pub fn new(device: Arc<dyn VirtioDevice>, interrupt: Arc<Interrupt>) -> Self {
        let queues = vec![QueueSetup::default(); device.num_queues()];
        MmioTransport {
            device,
            interrupt,
            device_features_sel: Mutex::new(0),
            driver_features_sel: Mutex::new(0),
            driver_features: Mutex::new([0, 0]),
            queue_sel: Mutex::new(0),
            queues: Mutex::new(queues),
            status: Mutex::new(0),
            config_generation: AtomicU32::new(0),
        }
    }

    fn selected_queue(&self) -> usize {
        *self.queue_sel.lock() as usize
    }

    fn try_activate(&self, idx: usize) -> DevResult {
        let setup = self.queues.lock()[idx].clone();
        if !setup.ready {
            return Ok(());
        }
        let desc = ((setup.desc_hi as u64) << 32) | setup.desc_lo as u64;
        let driver = ((setup.driver_hi as u64) << 32) | setup.driver_lo as u64;
        let device = ((setup.device_hi as u64) << 32) | setup.device_lo as u64;
        self.device.activate_queue(idx, desc, driver, device, setup.num)
    }
}

impl BusDevice for MmioTransport {
    fn access(&self, kind: AccessKind, offset: u64, bytes: usize, val: &mut u64) -> DevResult {
        if (OFF_CONFIG_SPACE..OFF_CONFIG_SPACE_END).contains(&offset) {
            let cfg_off = offset - OFF_CONFIG_SPACE;
            match kind {
                AccessKind::Read => {
                    let mut buf = vec![0u8; bytes];
                    self.device.read_config(cfg_off, &mut buf);
                    let mut padded = [0u8; 8];
                    padded[..bytes].copy_from_slice(&buf);
                    *val = u64::from_le_bytes(padded);
                }
                AccessKind::Write => {
                    let buf = val.to_le_bytes()[..bytes].to_vec();
                    self.device.write_config(cfg_off, &buf);
                }
            }
            return Ok(());
        }

        match (kind, offset) {
            (AccessKind::Read, OFF_MAGIC) => *val = MAGIC as u64,
            (AccessKind::Read, OFF_VERSION) => *val = VERSION as u64,
            (AccessKind::Read, OFF_DEVICE_ID) => *val = self.device.device_id() as u64,
            (AccessKind::Read, OFF_VENDOR_ID) => *val = 0,
            (AccessKind::Read, OFF_DEVICE_FEATURES) => {
                let sel = *self.device_features_sel.lock();
                let page = if sel == 1 {
                    ((FEATURE_VERSION_1 | FEATURE_ACCESS_PLATFORM) >> 32) as u32 | self.device.device_features(1)
                } else {
                    self.device.device_features(0)
                };
                *val = page as u64;
            }
            (AccessKind::Write, OFF_DEVICE_FEATURES_SEL) => {
                *self.device_features_sel.lock() = *val as u32;
            }
            (AccessKind::Write, OFF_DRIVER_FEATURES) => {
                let sel = *self.driver_features_sel.lock() as usize;
                if sel < 2 {
                    self.driver_features.lock()[sel] = *val as u32;
                    self.device.ack_driver_features(sel as u32, *val as u32);
                }
            }
            (AccessKind::Write, OFF_DRIVER_FEATURES_SEL) => {
                *self.driver_features_sel.lock() = *val as u32;
            }
            (AccessKind::Write, OFF_QUEUE_SEL) => {
                *self.queue_sel.lock() = *val as u32;
            }
            (AccessKind::Read, OFF_QUEUE_NUM_MAX) => {
                *val = self.device.queue_num_max(self.selected_queue()) as u64;
            }
            (AccessKind::Write, OFF_QUEUE_NUM) => {
                let idx = self.selected_queue();
                self.queues.lock()[idx].num = *val as u32;
            }
            (AccessKind::Read, OFF_QUEUE_READY) => {
                let idx = self.selected_queue();
                *val = self.queues.lock()[idx].ready as u64;
            }
            (AccessKind::Write, OFF_QUEUE_READY) => {
                let idx = self.selected_queue();
                self.queues.lock()[idx].ready = *val != 0;
                self.try_activate(idx)?;
            }
            (AccessKind::Write, OFF_QUEUE_NOTIFY) => {
                self.device.queue_notify(*val as usize);
            }
            (AccessKind::Read, OFF_IRQ_STATUS) => {
                *val = self.interrupt.status() as u64;
            }
            (AccessKind::Write, OFF_IRQ_ACK) => {
                self.interrupt.ack(*val as u32);
            }
            (AccessKind::Read, OFF_DEVICE_STATUS) => {
                *val = *self.status.lock() as u64;
            }
            (AccessKind::Write, OFF_DEVICE_STATUS) => {
                let new_status = *val as u32;
                *self.status.lock() = new_status;
                if new_status == 0 {
                    self.reset();
                }
            }
            (AccessKind::Write, OFF_QUEUE_DESC_LOW) => {
                let idx = self.selected_queue();
                self.queues.lock()[idx].desc_lo = *val as u32;
            }
            (AccessKind::Write, OFF_QUEUE_DESC_HIGH) => {
                let idx = self.selected_queue();
                self.queues.lock()[idx].desc_hi = *val as u32;
            }
            (AccessKind::Write, OFF_QUEUE_DRIVER_LOW) => {
                let idx = self.selected_queue();
                self.queues.lock()[idx].driver_lo = *val as u32;
            }
            (AccessKind::Write, OFF_QUEUE_DRIVER_HIGH) => {
                let idx = self.selected_queue();
                self.queues.lock()[idx].driver_hi = *val as u32;
            }
            (AccessKind::Write, OFF_QUEUE_DEVICE_LOW) => {
                let idx = self.selected_queue();
                self.queues.lock()[idx].device_lo = *val as u32;
            }
            (AccessKind::Write, OFF_QUEUE_DEVICE_HIGH) => {
                let idx = self.selected_queue();
                self.queues.lock()[idx].device_hi = *val as u32;
            }
            (AccessKind::Read, OFF_CONFIG_GENERATION) => {
                *val = self.config_generation.load(Ordering::Acquire) as u64;
            }
            _ => return Err(DevError::AccessErr),
        }
        let _ = bytes;
        Ok(())
    }

    fn reset(&self) {
        *self.status.lock() = 0;
        *self.device_features_sel.lock() = 0;
        *self.driver_features_sel.lock() = 0;
        *self.driver_features.lock() = [0, 0];
        for q in self.queues.lock().iter_mut() {
            *q = QueueSetup::default();
        }
        self.interrupt.ack(IRQ_QUEUE | IRQ_CONFIG);
        self.device.reset();
    }

    fn device_type(&self) -> &str {
        "virtio-mmio"
    }
}
