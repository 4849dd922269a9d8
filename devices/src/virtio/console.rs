// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Virtio console device, id 3 (spec.md §4.6, component C9).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use vm_memory::GuestPhysAddr;

use crate::error::{DevError, DevResult};
use crate::virtio::mmio::{Interrupt, VirtioDevice};
use crate::virtio::queue::{DeviceQueue, QueueMem};
use crate::virtio::sg::{self, Chain};

const QUEUE_RX: usize = 0;
const QUEUE_TX: usize = 1;
const NUM_QUEUES: usize = 2;
const QUEUE_SIZE_MAX: u32 = 256;

const CONFIG_SIZE: usize = 12;

/// Notified on device reset and shutdown (spec.md §4.6 "console callback").
pub trait ConsoleCallback: Send + Sync {
    fn on_reset(&self) {}
    fn on_shutdown(&self) {}
}

#[derive(Copy, Clone, Default)]
struct ConsoleConfig {
    cols: u16,
    rows: u16,
    num_ports: u32,
    emerg_wr: u32,
}

impl ConsoleConfig {
    fn to_bytes(self) -> [u8; CONFIG_SIZE] {
        let mut buf = [0u8; CONFIG_SIZE];
        buf[0..2].copy_from_slice(&self.cols.to_le_bytes());
        buf[2..4].copy_from_slice(&self.rows.to_le_bytes());
        buf[4..8].copy_from_slice(&self.num_ports.to_le_bytes());
        buf[8..12].copy_from_slice(&self.emerg_wr.to_le_bytes());
        buf
    }
}

struct QueueState {
    queue: Option<DeviceQueue>,
    /// A chain popped but only partially drained by `from_guest` because
    /// the caller's buffer ran out first, plus how many of its bytes are
    /// already delivered. Reset returns it to the queue undelivered
    /// (spec.md §4.6 `reset()`).
    in_flight: Option<(Chain, usize)>,
}

impl Default for QueueState {
    fn default() -> Self {
        QueueState {
            queue: None,
            in_flight: None,
        }
    }
}

/// Virtio console: RX queue (guest-writable, host fills), TX queue
/// (guest-readable, host drains), a 12-byte config struct, and an
/// optional external callback (spec.md §4.6).
pub struct ConsoleDevice {
    mem: Arc<QueueMem>,
    interrupt: Arc<Interrupt>,
    queues: [Mutex<QueueState>; NUM_QUEUES],
    config: Mutex<ConsoleConfig>,
    driver_features: [AtomicU32; 2],
    empty_space: Condvar,
    empty_space_lock: Mutex<()>,
    callback: Option<Arc<dyn ConsoleCallback>>,
}

impl ConsoleDevice {
    pub fn new(mem: Arc<QueueMem>, interrupt: Arc<Interrupt>, callback: Option<Arc<dyn ConsoleCallback>>) -> Arc<Self> {
        Arc::new(ConsoleDevice {
            mem,
            interrupt,
            queues: [Mutex::new(QueueState::default()), Mutex::new(QueueState::default())],
            config: Mutex::new(ConsoleConfig {
                cols: 80,
                rows: 25,
                num_ports: 1,
                emerg_wr: 0,
            }),
            driver_features: [AtomicU32::new(0), AtomicU32::new(0)],
            empty_space: Condvar::new(),
            empty_space_lock: Mutex::new(()),
            callback,
        })
    }

    /// Drains completed TX chains into `out_buf`, returning bytes
    /// delivered. May pop several chains to fill `out_buf`; a chain larger
    /// than the remaining space is parked as in-flight and resumed on the
    /// next call. Signals `sig_notify_empty_space` each time a chain is
    /// fully consumed and returned to the driver (spec.md §4.6
    /// `from_guest`).
    pub fn from_guest(&self, out_buf: &mut [u8]) -> DevResult<usize> {
        let mut state = self.queues[QUEUE_TX].lock().unwrap();
        let queue = match state.queue.as_ref() {
            Some(q) => q,
            None => return Ok(0),
        };

        let mut delivered = 0usize;
        loop {
            if delivered >= out_buf.len() {
                break;
            }
            let (chain, mut consumed) = match state.in_flight.take() {
                Some(c) => c,
                None => match sg::walk_chain(queue, None) {
                    Ok(c) => (c, 0),
                    Err(DevError::NoEntry) => break,
                    Err(e) => return Err(e),
                },
            };

            let total_len: usize = chain.nodes.iter().map(|n| n.length as usize).sum();
            let mut offset = 0usize;
            for node in &chain.nodes {
                let len = node.length as usize;
                if offset + len <= consumed {
                    offset += len;
                    continue;
                }
                if delivered >= out_buf.len() {
                    break;
                }
                let node_consumed = consumed.saturating_sub(offset);
                let avail = len - node_consumed;
                let to_copy = avail.min(out_buf.len() - delivered);
                self.mem.read_bytes(
                    GuestPhysAddr(node.address + node_consumed as u64),
                    &mut out_buf[delivered..delivered + to_copy],
                )?;
                delivered += to_copy;
                consumed += to_copy;
                offset += len;
            }

            if consumed >= total_len {
                sg::conclude_chain_use(queue, &chain)?;
                self.empty_space.notify_all();
            } else {
                state.in_flight = Some((chain, consumed));
                break;
            }
        }
        Ok(delivered)
    }

    /// Takes RX chains and splits `buf` across them, asserting the queue
    /// IRQ for each one filled. Blocks on `sig_notify_empty_space` if no
    /// chain is currently available (spec.md §4.6 `to_guest`).
    pub fn to_guest(&self, buf: &[u8]) -> DevResult<usize> {
        let mut written = 0usize;
        while written < buf.len() {
            let mut chain = loop {
                let queue_present = self.queues[QUEUE_RX].lock().unwrap().queue.is_some();
                if !queue_present {
                    return Ok(written);
                }
                let popped = {
                    let state = self.queues[QUEUE_RX].lock().unwrap();
                    let queue = state.queue.as_ref().unwrap();
                    sg::walk_chain(queue, None)
                };
                match popped {
                    Ok(c) => break c,
                    Err(DevError::NoEntry) => {
                        let guard = self.empty_space_lock.lock().unwrap();
                        let _ = self
                            .empty_space
                            .wait_timeout(guard, std::time::Duration::from_millis(50))
                            .unwrap();
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            };

            let state = self.queues[QUEUE_RX].lock().unwrap();
            let queue = state.queue.as_ref().unwrap();
            let cap: usize = chain.nodes.iter().filter(|n| n.writable()).map(|n| n.length as usize).sum();
            let this_write = cap.min(buf.len() - written);
            let mut remaining = this_write;
            let mut src_off = written;
            for node in &mut chain.nodes {
                if remaining == 0 {
                    break;
                }
                if !node.writable() {
                    continue;
                }
                let take = remaining.min(node.length as usize);
                self.mem
                    .write_bytes(GuestPhysAddr(node.address), &buf[src_off..src_off + take])?;
                node.prefix_written_bytes = node.prefix_written_bytes.max(take as u32);
                remaining -= take;
                src_off += take;
            }
            sg::conclude_chain_use(queue, &chain)?;
            written += this_write;
            self.interrupt.signal_used_queue();
        }
        Ok(written)
    }
}

impl VirtioDevice for ConsoleDevice {
    fn device_id(&self) -> u32 {
        3
    }

    fn num_queues(&self) -> usize {
        NUM_QUEUES
    }

    fn queue_num_max(&self, _idx: usize) -> u32 {
        QUEUE_SIZE_MAX
    }

    fn device_features(&self, _page: u32) -> u32 {
        0
    }

    fn ack_driver_features(&self, page: u32, bits: u32) {
        if let Some(slot) = self.driver_features.get(page as usize) {
            slot.store(bits, Ordering::Release);
        }
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        let config = self.config.lock().unwrap().to_bytes();
        let offset = offset as usize;
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = config.get(offset + i).copied().unwrap_or(0);
        }
    }

    fn write_config(&self, _offset: u64, _data: &[u8]) {
        // Config space is host-owned; driver writes to it are ignored
        // (spec.md §4.6 names no writable config field).
    }

    fn activate_queue(&self, idx: usize, desc: u64, driver: u64, device: u64, num: u32) -> DevResult {
        if idx >= NUM_QUEUES {
            return Err(DevError::InvalidParameter);
        }
        let queue = DeviceQueue::new(
            self.mem.clone(),
            GuestPhysAddr(desc),
            GuestPhysAddr(driver),
            GuestPhysAddr(device),
            num as u16,
        )?;
        self.queues[idx].lock().unwrap().queue = Some(queue);
        Ok(())
    }

    fn queue_notify(&self, idx: usize) {
        if idx == QUEUE_TX {
            self.empty_space.notify_all();
        }
    }

    fn reset(&self) {
        for state in &self.queues {
            let mut state = state.lock().unwrap();
            state.queue = None;
            state.in_flight = None;
        }
        if let Some(cb) = &self.callback {
            cb.on_reset();
        }
    }
}

impl ConsoleDevice {
    pub fn shutdown(&self) {
        if let Some(cb) = &self.callback {
            cb.on_shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtio::queue::{Descriptor, DESC_F_WRITE};
    use std::sync::atomic::AtomicU32 as StdAtomicU32;
    use vm_memory::{AddressSpaceProvider, AsCred, HostVirtAddr, Range, SimpleAS};

    struct FakeProvider {
        backing: Mutex<Vec<u8>>,
    }

    impl AddressSpaceProvider for FakeProvider {
        fn mmap_update(&self, _hva: HostVirtAddr, _size: u64, _cred: AsCred) -> base::Result<()> {
            Ok(())
        }
        fn map_host(&self, _mem_descriptor: u64, _size: u64, _cred: AsCred) -> base::Result<HostVirtAddr> {
            Ok(HostVirtAddr(self.backing.lock().unwrap().as_ptr() as usize))
        }
        fn unmap_host(&self, _hva: HostVirtAddr, _size: u64) -> base::Result<()> {
            Ok(())
        }
    }

    fn mem_with(size: u64) -> (Arc<QueueMem>, GuestPhysAddr) {
        let provider = Arc::new(FakeProvider {
            backing: Mutex::new(vec![0u8; size as usize]),
        });
        let region = Arc::new(SimpleAS::new(Range::new(0, size), 0, AsCred::READ | AsCred::WRITE, provider));
        region.map_host().unwrap();
        let base = region.gpa_to_host(GuestPhysAddr(0)).unwrap();
        (Arc::new(QueueMem::new(vec![region])), GuestPhysAddr(base.0 as u64))
    }

    fn write_descriptor(mem: &QueueMem, desc_table: GuestPhysAddr, idx: u16, d: Descriptor) {
        let base = GuestPhysAddr(desc_table.0 + idx as u64 * 16);
        mem.write_bytes(base, &d.address.to_le_bytes()).unwrap();
        mem.write_bytes(GuestPhysAddr(base.0 + 8), &d.length.to_le_bytes()).unwrap();
        mem.write_bytes(GuestPhysAddr(base.0 + 12), &d.flags.to_le_bytes()).unwrap();
        mem.write_bytes(GuestPhysAddr(base.0 + 14), &d.next.to_le_bytes()).unwrap();
    }

    fn make_interrupt() -> (Arc<Interrupt>, Arc<StdAtomicU32>) {
        let raises = Arc::new(StdAtomicU32::new(0));
        let raises_clone = raises.clone();
        (
            Arc::new(Interrupt::new(move || {
                raises_clone.fetch_add(1, Ordering::AcqRel);
            })),
            raises,
        )
    }

    #[test]
    fn config_space_reads_back_defaults() {
        let (mem, _base) = mem_with(0x1000);
        let (interrupt, _raises) = make_interrupt();
        let console = ConsoleDevice::new(mem, interrupt, None);
        let mut buf = [0u8; CONFIG_SIZE];
        console.read_config(0, &mut buf);
        assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), 80);
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 25);
    }

    #[test]
    fn from_guest_drains_tx_chain_and_notifies_empty_space() {
        let (mem, host_base) = mem_with(0x10000);
        let (interrupt, _raises) = make_interrupt();
        let console = ConsoleDevice::new(mem.clone(), interrupt, None);

        let desc_table = GuestPhysAddr(0x100);
        let avail = GuestPhysAddr(0x1000);
        let used = GuestPhysAddr(0x2000);
        console.activate_queue(QUEUE_TX, desc_table.0, avail.0, used.0, 4).unwrap();

        write_descriptor(
            &mem,
            desc_table,
            0,
            Descriptor {
                address: host_base.0 + 0x4000,
                length: 5,
                flags: 0,
                next: 0,
            },
        );
        mem.write_bytes(GuestPhysAddr(host_base.0 + 0x4000), b"hello").unwrap();
        mem.write_bytes(GuestPhysAddr(avail.0 + 4), &0u16.to_le_bytes()).unwrap();
        mem.write_bytes(GuestPhysAddr(avail.0 + 2), &1u16.to_le_bytes()).unwrap();

        let mut out = [0u8; 5];
        let n = console.from_guest(&mut out).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn to_guest_fills_rx_chain_and_signals_queue_irq() {
        let (mem, host_base) = mem_with(0x10000);
        let (interrupt, raises) = make_interrupt();
        let console = ConsoleDevice::new(mem.clone(), interrupt, None);

        let desc_table = GuestPhysAddr(0x100);
        let avail = GuestPhysAddr(0x1000);
        let used = GuestPhysAddr(0x2000);
        console.activate_queue(QUEUE_RX, desc_table.0, avail.0, used.0, 4).unwrap();

        write_descriptor(
            &mem,
            desc_table,
            0,
            Descriptor {
                address: host_base.0 + 0x4000,
                length: 16,
                flags: DESC_F_WRITE,
                next: 0,
            },
        );
        mem.write_bytes(GuestPhysAddr(avail.0 + 4), &0u16.to_le_bytes()).unwrap();
        mem.write_bytes(GuestPhysAddr(avail.0 + 2), &1u16.to_le_bytes()).unwrap();

        let n = console.to_guest(b"hi there").unwrap();
        assert_eq!(n, 8);
        assert!(raises.load(Ordering::Acquire) >= 1);

        let mut readback = [0u8; 8];
        mem.read_bytes(GuestPhysAddr(host_base.0 + 0x4000), &mut readback).unwrap();
        assert_eq!(&readback, b"hi there");
    }

    #[test]
    fn reset_notifies_callback_and_clears_queues() {
        struct Cb(StdAtomicU32);
        impl ConsoleCallback for Cb {
            fn on_reset(&self) {
                self.0.fetch_add(1, Ordering::AcqRel);
            }
        }
        let (mem, _base) = mem_with(0x1000);
        let (interrupt, _raises) = make_interrupt();
        let cb = Arc::new(Cb(StdAtomicU32::new(0)));
        let console = ConsoleDevice::new(mem, interrupt, Some(cb.clone()));
        console.activate_queue(QUEUE_RX, 0x100, 0x1000, 0x2000, 4).unwrap();
        console.reset();
        assert_eq!(cb.0.load(Ordering::Acquire), 1);
        assert!(console.queues[QUEUE_RX].lock().unwrap().queue.is_none());
    }
}
