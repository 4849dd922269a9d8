// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Split-ring descriptor/avail/used queue operations (spec.md §4.5.2-§4.5.3).

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use vm_memory::{demand_map_bus, demand_unmap_bus, GuestPhysAddr, SimpleAS};

use crate::error::{DevError, DevResult};

const DESC_SIZE: u64 = 16;
pub const DESC_F_NEXT: u16 = 1;
pub const DESC_F_WRITE: u16 = 2;
pub const DESC_F_INDIRECT: u16 = 4;

/// One descriptor-table entry (spec.md §4.5.3).
#[derive(Copy, Clone, Debug)]
pub struct Descriptor {
    pub address: u64,
    pub length: u32,
    pub flags: u16,
    pub next: u16,
}

/// A popped descriptor chain head, opaque to the caller except for the
/// index `send`/`conclude_chain_use` need back.
#[derive(Copy, Clone, Debug)]
pub struct DescriptorHandle {
    pub index: u16,
}

/// Guest memory viewed as a flat set of regions, the way a bus-wide burst
/// copy needs it (spec.md §4.2 `demand_map_bus`/`demand_unmap_bus`).
pub struct QueueMem {
    regions: Vec<Arc<SimpleAS>>,
}

impl QueueMem {
    pub fn new(regions: Vec<Arc<SimpleAS>>) -> Self {
        QueueMem { regions }
    }

    pub fn read_bytes(&self, gpa: GuestPhysAddr, dst: &mut [u8]) -> DevResult {
        let hva = demand_map_bus(&self.regions, gpa, dst.len() as u64, false)
            .map_err(|_| DevError::AccessErr)?;
        unsafe {
            std::ptr::copy_nonoverlapping(hva.as_ptr(), dst.as_mut_ptr(), dst.len());
        }
        demand_unmap_bus(&self.regions, gpa, dst.len() as u64, false).map_err(|_| DevError::AccessErr)
    }

    pub fn write_bytes(&self, gpa: GuestPhysAddr, src: &[u8]) -> DevResult {
        let hva = demand_map_bus(&self.regions, gpa, src.len() as u64, true)
            .map_err(|_| DevError::AccessErr)?;
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), hva.as_mut_ptr(), src.len());
        }
        demand_unmap_bus(&self.regions, gpa, src.len() as u64, true).map_err(|_| DevError::AccessErr)
    }

    fn read_u16(&self, gpa: GuestPhysAddr) -> DevResult<u16> {
        let mut buf = [0u8; 2];
        self.read_bytes(gpa, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn write_u16(&self, gpa: GuestPhysAddr, val: u16) -> DevResult {
        self.write_bytes(gpa, &val.to_le_bytes())
    }

    fn read_u32(&self, gpa: GuestPhysAddr) -> DevResult<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(gpa, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, gpa: GuestPhysAddr) -> DevResult<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(gpa, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

/// One split-ring virtqueue, device side (spec.md §4.5.2-§4.5.3).
pub struct DeviceQueue {
    mem: Arc<QueueMem>,
    desc_table: GuestPhysAddr,
    avail_ring: GuestPhysAddr,
    used_ring: GuestPhysAddr,
    size: u16,
    next_avail: std::sync::Mutex<u16>,
    next_used: std::sync::Mutex<u16>,
}

fn avail_ring_idx_addr(avail_ring: GuestPhysAddr) -> GuestPhysAddr {
    GuestPhysAddr(avail_ring.0 + 2)
}

fn avail_ring_slot_addr(avail_ring: GuestPhysAddr, idx: u16, size: u16) -> GuestPhysAddr {
    let _ = size;
    GuestPhysAddr(avail_ring.0 + 4 + 2 * idx as u64)
}

fn avail_used_event_addr(avail_ring: GuestPhysAddr, size: u16) -> GuestPhysAddr {
    GuestPhysAddr(avail_ring.0 + 4 + 2 * size as u64)
}

fn used_ring_idx_addr(used_ring: GuestPhysAddr) -> GuestPhysAddr {
    GuestPhysAddr(used_ring.0 + 2)
}

fn used_ring_slot_addr(used_ring: GuestPhysAddr, idx: u16) -> GuestPhysAddr {
    GuestPhysAddr(used_ring.0 + 4 + 8 * idx as u64)
}

fn used_avail_event_addr(used_ring: GuestPhysAddr, size: u16) -> GuestPhysAddr {
    GuestPhysAddr(used_ring.0 + 4 + 8 * size as u64)
}

impl DeviceQueue {
    /// The byte length of the descriptor table for `n` entries.
    pub fn desc_region_bytes(n: u16) -> u64 {
        n as u64 * DESC_SIZE
    }

    /// Avail ring: `flags(2) + idx(2) + ring(2*n) + used_event(2)`.
    pub fn avail_region_bytes(n: u16) -> u64 {
        4 + 2 * n as u64 + 2
    }

    /// Used ring: `flags(2) + idx(2) + ring(8*n) + avail_event(2)`.
    pub fn used_region_bytes(n: u16) -> u64 {
        4 + 8 * n as u64 + 2
    }

    pub fn new(
        mem: Arc<QueueMem>,
        desc_table: GuestPhysAddr,
        avail_ring: GuestPhysAddr,
        used_ring: GuestPhysAddr,
        size: u16,
    ) -> DevResult<Self> {
        if size == 0 || size > 32768 || !size.is_power_of_two() {
            return Err(DevError::InvalidParameter);
        }
        Ok(DeviceQueue {
            mem,
            desc_table,
            avail_ring,
            used_ring,
            size,
            next_avail: std::sync::Mutex::new(0),
            next_used: std::sync::Mutex::new(0),
        })
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn read_descriptor(&self, index: u16) -> DevResult<Descriptor> {
        if index >= self.size {
            return Err(DevError::NotRecoverable);
        }
        let base = GuestPhysAddr(self.desc_table.0 + index as u64 * DESC_SIZE);
        let address = self.mem.read_u64(base)?;
        let length = self.mem.read_u32(GuestPhysAddr(base.0 + 8))?;
        let flags = self.mem.read_u16(GuestPhysAddr(base.0 + 12))?;
        let next = self.mem.read_u16(GuestPhysAddr(base.0 + 14))?;
        Ok(Descriptor {
            address,
            length,
            flags,
            next,
        })
    }

    /// `next_in_chain`: spec.md §4.5.3.
    pub fn next_in_chain(&self, desc: &Descriptor) -> DevResult<Option<Descriptor>> {
        if desc.flags & DESC_F_NEXT == 0 {
            return Ok(None);
        }
        if desc.next >= self.size {
            return Err(DevError::NotRecoverable);
        }
        Ok(Some(self.read_descriptor(desc.next)?))
    }

    /// spec.md §4.5.3 `DeviceQueue.recv`.
    pub fn recv(&self) -> DevResult<DescriptorHandle> {
        let avail_idx = self.mem.read_u16(avail_ring_idx_addr(self.avail_ring))?;
        fence(Ordering::Acquire);
        let mut next_avail = self.next_avail.lock().unwrap();
        if avail_idx == *next_avail {
            return Err(DevError::NoEntry);
        }
        self.mem
            .write_u16(avail_used_event_addr(self.avail_ring, self.size), avail_idx)?;
        let slot = avail_ring_slot_addr(self.avail_ring, *next_avail % self.size, self.size);
        let ring_idx = self.mem.read_u16(slot)?;
        if ring_idx >= self.size {
            return Err(DevError::NotRecoverable);
        }
        *next_avail = next_avail.wrapping_add(1);
        Ok(DescriptorHandle { index: ring_idx })
    }

    /// spec.md §4.5.3 `DeviceQueue.send`.
    pub fn send(&self, desc: DescriptorHandle, len: u32) -> DevResult {
        let mut next_used = self.next_used.lock().unwrap();
        let slot = used_ring_slot_addr(self.used_ring, *next_used % self.size);
        let mut elem = [0u8; 8];
        elem[0..4].copy_from_slice(&(desc.index as u32).to_le_bytes());
        elem[4..8].copy_from_slice(&len.to_le_bytes());
        self.mem.write_bytes(slot, &elem)?;
        fence(Ordering::Release);
        *next_used = next_used.wrapping_add(1);
        self.mem
            .write_u16(used_ring_idx_addr(self.used_ring), *next_used)?;
        Ok(())
    }

    /// spec.md §4.5.3 "wrap-aware comparison": whether the driver wants a
    /// notification for the slot just produced.
    pub fn used_event_notify(&self, prev_driven: u16, used_idx: u16) -> DevResult<bool> {
        let used_event = self.mem.read_u16(used_avail_event_addr(self.used_ring, self.size))?;
        let diff = used_idx.wrapping_sub(used_event).wrapping_sub(1);
        let span = used_idx.wrapping_sub(prev_driven);
        Ok((diff as i16) < (span as i16))
    }
}
