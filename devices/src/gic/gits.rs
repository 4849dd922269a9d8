// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interrupt Translation Service (GICv3 optional): device/collection/ITT
//! tables, command ring, and MSI translation (spec.md §3/§4.3.7).

use std::collections::HashMap;
use std::sync::Arc;

use sync::Mutex;
use vm_memory::SimpleAS;

use crate::error::{DevError, DevResult};
use crate::gic::gicd::GicD;
use crate::gic::{MAX_PPI, MAX_SGI};

/// One ITT (interrupt translation table) entry: `(icid << 32) | pintid`
/// (spec.md §4.3.7).
fn itt_entry(icid: u32, pintid: u32) -> u64 {
    ((icid as u64) << 32) | pintid as u64
}

#[derive(Default)]
struct Tables {
    /// device id -> ITT base GPA
    devices: HashMap<u32, u64>,
    /// collection id -> redistributor index
    collections: HashMap<u32, usize>,
    /// (device id, event id) -> packed `itt_entry`
    itt: HashMap<(u32, u32), u64>,
}

const CMD_MAPD: u8 = 0x08;
const CMD_MAPC: u8 = 0x09;
const CMD_MAPTI: u8 = 0x0a;
const CMD_MOVI: u8 = 0x01;
const CMD_DISCARD: u8 = 0x0f;
const CMD_INV: u8 = 0x0c;
const CMD_INVALL: u8 = 0x0d;
const CMD_SYNC: u8 = 0x05;

const COMMAND_BYTES: u64 = 32;

pub struct GicIts {
    tables: Mutex<Tables>,
    cbaser: Mutex<u64>,
    cwriter: Mutex<u64>,
    creadr: Mutex<u64>,
    gicd: Arc<GicD>,
}

impl GicIts {
    pub fn new(gicd: Arc<GicD>) -> Self {
        GicIts {
            tables: Mutex::new(Tables::default()),
            cbaser: Mutex::new(0),
            cwriter: Mutex::new(0),
            creadr: Mutex::new(0),
            gicd,
        }
    }

    pub fn set_cbaser(&self, val: u64) {
        *self.cbaser.lock() = val;
    }

    pub fn set_cwriter(&self, val: u64) {
        *self.cwriter.lock() = val;
    }

    pub fn creadr(&self) -> u64 {
        *self.creadr.lock()
    }

    /// Drains commands from `(CBASER & page_mask) + CREADR` up to
    /// `CWRITER`, one 32-byte command at a time (spec.md §4.3.7).
    pub fn process_commands(&self, mem: &SimpleAS) -> DevResult {
        const PAGE_MASK: u64 = !0xfff;
        loop {
            let creadr = *self.creadr.lock();
            let cwriter = *self.cwriter.lock();
            if creadr >= cwriter {
                return Ok(());
            }
            let base = (*self.cbaser.lock() & PAGE_MASK) + creadr;
            let mut buf = [0u8; COMMAND_BYTES as usize];
            mem.read(vm_memory::GuestPhysAddr(base), &mut buf)
                .map_err(|_| DevError::NotRecoverable)?;
            self.handle_command(&buf)?;
            *self.creadr.lock() = creadr + COMMAND_BYTES;
        }
    }

    fn handle_command(&self, cmd: &[u8; 32]) -> DevResult {
        let opcode = cmd[0];
        let dw0 = u64::from_le_bytes(cmd[0..8].try_into().unwrap());
        let dw1 = u64::from_le_bytes(cmd[8..16].try_into().unwrap());
        let dw2 = u64::from_le_bytes(cmd[16..24].try_into().unwrap());
        match opcode {
            CMD_MAPD => {
                let device_id = (dw0 >> 32) as u32;
                let itt_base = dw2 & !0x1f;
                self.tables.lock().devices.insert(device_id, itt_base);
                Ok(())
            }
            CMD_MAPC => {
                let icid = (dw2 & 0xffff) as u32;
                let rdbase = ((dw2 >> 16) & 0xffff) as usize;
                self.tables.lock().collections.insert(icid, rdbase);
                Ok(())
            }
            CMD_MAPTI => {
                let device_id = (dw0 >> 32) as u32;
                let event_id = dw1 as u32;
                let pintid = (dw1 >> 32) as u32;
                let icid = (dw2 & 0xffff) as u32;
                self.tables
                    .lock()
                    .itt
                    .insert((device_id, event_id), itt_entry(icid, pintid));
                Ok(())
            }
            CMD_MOVI => {
                let device_id = (dw0 >> 32) as u32;
                let event_id = dw1 as u32;
                let new_icid = (dw2 & 0xffff) as u32;
                let mut tables = self.tables.lock();
                if let Some(entry) = tables.itt.get_mut(&(device_id, event_id)) {
                    let pintid = (*entry & 0xffff_ffff) as u32;
                    *entry = itt_entry(new_icid, pintid);
                }
                Ok(())
            }
            CMD_SYNC | CMD_INV | CMD_INVALL => Ok(()),
            // Unsupported command: abort, per spec.md §3.
            CMD_DISCARD => Err(DevError::NotRecoverable),
            _ => Err(DevError::NotRecoverable),
        }
    }

    /// Device-ITT-collection lookup and LPI assertion for a guest-issued
    /// MSI (spec.md §4.3.7).
    pub fn handle_msi(&self, device_id: u32, event_id: u32) -> DevResult {
        let (pintid, icid) = {
            let tables = self.tables.lock();
            let entry = *tables.itt.get(&(device_id, event_id)).ok_or(DevError::NoDevice)?;
            ((entry & 0xffff_ffff) as u32, (entry >> 32) as u32)
        };
        let target = {
            let tables = self.tables.lock();
            *tables.collections.get(&icid).ok_or(DevError::NoDevice)?
        };
        let _ = target;
        // LPIs are asserted on the distributor exactly like an SPI,
        // targeted at the collection's redistributor index.
        self.gicd.assert_spi(
            pintid.max(MAX_SGI + MAX_PPI),
            1 << target,
            false,
            None,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gic::gicd::{GicConfig, GicVersion};
    use vm_memory::{AddressSpaceProvider, AsCred, GuestPhysAddr, HostVirtAddr, Range};

    struct FakeProvider {
        backing: std::sync::Mutex<Vec<u8>>,
    }

    impl FakeProvider {
        fn new(size: usize) -> Arc<Self> {
            Arc::new(FakeProvider {
                backing: std::sync::Mutex::new(vec![0u8; size]),
            })
        }
    }

    impl AddressSpaceProvider for FakeProvider {
        fn mmap_update(&self, _hva: HostVirtAddr, _size: u64, _cred: AsCred) -> base::Result<()> {
            Ok(())
        }
        fn map_host(&self, _mem_descriptor: u64, _size: u64, _cred: AsCred) -> base::Result<HostVirtAddr> {
            let backing = self.backing.lock().unwrap();
            Ok(HostVirtAddr(backing.as_ptr() as usize))
        }
        fn unmap_host(&self, _hva: HostVirtAddr, _size: u64) -> base::Result<()> {
            Ok(())
        }
    }

    struct FakeCpu;
    impl crate::gic::CpuIrqInterface for FakeCpu {
        fn notify_interrupt_pending(&self) {}
        fn can_receive_irq(&self) -> bool {
            true
        }
    }

    fn make_its() -> GicIts {
        let iface: Arc<dyn crate::gic::CpuIrqInterface> = Arc::new(FakeCpu);
        let gicd = Arc::new(GicD::new(
            GicConfig {
                version: GicVersion::V3,
                num_vcpus: 1,
            },
            vec![iface],
            vec![0],
        ));
        GicIts::new(gicd)
    }

    #[test]
    fn mapd_then_mapti_then_msi_resolves() {
        let its = make_its();
        let mut mapd = [0u8; 32];
        mapd[0] = CMD_MAPD;
        mapd[4..8].copy_from_slice(&7u32.to_le_bytes());
        its.handle_command(&mapd).unwrap();

        let mut mapc = [0u8; 32];
        mapc[0] = CMD_MAPC;
        mapc[16..18].copy_from_slice(&1u16.to_le_bytes());
        its.handle_command(&mapc).unwrap();

        let mut mapti = [0u8; 32];
        mapti[0] = CMD_MAPTI;
        mapti[4..8].copy_from_slice(&7u32.to_le_bytes());
        mapti[8..12].copy_from_slice(&3u32.to_le_bytes());
        mapti[12..16].copy_from_slice(&64u32.to_le_bytes());
        mapti[16..18].copy_from_slice(&1u16.to_le_bytes());
        its.handle_command(&mapti).unwrap();

        its.handle_msi(7, 3).unwrap();
    }

    #[test]
    fn discard_is_unsupported() {
        let its = make_its();
        let mut cmd = [0u8; 32];
        cmd[0] = CMD_DISCARD;
        assert_eq!(its.handle_command(&cmd), Err(DevError::NotRecoverable));
    }

    #[test]
    fn process_commands_reads_from_guest_memory() {
        let its = make_its();
        let provider = FakeProvider::new(0x10000);
        let as_ = SimpleAS::new(Range::new(0, 0x10000), 0, AsCred::READ | AsCred::WRITE, provider);
        as_.map_host().unwrap();

        let mut sync_cmd = [0u8; 32];
        sync_cmd[0] = CMD_SYNC;
        as_.write(GuestPhysAddr(0x1000), &sync_cmd).unwrap();

        its.set_cbaser(0x1000);
        its.set_cwriter(32);
        its.process_commands(&as_).unwrap();
        assert_eq!(its.creadr(), 32);
    }
}
