// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Component C4: one guest-physical RAM region, on-demand host-mapped and
//! accessed through a safe copy primitive with cache maintenance (spec.md
//! §4.2).

use std::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use sync::Mutex;

use crate::addr::{GuestPhysAddr, HostVirtAddr};
use crate::range::Range;

bitflags! {
    /// Credentials the guest may exercise over a `SimpleAS` region.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct AsCred: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// The host primitive that maps guest-physical ranges into the VMM process
/// and updates stage-2 permissions (spec.md §1, consumed as an external
/// collaborator; trait surface from §6.3).
pub trait AddressSpaceProvider: Send + Sync {
    /// Ensures `[hva, hva+size)` is present and matches `cred`, updating
    /// stage-2 permissions if needed. Idempotent.
    fn mmap_update(&self, hva: HostVirtAddr, size: u64, cred: AsCred) -> base::Result<()>;

    /// Returns the host mapping base for `mem_descriptor`, mapping it on
    /// first use if not already mapped.
    fn map_host(&self, mem_descriptor: u64, size: u64, cred: AsCred) -> base::Result<HostVirtAddr>;

    fn unmap_host(&self, hva: HostVirtAddr, size: u64) -> base::Result<()>;

    /// Cleans (writeback) and invalidates the D-cache, and synchronizes the
    /// I-cache, over `[hva, hva+size)`. A no-op on architectures/test
    /// doubles where this does not apply.
    fn clean_invalidate_range(&self, _hva: HostVirtAddr, _size: u64) {}
}

/// One guest-physical RAM region.
///
/// Invariant (spec.md §3): `gpa_to_host` is defined iff `vmm_mapping` is
/// present and `gpa` falls in `guest_range`.
pub struct SimpleAS {
    guest_range: Range<u64>,
    mem_descriptor: u64,
    cred: AsCred,
    provider: std::sync::Arc<dyn AddressSpaceProvider>,
    mapping_lock: Mutex<()>,
    vmm_mapping: Mutex<Option<HostVirtAddr>>,
    destructed: AtomicBool,
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum AsError {
    #[error("access [{0:#x}, +{1:#x}) is out of the address space's guest range")]
    OutOfRange(u64, u64),
    #[error("address space is not yet host-mapped")]
    NotMapped,
    #[error("host mapping failed: {0}")]
    Host(#[from] base::Error),
    #[error("address space has been destructed")]
    Destructed,
}

impl SimpleAS {
    pub fn new(
        guest_range: Range<u64>,
        mem_descriptor: u64,
        cred: AsCred,
        provider: std::sync::Arc<dyn AddressSpaceProvider>,
    ) -> Self {
        SimpleAS {
            guest_range,
            mem_descriptor,
            cred,
            provider,
            mapping_lock: Mutex::new(()),
            vmm_mapping: Mutex::new(None),
            destructed: AtomicBool::new(false),
        }
    }

    pub fn guest_range(&self) -> Range<u64> {
        self.guest_range
    }

    pub fn cred(&self) -> AsCred {
        self.cred
    }

    fn bounds_check(&self, gpa: GuestPhysAddr, size: u64) -> Result<(), AsError> {
        let end = gpa
            .raw()
            .checked_add(size)
            .ok_or(AsError::OutOfRange(gpa.raw(), size))?;
        if gpa.raw() < self.guest_range.begin || end > self.guest_range.end() {
            return Err(AsError::OutOfRange(gpa.raw(), size));
        }
        Ok(())
    }

    /// Lazily obtains the host mapping for this region. Called once during
    /// VM construction per spec.md §4.2's lifecycle note, but safe to call
    /// repeatedly (idempotent).
    pub fn map_host(&self) -> Result<HostVirtAddr, AsError> {
        if self.destructed.load(Ordering::Acquire) {
            return Err(AsError::Destructed);
        }
        let _guard = self.mapping_lock.lock();
        let mut mapping = self.vmm_mapping.lock();
        if let Some(hva) = *mapping {
            return Ok(hva);
        }
        let hva = self
            .provider
            .map_host(self.mem_descriptor, self.guest_range.size, self.cred)?;
        *mapping = Some(hva);
        Ok(hva)
    }

    fn gpa_to_host_locked(&self, gpa: GuestPhysAddr, mapping: Option<HostVirtAddr>) -> Result<HostVirtAddr, AsError> {
        let base = mapping.ok_or(AsError::NotMapped)?;
        let offset = gpa.raw() - self.guest_range.begin;
        base.checked_add(offset).ok_or(AsError::OutOfRange(gpa.raw(), 0))
    }

    pub fn gpa_to_host(&self, gpa: GuestPhysAddr) -> Result<HostVirtAddr, AsError> {
        let mapping = *self.vmm_mapping.lock();
        self.gpa_to_host_locked(gpa, mapping)
    }

    /// Host pointer into the mapping, defined only when `vmm_mapping` is
    /// present and the range is in bounds (spec.md §4.2).
    pub fn gpa_to_vmm_view(&self, gpa: GuestPhysAddr, size: u64) -> Result<HostVirtAddr, AsError> {
        self.bounds_check(gpa, size)?;
        self.gpa_to_host(gpa)
    }

    pub fn read(&self, gpa: GuestPhysAddr, dst: &mut [u8]) -> Result<(), AsError> {
        if self.destructed.load(Ordering::Acquire) {
            return Err(AsError::Destructed);
        }
        self.bounds_check(gpa, dst.len() as u64)?;
        let _guard = self.mapping_lock.lock();
        let mapping = *self.vmm_mapping.lock();
        let hva = self.gpa_to_host_locked(gpa, mapping)?;
        self.ensure_mapped(hva, dst.len() as u64, AsCred::READ)?;
        // Safe: bounds-checked above and the mapping is guaranteed present
        // and of at least `guest_range.size` bytes by `map_host`.
        unsafe {
            std::ptr::copy_nonoverlapping(hva.as_ptr(), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    pub fn write(&self, gpa: GuestPhysAddr, src: &[u8]) -> Result<(), AsError> {
        if self.destructed.load(Ordering::Acquire) {
            return Err(AsError::Destructed);
        }
        self.bounds_check(gpa, src.len() as u64)?;
        let _guard = self.mapping_lock.lock();
        let mapping = *self.vmm_mapping.lock();
        let hva = self.gpa_to_host_locked(gpa, mapping)?;
        self.ensure_mapped(hva, src.len() as u64, AsCred::WRITE)?;
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), hva.as_mut_ptr(), src.len());
        }
        self.provider.clean_invalidate_range(hva, src.len() as u64);
        Ok(())
    }

    fn ensure_mapped(&self, hva: HostVirtAddr, size: u64, cred: AsCred) -> Result<(), AsError> {
        self.provider.mmap_update(hva, size, cred)?;
        Ok(())
    }

    /// Pure cache-maintenance operation for when the guest changes
    /// cacheability globally (spec.md §4.2).
    pub fn clean_invalidate(&self, gpa: GuestPhysAddr, size: u64) -> Result<(), AsError> {
        self.bounds_check(gpa, size)?;
        let hva = self.gpa_to_host(gpa)?;
        self.provider.clean_invalidate_range(hva, size);
        Ok(())
    }

    pub fn destruct(&self) {
        let _guard = self.mapping_lock.lock();
        let mut mapping = self.vmm_mapping.lock();
        if let Some(hva) = mapping.take() {
            let _ = self.provider.unmap_host(hva, self.guest_range.size);
        }
        self.destructed.store(true, Ordering::Release);
    }
}

/// Pins a guest-memory window for a burst copy (spec.md §4.2), used by
/// virtio to obtain a temporary host view without going through a single
/// `SimpleAS`'s bounds (the bus may span several regions).
pub fn demand_map_bus(
    regions: &[std::sync::Arc<SimpleAS>],
    gpa: GuestPhysAddr,
    size: u64,
    write: bool,
) -> Result<HostVirtAddr, AsError> {
    for region in regions {
        if region.guest_range.contains(gpa.raw()) {
            region.map_host()?;
            let cred = if write { AsCred::WRITE } else { AsCred::READ };
            let hva = region.gpa_to_vmm_view(gpa, size)?;
            region.ensure_mapped(hva, size, cred)?;
            return Ok(hva);
        }
    }
    Err(AsError::OutOfRange(gpa.raw(), size))
}

/// Counterpart to `demand_map_bus`: cleans caches if the window was mapped
/// for write.
pub fn demand_unmap_bus(
    regions: &[std::sync::Arc<SimpleAS>],
    gpa: GuestPhysAddr,
    size: u64,
    was_write: bool,
) -> Result<(), AsError> {
    for region in regions {
        if region.guest_range.contains(gpa.raw()) {
            if was_write {
                region.clean_invalidate(gpa, size)?;
            }
            return Ok(());
        }
    }
    Err(AsError::OutOfRange(gpa.raw(), size))
}

#[cfg(test)]
pub mod test_utils {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// An `AddressSpaceProvider` backed by a plain `Vec<u8>`, standing in
    /// for the real stage-2 mapping host primitive in unit tests.
    pub struct FakeProvider {
        backing: StdMutex<Vec<u8>>,
    }

    impl FakeProvider {
        pub fn new(size: usize) -> std::sync::Arc<Self> {
            std::sync::Arc::new(FakeProvider {
                backing: StdMutex::new(vec![0u8; size]),
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
}
