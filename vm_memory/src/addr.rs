// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::ops::Add;

/// A 64-bit guest-physical address. May be the sentinel `INVALID` value,
/// matching spec.md §3's "a `GPA` may be invalid (sentinel)".
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct GuestPhysAddr(pub u64);

impl GuestPhysAddr {
    pub const INVALID: GuestPhysAddr = GuestPhysAddr(u64::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn checked_add(self, offset: u64) -> Option<GuestPhysAddr> {
        self.0.checked_add(offset).map(GuestPhysAddr)
    }
}

impl fmt::Debug for GuestPhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "GPA({:#x})", self.0)
    }
}

impl Add<u64> for GuestPhysAddr {
    type Output = GuestPhysAddr;
    fn add(self, rhs: u64) -> GuestPhysAddr {
        GuestPhysAddr(self.0 + rhs)
    }
}

/// A 64-bit host-virtual address: where a `GuestPhysAddr` range is mapped
/// into this process once `SimpleAS::map_host` has run.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct HostVirtAddr(pub usize);

impl HostVirtAddr {
    pub fn raw(self) -> usize {
        self.0
    }

    pub fn checked_add(self, offset: u64) -> Option<HostVirtAddr> {
        usize::try_from(offset)
            .ok()
            .and_then(|o| self.0.checked_add(o))
            .map(HostVirtAddr)
    }

    /// # Safety
    /// The caller must ensure `self` is backed by at least `len` valid bytes.
    pub unsafe fn as_mut_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }

    /// # Safety
    /// The caller must ensure `self` is backed by at least `len` valid bytes.
    pub unsafe fn as_ptr(self) -> *const u8 {
        self.0 as *const u8
    }
}

impl fmt::Debug for HostVirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "HVA({:#x})", self.0)
    }
}
