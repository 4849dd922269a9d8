// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest address types, the generic range map (component C1), and the
//! guest-RAM address space abstraction (component C4, `SimpleAS`).

mod addr;
mod range;
mod simple_as;

pub use addr::{GuestPhysAddr, HostVirtAddr};
pub use range::{num_traits_lite, OverlapError, Range, RangeMap};
pub use simple_as::{demand_map_bus, demand_unmap_bus, AddressSpaceProvider, AsCred, AsError, SimpleAS};
