// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Little-endian integer newtypes for on-the-wire virtio/GIC-table structs,
//! matching crosvm's `data_model::Le*` idiom: every struct that is read or
//! written directly against guest memory is `#[repr(C)]` over these types so
//! the layout is portable regardless of host endianness.

use std::fmt;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

macro_rules! le_int {
    ($name:ident, $native:ty) => {
        #[derive(
            Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, AsBytes, FromBytes, FromZeroes,
        )]
        #[repr(transparent)]
        pub struct $name($native);

        impl $name {
            pub fn to_native(self) -> $native {
                <$native>::from_le(self.0)
            }
        }

        impl From<$native> for $name {
            fn from(v: $native) -> Self {
                $name(<$native>::to_le(v))
            }
        }

        impl From<$name> for $native {
            fn from(v: $name) -> $native {
                v.to_native()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.to_native())
            }
        }
    };
}

le_int!(Le16, u16);
le_int!(Le32, u32);
le_int!(Le64, u64);
