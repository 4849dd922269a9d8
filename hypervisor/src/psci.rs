// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! PSCI/SIP firmware dispatch (spec.md §6.3): the function body lives with
//! an external collaborator (spec.md §1 Non-goals), this crate only defines
//! the call surface and the version type the exit handler needs.

use std::cmp::Ordering;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PsciVersion {
    pub major: u16,
    pub minor: u16,
}

pub const PSCI_0_2: PsciVersion = PsciVersion { major: 0, minor: 2 };

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
#[error("malformed PSCI version word {0:#x}")]
pub struct PsciVersionError(pub u32);

impl TryFrom<u32> for PsciVersion {
    type Error = PsciVersionError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        Ok(PsciVersion {
            major: ((v >> 16) & 0xffff) as u16,
            minor: (v & 0xffff) as u16,
        })
    }
}

impl Ord for PsciVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor).cmp(&(other.major, other.minor))
    }
}

impl PartialOrd for PsciVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// PSCI's own "not supported" return value; a valid PSCI return rather
/// than a core error (spec.md §7).
pub const PSCI_NOT_SUPPORTED: i64 = -1;

/// External firmware collaborator: given `(fn_id, args)` from an SMC64
/// exit, returns up to 4 result words to place in x0..x3 (spec.md §6.3).
pub trait FirmwareService: Send + Sync {
    fn call(&self, fn_id: u32, args: [u64; 4]) -> [u64; 4];
}
