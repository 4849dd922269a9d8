// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The device-model error taxonomy (spec.md §7).

/// Outcome of a bus/register/ring/scatter-gather operation. `Ok(())`/`Ok(T)`
/// stands in for the taxonomy's `Ok` member; it is not a variant here.
#[remain::sorted]
#[derive(Copy, Clone, Eq, PartialEq, Debug, thiserror::Error)]
pub enum DevError {
    #[error("access rejected by device")]
    AccessErr,
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("nothing to dequeue")]
    NoEntry,
    #[error("no device registered for this address/id")]
    NoDevice,
    #[error("unrecoverable ring/chain protocol violation")]
    NotRecoverable,
    #[error("permission denied")]
    Permission,
    #[error("caller must replay the faulting instruction")]
    ReplayInstruction,
    #[error("caller must write the value back into a guest register")]
    UpdateRegister,
}

pub type DevResult<T = ()> = Result<T, DevError>;
