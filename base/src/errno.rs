// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::io;

/// A host-side error, carrying the errno value that caused it.
///
/// Mirrors crosvm's `base::Error`: most of this crate's host-facing
/// operations (address-space mapping, timer arming) fail with a raw errno
/// rather than a rich error type, since the real failure modes come from the
/// kernel/hypervisor layer this crate does not implement.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Error(i32);

impl Error {
    pub fn new(e: i32) -> Error {
        Error(e)
    }

    pub fn errno(self) -> i32 {
        self.0
    }

    pub fn last() -> Error {
        Error(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "errno {} ({})", self.0, io::Error::from_raw_os_error(self.0))
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Error({})", self.0)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error(e.raw_os_error().unwrap_or(libc::EIO))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub fn errno_result<T>() -> Result<T> {
    Err(Error::last())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_errno() {
        let e = Error::new(libc::EINVAL);
        assert_eq!(e.errno(), libc::EINVAL);
        assert!(format!("{}", e).contains("22"));
    }
}
