// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-facing primitives shared by the rest of the workspace: an errno
//! flavored `Error`/`Result`, the `log` facade, and the blocking
//! synchronization primitives the VCPU and virtio run loops suspend on.

mod errno;
mod signal;

pub use errno::{errno_result, Error, Result};
pub use log::{debug, error, info, trace, warn};
pub use signal::{Event, Semaphore};

static LOGGER_INIT: once_cell::sync::OnceCell<()> = once_cell::sync::OnceCell::new();

/// Installs the `env_logger` backend for `log`'s macros. Idempotent and
/// safe to call from multiple construction sites (tests, embedders).
pub fn init_logging() {
    LOGGER_INIT.get_or_init(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default())
            .format_timestamp_millis()
            .try_init();
    });
}

/// The core has no graceful-restart path (spec §7): a fatal error logs at
/// `error!` and aborts the process.
#[track_caller]
pub fn abort_vm(reason: &str) -> ! {
    error!("fatal VM error, aborting: {reason}");
    std::process::abort();
}
