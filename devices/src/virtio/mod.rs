// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Virtio MMIO transport, split-ring queue engine, scatter-gather buffers,
//! and the console device (spec.md §3/§4.5-§4.6, components C8/C9).

pub mod console;
pub mod mmio;
pub mod queue;
pub mod sg;

pub use console::{ConsoleCallback, ConsoleDevice};
pub use mmio::{Interrupt, MmioTransport, VirtioDevice, FEATURE_ACCESS_PLATFORM, FEATURE_VERSION_1};
pub use queue::{DescriptorHandle, DeviceQueue, QueueMem};
pub use sg::{conclude_chain_use, copy, walk_chain, Buffer, Chain, ChainAccessor};
