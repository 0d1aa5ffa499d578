//! Services the host runtime provides to the core.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::types::{CpuId, KickFlags, TimeNs};

/// The host side of the callback protocol.
///
/// The host drives the core through [`crate::ScxCore`]'s callback methods
/// and in return offers a clock, a way to force a reschedule, and an idle
/// query. None of these may block.
pub trait Host: Send + Sync {
    /// Monotonic clock in nanoseconds.
    fn now_ns(&self) -> TimeNs;

    /// Force a reschedule on `cpu`.
    fn kick_cpu(&self, cpu: CpuId, flags: KickFlags);

    /// Whether `cpu` is sitting in the host's idle loop.
    fn cpu_is_idle(&self, cpu: CpuId) -> bool;
}

/// A host whose clock advances only when told to.
///
/// Records every kick so tests can assert on them.
#[derive(Debug, Default)]
pub struct ManualHost {
    clock: AtomicU64,
    kicks: Mutex<Vec<(CpuId, KickFlags)>>,
    idle: Mutex<HashSet<CpuId>>,
}

impl ManualHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, delta: TimeNs) -> TimeNs {
        self.clock.fetch_add(delta, Ordering::Relaxed) + delta
    }

    pub fn set_idle(&self, cpu: CpuId, idle: bool) {
        let mut set = self.idle.lock();
        if idle {
            set.insert(cpu);
        } else {
            set.remove(&cpu);
        }
    }

    /// Drain the recorded kicks.
    pub fn take_kicks(&self) -> Vec<(CpuId, KickFlags)> {
        std::mem::take(&mut *self.kicks.lock())
    }
}

impl Host for ManualHost {
    fn now_ns(&self) -> TimeNs {
        self.clock.load(Ordering::Relaxed)
    }

    fn kick_cpu(&self, cpu: CpuId, flags: KickFlags) {
        self.kicks.lock().push((cpu, flags));
    }

    fn cpu_is_idle(&self, cpu: CpuId) -> bool {
        self.idle.lock().contains(&cpu)
    }
}
