//! Core event counters (`SCX_EV_*`).
//!
//! Counters are bumped on the hot path with relaxed atomics and read as a
//! serializable snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub(crate) struct ScxEvents {
    select_cpu_fallback: AtomicU64,
    ddsp_consumed: AtomicU64,
    ddsp_rejected: AtomicU64,
    dispatch_local_dsq_offline: AtomicU64,
    pick_affinity_bounce: AtomicU64,
    refill_slice_dfl: AtomicU64,
    reenq_local: AtomicU64,
    enq_preempt: AtomicU64,
}

/// Which counter to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    /// `select_cpu` returned an offline or disallowed CPU.
    SelectCpuFallback,
    DdspConsumed,
    /// The armed direct-dispatch target refused the task.
    DdspRejected,
    /// An insert targeted the local DSQ of an offline CPU.
    DispatchLocalDsqOffline,
    /// `pick_task` found a task at the head of a local DSQ it may no
    /// longer run on.
    PickAffinityBounce,
    RefillSliceDfl,
    ReenqLocal,
    /// An enqueue carried a pending slice-expiry preemption.
    EnqPreempt,
}

impl ScxEvents {
    fn counter(&self, ev: Event) -> &AtomicU64 {
        match ev {
            Event::SelectCpuFallback => &self.select_cpu_fallback,
            Event::DdspConsumed => &self.ddsp_consumed,
            Event::DdspRejected => &self.ddsp_rejected,
            Event::DispatchLocalDsqOffline => &self.dispatch_local_dsq_offline,
            Event::PickAffinityBounce => &self.pick_affinity_bounce,
            Event::RefillSliceDfl => &self.refill_slice_dfl,
            Event::ReenqLocal => &self.reenq_local,
            Event::EnqPreempt => &self.enq_preempt,
        }
    }

    pub fn inc(&self, ev: Event) {
        self.add(ev, 1);
    }

    pub fn add(&self, ev: Event, n: u64) {
        self.counter(ev).fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ScxEventStats {
        let get = |ev| self.counter(ev).load(Ordering::Relaxed);
        ScxEventStats {
            select_cpu_fallback: get(Event::SelectCpuFallback),
            ddsp_consumed: get(Event::DdspConsumed),
            ddsp_rejected: get(Event::DdspRejected),
            dispatch_local_dsq_offline: get(Event::DispatchLocalDsqOffline),
            pick_affinity_bounce: get(Event::PickAffinityBounce),
            refill_slice_dfl: get(Event::RefillSliceDfl),
            reenq_local: get(Event::ReenqLocal),
            enq_preempt: get(Event::EnqPreempt),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScxEventStats {
    pub select_cpu_fallback: u64,
    pub ddsp_consumed: u64,
    pub ddsp_rejected: u64,
    pub dispatch_local_dsq_offline: u64,
    pub pick_affinity_bounce: u64,
    pub refill_slice_dfl: u64,
    pub reenq_local: u64,
    pub enq_preempt: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let events = ScxEvents::default();
        events.inc(Event::DdspConsumed);
        events.inc(Event::DdspConsumed);
        events.add(Event::ReenqLocal, 3);
        let snap = events.snapshot();
        assert_eq!(snap.ddsp_consumed, 2);
        assert_eq!(snap.reenq_local, 3);
        assert_eq!(
            snap,
            ScxEventStats {
                ddsp_consumed: 2,
                reenq_local: 3,
                ..Default::default()
            }
        );
    }
}
