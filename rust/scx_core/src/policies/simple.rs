//! A simple scheduler, equivalent to `scx_simple.bpf.c`.
//!
//! In FIFO mode every task goes to a shared FIFO DSQ and any CPU consumes
//! it in arrival order. In weighted vtime mode the shared DSQ is ordered by
//! vtime, which advances by the slice used scaled inversely by weight, so
//! heavier tasks run more often.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::ops::Ops;
use crate::policy::Policy;
use crate::types::{CpuId, DsqId, DsqOrder, EnqFlags, TaskId, Vtime, WakeFlags};

/// User-created shared dispatch queue.
pub const SHARED_DSQ: DsqId = DsqId(0);

#[derive(Debug, Default)]
pub struct ScxSimple {
    fifo: bool,
    vtime_now: AtomicU64,
}

impl ScxSimple {
    pub fn fifo() -> Self {
        ScxSimple {
            fifo: true,
            vtime_now: AtomicU64::new(0),
        }
    }

    pub fn weighted() -> Self {
        ScxSimple {
            fifo: false,
            vtime_now: AtomicU64::new(0),
        }
    }

    pub fn vtime_now(&self) -> Vtime {
        Vtime(self.vtime_now.load(Ordering::Relaxed))
    }
}

impl Policy for ScxSimple {
    fn name(&self) -> &str {
        "simple"
    }

    fn init(&self, ops: &Ops<'_>) -> Result<()> {
        let order = if self.fifo {
            DsqOrder::Fifo
        } else {
            DsqOrder::Priority
        };
        ops.dsq_create(SHARED_DSQ, order)
    }

    fn select_cpu(
        &self,
        ops: &Ops<'_>,
        task: TaskId,
        prev_cpu: CpuId,
        wake_flags: WakeFlags,
    ) -> Result<CpuId> {
        let (cpu, is_idle) = ops.select_cpu_dfl(task, prev_cpu, wake_flags)?;
        if is_idle {
            ops.dsq_insert(task, DsqId::LOCAL, ops.default_slice(), EnqFlags::empty())?;
        }
        Ok(cpu)
    }

    fn enqueue(&self, ops: &Ops<'_>, task: TaskId, enq_flags: EnqFlags) -> Result<()> {
        let slice = ops.default_slice();
        if self.fifo {
            return ops.dsq_insert(task, SHARED_DSQ, slice, enq_flags);
        }

        // Limit the amount of budget an idling task can accumulate to one
        // slice.
        let mut vtime = ops.task(task)?.vtime;
        let floor = Vtime(self.vtime_now.load(Ordering::Relaxed).wrapping_sub(slice));
        if vtime.before(floor) {
            vtime = floor;
        }
        ops.dsq_insert_vtime(task, SHARED_DSQ, slice, vtime, enq_flags)
    }

    fn dispatch(&self, ops: &Ops<'_>, _cpu: CpuId, _prev: Option<TaskId>) -> Result<()> {
        ops.dsq_move_to_local(SHARED_DSQ)?;
        Ok(())
    }

    fn running(&self, ops: &Ops<'_>, task: TaskId) {
        if self.fifo {
            return;
        }
        // Global vtime always progresses forward as tasks start executing.
        if let Ok(snap) = ops.task(task) {
            self.vtime_now.fetch_max(snap.vtime.0, Ordering::Relaxed);
        }
    }

    fn stopping(&self, ops: &Ops<'_>, task: TaskId, _runnable: bool) {
        if self.fifo {
            return;
        }
        let Ok(snap) = ops.task(task) else {
            return;
        };
        // Scale the execution time by the inverse of the weight and charge.
        let used = ops.default_slice().saturating_sub(snap.slice_ns);
        let charge = used * 100 / u64::from(snap.weight.max(1));
        if let Err(e) = ops.set_vtime(task, Vtime(snap.vtime.0.wrapping_add(charge))) {
            ops.error(format!("failed to charge task {task}: {e}"));
        }
    }

    fn enable(&self, ops: &Ops<'_>, task: TaskId) {
        if self.fifo {
            return;
        }
        if let Err(e) = ops.set_vtime(task, self.vtime_now()) {
            ops.error(format!("failed to seed vtime of task {task}: {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::SchedConfig;
    use crate::host::ManualHost;
    use crate::policy::InitTaskArgs;
    use crate::scheduler::ScxCore;

    #[test]
    fn test_weighted_charges_by_weight() {
        let cfg = SchedConfig {
            default_slice_ns: 10_000_000,
            ..SchedConfig::with_cpus(1)
        };
        let core = ScxCore::new(cfg, ScxSimple::weighted(), Arc::new(ManualHost::new())).unwrap();
        core.init().unwrap();
        let cpu = CpuId(0);

        for (id, weight) in [(1, 100), (2, 200)] {
            let args = InitTaskArgs::new(1).with_weight(weight);
            core.init_task(TaskId(id), &args).unwrap();
            core.enable(TaskId(id)).unwrap();
        }

        // Run each task for its full slice once.
        for id in [1, 2] {
            core.enqueue(cpu, TaskId(id), EnqFlags::empty()).unwrap();
            assert!(core.dispatch(cpu, None).unwrap());
            assert_eq!(core.pick_task(cpu).unwrap(), Some(TaskId(id)));
            assert!(core.tick(cpu, TaskId(id), 10_000_000).unwrap());
            core.stop(cpu, TaskId(id), true).unwrap();
        }

        assert_eq!(core.task(TaskId(1)).unwrap().vtime, Vtime(10_000_000));
        assert_eq!(core.task(TaskId(2)).unwrap().vtime, Vtime(5_000_000));
        core.check_invariants().unwrap();
    }
}
