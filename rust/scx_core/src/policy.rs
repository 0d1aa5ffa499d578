//! The callback set a scheduling policy plugs into the core.

use crate::cpumask::Cpumask;
use crate::error::Result;
use crate::exit::ExitInfo;
use crate::ops::Ops;
use crate::types::{
    CpuId, CpuReleaseReason, DeqFlags, DsqId, EnqFlags, TaskId, WakeFlags, Weight,
};

/// Arguments of `init_task`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitTaskArgs {
    pub allowed_cpus: Cpumask,
    pub weight: Weight,
    /// The task is being forked rather than attached at load.
    pub fork: bool,
}

impl InitTaskArgs {
    /// A nice-0 task allowed on all of `nr_cpu_ids` CPUs.
    pub fn new(nr_cpu_ids: u32) -> Self {
        InitTaskArgs {
            allowed_cpus: Cpumask::full(nr_cpu_ids as usize),
            weight: 100,
            fork: false,
        }
    }

    pub fn with_cpus(mut self, allowed_cpus: Cpumask) -> Self {
        self.allowed_cpus = allowed_cpus;
        self
    }

    pub fn with_weight(mut self, weight: Weight) -> Self {
        self.weight = weight;
        self
    }
}

/// A scheduling policy (`struct sched_ext_ops`).
///
/// Every callback is optional. The defaults give a global FIFO scheduler:
/// wakeups go straight to an idle CPU when one exists, everything else is
/// queued on `SCX_DSQ_GLOBAL`, which the core drains before calling
/// `dispatch`.
///
/// Callbacks run with no core lock held and must not block. Task handles
/// are only meaningful for the duration of the callback; read task fields
/// through [`Ops::task`].
#[allow(unused_variables)]
pub trait Policy: Send + Sync {
    fn name(&self) -> &str {
        "policy"
    }

    fn init(&self, ops: &Ops<'_>) -> Result<()> {
        Ok(())
    }

    fn exit(&self, info: &ExitInfo) {}

    /// Refusing a task here keeps it out of the core.
    fn init_task(&self, ops: &Ops<'_>, task: TaskId, args: &InitTaskArgs) -> Result<()> {
        Ok(())
    }

    fn exit_task(&self, ops: &Ops<'_>, task: TaskId) {}

    fn enable(&self, ops: &Ops<'_>, task: TaskId) {}

    fn disable(&self, ops: &Ops<'_>, task: TaskId) {}

    /// Pick a CPU for a waking task. Inserting the task from here arms a
    /// direct dispatch that the following `enqueue` consumes.
    ///
    /// An error, an offline CPU, or a CPU outside the task's affinity makes
    /// the core fall back to its own choice.
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

    /// Must insert `task` into exactly one DSQ before returning. Returning
    /// without an insert disables the scheduler.
    fn enqueue(&self, ops: &Ops<'_>, task: TaskId, enq_flags: EnqFlags) -> Result<()> {
        ops.dsq_insert(task, DsqId::GLOBAL, ops.default_slice(), enq_flags)
    }

    /// The host took a queued task back.
    fn dequeue(&self, ops: &Ops<'_>, task: TaskId, deq_flags: DeqFlags) {}

    /// Fill `cpu`'s local DSQ. Only called when the local DSQ and the
    /// global DSQ had nothing for `cpu`.
    fn dispatch(&self, ops: &Ops<'_>, cpu: CpuId, prev: Option<TaskId>) -> Result<()> {
        Ok(())
    }

    fn tick(&self, ops: &Ops<'_>, task: TaskId) {}

    fn runnable(&self, ops: &Ops<'_>, task: TaskId, enq_flags: EnqFlags) {}

    fn running(&self, ops: &Ops<'_>, task: TaskId) {}

    fn stopping(&self, ops: &Ops<'_>, task: TaskId, runnable: bool) {}

    fn quiescent(&self, ops: &Ops<'_>, task: TaskId, deq_flags: DeqFlags) {}

    fn set_weight(&self, ops: &Ops<'_>, task: TaskId, weight: Weight) {}

    fn set_cpumask(&self, ops: &Ops<'_>, task: TaskId, cpumask: &Cpumask) {}

    fn cpu_acquire(&self, ops: &Ops<'_>, cpu: CpuId) {}

    fn cpu_release(&self, ops: &Ops<'_>, cpu: CpuId, reason: CpuReleaseReason) {}

    fn cpu_online(&self, ops: &Ops<'_>, cpu: CpuId) {}

    fn cpu_offline(&self, ops: &Ops<'_>, cpu: CpuId) {}
}

/// A policy that keeps every default.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPolicy;

impl Policy for DefaultPolicy {
    fn name(&self) -> &str {
        "default"
    }
}
