//! The kfunc surface: what a policy may call back into the core.
//!
//! Each policy callback receives an [`Ops`] bound to the CPU the callback
//! runs on and to the callback kind. The kind decides which operations
//! are allowed, and for `select_cpu` it turns an insert of the waking task
//! into a direct dispatch that the next `enqueue` consumes.

use std::cell::Cell;

use tracing::{debug, warn};

use crate::config::SchedConfig;
use crate::error::{Result, ScxError};
use crate::exit::{ExitInfo, ExitKind};
use crate::scheduler::{DestroyMode, InsertKey, ScxCore};
use crate::task::{QOp, TaskSnapshot};
use crate::types::{
    CpuId, DsqId, DsqKind, DsqOrder, EnqFlags, KickFlags, TaskId, TimeNs, Vtime, WakeFlags,
};

/// Which callback an [`Ops`] handle was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpsContext {
    Init,
    InitTask,
    ExitTask,
    Enable,
    Disable,
    SelectCpu,
    Enqueue,
    Dequeue,
    Dispatch,
    Tick,
    Running,
    Stopping,
    Runnable,
    Quiescent,
    SetWeight,
    SetCpumask,
    CpuAcquire,
    CpuRelease,
    CpuOnline,
    CpuOffline,
    /// Outside any callback: host setup, tests.
    Unlocked,
}

impl OpsContext {
    pub fn name(self) -> &'static str {
        match self {
            OpsContext::Init => "init",
            OpsContext::InitTask => "init_task",
            OpsContext::ExitTask => "exit_task",
            OpsContext::Enable => "enable",
            OpsContext::Disable => "disable",
            OpsContext::SelectCpu => "select_cpu",
            OpsContext::Enqueue => "enqueue",
            OpsContext::Dequeue => "dequeue",
            OpsContext::Dispatch => "dispatch",
            OpsContext::Tick => "tick",
            OpsContext::Running => "running",
            OpsContext::Stopping => "stopping",
            OpsContext::Runnable => "runnable",
            OpsContext::Quiescent => "quiescent",
            OpsContext::SetWeight => "set_weight",
            OpsContext::SetCpumask => "set_cpumask",
            OpsContext::CpuAcquire => "cpu_acquire",
            OpsContext::CpuRelease => "cpu_release",
            OpsContext::CpuOnline => "cpu_online",
            OpsContext::CpuOffline => "cpu_offline",
            OpsContext::Unlocked => "unlocked context",
        }
    }

    /// Callbacks that run while a task is being set up or torn down and
    /// therefore must not queue anything.
    fn forbids_insert(self) -> bool {
        matches!(
            self,
            OpsContext::Init
                | OpsContext::InitTask
                | OpsContext::ExitTask
                | OpsContext::Enable
                | OpsContext::Disable
        )
    }
}

/// Handle through which a policy calls back into the core.
pub struct Ops<'a> {
    core: &'a ScxCore,
    cpu: CpuId,
    ctx: OpsContext,
    /// The task the callback was invoked for, if any.
    subject: Option<TaskId>,
    inserted: Cell<u32>,
}

impl<'a> Ops<'a> {
    pub(crate) fn new(
        core: &'a ScxCore,
        cpu: CpuId,
        ctx: OpsContext,
        subject: Option<TaskId>,
    ) -> Self {
        Ops {
            core,
            cpu,
            ctx,
            subject,
            inserted: Cell::new(0),
        }
    }

    /// How many times the subject task was inserted through this handle.
    pub(crate) fn subject_inserts(&self) -> u32 {
        self.inserted.get()
    }

    fn require(&self, op: &'static str, allowed: &[OpsContext]) -> Result<()> {
        if allowed.contains(&self.ctx) || self.ctx == OpsContext::Unlocked {
            Ok(())
        } else {
            Err(ScxError::NotAllowed {
                op,
                context: self.ctx.name(),
            })
        }
    }

    fn is_subject(&self, task: TaskId) -> bool {
        self.subject == Some(task)
    }

    /// `SCX_DSQ_LOCAL` means this handle's CPU.
    fn resolve(&self, dsq_id: DsqId) -> DsqId {
        if dsq_id == DsqId::LOCAL {
            DsqId::local_on(self.cpu)
        } else {
            dsq_id
        }
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn context(&self) -> OpsContext {
        self.ctx
    }

    pub fn config(&self) -> &SchedConfig {
        self.core.config()
    }

    pub fn nr_cpu_ids(&self) -> u32 {
        self.core.nr_cpu_ids()
    }

    pub fn default_slice(&self) -> TimeNs {
        self.core.config().default_slice_ns
    }

    /// Host clock (`scx_bpf_now`).
    pub fn now(&self) -> TimeNs {
        self.core.host_now()
    }

    pub fn task(&self, task: TaskId) -> Result<TaskSnapshot> {
        self.core.task(task)
    }

    pub fn set_slice(&self, task: TaskId, slice: TimeNs) -> Result<()> {
        self.require(
            "set_slice",
            &[
                OpsContext::SelectCpu,
                OpsContext::Enqueue,
                OpsContext::Dispatch,
                OpsContext::Tick,
            ],
        )?;
        self.core.set_slice(task, slice)
    }

    /// Fails with `BadState` while the task is queued, since the vtime is
    /// the key it is queued under.
    pub fn set_vtime(&self, task: TaskId, vtime: Vtime) -> Result<()> {
        self.core.set_vtime(task, vtime)
    }

    fn insert(
        &self,
        op: &'static str,
        task: TaskId,
        dsq_id: DsqId,
        slice: TimeNs,
        key: InsertKey,
        enq_flags: EnqFlags,
    ) -> Result<()> {
        if self.ctx.forbids_insert() {
            return Err(ScxError::NotAllowed {
                op,
                context: self.ctx.name(),
            });
        }

        if self.ctx == OpsContext::SelectCpu {
            if !self.is_subject(task) {
                return Err(ScxError::NotAllowed {
                    op,
                    context: "select_cpu of another task",
                });
            }
            let vtime = match key {
                InsertKey::Vtime(v) => Some(v),
                _ => None,
            };
            self.core.arm_ddsp(task, dsq_id, slice, vtime, enq_flags)?;
            self.inserted.set(self.inserted.get() + 1);
            return Ok(());
        }

        let claim = if self.ctx == OpsContext::Enqueue && self.is_subject(task) {
            QOp::Queueing
        } else {
            QOp::None
        };
        self.core.insert(
            self.cpu,
            task,
            self.resolve(dsq_id),
            slice,
            key,
            enq_flags,
            claim,
        )?;
        if self.is_subject(task) {
            self.inserted.set(self.inserted.get() + 1);
        }
        Ok(())
    }

    /// Queue `task` on a FIFO DSQ (`scx_bpf_dsq_insert`). A `slice` of zero
    /// keeps the task's current slice.
    ///
    /// From `select_cpu` this only records the target; the insert happens
    /// when the following `enqueue` runs.
    pub fn dsq_insert(
        &self,
        task: TaskId,
        dsq_id: DsqId,
        slice: TimeNs,
        enq_flags: EnqFlags,
    ) -> Result<()> {
        self.insert("dsq_insert", task, dsq_id, slice, InsertKey::Fifo, enq_flags)
    }

    /// Queue `task` on a priority DSQ at `vtime`.
    pub fn dsq_insert_vtime(
        &self,
        task: TaskId,
        dsq_id: DsqId,
        slice: TimeNs,
        vtime: Vtime,
        enq_flags: EnqFlags,
    ) -> Result<()> {
        self.insert(
            "dsq_insert_vtime",
            task,
            dsq_id,
            slice,
            InsertKey::Vtime(vtime),
            enq_flags,
        )
    }

    /// Record a direct dispatch without touching the slice.
    pub fn tsr_arm_ddsp(&self, task: TaskId, dsq_id: DsqId, enq_flags: EnqFlags) -> Result<()> {
        if self.ctx != OpsContext::SelectCpu || !self.is_subject(task) {
            return Err(ScxError::NotAllowed {
                op: "tsr_arm_ddsp",
                context: self.ctx.name(),
            });
        }
        self.core.arm_ddsp(task, dsq_id, 0, None, enq_flags)?;
        self.inserted.set(self.inserted.get() + 1);
        Ok(())
    }

    /// Move the first task of `dsq_id` that may run here onto this CPU's
    /// local DSQ (`scx_bpf_dsq_move_to_local`).
    pub fn dsq_move_to_local(&self, dsq_id: DsqId) -> Result<bool> {
        self.require("dsq_move_to_local", &[OpsContext::Dispatch])?;
        self.core.move_to_local(self.cpu, dsq_id)
    }

    /// Move a queued task to another DSQ. A priority target keeps the
    /// task's vtime.
    pub fn dsq_move(&self, task: TaskId, dst: DsqId, enq_flags: EnqFlags) -> Result<()> {
        self.core
            .move_task(self.cpu, task, self.resolve(dst), InsertKey::Inherit, enq_flags)
    }

    pub fn dsq_move_vtime(
        &self,
        task: TaskId,
        dst: DsqId,
        vtime: Vtime,
        enq_flags: EnqFlags,
    ) -> Result<()> {
        self.core.move_task(
            self.cpu,
            task,
            self.resolve(dst),
            InsertKey::Vtime(vtime),
            enq_flags,
        )
    }

    /// Take a queued task out of its DSQ. It becomes `Runnable` and must be
    /// inserted again by the caller. Returns where it was.
    pub fn dsq_remove(&self, task: TaskId) -> Result<DsqId> {
        let from = self.core.dsq_remove(task)?;
        debug!(task = task.0, dsq = %from, "dsq_remove");
        Ok(from)
    }

    /// Members of a DSQ in pick order.
    pub fn dsq_iter(&self, dsq_id: DsqId) -> Result<Vec<TaskId>> {
        self.core.dsq_members(self.resolve(dsq_id))
    }

    pub fn dsq_nr_queued(&self, dsq_id: DsqId) -> Result<u32> {
        self.core.dsq_nr_queued(self.resolve(dsq_id))
    }

    pub fn dsq_peek(&self, dsq_id: DsqId) -> Result<Option<TaskId>> {
        self.core.dsq_peek(self.resolve(dsq_id))
    }

    /// Create a Named DSQ (`scx_bpf_create_dsq`). Creating an existing id
    /// with the same order succeeds.
    pub fn dsq_create(&self, dsq_id: DsqId, order: DsqOrder) -> Result<()> {
        self.require(
            "dsq_create",
            &[
                OpsContext::Init,
                OpsContext::InitTask,
                OpsContext::CpuOnline,
            ],
        )?;
        self.core.dsq_create(dsq_id, order)
    }

    pub fn dsq_destroy(&self, dsq_id: DsqId) -> Result<()> {
        if matches!(dsq_id.kind(), DsqKind::LocalCurrent) {
            return Err(ScxError::BuiltinDsq(dsq_id));
        }
        self.core.dsq_destroy(dsq_id, DestroyMode::Caller)
    }

    pub fn kick_cpu(&self, cpu: CpuId, flags: KickFlags) -> Result<()> {
        self.core.kick_cpu(cpu, flags)
    }

    pub fn cpu_is_idle(&self, cpu: CpuId) -> bool {
        self.core.cpu_is_idle(cpu)
    }

    /// Claim `cpu`'s idle bit. Only one caller sees true per idle period.
    pub fn test_and_clear_cpu_idle(&self, cpu: CpuId) -> bool {
        self.core.test_and_clear_cpu_idle(cpu)
    }

    /// Built-in CPU selection. Returns the CPU and whether it was idle; an
    /// idle CPU is claimed, so its idle bit is clear on return.
    pub fn select_cpu_dfl(
        &self,
        task: TaskId,
        prev_cpu: CpuId,
        wake_flags: WakeFlags,
    ) -> Result<(CpuId, bool)> {
        self.require(
            "select_cpu_dfl",
            &[OpsContext::SelectCpu, OpsContext::Enqueue],
        )?;
        self.core.select_cpu_dfl(task, prev_cpu, wake_flags, true)
    }

    /// Drain this CPU's local DSQ and run every task through `enqueue`
    /// again. Only meaningful from `cpu_release`.
    pub fn reenqueue_local(&self) -> Result<u32> {
        self.require("reenqueue_local", &[OpsContext::CpuRelease])?;
        self.core.reenqueue_local(self.cpu)
    }

    /// Abort the scheduler (`scx_bpf_error`).
    pub fn error(&self, msg: impl Into<String>) {
        let msg = msg.into();
        warn!(ctx = self.ctx.name(), cpu = self.cpu.0, "policy error: {}", msg);
        self.core.disable(ExitInfo::new(
            ExitKind::ErrorPolicy,
            "scx_bpf_error",
            Some(msg),
        ));
    }
}
