//! The scheduling core: task and DSQ tables, per-CPU state, and the host
//! callback surface.
//!
//! # Locking
//!
//! There is no scheduler-wide lock. The task and DSQ tables are behind
//! reader/writer locks that are only held long enough to clone an `Arc`
//! out. Membership changes take the lock of every DSQ involved (lowest
//! address first) and then the lock of the task. The per-CPU state lock is
//! a leaf. Policy callbacks always run with no core lock held, so a policy
//! may call back into any [`Ops`] operation.
//!
//! A task's `ops_state` is claimed lock-free by `enqueue` and otherwise only
//! changes under the locks above.

use std::collections::HashMap;
use std::hint::spin_loop;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::bail;
use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::config::SchedConfig;
use crate::cpumask::Cpumask;
use crate::dsq::{Dsq, DsqGuard, DsqSnapshot};
use crate::error::{Result, ScxError};
use crate::events::{Event, ScxEventStats, ScxEvents};
use crate::exit::{ExitInfo, ExitKind};
use crate::fmt::FmtN;
use crate::host::Host;
use crate::ops::{Ops, OpsContext};
use crate::policy::{InitTaskArgs, Policy};
use crate::task::{OpsState, OpsStateVal, QOp, TaskEntry, TaskSnapshot, TaskState, Tsr};
use crate::types::{
    CpuId, CpuReleaseReason, DeqFlags, DsqId, DsqKind, DsqOrder, EnqFlags, KickFlags, TaskFlags,
    TaskId, TimeNs, Vtime, WakeFlags, Weight,
};

const LOADED: u8 = 0;
const ENABLED: u8 = 1;
const DISABLED: u8 = 2;

const WEIGHT_MIN: Weight = 1;
const WEIGHT_MAX: Weight = 10000;

/// How an insert orders the task in the target DSQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InsertKey {
    /// Plain FIFO insert; refused by Priority DSQs.
    Fifo,
    /// Vtime insert; refused by FIFO DSQs.
    Vtime(Vtime),
    /// Whatever the target wants, reusing the task's current vtime.
    Inherit,
}

/// Who is destroying a DSQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyMode {
    /// A policy or host request: the DSQ must exist, be user-allocated and
    /// be empty.
    Caller,
    /// Core teardown (unload, hot-unplug): missing DSQs are fine and
    /// members are requeued to `SCX_DSQ_GLOBAL`.
    Shutdown,
}

#[derive(Debug, Default)]
struct CpuState {
    current: Option<TaskId>,
    last_pick_seq: u64,
}

#[derive(Debug, Default)]
struct CpuSlot {
    online: AtomicBool,
    idle: AtomicBool,
    state: Mutex<CpuState>,
}

/// Point-in-time view of one CPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuSnapshot {
    pub cpu: CpuId,
    pub online: bool,
    pub idle: bool,
    pub current: Option<TaskId>,
    pub last_pick_seq: u64,
    pub nr_local: u32,
}

pub struct ScxCore {
    cfg: SchedConfig,
    online_at_load: Cpumask,
    host: Arc<dyn Host>,
    policy: Box<dyn Policy>,
    tasks: RwLock<HashMap<TaskId, Arc<TaskEntry>>>,
    dsqs: RwLock<HashMap<DsqId, Arc<Dsq>>>,
    cpus: Vec<CachePadded<CpuSlot>>,
    qseq: AtomicU32,
    enable_seq: AtomicU64,
    lifecycle: AtomicU8,
    exit_info: Mutex<Option<ExitInfo>>,
    events: ScxEvents,
}

fn lock_pair<'a>(a: &'a Dsq, b: &'a Dsq) -> (DsqGuard<'a>, DsqGuard<'a>) {
    if a.lock_addr() < b.lock_addr() {
        let ga = a.lock();
        let gb = b.lock();
        (ga, gb)
    } else {
        let gb = b.lock();
        let ga = a.lock();
        (ga, gb)
    }
}

impl ScxCore {
    /// Build a core for `policy`. Nothing is scheduled until [`Self::init`].
    pub fn new<P: Policy + 'static>(
        cfg: SchedConfig,
        policy: P,
        host: Arc<dyn Host>,
    ) -> anyhow::Result<Self> {
        cfg.validate()?;
        let online_at_load = cfg.online_mask()?;
        let cpus = (0..cfg.nr_cpu_ids)
            .map(|_| CachePadded::new(CpuSlot::default()))
            .collect();
        Ok(ScxCore {
            cfg,
            online_at_load,
            host,
            policy: Box::new(policy),
            tasks: RwLock::new(HashMap::new()),
            dsqs: RwLock::new(HashMap::new()),
            cpus,
            qseq: AtomicU32::new(0),
            enable_seq: AtomicU64::new(0),
            lifecycle: AtomicU8::new(LOADED),
            exit_info: Mutex::new(None),
            events: ScxEvents::default(),
        })
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn config(&self) -> &SchedConfig {
        &self.cfg
    }

    pub fn nr_cpu_ids(&self) -> u32 {
        self.cfg.nr_cpu_ids
    }

    pub fn policy_name(&self) -> &str {
        self.policy.name()
    }

    pub(crate) fn host_now(&self) -> TimeNs {
        self.host.now_ns()
    }

    pub fn is_enabled(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) == ENABLED
    }

    /// Bumped every time the scheduler is initialised.
    pub fn enable_seq(&self) -> u64 {
        self.enable_seq.load(Ordering::Relaxed)
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit_info.lock().clone()
    }

    pub fn events(&self) -> ScxEventStats {
        self.events.snapshot()
    }

    pub fn nr_tasks(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn online_cpus(&self) -> Cpumask {
        let mut mask = Cpumask::new(self.cfg.nr_cpu_ids as usize);
        for (cpu, slot) in self.cpus.iter().enumerate() {
            if slot.online.load(Ordering::Acquire) {
                let _ = mask.set_cpu(cpu);
            }
        }
        mask
    }

    /// An `Ops` handle outside any callback, for host-side setup and
    /// inspection.
    pub fn ops(&self, cpu: CpuId) -> Ops<'_> {
        Ops::new(self, cpu, OpsContext::Unlocked, None)
    }

    pub fn task(&self, task: TaskId) -> Result<TaskSnapshot> {
        let entry = self.entry(task)?;
        let tsr = entry.tsr.lock();
        if tsr.state == TaskState::Exited {
            return Err(ScxError::UnknownTask(task));
        }
        Ok(TaskSnapshot::new(&tsr, entry.ops_state.load()))
    }

    pub fn dsq_snapshot(&self, id: DsqId) -> Result<DsqSnapshot> {
        let dsq = self.find_dsq(id).ok_or(ScxError::UnknownDsq(id))?;
        let g = dsq.lock();
        Ok(g.snapshot())
    }

    pub fn cpu_snapshot(&self, cpu: CpuId) -> Result<CpuSnapshot> {
        let slot = self.slot(cpu)?;
        let (current, last_pick_seq) = {
            let st = slot.state.lock();
            (st.current, st.last_pick_seq)
        };
        let nr_local = self
            .find_dsq(DsqId::local_on(cpu))
            .map_or(0, |dsq| dsq.nr());
        Ok(CpuSnapshot {
            cpu,
            online: slot.online.load(Ordering::Acquire),
            idle: slot.idle.load(Ordering::Acquire),
            current,
            last_pick_seq,
            nr_local,
        })
    }

    // ---------------------------------------------------------------------
    // Internal helpers
    // ---------------------------------------------------------------------

    fn ensure_enabled(&self) -> Result<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(ScxError::Disabled)
        }
    }

    fn next_qseq(&self) -> u32 {
        self.qseq.fetch_add(1, Ordering::Relaxed) & OpsState::QSEQ_MASK
    }

    fn slot(&self, cpu: CpuId) -> Result<&CpuSlot> {
        self.cpus
            .get(cpu.0 as usize)
            .map(|slot| &**slot)
            .ok_or(ScxError::bad_cpu(cpu, "beyond nr_cpu_ids"))
    }

    fn is_cpu_online(&self, cpu: CpuId) -> bool {
        self.slot(cpu)
            .is_ok_and(|slot| slot.online.load(Ordering::Acquire))
    }

    fn check_online(&self, cpu: CpuId) -> Result<&CpuSlot> {
        let slot = self.slot(cpu)?;
        if !slot.online.load(Ordering::Acquire) {
            return Err(ScxError::bad_cpu(cpu, "offline"));
        }
        Ok(slot)
    }

    fn find_task(&self, task: TaskId) -> Option<Arc<TaskEntry>> {
        self.tasks.read().get(&task).cloned()
    }

    fn entry(&self, task: TaskId) -> Result<Arc<TaskEntry>> {
        self.find_task(task).ok_or(ScxError::UnknownTask(task))
    }

    fn find_dsq(&self, id: DsqId) -> Option<Arc<Dsq>> {
        self.dsqs.read().get(&id).cloned()
    }

    /// Resolve an insert or move target. `SCX_DSQ_LOCAL` must already be
    /// resolved to a CPU by the caller.
    fn target_dsq(&self, id: DsqId) -> Result<Arc<Dsq>> {
        match id.kind() {
            DsqKind::Local(cpu) => {
                self.slot(cpu)?;
                match self.find_dsq(id) {
                    Some(dsq) => Ok(dsq),
                    None => {
                        self.events.inc(Event::DispatchLocalDsqOffline);
                        Err(ScxError::bad_cpu(cpu, "offline"))
                    }
                }
            }
            DsqKind::Global | DsqKind::Named(_) => {
                self.find_dsq(id).ok_or(ScxError::UnknownDsq(id))
            }
            DsqKind::LocalCurrent | DsqKind::Invalid => Err(ScxError::UnknownDsq(id)),
        }
    }

    fn check_cpumask(&self, mask: &Cpumask) -> Result<()> {
        if mask.len() != self.cfg.nr_cpu_ids as usize {
            return Err(ScxError::bad_cpu(
                CpuId(mask.len() as u32),
                "cpumask size does not match nr_cpu_ids",
            ));
        }
        if mask.is_empty() {
            return Err(ScxError::bad_cpu(CpuId(0), "empty cpumask"));
        }
        if !self.cfg.allow_per_cpu_pinning {
            let online = self.online_cpus();
            let uncovered = online.iter().find(|&cpu| !mask.test_cpu(cpu));
            if let Some(cpu) = uncovered {
                return Err(ScxError::bad_cpu(
                    CpuId(cpu as u32),
                    "per-cpu pinning is disabled",
                ));
            }
        }
        Ok(())
    }

    /// Run `f` with the DSQ holding `entry` (if any) and the task locked.
    /// The DSQ is re-validated after locking, so `f` sees a consistent
    /// membership.
    fn with_task_locked<R>(
        &self,
        entry: &TaskEntry,
        f: impl FnOnce(Option<&mut DsqGuard<'_>>, &mut Tsr) -> R,
    ) -> R {
        loop {
            let dsq_ref = entry.tsr.lock().dsq_ref;
            match dsq_ref {
                None => {
                    let mut tsr = entry.tsr.lock();
                    if tsr.dsq_ref.is_none() {
                        return f(None, &mut tsr);
                    }
                }
                Some(id) => {
                    let Some(dsq) = self.find_dsq(id) else {
                        // Being torn down; the drain unlinks it shortly.
                        spin_loop();
                        continue;
                    };
                    let mut g = dsq.lock();
                    let mut tsr = entry.tsr.lock();
                    if tsr.dsq_ref == Some(id) {
                        return f(Some(&mut g), &mut tsr);
                    }
                }
            }
        }
    }

    /// Unlink every member of a locked DSQ and leave them `Runnable`.
    /// Returns them in pick order.
    fn drain_locked(&self, g: &mut DsqGuard<'_>) -> Vec<TaskId> {
        let ids = g.members();
        for &id in &ids {
            if let Some(entry) = self.find_task(id) {
                let mut tsr = entry.tsr.lock();
                g.unlink(&mut tsr);
                tsr.state = TaskState::Runnable;
                entry.ops_state.store(OpsStateVal::NONE);
            }
        }
        ids
    }

    fn requeue_global(&self, cpu: CpuId, ids: &[TaskId]) {
        for &id in ids {
            if let Err(e) = self.insert(
                cpu,
                id,
                DsqId::GLOBAL,
                0,
                InsertKey::Fifo,
                EnqFlags::empty(),
                QOp::None,
            ) {
                warn!(task = id.0, %e, "requeue to global failed");
            }
        }
    }

    /// Whether a task landing on `cpu`'s local DSQ needs to wake it up.
    fn cpu_needs_wakeup(&self, cpu: CpuId) -> bool {
        let Ok(slot) = self.slot(cpu) else {
            return false;
        };
        slot.state.lock().current.is_none() || self.host.cpu_is_idle(cpu)
    }

    /// Zero the slice of whatever runs on `cpu` and kick it.
    fn preempt_cpu(&self, cpu: CpuId) {
        let current = match self.slot(cpu) {
            Ok(slot) => slot.state.lock().current,
            Err(_) => return,
        };
        if let Some(entry) = current.and_then(|id| self.find_task(id)) {
            entry.tsr.lock().slice_ns = 0;
        }
        self.host.kick_cpu(cpu, KickFlags::PREEMPT);
    }

    fn after_local_insert(&self, caller: CpuId, target: CpuId, enq_flags: EnqFlags) {
        if enq_flags.contains(EnqFlags::PREEMPT) {
            self.preempt_cpu(target);
        } else if target != caller && self.cpu_needs_wakeup(target) {
            self.host.kick_cpu(target, KickFlags::IDLE);
        }
    }

    fn clear_current(&self, cpu: CpuId, task: TaskId) {
        if let Ok(slot) = self.slot(cpu) {
            let mut st = slot.state.lock();
            if st.current == Some(task) {
                st.current = None;
            }
        }
    }

    fn quiesce(&self, cpu: CpuId, entry: &TaskEntry, deq_flags: DeqFlags) {
        let was_runnable = {
            let mut tsr = entry.tsr.lock();
            let was = tsr.flags.contains(TaskFlags::RUNNABLE);
            tsr.flags.remove(TaskFlags::RUNNABLE);
            was
        };
        if was_runnable {
            let ops = Ops::new(self, cpu, OpsContext::Quiescent, Some(entry.id));
            self.policy.quiescent(&ops, entry.id, deq_flags);
        }
    }

    /// Disable the scheduler on a protocol violation and hand back the
    /// error to return. Must be called with no core lock held.
    fn fatal(&self, msg: String) -> ScxError {
        self.disable(ExitInfo::new(
            ExitKind::Error,
            "runtime error",
            Some(msg.clone()),
        ));
        ScxError::ProtocolViolation(msg)
    }

    // ---------------------------------------------------------------------
    // DSQ operations
    // ---------------------------------------------------------------------

    fn create_dsq(&self, id: DsqId, order: DsqOrder) -> Result<()> {
        let mut table = self.dsqs.write();
        if let Some(dsq) = table.get(&id) {
            return if dsq.order == order {
                Ok(())
            } else {
                Err(ScxError::DuplicateDsq(id))
            };
        }
        if !id.is_builtin() {
            let nr_named = table.keys().filter(|id| !id.is_builtin()).count();
            let limit = self.cfg.max_dsqs - self.cfg.nr_cpu_ids as usize - 1;
            if nr_named >= limit {
                return Err(ScxError::OutOfMemory {
                    what: "dsq",
                    limit: self.cfg.max_dsqs,
                });
            }
        }
        table.insert(
            id,
            Arc::new(Dsq::new(id, order, self.cfg.priority_tiebreak)),
        );
        debug!(dsq = %id, ?order, "dsq created");
        Ok(())
    }

    pub(crate) fn dsq_create(&self, id: DsqId, order: DsqOrder) -> Result<()> {
        self.ensure_enabled()?;
        match id.kind() {
            DsqKind::Named(_) => self.create_dsq(id, order),
            DsqKind::Global => match order {
                DsqOrder::Fifo => Ok(()),
                DsqOrder::Priority => Err(ScxError::DuplicateDsq(id)),
            },
            DsqKind::Local(cpu) => {
                self.check_online(cpu)?;
                match order {
                    DsqOrder::Fifo => Ok(()),
                    DsqOrder::Priority => Err(ScxError::DuplicateDsq(id)),
                }
            }
            DsqKind::LocalCurrent | DsqKind::Invalid => Err(ScxError::BuiltinDsq(id)),
        }
    }

    /// Destroy a DSQ. See [`DestroyMode`] for what each caller may do.
    pub fn dsq_destroy(&self, id: DsqId, mode: DestroyMode) -> Result<()> {
        if mode == DestroyMode::Caller {
            self.ensure_enabled()?;
            if id.is_builtin() {
                return Err(ScxError::BuiltinDsq(id));
            }
        }
        let missing = || match mode {
            DestroyMode::Shutdown => Ok(()),
            DestroyMode::Caller => Err(ScxError::UnknownDsq(id)),
        };
        let Some(dsq) = self.find_dsq(id) else {
            return missing();
        };
        let drained = {
            let mut g = dsq.lock();
            if g.is_destroyed() {
                return missing();
            }
            if mode == DestroyMode::Caller && !g.is_empty() {
                return Err(ScxError::DsqNotEmpty {
                    id,
                    nr: g.len() as u32,
                });
            }
            g.mark_destroyed();
            self.dsqs.write().remove(&id);
            self.drain_locked(&mut g)
        };
        debug!(dsq = %id, ?mode, nr_drained = drained.len(), "dsq destroyed");
        if id != DsqId::GLOBAL && !drained.is_empty() && self.is_enabled() {
            let cpu = match id.kind() {
                DsqKind::Local(cpu) => cpu,
                _ => CpuId(0),
            };
            self.requeue_global(cpu, &drained);
        }
        Ok(())
    }

    /// Insert `task` into `dsq_id`. `claim` is the `ops_state` op the task
    /// must be in: `Queueing` for the task an enqueue is running for,
    /// `None` for any other insert.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn insert(
        &self,
        cpu: CpuId,
        task: TaskId,
        dsq_id: DsqId,
        slice: TimeNs,
        key: InsertKey,
        enq_flags: EnqFlags,
        claim: QOp,
    ) -> Result<()> {
        self.ensure_enabled()?;
        let entry = self.entry(task)?;
        let qseq = self.next_qseq();
        loop {
            let dsq = self.target_dsq(dsq_id)?;
            let link_key = match (dsq.order, key) {
                (DsqOrder::Fifo, InsertKey::Vtime(_)) | (DsqOrder::Priority, InsertKey::Fifo) => {
                    return Err(ScxError::WrongOrder(dsq_id));
                }
                (_, InsertKey::Vtime(v)) => Some(v),
                _ => None,
            };
            let mut g = dsq.lock();
            if g.is_destroyed() {
                continue;
            }
            let mut tsr = entry.tsr.lock();
            match tsr.state {
                TaskState::Runnable | TaskState::Stopping if tsr.dsq_ref.is_none() => {}
                TaskState::Exited => return Err(ScxError::UnknownTask(task)),
                state => {
                    return Err(ScxError::BadState {
                        task,
                        state,
                        op: "dsq_insert",
                    })
                }
            }
            if let DsqKind::Local(target) = dsq_id.kind() {
                if !tsr.can_run_on(target) {
                    return Err(ScxError::bad_cpu(target, "excluded by allowed_cpus"));
                }
            }
            let queued = OpsStateVal::new(QOp::Queued, cpu, qseq);
            if entry.ops_state.transition(&[claim], queued).is_err() {
                return Err(ScxError::BadState {
                    task,
                    state: tsr.state,
                    op: "dsq_insert",
                });
            }
            if slice != 0 {
                tsr.slice_ns = slice;
            }
            let seq = g.link(&mut tsr, link_key, enq_flags);
            debug!(
                task = task.0,
                dsq = %dsq_id,
                seq,
                slice = %FmtN(tsr.slice_ns),
                vtime = %tsr.vtime,
                "dsq_insert"
            );
            break;
        }
        if let DsqKind::Local(target) = dsq_id.kind() {
            self.after_local_insert(cpu, target, enq_flags);
        }
        Ok(())
    }

    /// Record a direct dispatch for the task `select_cpu` runs for.
    pub(crate) fn arm_ddsp(
        &self,
        task: TaskId,
        dsq_id: DsqId,
        slice: TimeNs,
        vtime: Option<Vtime>,
        enq_flags: EnqFlags,
    ) -> Result<()> {
        self.ensure_enabled()?;
        let entry = self.entry(task)?;
        let mut tsr = entry.tsr.lock();
        if tsr.state != TaskState::Runnable || tsr.dsq_ref.is_some() {
            return Err(ScxError::BadState {
                task,
                state: tsr.state,
                op: "tsr_arm_ddsp",
            });
        }
        match dsq_id.kind() {
            DsqKind::Local(cpu) => {
                self.slot(cpu)?;
                if !tsr.can_run_on(cpu) {
                    return Err(ScxError::bad_cpu(cpu, "excluded by allowed_cpus"));
                }
            }
            DsqKind::LocalCurrent | DsqKind::Global | DsqKind::Named(_) => {}
            DsqKind::Invalid => return Err(ScxError::UnknownDsq(dsq_id)),
        }
        if slice != 0 {
            tsr.slice_ns = slice;
        }
        if let Some(v) = vtime {
            tsr.vtime = v;
        }
        tsr.ddsp = Some((dsq_id, enq_flags));
        tsr.flags.insert(TaskFlags::DDSP);
        debug!(task = task.0, dsq = %dsq_id, "ddsp armed");
        Ok(())
    }

    /// Take `task` out of whatever DSQ holds it.
    pub(crate) fn dsq_remove(&self, task: TaskId) -> Result<DsqId> {
        self.ensure_enabled()?;
        let entry = self.entry(task)?;
        self.with_task_locked(&entry, |g, tsr| match g {
            Some(g) => {
                g.unlink(tsr);
                tsr.state = TaskState::Runnable;
                entry.ops_state.store(OpsStateVal::NONE);
                Ok(g.id())
            }
            None => Err(ScxError::BadState {
                task,
                state: tsr.state,
                op: "dsq_remove",
            }),
        })
    }

    /// Move a queued task to `dst_id`, keeping it queued throughout.
    pub(crate) fn move_task(
        &self,
        cpu: CpuId,
        task: TaskId,
        dst_id: DsqId,
        key: InsertKey,
        enq_flags: EnqFlags,
    ) -> Result<()> {
        self.ensure_enabled()?;
        let entry = self.entry(task)?;
        loop {
            let src_id = entry.tsr.lock().dsq_ref;
            let Some(src_id) = src_id else {
                let state = entry.tsr.lock().state;
                return Err(ScxError::BadState {
                    task,
                    state,
                    op: "dsq_move",
                });
            };
            let Some(src) = self.find_dsq(src_id) else {
                spin_loop();
                continue;
            };
            let dst = self.target_dsq(dst_id)?;
            let link_key = match (dst.order, key) {
                (DsqOrder::Fifo, InsertKey::Vtime(_)) | (DsqOrder::Priority, InsertKey::Fifo) => {
                    return Err(ScxError::WrongOrder(dst_id));
                }
                (_, InsertKey::Vtime(v)) => Some(v),
                _ => None,
            };

            if Arc::ptr_eq(&src, &dst) {
                let mut g = src.lock();
                let mut tsr = entry.tsr.lock();
                if g.is_destroyed() || tsr.dsq_ref != Some(src_id) {
                    continue;
                }
                g.unlink(&mut tsr);
                g.link(&mut tsr, link_key, enq_flags);
            } else {
                let (mut gs, mut gd) = lock_pair(&src, &dst);
                if gs.is_destroyed() || gd.is_destroyed() {
                    continue;
                }
                let mut tsr = entry.tsr.lock();
                if tsr.dsq_ref != Some(src_id) {
                    continue;
                }
                if let DsqKind::Local(target) = dst_id.kind() {
                    if !tsr.can_run_on(target) {
                        return Err(ScxError::bad_cpu(target, "excluded by allowed_cpus"));
                    }
                }
                gs.unlink(&mut tsr);
                gd.link(&mut tsr, link_key, enq_flags);
            }
            debug!(task = task.0, src = %src_id, dst = %dst_id, "dsq_move");
            break;
        }
        if let DsqKind::Local(target) = dst_id.kind() {
            self.after_local_insert(cpu, target, enq_flags);
        }
        Ok(())
    }

    /// Move the first task of `src_id` that may run on `cpu` to `cpu`'s
    /// local DSQ.
    pub(crate) fn move_to_local(&self, cpu: CpuId, src_id: DsqId) -> Result<bool> {
        self.ensure_enabled()?;
        let local_id = DsqId::local_on(cpu);
        loop {
            let src = self.target_dsq(src_id)?;
            let local = self.target_dsq(local_id)?;
            if Arc::ptr_eq(&src, &local) {
                return Ok(false);
            }
            let (mut gs, mut gl) = lock_pair(&src, &local);
            if gs.is_destroyed() || gl.is_destroyed() {
                continue;
            }
            let mut moved = None;
            for id in gs.members() {
                let Some(entry) = self.find_task(id) else {
                    continue;
                };
                let mut tsr = entry.tsr.lock();
                if !tsr.can_run_on(cpu) {
                    continue;
                }
                gs.unlink(&mut tsr);
                gl.link(&mut tsr, None, EnqFlags::empty());
                moved = Some(id);
                break;
            }
            debug!(
                cpu = cpu.0,
                dsq = %src_id,
                task = moved.map(|t| t.0),
                "dsq_move_to_local"
            );
            return Ok(moved.is_some());
        }
    }

    pub(crate) fn dsq_members(&self, id: DsqId) -> Result<Vec<TaskId>> {
        let dsq = self.find_dsq(id).ok_or(ScxError::UnknownDsq(id))?;
        let g = dsq.lock();
        Ok(g.members())
    }

    pub(crate) fn dsq_nr_queued(&self, id: DsqId) -> Result<u32> {
        self.find_dsq(id)
            .map(|dsq| dsq.nr())
            .ok_or(ScxError::UnknownDsq(id))
    }

    pub(crate) fn dsq_peek(&self, id: DsqId) -> Result<Option<TaskId>> {
        let dsq = self.find_dsq(id).ok_or(ScxError::UnknownDsq(id))?;
        let g = dsq.lock();
        Ok(g.first())
    }

    // ---------------------------------------------------------------------
    // Task field access for policies
    // ---------------------------------------------------------------------

    pub(crate) fn set_slice(&self, task: TaskId, slice: TimeNs) -> Result<()> {
        let entry = self.entry(task)?;
        let mut tsr = entry.tsr.lock();
        if tsr.state == TaskState::Exited {
            return Err(ScxError::UnknownTask(task));
        }
        tsr.slice_ns = slice;
        Ok(())
    }

    pub(crate) fn set_vtime(&self, task: TaskId, vtime: Vtime) -> Result<()> {
        let entry = self.entry(task)?;
        let mut tsr = entry.tsr.lock();
        match tsr.state {
            TaskState::Exited => Err(ScxError::UnknownTask(task)),
            TaskState::Queued => Err(ScxError::BadState {
                task,
                state: TaskState::Queued,
                op: "set_vtime",
            }),
            _ => {
                tsr.vtime = vtime;
                Ok(())
            }
        }
    }

    // ---------------------------------------------------------------------
    // CPU helpers for policies
    // ---------------------------------------------------------------------

    pub(crate) fn kick_cpu(&self, cpu: CpuId, flags: KickFlags) -> Result<()> {
        self.slot(cpu)?;
        if flags.contains(KickFlags::PREEMPT) {
            self.preempt_cpu(cpu);
            let rest = flags - KickFlags::PREEMPT;
            if !rest.is_empty() {
                self.host.kick_cpu(cpu, rest);
            }
        } else {
            self.host.kick_cpu(cpu, flags);
        }
        trace!(cpu = cpu.0, ?flags, "kick_cpu");
        Ok(())
    }

    pub(crate) fn cpu_is_idle(&self, cpu: CpuId) -> bool {
        match self.slot(cpu) {
            Ok(slot) => slot.idle.load(Ordering::Acquire) || self.host.cpu_is_idle(cpu),
            Err(_) => false,
        }
    }

    pub(crate) fn test_and_clear_cpu_idle(&self, cpu: CpuId) -> bool {
        match self.slot(cpu) {
            Ok(slot) => {
                slot.online.load(Ordering::Acquire) && slot.idle.swap(false, Ordering::AcqRel)
            }
            Err(_) => false,
        }
    }

    /// Default CPU selection: an idle allowed CPU, preferring `prev_cpu`,
    /// then `prev_cpu` itself, then the first allowed online CPU. Idle CPUs
    /// are only considered (and claimed) when `claim_idle` is set.
    pub(crate) fn select_cpu_dfl(
        &self,
        task: TaskId,
        prev_cpu: CpuId,
        _wake_flags: WakeFlags,
        claim_idle: bool,
    ) -> Result<(CpuId, bool)> {
        let allowed = self.entry(task)?.tsr.lock().allowed_cpus.clone();
        let usable = |cpu: CpuId| allowed.test_cpu(cpu.0 as usize) && self.is_cpu_online(cpu);

        if claim_idle {
            if usable(prev_cpu) && self.test_and_clear_cpu_idle(prev_cpu) {
                debug!(task = task.0, prev_cpu = prev_cpu.0, cpu = prev_cpu.0, idle = true, "select_cpu_dfl");
                return Ok((prev_cpu, true));
            }
            for cpu in allowed.iter().map(|c| CpuId(c as u32)) {
                if usable(cpu) && self.test_and_clear_cpu_idle(cpu) {
                    debug!(task = task.0, prev_cpu = prev_cpu.0, cpu = cpu.0, idle = true, "select_cpu_dfl");
                    return Ok((cpu, true));
                }
            }
        }

        let fallback = if usable(prev_cpu) {
            Some(prev_cpu)
        } else {
            allowed.iter().map(|c| CpuId(c as u32)).find(|&c| usable(c))
        };
        match fallback {
            Some(cpu) => {
                debug!(task = task.0, prev_cpu = prev_cpu.0, cpu = cpu.0, idle = false, "select_cpu_dfl");
                Ok((cpu, false))
            }
            None => Err(ScxError::bad_cpu(prev_cpu, "no allowed cpu is online")),
        }
    }

    pub(crate) fn reenqueue_local(&self, cpu: CpuId) -> Result<u32> {
        self.ensure_enabled()?;
        let local = self.target_dsq(DsqId::local_on(cpu))?;
        let ids = {
            let mut g = local.lock();
            self.drain_locked(&mut g)
        };
        for &id in &ids {
            match self.enqueue(cpu, id, EnqFlags::REENQ) {
                Ok(()) => {}
                Err(e) if e.is_fatal() || e == ScxError::Disabled => return Err(e),
                Err(e) => warn!(task = id.0, %e, "reenqueue failed"),
            }
        }
        self.events.add(Event::ReenqLocal, ids.len() as u64);
        debug!(cpu = cpu.0, nr = ids.len(), "reenqueue_local");
        Ok(ids.len() as u32)
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    fn init_dsqs(&self) -> Result<()> {
        for cpu in self.online_at_load.iter().map(|c| CpuId(c as u32)) {
            self.create_dsq(DsqId::local_on(cpu), DsqOrder::Fifo)?;
            let slot = self.slot(cpu)?;
            slot.online.store(true, Ordering::Release);
            slot.idle.store(true, Ordering::Release);
        }
        self.create_dsq(DsqId::GLOBAL, DsqOrder::Fifo)?;
        for named in &self.cfg.dsq_preallocate_named {
            let id = DsqId::named(named.id).ok_or(ScxError::BuiltinDsq(DsqId(named.id)))?;
            self.create_dsq(id, named.order)?;
        }
        Ok(())
    }

    /// Load: build the built-in and preallocated DSQs, then run the
    /// policy's `init`. A failure here unloads again before returning.
    pub fn init(&self) -> Result<()> {
        match self
            .lifecycle
            .compare_exchange(LOADED, ENABLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(ENABLED) => {
                return Err(ScxError::NotAllowed {
                    op: "init",
                    context: "an enabled scheduler",
                })
            }
            Err(_) => return Err(ScxError::Disabled),
        }
        self.enable_seq.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.init_dsqs() {
            self.disable(ExitInfo::new(
                ExitKind::Error,
                "failed to create DSQs",
                Some(e.to_string()),
            ));
            return Err(e);
        }
        let ops = Ops::new(self, CpuId(0), OpsContext::Init, None);
        if let Err(e) = self.policy.init(&ops) {
            self.disable(ExitInfo::new(
                ExitKind::Error,
                "policy init failed",
                Some(e.to_string()),
            ));
            return Err(e);
        }
        self.ensure_enabled()?;
        info!(
            policy = self.policy.name(),
            nr_cpu_ids = self.cfg.nr_cpu_ids,
            online = %self.online_at_load,
            slice = %FmtN(self.cfg.default_slice_ns),
            "scheduler enabled"
        );
        Ok(())
    }

    /// Unload. Safe to call any number of times, including after a fatal
    /// error or a failed `init`; returns the first recorded exit.
    pub fn exit(&self) -> ExitInfo {
        let info = ExitInfo::new(ExitKind::Done, "unloaded", None);
        self.disable(info.clone());
        self.exit_info().unwrap_or(info)
    }

    /// Record `info`, drain everything and run the policy's `exit`. Only
    /// the first call does anything. Must be called with no core lock held.
    pub(crate) fn disable(&self, info: ExitInfo) -> bool {
        if self.lifecycle.swap(DISABLED, Ordering::AcqRel) == DISABLED {
            return false;
        }
        *self.exit_info.lock() = Some(info.clone());
        if info.is_error() {
            error!(policy = self.policy.name(), "{}", info);
        } else {
            info!(policy = self.policy.name(), "{}", info);
        }
        self.drain_all();
        self.policy.exit(&info);
        true
    }

    fn drain_all(&self) {
        let dsqs: Vec<Arc<Dsq>> = std::mem::take(&mut *self.dsqs.write())
            .into_values()
            .collect();
        let mut nr_queued = 0;
        for dsq in &dsqs {
            let mut g = dsq.lock();
            g.mark_destroyed();
            nr_queued += self.drain_locked(&mut g).len();
        }

        let mut tasks: Vec<Arc<TaskEntry>> = std::mem::take(&mut *self.tasks.write())
            .into_values()
            .collect();
        tasks.sort_by_key(|entry| entry.id);
        for entry in &tasks {
            let enabled = {
                let mut tsr = entry.tsr.lock();
                let enabled = tsr.flags.contains(TaskFlags::ENABLED);
                tsr.flags.remove(TaskFlags::ENABLED | TaskFlags::RUNNABLE);
                tsr.state = TaskState::Exited;
                tsr.holding_cpu = None;
                tsr.ddsp = None;
                enabled
            };
            entry.ops_state.store(OpsStateVal::NONE);
            if enabled {
                let ops = Ops::new(self, CpuId(0), OpsContext::Disable, Some(entry.id));
                self.policy.disable(&ops, entry.id);
            }
            let ops = Ops::new(self, CpuId(0), OpsContext::ExitTask, Some(entry.id));
            self.policy.exit_task(&ops, entry.id);
        }

        for slot in &self.cpus {
            slot.online.store(false, Ordering::Release);
            slot.idle.store(false, Ordering::Release);
            slot.state.lock().current = None;
        }
        info!(
            nr_dsqs = dsqs.len(),
            nr_tasks = tasks.len(),
            nr_queued,
            "scheduler drained"
        );
    }

    // ---------------------------------------------------------------------
    // Task callbacks
    // ---------------------------------------------------------------------

    /// Introduce a task. It stays `Fresh` until [`Self::enable`].
    pub fn init_task(&self, task: TaskId, args: &InitTaskArgs) -> Result<()> {
        self.ensure_enabled()?;
        self.check_cpumask(&args.allowed_cpus)?;
        let weight = args.weight.clamp(WEIGHT_MIN, WEIGHT_MAX);
        {
            let mut table = self.tasks.write();
            if let Some(existing) = table.get(&task).cloned() {
                drop(table);
                let state = existing.tsr.lock().state;
                return Err(ScxError::BadState {
                    task,
                    state,
                    op: "init_task",
                });
            }
            if table.len() >= self.cfg.max_tasks {
                return Err(ScxError::OutOfMemory {
                    what: "task",
                    limit: self.cfg.max_tasks,
                });
            }
            let tsr = Tsr::new(task, args.allowed_cpus.clone(), weight);
            table.insert(task, Arc::new(TaskEntry::new(tsr)));
        }

        let ops = Ops::new(self, CpuId(0), OpsContext::InitTask, Some(task));
        if let Err(e) = self.policy.init_task(&ops, task, args) {
            self.tasks.write().remove(&task);
            warn!(task = task.0, %e, "init_task refused");
            return Err(e);
        }
        debug!(task = task.0, cpus = %args.allowed_cpus, weight, "init_task");
        Ok(())
    }

    /// `Fresh -> Runnable`.
    pub fn enable(&self, task: TaskId) -> Result<()> {
        self.ensure_enabled()?;
        let entry = self.entry(task)?;
        {
            let mut tsr = entry.tsr.lock();
            if tsr.state != TaskState::Fresh {
                return Err(ScxError::BadState {
                    task,
                    state: tsr.state,
                    op: "enable",
                });
            }
            tsr.state = TaskState::Runnable;
            tsr.flags.insert(TaskFlags::ENABLED);
            tsr.slice_ns = self.cfg.default_slice_ns;
        }
        let ops = Ops::new(self, CpuId(0), OpsContext::Enable, Some(task));
        self.policy.enable(&ops, task);
        debug!(task = task.0, "enable");
        Ok(())
    }

    /// Wakeup path: ask the policy for a CPU and validate the answer.
    pub fn select_cpu(
        &self,
        cpu: CpuId,
        task: TaskId,
        prev_cpu: CpuId,
        wake_flags: WakeFlags,
    ) -> Result<CpuId> {
        self.ensure_enabled()?;
        self.check_online(cpu)?;
        let entry = self.entry(task)?;
        {
            let mut tsr = entry.tsr.lock();
            if tsr.state != TaskState::Runnable {
                return Err(ScxError::BadState {
                    task,
                    state: tsr.state,
                    op: "select_cpu",
                });
            }
            tsr.ddsp = None;
            tsr.flags.remove(TaskFlags::DDSP);
            tsr.sticky_cpu = None;
        }

        let ops = Ops::new(self, cpu, OpsContext::SelectCpu, Some(task));
        let picked = self.policy.select_cpu(&ops, task, prev_cpu, wake_flags);
        self.ensure_enabled()?;

        let chosen = match picked {
            Ok(c) if self.is_cpu_online(c) && entry.tsr.lock().can_run_on(c) => c,
            other => {
                match other {
                    Err(e) => warn!(task = task.0, %e, "select_cpu failed"),
                    Ok(c) => warn!(task = task.0, cpu = c.0, "select_cpu returned an unusable cpu"),
                }
                self.events.inc(Event::SelectCpuFallback);
                self.select_cpu_dfl(task, prev_cpu, wake_flags, false)?.0
            }
        };
        entry.tsr.lock().sticky_cpu = Some(chosen);
        debug!(task = task.0, prev_cpu = prev_cpu.0, cpu = chosen.0, "select_cpu");
        Ok(chosen)
    }

    /// A task became runnable on `cpu`: consume an armed direct dispatch or
    /// hand the task to the policy, which must insert it exactly once.
    pub fn enqueue(&self, cpu: CpuId, task: TaskId, enq_flags: EnqFlags) -> Result<()> {
        self.ensure_enabled()?;
        self.check_online(cpu)?;
        let entry = self.entry(task)?;

        let claim = OpsStateVal::new(QOp::Queueing, cpu, self.next_qseq());
        loop {
            match entry.ops_state.transition(&[QOp::None], claim) {
                Ok(_) => break,
                // Another CPU is mid-pick under the DSQ lock.
                Err(seen) if seen.op == QOp::Dispatching => spin_loop(),
                Err(seen) => {
                    return Err(self.fatal(format!(
                        "enqueue of task {} on cpu {} found ops_state {:?} from cpu {}",
                        task, cpu, seen.op, seen.cpu
                    )));
                }
            }
        }

        let prep = {
            let mut tsr = entry.tsr.lock();
            if tsr.state != TaskState::Runnable {
                let state = tsr.state;
                drop(tsr);
                entry.ops_state.store(OpsStateVal::NONE);
                return Err(match state {
                    TaskState::Exited => ScxError::UnknownTask(task),
                    state => ScxError::BadState {
                        task,
                        state,
                        op: "enqueue",
                    },
                });
            }
            let mut flags = enq_flags;
            if tsr.flags.contains(TaskFlags::ENQ_PREEMPT) {
                tsr.flags.remove(TaskFlags::ENQ_PREEMPT);
                flags |= EnqFlags::SLICE_EXPIRED;
                self.events.inc(Event::EnqPreempt);
            }
            if tsr.slice_ns == 0 {
                tsr.slice_ns = self.cfg.default_slice_ns;
                self.events.inc(Event::RefillSliceDfl);
            }
            let wakeup = !tsr.flags.contains(TaskFlags::RUNNABLE);
            tsr.flags.insert(TaskFlags::RUNNABLE);
            tsr.flags.remove(TaskFlags::DEQUEUED_EXTERNAL);
            let ddsp = tsr.ddsp.take();
            tsr.flags.remove(TaskFlags::DDSP);
            (flags, wakeup, ddsp, tsr.sticky_cpu)
        };
        let (flags, wakeup, ddsp, sticky_cpu) = prep;

        if wakeup {
            let ops = Ops::new(self, cpu, OpsContext::Runnable, Some(task));
            self.policy.runnable(&ops, task, flags);
            self.ensure_enabled()?;
        }

        if let Some((dsq_id, ddsp_flags)) = ddsp {
            let target = if dsq_id == DsqId::LOCAL {
                DsqId::local_on(sticky_cpu.unwrap_or(cpu))
            } else {
                dsq_id
            };
            match self.insert(
                cpu,
                task,
                target,
                0,
                InsertKey::Inherit,
                (flags - EnqFlags::SLICE_EXPIRED) | ddsp_flags,
                QOp::Queueing,
            ) {
                Ok(()) => {
                    self.events.inc(Event::DdspConsumed);
                    return Ok(());
                }
                Err(ScxError::Disabled) => return Err(ScxError::Disabled),
                Err(e) => {
                    self.events.inc(Event::DdspRejected);
                    warn!(task = task.0, dsq = %target, %e, "direct dispatch rejected");
                }
            }
        }

        let ops = Ops::new(self, cpu, OpsContext::Enqueue, Some(task));
        let ret = self.policy.enqueue(&ops, task, flags);
        self.ensure_enabled()?;
        match (ops.subject_inserts(), ret) {
            (0, ret) => {
                entry.ops_state.store(OpsStateVal::NONE);
                let why = match ret {
                    Ok(()) => "inserted nothing".to_string(),
                    Err(e) => format!("failed: {e}"),
                };
                Err(self.fatal(format!("enqueue of task {task} {why}")))
            }
            (_, Err(e)) => {
                warn!(task = task.0, %e, "enqueue returned an error after inserting");
                Ok(())
            }
            (_, Ok(())) => Ok(()),
        }
    }

    /// The host takes a task back, either out of a DSQ or while merely
    /// runnable (for example, a task that goes to sleep before being
    /// queued).
    pub fn dequeue(&self, cpu: CpuId, task: TaskId, deq_flags: DeqFlags) -> Result<()> {
        self.ensure_enabled()?;
        let entry = self.entry(task)?;
        let was_queued = self.with_task_locked(&entry, |g, tsr| match (tsr.state, g) {
            (TaskState::Queued, Some(g)) => {
                g.unlink(tsr);
                tsr.state = TaskState::Runnable;
                tsr.flags.insert(TaskFlags::DEQUEUED_EXTERNAL);
                entry.ops_state.store(OpsStateVal::NONE);
                Ok(true)
            }
            (TaskState::Runnable, _) => Ok(false),
            (TaskState::Exited, _) => Err(ScxError::UnknownTask(task)),
            (state, _) => Err(ScxError::BadState {
                task,
                state,
                op: "dequeue",
            }),
        })?;

        if was_queued {
            let ops = Ops::new(self, cpu, OpsContext::Dequeue, Some(task));
            self.policy.dequeue(&ops, task, deq_flags);
        }
        if deq_flags.contains(DeqFlags::SLEEP) {
            self.quiesce(cpu, &entry, deq_flags);
        }
        debug!(task = task.0, was_queued, ?deq_flags, "dequeue");
        Ok(())
    }

    /// `cpu`'s local DSQ ran dry. Pulls from the global DSQ first and asks
    /// the policy only if that yields nothing. Returns whether the local
    /// DSQ has a task to pick.
    pub fn dispatch(&self, cpu: CpuId, prev: Option<TaskId>) -> Result<bool> {
        self.ensure_enabled()?;
        self.check_online(cpu)?;
        let local = self.target_dsq(DsqId::local_on(cpu))?;
        if local.nr() == 0 {
            self.move_to_local(cpu, DsqId::GLOBAL)?;
        }
        if local.nr() == 0 {
            let ops = Ops::new(self, cpu, OpsContext::Dispatch, None);
            if let Err(e) = self.policy.dispatch(&ops, cpu, prev) {
                warn!(cpu = cpu.0, %e, "dispatch failed");
            }
            self.ensure_enabled()?;
        }
        Ok(local.nr() > 0)
    }

    /// Take the head of `cpu`'s local DSQ and make it the running task.
    ///
    /// A head task that may no longer run on `cpu` is bounced to the global
    /// DSQ and the pick retries. `set_cpumask`, `dsq_insert` and `dsq_move`
    /// already keep such tasks out of local DSQs under the same locks, so
    /// the bounce is a backstop that no caller is expected to reach. `None`
    /// means the local DSQ holds nothing runnable here and the CPU goes
    /// idle.
    pub fn pick_task(&self, cpu: CpuId) -> Result<Option<TaskId>> {
        self.ensure_enabled()?;
        let slot = self.check_online(cpu)?;
        let local_id = DsqId::local_on(cpu);
        loop {
            let dsq = self.target_dsq(local_id)?;
            let mut g = dsq.lock();
            if g.is_destroyed() {
                continue;
            }
            let Some(id) = g.first() else {
                drop(g);
                slot.idle.store(true, Ordering::Release);
                trace!(cpu = cpu.0, "pick_task: idle");
                return Ok(None);
            };
            let Some(entry) = self.find_task(id) else {
                drop(g);
                return Err(self.fatal(format!("task {id} queued on {local_id} is not tracked")));
            };
            let mut tsr = entry.tsr.lock();
            let dispatching = OpsStateVal::new(QOp::Dispatching, cpu, self.next_qseq());
            if let Err(seen) = entry.ops_state.transition(&[QOp::Queued], dispatching) {
                drop(tsr);
                drop(g);
                return Err(self.fatal(format!(
                    "pick of task {} on cpu {} found ops_state {:?}",
                    id, cpu, seen.op
                )));
            }
            g.unlink(&mut tsr);

            if !tsr.can_run_on(cpu) {
                tsr.state = TaskState::Runnable;
                entry.ops_state.store(OpsStateVal::NONE);
                drop(tsr);
                drop(g);
                self.events.inc(Event::PickAffinityBounce);
                debug!(task = id.0, cpu = cpu.0, "pick_task: bounced to global");
                self.insert(
                    cpu,
                    id,
                    DsqId::GLOBAL,
                    0,
                    InsertKey::Fifo,
                    EnqFlags::empty(),
                    QOp::None,
                )?;
                continue;
            }

            tsr.state = TaskState::Running;
            tsr.holding_cpu = Some(cpu);
            tsr.sticky_cpu = None;
            entry.ops_state.store(OpsStateVal::NONE);
            let slice = tsr.slice_ns;
            drop(tsr);
            drop(g);

            {
                let mut st = slot.state.lock();
                st.current = Some(id);
                st.last_pick_seq += 1;
            }
            slot.idle.store(false, Ordering::Release);
            debug!(task = id.0, cpu = cpu.0, slice = %FmtN(slice), "pick_task");

            let ops = Ops::new(self, cpu, OpsContext::Running, Some(id));
            self.policy.running(&ops, id);
            return Ok(Some(id));
        }
    }

    /// Charge `delta` ns to the running task. Returns true once its slice
    /// is exhausted; the next enqueue then carries `EnqFlags::SLICE_EXPIRED`.
    pub fn tick(&self, cpu: CpuId, task: TaskId, delta: TimeNs) -> Result<bool> {
        self.ensure_enabled()?;
        let entry = self.entry(task)?;
        {
            let mut tsr = entry.tsr.lock();
            if tsr.state != TaskState::Running || tsr.holding_cpu != Some(cpu) {
                return Err(ScxError::BadState {
                    task,
                    state: tsr.state,
                    op: "tick",
                });
            }
            tsr.slice_ns = tsr.slice_ns.saturating_sub(delta);
        }

        let ops = Ops::new(self, cpu, OpsContext::Tick, Some(task));
        self.policy.tick(&ops, task);

        let mut tsr = entry.tsr.lock();
        if tsr.slice_ns == 0 {
            tsr.flags.insert(TaskFlags::ENQ_PREEMPT);
            trace!(task = task.0, cpu = cpu.0, "slice expired");
            return Ok(true);
        }
        Ok(false)
    }

    /// The running task leaves `cpu`. Returns the state the task ends up
    /// in: `Queued` if the policy re-inserted it from `stopping`, which
    /// means the host must not enqueue it again.
    pub fn stop(&self, cpu: CpuId, task: TaskId, runnable: bool) -> Result<TaskState> {
        self.ensure_enabled()?;
        self.slot(cpu)?;
        let entry = self.entry(task)?;
        {
            let mut tsr = entry.tsr.lock();
            if tsr.state != TaskState::Running {
                return Err(ScxError::BadState {
                    task,
                    state: tsr.state,
                    op: "stop",
                });
            }
            tsr.state = TaskState::Stopping;
            tsr.holding_cpu = None;
            tsr.last_cpu = Some(cpu);
        }
        self.clear_current(cpu, task);

        let ops = Ops::new(self, cpu, OpsContext::Stopping, Some(task));
        self.policy.stopping(&ops, task, runnable);

        let state = {
            let mut tsr = entry.tsr.lock();
            if tsr.state == TaskState::Stopping {
                tsr.state = TaskState::Runnable;
            }
            tsr.state
        };
        if !runnable {
            self.quiesce(cpu, &entry, DeqFlags::SLEEP);
        }
        debug!(task = task.0, cpu = cpu.0, runnable, ?state, "stop");
        Ok(state)
    }

    /// The task is going away. Removes it from any DSQ and releases it.
    pub fn exit_task(&self, task: TaskId) -> Result<()> {
        self.ensure_enabled()?;
        let entry = self.entry(task)?;
        let (holding, enabled) = self.with_task_locked(&entry, |g, tsr| {
            if tsr.state == TaskState::Exited {
                return Err(ScxError::UnknownTask(task));
            }
            if let Some(g) = g {
                g.unlink(tsr);
            }
            entry.ops_state.store(OpsStateVal::NONE);
            tsr.state = TaskState::Exited;
            tsr.ddsp = None;
            let enabled = tsr.flags.contains(TaskFlags::ENABLED);
            tsr.flags.remove(TaskFlags::ENABLED | TaskFlags::RUNNABLE);
            Ok((tsr.holding_cpu.take(), enabled))
        })?;

        if let Some(cpu) = holding {
            self.clear_current(cpu, task);
        }
        if enabled {
            let ops = Ops::new(self, CpuId(0), OpsContext::Disable, Some(task));
            self.policy.disable(&ops, task);
        }
        let ops = Ops::new(self, CpuId(0), OpsContext::ExitTask, Some(task));
        self.policy.exit_task(&ops, task);

        self.tasks.write().remove(&task);
        debug!(task = task.0, "exit_task");
        Ok(())
    }

    pub fn set_weight(&self, task: TaskId, weight: Weight) -> Result<()> {
        self.ensure_enabled()?;
        let entry = self.entry(task)?;
        let weight = weight.clamp(WEIGHT_MIN, WEIGHT_MAX);
        {
            let mut tsr = entry.tsr.lock();
            if tsr.state == TaskState::Exited {
                return Err(ScxError::UnknownTask(task));
            }
            tsr.weight = weight;
        }
        let ops = Ops::new(self, CpuId(0), OpsContext::SetWeight, Some(task));
        self.policy.set_weight(&ops, task, weight);
        Ok(())
    }

    /// Change a task's affinity. A task sitting on the local DSQ of a CPU
    /// it may no longer use is moved to the global DSQ.
    pub fn set_cpumask(&self, task: TaskId, cpumask: &Cpumask) -> Result<()> {
        self.ensure_enabled()?;
        self.check_cpumask(cpumask)?;
        let entry = self.entry(task)?;
        let evicted = self.with_task_locked(&entry, |g, tsr| {
            if tsr.state == TaskState::Exited {
                return Err(ScxError::UnknownTask(task));
            }
            tsr.allowed_cpus = cpumask.clone();
            if let Some(g) = g {
                if let DsqKind::Local(cpu) = g.id().kind() {
                    if !tsr.can_run_on(cpu) {
                        g.unlink(tsr);
                        tsr.state = TaskState::Runnable;
                        entry.ops_state.store(OpsStateVal::NONE);
                        return Ok(Some(cpu));
                    }
                }
            }
            Ok(None)
        })?;

        if let Some(cpu) = evicted {
            debug!(task = task.0, cpu = cpu.0, "set_cpumask: evicted from local dsq");
            self.requeue_global(cpu, &[task]);
        }
        let ops = Ops::new(self, CpuId(0), OpsContext::SetCpumask, Some(task));
        self.policy.set_cpumask(&ops, task, cpumask);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // CPU callbacks
    // ---------------------------------------------------------------------

    /// Hot-plug: give `cpu` a fresh local DSQ.
    pub fn cpu_online(&self, cpu: CpuId) -> Result<()> {
        self.ensure_enabled()?;
        let slot = self.slot(cpu)?;
        if slot.online.load(Ordering::Acquire) {
            return Ok(());
        }
        self.create_dsq(DsqId::local_on(cpu), DsqOrder::Fifo)?;
        slot.idle.store(true, Ordering::Release);
        slot.online.store(true, Ordering::Release);

        let ops = Ops::new(self, cpu, OpsContext::CpuOnline, None);
        self.policy.cpu_online(&ops, cpu);
        info!(cpu = cpu.0, "cpu online");
        Ok(())
    }

    /// Hot-unplug: destroy `cpu`'s local DSQ, requeueing its tasks to the
    /// global DSQ in order.
    pub fn cpu_offline(&self, cpu: CpuId) -> Result<()> {
        self.ensure_enabled()?;
        let slot = self.check_online(cpu)?;

        // Last chance for the policy to move the local DSQ elsewhere.
        let ops = Ops::new(self, cpu, OpsContext::CpuRelease, None);
        self.policy.cpu_release(&ops, cpu, CpuReleaseReason::Offline);
        self.ensure_enabled()?;

        slot.online.store(false, Ordering::Release);
        slot.idle.store(false, Ordering::Release);
        self.dsq_destroy(DsqId::local_on(cpu), DestroyMode::Shutdown)?;

        let ops = Ops::new(self, cpu, OpsContext::CpuOffline, None);
        self.policy.cpu_offline(&ops, cpu);
        info!(cpu = cpu.0, "cpu offline");
        Ok(())
    }

    pub fn cpu_acquire(&self, cpu: CpuId) -> Result<()> {
        self.ensure_enabled()?;
        self.check_online(cpu)?;
        let ops = Ops::new(self, cpu, OpsContext::CpuAcquire, None);
        self.policy.cpu_acquire(&ops, cpu);
        Ok(())
    }

    /// A higher priority class took `cpu`. The policy may call
    /// [`Ops::reenqueue_local`] to hand the local DSQ's tasks elsewhere.
    pub fn cpu_release(&self, cpu: CpuId, reason: CpuReleaseReason) -> Result<()> {
        self.ensure_enabled()?;
        self.check_online(cpu)?;
        let ops = Ops::new(self, cpu, OpsContext::CpuRelease, None);
        self.policy.cpu_release(&ops, cpu, reason);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Invariants
    // ---------------------------------------------------------------------

    /// Check the cross-structure invariants. Only meaningful at a quiescent
    /// point, when no callback is in flight.
    pub fn check_invariants(&self) -> anyhow::Result<()> {
        let dsqs: Vec<Arc<Dsq>> = self.dsqs.read().values().cloned().collect();
        let mut membership: HashMap<TaskId, DsqId> = HashMap::new();

        for dsq in &dsqs {
            let g = dsq.lock();
            g.check_counts().map_err(anyhow::Error::msg)?;
            let mut prev_vtime: Option<Vtime> = None;
            for id in g.members() {
                if let Some(other) = membership.insert(id, g.id()) {
                    bail!("task {} is in both {} and {}", id, other, g.id());
                }
                let Some(entry) = self.find_task(id) else {
                    bail!("dsq {} holds untracked task {}", g.id(), id);
                };
                let tsr = entry.tsr.lock();
                if tsr.state != TaskState::Queued || tsr.dsq_ref != Some(g.id()) {
                    bail!(
                        "task {} in dsq {} is {:?} with dsq_ref {:?}",
                        id,
                        g.id(),
                        tsr.state,
                        tsr.dsq_ref
                    );
                }
                if let DsqKind::Local(cpu) = g.id().kind() {
                    if !tsr.can_run_on(cpu) {
                        bail!("task {} sits on {} outside its cpumask", id, g.id());
                    }
                }
                if g.order() == DsqOrder::Priority {
                    if let Some(prev) = prev_vtime {
                        if tsr.vtime < prev {
                            bail!(
                                "dsq {} out of order: task {} vtime {} after {}",
                                g.id(),
                                id,
                                tsr.vtime,
                                prev
                            );
                        }
                    }
                    prev_vtime = Some(tsr.vtime);
                }
            }
        }

        let tasks: Vec<Arc<TaskEntry>> = self.tasks.read().values().cloned().collect();
        for entry in &tasks {
            let tsr = entry.tsr.lock();
            let queued = tsr.is_queued();
            match (queued, tsr.dsq_ref, membership.get(&entry.id)) {
                (true, Some(d), Some(&m)) if d == m => {}
                (false, None, None) => {}
                (_, dsq_ref, found) => bail!(
                    "task {} is {:?} with dsq_ref {:?} but found in {:?}",
                    entry.id,
                    tsr.state,
                    dsq_ref,
                    found
                ),
            }
            let op = entry.ops_state.load().op;
            if queued != (op == QOp::Queued) {
                bail!("task {} is {:?} but ops_state is {:?}", entry.id, tsr.state, op);
            }
        }
        Ok(())
    }
}
