//! Task State Record (TSR) and the packed `ops_state` word.
//!
//! A TSR is owned by the core and addressed by [`TaskId`]. Its mutable
//! fields sit behind a per-task mutex that always nests inside the lock of
//! the DSQ holding the task. The `ops_state` atomic lives next to the mutex
//! and is the only part of a task that is touched without a lock: the
//! enqueue path claims a task with a single CAS before any DSQ is locked.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::cpumask::Cpumask;
use crate::dsq::DsqNode;
use crate::fmt::fmt_grouped;
use crate::types::{CpuId, DsqId, EnqFlags, TaskFlags, TaskId, TimeNs, Vtime, Weight};

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Passed through `init_task`, not yet enabled.
    Fresh,
    /// Eligible to run but not in any DSQ.
    Runnable,
    /// Sitting in exactly one DSQ.
    Queued,
    /// Picked by a CPU and executing.
    Running,
    /// Inside the `stopping` callback after leaving a CPU.
    Stopping,
    /// Gone. Never observable through the task table.
    Exited,
}

/// The operation field of `ops_state` (`SCX_OPSS_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QOp {
    None = 0,
    Queueing = 1,
    Queued = 2,
    Dispatching = 3,
}

impl QOp {
    fn from_bits(bits: u32) -> QOp {
        match bits {
            1 => QOp::Queueing,
            2 => QOp::Queued,
            3 => QOp::Dispatching,
            _ => QOp::None,
        }
    }
}

/// Decoded `ops_state`: `{ QSEQ:21 | QCPU:8 | QOP:3 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpsStateVal {
    pub op: QOp,
    pub cpu: u32,
    pub seq: u32,
}

impl OpsStateVal {
    pub const NONE: OpsStateVal = OpsStateVal {
        op: QOp::None,
        cpu: 0,
        seq: 0,
    };

    pub fn new(op: QOp, cpu: CpuId, seq: u32) -> Self {
        OpsStateVal {
            op,
            cpu: cpu.0 & OpsState::QCPU_MASK,
            seq: seq & OpsState::QSEQ_MASK,
        }
    }

    fn pack(self) -> u32 {
        (self.seq << OpsState::QSEQ_SHIFT)
            | ((self.cpu & OpsState::QCPU_MASK) << OpsState::QCPU_SHIFT)
            | self.op as u32
    }

    fn unpack(raw: u32) -> Self {
        OpsStateVal {
            op: QOp::from_bits(raw & OpsState::QOP_MASK),
            cpu: (raw >> OpsState::QCPU_SHIFT) & OpsState::QCPU_MASK,
            seq: raw >> OpsState::QSEQ_SHIFT,
        }
    }
}

/// Per-task in-flight marker for the callback protocol.
#[derive(Debug, Default)]
pub struct OpsState(AtomicU32);

impl OpsState {
    const QOP_BITS: u32 = 3;
    const QCPU_BITS: u32 = 8;
    const QOP_MASK: u32 = (1 << Self::QOP_BITS) - 1;
    const QCPU_SHIFT: u32 = Self::QOP_BITS;
    const QCPU_MASK: u32 = (1 << Self::QCPU_BITS) - 1;
    const QSEQ_SHIFT: u32 = Self::QOP_BITS + Self::QCPU_BITS;
    pub const QSEQ_MASK: u32 = (1 << (32 - Self::QSEQ_SHIFT)) - 1;

    /// Largest CPU count the QCPU field can name.
    pub const MAX_CPUS: u32 = 1 << Self::QCPU_BITS;

    pub fn load(&self) -> OpsStateVal {
        OpsStateVal::unpack(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, val: OpsStateVal) {
        self.0.store(val.pack(), Ordering::Release);
    }

    /// Move from an op in `from` to `to`.
    ///
    /// A CAS failure where the op still matches (only QSEQ/QCPU moved on)
    /// is retried. Returns the observed value if the op does not match.
    pub fn transition(&self, from: &[QOp], to: OpsStateVal) -> Result<OpsStateVal, OpsStateVal> {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            let val = OpsStateVal::unpack(cur);
            if !from.contains(&val.op) {
                return Err(val);
            }
            match self
                .0
                .compare_exchange_weak(cur, to.pack(), Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(val),
                Err(actual) => cur = actual,
            }
        }
    }
}

/// The core's per-task descriptor.
#[derive(Debug, Clone)]
pub struct Tsr {
    pub id: TaskId,
    pub state: TaskState,
    pub dsq_ref: Option<DsqId>,
    pub(crate) node: Option<DsqNode>,
    pub seq: u32,
    pub slice_ns: TimeNs,
    pub vtime: Vtime,
    pub flags: TaskFlags,
    pub allowed_cpus: Cpumask,
    pub sticky_cpu: Option<CpuId>,
    pub holding_cpu: Option<CpuId>,
    /// Direct dispatch target armed during `select_cpu`.
    pub ddsp: Option<(DsqId, EnqFlags)>,
    pub weight: Weight,
    pub last_cpu: Option<CpuId>,
}

impl Tsr {
    pub fn new(id: TaskId, allowed_cpus: Cpumask, weight: Weight) -> Self {
        Tsr {
            id,
            state: TaskState::Fresh,
            dsq_ref: None,
            node: None,
            seq: 0,
            slice_ns: 0,
            vtime: Vtime(0),
            flags: TaskFlags::empty(),
            allowed_cpus,
            sticky_cpu: None,
            holding_cpu: None,
            ddsp: None,
            weight,
            last_cpu: None,
        }
    }

    pub fn is_queued(&self) -> bool {
        self.state == TaskState::Queued
    }

    pub fn can_run_on(&self, cpu: CpuId) -> bool {
        self.allowed_cpus.test_cpu(cpu.0 as usize)
    }
}

/// A table entry: the lockless `ops_state` beside the locked record.
#[derive(Debug)]
pub(crate) struct TaskEntry {
    pub id: TaskId,
    pub ops_state: OpsState,
    pub tsr: Mutex<Tsr>,
}

impl TaskEntry {
    pub fn new(tsr: Tsr) -> Self {
        TaskEntry {
            id: tsr.id,
            ops_state: OpsState::default(),
            tsr: Mutex::new(tsr),
        }
    }
}

/// Read-only copy of a TSR handed to policies and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub state: TaskState,
    pub dsq: Option<DsqId>,
    pub seq: u32,
    pub slice_ns: TimeNs,
    pub vtime: Vtime,
    pub flags: TaskFlags,
    pub allowed_cpus: Cpumask,
    pub sticky_cpu: Option<CpuId>,
    pub holding_cpu: Option<CpuId>,
    pub weight: Weight,
    pub last_cpu: Option<CpuId>,
    pub ops_state: OpsStateVal,
}

impl TaskSnapshot {
    pub(crate) fn new(tsr: &Tsr, ops_state: OpsStateVal) -> Self {
        TaskSnapshot {
            id: tsr.id,
            state: tsr.state,
            dsq: tsr.dsq_ref,
            seq: tsr.seq,
            slice_ns: tsr.slice_ns,
            vtime: tsr.vtime,
            flags: tsr.flags,
            allowed_cpus: tsr.allowed_cpus.clone(),
            sticky_cpu: tsr.sticky_cpu,
            holding_cpu: tsr.holding_cpu,
            weight: tsr.weight,
            last_cpu: tsr.last_cpu,
            ops_state,
        }
    }
}

impl fmt::Display for TaskSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task {} {:?} slice={} vtime={} cpus={}",
            self.id,
            self.state,
            fmt_grouped(self.slice_ns),
            self.vtime,
            self.allowed_cpus
        )?;
        if let Some(dsq) = self.dsq {
            write!(f, " dsq={dsq}")?;
        }
        Ok(())
    }
}
