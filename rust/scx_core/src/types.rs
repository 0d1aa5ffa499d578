//! Newtype wrappers, flag sets and type aliases for domain concepts.
//!
//! Newtypes for identifiers (DSQ IDs, task handles, CPU IDs) and virtual
//! time prevent silent type confusion. The DSQ id bit layout is shared with
//! existing sched_ext policies that embed these ids in their own data, so
//! the constants here must stay bit-for-bit identical to the kernel's.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::fmt::FmtN;

/// Dispatch queue identifier. Wraps u64 with kernel bit-flag conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DsqId(pub u64);

/// Opaque task handle supplied by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TaskId(pub u64);

/// CPU identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CpuId(pub u32);

/// Decoded form of a [`DsqId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsqKind {
    /// `SCX_DSQ_LOCAL_ON | cpu`: the local DSQ of a specific CPU.
    Local(CpuId),
    /// `SCX_DSQ_LOCAL`: the local DSQ of whichever CPU the callback resolves to.
    LocalCurrent,
    /// `SCX_DSQ_GLOBAL`.
    Global,
    /// A user-allocated DSQ.
    Named(u64),
    /// A built-in id with no meaning (including `SCX_DSQ_INVALID`).
    Invalid,
}

impl DsqId {
    pub const FLAG_BUILTIN: u64 = 1u64 << 63;
    pub const FLAG_LOCAL_ON: u64 = 1u64 << 62;
    pub const INVALID: DsqId = DsqId(Self::FLAG_BUILTIN);
    pub const GLOBAL: DsqId = DsqId(Self::FLAG_BUILTIN | 1);
    pub const LOCAL: DsqId = DsqId(Self::FLAG_BUILTIN | 2);
    pub const LOCAL_ON_MASK: u64 = 0xC000000000000000;
    pub const LOCAL_CPU_MASK: u64 = 0x00000000FFFFFFFF;

    /// The local DSQ id of `cpu`.
    pub const fn local_on(cpu: CpuId) -> DsqId {
        DsqId(Self::LOCAL_ON_MASK | cpu.0 as u64)
    }

    /// A user DSQ id. Returns `None` if `id` collides with the built-in
    /// flag.
    pub const fn named(id: u64) -> Option<DsqId> {
        if id & Self::FLAG_BUILTIN != 0 {
            None
        } else {
            Some(DsqId(id))
        }
    }

    pub fn is_local(self) -> bool {
        self == Self::LOCAL
    }

    pub fn is_local_on(self) -> bool {
        self.0 & Self::LOCAL_ON_MASK == Self::LOCAL_ON_MASK
    }

    /// Whether this is a built-in DSQ (LOCAL, GLOBAL, or LOCAL_ON).
    /// Built-in DSQs are always FIFO.
    pub fn is_builtin(self) -> bool {
        self.0 & Self::FLAG_BUILTIN != 0
    }

    pub fn local_on_cpu(self) -> CpuId {
        CpuId((self.0 & Self::LOCAL_CPU_MASK) as u32)
    }

    pub fn kind(self) -> DsqKind {
        if !self.is_builtin() {
            DsqKind::Named(self.0)
        } else if self.is_local_on() {
            DsqKind::Local(self.local_on_cpu())
        } else if self == Self::GLOBAL {
            DsqKind::Global
        } else if self == Self::LOCAL {
            DsqKind::LocalCurrent
        } else {
            DsqKind::Invalid
        }
    }
}

impl fmt::Display for DsqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            DsqKind::Local(cpu) => write!(f, "LOCAL_ON({})", cpu.0),
            DsqKind::LocalCurrent => f.write_str("LOCAL"),
            DsqKind::Global => f.write_str("GLOBAL"),
            DsqKind::Named(id) => write!(f, "{id:#x}"),
            DsqKind::Invalid => write!(f, "INVALID({:#x})", self.0),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic time in nanoseconds.
pub type TimeNs = u64;

/// Task weight in cgroup-weight space (100 is nice 0).
pub type Weight = u32;

/// Virtual time: an opaque 64-bit priority key, smaller runs earlier.
///
/// Unlike the kernel's `time_before64()`, ordering here is the plain
/// unsigned order so that it stays a total order inside the priority tree.
/// Use [`Vtime::before`] when wrap-around tolerant comparison is wanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Vtime(pub u64);

impl Vtime {
    /// Wrapping comparison: `(s64)(self - other) < 0`.
    pub fn before(self, other: Vtime) -> bool {
        (self.0.wrapping_sub(other.0) as i64) < 0
    }
}

impl fmt::Display for Vtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", FmtN(self.0))
    }
}

/// Ordering discipline of a DSQ, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DsqOrder {
    #[default]
    Fifo,
    /// Ordered by ascending `(vtime, seq)`.
    Priority,
}

/// How equal vtimes are ordered in a priority DSQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PriorityTiebreak {
    #[default]
    FifoOnEqual,
    LifoOnEqual,
}

bitflags! {
    /// Flags passed to `enqueue` and `dsq_insert` (`SCX_ENQ_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EnqFlags: u64 {
        const WAKEUP = 1 << 0;
        const HEAD = 1 << 4;
        const CPU_SELECTED = 1 << 10;
        const PREEMPT = 1 << 32;
        const REENQ = 1 << 40;
        const LAST = 1 << 41;
        /// Set by the core on the first enqueue after the task used up its
        /// slice. Unlike `PREEMPT`, it does not touch the target CPU.
        const SLICE_EXPIRED = 1 << 42;
    }
}

bitflags! {
    /// Flags passed to `dequeue` (`SCX_DEQ_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeqFlags: u64 {
        const SLEEP = 1 << 0;
        const SAVE = 1 << 1;
    }
}

bitflags! {
    /// Wakeup flags passed to `select_cpu` (`SCX_WAKE_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WakeFlags: u64 {
        const EXEC = 0x02;
        const FORK = 0x04;
        const TTWU = 0x08;
        const SYNC = 0x10;
    }
}

bitflags! {
    /// Flags for `kick_cpu` (`SCX_KICK_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct KickFlags: u64 {
        const IDLE = 1 << 0;
        const PREEMPT = 1 << 1;
        const WAIT = 1 << 2;
    }
}

bitflags! {
    /// Per-task flags kept in the task state record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TaskFlags: u32 {
        /// Direct dispatch armed by `select_cpu`.
        const DDSP = 1 << 0;
        /// Last removal from a DSQ came from the host, not from a pick.
        const DEQUEUED_EXTERNAL = 1 << 1;
        /// Slice ran out; the next enqueue carries `EnqFlags::SLICE_EXPIRED`.
        const ENQ_PREEMPT = 1 << 2;
        /// `enable` has run and `disable` has not.
        const ENABLED = 1 << 3;
        /// The host considers the task runnable (between `runnable` and
        /// `quiescent`).
        const RUNNABLE = 1 << 4;
    }
}

/// Why a CPU was taken away from the scheduler (`cpu_release`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuReleaseReason {
    /// A higher priority scheduling class took the CPU.
    Preempted,
    /// The CPU is going offline.
    Offline,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dsq_id_bit_layout() {
        assert_eq!(DsqId::GLOBAL.0, 0x8000_0000_0000_0001);
        assert_eq!(DsqId::LOCAL.0, 0x8000_0000_0000_0002);
        assert_eq!(DsqId::local_on(CpuId(5)).0, 0xC000_0000_0000_0005);
        assert_eq!(DsqId::local_on(CpuId(5)).kind(), DsqKind::Local(CpuId(5)));
        assert_eq!(DsqId::GLOBAL.kind(), DsqKind::Global);
        assert_eq!(DsqId::LOCAL.kind(), DsqKind::LocalCurrent);
        assert_eq!(DsqId::INVALID.kind(), DsqKind::Invalid);
        assert_eq!(DsqId(42).kind(), DsqKind::Named(42));
        // Bit 62 alone does not make an id built-in.
        assert_eq!(DsqId(1 << 62).kind(), DsqKind::Named(1 << 62));
    }

    #[test]
    fn test_named_rejects_builtin_flag() {
        assert_eq!(DsqId::named(7), Some(DsqId(7)));
        assert_eq!(DsqId::named(DsqId::FLAG_BUILTIN | 7), None);
    }

    #[test]
    fn test_vtime_before_wraps() {
        assert!(Vtime(1).before(Vtime(2)));
        assert!(Vtime(u64::MAX).before(Vtime(0)));
        assert!(!Vtime(0).before(Vtime(u64::MAX)));
        // The Ord impl stays the plain unsigned order.
        assert!(Vtime(u64::MAX) > Vtime(0));
    }

    #[test]
    fn test_display() {
        assert_eq!(DsqId::GLOBAL.to_string(), "GLOBAL");
        assert_eq!(DsqId::local_on(CpuId(3)).to_string(), "LOCAL_ON(3)");
        assert_eq!(DsqId(16).to_string(), "0x10");
        assert_eq!(Vtime(20_000_000).to_string(), "20M");
    }
}
