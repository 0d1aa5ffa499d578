//! scx_core - Dispatch-queue engine and callback protocol for sched_ext
//! schedulers.
//!
//! The core owns every runnable task's scheduling state and moves tasks
//! between dispatch queues (DSQs) on behalf of a pluggable policy, while a
//! host runtime drives it from many CPUs at once.
//!
//! # Architecture
//!
//! - **Core** ([`ScxCore`]): task and DSQ tables, per-CPU state, and the
//!   callbacks the host invokes (`enqueue`, `dispatch`, `pick_task`, ...)
//! - **DSQs**: per-CPU local queues, the global queue, and named queues
//!   created by the policy, each FIFO or vtime-ordered
//! - **Policy** ([`Policy`]): the scheduler proper, a set of optional
//!   callbacks that move tasks through [`Ops`]
//! - **Host** ([`Host`]): clock, CPU kicks and idle state provided by the
//!   runtime
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use scx_core::*;
//!
//! let host = Arc::new(ManualHost::new());
//! let core = ScxCore::new(SchedConfig::with_cpus(2), ScxSimple::fifo(), host).unwrap();
//! core.init().unwrap();
//!
//! let task = TaskId(1);
//! core.init_task(task, &InitTaskArgs::new(2)).unwrap();
//! core.enable(task).unwrap();
//! core.enqueue(CpuId(0), task, EnqFlags::WAKEUP).unwrap();
//!
//! assert!(core.dispatch(CpuId(0), None).unwrap());
//! assert_eq!(core.pick_task(CpuId(0)).unwrap(), Some(task));
//! assert!(core.exit().report().is_ok());
//! ```

pub mod config;
pub mod cpumask;
pub mod dsq;
pub mod error;
pub mod events;
pub mod exit;
pub mod fmt;
pub mod host;
pub mod ops;
pub mod policies;
pub mod policy;
pub mod scheduler;
pub mod task;
pub mod types;

pub use config::{NamedDsq, SchedConfig, SLICE_DFL_NS};
pub use cpumask::Cpumask;
pub use dsq::DsqSnapshot;
pub use error::{Result, ScxError};
pub use events::ScxEventStats;
pub use exit::{ExitInfo, ExitKind};
pub use fmt::{FmtN, ScxFormat};
pub use host::{Host, ManualHost};
pub use ops::{Ops, OpsContext};
pub use policies::ScxSimple;
pub use policy::{DefaultPolicy, InitTaskArgs, Policy};
pub use scheduler::{CpuSnapshot, DestroyMode, ScxCore};
pub use task::{OpsStateVal, QOp, TaskSnapshot, TaskState};
pub use types::{
    CpuId, CpuReleaseReason, DeqFlags, DsqId, DsqKind, DsqOrder, EnqFlags, KickFlags,
    PriorityTiebreak, TaskFlags, TaskId, TimeNs, Vtime, WakeFlags, Weight,
};
