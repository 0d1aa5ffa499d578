//! Error kinds returned by the scheduling core.
//!
//! Per-task and per-DSQ failures are recoverable and leave the core
//! unchanged. `ProtocolViolation` is the exception: whoever observes it
//! disables the scheduler.

use thiserror::Error;

use crate::task::TaskState;
use crate::types::{CpuId, DsqId, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScxError {
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("task {task} is {state:?}, cannot {op}")]
    BadState {
        task: TaskId,
        state: TaskState,
        op: &'static str,
    },

    #[error("bad cpu {cpu}: {reason}")]
    BadCpu { cpu: CpuId, reason: &'static str },

    #[error("dsq {0} already exists with a different order")]
    DuplicateDsq(DsqId),

    #[error("unknown dsq {0}")]
    UnknownDsq(DsqId),

    #[error("dsq {id} still holds {nr} tasks")]
    DsqNotEmpty { id: DsqId, nr: u32 },

    #[error("dsq {0} is built-in")]
    BuiltinDsq(DsqId),

    #[error("dsq {0} does not support this ordering")]
    WrongOrder(DsqId),

    #[error("{what} table is full ({limit} entries)")]
    OutOfMemory { what: &'static str, limit: usize },

    #[error("{op} is not allowed from {context}")]
    NotAllowed {
        op: &'static str,
        context: &'static str,
    },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("scheduler is disabled")]
    Disabled,
}

impl ScxError {
    /// Whether this error must take the whole scheduler down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScxError::ProtocolViolation(_))
    }

    pub(crate) fn bad_cpu(cpu: CpuId, reason: &'static str) -> Self {
        ScxError::BadCpu { cpu, reason }
    }
}

pub type Result<T> = std::result::Result<T, ScxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let e = ScxError::BadState {
            task: TaskId(7),
            state: TaskState::Queued,
            op: "dsq_insert",
        };
        assert_eq!(e.to_string(), "task 7 is Queued, cannot dsq_insert");

        let e = ScxError::DsqNotEmpty {
            id: DsqId::GLOBAL,
            nr: 3,
        };
        assert_eq!(e.to_string(), "dsq GLOBAL still holds 3 tasks");
    }

    #[test]
    fn test_only_protocol_violation_is_fatal() {
        assert!(ScxError::ProtocolViolation("x".into()).is_fatal());
        assert!(!ScxError::UnknownTask(TaskId(1)).is_fatal());
        assert!(!ScxError::bad_cpu(CpuId(0), "offline").is_fatal());
    }
}
