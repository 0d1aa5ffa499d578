//! Exit information recorded when the scheduler goes away.

use std::fmt;

use anyhow::bail;
use anyhow::Result;

/// Why the scheduler exited (`SCX_EXIT_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExitKind {
    /// Orderly unload.
    Done,
    /// Unregistered by the host.
    Unreg,
    /// A core-detected protocol violation or failed load.
    Error,
    /// The policy called `Ops::error`.
    ErrorPolicy,
}

/// Counterpart of `scx_exit_info`: recorded exactly once per lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub kind: ExitKind,
    pub reason: String,
    pub msg: Option<String>,
}

impl ExitInfo {
    pub fn new(kind: ExitKind, reason: impl Into<String>, msg: Option<String>) -> Self {
        ExitInfo {
            kind,
            reason: reason.into(),
            msg: msg.filter(|s| !s.is_empty()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind >= ExitKind::Error
    }

    /// Ok after a normal exit. After an error exit, returns an error
    /// carrying the exit message instead.
    pub fn report(&self) -> Result<()> {
        if self.is_error() {
            bail!("{}", self);
        }
        Ok(())
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.msg {
            Some(msg) => write!(f, "EXIT: {} ({})", self.reason, msg),
            None => write!(f, "EXIT: {}", self.reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report() {
        let done = ExitInfo::new(ExitKind::Done, "unloaded", None);
        assert!(done.report().is_ok());
        assert_eq!(done.to_string(), "EXIT: unloaded");

        let err = ExitInfo::new(
            ExitKind::Error,
            "runtime error",
            Some("enqueue of task 3 inserted nothing".into()),
        );
        let e = err.report().unwrap_err();
        assert_eq!(
            e.to_string(),
            "EXIT: runtime error (enqueue of task 3 inserted nothing)"
        );
    }

    #[test]
    fn test_empty_msg_is_dropped() {
        let info = ExitInfo::new(ExitKind::Unreg, "unregistered", Some(String::new()));
        assert_eq!(info.msg, None);
        assert!(!info.is_error());
    }
}
