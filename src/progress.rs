//! Progress contract, stage records & cooperative cancellation
//!
//! The pipeline reports through a single [`ProgressSink`] trait; a no-op
//! default is provided for callers that do not care. Long-running stages
//! accept a [`CancelToken`] and check it between stages and table entries;
//! cancellation is terminal and discards partial results.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::expr::Expr;

/// Severity of a pipeline warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Callbacks the core invokes between phases. All methods default to no-ops
/// so implementors override only what they need.
pub trait ProgressSink {
    fn phase_started(&self, _phase: &str) {}
    fn phase_completed(&self, _phase: &str) {}
    fn recurrence_detected(&self, _digest: &str) {}
    fn recurrence_solved(&self, _digest: &str, _solution: &str) {}
    fn warning(&self, _severity: Severity, _code: &str, _msg: &str, _location: Option<&str>) {}
    fn progress(&self, _percent: f64, _current_item: &str) {}
}

/// The default sink: ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {}

/// Cooperative cancellation handle. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

/// The terminal cancellation outcome. Partial results are discarded.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

impl CancelToken {
    /// A fresh, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; every clone observes it.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Stage checkpoint: error out if cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

/// One row of the derivation trace: what a stage consumed, what it produced,
/// how long it took, and anything worth saying about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_expr: Option<Expr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_expr: Option<Expr>,
    /// Wall-clock duration in microseconds.
    pub took_us: u64,
    pub notes: String,
}

impl StageRecord {
    pub fn new(
        stage: &str,
        input: Option<Expr>,
        output: Option<Expr>,
        took: Duration,
        notes: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.to_string(),
            input_expr: input,
            output_expr: output,
            took_us: took.as_micros() as u64,
            notes: notes.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_cancels_across_clones() {
        let t = CancelToken::new();
        let c = t.clone();
        assert!(t.checkpoint().is_ok());
        c.cancel();
        assert!(t.is_cancelled());
        assert_eq!(t.checkpoint(), Err(Cancelled));
    }

    #[test]
    fn noop_sink_accepts_everything() {
        let s = NoopProgress;
        s.phase_started("classify");
        s.warning(Severity::Info, "W000", "nothing", None);
        s.progress(42.0, "solving");
    }
}
