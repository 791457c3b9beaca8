use std::time::Duration;

use thiserror::Error;

/// Unified error taxonomy for queues, stages and tasks.
///
/// # 設計メモ
/// キャンセルは「失敗」ではなく協調的な終了シグナルとして扱います。
/// 集約側（join など）はキャンセルと本物の失敗を区別する必要があるため、
/// [`TsumugiError::is_cancellation`] で判定できるようにしています。
#[derive(Debug, Error)]
pub enum TsumugiError {
    /// Send attempted on a queue whose close flag is already set,
    /// or whose receiving side has gone away.
    #[error("queue closed")]
    QueueClosed,

    #[error("execution context not found: {0}")]
    ContextNotFound(String),

    #[error("duplicate execution context: {0}")]
    DuplicateContext(String),

    /// The per-task deadline elapsed before the work finished.
    #[error("task timed out after {after:?}")]
    Timeout { after: Duration },

    /// Cancellation was requested and the task stopped cooperatively.
    #[error("task cancelled")]
    Cancelled,

    #[error("stage {stage} failed: {reason}")]
    Stage { stage: String, reason: String },

    #[error("{0}")]
    Other(String),
}

impl TsumugiError {
    /// Cancellation outcomes propagate differently from failures:
    /// they never trigger sibling cancellation and are not reported
    /// to a scope as failures.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TsumugiError::Cancelled)
    }
}
