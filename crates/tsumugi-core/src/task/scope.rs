//! Task scope: the supervisory surface for fire-and-forget tasks.
//!
//! # 設計メモ
//! fire-and-forget はハンドルを返さないので、失敗の観測と一斉キャンセルの
//! 口がどこかに要ります。スコープがその口です:
//! - 失敗（キャンセル以外）は unbounded チャネルに積まれ、あとから排出できる
//! - `cancel_all` はスコープ配下の全タスクの親トークンをキャンセルする
//! - `wait_idle` は配下のタスクが全部終わるまで待つ

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::TsumugiError;

/// Counts tasks currently attached to a scope.
///
/// watch チャネルなので待ち手は `wait_for(count == 0)` で眠れる。
pub(crate) struct ActiveTasks {
    count: watch::Sender<usize>,
}

impl ActiveTasks {
    fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { count }
    }

    fn enter(self: &Arc<Self>) -> ActiveGuard {
        self.count.send_modify(|n| *n += 1);
        ActiveGuard {
            active: Arc::clone(self),
        }
    }

    fn current(&self) -> usize {
        *self.count.borrow()
    }

    async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // sender はスコープが持っているので wait_for が Err になることはないが、
        // なったとしても「もう誰も数えていない」= idle 扱いで構わない
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Decrements the active count when the task's future goes away, whether it
/// completed or was dropped by a pool shutdown.
pub(crate) struct ActiveGuard {
    active: Arc<ActiveTasks>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.count.send_modify(|n| *n -= 1);
    }
}

/// Everything a fire-and-forget job needs to report back to its scope.
pub(crate) struct ScopeHooks {
    failures: mpsc::UnboundedSender<TsumugiError>,
    _guard: ActiveGuard,
}

impl ScopeHooks {
    pub(crate) fn report(&self, err: TsumugiError) {
        // スコープが先に消えていたら捨てるだけ
        let _ = self.failures.send(err);
    }
}

/// Supervisory scope for fire-and-forget tasks.
pub struct TaskScope {
    token: CancellationToken,
    failures_tx: mpsc::UnboundedSender<TsumugiError>,
    failures_rx: mpsc::UnboundedReceiver<TsumugiError>,
    active: Arc<ActiveTasks>,
}

impl TaskScope {
    pub fn new() -> Self {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        Self {
            token: CancellationToken::new(),
            failures_tx,
            failures_rx,
            active: Arc::new(ActiveTasks::new()),
        }
    }

    /// Child token for a task attached to this scope. Cancelling the scope
    /// cancels every child; a child cancelling itself does not touch
    /// siblings.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Request cancellation of every task attached to this scope.
    pub fn cancel_all(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Tasks currently attached and not yet finished.
    pub fn active(&self) -> usize {
        self.active.current()
    }

    /// Wait until every attached task has finished (including cancelled
    /// ones; cancellation is cooperative, so a task that never checks its
    /// token keeps this waiting).
    pub async fn wait_idle(&self) {
        self.active.wait_idle().await;
    }

    /// Pop the oldest unobserved failure, if any.
    pub fn try_next_failure(&mut self) -> Option<TsumugiError> {
        self.failures_rx.try_recv().ok()
    }

    /// Wait for the next failure. Resolves only when a failure arrives.
    pub async fn next_failure(&mut self) -> Option<TsumugiError> {
        self.failures_rx.recv().await
    }

    pub(crate) fn hooks(&self) -> ScopeHooks {
        ScopeHooks {
            failures: self.failures_tx.clone(),
            _guard: self.active.enter(),
        }
    }
}

impl Default for TaskScope {
    fn default() -> Self {
        Self::new()
    }
}
