//! Task lifecycle state and the handles used to observe it.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::domain::TaskId;
use crate::error::TsumugiError;

/// Task lifecycle state.
///
/// State transitions:
/// - Pending -> Running -> Completed
/// - Pending -> Running -> Failed (work returned an error)
/// - Pending -> Running -> Cancelled (external cancel or deadline)
/// - Pending -> Cancelled (job discarded unrun, e.g. the pool was already
///   shut down at submission)
///
/// Design note: transitions are monotonic. Once a terminal state is
/// reached it sticks; later transition attempts are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Submitted, not yet picked up by a worker.
    Pending,

    /// Currently being executed by a worker.
    Running,

    /// Finished and produced a value.
    Completed,

    /// Finished with an error.
    Failed,

    /// Stopped cooperatively after a cancel request or a deadline.
    Cancelled,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Shared, thread-safe view of one task's state.
#[derive(Debug)]
pub(crate) struct StatusCell {
    state: Mutex<TaskState>,
}

impl StatusCell {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TaskState::Pending),
        }
    }

    /// Move to `next` unless a terminal state has already been reached.
    /// Returns whether the transition happened.
    pub(crate) fn advance(&self, next: TaskState) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.is_terminal() {
            return false;
        }
        *state = next;
        true
    }

    pub(crate) fn get(&self) -> TaskState {
        *self.state.lock().unwrap()
    }
}

/// Owning handle to a submitted task.
///
/// `join` consumes the handle; take a [`TaskObserver`] first if you need to
/// keep watching the state afterwards.
pub struct TaskHandle<T> {
    pub(crate) id: TaskId,
    pub(crate) cell: Arc<StatusCell>,
    pub(crate) token: CancellationToken,
    pub(crate) done: oneshot::Receiver<Result<T, TsumugiError>>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        self.cell.get()
    }

    /// Request cooperative cancellation. No-op once the task is terminal.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// A cloneable, non-owning view of this task.
    pub fn observer(&self) -> TaskObserver {
        TaskObserver {
            id: self.id,
            cell: Arc::clone(&self.cell),
            token: self.token.clone(),
        }
    }

    /// Wait for the task to finish and surface its result.
    pub async fn join(self) -> Result<T, TsumugiError> {
        match self.done.await {
            Ok(result) => result,
            // Worker pool torn down before the task could report back.
            Err(_) => Err(TsumugiError::Cancelled),
        }
    }
}

/// Non-owning view of a task: state and cancellation only.
#[derive(Clone)]
pub struct TaskObserver {
    id: TaskId,
    cell: Arc<StatusCell>,
    token: CancellationToken,
}

impl TaskObserver {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        self.cell.get()
    }

    /// Request cooperative cancellation. No-op once the task is terminal.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}
