//! Task runner: submits work to execution contexts in three shapes.
//!
//! # 3 つの投入形態
//! - `fire_and_forget`: ハンドルなし。失敗はスコープへ報告される
//! - `run_awaited`: 完了までこの場で待つ（スレッドはブロックしない）
//! - `run_async`: [`TaskHandle`] を返し、あとから join できる
//!
//! どの形態も deadline とキャンセルの扱いは同一です。deadline 超過は
//! 内部的にはキャンセルと同じ経路で work を止めますが、失敗値としては
//! [`TsumugiError::Timeout`] が付きます。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::domain::TaskId;
use crate::error::TsumugiError;
use crate::pool::{WorkerPool, worker_name};
use crate::registry::ContextRegistry;

use super::handle::{StatusCell, TaskHandle, TaskState};
use super::scope::{ScopeHooks, TaskScope};

/// Submits tasks to pools resolved from a [`ContextRegistry`].
///
/// Resolution happens per submission, so swapping a context in the registry
/// affects every later submission without touching the runner.
pub struct TaskRunner {
    registry: Arc<ContextRegistry>,
}

impl TaskRunner {
    pub fn new(registry: Arc<ContextRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ContextRegistry {
        &self.registry
    }

    /// Submit a task and hand back its [`TaskHandle`].
    ///
    /// `deadline` of `None` means unbounded. The work closure receives a
    /// cancellation token to poll at its own checkpoints; regardless, the
    /// work future is dropped at the next await point once cancelled.
    pub fn run_async<T, F, Fut>(
        &self,
        context: &str,
        deadline: Option<Duration>,
        work: F,
    ) -> Result<TaskHandle<T>, TsumugiError>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, TsumugiError>> + Send + 'static,
    {
        let pool = self.registry.resolve(context)?;
        let token = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();

        let (id, cell) = launch(
            pool.as_ref(),
            context,
            deadline,
            token.clone(),
            Completion::Handle(done_tx),
            work,
        );

        Ok(TaskHandle {
            id,
            cell,
            token,
            done: done_rx,
        })
    }

    /// Submit a task and wait for its result right here.
    pub async fn run_awaited<T, F, Fut>(
        &self,
        context: &str,
        deadline: Option<Duration>,
        work: F,
    ) -> Result<T, TsumugiError>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, TsumugiError>> + Send + 'static,
    {
        self.run_async(context, deadline, work)?.join().await
    }

    /// Submit a task with no handle, attached to `scope`.
    ///
    /// 結果の受け皿がないので、キャンセル以外の失敗はログに出しつつ
    /// スコープへ積みます。返り値の [`TaskId`] はログの突き合わせ用。
    pub fn fire_and_forget<F, Fut>(
        &self,
        scope: &TaskScope,
        context: &str,
        deadline: Option<Duration>,
        work: F,
    ) -> Result<TaskId, TsumugiError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), TsumugiError>> + Send + 'static,
    {
        let pool = self.registry.resolve(context)?;
        let token = scope.child_token();

        let (id, _cell) = launch(
            pool.as_ref(),
            context,
            deadline,
            token,
            Completion::Scope(scope.hooks()),
            work,
        );
        Ok(id)
    }
}

/// Where a finished task's result goes.
enum Completion<T> {
    /// Someone may be holding the handle; deliver through the oneshot.
    Handle(oneshot::Sender<Result<T, TsumugiError>>),
    /// Fire-and-forget: only failures are interesting, and they go to the
    /// scope. Dropping this (even without running) releases the scope's
    /// active count.
    Scope(ScopeHooks),
}

/// Carries the status cell and the completion route through the spawned job,
/// settling both if the job future is dropped before finishing (e.g.
/// submitted to a pool that was already shut down).
///
/// Drop 本体が状態を Cancelled へ進めてから、フィールドの completion が
/// 落ちる。oneshot の切断で起きた join 側は必ず terminal な状態を見る。
struct JobGuard<T> {
    cell: Arc<StatusCell>,
    /// Taken by the job body once there is a real result to deliver.
    completion: Option<Completion<T>>,
}

impl<T> Drop for JobGuard<T> {
    fn drop(&mut self) {
        // 走り切った後なら terminal 済みで no-op
        self.cell.advance(TaskState::Cancelled);
    }
}

fn launch<T, F, Fut>(
    pool: &dyn WorkerPool,
    context: &str,
    deadline: Option<Duration>,
    token: CancellationToken,
    completion: Completion<T>,
    work: F,
) -> (TaskId, Arc<StatusCell>)
where
    T: Send + 'static,
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, TsumugiError>> + Send + 'static,
{
    let id = TaskId::generate();
    let cell = Arc::new(StatusCell::new());
    let context_name = context.to_string();

    // work はここでは未実行。future を組み立てるだけで、走るのはプール上。
    let fut = work(token.clone());

    let mut guard = JobGuard {
        cell: Arc::clone(&cell),
        completion: Some(completion),
    };
    let job = async move {
        guard.cell.advance(TaskState::Running);
        tracing::debug!(
            task = %id,
            context = %context_name,
            worker = %worker_name(),
            "task started"
        );

        let result: Result<T, TsumugiError> = tokio::select! {
            biased;
            _ = token.cancelled() => Err(TsumugiError::Cancelled),
            result = run_with_deadline(deadline, fut) => result,
        };

        if matches!(result, Err(TsumugiError::Timeout { .. })) {
            // deadline 超過もトークンに伝える（work が子を作っていた場合のため）
            token.cancel();
        }

        let next = match &result {
            Ok(_) => TaskState::Completed,
            Err(TsumugiError::Timeout { .. }) | Err(TsumugiError::Cancelled) => {
                TaskState::Cancelled
            }
            Err(_) => TaskState::Failed,
        };
        guard.cell.advance(next);

        match &result {
            Ok(_) => tracing::debug!(
                task = %id,
                context = %context_name,
                worker = %worker_name(),
                "task completed"
            ),
            Err(e) => tracing::debug!(
                task = %id,
                context = %context_name,
                worker = %worker_name(),
                outcome = %e,
                "task finished without a value"
            ),
        }

        match guard.completion.take() {
            Some(Completion::Handle(done_tx)) => {
                if let Err(unclaimed) = done_tx.send(result) {
                    // ハンドルが捨てられていた。失敗だけは黙らせない。
                    if let Err(e) = unclaimed {
                        if !e.is_cancellation() {
                            tracing::warn!(
                                task = %id,
                                context = %context_name,
                                error = %e,
                                "unobserved task failure"
                            );
                        }
                    }
                }
            }
            Some(Completion::Scope(hooks)) => {
                if let Err(e) = result {
                    if !e.is_cancellation() {
                        tracing::warn!(
                            task = %id,
                            context = %context_name,
                            error = %e,
                            "background task failed"
                        );
                        hooks.report(e);
                    }
                }
                // hooks drop here -> scope active count goes down
            }
            None => {}
        }
    };

    pool.spawn_boxed(Box::pin(job));
    (id, cell)
}

async fn run_with_deadline<T>(
    deadline: Option<Duration>,
    fut: impl Future<Output = Result<T, TsumugiError>>,
) -> Result<T, TsumugiError> {
    match deadline {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(TsumugiError::Timeout { after: limit }),
        },
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{InlinePool, NamedPool};
    use std::time::Instant;
    use tokio::time::sleep;

    fn inline_runner(context: &str) -> TaskRunner {
        let registry = Arc::new(ContextRegistry::new());
        registry
            .register(context, Arc::new(InlinePool::new()))
            .unwrap();
        TaskRunner::new(registry)
    }

    #[tokio::test]
    async fn awaited_task_returns_its_value() {
        let runner = inline_runner("compute");

        let sum = runner
            .run_awaited("compute", None, |_cancel| async {
                Ok::<u64, TsumugiError>((1..=100u64).sum())
            })
            .await
            .unwrap();

        assert_eq!(sum, 5050);
    }

    #[tokio::test]
    async fn unknown_context_fails_at_submission() {
        let runner = inline_runner("compute");

        let err = runner
            .run_async("warp-drive", None, |_cancel| async {
                Ok::<(), TsumugiError>(())
            })
            .err()
            .expect("submission should fail");

        assert!(matches!(err, TsumugiError::ContextNotFound(name) if name == "warp-drive"));
    }

    #[tokio::test]
    async fn deadline_cuts_off_slow_work() {
        let runner = inline_runner("compute");

        let started = Instant::now();
        let err = runner
            .run_awaited(
                "compute",
                Some(Duration::from_millis(100)),
                |_cancel| async {
                    sleep(Duration::from_millis(400)).await;
                    Ok::<(), TsumugiError>(())
                },
            )
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(
            err,
            TsumugiError::Timeout { after } if after == Duration::from_millis(100)
        ));
        // 400ms の work を待たずに deadline で切れている
        assert!(elapsed >= Duration::from_millis(100));
        assert!(
            elapsed < Duration::from_millis(300),
            "timeout fired too late: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn timed_out_task_lands_in_cancelled_state() {
        let runner = inline_runner("compute");

        let handle = runner
            .run_async(
                "compute",
                Some(Duration::from_millis(50)),
                |_cancel| async {
                    sleep(Duration::from_millis(500)).await;
                    Ok::<(), TsumugiError>(())
                },
            )
            .unwrap();
        let observer = handle.observer();

        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, TsumugiError::Timeout { .. }));
        // 状態としてはキャンセル。失敗値だけが Timeout を名乗る。
        assert_eq!(observer.state(), TaskState::Cancelled);
    }

    #[tokio::test]
    async fn no_deadline_means_unbounded() {
        let runner = inline_runner("compute");

        let value = runner
            .run_awaited("compute", None, |_cancel| async {
                sleep(Duration::from_millis(150)).await;
                Ok::<u8, TsumugiError>(9)
            })
            .await
            .unwrap();

        assert_eq!(value, 9);
    }

    #[tokio::test]
    async fn external_cancel_stops_the_task() {
        let runner = inline_runner("compute");

        let handle = runner
            .run_async("compute", None, |_cancel| async {
                sleep(Duration::from_secs(30)).await;
                Ok::<(), TsumugiError>(())
            })
            .unwrap();
        let observer = handle.observer();

        // 少し走らせてからキャンセル
        sleep(Duration::from_millis(50)).await;
        handle.cancel();

        let err = handle.join().await.unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(observer.state(), TaskState::Cancelled);
    }

    #[tokio::test]
    async fn work_can_observe_its_own_token() {
        let runner = inline_runner("compute");

        let handle = runner
            .run_async("compute", None, |cancel| async move {
                loop {
                    if cancel.is_cancelled() {
                        // 後始末してから協調的に抜ける
                        return Err::<(), _>(TsumugiError::Cancelled);
                    }
                    sleep(Duration::from_millis(10)).await;
                }
            })
            .unwrap();

        sleep(Duration::from_millis(40)).await;
        handle.cancel();

        let err = handle.join().await.unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn cancel_after_completion_is_ignored() {
        let runner = inline_runner("compute");

        let handle = runner
            .run_async("compute", None, |_cancel| async {
                Ok::<u8, TsumugiError>(1)
            })
            .unwrap();
        let observer = handle.observer();

        let value = handle.join().await.unwrap();
        assert_eq!(value, 1);

        // 完了後のキャンセル要求は状態を動かさない
        observer.cancel();
        assert_eq!(observer.state(), TaskState::Completed);
    }

    #[tokio::test]
    async fn context_is_resolved_at_submission_time() {
        let registry = Arc::new(ContextRegistry::new());
        registry
            .register("compute", Arc::new(NamedPool::new("compute", 1).unwrap()))
            .unwrap();
        let runner = TaskRunner::new(Arc::clone(&registry));

        let on_named = runner
            .run_awaited("compute", None, |_cancel| async {
                Ok::<String, TsumugiError>(worker_name())
            })
            .await
            .unwrap();
        assert!(on_named.starts_with("compute-"), "got: {on_named}");

        // 差し替え後の投入は新しいプールへ
        registry.replace("compute", Arc::new(InlinePool::new()));
        let on_inline = runner
            .run_awaited("compute", None, |_cancel| async {
                Ok::<String, TsumugiError>(worker_name())
            })
            .await
            .unwrap();
        assert!(!on_inline.starts_with("compute-"), "got: {on_inline}");

        registry.shutdown_all();
    }

    #[tokio::test]
    async fn submission_after_pool_shutdown_resolves_as_cancelled() {
        let registry = Arc::new(ContextRegistry::new());
        registry
            .register("compute", Arc::new(NamedPool::new("compute", 1).unwrap()))
            .unwrap();
        let runner = TaskRunner::new(Arc::clone(&registry));
        registry.shutdown_all();

        // 停止済みプールへの投入。job は走らないまま捨てられる
        let handle = runner
            .run_async("compute", None, |_cancel| async {
                Ok::<u8, TsumugiError>(1)
            })
            .unwrap();
        let observer = handle.observer();

        let err = handle.join().await.unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(observer.state(), TaskState::Cancelled);
    }

    #[tokio::test]
    async fn fire_and_forget_failures_surface_through_the_scope() {
        let runner = inline_runner("interactive");
        let mut scope = TaskScope::new();

        runner
            .fire_and_forget(&scope, "interactive", None, |_cancel| async {
                Err::<(), _>(TsumugiError::Other("kaboom".to_string()))
            })
            .unwrap();

        scope.wait_idle().await;
        let failure = scope.try_next_failure().expect("failure must be recorded");
        assert!(matches!(failure, TsumugiError::Other(msg) if msg == "kaboom"));
    }

    #[tokio::test]
    async fn fire_and_forget_timeout_counts_as_a_failure() {
        let runner = inline_runner("interactive");
        let mut scope = TaskScope::new();

        runner
            .fire_and_forget(
                &scope,
                "interactive",
                Some(Duration::from_millis(50)),
                |_cancel| async {
                    sleep(Duration::from_millis(500)).await;
                    Ok(())
                },
            )
            .unwrap();

        scope.wait_idle().await;
        let failure = scope.try_next_failure().expect("timeout must be recorded");
        assert!(matches!(failure, TsumugiError::Timeout { .. }));
    }

    #[tokio::test]
    async fn scope_cancellation_is_not_reported_as_failure() {
        let runner = inline_runner("interactive");
        let mut scope = TaskScope::new();

        for _ in 0..2 {
            runner
                .fire_and_forget(&scope, "interactive", None, |_cancel| async {
                    sleep(Duration::from_secs(30)).await;
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(scope.active(), 2);

        sleep(Duration::from_millis(50)).await;
        scope.cancel_all();
        scope.wait_idle().await;

        // 一斉キャンセルは失敗扱いしない
        assert!(scope.try_next_failure().is_none());
        assert_eq!(scope.active(), 0);
    }
}
