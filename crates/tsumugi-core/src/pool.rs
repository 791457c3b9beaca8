//! Worker pools: named thread pools that execute submitted futures.
//!
//! # 設計メモ
//! - [`NamedPool`] はステージ／実行コンテキストごとの専用プール。
//!   スレッド名が `prefix-N` になるので、ログとデバッガでどのプールの
//!   スレッドかが一目で分かる
//! - [`InlinePool`] はテスト用。呼び出し元のランタイムにそのまま乗せる
//! - shutdown は冪等。`shutdown_background` を使うので async 文脈から
//!   呼んでも安全（ランタイムを async 文脈で drop すると panic する）

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::runtime;
use tokio::task::JoinHandle;

use crate::error::TsumugiError;

/// Type-erased unit of work a pool can run.
pub type BoxedJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Where a task runs. Implementations must be safe to share across threads.
pub trait WorkerPool: Send + Sync {
    fn name(&self) -> &str;

    /// Submit a job. Jobs submitted after shutdown are dropped.
    fn spawn_boxed(&self, job: BoxedJob);

    /// Tear the pool down. Default is a no-op for pools that do not own
    /// their threads.
    fn shutdown(&self) {}
}

/// A pool with its own runtime and `prefix-N` named worker threads.
pub struct NamedPool {
    name: String,
    handle: runtime::Handle,
    runtime: Mutex<Option<runtime::Runtime>>,
}

impl NamedPool {
    /// Build a pool of `workers` threads named `prefix-0`, `prefix-1`, ...
    ///
    /// `workers` is clamped to at least 1.
    pub fn new(prefix: &str, workers: usize) -> Result<Self, TsumugiError> {
        let workers = workers.max(1);
        let thread_prefix = prefix.to_string();
        let counter = AtomicUsize::new(0);
        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name_fn(move || {
                let n = counter.fetch_add(1, Ordering::Relaxed);
                format!("{thread_prefix}-{n}")
            })
            .enable_all()
            .build()
            .map_err(|e| TsumugiError::Other(format!("failed to build pool {prefix}: {e}")))?;

        tracing::debug!(pool = prefix, workers, "worker pool started");

        Ok(Self {
            name: prefix.to_string(),
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
        })
    }

    /// Run a future on this pool and get its join handle back.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(fut)
    }

    /// Stop the pool without waiting for in-flight jobs. Idempotent.
    pub fn shutdown(&self) {
        if let Some(rt) = self.runtime.lock().unwrap().take() {
            tracing::debug!(pool = %self.name, "worker pool shut down");
            rt.shutdown_background();
        }
    }
}

impl Drop for NamedPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl WorkerPool for NamedPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn spawn_boxed(&self, job: BoxedJob) {
        self.handle.spawn(job);
    }

    fn shutdown(&self) {
        NamedPool::shutdown(self);
    }
}

/// Runs jobs on the caller's current runtime instead of dedicated threads.
///
/// テストでコンテキストを差し替えるときに使います。
pub struct InlinePool {
    handle: runtime::Handle,
}

impl InlinePool {
    /// # Panics
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        Self {
            handle: runtime::Handle::current(),
        }
    }
}

impl Default for InlinePool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool for InlinePool {
    fn name(&self) -> &str {
        "inline"
    }

    fn spawn_boxed(&self, job: BoxedJob) {
        self.handle.spawn(job);
    }
}

/// Name of the current worker thread, for logs.
pub fn worker_name() -> String {
    std::thread::current()
        .name()
        .unwrap_or("unnamed-worker")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn pool_threads_use_prefix_numbering() {
        let pool = NamedPool::new("spindle", 2).unwrap();

        let name = pool.spawn(async { worker_name() }).await.unwrap();
        assert!(
            name.starts_with("spindle-"),
            "unexpected worker thread name: {name}"
        );

        pool.shutdown();
    }

    #[tokio::test]
    async fn jobs_run_on_the_pool_not_the_caller() {
        let pool = NamedPool::new("offload", 1).unwrap();

        let caller = worker_name();
        let on_pool = pool.spawn(async { worker_name() }).await.unwrap();
        assert_ne!(caller, on_pool);

        pool.shutdown();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let pool = NamedPool::new("once", 1).unwrap();
        pool.shutdown();
        pool.shutdown(); // 二回呼んでも安全
    }

    #[tokio::test]
    async fn zero_workers_is_clamped_to_one() {
        let pool = NamedPool::new("clamped", 0).unwrap();
        let value = pool.spawn(async { 42 }).await.unwrap();
        assert_eq!(value, 42);
        pool.shutdown();
    }

    #[tokio::test]
    async fn inline_pool_runs_on_the_current_runtime() {
        let pool = InlinePool::new();
        let (tx, rx) = tokio::sync::oneshot::channel();

        pool.spawn_boxed(Box::pin(async move {
            let _ = tx.send(worker_name());
        }));

        let name = tokio::time::timeout(Duration::from_millis(500), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(!name.starts_with("inline-"));
    }
}
