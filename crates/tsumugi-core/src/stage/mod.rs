//! Pipeline stages: source -> processor -> sink, joined by bounded queues.
//!
//! # 構成
//! 各ステージは自分専用の [`NamedPool`] を持ち、その上でループを 1 本回します。
//! ループが終わる（入力が尽きる／失敗する）と出力キューを閉じ、
//! 監督タスクがプールを畳んで結果を [`StageHandle`] へ報告します。
//!
//! キューを閉じるのが先、プールを畳むのが後。この順序が守られるのは、
//! 監督タスクがループの JoinHandle を await してから shutdown するためです
//! （ループの future が破棄された時点で Sender の drop がキューを閉じている）。

mod processor;
mod sink;
mod source;

pub use processor::start as start_processor;
pub use sink::{start as start_sink, start_relay as start_sink_relay};
pub use source::start as start_source;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::TsumugiError;
use crate::pool::NamedPool;

/// What a stage does when user code inside it fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Stop the stage at the first failure and propagate it.
    #[default]
    FailFast,
    /// Log the failure, drop the message, keep going.
    SkipAndLog,
}

/// Per-stage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage name; also the thread-name prefix of the stage's pool.
    pub name: String,

    /// Worker threads in the stage's pool.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of the stage's *output* queue (sinks have none).
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default)]
    pub on_error: ErrorPolicy,
}

fn default_workers() -> usize {
    1
}

fn default_capacity() -> usize {
    16
}

impl StageConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workers: default_workers(),
            capacity: default_capacity(),
            on_error: ErrorPolicy::default(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }
}

/// Await-able handle to a running stage.
pub struct StageHandle {
    name: String,
    done: oneshot::Receiver<Result<(), TsumugiError>>,
}

impl StageHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the stage to terminate and surface its result.
    pub async fn join(self) -> Result<(), TsumugiError> {
        match self.done.await {
            Ok(result) => result,
            Err(_) => Err(TsumugiError::Stage {
                stage: self.name,
                reason: "stage supervisor vanished before reporting".to_string(),
            }),
        }
    }
}

/// Watch a stage loop from the caller's runtime: wait for it to finish,
/// map panics to stage failures, then tear the stage's pool down.
///
/// プール自身のスレッドから自分のランタイムは畳めないので、監督は
/// 呼び出し元ランタイム側に置きます。
pub(crate) fn supervise(
    name: String,
    pool: NamedPool,
    stage_loop: JoinHandle<Result<(), TsumugiError>>,
) -> StageHandle {
    let (done_tx, done_rx) = oneshot::channel();
    let stage = name.clone();

    tokio::spawn(async move {
        let result = match stage_loop.await {
            Ok(result) => result,
            Err(join_err) => Err(TsumugiError::Stage {
                stage: stage.clone(),
                reason: format!("stage loop panicked: {join_err}"),
            }),
        };

        // ループ終了後なので出力キューは既に閉じている
        pool.shutdown();

        match &result {
            Ok(()) => tracing::info!(stage = %stage, "stage terminated"),
            Err(e) => tracing::warn!(stage = %stage, error = %e, "stage failed"),
        }
        let _ = done_tx.send(result);
    });

    StageHandle { name, done: done_rx }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_single_worker_fail_fast() {
        let config = StageConfig::new("parse");
        assert_eq!(config.name, "parse");
        assert_eq!(config.workers, 1);
        assert_eq!(config.capacity, 16);
        assert_eq!(config.on_error, ErrorPolicy::FailFast);
    }

    #[test]
    fn builder_methods_override_defaults() {
        let config = StageConfig::new("fanout")
            .with_workers(4)
            .with_capacity(100)
            .with_error_policy(ErrorPolicy::SkipAndLog);

        assert_eq!(config.workers, 4);
        assert_eq!(config.capacity, 100);
        assert_eq!(config.on_error, ErrorPolicy::SkipAndLog);
    }

    #[test]
    fn config_deserializes_with_defaults_filled_in() {
        let config: StageConfig = serde_json::from_str(r#"{"name": "sink"}"#).unwrap();
        assert_eq!(config.workers, 1);
        assert_eq!(config.on_error, ErrorPolicy::FailFast);

        let config: StageConfig =
            serde_json::from_str(r#"{"name": "sink", "on_error": "skip_and_log"}"#).unwrap();
        assert_eq!(config.on_error, ErrorPolicy::SkipAndLog);
    }

    mod pipeline {
        use super::super::*;
        use crate::domain::{Envelope, Midpoint, Quote};
        use std::sync::{Arc, Mutex};

        /// source -> processor -> sink を全部つないだ通し試験。
        /// 値が正しく変換され、順序とメタデータが保たれ、全ステージが
        /// 正常終了すること。
        #[tokio::test]
        async fn quotes_flow_end_to_end() {
            let (quotes, source) = start_source(
                StageConfig::new("e2e-source").with_capacity(2),
                3,
                || async { Ok(Quote { bid: 1.0, ask: 2.0 }) },
            )
            .unwrap();

            let (mids, processor) = start_processor(
                StageConfig::new("e2e-midpoint"),
                quotes,
                |quote: Quote| async move { Ok(Midpoint::from(quote)) },
            )
            .unwrap();

            let settled: Arc<Mutex<Vec<Envelope<Midpoint>>>> = Arc::new(Mutex::new(Vec::new()));
            let sink_settled = Arc::clone(&settled);
            let sink = start_sink(StageConfig::new("e2e-sink"), mids, move |envelope| {
                let settled = Arc::clone(&sink_settled);
                async move {
                    settled.lock().unwrap().push(envelope);
                    Ok(())
                }
            })
            .unwrap();

            source.join().await.unwrap();
            processor.join().await.unwrap();
            sink.join().await.unwrap();

            let settled = settled.lock().unwrap();
            assert_eq!(settled.len(), 3);
            for envelope in settled.iter() {
                let mid = envelope.payload();
                assert_eq!(mid.bid, 1.0);
                assert_eq!(mid.ask, 2.0);
                assert_eq!(mid.mid, 1.5);
            }

            // correlation id は全メッセージで異なり、重複しない
            let mut correlations: Vec<_> = settled
                .iter()
                .map(|e| e.meta().correlation_id())
                .collect();
            correlations.sort();
            correlations.dedup();
            assert_eq!(correlations.len(), 3);
        }

        /// 下流が遅くても、有界キューの backpressure で source が先走らない。
        #[tokio::test]
        async fn a_slow_sink_throttles_the_source() {
            let produced = Arc::new(Mutex::new(0usize));
            let source_produced = Arc::clone(&produced);

            let (quotes, source) = start_source(
                StageConfig::new("throttled-source").with_capacity(1),
                20,
                move || {
                    let produced = Arc::clone(&source_produced);
                    async move {
                        *produced.lock().unwrap() += 1;
                        Ok(Quote { bid: 1.0, ask: 3.0 })
                    }
                },
            )
            .unwrap();

            // 消費側はわざとゆっくり
            let sink = start_sink(StageConfig::new("slow-sink"), quotes, |_envelope| async {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                Ok(())
            })
            .unwrap();

            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            let so_far = *produced.lock().unwrap();
            assert!(
                so_far < 20,
                "source should still be blocked on backpressure, produced {so_far}"
            );

            source.join().await.unwrap();
            sink.join().await.unwrap();
            assert_eq!(*produced.lock().unwrap(), 20);
        }
    }
}
