//! Sink stage: terminal consumer, with an optional pass-through relay.

use std::future::Future;

use crate::channel::{self, Receiver};
use crate::domain::Envelope;
use crate::error::TsumugiError;
use crate::pool::{NamedPool, worker_name};

use super::{ErrorPolicy, StageConfig, StageHandle, supervise};

/// Start a sink that drains `input` and runs `effect` for every message.
///
/// 入力が end-of-stream になったら正常終了します。
///
/// # Panics
/// Must be called from within a tokio runtime (the supervisor lives there).
pub fn start<T, E, Fut>(
    config: StageConfig,
    input: Receiver<Envelope<T>>,
    effect: E,
) -> Result<StageHandle, TsumugiError>
where
    T: Send + 'static,
    E: FnMut(Envelope<T>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), TsumugiError>> + Send + 'static,
{
    let pool = NamedPool::new(&config.name, config.workers)?;
    let stage = config.name.clone();
    let policy = config.on_error;

    let stage_loop = pool.spawn(run_loop(stage, policy, input, effect));

    Ok(supervise(config.name, pool, stage_loop))
}

/// Like [`start`], but re-emits every message unchanged after `effect`
/// succeeds, so further stages can keep observing the stream.
///
/// SkipAndLog で effect が失敗したメッセージは下流へも流れません。
///
/// # Panics
/// Panics outside a tokio runtime, or when `config.capacity` is 0.
pub fn start_relay<T, E, Fut>(
    config: StageConfig,
    input: Receiver<Envelope<T>>,
    effect: E,
) -> Result<(Receiver<Envelope<T>>, StageHandle), TsumugiError>
where
    T: Clone + Send + 'static,
    E: FnMut(Envelope<T>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), TsumugiError>> + Send + 'static,
{
    let (tx, rx) = channel::bounded(config.capacity);
    let pool = NamedPool::new(&config.name, config.workers)?;
    let stage = config.name.clone();
    let policy = config.on_error;

    let stage_loop = pool.spawn(run_relay_loop(stage, policy, input, tx, effect));

    Ok((rx, supervise(config.name, pool, stage_loop)))
}

async fn run_loop<T, E, Fut>(
    stage: String,
    policy: ErrorPolicy,
    mut input: Receiver<Envelope<T>>,
    mut effect: E,
) -> Result<(), TsumugiError>
where
    E: FnMut(Envelope<T>) -> Fut,
    Fut: Future<Output = Result<(), TsumugiError>>,
{
    tracing::info!(stage = %stage, worker = %worker_name(), "sink started");

    let mut drained = 0usize;
    while let Some(envelope) = input.recv().await {
        let correlation = envelope.meta().correlation_id();
        match effect(envelope).await {
            Ok(()) => drained += 1,
            Err(e) => match policy {
                ErrorPolicy::FailFast => {
                    return Err(TsumugiError::Stage {
                        stage,
                        reason: format!("effect failed for {correlation}: {e}"),
                    });
                }
                ErrorPolicy::SkipAndLog => {
                    tracing::warn!(
                        stage = %stage,
                        worker = %worker_name(),
                        correlation = %correlation,
                        error = %e,
                        "effect failed, skipping message"
                    );
                }
            },
        }
    }

    tracing::info!(stage = %stage, drained, "sink completed, end of stream");
    Ok(())
}

async fn run_relay_loop<T, E, Fut>(
    stage: String,
    policy: ErrorPolicy,
    mut input: Receiver<Envelope<T>>,
    mut tx: channel::Sender<Envelope<T>>,
    mut effect: E,
) -> Result<(), TsumugiError>
where
    T: Clone,
    E: FnMut(Envelope<T>) -> Fut,
    Fut: Future<Output = Result<(), TsumugiError>>,
{
    tracing::info!(stage = %stage, worker = %worker_name(), "relay sink started");

    while let Some(envelope) = input.recv().await {
        let correlation = envelope.meta().correlation_id();
        match effect(envelope.clone()).await {
            Ok(()) => {
                if tx.send(envelope).await.is_err() {
                    return Err(TsumugiError::Stage {
                        stage,
                        reason: "output queue closed by the consumer".to_string(),
                    });
                }
            }
            Err(e) => match policy {
                ErrorPolicy::FailFast => {
                    tx.close();
                    return Err(TsumugiError::Stage {
                        stage,
                        reason: format!("effect failed for {correlation}: {e}"),
                    });
                }
                ErrorPolicy::SkipAndLog => {
                    tracing::warn!(
                        stage = %stage,
                        worker = %worker_name(),
                        correlation = %correlation,
                        error = %e,
                        "effect failed, not relaying message"
                    );
                }
            },
        }
    }

    tx.close();
    tracing::info!(stage = %stage, "relay sink completed, end of stream");
    Ok(())
}
