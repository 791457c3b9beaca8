//! Processor stage: transforms messages from one queue into the next.

use std::future::Future;

use crate::channel::{self, Receiver};
use crate::domain::Envelope;
use crate::error::TsumugiError;
use crate::pool::{NamedPool, worker_name};

use super::{ErrorPolicy, StageConfig, StageHandle, supervise};

/// Start a processor that drains `input`, applies `transform` to each
/// payload, and forwards the result downstream under the *same* metadata.
///
/// 入力が尽きたら（上流 close ＋排出済み）出力を閉じて正常終了します。
///
/// # Panics
/// Panics outside a tokio runtime, or when `config.capacity` is 0 (the
/// output queue needs room for at least one message).
pub fn start<T, U, F, Fut>(
    config: StageConfig,
    input: Receiver<Envelope<T>>,
    transform: F,
) -> Result<(Receiver<Envelope<U>>, StageHandle), TsumugiError>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = Result<U, TsumugiError>> + Send + 'static,
{
    let (tx, rx) = channel::bounded(config.capacity);
    let pool = NamedPool::new(&config.name, config.workers)?;
    let stage = config.name.clone();
    let policy = config.on_error;

    let stage_loop = pool.spawn(run_loop(stage, policy, input, tx, transform));

    Ok((rx, supervise(config.name, pool, stage_loop)))
}

async fn run_loop<T, U, F, Fut>(
    stage: String,
    policy: ErrorPolicy,
    mut input: Receiver<Envelope<T>>,
    mut tx: channel::Sender<Envelope<U>>,
    mut transform: F,
) -> Result<(), TsumugiError>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<U, TsumugiError>>,
{
    tracing::info!(stage = %stage, worker = %worker_name(), "processor started");

    let mut processed = 0usize;
    while let Some(envelope) = input.recv().await {
        let (payload, meta) = envelope.into_parts();
        let correlation = meta.correlation_id();

        match transform(payload).await {
            Ok(next) => {
                if tx.send(Envelope::from_parts(next, meta)).await.is_err() {
                    return Err(TsumugiError::Stage {
                        stage,
                        reason: "output queue closed by the consumer".to_string(),
                    });
                }
                processed += 1;
            }
            Err(e) => match policy {
                ErrorPolicy::FailFast => {
                    tx.close();
                    return Err(TsumugiError::Stage {
                        stage,
                        reason: format!("transform failed for {correlation}: {e}"),
                    });
                }
                ErrorPolicy::SkipAndLog => {
                    tracing::warn!(
                        stage = %stage,
                        worker = %worker_name(),
                        correlation = %correlation,
                        error = %e,
                        "transform failed, skipping message"
                    );
                }
            },
        }
    }

    tx.close();
    tracing::info!(stage = %stage, processed, "processor completed, input drained");
    Ok(())
}
