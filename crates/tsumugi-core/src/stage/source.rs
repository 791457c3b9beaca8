//! Source stage: generates messages and feeds the first queue.

use std::future::Future;

use crate::channel::{self, Receiver};
use crate::domain::Envelope;
use crate::error::TsumugiError;
use crate::pool::{NamedPool, worker_name};

use super::{StageConfig, StageHandle, supervise};

/// Start a source that produces `count` messages from `generator`, wrapping
/// each in a fresh [`Envelope`], then closes its output queue.
///
/// 生成失敗は常に致命的で、[`ErrorPolicy`](super::ErrorPolicy) の設定に
/// 関わらずループを止めます（skip する対象のメッセージがまだ存在しない
/// ため）。出力は失敗時も閉じるので、途中までの成果は下流がそのまま排出
/// できます。
///
/// # Panics
/// Must be called from within a tokio runtime (the supervisor lives there),
/// and with `config.capacity >= 1` (see [`channel::bounded`]).
pub fn start<T, G, Fut>(
    config: StageConfig,
    count: usize,
    generator: G,
) -> Result<(Receiver<Envelope<T>>, StageHandle), TsumugiError>
where
    T: Send + 'static,
    G: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, TsumugiError>> + Send + 'static,
{
    let (tx, rx) = channel::bounded(config.capacity);
    let pool = NamedPool::new(&config.name, config.workers)?;
    let stage = config.name.clone();

    let stage_loop = pool.spawn(run_loop(stage, count, tx, generator));

    Ok((rx, supervise(config.name, pool, stage_loop)))
}

async fn run_loop<T, G, Fut>(
    stage: String,
    count: usize,
    mut tx: channel::Sender<Envelope<T>>,
    mut generator: G,
) -> Result<(), TsumugiError>
where
    G: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TsumugiError>>,
{
    tracing::info!(stage = %stage, worker = %worker_name(), "source started");

    for seq in 0..count {
        let payload = match generator().await {
            Ok(payload) => payload,
            Err(e) => {
                // 出力を閉じてから失敗を報告（下流を待たせない）
                tx.close();
                return Err(TsumugiError::Stage {
                    stage,
                    reason: format!("generator failed at message {}: {e}", seq + 1),
                });
            }
        };

        let envelope = Envelope::new(payload);
        tracing::debug!(
            stage = %stage,
            worker = %worker_name(),
            correlation = %envelope.meta().correlation_id(),
            "produced message {}/{count}",
            seq + 1,
        );

        if tx.send(envelope).await.is_err() {
            // 下流が消えた。これ以上作っても届かない。
            return Err(TsumugiError::Stage {
                stage,
                reason: "output queue closed by the consumer".to_string(),
            });
        }
    }

    tx.close();
    tracing::info!(stage = %stage, produced = count, "source completed");
    Ok(())
}
