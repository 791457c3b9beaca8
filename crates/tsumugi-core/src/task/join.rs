//! Join a batch of task handles, cancelling the rest on first failure.

use tokio::sync::mpsc;

use crate::error::TsumugiError;

use super::handle::TaskHandle;

/// Wait for every handle; on the first *failure* (anything that is not a
/// cancellation signal), cancel all still-running siblings, wait for them
/// to wind down, and re-raise the original error.
///
/// # 終わり方は 3 通り
/// - 全員 Completed: 投入順の値の `Vec` を返す
/// - 誰かが失敗: 兄弟を止めてからその失敗をそのまま返す（最初の 1 件だけ。
///   巻き添えキャンセルや 2 件目以降の失敗は破棄される）
/// - 失敗はないが外部キャンセルがあった: 全員の終了を待って
///   [`TsumugiError::Cancelled`] を返す。キャンセルは失敗ではないので
///   兄弟は走り続け、完走する
///
/// 空のバッチは設定ミスとして即エラー。
pub async fn join_all_or_cancel<T>(
    handles: Vec<TaskHandle<T>>,
) -> Result<Vec<T>, TsumugiError>
where
    T: Send + 'static,
{
    if handles.is_empty() {
        return Err(TsumugiError::Other(
            "join_all_or_cancel needs at least one handle".to_string(),
        ));
    }

    let total = handles.len();
    let observers: Vec<_> = handles.iter().map(|h| h.observer()).collect();

    // 各ハンドルの結果を (index, result) で 1 本のチャネルに集める。
    // 完了順に処理したいので、順番に join するのではなくこうする。
    let (results_tx, mut results_rx) = mpsc::channel(total);
    for (index, handle) in handles.into_iter().enumerate() {
        let tx = results_tx.clone();
        tokio::spawn(async move {
            let result = handle.join().await;
            // バッファは total 分あるので送信は待たない
            let _ = tx.send((index, result)).await;
        });
    }
    drop(results_tx);

    let mut values: Vec<Option<T>> = std::iter::repeat_with(|| None).take(total).collect();
    let mut first_failure: Option<TsumugiError> = None;
    let mut externally_cancelled = false;

    while let Some((index, result)) = results_rx.recv().await {
        match result {
            Ok(value) => values[index] = Some(value),
            Err(e) if e.is_cancellation() => {
                // 自分たちが巻き添えで止めた分ではなく、外から止められた分だけ覚える
                if first_failure.is_none() {
                    externally_cancelled = true;
                }
            }
            Err(e) => {
                if first_failure.is_none() {
                    tracing::debug!(error = %e, "first task failure, cancelling siblings");
                    for observer in &observers {
                        if !observer.state().is_terminal() {
                            observer.cancel();
                        }
                    }
                    first_failure = Some(e);
                }
            }
        }
    }

    if let Some(failure) = first_failure {
        return Err(failure);
    }
    if externally_cancelled {
        return Err(TsumugiError::Cancelled);
    }

    // ここまで来たら全員 Completed
    let mut collected = Vec::with_capacity(total);
    for value in values {
        match value {
            Some(v) => collected.push(v),
            None => {
                return Err(TsumugiError::Other(
                    "task finished without a value or an error".to_string(),
                ));
            }
        }
    }
    Ok(collected)
}
