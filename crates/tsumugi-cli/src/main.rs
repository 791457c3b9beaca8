use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

use tsumugi_core::domain::{Clock, Envelope, Midpoint, Quote, SystemClock};
use tsumugi_core::error::TsumugiError;
use tsumugi_core::registry::{ContextRegistry, RegistryConfig};
use tsumugi_core::stage::{ErrorPolicy, StageConfig, start_processor, start_sink, start_source};
use tsumugi_core::task::{TaskRunner, TaskScope, join_all_or_cancel};

#[tokio::main]
async fn main() -> Result<(), TsumugiError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    run_quote_pipeline().await?;
    run_task_demo().await?;
    Ok(())
}

/// 気配値 -> 仲値の 3 ステージパイプライン。
async fn run_quote_pipeline() -> Result<(), TsumugiError> {
    info!("--- quote pipeline ---");

    // (A) Source: ランダムな気配値を 20 件生成
    let (quotes, source) = start_source(
        StageConfig::new("quote-source").with_capacity(10),
        20,
        || async { Ok(Quote::random()) },
    )?;

    // (B) Processor: 仲値を計算（メタデータはそのまま通る）
    let (mids, processor) = start_processor(
        StageConfig::new("midpoint").with_capacity(100),
        quotes,
        |quote: Quote| async move { Ok(Midpoint::from(quote)) },
    )?;

    // (C) Sink: 処理時間をシミュレートしつつ、生成からの経過時間を記録
    let sink = start_sink(
        StageConfig::new("quote-sink")
            .with_workers(2)
            .with_error_policy(ErrorPolicy::SkipAndLog),
        mids,
        |envelope: Envelope<Midpoint>| {
            let settle_time = Duration::from_millis(rand::thread_rng().gen_range(20..80));
            async move {
                sleep(settle_time).await;
                info!(
                    correlation = %envelope.meta().correlation_id(),
                    elapsed_ms = envelope.meta().elapsed_ms(SystemClock.now_ms()),
                    bid = envelope.payload().bid,
                    ask = envelope.payload().ask,
                    mid = envelope.payload().mid,
                    "quote settled"
                );
                Ok(())
            }
        },
    )?;

    // (D) 上流から順に終了を待つ
    source.join().await?;
    processor.join().await?;
    sink.join().await?;
    info!("pipeline drained");
    Ok(())
}

/// タスクランナーの 3 つの投入形態と deadline の観測。
async fn run_task_demo() -> Result<(), TsumugiError> {
    info!("--- task runner ---");

    // (A) 実行コンテキストは設定から組み立てて、ランナーへ明示的に渡す
    let registry = Arc::new(ContextRegistry::from_config(&RegistryConfig::default())?);
    let runner = TaskRunner::new(Arc::clone(&registry));

    // (B) awaited: その場で結果を待つ
    let sum = runner
        .run_awaited("compute", Some(Duration::from_millis(250)), |_cancel| {
            async { Ok::<u64, TsumugiError>((1..=10_000u64).sum()) }
        })
        .await?;
    info!(sum, "awaited compute task finished");

    // (C) async handles: 並べて投入して join で回収
    let mut handles = Vec::new();
    for i in 0..3u64 {
        let handle = runner.run_async("io", None, move |_cancel| async move {
            sleep(Duration::from_millis(30 * (i + 1))).await;
            Ok::<u64, TsumugiError>(i * 10)
        })?;
        handles.push(handle);
    }
    let values = join_all_or_cancel(handles).await?;
    info!(?values, "joined async batch");

    // (D) fire-and-forget: 失敗はスコープ経由で観測する
    let mut scope = TaskScope::new();
    runner.fire_and_forget(&scope, "interactive", None, |_cancel| async {
        Err::<(), _>(TsumugiError::Other("intentional demo failure".to_string()))
    })?;
    scope.wait_idle().await;
    if let Some(failure) = scope.try_next_failure() {
        warn!(error = %failure, "fire-and-forget failure surfaced via scope");
    }

    // (E) deadline 超過は必ず Timeout として返る
    let timed_out = runner
        .run_awaited("io", Some(Duration::from_millis(100)), |_cancel| async {
            sleep(Duration::from_millis(400)).await;
            Ok::<(), TsumugiError>(())
        })
        .await;
    match timed_out {
        Err(TsumugiError::Timeout { after }) => {
            info!(deadline_ms = after.as_millis() as u64, "slow task cut off as planned");
        }
        other => warn!(?other, "expected a timeout here"),
    }

    registry.shutdown_all();
    Ok(())
}
