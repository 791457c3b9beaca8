//! tsumugi-core
//!
//! Core building blocks for structured, cancellable, backpressured
//! concurrency: pipeline stages over bounded queues, plus a task runner
//! with uniform deadline and cancellation semantics.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, clock, envelope, demo payload）
//! - **channel**: SPSC 有界キュー（close / end-of-stream / backpressure）
//! - **pool**: 名前付きワーカープール（`prefix-N` スレッド命名）
//! - **registry**: 実行コンテキストのレジストリ（名前 -> プール）
//! - **stage**: パイプラインステージ（source / processor / sink）
//! - **task**: タスク実行（runner / handle / scope / join）
//! - **error**: 共通エラー型
//!
//! # 設計原則
//! - キャンセルは協調的。止めたい側はトークンで合図し、止まる側は
//!   await 地点かチェックポイントで従う
//! - キューの close と end-of-stream でパイプラインは上流から順に畳まれる
//! - レジストリはグローバルではなく、値として組み立てて明示的に渡す

pub mod channel;
pub mod domain;
pub mod error;
pub mod pool;
pub mod registry;
pub mod stage;
pub mod task;
