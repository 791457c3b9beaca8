//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの ID + ジェネリック実装
//! ULID (Universally Unique Lexicographically Sortable Identifier) を使用します。
//! Phantom type パターンで共通実装を提供しつつ、`T` はコンパイル時にしか
//! 使わないマーカー型として型安全性を確保します。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: timestamp が先頭にあるため、生成順序でソートできる
//! - **分散生成可能**: 調整なしで複数ノードで生成できる
//! - **UUID互換**: 128-bit で UUID と同じサイズ

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

use super::clock::{Clock, SystemClock};

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"corr-", "task-"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// `T` は PhantomData で、実行時にはメモリを消費しませんが、
/// コンパイル時に型安全性を提供します。CorrelationId と TaskId は
/// 異なる型なので混同できません。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// ULID から Id を作成
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// Generate a fresh id stamped with the system clock.
    pub fn generate() -> Self {
        Self::generate_at(&SystemClock)
    }

    /// Generate a fresh id stamped with the given clock.
    ///
    /// FixedClock を渡せば timestamp 部分が決定的になります（ランダム部分は残る）。
    pub fn generate_at(clock: &impl Clock) -> Self {
        let timestamp_ms = clock.now().timestamp_millis() as u64;
        Self::from_ulid(Ulid::from_parts(timestamp_ms, rand::random()))
    }

    /// 内部の ULID を取得
    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// Correlation のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Correlation {}

impl IdMarker for Correlation {
    fn prefix() -> &'static str {
        "corr-"
    }
}

/// Task のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

// ========================================
// Type Alias（使いやすさのため）
// ========================================

/// Identifier stamped onto a message at creation, preserved across
/// every stage the message flows through.
pub type CorrelationId = Id<Correlation>;

/// Identifier of one submitted task (any shape: fire-and-forget,
/// awaited, or async handle).
pub type TaskId = Id<Task>;
