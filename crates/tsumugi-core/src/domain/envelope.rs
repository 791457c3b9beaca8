//! Message envelope: payload + 不変メタデータの“運搬用”データ。
//!
//! メタデータは作成時に一度だけ刻印され、以降のステージでは読み取り専用です。
//! 変換ステージは payload を置き換えてもメタデータをそのまま次へ渡します。

use serde::{Deserialize, Serialize};

use super::clock::Clock;
use super::ids::CorrelationId;

/// Immutable metadata stamped onto a message when it enters the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    created_at_ms: i64,
    correlation_id: CorrelationId,
}

impl Meta {
    /// Stamp fresh metadata using the given clock.
    pub fn stamp(clock: &impl Clock) -> Self {
        Self {
            created_at_ms: clock.now_ms(),
            correlation_id: CorrelationId::generate_at(clock),
        }
    }

    /// Unix epoch millis at which the message was created.
    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Elapsed millis between creation and `now_ms`.
    ///
    /// 終端ステージでの遅延計測に使います。
    pub fn elapsed_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.created_at_ms
    }
}

/// Payload plus its metadata.
///
/// There is no mutable access to [`Meta`]. The only way an envelope for a
/// new payload comes into existence mid-pipeline is [`Envelope::map`] or
/// [`Envelope::from_parts`], both of which carry the old metadata over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    payload: T,
    meta: Meta,
}

impl<T> Envelope<T> {
    /// Wrap a payload, stamping metadata with the system clock.
    pub fn new(payload: T) -> Self {
        Self::new_with(payload, &super::clock::SystemClock)
    }

    /// Wrap a payload, stamping metadata with the given clock.
    pub fn new_with(payload: T, clock: &impl Clock) -> Self {
        Self {
            payload,
            meta: Meta::stamp(clock),
        }
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Split into payload and metadata, for transforms that need to
    /// rebuild the envelope after an async step.
    pub fn into_parts(self) -> (T, Meta) {
        (self.payload, self.meta)
    }

    /// Rebuild an envelope around a transformed payload. The metadata must
    /// come from [`Envelope::into_parts`] of the message being transformed.
    pub fn from_parts(payload: T, meta: Meta) -> Self {
        Self { payload, meta }
    }

    /// Transform the payload in place, keeping the metadata untouched.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Envelope<U> {
        Envelope {
            payload: f(self.payload),
            meta: self.meta,
        }
    }
}
