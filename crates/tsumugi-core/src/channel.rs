//! Bounded single-producer single-consumer channel with explicit close.
//!
//! # 設計メモ
//! - 容量に達した `send` はブロック（backpressure）、空の `recv` もブロック
//! - `close` は冪等。close 後の `send` はエラー、`recv` は残りを排出してから `None`
//! - `Sender` / `Receiver` の drop でも閉じる（リークしたステージが下流を永遠に
//!   待たせないため）
//!
//! 内部は Mutex で守った VecDeque と、送受それぞれ 1 本の Notify。
//! SPSC 前提なので待ち手は各側たかだか 1 つ。`send`/`recv` が `&mut self` を
//! 要求することでこの前提を型で強制しています。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::TsumugiError;

struct ChannelState<T> {
    buffer: VecDeque<T>,
    closed: bool,
    receiver_alive: bool,
}

struct Shared<T> {
    /// 0 はランデブー（手渡し）モード。
    capacity: usize,
    state: Mutex<ChannelState<T>>,
    /// Signalled when space frees up, a handoff is consumed, or the queue closes.
    send_ready: Notify,
    /// Signalled when a message arrives or the queue closes.
    recv_ready: Notify,
}

impl<T> Shared<T> {
    fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return; // 冪等
            }
            state.closed = true;
        }
        // Notify outside the lock.
        self.send_ready.notify_one();
        self.recv_ready.notify_one();
    }

    fn len(&self) -> usize {
        self.state.lock().unwrap().buffer.len()
    }

    fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

/// Producing half. Not `Clone`: one producer per queue.
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

/// Consuming half. Not `Clone`: one consumer per queue.
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

/// Create a bounded queue with room for `capacity` in-flight messages.
///
/// # Panics
/// `capacity` must be at least 1; use [`rendezvous`] for a zero-buffer handoff.
pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    assert!(
        capacity > 0,
        "bounded queue needs capacity >= 1 (use rendezvous() for a direct handoff)"
    );
    with_capacity(capacity)
}

/// Create a rendezvous queue: every `send` blocks until the receiver has
/// taken that exact message.
pub fn rendezvous<T>() -> (Sender<T>, Receiver<T>) {
    with_capacity(0)
}

fn with_capacity<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        capacity,
        state: Mutex::new(ChannelState {
            buffer: VecDeque::new(),
            closed: false,
            receiver_alive: true,
        }),
        send_ready: Notify::new(),
        recv_ready: Notify::new(),
    });
    (
        Sender {
            shared: Arc::clone(&shared),
        },
        Receiver { shared },
    )
}

/// Removes a parked rendezvous message if the send was abandoned mid-handoff,
/// so a cancelled send never delivers.
struct HandoffGuard<'a, T> {
    shared: &'a Shared<T>,
    armed: bool,
}

impl<T> Drop for HandoffGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.state.lock().unwrap();
            state.buffer.pop_front();
        }
    }
}

enum TrySend<T> {
    Sent,
    Full(T),
}

impl<T> Sender<T> {
    /// Deliver one message, waiting while the queue is full.
    ///
    /// Fails with [`TsumugiError::QueueClosed`] once the queue is closed or
    /// the receiver has been dropped; the message is not delivered in that case.
    pub async fn send(&mut self, msg: T) -> Result<(), TsumugiError> {
        if self.shared.capacity == 0 {
            return self.send_rendezvous(msg).await;
        }

        let mut msg = msg;
        loop {
            match self.try_send(msg)? {
                TrySend::Sent => return Ok(()),
                TrySend::Full(back) => msg = back, // 満杯: いったん返して待つ
            }
            self.shared.send_ready.notified().await;
        }
    }

    fn try_send(&self, msg: T) -> Result<TrySend<T>, TsumugiError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed || !state.receiver_alive {
            return Err(TsumugiError::QueueClosed);
        }
        if state.buffer.len() < self.shared.capacity {
            state.buffer.push_back(msg);
            drop(state);
            // Notify outside the lock.
            self.shared.recv_ready.notify_one();
            return Ok(TrySend::Sent);
        }
        Ok(TrySend::Full(msg))
    }

    async fn send_rendezvous(&mut self, msg: T) -> Result<(), TsumugiError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed || !state.receiver_alive {
                return Err(TsumugiError::QueueClosed);
            }
            // SPSC + 手渡し完了待ちなので、ここでバッファは必ず空
            debug_assert!(state.buffer.is_empty());
            state.buffer.push_back(msg);
        }
        self.shared.recv_ready.notify_one();

        let mut guard = HandoffGuard {
            shared: &self.shared,
            armed: true,
        };
        loop {
            {
                let mut state = self.shared.state.lock().unwrap();
                if state.buffer.is_empty() {
                    guard.armed = false;
                    return Ok(());
                }
                if state.closed || !state.receiver_alive {
                    // 受け手が消えた。宙ぶらりんのメッセージは closed を見たのと
                    // 同じロック内で回収する
                    state.buffer.pop_front();
                    guard.armed = false;
                    return Err(TsumugiError::QueueClosed);
                }
            }
            self.shared.send_ready.notified().await;
        }
    }

    /// Close the queue. Idempotent. Pending messages stay readable.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Messages currently buffered.
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        // 送り手が返ってこない経路（panic 含む）でも必ず閉じる
        self.shared.close();
    }
}

impl<T> Receiver<T> {
    /// Take the next message in FIFO order, waiting while the queue is empty.
    ///
    /// Returns `None` only after the queue is closed *and* drained, which is
    /// the end-of-stream signal for consumers.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            {
                let mut state = self.shared.state.lock().unwrap();
                if let Some(msg) = state.buffer.pop_front() {
                    drop(state);
                    // 空きができた（またはランデブーの手渡し完了）
                    self.shared.send_ready.notify_one();
                    return Some(msg);
                }
                if state.closed {
                    return None;
                }
            }
            self.shared.recv_ready.notified().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.receiver_alive = false;
            state.closed = true;
        }
        // ブロック中の送り手を起こして QueueClosed を返させる
        self.shared.send_ready.notify_one();
    }
}
