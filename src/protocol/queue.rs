//! Hand-off queue between network tasks and the consuming thread.
//!
//! Receive loops push decoded messages; a polling consumer (a fixed-step
//! game loop, a UI tick) drains them without ever blocking on the network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::message::NetworkMessage;

/// Unbounded, thread-safe FIFO of decoded messages.
#[derive(Debug, Default)]
pub struct NetworkDataQueue {
    items: Mutex<VecDeque<NetworkMessage>>,
    len: AtomicUsize,
}

impl NetworkDataQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message. Never blocks on the consumer and never fails.
    pub fn enqueue(&self, message: NetworkMessage) {
        let mut items = self.lock();
        items.push_back(message);
        self.len.store(items.len(), Ordering::Release);
    }

    /// Pop the oldest message, or `None` when nothing is waiting.
    pub fn try_dequeue(&self) -> Option<NetworkMessage> {
        let mut items = self.lock();
        let message = items.pop_front();
        self.len.store(items.len(), Ordering::Release);
        message
    }

    /// Take everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<NetworkMessage> {
        let mut items = self.lock();
        self.len.store(0, Ordering::Release);
        items.drain(..).collect()
    }

    /// Advisory: another task may enqueue right after this returns.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<NetworkMessage>> {
        // A panic while holding this lock cannot leave the deque half-mutated
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
