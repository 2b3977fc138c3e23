//! Per-connection outbound message queue.
//!
//! Strict FIFO, shared between the reactor thread (which drains on write
//! readiness) and external command threads (which enqueue). Bounded in both
//! message count and payload bytes; overflow is an explicit backpressure
//! error, never silent growth.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::config::QueueConfig;
use crate::error::ConnectionError;

#[derive(Debug, Default)]
struct Inner {
    messages: VecDeque<String>,
    bytes: usize,
}

/// Bounded FIFO of pending wire messages for one connection.
#[derive(Debug)]
pub struct OutboundQueue {
    inner: Mutex<Inner>,
    max_messages: usize,
    max_bytes: usize,
}

impl OutboundQueue {
    /// Create a queue with the configured bounds.
    #[must_use]
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_messages: config.max_messages,
            max_bytes: config.max_bytes,
        }
    }

    /// Append a message.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Backpressure`] when either bound would be exceeded;
    /// the queue is left unchanged.
    pub fn push(&self, message: String) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.messages.len() >= self.max_messages
            || inner.bytes + message.len() > self.max_bytes
        {
            return Err(ConnectionError::Backpressure {
                queued: inner.messages.len(),
                queued_bytes: inner.bytes,
            });
        }
        inner.bytes += message.len();
        inner.messages.push_back(message);
        Ok(())
    }

    /// Take the oldest message, if any.
    pub fn pop(&self) -> Option<String> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let message = inner.messages.pop_front()?;
        inner.bytes -= message.len();
        Some(message)
    }

    /// Messages currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").messages.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything; returns the number of discarded messages.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let dropped = inner.messages.len();
        inner.messages.clear();
        inner.bytes = 0;
        dropped
    }
}
