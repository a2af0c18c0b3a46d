//! Bounded per-connection outbound queue.
//!
//! The dispatcher must never block on a slow listener: pushes are synchronous
//! and bounded. On overflow the oldest queued NOISE_EVENT is evicted first
//! (stream signalling is never sacrificed for noise), falling back to the
//! queue head, and a drop counter records the loss.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::messages::ControlMessage;

pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

pub struct OutboundQueue {
    inner: Mutex<VecDeque<ControlMessage>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue without blocking. Returns true if an older message was evicted.
    pub fn push(&self, msg: ControlMessage) -> bool {
        let mut queue = self.inner.lock().expect("outbound queue lock poisoned");
        let mut evicted = false;
        if queue.len() >= self.capacity {
            let victim = queue
                .iter()
                .position(ControlMessage::is_noise_event)
                .unwrap_or(0);
            let _ = queue.remove(victim);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            evicted = true;
        }
        queue.push_back(msg);
        drop(queue);
        self.notify.notify_one();
        evicted
    }

    /// Dequeue the next message, waiting if empty. `None` once closed and
    /// drained.
    pub async fn pop(&self) -> Option<ControlMessage> {
        loop {
            {
                let mut queue = self.inner.lock().expect("outbound queue lock poisoned");
                if let Some(msg) = queue.pop_front() {
                    return Some(msg);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("outbound queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
