use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// A message owned by the queue.
///
/// `visible_after` is a runtime instant, not wall-clock time: it only means
/// something to the queue that set it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub id: String,
    pub body: Bytes,
    pub enqueued_at: DateTime<Utc>,
    pub visible_after: Instant,
    /// Number of times the message has been handed out. Zero until first
    /// delivery.
    pub receive_count: u32,
}

impl QueueMessage {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A transient group of items handed to one consumer invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    pub items: Vec<T>,
    pub max_size: usize,
    pub max_wait_window: Duration,
}

impl<T> Batch<T> {
    pub fn new(items: Vec<T>, max_size: usize, max_wait_window: Duration) -> Self {
        Self {
            items,
            max_size,
            max_wait_window,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_size
    }
}

impl Batch<QueueMessage> {
    pub fn message_ids(&self) -> Vec<String> {
        self.items.iter().map(|m| m.id.clone()).collect()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.items.iter().any(|m| m.id == message_id)
    }
}
