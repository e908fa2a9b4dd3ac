//! The `queue` module implements the durable at-least-once message queue.
//!
//! Delivery follows the visibility protocol: a received message stays in the
//! queue but is hidden until its visibility deadline passes. If nobody
//! acknowledges it by then it becomes visible again and its receive count
//! goes up on the next delivery. That redelivery loop is the queue's only
//! retry mechanism and it is unbounded.

pub mod engine;
pub mod message;

pub use engine::MessageQueue;
pub use message::{Batch, QueueMessage};

#[cfg(test)]
mod tests;
