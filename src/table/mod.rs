//! The `table` module provides the durable key-value table and its change
//! feed.
//!
//! Items live in a `sled` tree. Every mutation appends one [`ChangeRecord`]
//! to the segment of the key's partition, so records are ordered per
//! partition key but not across partitions. Consumers read each segment
//! from a persisted checkpoint and retry a failing batch a bounded number of
//! times before dropping it; that policy is deliberately different from the
//! queue's unbounded redelivery.

pub mod feed;
pub mod record;
pub mod sled_store;

pub use feed::{ChangeFeedConsumer, ConsumerConfig, PollOutcome};
pub use record::{ChangeEventType, ChangeRecord, Item, StartingPosition};
pub use sled_store::{DurableTable, Retention, TableOptions};

#[cfg(test)]
mod tests;
