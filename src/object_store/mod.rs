//! The `object_store` module is a blob store that notifies listeners when
//! objects are created.
//!
//! Notifications are at-least-once per matching object: the same object can
//! be announced more than once (every overwrite is a new creation) and there
//! is no ordering across objects.

pub mod store;

pub use store::{ObjectStore, StoredObject};
