//! The `event` module defines the immutable envelope every stage hands to a
//! compute function.

pub mod envelope;

pub use envelope::{Event, EventSource};

#[cfg(test)]
mod tests;
