//! The `topic` module implements publish/subscribe fan-out.
//!
//! Subscriptions are fixed when the topic is built. Each publish starts one
//! delivery task per subscription, so a slow or failing endpoint never holds
//! up the others. Delivery to an endpoint is retried with backoff a bounded
//! number of times.

pub mod endpoint;
pub mod fanout;

pub use endpoint::{ComputeEndpoint, DeliveryError, EmailEndpoint, Endpoint, Mailbox, QueueEndpoint};
pub use fanout::{
    DeliveryPolicy, DeliveryReport, Notification, Protocol, PublishReceipt, Subscription, Topic,
    TopicBuilder,
};

#[cfg(test)]
mod tests;
