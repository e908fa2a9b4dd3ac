//! Subscriber endpoints
//!
//! An endpoint is the opaque capability behind a subscription address. The
//! topic only knows how to call `deliver`; what happens next (mail, function
//! invocation, enqueue) is the endpoint's business.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::event::{Event, EventSource};
use crate::function::ComputeFunction;
use crate::queue::MessageQueue;
use crate::topic::fanout::Notification;

#[derive(Debug, Clone, Error)]
#[error("delivery to {endpoint} failed: {reason}")]
pub struct DeliveryError {
    pub endpoint: String,
    pub reason: String,
}

impl DeliveryError {
    pub fn new(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// In-memory record of mail handed to email subscriptions.
#[derive(Debug, Clone, Default)]
pub struct Mailbox {
    sent: Arc<Mutex<Vec<(String, Notification)>>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(address, notification)` delivered so far.
    pub fn sent(&self) -> Vec<(String, Notification)> {
        self.sent.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

/// Email subscription. Mail leaves through the [`Mailbox`].
#[derive(Debug, Clone)]
pub struct EmailEndpoint {
    address: String,
    mailbox: Mailbox,
}

impl EmailEndpoint {
    pub fn new(address: impl Into<String>, mailbox: Mailbox) -> Self {
        Self {
            address: address.into(),
            mailbox,
        }
    }
}

#[async_trait]
impl Endpoint for EmailEndpoint {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        info!(
            to = %self.address,
            topic = %notification.topic,
            message_id = %notification.message_id,
            "mail sent"
        );
        self.mailbox
            .sent
            .lock()
            .push((self.address.clone(), notification.clone()));
        Ok(())
    }
}

/// Compute subscription: every notification is one invocation.
#[derive(Debug, Clone)]
pub struct ComputeEndpoint {
    function: Arc<ComputeFunction>,
}

impl ComputeEndpoint {
    pub fn new(function: Arc<ComputeFunction>) -> Self {
        Self { function }
    }
}

#[async_trait]
impl Endpoint for ComputeEndpoint {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let event = Event::json(EventSource::TopicNotification, &json!(notification))
            .map_err(|e| DeliveryError::new(self.function.name(), e.to_string()))?
            .with_attribute("topic", notification.topic.clone());
        self.function
            .invoke(event)
            .await
            .map(|_| ())
            .map_err(|e| DeliveryError::new(self.function.name(), e.to_string()))
    }
}

/// Queue subscription: the notification message becomes the queue body.
#[derive(Debug, Clone)]
pub struct QueueEndpoint {
    queue: MessageQueue,
}

impl QueueEndpoint {
    pub fn new(queue: MessageQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Endpoint for QueueEndpoint {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        self.queue.enqueue(notification.message.clone());
        Ok(())
    }
}
