use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::function::ComputeFunction;
use crate::policy::{Authorizer, Principal, actions, resources};
use crate::queue::MessageQueue;
use crate::topic::endpoint::{ComputeEndpoint, EmailEndpoint, Endpoint, Mailbox, QueueEndpoint};
use crate::utils::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Email,
    Compute,
    Queue,
}

/// A subscriber of a topic. Fixed for the topic's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub topic_id: String,
    /// Protocol-specific address, opaque to the topic.
    pub endpoint: String,
    pub protocol: Protocol,
}

/// The message every subscriber receives for one publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub message_id: String,
    pub topic: String,
    pub subject: Option<String>,
    pub message: String,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: i64,
}

/// Per-subscription retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Outcome of delivering one notification to one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub subscription_id: String,
    pub endpoint: String,
    pub protocol: Protocol,
    pub attempts: u32,
    pub delivered: bool,
    pub last_error: Option<String>,
}

/// Returned by [`Topic::publish`]. Deliveries are already running; awaiting
/// them is optional.
#[derive(Debug)]
pub struct PublishReceipt {
    pub message_id: String,
    deliveries: Vec<JoinHandle<DeliveryReport>>,
}

impl PublishReceipt {
    pub fn pending(&self) -> usize {
        self.deliveries.len()
    }

    /// Wait for every delivery to finish.
    pub async fn wait(self) -> Vec<DeliveryReport> {
        futures::future::join_all(self.deliveries)
            .await
            .into_iter()
            .filter_map(|res| match res {
                Ok(report) => Some(report),
                Err(e) => {
                    error!("delivery task failed: {e}");
                    None
                }
            })
            .collect()
    }
}

struct Binding {
    subscription: Subscription,
    endpoint: Arc<dyn Endpoint>,
}

/// A named topic with a fixed set of subscriptions.
pub struct Topic {
    name: String,
    bindings: Vec<Binding>,
    authorizer: Authorizer,
    policy: DeliveryPolicy,
}

impl Topic {
    pub fn builder(name: impl Into<String>, authorizer: Authorizer) -> TopicBuilder {
        TopicBuilder {
            name: name.into(),
            authorizer,
            bindings: Vec::new(),
            policy: DeliveryPolicy::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource(&self) -> String {
        resources::topic(&self.name)
    }

    pub fn subscriptions(&self) -> Vec<&Subscription> {
        self.bindings.iter().map(|b| &b.subscription).collect()
    }

    /// Allow `principal` to publish. Grants cannot be revoked.
    pub fn grant_publish(&self, principal: &Principal) {
        info!(topic = %self.name, %principal, "publish granted");
        self.authorizer
            .grant(principal, actions::PUBLISH, self.resource());
    }

    pub fn publish(&self, principal: &Principal, message: impl Into<String>) -> Result<PublishReceipt> {
        self.publish_with_subject(principal, None, message)
    }

    /// Fan a message out to every subscription.
    ///
    /// Fails only when `principal` lacks `topic:Publish`. Each subscription
    /// gets its own delivery task, so this returns before any endpoint has
    /// been called. Must run inside a tokio runtime.
    pub fn publish_with_subject(
        &self,
        principal: &Principal,
        subject: Option<String>,
        message: impl Into<String>,
    ) -> Result<PublishReceipt> {
        self.authorizer
            .check(principal, actions::PUBLISH, &self.resource())?;

        let notification = Arc::new(Notification {
            message_id: Uuid::new_v4().to_string(),
            topic: self.name.clone(),
            subject,
            message: message.into(),
            timestamp: Utc::now().timestamp_millis(),
        });

        let deliveries = self
            .bindings
            .iter()
            .map(|binding| {
                tokio::spawn(deliver_with_retry(
                    binding.subscription.clone(),
                    binding.endpoint.clone(),
                    notification.clone(),
                    self.policy,
                ))
            })
            .collect();

        debug!(
            topic = %self.name,
            message_id = %notification.message_id,
            subscriptions = self.bindings.len(),
            "published"
        );

        Ok(PublishReceipt {
            message_id: notification.message_id.clone(),
            deliveries,
        })
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("subscriptions", &self.subscriptions())
            .field("policy", &self.policy)
            .finish()
    }
}

async fn deliver_with_retry(
    subscription: Subscription,
    endpoint: Arc<dyn Endpoint>,
    notification: Arc<Notification>,
    policy: DeliveryPolicy,
) -> DeliveryReport {
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = policy.initial_backoff;
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        match endpoint.deliver(&notification).await {
            Ok(()) => {
                return DeliveryReport {
                    subscription_id: subscription.id,
                    endpoint: subscription.endpoint,
                    protocol: subscription.protocol,
                    attempts: attempt,
                    delivered: true,
                    last_error: None,
                };
            }
            Err(e) => {
                warn!(
                    subscription = %subscription.id,
                    attempt,
                    max_attempts,
                    "{e}"
                );
                last_error = Some(e.to_string());
                if attempt < max_attempts {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(policy.max_backoff);
                }
            }
        }
    }

    error!(
        subscription = %subscription.id,
        endpoint = %subscription.endpoint,
        message_id = %notification.message_id,
        "giving up on delivery"
    );
    DeliveryReport {
        subscription_id: subscription.id,
        endpoint: subscription.endpoint,
        protocol: subscription.protocol,
        attempts: max_attempts,
        delivered: false,
        last_error,
    }
}

/// Collects the subscriptions of a topic before it is frozen.
pub struct TopicBuilder {
    name: String,
    authorizer: Authorizer,
    bindings: Vec<Binding>,
    policy: DeliveryPolicy,
}

impl TopicBuilder {
    pub fn subscribe(
        mut self,
        protocol: Protocol,
        address: impl Into<String>,
        endpoint: Arc<dyn Endpoint>,
    ) -> Self {
        let subscription = Subscription {
            id: Uuid::new_v4().to_string(),
            topic_id: self.name.clone(),
            endpoint: address.into(),
            protocol,
        };
        self.bindings.push(Binding {
            subscription,
            endpoint,
        });
        self
    }

    pub fn email(self, address: impl Into<String>, mailbox: Mailbox) -> Self {
        let address = address.into();
        let endpoint = Arc::new(EmailEndpoint::new(address.clone(), mailbox));
        self.subscribe(Protocol::Email, address, endpoint)
    }

    pub fn compute(self, function: Arc<ComputeFunction>) -> Self {
        let address = resources::function(function.name());
        self.subscribe(Protocol::Compute, address, Arc::new(ComputeEndpoint::new(function)))
    }

    pub fn queue(self, queue: MessageQueue) -> Self {
        let address = queue.resource();
        self.subscribe(Protocol::Queue, address, Arc::new(QueueEndpoint::new(queue)))
    }

    pub fn delivery_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Arc<Topic> {
        Arc::new(Topic {
            name: self.name,
            bindings: self.bindings,
            authorizer: self.authorizer,
            policy: self.policy,
        })
    }
}
