use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{DeliveryError, DeliveryPolicy, Endpoint, Mailbox, Notification, Protocol, Topic};
use crate::function::{ComputeFunction, Outcome, handler_fn};
use crate::policy::{Authorizer, Principal, actions, resources};
use crate::queue::MessageQueue;

struct SlowEndpoint {
    delay: Duration,
    delivered: Mailbox,
}

#[async_trait]
impl Endpoint for SlowEndpoint {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        tokio::time::sleep(self.delay).await;
        super::EmailEndpoint::new("slow@example.com", self.delivered.clone())
            .deliver(notification)
            .await
    }
}

/// Fails the first `failures` calls.
struct FlakyEndpoint {
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl Endpoint for FlakyEndpoint {
    async fn deliver(&self, _notification: &Notification) -> Result<(), DeliveryError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(DeliveryError::new("flaky", format!("call {call} refused")))
        } else {
            Ok(())
        }
    }
}

fn publisher() -> Principal {
    Principal::new("role/publisher")
}

#[tokio::test]
async fn test_publish_without_grant_is_denied() {
    let mailbox = Mailbox::new();
    let topic = Topic::builder("alerts", Authorizer::new())
        .email("ops@example.com", mailbox.clone())
        .build();

    let err = topic.publish(&publisher(), "hello").unwrap_err();
    assert!(err.is_permission_denied());
    assert!(mailbox.is_empty());

    topic.grant_publish(&publisher());
    let reports = topic.publish(&publisher(), "hello").unwrap().wait().await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].delivered);
    assert_eq!(mailbox.len(), 1);
}

#[tokio::test]
async fn test_every_subscription_receives_the_message() {
    let auth = Authorizer::new();
    auth.grant(&publisher(), actions::PUBLISH, resources::topic("fanout"));
    let mailbox = Mailbox::new();
    let queue = MessageQueue::new("sink", MessageQueue::DEFAULT_VISIBILITY_TIMEOUT, auth.clone());
    let topic = Topic::builder("fanout", auth)
        .email("a@example.com", mailbox.clone())
        .email("b@example.com", mailbox.clone())
        .queue(queue.clone())
        .build();

    assert_eq!(topic.subscriptions().len(), 3);
    assert_eq!(topic.subscriptions()[2].protocol, Protocol::Queue);

    let receipt = topic.publish(&publisher(), "payload").unwrap();
    assert_eq!(receipt.pending(), 3);
    let message_id = receipt.message_id.clone();
    let reports = receipt.wait().await;
    assert!(reports.iter().all(|r| r.delivered && r.attempts == 1));

    let mut addresses: Vec<_> = mailbox.sent().into_iter().map(|(to, _)| to).collect();
    addresses.sort();
    assert_eq!(addresses, vec!["a@example.com", "b@example.com"]);
    assert!(mailbox.sent().iter().all(|(_, n)| n.message_id == message_id));
    assert_eq!(queue.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_subscriber_does_not_delay_others() {
    let auth = Authorizer::new();
    let fast = Mailbox::new();
    let slow = Mailbox::new();
    let topic = Topic::builder("alerts", auth)
        .subscribe(
            Protocol::Email,
            "slow@example.com",
            Arc::new(SlowEndpoint {
                delay: Duration::from_secs(30),
                delivered: slow.clone(),
            }),
        )
        .email("fast@example.com", fast.clone())
        .build();
    topic.grant_publish(&publisher());

    let receipt = topic.publish(&publisher(), "hi").unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fast.len(), 1);
    assert!(slow.is_empty());

    let reports = receipt.wait().await;
    assert!(reports.iter().all(|r| r.delivered));
    assert_eq!(slow.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failing_endpoint_is_retried_with_backoff() {
    let flaky = Arc::new(FlakyEndpoint {
        failures: 2,
        calls: AtomicU32::new(0),
    });
    let topic = Topic::builder("alerts", Authorizer::new())
        .subscribe(Protocol::Email, "flaky@example.com", flaky.clone())
        .build();
    topic.grant_publish(&publisher());

    let start = tokio::time::Instant::now();
    let reports = topic.publish(&publisher(), "retry me").unwrap().wait().await;
    assert!(reports[0].delivered);
    assert_eq!(reports[0].attempts, 3);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    // 100ms then 200ms
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn test_delivery_gives_up_after_max_attempts() {
    let flaky = Arc::new(FlakyEndpoint {
        failures: u32::MAX,
        calls: AtomicU32::new(0),
    });
    let mailbox = Mailbox::new();
    let topic = Topic::builder("alerts", Authorizer::new())
        .subscribe(Protocol::Email, "dead@example.com", flaky.clone())
        .email("ok@example.com", mailbox.clone())
        .delivery_policy(DeliveryPolicy {
            max_attempts: 2,
            ..DeliveryPolicy::default()
        })
        .build();
    topic.grant_publish(&publisher());

    let reports = topic.publish(&publisher(), "x").unwrap().wait().await;
    let dead = reports.iter().find(|r| r.endpoint == "dead@example.com").unwrap();
    assert!(!dead.delivered);
    assert_eq!(dead.attempts, 2);
    assert!(dead.last_error.as_deref().unwrap().contains("refused"));
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    assert_eq!(mailbox.len(), 1);
}

#[tokio::test]
async fn test_compute_subscription_receives_notification_json() {
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let function = Arc::new(ComputeFunction::new(
        "on_alert",
        Arc::new(handler_fn(move |_ctx, event| {
            let sink = sink.clone();
            async move {
                let value = event.payload_json()?;
                sink.lock().push(value["message"].as_str().unwrap_or_default().to_string());
                Ok(Outcome::empty())
            }
        })),
    ));
    let topic = Topic::builder("alerts", Authorizer::new())
        .compute(function)
        .build();
    topic.grant_publish(&publisher());

    let reports = topic.publish(&publisher(), "disk full").unwrap().wait().await;
    assert!(reports[0].delivered);
    assert_eq!(reports[0].endpoint, resources::function("on_alert"));
    assert_eq!(*seen.lock(), vec!["disk full".to_string()]);
}
