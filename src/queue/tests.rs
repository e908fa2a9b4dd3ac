use std::time::Duration;

use super::MessageQueue;
use crate::policy::{Authorizer, Principal, actions};

const VISIBILITY: Duration = Duration::from_secs(20);

// the paused clock fires timers on millisecond ticks
fn assert_within(elapsed: Duration, expected: Duration) {
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(10),
        "elapsed {elapsed:?}, expected about {expected:?}"
    );
}

fn queue() -> MessageQueue {
    MessageQueue::new("test_queue", VISIBILITY, Authorizer::new())
}

#[tokio::test(start_paused = true)]
async fn test_receive_hides_message_for_visibility_timeout() {
    let queue = queue();
    let id = queue.enqueue("hello");

    let batch = queue.receive_batch(1, Duration::ZERO).await;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.items[0].id, id);
    assert_eq!(batch.items[0].body_text(), "hello");
    assert_eq!(batch.items[0].receive_count, 1);

    // hidden while in flight
    let again = queue.receive_batch(1, Duration::ZERO).await;
    assert!(again.is_empty());
    assert_eq!(queue.approximate_in_flight(), 1);
    assert_eq!(queue.approximate_visible(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unacked_message_is_redelivered_once_per_interval() {
    let queue = queue();
    let id = queue.enqueue("poison");

    let mut counts = Vec::new();
    for _ in 0..4 {
        let batch = queue.receive_batch(1, Duration::ZERO).await;
        assert_eq!(batch.len(), 1, "exactly one redelivery per interval");
        assert_eq!(batch.items[0].id, id);
        counts.push(batch.items[0].receive_count);

        tokio::time::advance(VISIBILITY - Duration::from_secs(1)).await;
        assert!(queue.receive_batch(1, Duration::ZERO).await.is_empty());
        tokio::time::advance(Duration::from_secs(1)).await;
    }

    assert_eq!(counts, vec![1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn test_acked_message_is_never_redelivered() {
    let queue = queue();
    queue.enqueue("done");

    let batch = queue.receive_batch(1, Duration::ZERO).await;
    queue.ack(&batch.items[0].id).unwrap();
    assert!(queue.is_empty());

    tokio::time::advance(VISIBILITY * 3).await;
    assert!(queue.receive_batch(10, Duration::ZERO).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_ack_unknown_message_is_an_error() {
    let queue = queue();
    assert!(queue.ack("missing").is_err());
}

#[tokio::test(start_paused = true)]
async fn test_partial_failure_releases_only_failed_items() {
    let queue = queue();
    for i in 0..4 {
        queue.enqueue(format!("msg{i}"));
    }

    let batch = queue.receive_batch(4, Duration::ZERO).await;
    assert_eq!(batch.len(), 4);
    let failed = vec![batch.items[1].id.clone(), batch.items[3].id.clone()];

    let deleted = queue.complete_batch(&batch, &failed);
    assert_eq!(deleted, 2);
    assert_eq!(queue.len(), 2);

    // failed items come back right away, the rest never do
    let retry = queue.receive_batch(10, Duration::ZERO).await;
    let mut ids = retry.message_ids();
    ids.sort();
    let mut expected = failed.clone();
    expected.sort();
    assert_eq!(ids, expected);
    assert!(retry.items.iter().all(|m| m.receive_count == 2));
}

#[tokio::test(start_paused = true)]
async fn test_empty_failure_report_acknowledges_whole_batch() {
    let queue = queue();
    queue.enqueue("a");
    queue.enqueue("b");

    let batch = queue.receive_batch(2, Duration::ZERO).await;
    let deleted = queue.complete_batch::<String>(&batch, &[]);
    assert_eq!(deleted, 2);
    assert!(queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_report_failure_skips_unknown_ids() {
    let queue = queue();
    queue.enqueue("a");
    let batch = queue.receive_batch(1, Duration::ZERO).await;

    let released = queue.report_failure(&[batch.items[0].id.as_str(), "nope"]);
    assert_eq!(released, 1);
    assert_eq!(queue.approximate_visible(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_batch_closes_when_full() {
    let queue = queue();
    for i in 0..5 {
        queue.enqueue(format!("m{i}"));
    }

    let start = tokio::time::Instant::now();
    let batch = queue.receive_batch(3, Duration::from_secs(60)).await;
    assert_eq!(batch.len(), 3);
    assert!(batch.is_full());
    assert_eq!(start.elapsed(), Duration::ZERO);
    let bodies: Vec<_> = batch.items.iter().map(|m| m.body_text()).collect();
    assert_eq!(bodies, vec!["m0", "m1", "m2"]);
}

#[tokio::test(start_paused = true)]
async fn test_batch_closes_when_window_elapses() {
    let queue = queue();
    queue.enqueue("only");

    let start = tokio::time::Instant::now();
    let batch = queue.receive_batch(10, Duration::from_secs(5)).await;
    assert_eq!(batch.len(), 1);
    assert_within(start.elapsed(), Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_empty_queue_returns_empty_batch_after_window() {
    let queue = queue();
    let start = tokio::time::Instant::now();
    let batch = queue.receive_batch(1, Duration::from_secs(2)).await;
    assert!(batch.is_empty());
    assert_within(start.elapsed(), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_single_message_batch_returns_on_arrival() {
    let queue = queue();
    let producer = queue.clone();

    let receiver = tokio::spawn(async move { queue.receive_batch(1, Duration::from_secs(60)).await });
    tokio::time::sleep(Duration::from_secs(3)).await;
    producer.enqueue("late");

    let batch = receiver.await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.items[0].body_text(), "late");
}

#[tokio::test(start_paused = true)]
async fn test_waiting_receiver_wakes_when_visibility_expires() {
    let queue = queue();
    queue.enqueue("x");
    let first = queue.receive_batch(1, Duration::ZERO).await;
    assert_eq!(first.len(), 1);

    let start = tokio::time::Instant::now();
    let second = queue.receive_batch(1, Duration::from_secs(60)).await;
    assert_eq!(second.len(), 1);
    assert_eq!(second.items[0].receive_count, 2);
    assert_within(start.elapsed(), VISIBILITY);
}

#[tokio::test(start_paused = true)]
async fn test_send_message_requires_grant() {
    let auth = Authorizer::new();
    let queue = MessageQueue::new("orders", VISIBILITY, auth.clone());
    let role = Principal::new("role/api");

    let err = queue.send_message(&role, "hi").unwrap_err();
    assert!(err.is_permission_denied());
    assert!(queue.is_empty());

    auth.grant(&role, actions::SEND_MESSAGE, queue.resource());
    queue.send_message(&role, "hi").unwrap();
    assert_eq!(queue.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_receive_leaves_messages_visible() {
    let queue = queue();
    let id = queue.enqueue("patient");

    let cancelled = tokio::time::timeout(
        Duration::from_secs(1),
        queue.receive_batch(2, Duration::from_secs(60)),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(queue.approximate_visible(), 1);
    assert_eq!(queue.approximate_in_flight(), 0);

    let batch = queue.receive_batch(1, Duration::ZERO).await;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.items[0].id, id);
    assert_eq!(batch.items[0].receive_count, 1);
}
