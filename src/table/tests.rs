use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tempfile::tempdir;

use super::{
    ChangeEventType, ChangeFeedConsumer, ConsumerConfig, DurableTable, Item, PollOutcome,
    Retention, StartingPosition, TableOptions,
};
use crate::event::EventSource;
use crate::function::{ComputeFunction, HandlerError, Outcome, handler_fn};
use crate::policy::{Authorizer, Principal, actions};
use crate::utils::PipelineError;

fn item(value: serde_json::Value) -> Item {
    value.as_object().cloned().unwrap_or_default()
}

fn table(partitions: usize) -> DurableTable {
    let options = TableOptions {
        partitions,
        retention: Retention {
            max_age: None,
            max_records_per_partition: None,
        },
    };
    DurableTable::temporary("events", options, Authorizer::new()).unwrap()
}

/// A function that records every sequence number it sees and fails the
/// first `fail_times` invocations.
fn recording_function(
    seen: Arc<Mutex<Vec<(usize, u64)>>>,
    fail_times: usize,
) -> (ComputeFunction, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = handler_fn(move |_ctx, event| {
        let seen = seen.clone();
        let counter = counter.clone();
        async move {
            assert_eq!(event.source(), EventSource::TableChange);
            let call = counter.fetch_add(1, Ordering::SeqCst);
            if call < fail_times {
                return Err(HandlerError::Failed(format!("failure {call}")));
            }
            let payload = event.payload_json()?;
            for record in payload["Records"].as_array().cloned().unwrap_or_default() {
                let partition = record["partition"].as_u64().unwrap_or_default() as usize;
                let seq = record["sequence_number"].as_u64().unwrap_or_default();
                seen.lock().push((partition, seq));
            }
            Ok(Outcome::empty())
        }
    });
    (ComputeFunction::new("consumer", Arc::new(handler)), calls)
}

#[test]
fn test_put_get_and_event_types() {
    let table = table(1);
    let first = table.put("a", item(json!({"message": "one"}))).unwrap();
    assert_eq!(first.event_type, ChangeEventType::Insert);
    assert_eq!(first.table_key, "a");

    let second = table.put("a", item(json!({"message": "two"}))).unwrap();
    assert_eq!(second.event_type, ChangeEventType::Modify);
    assert!(second.sequence_number > first.sequence_number);
    assert_eq!(table.get("a").unwrap().unwrap()["message"], "two");

    let removed = table.delete("a").unwrap().unwrap();
    assert_eq!(removed.event_type, ChangeEventType::Remove);
    assert_eq!(removed.image["message"], "two");
    assert!(table.get("a").unwrap().is_none());
    assert!(table.delete("a").unwrap().is_none());
}

#[test]
fn test_same_key_always_lands_in_same_partition() {
    let table = table(8);
    let p = table.partition_for("order-17");
    for _ in 0..3 {
        assert_eq!(table.put("order-17", Item::new()).unwrap().partition, p);
    }
    assert!(p < 8);
}

#[test]
fn test_put_item_requires_grant() {
    let auth = Authorizer::new();
    let table = DurableTable::temporary("events", TableOptions::default(), auth.clone()).unwrap();
    let writer = Principal::new("role/writer");

    assert!(table.put_item(&writer, "k", Item::new()).unwrap_err().is_permission_denied());
    auth.grant(&writer, actions::PUT_ITEM, table.resource());
    table.put_item(&writer, "k", Item::new()).unwrap();
    assert_eq!(table.len(), 1);
}

#[test]
fn test_retention_trims_oldest_records() {
    let options = TableOptions {
        partitions: 1,
        retention: Retention {
            max_age: None,
            max_records_per_partition: Some(3),
        },
    };
    let table = DurableTable::temporary("events", options, Authorizer::new()).unwrap();
    let sequences: Vec<u64> = (0..5)
        .map(|i| table.put(&format!("k{i}"), Item::new()).unwrap().sequence_number)
        .collect();

    let retained = table.read_partition(0, None, 10).unwrap();
    let retained: Vec<u64> = retained.iter().map(|r| r.sequence_number).collect();
    assert_eq!(retained, sequences[2..].to_vec());
    assert_eq!(table.oldest_sequence(0).unwrap(), Some(sequences[2]));
}

#[tokio::test]
async fn test_trim_horizon_replays_in_order_per_partition() {
    let table = table(3);
    for i in 0..12 {
        table.put(&format!("key-{}", i % 5), item(json!({"n": i}))).unwrap();
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let (function, _) = recording_function(seen.clone(), 0);
    let mut consumer = table
        .register_consumer(
            ConsumerConfig::new("replay")
                .starting_position(StartingPosition::TrimHorizon)
                .batch_size(4),
        )
        .unwrap();

    drain(&mut consumer, &function).await;

    let seen = seen.lock().clone();
    assert_eq!(seen.len(), 12);
    for partition in 0..3 {
        let seqs: Vec<u64> = seen
            .iter()
            .filter(|(p, _)| *p == partition)
            .map(|(_, s)| *s)
            .collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "partition {partition} out of order");
    }
}

#[tokio::test]
async fn test_latest_skips_records_before_registration() {
    let table = table(2);
    let before: Vec<u64> = (0..4)
        .map(|i| table.put(&format!("old-{i}"), Item::new()).unwrap().sequence_number)
        .collect();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let (function, _) = recording_function(seen.clone(), 0);
    let mut consumer = table
        .register_consumer(ConsumerConfig::new("tail").starting_position(StartingPosition::Latest))
        .unwrap();

    let after = table.put("new", Item::new()).unwrap().sequence_number;
    drain(&mut consumer, &function).await;

    let seen: Vec<u64> = seen.lock().iter().map(|(_, s)| *s).collect();
    assert_eq!(seen, vec![after]);
    assert!(before.iter().all(|s| !seen.contains(s)));
}

#[tokio::test]
async fn test_batch_dropped_after_retry_attempts() {
    let table = table(1);
    let dropped = table.put("poison", Item::new()).unwrap().sequence_number;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let (function, calls) = recording_function(seen.clone(), usize::MAX);
    let mut consumer = table
        .register_consumer(
            ConsumerConfig::new("strict")
                .starting_position(StartingPosition::TrimHorizon)
                .retry_attempts(2),
        )
        .unwrap();

    let first = consumer.poll_once(&function).await.unwrap();
    assert!(matches!(first[0], PollOutcome::Failed { attempt: 1, .. }));

    let second = consumer.poll_once(&function).await.unwrap();
    assert_eq!(
        second[0],
        PollOutcome::Dropped {
            first_sequence: dropped,
            last_sequence: dropped,
            attempts: 2
        }
    );

    // never offered again
    let third = consumer.poll_once(&function).await.unwrap();
    assert_eq!(third[0], PollOutcome::Idle);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(consumer.checkpoints(), vec![Some(dropped)]);
}

#[tokio::test]
async fn test_fewer_failures_than_retry_attempts_eventually_succeeds() {
    let table = table(1);
    let seq = table.put("flaky", Item::new()).unwrap().sequence_number;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let (function, calls) = recording_function(seen.clone(), 2);
    let mut consumer = table
        .register_consumer(
            ConsumerConfig::new("patient")
                .starting_position(StartingPosition::TrimHorizon)
                .retry_attempts(3),
        )
        .unwrap();

    assert!(matches!(consumer.poll_once(&function).await.unwrap()[0], PollOutcome::Failed { attempt: 1, .. }));
    assert!(matches!(consumer.poll_once(&function).await.unwrap()[0], PollOutcome::Failed { attempt: 2, .. }));
    assert_eq!(
        consumer.poll_once(&function).await.unwrap()[0],
        PollOutcome::Delivered {
            count: 1,
            last_sequence: seq
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(seen.lock().clone(), vec![(0, seq)]);
}

#[tokio::test]
async fn test_retry_does_not_grow_the_failing_batch() {
    let table = table(1);
    let first = table.put("a", Item::new()).unwrap().sequence_number;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let (function, _) = recording_function(seen.clone(), 1);
    let mut consumer = table
        .register_consumer(
            ConsumerConfig::new("pinned")
                .starting_position(StartingPosition::TrimHorizon)
                .batch_size(10),
        )
        .unwrap();

    assert!(matches!(consumer.poll_once(&function).await.unwrap()[0], PollOutcome::Failed { .. }));
    let second = table.put("b", Item::new()).unwrap().sequence_number;

    assert_eq!(
        consumer.poll_once(&function).await.unwrap()[0],
        PollOutcome::Delivered {
            count: 1,
            last_sequence: first
        }
    );
    assert_eq!(
        consumer.poll_once(&function).await.unwrap()[0],
        PollOutcome::Delivered {
            count: 1,
            last_sequence: second
        }
    );
}

#[tokio::test]
async fn test_consumer_resumes_from_persisted_checkpoint() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let path = path.to_str().unwrap();
    let options = TableOptions {
        partitions: 1,
        retention: Retention::default(),
    };
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (function, _) = recording_function(seen.clone(), 0);

    {
        let table = DurableTable::open(path, "events", options, Authorizer::new()).unwrap();
        table.put("a", Item::new()).unwrap();
        let mut consumer = table
            .register_consumer(ConsumerConfig::new("durable").starting_position(StartingPosition::TrimHorizon))
            .unwrap();
        drain(&mut consumer, &function).await;
        table.put("b", Item::new()).unwrap();
        table.flush().unwrap();
    }

    let table = DurableTable::open(path, "events", options, Authorizer::new()).unwrap();
    let mut consumer = table
        .register_consumer(ConsumerConfig::new("durable").starting_position(StartingPosition::TrimHorizon))
        .unwrap();
    seen.lock().clear();
    drain(&mut consumer, &function).await;

    assert_eq!(seen.lock().len(), 1, "only the record after the checkpoint");
}

#[tokio::test]
async fn test_latest_on_empty_partition_keeps_registration_across_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let path = path.to_str().unwrap();
    let options = TableOptions {
        partitions: 1,
        retention: Retention::default(),
    };

    let written = {
        let table = DurableTable::open(path, "events", options, Authorizer::new()).unwrap();
        let consumer = table
            .register_consumer(ConsumerConfig::new("durable").starting_position(StartingPosition::Latest))
            .unwrap();
        assert_eq!(consumer.checkpoints(), vec![None]);
        let seq = table.put("after-registration", Item::new()).unwrap().sequence_number;
        table.flush().unwrap();
        seq
    };

    let table = DurableTable::open(path, "events", options, Authorizer::new()).unwrap();
    let mut consumer = table
        .register_consumer(ConsumerConfig::new("durable").starting_position(StartingPosition::Latest))
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (function, _) = recording_function(seen.clone(), 0);
    drain(&mut consumer, &function).await;

    assert_eq!(seen.lock().clone(), vec![(0, written)]);
}

#[test]
fn test_out_of_range_partition_is_an_error() {
    let table = table(2);
    assert!(matches!(
        table.read_partition(5, None, 1),
        Err(PipelineError::UnknownPartition {
            partition: 5,
            partitions: 2
        })
    ));
    assert!(table.latest_sequence(2).is_err());
    assert!(table.oldest_sequence(9).is_err());
    assert_eq!(table.latest_sequence(1).unwrap(), None);
}

#[test]
fn test_delete_item_requires_grant() {
    let auth = Authorizer::new();
    let table = DurableTable::temporary("events", TableOptions::default(), auth.clone()).unwrap();
    let cleaner = Principal::new("role/cleaner");
    table.put("k", Item::new()).unwrap();

    assert!(table.delete_item(&cleaner, "k").unwrap_err().is_permission_denied());
    assert_eq!(table.len(), 1);

    auth.grant(&cleaner, actions::DELETE_ITEM, table.resource());
    let removed = table.delete_item(&cleaner, "k").unwrap().unwrap();
    assert_eq!(removed.event_type, ChangeEventType::Remove);
    assert!(table.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_run_delivers_new_records_until_shutdown() {
    let table = table(2);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (function, _) = recording_function(seen.clone(), 0);
    let consumer = table
        .register_consumer(ConsumerConfig::new("live").retry_backoff(Duration::from_millis(10)))
        .unwrap();

    let (stop, shutdown) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(consumer.run(Arc::new(function), shutdown));

    for i in 0..4 {
        table.put(&format!("k{i}"), Item::new()).unwrap();
    }
    for _ in 0..50 {
        if seen.lock().len() == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(seen.lock().len(), 4);

    stop.send(true).unwrap();
    handle.await.unwrap();
}

async fn drain(consumer: &mut ChangeFeedConsumer, function: &ComputeFunction) {
    loop {
        let outcomes = consumer.poll_once(function).await.unwrap();
        if outcomes.iter().all(|o| *o == PollOutcome::Idle) {
            break;
        }
    }
}
