//! Change feed consumers
//!
//! A consumer keeps one cursor per partition. Each cursor reads a batch
//! after its checkpoint, invokes the bound function and then either commits
//! the batch or counts a failed attempt. After `retry_attempts` failed
//! attempts the batch is dropped, the checkpoint moves past it and the loss
//! is logged. Partitions progress independently, so a poisoned batch only
//! stalls its own partition.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::event::{Event, EventSource};
use crate::function::{ComputeFunction, HandlerError};
use crate::queue::Batch;
use crate::table::record::{ChangeRecord, StartingPosition};
use crate::table::sled_store::DurableTable;
use crate::utils::{PipelineError, Result};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub name: String,
    pub starting_position: StartingPosition,
    pub batch_size: usize,
    /// Delivery attempts per batch before it is dropped. Values below 1 are
    /// treated as 1.
    pub retry_attempts: u32,
    /// Pause between attempts on the same batch.
    pub retry_backoff: Duration,
}

impl ConsumerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            starting_position: StartingPosition::Latest,
            batch_size: 1,
            retry_attempts: 2,
            retry_backoff: Duration::from_millis(200),
        }
    }

    pub fn starting_position(mut self, position: StartingPosition) -> Self {
        self.starting_position = position;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    fn max_attempts(&self) -> u32 {
        self.retry_attempts.max(1)
    }
}

/// Result of one poll of one partition.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Nothing new after the checkpoint.
    Idle,
    Delivered { count: usize, last_sequence: u64 },
    /// The batch failed and will be offered again.
    Failed { attempt: u32, error: HandlerError },
    /// The batch failed its last attempt and was skipped.
    Dropped {
        first_sequence: u64,
        last_sequence: u64,
        attempts: u32,
    },
}

#[derive(Debug)]
struct PartitionCursor {
    partition: usize,
    checkpoint: Option<u64>,
    failures: u32,
    // last sequence of the batch being retried, so a retry never grows it
    pinned_end: Option<u64>,
}

/// A registered reader of a table's change feed.
#[derive(Debug)]
pub struct ChangeFeedConsumer {
    table: DurableTable,
    config: Arc<ConsumerConfig>,
    cursors: Vec<PartitionCursor>,
}

impl ChangeFeedConsumer {
    pub(crate) fn new(table: DurableTable, config: ConsumerConfig) -> Result<Self> {
        let mut cursors = Vec::with_capacity(table.partitions());
        for partition in 0..table.partitions() {
            let checkpoint = match table.load_checkpoint(&config.name, partition)? {
                Some(stored) => stored,
                None => {
                    let start = match config.starting_position {
                        StartingPosition::TrimHorizon => None,
                        StartingPosition::Latest => table.latest_sequence(partition)?,
                    };
                    // stored even when the partition is empty, so a restart
                    // resumes from registration rather than the current head
                    table.store_checkpoint(&config.name, partition, start)?;
                    start
                }
            };
            cursors.push(PartitionCursor {
                partition,
                checkpoint,
                failures: 0,
                pinned_end: None,
            });
        }

        info!(
            consumer = %config.name,
            table = %table.name(),
            position = ?config.starting_position,
            "change feed consumer registered"
        );

        Ok(Self {
            table,
            config: Arc::new(config),
            cursors,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Last processed sequence number of each partition.
    pub fn checkpoints(&self) -> Vec<Option<u64>> {
        self.cursors.iter().map(|c| c.checkpoint).collect()
    }

    /// Poll every partition once, in partition order.
    pub async fn poll_once(&mut self, function: &ComputeFunction) -> Result<Vec<PollOutcome>> {
        let mut outcomes = Vec::with_capacity(self.cursors.len());
        for cursor in &mut self.cursors {
            outcomes.push(poll_partition(&self.table, &self.config, cursor, function).await?);
        }
        Ok(outcomes)
    }

    /// Drive every partition until `shutdown` flips to `true`.
    pub async fn run(self, function: Arc<ComputeFunction>, shutdown: watch::Receiver<bool>) {
        let Self {
            table,
            config,
            cursors,
        } = self;

        let tasks = cursors.into_iter().map(|cursor| {
            run_partition(
                table.clone(),
                config.clone(),
                cursor,
                function.clone(),
                shutdown.clone(),
            )
        });
        futures::future::join_all(tasks).await;
        info!(consumer = %config.name, "change feed consumer stopped");
    }
}

async fn run_partition(
    table: DurableTable,
    config: Arc<ConsumerConfig>,
    mut cursor: PartitionCursor,
    function: Arc<ComputeFunction>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut changes = table.subscribe_changes();

    while !*shutdown.borrow() {
        let pause = match poll_partition(&table, &config, &mut cursor, &function).await {
            Ok(PollOutcome::Idle) => None,
            Ok(PollOutcome::Failed { .. }) => Some(config.retry_backoff),
            Ok(_) => continue,
            Err(e) => {
                error!(consumer = %config.name, partition = cursor.partition, "feed read failed: {e}");
                Some(config.retry_backoff)
            }
        };

        tokio::select! {
            res = changes.changed(), if pause.is_none() => {
                if res.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(pause.unwrap_or_default()), if pause.is_some() => {}
            res = shutdown.changed() => {
                if res.is_err() {
                    break;
                }
            }
        }
    }
}

async fn poll_partition(
    table: &DurableTable,
    config: &ConsumerConfig,
    cursor: &mut PartitionCursor,
    function: &ComputeFunction,
) -> Result<PollOutcome> {
    let mut records = table.read_partition(cursor.partition, cursor.checkpoint, config.batch_size)?;
    if let Some(end) = cursor.pinned_end {
        records.retain(|r| r.sequence_number <= end);
    }
    let (Some(first), Some(last)) = (records.first(), records.last()) else {
        cursor.pinned_end = None;
        return Ok(PollOutcome::Idle);
    };
    let first_sequence = first.sequence_number;
    let last_sequence = last.sequence_number;
    let count = records.len();

    let batch = Batch::new(records, config.batch_size, Duration::ZERO);
    let event = feed_event(table, cursor.partition, &batch)?;

    let failure = match function.invoke(event).await {
        Ok(outcome) if outcome.failed_items().is_empty() => None,
        Ok(outcome) => Some(HandlerError::Failed(format!(
            "{} of {count} records reported failed",
            outcome.failed_items().len()
        ))),
        Err(e) => Some(e),
    };

    match failure {
        None => {
            commit(table, config, cursor, last_sequence)?;
            debug!(
                consumer = %config.name,
                partition = cursor.partition,
                count,
                last_sequence,
                "change batch delivered"
            );
            Ok(PollOutcome::Delivered {
                count,
                last_sequence,
            })
        }
        Some(error) => {
            cursor.failures += 1;
            let attempts = cursor.failures;
            if attempts >= config.max_attempts() {
                let err = PipelineError::RetryExhausted {
                    consumer: config.name.clone(),
                    partition: cursor.partition,
                    first_sequence,
                    last_sequence,
                    attempts,
                };
                error!(last_error = %error, "{err}; batch dropped, data loss risk");
                commit(table, config, cursor, last_sequence)?;
                Ok(PollOutcome::Dropped {
                    first_sequence,
                    last_sequence,
                    attempts,
                })
            } else {
                warn!(
                    consumer = %config.name,
                    partition = cursor.partition,
                    attempt = attempts,
                    max_attempts = config.max_attempts(),
                    "change batch failed: {error}"
                );
                cursor.pinned_end = Some(last_sequence);
                Ok(PollOutcome::Failed {
                    attempt: attempts,
                    error,
                })
            }
        }
    }
}

fn commit(
    table: &DurableTable,
    config: &ConsumerConfig,
    cursor: &mut PartitionCursor,
    sequence: u64,
) -> Result<()> {
    table.store_checkpoint(&config.name, cursor.partition, Some(sequence))?;
    cursor.checkpoint = Some(sequence);
    cursor.failures = 0;
    cursor.pinned_end = None;
    Ok(())
}

fn feed_event(table: &DurableTable, partition: usize, batch: &Batch<ChangeRecord>) -> Result<Event> {
    let event = Event::json(EventSource::TableChange, &json!({ "Records": batch.items }))?
        .with_attribute("table", table.name())
        .with_attribute("partition", partition.to_string());
    Ok(event)
}
