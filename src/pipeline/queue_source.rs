use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::event::{Event, EventSource};
use crate::function::ComputeFunction;
use crate::queue::{Batch, MessageQueue, QueueMessage};
use crate::utils::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSourceConfig {
    pub batch_size: usize,
    pub max_batching_window: Duration,
    /// Honor itemized failure reports. When off, any reported failure fails
    /// the whole batch.
    pub report_batch_item_failures: bool,
}

impl Default for QueueSourceConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            max_batching_window: Duration::from_secs(60),
            report_batch_item_failures: true,
        }
    }
}

/// What happened to one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The batching window closed with nothing to deliver.
    Empty,
    Acked { count: usize },
    /// `failed` are visible again; the rest were deleted.
    PartiallyFailed { acked: usize, failed: Vec<String> },
    /// Nothing was deleted. The batch reappears when its visibility expires.
    Failed { count: usize, reason: String },
}

/// Feeds queue batches into a function.
#[derive(Debug, Clone)]
pub struct QueueEventSource {
    queue: MessageQueue,
    function: Arc<ComputeFunction>,
    config: QueueSourceConfig,
}

impl QueueEventSource {
    pub fn new(queue: MessageQueue, function: Arc<ComputeFunction>, config: QueueSourceConfig) -> Self {
        Self {
            queue,
            function,
            config,
        }
    }

    pub fn config(&self) -> QueueSourceConfig {
        self.config
    }

    /// Receive one batch, invoke the function once with it and settle it.
    pub async fn poll_once(&self) -> Result<BatchOutcome> {
        let batch = self
            .queue
            .receive_batch(self.config.batch_size, self.config.max_batching_window)
            .await;
        if batch.is_empty() {
            return Ok(BatchOutcome::Empty);
        }
        let count = batch.len();
        let event = batch_event(&self.queue, &batch)?;

        let failed = match self.function.invoke(event).await {
            Ok(outcome) => outcome.failed_items().to_vec(),
            Err(e) => {
                warn!(
                    queue = %self.queue.name(),
                    function = %self.function.name(),
                    count,
                    "batch failed, waiting for visibility timeout: {e}"
                );
                return Ok(BatchOutcome::Failed {
                    count,
                    reason: e.to_string(),
                });
            }
        };

        if failed.is_empty() {
            let acked = self.queue.complete_batch::<String>(&batch, &[]);
            return Ok(BatchOutcome::Acked { count: acked });
        }

        let reason = if !self.config.report_batch_item_failures {
            Some("item failures reported but reporting is disabled".to_string())
        } else if let Some(unknown) = failed.iter().find(|id| !batch.contains(id)) {
            Some(format!("failure report names unknown message {unknown}"))
        } else {
            None
        };
        if let Some(reason) = reason {
            warn!(queue = %self.queue.name(), count, "{reason}; whole batch failed");
            return Ok(BatchOutcome::Failed { count, reason });
        }

        let acked = self.queue.complete_batch(&batch, &failed);
        debug!(queue = %self.queue.name(), acked, failed = failed.len(), "partial batch failure");
        Ok(BatchOutcome::PartiallyFailed { acked, failed })
    }

    /// Poll until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            queue = %self.queue.name(),
            function = %self.function.name(),
            "queue event source started"
        );
        while !*shutdown.borrow() {
            tokio::select! {
                res = self.poll_once() => {
                    if let Err(e) = res {
                        error!(queue = %self.queue.name(), "queue poll failed: {e}");
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }
        info!(queue = %self.queue.name(), "queue event source stopped");
    }
}

fn batch_event(queue: &MessageQueue, batch: &Batch<QueueMessage>) -> Result<Event> {
    let records: Vec<Value> = batch
        .items
        .iter()
        .map(|message| {
            json!({
                "messageId": message.id,
                "body": message.body_text(),
                "attributes": {
                    "ApproximateReceiveCount": message.receive_count.to_string(),
                    "SentTimestamp": message.enqueued_at.timestamp_millis().to_string(),
                },
                "eventSource": "eventpipe:queue",
                "eventSourceResource": queue.resource(),
            })
        })
        .collect();
    let event = Event::json(EventSource::QueueMessage, &json!({ "Records": records }))?
        .with_attribute("queue", queue.name());
    Ok(event)
}
