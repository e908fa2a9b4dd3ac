use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::event::Event;
use crate::function::ComputeFunction;
use crate::object_store::ObjectStore;

/// Retry policy for asynchronous invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncRetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for AsyncRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeReport {
    pub key: String,
    pub attempts: u32,
    pub succeeded: bool,
}

/// Invokes a function for every object created under a prefix.
///
/// Each notification is invoked on its own task, so there is no ordering
/// across objects.
#[derive(Debug)]
pub struct ObjectNotificationSource {
    bucket: String,
    prefix: String,
    events: UnboundedReceiver<Event>,
    function: Arc<ComputeFunction>,
    retry: AsyncRetryPolicy,
}

impl ObjectNotificationSource {
    /// Registers the prefix listener right away; uploads made after this
    /// call are never missed.
    pub fn new(
        store: &ObjectStore,
        prefix: impl Into<String>,
        function: Arc<ComputeFunction>,
        retry: AsyncRetryPolicy,
    ) -> Self {
        let prefix = prefix.into();
        Self {
            bucket: store.bucket().to_string(),
            events: store.on_create(prefix.clone()),
            prefix,
            function,
            retry,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Deliver the next notification. `None` once the store is gone.
    pub async fn process_next(&mut self) -> Option<InvokeReport> {
        let event = self.events.recv().await?;
        Some(invoke_with_retry(self.function.clone(), event, self.retry).await)
    }

    /// Deliver notifications until `shutdown` flips to `true` or the store
    /// is dropped. In-flight invocations are awaited before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(bucket = %self.bucket, prefix = %self.prefix, function = %self.function.name(), "object notifications started");
        let mut inflight = JoinSet::new();

        while !*shutdown.borrow() {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    inflight.spawn(invoke_with_retry(self.function.clone(), event, self.retry));
                }
                Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }

        while inflight.join_next().await.is_some() {}
        info!(bucket = %self.bucket, prefix = %self.prefix, "object notifications stopped");
    }
}

async fn invoke_with_retry(
    function: Arc<ComputeFunction>,
    event: Event,
    policy: AsyncRetryPolicy,
) -> InvokeReport {
    let key = event.attribute("key").unwrap_or_default().to_string();
    let max_attempts = policy.max_retries + 1;
    let mut backoff = policy.initial_backoff;

    for attempt in 1..=max_attempts {
        match function.invoke(event.clone()).await {
            Ok(_) => {
                return InvokeReport {
                    key,
                    attempts: attempt,
                    succeeded: true,
                };
            }
            Err(e) if attempt < max_attempts => {
                warn!(function = %function.name(), %key, attempt, "invocation failed, retrying: {e}");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => {
                error!(
                    function = %function.name(),
                    %key,
                    attempts = attempt,
                    "invocation failed, event dropped: {e}"
                );
            }
        }
    }

    InvokeReport {
        key,
        attempts: max_attempts,
        succeeded: false,
    }
}
