//! Queue engine
//!
//! The queue keeps every message in a single map guarded by a short-lived
//! lock; no lock is held across an `.await`. Receivers park on a `Notify`
//! and on the earliest pending visibility deadline, so a message whose
//! window expires is picked up without anyone enqueueing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::policy::{Authorizer, Principal, actions, resources};
use crate::queue::message::{Batch, QueueMessage};
use crate::utils::{PipelineError, Result};

#[derive(Debug, Default)]
struct QueueState {
    next_seq: u64,
    // enqueue order, used to hand out the oldest visible messages first
    messages: BTreeMap<u64, QueueMessage>,
    index: HashMap<String, u64>,
}

impl QueueState {
    fn insert(&mut self, message: QueueMessage) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(message.id.clone(), seq);
        self.messages.insert(seq, message);
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut QueueMessage> {
        let seq = self.index.get(id)?;
        self.messages.get_mut(seq)
    }

    fn remove(&mut self, id: &str) -> Option<QueueMessage> {
        let seq = self.index.remove(id)?;
        self.messages.remove(&seq)
    }

    /// Move up to `limit` visible messages in flight, hidden until `hide_until`.
    fn take_visible(
        &mut self,
        limit: usize,
        now: Instant,
        hide_until: Instant,
        out: &mut Vec<QueueMessage>,
    ) {
        for message in self.messages.values_mut() {
            if out.len() >= limit {
                break;
            }
            if message.visible_after > now {
                continue;
            }
            if message.receive_count > 0 {
                debug!(
                    message_id = %message.id,
                    receive_count = message.receive_count,
                    "visibility expired, redelivering"
                );
            }
            message.receive_count += 1;
            message.visible_after = hide_until;
            out.push(message.clone());
        }
    }

    /// Earliest future instant at which a hidden message turns visible.
    fn next_visibility_change(&self, now: Instant) -> Option<Instant> {
        self.messages
            .values()
            .map(|m| m.visible_after)
            .filter(|t| *t > now)
            .min()
    }
}

/// Messages picked for a batch that has not been handed out yet.
struct Reservation<'a> {
    queue: &'a QueueInner,
    items: Vec<QueueMessage>,
}

impl Reservation<'_> {
    fn into_items(mut self) -> Vec<QueueMessage> {
        std::mem::take(&mut self.items)
    }
}

impl Drop for Reservation<'_> {
    // only reached with items when the receive was cancelled
    fn drop(&mut self) {
        if self.items.is_empty() {
            return;
        }
        let now = Instant::now();
        {
            let mut state = self.queue.state.lock();
            for item in &self.items {
                if let Some(stored) = state.get_mut(&item.id) {
                    stored.visible_after = now;
                    stored.receive_count = stored.receive_count.saturating_sub(1);
                }
            }
        }
        self.queue.notify.notify_waiters();
        debug!(
            queue = %self.queue.name,
            count = self.items.len(),
            "receive cancelled, messages released"
        );
    }
}

struct QueueInner {
    name: String,
    visibility_timeout: Duration,
    state: Mutex<QueueState>,
    notify: Notify,
    authorizer: Authorizer,
}

/// Handle to a message queue. Clones share the same queue.
#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<QueueInner>,
}

impl MessageQueue {
    /// Default visibility timeout.
    pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(20);

    pub fn new(name: impl Into<String>, visibility_timeout: Duration, authorizer: Authorizer) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                visibility_timeout,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                authorizer,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Resource name used in grants, e.g. `queue/orders`.
    pub fn resource(&self) -> String {
        resources::queue(&self.inner.name)
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.inner.visibility_timeout
    }

    /// Add a message. The queue takes ownership of the body.
    pub fn enqueue(&self, body: impl Into<Bytes>) -> String {
        let id = Uuid::new_v4().to_string();
        let message = QueueMessage {
            id: id.clone(),
            body: body.into(),
            enqueued_at: Utc::now(),
            visible_after: Instant::now(),
            receive_count: 0,
        };
        self.inner.state.lock().insert(message);
        self.inner.notify.notify_waiters();
        debug!(queue = %self.inner.name, message_id = %id, "enqueued");
        id
    }

    /// `enqueue` on behalf of `principal`, which needs `queue:SendMessage`.
    pub fn send_message(&self, principal: &Principal, body: impl Into<Bytes>) -> Result<String> {
        self.inner
            .authorizer
            .check(principal, actions::SEND_MESSAGE, &self.resource())?;
        Ok(self.enqueue(body))
    }

    /// Collect a batch of visible messages.
    ///
    /// The batch closes as soon as it holds `max_size` messages or once
    /// `max_wait_window` has elapsed, whichever comes first; the result may
    /// be empty. A `max_size` of 0 is treated as 1. Every returned message
    /// is hidden for one visibility timeout counted from the moment the
    /// batch closes. Dropping the future before it completes leaves every
    /// picked message visible with its receive count unchanged.
    pub async fn receive_batch(
        &self,
        max_size: usize,
        max_wait_window: Duration,
    ) -> Batch<QueueMessage> {
        let max_size = max_size.max(1);
        let deadline = Instant::now() + max_wait_window;
        // held back until the batch closes, then re-armed below
        let reserved_until = deadline + self.inner.visibility_timeout;
        let mut reservation = Reservation {
            queue: &self.inner,
            items: Vec::new(),
        };

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let next_change = {
                let mut state = self.inner.state.lock();
                state.take_visible(max_size, now, reserved_until, &mut reservation.items);
                state.next_visibility_change(now)
            };

            if reservation.items.len() >= max_size || now >= deadline {
                break;
            }

            let wake_at = next_change.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }

        let mut items = reservation.into_items();
        if !items.is_empty() {
            let visible_after = Instant::now() + self.inner.visibility_timeout;
            let mut state = self.inner.state.lock();
            for item in items.iter_mut() {
                item.visible_after = visible_after;
                if let Some(stored) = state.get_mut(&item.id) {
                    stored.visible_after = visible_after;
                }
            }
            debug!(queue = %self.inner.name, count = items.len(), "batch delivered");
        }

        Batch::new(items, max_size, max_wait_window)
    }

    /// Delete a delivered message.
    pub fn ack(&self, message_id: &str) -> Result<()> {
        match self.inner.state.lock().remove(message_id) {
            Some(_) => {
                debug!(queue = %self.inner.name, message_id, "acknowledged");
                Ok(())
            }
            None => {
                warn!(queue = %self.inner.name, message_id, "ack for unknown message");
                Err(PipelineError::UnknownMessage(message_id.to_string()))
            }
        }
    }

    /// Make the given in-flight messages visible again right away.
    ///
    /// Unknown ids are skipped. Returns how many messages were released.
    pub fn report_failure<S: AsRef<str>>(&self, message_ids: &[S]) -> usize {
        let now = Instant::now();
        let mut released = 0;
        {
            let mut state = self.inner.state.lock();
            for id in message_ids {
                match state.get_mut(id.as_ref()) {
                    Some(message) => {
                        message.visible_after = now;
                        released += 1;
                    }
                    None => warn!(
                        queue = %self.inner.name,
                        message_id = id.as_ref(),
                        "failure report for unknown message"
                    ),
                }
            }
        }
        if released > 0 {
            self.inner.notify.notify_waiters();
        }
        released
    }

    /// Settle a whole batch in one step.
    ///
    /// Items listed in `failed_ids` become visible again immediately; every
    /// other item is deleted. An empty list acknowledges the entire batch.
    /// Returns the number of deleted messages.
    pub fn complete_batch<S: AsRef<str>>(
        &self,
        batch: &Batch<QueueMessage>,
        failed_ids: &[S],
    ) -> usize {
        let failed: HashSet<&str> = failed_ids.iter().map(AsRef::as_ref).collect();
        let now = Instant::now();
        let mut deleted = 0;
        {
            let mut state = self.inner.state.lock();
            for item in &batch.items {
                if failed.contains(item.id.as_str()) {
                    if let Some(message) = state.get_mut(&item.id) {
                        message.visible_after = now;
                    }
                } else if state.remove(&item.id).is_some() {
                    deleted += 1;
                }
            }
        }
        if !failed.is_empty() {
            self.inner.notify.notify_waiters();
        }
        info!(
            queue = %self.inner.name,
            deleted,
            failed = failed.len(),
            "batch settled"
        );
        deleted
    }

    /// Messages that could be received right now.
    pub fn approximate_visible(&self) -> usize {
        let now = Instant::now();
        self.inner
            .state
            .lock()
            .messages
            .values()
            .filter(|m| m.visible_after <= now)
            .count()
    }

    /// Messages delivered but neither acknowledged nor expired.
    pub fn approximate_in_flight(&self) -> usize {
        let now = Instant::now();
        self.inner
            .state
            .lock()
            .messages
            .values()
            .filter(|m| m.visible_after > now)
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("name", &self.inner.name)
            .field("visibility_timeout", &self.inner.visibility_timeout)
            .finish()
    }
}
