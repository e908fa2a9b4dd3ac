//! Stock handlers the demo topologies are wired with.
//!
//! Each one does a single thing against a single resource and returns a
//! proxy-shaped response (`statusCode`, `headers`, `body`). Writes go through
//! the invocation principal, so a missing grant surfaces as
//! `HandlerError::PermissionDenied`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::event::Event;
use crate::function::compute::{Handler, HandlerError, InvocationContext, Outcome};
use crate::table::{DurableTable, Item};
use crate::topic::Topic;

pub const WRITE_TABLE: &str = "write_table";
pub const PUBLISH_NOTIFICATION: &str = "publish_notification";
pub const BOOKS_API: &str = "books_api";
pub const CONSUME_QUEUE: &str = "consume_queue";

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// A 200 response in the shape the gateway passes through verbatim.
pub fn proxy_response(message: impl Into<String>) -> Value {
    json!({
        "statusCode": 200,
        "headers": {
            "Access-Control-Allow-Origin": "*",
            "Access-Control-Allow-Headers": "Content-Type",
            "Access-Control-Allow-Methods": "OPTIONS,GET",
        },
        "body": json!({ "message": message.into() }).to_string(),
    })
}

/// Writes one item per invocation to a table.
#[derive(Debug, Clone)]
pub struct TableWriter {
    table: DurableTable,
}

impl TableWriter {
    pub fn new(table: DurableTable) -> Self {
        Self { table }
    }
}

#[async_trait]
impl Handler for TableWriter {
    async fn handle(&self, ctx: InvocationContext, event: Event) -> Result<Outcome, HandlerError> {
        let ts = now_millis();
        let mut item = Item::new();
        item.insert("id".into(), Value::String(ts.to_string()));
        item.insert("message".into(), Value::String(format!("lambda write to table {ts}")));
        if let Some(key) = event.attribute("key") {
            item.insert("object_key".into(), Value::String(key.to_string()));
        }

        let record = self.table.put_item(&ctx.principal, &ts.to_string(), item)?;
        info!(
            function = %ctx.function_name,
            table = %self.table.name(),
            sequence = record.sequence_number,
            "item written"
        );
        Outcome::json(&proxy_response("Hello lambda"))
    }
}

/// Publishes a timestamped message to a topic.
#[derive(Debug, Clone)]
pub struct TopicNotifier {
    topic: Arc<Topic>,
}

impl TopicNotifier {
    pub fn new(topic: Arc<Topic>) -> Self {
        Self { topic }
    }
}

#[async_trait]
impl Handler for TopicNotifier {
    async fn handle(&self, ctx: InvocationContext, event: Event) -> Result<Outcome, HandlerError> {
        let records = event
            .payload_json()
            .ok()
            .and_then(|v| v.get("Records").and_then(Value::as_array).map(Vec::len))
            .unwrap_or(0);
        let ts = now_millis();
        let receipt = self.topic.publish(
            &ctx.principal,
            format!("lambda send a message to topic {ts} ({records} change records)"),
        )?;
        info!(
            function = %ctx.function_name,
            topic = %self.topic.name(),
            message_id = %receipt.message_id,
            "notification published"
        );
        Outcome::json(&proxy_response("Hello lambda"))
    }
}

/// Synchronous API handler behind `GET /books`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BooksApi;

#[async_trait]
impl Handler for BooksApi {
    async fn handle(&self, _ctx: InvocationContext, _event: Event) -> Result<Outcome, HandlerError> {
        Outcome::json(&proxy_response(format!(
            "Hello lambda api gateway {}",
            now_millis()
        )))
    }
}

/// Queue batch consumer. Publishes one message per record and reports the
/// records it could not publish.
#[derive(Debug, Clone)]
pub struct QueueConsumer {
    topic: Arc<Topic>,
}

impl QueueConsumer {
    pub fn new(topic: Arc<Topic>) -> Self {
        Self { topic }
    }
}

#[async_trait]
impl Handler for QueueConsumer {
    async fn handle(&self, ctx: InvocationContext, event: Event) -> Result<Outcome, HandlerError> {
        let payload = event.payload_json()?;
        let records = payload
            .get("Records")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut failed = Vec::new();
        for record in &records {
            let id = record
                .get("messageId")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let body = record.get("body").and_then(Value::as_str).unwrap_or_default();
            info!(function = %ctx.function_name, message_id = %id, %body, "record received");

            if let Err(e) = self.topic.publish(
                &ctx.principal,
                format!("lambda process message from queue {body}"),
            ) {
                warn!(message_id = %id, "publish failed: {e}");
                failed.push(id.to_string());
            }
        }

        if failed.is_empty() {
            Outcome::json(&proxy_response("lambda process queue message"))
        } else {
            Ok(Outcome::PartialFailure(failed))
        }
    }
}
