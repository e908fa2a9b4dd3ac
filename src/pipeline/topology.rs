//! Builders for the three supported topologies.
//!
//! 1. [`StorageTrigger`]: object upload -> function -> table -> change feed
//!    -> function -> topic.
//! 2. [`ComputeApi`]: `GET /books` -> function -> inline response.
//! 3. [`QueueIngest`]: `GET /queue` -> direct enqueue -> batch -> function
//!    -> topic.
//!
//! Builders grant each function exactly what its stock handler needs. A
//! handler can be swapped by function name before `build`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{Settings, TopicSettings};
use crate::function::builtin::{self, BooksApi, QueueConsumer, TableWriter, TopicNotifier};
use crate::function::{ComputeFunction, FunctionRegistry, Handler};
use crate::gateway::{DirectIntegration, Gateway, Integration, QueueBackend};
use crate::object_store::ObjectStore;
use crate::pipeline::object_source::{AsyncRetryPolicy, ObjectNotificationSource};
use crate::pipeline::queue_source::{QueueEventSource, QueueSourceConfig};
use crate::policy::{Authorizer, Policy, Principal, actions};
use crate::queue::MessageQueue;
use crate::table::{ChangeFeedConsumer, ConsumerConfig, DurableTable, Retention, TableOptions};
use crate::topic::{Mailbox, Topic};
use crate::utils::Result;

pub const UPLOAD_BUCKET: &str = "eventpipe-uploads";
pub const EVENT_TABLE: &str = "object-events";
pub const FEED_CONSUMER: &str = "object-events-stream";
pub const INGEST_QUEUE: &str = "ingest-queue";
pub const QUEUE_WRITER_ROLE: &str = "role/gateway-write-to-queue";

const QUEUE_REQUEST_TEMPLATE: &str =
    r#"Action=SendMessage&MessageBody=$util.urlEncode("$method.request.querystring.message")"#;
const QUEUE_RESPONSE_TEMPLATE: &str = r#"{"done": true}"#;

/// The notification topic with its email subscription.
pub fn notification_topic(settings: &TopicSettings, authorizer: Authorizer, mailbox: Mailbox) -> Arc<Topic> {
    Topic::builder(settings.name.clone(), authorizer)
        .email(settings.email.clone(), mailbox)
        .build()
}

#[derive(Default)]
struct HandlerOverrides(HashMap<String, Arc<dyn Handler>>);

impl HandlerOverrides {
    fn function(
        &self,
        registry: &mut FunctionRegistry,
        name: &str,
        stock: Arc<dyn Handler>,
        timeout: Duration,
    ) -> Arc<ComputeFunction> {
        let handler = self.0.get(name).cloned().unwrap_or(stock);
        registry.register(ComputeFunction::new(name, handler).with_timeout(timeout))
    }
}

fn function_timeout(settings: &Settings) -> Duration {
    Duration::from_secs(settings.function.timeout_secs)
}

fn table_options(settings: &Settings) -> TableOptions {
    TableOptions {
        partitions: settings.table.partitions,
        retention: Retention {
            max_age: Some(Duration::from_secs(settings.table.retention_secs)),
            max_records_per_partition: Some(settings.table.max_records_per_partition),
        },
    }
}

// Topology 1

pub struct StorageTriggerBuilder {
    settings: Settings,
    authorizer: Authorizer,
    topic: Arc<Topic>,
    store: Option<ObjectStore>,
    table: Option<DurableTable>,
    overrides: HandlerOverrides,
    retry: AsyncRetryPolicy,
}

impl StorageTriggerBuilder {
    pub fn store(mut self, store: ObjectStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn table(mut self, table: DurableTable) -> Self {
        self.table = Some(table);
        self
    }

    /// Replace the stock handler of function `name`.
    pub fn handler(mut self, name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.overrides.0.insert(name.into(), handler);
        self
    }

    pub fn async_retry(mut self, retry: AsyncRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> Result<StorageTrigger> {
        let settings = &self.settings;
        let store = match self.store {
            Some(store) => store,
            None => ObjectStore::new(UPLOAD_BUCKET, self.authorizer.clone()),
        };
        let table = match self.table {
            Some(table) => table,
            None => DurableTable::open(
                &settings.table.path,
                EVENT_TABLE,
                table_options(settings),
                self.authorizer.clone(),
            )?,
        };

        let mut functions = FunctionRegistry::new();
        let timeout = function_timeout(settings);
        let writer = self.overrides.function(
            &mut functions,
            builtin::WRITE_TABLE,
            Arc::new(TableWriter::new(table.clone())),
            timeout,
        );
        let notifier = self.overrides.function(
            &mut functions,
            builtin::PUBLISH_NOTIFICATION,
            Arc::new(TopicNotifier::new(self.topic.clone())),
            timeout,
        );

        self.authorizer.attach(
            writer.principal(),
            Policy::new("write-table")
                .allow(actions::PUT_ITEM, table.resource())
                .allow(actions::DELETE_ITEM, table.resource()),
        );
        self.topic.grant_publish(notifier.principal());

        let source = ObjectNotificationSource::new(
            &store,
            settings.object_store.notify_prefix.clone(),
            writer,
            self.retry,
        );
        let consumer = table.register_consumer(
            ConsumerConfig::new(FEED_CONSUMER)
                .starting_position(settings.table.starting_position)
                .batch_size(settings.table.batch_size)
                .retry_attempts(settings.table.retry_attempts),
        )?;

        info!(bucket = %store.bucket(), table = %table.name(), topic = %self.topic.name(), "storage trigger built");
        Ok(StorageTrigger {
            store,
            table,
            topic: self.topic,
            functions,
            wiring: Some((source, consumer, notifier)),
        })
    }
}

/// Object store -> table -> change feed -> topic.
pub struct StorageTrigger {
    pub store: ObjectStore,
    pub table: DurableTable,
    pub topic: Arc<Topic>,
    pub functions: FunctionRegistry,
    wiring: Option<(ObjectNotificationSource, ChangeFeedConsumer, Arc<ComputeFunction>)>,
}

impl StorageTrigger {
    pub fn builder(settings: &Settings, authorizer: Authorizer, topic: Arc<Topic>) -> StorageTriggerBuilder {
        StorageTriggerBuilder {
            settings: settings.clone(),
            authorizer,
            topic,
            store: None,
            table: None,
            overrides: HandlerOverrides::default(),
            retry: AsyncRetryPolicy::default(),
        }
    }

    /// Spawn the notification source and the feed consumer. Only the first
    /// call starts anything.
    pub fn start(&mut self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let Some((source, consumer, notifier)) = self.wiring.take() else {
            warn!("storage trigger already started");
            return Vec::new();
        };
        vec![
            tokio::spawn(source.run(shutdown.clone())),
            tokio::spawn(consumer.run(notifier, shutdown)),
        ]
    }
}

// Topology 2

pub struct ComputeApiBuilder {
    settings: Settings,
    authorizer: Authorizer,
    overrides: HandlerOverrides,
}

impl ComputeApiBuilder {
    pub fn handler(mut self, name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.overrides.0.insert(name.into(), handler);
        self
    }

    pub fn build(self) -> ComputeApi {
        let mut functions = FunctionRegistry::new();
        let books = self.overrides.function(
            &mut functions,
            builtin::BOOKS_API,
            Arc::new(BooksApi),
            function_timeout(&self.settings),
        );
        let gateway = Gateway::builder("books-api", self.authorizer)
            .request_timeout(Duration::from_millis(self.settings.gateway.request_timeout_ms))
            .route("GET", "/books", Integration::compute(books))
            .build();
        ComputeApi { gateway, functions }
    }
}

/// `GET /books` answered inline by a function.
#[derive(Debug)]
pub struct ComputeApi {
    pub gateway: Arc<Gateway>,
    pub functions: FunctionRegistry,
}

impl ComputeApi {
    pub fn builder(settings: &Settings, authorizer: Authorizer) -> ComputeApiBuilder {
        ComputeApiBuilder {
            settings: settings.clone(),
            authorizer,
            overrides: HandlerOverrides::default(),
        }
    }
}

// Topology 3

pub struct QueueIngestBuilder {
    settings: Settings,
    authorizer: Authorizer,
    topic: Arc<Topic>,
    queue: Option<MessageQueue>,
    overrides: HandlerOverrides,
}

impl QueueIngestBuilder {
    pub fn queue(mut self, queue: MessageQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn handler(mut self, name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.overrides.0.insert(name.into(), handler);
        self
    }

    pub fn build(self) -> QueueIngest {
        let settings = &self.settings;
        let queue = match self.queue {
            Some(queue) => queue,
            None => MessageQueue::new(
                INGEST_QUEUE,
                Duration::from_secs(settings.queue.visibility_timeout_secs),
                self.authorizer.clone(),
            ),
        };

        let role = Principal::new(QUEUE_WRITER_ROLE);
        self.authorizer.attach(
            &role,
            Policy::new("write-to-queue").allow(actions::SEND_MESSAGE, queue.resource()),
        );
        let integration = DirectIntegration::new(
            Arc::new(QueueBackend::new(queue.clone())),
            role,
            QUEUE_REQUEST_TEMPLATE,
        )
        .request_header("Content-Type", "application/x-www-form-urlencoded")
        .response_template(200, QUEUE_RESPONSE_TEMPLATE);
        let gateway = Gateway::builder("queue-api", self.authorizer.clone())
            .request_timeout(Duration::from_millis(settings.gateway.request_timeout_ms))
            .route("GET", "/queue", Integration::direct(integration))
            .build();

        let mut functions = FunctionRegistry::new();
        let consumer = self.overrides.function(
            &mut functions,
            builtin::CONSUME_QUEUE,
            Arc::new(QueueConsumer::new(self.topic.clone())),
            function_timeout(settings),
        );
        self.topic.grant_publish(consumer.principal());

        let source = QueueEventSource::new(
            queue.clone(),
            consumer,
            QueueSourceConfig {
                batch_size: settings.queue.batch_size,
                max_batching_window: Duration::from_secs(settings.queue.max_batching_window_secs),
                report_batch_item_failures: settings.queue.report_batch_item_failures,
            },
        );

        info!(queue = %queue.name(), topic = %self.topic.name(), "queue ingest built");
        QueueIngest {
            queue,
            gateway,
            topic: self.topic,
            functions,
            source: Some(source),
        }
    }
}

/// `GET /queue` -> queue -> batch consumer -> topic.
pub struct QueueIngest {
    pub queue: MessageQueue,
    pub gateway: Arc<Gateway>,
    pub topic: Arc<Topic>,
    pub functions: FunctionRegistry,
    source: Option<QueueEventSource>,
}

impl QueueIngest {
    pub fn builder(settings: &Settings, authorizer: Authorizer, topic: Arc<Topic>) -> QueueIngestBuilder {
        QueueIngestBuilder {
            settings: settings.clone(),
            authorizer,
            topic,
            queue: None,
            overrides: HandlerOverrides::default(),
        }
    }

    /// The event source mapping, if not yet started.
    pub fn source(&self) -> Option<&QueueEventSource> {
        self.source.as_ref()
    }

    pub fn start(&mut self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        match self.source.take() {
            Some(source) => vec![tokio::spawn(source.run(shutdown))],
            None => {
                warn!("queue ingest already started");
                Vec::new()
            }
        }
    }
}
