use serde::Deserialize;

use crate::table::StartingPosition;

/// Top-level configuration for the three topologies and the HTTP front end.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub queue: QueueSettings,
    pub table: TableSettings,
    pub function: FunctionSettings,
    pub gateway: GatewaySettings,
    pub object_store: ObjectStoreSettings,
    pub topic: TopicSettings,
}

/// Address the gateway HTTP adapter binds to, and the process log level.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Used when `RUST_LOG` is unset.
    pub log_level: String,
}

/// Message queue and its event source mapping.
///
/// The visibility timeout is fixed for the queue's lifetime; it cannot be
/// changed per message.
#[derive(Debug, Deserialize, Clone)]
pub struct QueueSettings {
    pub visibility_timeout_secs: u64,
    pub batch_size: usize,
    pub max_batching_window_secs: u64,
    pub report_batch_item_failures: bool,
}

/// Durable table storage, change feed retention and the feed consumer.
#[derive(Debug, Deserialize, Clone)]
pub struct TableSettings {
    pub path: String,
    pub partitions: usize,
    pub retention_secs: u64,
    pub max_records_per_partition: usize,
    pub starting_position: StartingPosition,
    pub batch_size: usize,
    pub retry_attempts: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FunctionSettings {
    pub timeout_secs: u64,
}

/// Gateway backend deadline. Expiry is fatal for the request.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewaySettings {
    pub request_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ObjectStoreSettings {
    pub notify_prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TopicSettings {
    pub name: String,
    pub email: String,
}

/// Partial configuration loaded from files or environment.
///
/// Every field is optional; missing values fall back to `Settings::default()`.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub queue: Option<PartialQueueSettings>,
    pub table: Option<PartialTableSettings>,
    pub function: Option<PartialFunctionSettings>,
    pub gateway: Option<PartialGatewaySettings>,
    pub object_store: Option<PartialObjectStoreSettings>,
    pub topic: Option<PartialTopicSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialQueueSettings {
    pub visibility_timeout_secs: Option<u64>,
    pub batch_size: Option<usize>,
    pub max_batching_window_secs: Option<u64>,
    pub report_batch_item_failures: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialTableSettings {
    pub path: Option<String>,
    pub partitions: Option<usize>,
    pub retention_secs: Option<u64>,
    pub max_records_per_partition: Option<usize>,
    pub starting_position: Option<StartingPosition>,
    pub batch_size: Option<usize>,
    pub retry_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialFunctionSettings {
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialGatewaySettings {
    pub request_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialObjectStoreSettings {
    pub notify_prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialTopicSettings {
    pub name: Option<String>,
    pub email: Option<String>,
}

impl PartialSettings {
    /// Fill every missing value from `default`.
    pub fn merge(self, default: Settings) -> Settings {
        Settings {
            server: self.server.unwrap_or_default().merge(default.server),
            queue: self.queue.unwrap_or_default().merge(default.queue),
            table: self.table.unwrap_or_default().merge(default.table),
            function: self.function.unwrap_or_default().merge(default.function),
            gateway: self.gateway.unwrap_or_default().merge(default.gateway),
            object_store: self
                .object_store
                .unwrap_or_default()
                .merge(default.object_store),
            topic: self.topic.unwrap_or_default().merge(default.topic),
        }
    }
}

impl PartialServerSettings {
    fn merge(self, default: ServerSettings) -> ServerSettings {
        ServerSettings {
            host: self.host.unwrap_or(default.host),
            port: self.port.unwrap_or(default.port),
            log_level: self.log_level.unwrap_or(default.log_level),
        }
    }
}

impl PartialQueueSettings {
    fn merge(self, default: QueueSettings) -> QueueSettings {
        QueueSettings {
            visibility_timeout_secs: self
                .visibility_timeout_secs
                .unwrap_or(default.visibility_timeout_secs),
            batch_size: self.batch_size.unwrap_or(default.batch_size),
            max_batching_window_secs: self
                .max_batching_window_secs
                .unwrap_or(default.max_batching_window_secs),
            report_batch_item_failures: self
                .report_batch_item_failures
                .unwrap_or(default.report_batch_item_failures),
        }
    }
}

impl PartialTableSettings {
    fn merge(self, default: TableSettings) -> TableSettings {
        TableSettings {
            path: self.path.unwrap_or(default.path),
            partitions: self.partitions.unwrap_or(default.partitions),
            retention_secs: self.retention_secs.unwrap_or(default.retention_secs),
            max_records_per_partition: self
                .max_records_per_partition
                .unwrap_or(default.max_records_per_partition),
            starting_position: self
                .starting_position
                .unwrap_or(default.starting_position),
            batch_size: self.batch_size.unwrap_or(default.batch_size),
            retry_attempts: self.retry_attempts.unwrap_or(default.retry_attempts),
        }
    }
}

impl PartialFunctionSettings {
    fn merge(self, default: FunctionSettings) -> FunctionSettings {
        FunctionSettings {
            timeout_secs: self.timeout_secs.unwrap_or(default.timeout_secs),
        }
    }
}

impl PartialGatewaySettings {
    fn merge(self, default: GatewaySettings) -> GatewaySettings {
        GatewaySettings {
            request_timeout_ms: self
                .request_timeout_ms
                .unwrap_or(default.request_timeout_ms),
        }
    }
}

impl PartialObjectStoreSettings {
    fn merge(self, default: ObjectStoreSettings) -> ObjectStoreSettings {
        ObjectStoreSettings {
            notify_prefix: self.notify_prefix.unwrap_or(default.notify_prefix),
        }
    }
}

impl PartialTopicSettings {
    fn merge(self, default: TopicSettings) -> TopicSettings {
        TopicSettings {
            name: self.name.unwrap_or(default.name),
            email: self.email.unwrap_or(default.email),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                log_level: "info".to_string(),
            },
            queue: QueueSettings {
                visibility_timeout_secs: 20,
                batch_size: 1,
                max_batching_window_secs: 60,
                report_batch_item_failures: true,
            },
            table: TableSettings {
                path: "eventpipe_db".to_string(),
                partitions: 4,
                retention_secs: 24 * 3600,
                max_records_per_partition: 10_000,
                starting_position: StartingPosition::Latest,
                batch_size: 1,
                retry_attempts: 2,
            },
            function: FunctionSettings { timeout_secs: 15 },
            gateway: GatewaySettings {
                request_timeout_ms: 29_000,
            },
            object_store: ObjectStoreSettings {
                notify_prefix: "notify-lambda/".to_string(),
            },
            topic: TopicSettings {
                name: "SnsTopicIcaDemo".to_string(),
                email: "ops@example.com".to_string(),
            },
        }
    }
}
