//! # eventpipe
//!
//! `eventpipe` is an in-process runtime for event-driven integration
//! topologies: object uploads, table change feeds, message queues and topics
//! wired to named compute functions, with a request gateway in front.
//!
//! ## Core Modules
//!
//! - `event`: the immutable event envelope passed between stages.
//! - `policy`: principals, `{action, resource}` grants and the authorizer.
//! - `function`: compute functions, handlers and the function registry.
//! - `queue`: message queue with visibility timeouts and batch delivery.
//! - `table`: sled-backed durable table with a partitioned change feed.
//! - `object_store`: buckets with prefix-filtered creation notifications.
//! - `topic`: publish/subscribe fan-out with per-subscription retry.
//! - `gateway`: routes, mapping templates and the request state machine.
//! - `transport`: axum adapter serving gateways over HTTP.
//! - `pipeline`: event source mappings and the topology builders.
//! - `config`: settings loading.
//! - `utils`: error taxonomy and logging.

pub mod config;
pub mod event;
pub mod function;
pub mod gateway;
pub mod object_store;
pub mod pipeline;
pub mod policy;
pub mod queue;
pub mod table;
pub mod topic;
pub mod transport;
pub mod utils;
