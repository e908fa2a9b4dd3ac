//! The `pipeline` module wires components into running topologies.
//!
//! Event source mappings pull from a queue or an object store and invoke a
//! function with what they pulled. Each source owns the retry decision for
//! its own stage:
//!
//! - the queue source leans on visibility expiry and itemized failure
//!   reports, so a message is retried until it is acknowledged
//! - the object notification source retries an invocation a bounded number
//!   of times, then drops the event
//! - the change feed consumer (in `table`) retries a batch a bounded number
//!   of times, then skips it
//!
//! The topology builders assemble the three supported graphs. They share no
//! runtime state unless the caller passes the same component to more than
//! one builder.

pub mod object_source;
pub mod queue_source;
pub mod topology;

pub use object_source::{AsyncRetryPolicy, InvokeReport, ObjectNotificationSource};
pub use queue_source::{BatchOutcome, QueueEventSource, QueueSourceConfig};
pub use topology::{
    ComputeApi, ComputeApiBuilder, QueueIngest, QueueIngestBuilder, StorageTrigger,
    StorageTriggerBuilder, notification_topic,
};
