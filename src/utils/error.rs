//! The `error` module defines the error taxonomy shared by every pipeline stage.
//!
//! Only gateway-level errors ever reach an external caller. Everything a
//! compute function raises is turned into a retry or redelivery decision by
//! the stage that owns delivery (the queue or the change feed).

use std::time::Duration;

use thiserror::Error;

use crate::function::HandlerError;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A principal acted without a matching `{action, resource}` grant.
    #[error("permission denied: {principal} may not perform {action} on {resource}")]
    PermissionDenied {
        principal: String,
        action: String,
        resource: String,
    },

    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),

    /// A change-feed batch was dropped after its last allowed attempt.
    #[error(
        "consumer {consumer} gave up on partition {partition} \
         (sequence {first_sequence}..={last_sequence}) after {attempts} attempts"
    )]
    RetryExhausted {
        consumer: String,
        partition: usize,
        first_sequence: u64,
        last_sequence: u64,
        attempts: u32,
    },

    #[error("integration for {route} timed out after {timeout:?}")]
    IntegrationTimeout { route: String, timeout: Duration },

    #[error("no route for {0}")]
    RouteNotFound(String),

    #[error("method {method} not allowed on {path}")]
    MethodNotAllowed { method: String, path: String },

    #[error("unknown message id: {0}")]
    UnknownMessage(String),

    #[error("partition {partition} out of range, table has {partitions}")]
    UnknownPartition { partition: usize, partitions: usize },

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn permission_denied(
        principal: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self::PermissionDenied {
            principal: principal.into(),
            action: action.into(),
            resource: resource.into(),
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. } | Self::Handler(HandlerError::PermissionDenied(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
