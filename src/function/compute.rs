use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::Event;
use crate::policy::Principal;
use crate::utils::PipelineError;

/// Default per-invocation timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Why an invocation did not produce an [`Outcome`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),

    /// The runtime aborted the invocation at its deadline.
    #[error("invocation timed out after {0:?}")]
    Timeout(Duration),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl From<PipelineError> for HandlerError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::PermissionDenied { .. } => Self::PermissionDenied(err.to_string()),
            PipelineError::Handler(inner) => inner,
            other => Self::Failed(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Failed(format!("malformed payload: {err}"))
    }
}

/// What a successful invocation returned.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Bytes),
    /// Identifiers of the batch items the handler could not process.
    /// An empty list means every item succeeded.
    PartialFailure(Vec<String>),
}

impl Outcome {
    pub fn json(value: &serde_json::Value) -> Result<Self, HandlerError> {
        Ok(Self::Success(Bytes::from(serde_json::to_vec(value)?)))
    }

    pub fn empty() -> Self {
        Self::Success(Bytes::new())
    }

    /// Items reported as failed; empty for `Success`.
    pub fn failed_items(&self) -> &[String] {
        match self {
            Self::Success(_) => &[],
            Self::PartialFailure(ids) => ids,
        }
    }
}

/// Per-invocation metadata handed to a handler.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub function_name: String,
    pub request_id: String,
    /// Identity the handler acts as when touching other components.
    pub principal: Principal,
    pub deadline: Instant,
}

impl InvocationContext {
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// The opaque processing unit behind a compute function.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: InvocationContext, event: Event) -> Result<Outcome, HandlerError>;
}

/// Adapter so plain async closures can be used as handlers.
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(InvocationContext, Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Outcome, HandlerError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(InvocationContext, Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Outcome, HandlerError>> + Send,
{
    async fn handle(&self, ctx: InvocationContext, event: Event) -> Result<Outcome, HandlerError> {
        (self.0)(ctx, event).await
    }
}

/// A named, stateless compute function.
#[derive(Clone)]
pub struct ComputeFunction {
    name: String,
    principal: Principal,
    timeout: Duration,
    handler: Arc<dyn Handler>,
}

impl ComputeFunction {
    /// The default principal is `role/<name>` with no grants attached.
    pub fn new(name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        let name = name.into();
        Self {
            principal: Principal::new(format!("role/{name}")),
            name,
            timeout: DEFAULT_TIMEOUT,
            handler,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = principal;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the handler once.
    ///
    /// The handler runs on its own task so a panic or an overrun cannot take
    /// the caller down: a panic becomes `HandlerError::Failed` and an overrun
    /// aborts the task and becomes `HandlerError::Timeout`.
    pub async fn invoke(&self, event: Event) -> Result<Outcome, HandlerError> {
        let ctx = InvocationContext {
            function_name: self.name.clone(),
            request_id: Uuid::new_v4().to_string(),
            principal: self.principal.clone(),
            deadline: Instant::now() + self.timeout,
        };
        debug!(function = %self.name, request_id = %ctx.request_id, source = ?event.source(), "invoking");

        let handler = self.handler.clone();
        let mut task = tokio::spawn(async move { handler.handle(ctx, event).await });

        match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                warn!(function = %self.name, "handler panicked: {join_err}");
                Err(HandlerError::Failed(format!("handler panicked: {join_err}")))
            }
            Err(_) => {
                task.abort();
                warn!(function = %self.name, timeout = ?self.timeout, "invocation timed out");
                Err(HandlerError::Timeout(self.timeout))
            }
        }
    }
}

impl std::fmt::Debug for ComputeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeFunction")
            .field("name", &self.name)
            .field("principal", &self.principal)
            .field("timeout", &self.timeout)
            .finish()
    }
}
