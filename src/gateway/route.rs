use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tracing::debug;

use crate::function::ComputeFunction;
use crate::gateway::template::MappingTemplate;
use crate::policy::{Principal, actions};
use crate::queue::MessageQueue;
use crate::utils::{PipelineError, Result};

/// What a route is wired to.
#[derive(Debug, Clone)]
pub enum Integration {
    Compute(ComputeIntegration),
    Direct(DirectIntegration),
}

impl Integration {
    pub fn compute(function: Arc<ComputeFunction>) -> Self {
        Self::Compute(ComputeIntegration { function })
    }

    pub fn direct(integration: DirectIntegration) -> Self {
        Self::Direct(integration)
    }
}

/// Invoke a function and hand its result back inline.
#[derive(Debug, Clone)]
pub struct ComputeIntegration {
    pub function: Arc<ComputeFunction>,
}

/// Request produced by a request template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRequest {
    pub headers: HashMap<String, String>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendResponse {
    pub status: u16,
    pub body: Bytes,
}

/// A service a direct integration can call without a function in between.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The action the execution role must be granted.
    fn action(&self) -> &str;

    fn resource(&self) -> String;

    async fn invoke(&self, request: BackendRequest) -> Result<BackendResponse>;
}

/// Accepts form-encoded `Action=SendMessage&MessageBody=...` requests.
#[derive(Debug, Clone)]
pub struct QueueBackend {
    queue: MessageQueue,
}

impl QueueBackend {
    pub fn new(queue: MessageQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Backend for QueueBackend {
    fn action(&self) -> &str {
        actions::SEND_MESSAGE
    }

    fn resource(&self) -> String {
        self.queue.resource()
    }

    async fn invoke(&self, request: BackendRequest) -> Result<BackendResponse> {
        let mut action = None;
        let mut body = None;
        for (name, value) in url::form_urlencoded::parse(request.body.as_bytes()) {
            match &*name {
                "Action" => action = Some(value.into_owned()),
                "MessageBody" => body = Some(value.into_owned()),
                _ => {}
            }
        }

        match action.as_deref() {
            Some("SendMessage") => {}
            other => {
                return Err(PipelineError::Template(format!(
                    "unsupported queue action {other:?}"
                )));
            }
        }
        let body = body.ok_or_else(|| PipelineError::Template("missing MessageBody".into()))?;

        let message_id = self.queue.enqueue(body);
        debug!(queue = %self.queue.name(), %message_id, "message sent via gateway");
        Ok(BackendResponse {
            status: 200,
            body: Bytes::from(json!({ "MessageId": message_id }).to_string()),
        })
    }
}

/// Template-driven call to a backend under an assumed execution role.
#[derive(Clone)]
pub struct DirectIntegration {
    pub backend: Arc<dyn Backend>,
    pub execution_role: Principal,
    pub request_template: MappingTemplate,
    pub request_headers: HashMap<String, String>,
    pub response_templates: HashMap<u16, MappingTemplate>,
}

impl DirectIntegration {
    pub fn new(
        backend: Arc<dyn Backend>,
        execution_role: Principal,
        request_template: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            execution_role,
            request_template: MappingTemplate::new(request_template),
            request_headers: HashMap::new(),
            response_templates: HashMap::new(),
        }
    }

    pub fn request_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.insert(name.into(), value.into());
        self
    }

    /// Body returned when the backend answers with `status`.
    pub fn response_template(mut self, status: u16, template: impl Into<String>) -> Self {
        self.response_templates
            .insert(status, MappingTemplate::new(template));
        self
    }
}

impl std::fmt::Debug for DirectIntegration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectIntegration")
            .field("action", &self.backend.action())
            .field("resource", &self.backend.resource())
            .field("execution_role", &self.execution_role)
            .field("request_template", &self.request_template)
            .finish()
    }
}
