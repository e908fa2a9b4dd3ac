use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::function::{HandlerError, Outcome};
use crate::gateway::message::{GatewayRequest, GatewayResponse};
use crate::gateway::route::{BackendRequest, ComputeIntegration, DirectIntegration, Integration};
use crate::policy::{Authorizer, Principal, actions, resources};
use crate::utils::{PipelineError, Result};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(29_000);

/// Where a request is in its lifecycle.
///
/// Successful requests go `Received -> TemplateApplied -> BackendInvoked ->
/// ResponseTemplated -> Returned`. A failure at any point after `Received`
/// goes `IntegrationError -> ErrorReturned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    TemplateApplied,
    BackendInvoked,
    ResponseTemplated,
    Returned,
    IntegrationError,
    ErrorReturned,
}

/// A named API: a fixed route table plus the identity it invokes functions as.
pub struct Gateway {
    name: String,
    principal: Principal,
    authorizer: Authorizer,
    routes: HashMap<String, HashMap<String, Integration>>,
    request_timeout: Duration,
}

impl Gateway {
    pub fn builder(name: impl Into<String>, authorizer: Authorizer) -> GatewayBuilder {
        let name = name.into();
        GatewayBuilder {
            principal: Principal::new(format!("service/gateway/{name}")),
            name,
            authorizer,
            routes: HashMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity used for compute integrations.
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn has_path(&self, path: &str) -> bool {
        self.routes.contains_key(path)
    }

    pub fn route(&self, method: &str, path: &str) -> Result<&Integration> {
        let methods = self
            .routes
            .get(path)
            .ok_or_else(|| PipelineError::RouteNotFound(path.to_string()))?;
        methods
            .get(&method.to_ascii_uppercase())
            .ok_or_else(|| PipelineError::MethodNotAllowed {
                method: method.to_string(),
                path: path.to_string(),
            })
    }

    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        self.handle_traced(request).await.0
    }

    /// Handle a request and return the states it passed through.
    pub async fn handle_traced(&self, request: GatewayRequest) -> (GatewayResponse, Vec<RequestState>) {
        let mut trace = vec![RequestState::Received];
        debug!(gateway = %self.name, method = %request.method, path = %request.path, "request received");

        match self.dispatch(&request, &mut trace).await {
            Ok(response) => {
                trace.push(RequestState::Returned);
                info!(
                    gateway = %self.name,
                    method = %request.method,
                    path = %request.path,
                    status = response.status,
                    "request returned"
                );
                (response, trace)
            }
            Err(err) => {
                trace.push(RequestState::IntegrationError);
                let status = error_status(&err);
                warn!(
                    gateway = %self.name,
                    method = %request.method,
                    path = %request.path,
                    status,
                    "integration error: {err}"
                );
                let response = GatewayResponse::json(status, &json!({ "message": err.to_string() }));
                trace.push(RequestState::ErrorReturned);
                (response, trace)
            }
        }
    }

    async fn dispatch(
        &self,
        request: &GatewayRequest,
        trace: &mut Vec<RequestState>,
    ) -> Result<GatewayResponse> {
        match self.route(&request.method, &request.path)? {
            Integration::Compute(integration) => self.invoke_compute(integration, request, trace).await,
            Integration::Direct(integration) => self.invoke_direct(integration, request, trace).await,
        }
    }

    async fn invoke_compute(
        &self,
        integration: &ComputeIntegration,
        request: &GatewayRequest,
        trace: &mut Vec<RequestState>,
    ) -> Result<GatewayResponse> {
        let function = &integration.function;
        let event = request.to_event()?;
        trace.push(RequestState::TemplateApplied);

        self.authorizer.check(
            &self.principal,
            actions::INVOKE,
            &resources::function(function.name()),
        )?;
        trace.push(RequestState::BackendInvoked);

        let outcome = self
            .with_deadline(&request.path, function.invoke(event))
            .await??;
        let response = match outcome {
            Outcome::Success(body) => proxy_response(&body)
                .unwrap_or_else(|| GatewayResponse::new(200, body).with_header("Content-Type", "application/json")),
            Outcome::PartialFailure(ids) => {
                return Err(HandlerError::Failed(format!("function reported {} failed items", ids.len())).into());
            }
        };
        trace.push(RequestState::ResponseTemplated);
        Ok(response)
    }

    async fn invoke_direct(
        &self,
        integration: &DirectIntegration,
        request: &GatewayRequest,
        trace: &mut Vec<RequestState>,
    ) -> Result<GatewayResponse> {
        let body = integration.request_template.render(request)?;
        trace.push(RequestState::TemplateApplied);

        let backend = &integration.backend;
        self.authorizer.check(
            &integration.execution_role,
            backend.action(),
            &backend.resource(),
        )?;
        trace.push(RequestState::BackendInvoked);

        let backend_response = self
            .with_deadline(
                &request.path,
                backend.invoke(BackendRequest {
                    headers: integration.request_headers.clone(),
                    body,
                }),
            )
            .await??;

        let response = match integration.response_templates.get(&backend_response.status) {
            Some(template) => GatewayResponse::new(backend_response.status, template.render(request)?)
                .with_header("Content-Type", "application/json"),
            None => GatewayResponse::new(backend_response.status, backend_response.body),
        };
        trace.push(RequestState::ResponseTemplated);
        Ok(response)
    }

    async fn with_deadline<F: Future>(&self, route: &str, fut: F) -> Result<F::Output> {
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| PipelineError::IntegrationTimeout {
                route: route.to_string(),
                timeout: self.request_timeout,
            })
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut paths: Vec<_> = self.routes.keys().collect();
        paths.sort();
        f.debug_struct("Gateway")
            .field("name", &self.name)
            .field("principal", &self.principal)
            .field("paths", &paths)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

fn error_status(err: &PipelineError) -> u16 {
    match err {
        PipelineError::PermissionDenied { .. } => 403,
        PipelineError::RouteNotFound(_) => 404,
        PipelineError::MethodNotAllowed { .. } => 405,
        PipelineError::Template(_) => 400,
        PipelineError::IntegrationTimeout { .. } => 504,
        PipelineError::Handler(_) => 502,
        _ => 500,
    }
}

/// Unpack a `{statusCode, headers, body}` result; `None` if `raw` has another shape.
fn proxy_response(raw: &[u8]) -> Option<GatewayResponse> {
    let value: Value = serde_json::from_slice(raw).ok()?;
    let status = u16::try_from(value.get("statusCode")?.as_u64()?).ok()?;
    let body = match value.get("body") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };

    let mut response = GatewayResponse::new(status, body);
    if let Some(headers) = value.get("headers").and_then(Value::as_object) {
        for (name, value) in headers {
            if let Some(value) = value.as_str() {
                response = response.with_header(name.clone(), value);
            }
        }
    }
    Some(response)
}

pub struct GatewayBuilder {
    name: String,
    principal: Principal,
    authorizer: Authorizer,
    routes: HashMap<String, HashMap<String, Integration>>,
    request_timeout: Duration,
}

impl GatewayBuilder {
    pub fn route(mut self, method: &str, path: impl Into<String>, integration: Integration) -> Self {
        self.routes
            .entry(path.into())
            .or_default()
            .insert(method.to_ascii_uppercase(), integration);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Grant the gateway's identity `function:Invoke` on every compute route.
    pub fn build(self) -> Arc<Gateway> {
        for integration in self.routes.values().flat_map(HashMap::values) {
            if let Integration::Compute(compute) = integration {
                self.authorizer.grant(
                    &self.principal,
                    actions::INVOKE,
                    resources::function(compute.function.name()),
                );
            }
        }
        Arc::new(Gateway {
            name: self.name,
            principal: self.principal,
            authorizer: self.authorizer,
            routes: self.routes,
            request_timeout: self.request_timeout,
        })
    }
}
