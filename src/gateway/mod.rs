//! The `gateway` module maps synchronous requests onto integrations.
//!
//! A route is either a compute integration (invoke a function, return its
//! result inline) or a direct integration (render a request template, call a
//! backend under an execution role, render a response template). Every
//! request walks the same state machine; see [`RequestState`].

pub mod engine;
pub mod message;
pub mod route;
pub mod template;

pub use engine::{Gateway, GatewayBuilder, RequestState};
pub use message::{GatewayRequest, GatewayResponse};
pub use route::{
    Backend, BackendRequest, BackendResponse, ComputeIntegration, DirectIntegration, Integration,
    QueueBackend,
};
pub use template::MappingTemplate;
