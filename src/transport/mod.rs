//! The `transport` module puts gateways on the network.
//!
//! It is a thin axum adapter: every HTTP request is converted into a
//! [`GatewayRequest`](crate::gateway::GatewayRequest), handed to the gateway
//! that owns the path, and the [`GatewayResponse`](crate::gateway::GatewayResponse)
//! is converted back. Routing, templates and error mapping all live in the
//! gateway.

pub mod http;

pub use http::{router, serve};

#[cfg(test)]
mod tests;
