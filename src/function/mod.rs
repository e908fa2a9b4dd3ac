//! The `function` module is the compute tier.
//!
//! A [`ComputeFunction`] wraps an opaque [`Handler`] with a name, an
//! execution principal and a timeout. Invocations are stateless and may run
//! concurrently; the function never retries on its own. Whoever delivered the
//! event (queue, change feed, object notification, gateway) decides what a
//! failure means.

pub mod builtin;
pub mod compute;
pub mod registry;

pub use compute::{
    ComputeFunction, FnHandler, Handler, HandlerError, InvocationContext, Outcome, handler_fn,
};
pub use registry::FunctionRegistry;
