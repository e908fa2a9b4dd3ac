//! The `policy` module holds the additive permission model.
//!
//! A principal (a compute function's role or a gateway integration's
//! execution role) may only act when a grant for the `(action, resource)`
//! pair exists. The check happens at invocation time; a missing grant is a
//! `PermissionDenied` failure.
//!
//! There is no process-wide policy table. Each topology builds its own
//! [`Authorizer`] and hands clones of it to the components it wires.

pub mod grant;

pub use grant::{Authorizer, Grant, Policy, Principal, actions, resources};
