use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::utils::{PipelineError, Result};

/// Action names checked by the built-in components.
pub mod actions {
    pub const SEND_MESSAGE: &str = "queue:SendMessage";
    pub const PUBLISH: &str = "topic:Publish";
    pub const PUT_ITEM: &str = "table:PutItem";
    pub const DELETE_ITEM: &str = "table:DeleteItem";
    pub const PUT_OBJECT: &str = "object:PutObject";
    pub const INVOKE: &str = "function:Invoke";
}

/// Resource name helpers, so every component spells them the same way.
pub mod resources {
    pub fn queue(name: &str) -> String {
        format!("queue/{name}")
    }

    pub fn topic(name: &str) -> String {
        format!("topic/{name}")
    }

    pub fn table(name: &str) -> String {
        format!("table/{name}")
    }

    pub fn object(bucket: &str, key: &str) -> String {
        format!("bucket/{bucket}/{key}")
    }

    pub fn function(name: &str) -> String {
        format!("function/{name}")
    }
}

/// Identity a component acts as.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal(String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One `{action, resource}` permission.
///
/// Either side may end in `*`, which matches any suffix (`topic:*`,
/// `bucket/workspace/*`, or a bare `*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub action: String,
    pub resource: String,
}

impl Grant {
    pub fn new(action: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            resource: resource.into(),
        }
    }

    pub fn matches(&self, action: &str, resource: &str) -> bool {
        pattern_matches(&self.action, action) && pattern_matches(&self.resource, resource)
    }
}

fn pattern_matches(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

/// A named set of grants, attached to a principal as a unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    pub grants: Vec<Grant>,
}

impl Policy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            grants: Vec::new(),
        }
    }

    pub fn allow(mut self, action: impl Into<String>, resource: impl Into<String>) -> Self {
        self.grants.push(Grant::new(action, resource));
        self
    }
}

/// Shared, additive grant table for one topology.
///
/// Cloning is cheap and every clone sees the same grants. Grants can only be
/// added, matching the create-only topology lifecycle.
#[derive(Debug, Clone, Default)]
pub struct Authorizer {
    grants: Arc<RwLock<HashMap<Principal, Vec<Grant>>>>,
}

impl Authorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach every grant in `policy` to `principal`.
    pub fn attach(&self, principal: &Principal, policy: Policy) {
        debug!(%principal, policy = %policy.name, "attaching policy");
        self.grants
            .write()
            .entry(principal.clone())
            .or_default()
            .extend(policy.grants);
    }

    /// Add a single grant. Duplicates are ignored.
    pub fn grant(
        &self,
        principal: &Principal,
        action: impl Into<String>,
        resource: impl Into<String>,
    ) {
        let grant = Grant::new(action, resource);
        let mut grants = self.grants.write();
        let entry = grants.entry(principal.clone()).or_default();
        if !entry.contains(&grant) {
            entry.push(grant);
        }
    }

    pub fn is_allowed(&self, principal: &Principal, action: &str, resource: &str) -> bool {
        self.grants
            .read()
            .get(principal)
            .is_some_and(|grants| grants.iter().any(|g| g.matches(action, resource)))
    }

    /// Fails with `PermissionDenied` unless a grant covers the pair.
    pub fn check(&self, principal: &Principal, action: &str, resource: &str) -> Result<()> {
        if self.is_allowed(principal, action, resource) {
            Ok(())
        } else {
            warn!(%principal, action, resource, "permission denied");
            Err(PipelineError::permission_denied(
                principal.as_str(),
                action,
                resource,
            ))
        }
    }
}
