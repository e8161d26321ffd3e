//! Route-to-policy registration.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::ratelimit::PolicyHint;

/// Policy hints registered per endpoint path at startup.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<String, PolicyHint>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the hint for `path`.
    pub fn register(&self, path: impl Into<String>, hint: PolicyHint) {
        let path = path.into();
        debug!(path = %path, policy = %hint.policy_type, limit = hint.limit, "Registered route policy");
        self.routes.write().insert(path, hint);
    }

    /// Hint for `path`, if registered.
    pub fn hint(&self, path: &str) -> Option<PolicyHint> {
        self.routes.read().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    /// Load a table from a YAML mapping of path to hint.
    pub fn from_yaml(yaml: &str) -> crate::error::Result<Self> {
        let routes: HashMap<String, PolicyHint> = serde_yaml::from_str(yaml).map_err(|e| {
            crate::error::WardenError::Config(format!("Failed to parse route table: {}", e))
        })?;
        Ok(Self {
            routes: RwLock::new(routes),
        })
    }
}
