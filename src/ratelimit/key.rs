//! Partition key derivation.

use std::fmt;

use super::policy::{PolicyType, RequestContext};

/// Identifies the admission budget a request counts against.
///
/// Formatted as `<scheme>:<identifier>:<endpoint>`, or `<scheme>:<endpoint>`
/// for the endpoint-wide schemes. Two requests share a budget exactly when
/// their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey(String);

impl PartitionKey {
    fn scoped(scheme: &str, identifier: &str, endpoint: &str) -> Self {
        Self(format!("{}:{}:{}", scheme, identifier, endpoint))
    }

    fn endpoint_wide(scheme: &str, endpoint: &str) -> Self {
        Self(format!("{}:{}", scheme, endpoint))
    }

    /// Key for a client address.
    pub fn ip(client: &str, endpoint: &str) -> Self {
        Self::scoped(PolicyType::IpBased.scheme(), client, endpoint)
    }

    /// Key for an API key.
    pub fn api_key(key: &str, endpoint: &str) -> Self {
        Self::scoped(PolicyType::ApiKeyBased.scheme(), key, endpoint)
    }

    /// Derive the key for a request.
    ///
    /// User- and API-key-based policies fall back to the client address when
    /// the identity is missing; method-based falls back to the endpoint-wide
    /// key when no method is known.
    pub fn derive(
        client: &str,
        endpoint: &str,
        policy: PolicyType,
        ctx: &RequestContext,
    ) -> Self {
        match policy {
            PolicyType::IpBased => Self::ip(client, endpoint),
            PolicyType::UserBased => match ctx.principal() {
                Some(user) => Self::scoped(policy.scheme(), user, endpoint),
                None => Self::ip(client, endpoint),
            },
            PolicyType::ApiKeyBased => match ctx.api_key() {
                Some(key) => Self::api_key(key, endpoint),
                None => Self::ip(client, endpoint),
            },
            PolicyType::MethodBased => match ctx.method.as_deref() {
                Some(method) => Self::scoped(policy.scheme(), method, endpoint),
                None => Self::endpoint_wide(PolicyType::EndpointBased.scheme(), endpoint),
            },
            PolicyType::EndpointBased | PolicyType::Global => {
                Self::endpoint_wide(policy.scheme(), endpoint)
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PartitionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
