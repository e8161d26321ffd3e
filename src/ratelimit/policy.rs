//! Policy types and per-route policy hints.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WardenError;

/// The dimension a rate limit is partitioned by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyType {
    /// One budget per endpoint shared by every caller
    Global,
    /// One budget per client address
    IpBased,
    /// One budget per authenticated user
    UserBased,
    /// One budget per API key
    ApiKeyBased,
    /// One budget per HTTP method
    MethodBased,
    /// One budget per endpoint
    EndpointBased,
}

/// Static data attached to each policy type.
struct PolicyTraits {
    name: &'static str,
    scheme: &'static str,
    message_prefix: &'static str,
}

static GLOBAL: PolicyTraits = PolicyTraits {
    name: "global",
    scheme: "global",
    message_prefix: "Rate limit exceeded.",
};
static IP_BASED: PolicyTraits = PolicyTraits {
    name: "ip-based",
    scheme: "ip",
    message_prefix: "IP-based rate limit exceeded.",
};
static USER_BASED: PolicyTraits = PolicyTraits {
    name: "user-based",
    scheme: "user",
    message_prefix: "User-based rate limit exceeded.",
};
static API_KEY_BASED: PolicyTraits = PolicyTraits {
    name: "api-key-based",
    scheme: "api-key",
    message_prefix: "API key rate limit exceeded.",
};
static METHOD_BASED: PolicyTraits = PolicyTraits {
    name: "method-based",
    scheme: "method",
    message_prefix: "HTTP method rate limit exceeded.",
};
static ENDPOINT_BASED: PolicyTraits = PolicyTraits {
    name: "endpoint-based",
    scheme: "endpoint",
    message_prefix: "Endpoint rate limit exceeded.",
};

impl PolicyType {
    /// Every policy type, in declaration order.
    pub const ALL: [PolicyType; 6] = [
        PolicyType::Global,
        PolicyType::IpBased,
        PolicyType::UserBased,
        PolicyType::ApiKeyBased,
        PolicyType::MethodBased,
        PolicyType::EndpointBased,
    ];

    fn traits(&self) -> &'static PolicyTraits {
        match self {
            PolicyType::Global => &GLOBAL,
            PolicyType::IpBased => &IP_BASED,
            PolicyType::UserBased => &USER_BASED,
            PolicyType::ApiKeyBased => &API_KEY_BASED,
            PolicyType::MethodBased => &METHOD_BASED,
            PolicyType::EndpointBased => &ENDPOINT_BASED,
        }
    }

    /// Configuration name, e.g. `ip-based`.
    pub fn name(&self) -> &'static str {
        self.traits().name
    }

    /// Leading segment of partition keys built for this type.
    pub fn scheme(&self) -> &'static str {
        self.traits().scheme
    }

    /// Human-readable rejection message.
    pub fn rejection_message(&self, wait_seconds: u64) -> String {
        format!(
            "{} Please try again in {} seconds.",
            self.traits().message_prefix,
            wait_seconds
        )
    }

    /// Whether this type partitions by client address and so takes part in
    /// abuse tracking.
    pub fn is_ip_derived(&self) -> bool {
        matches!(self, PolicyType::IpBased)
    }
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PolicyType {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        PolicyType::ALL
            .into_iter()
            .find(|p| p.name() == normalized)
            .ok_or_else(|| WardenError::Config(format!("unknown policy type: {}", s)))
    }
}

/// Policy metadata registered alongside a route.
///
/// Zero `limit`/`time_window_seconds` mean "no hint" and fall through to the
/// default during resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyHint {
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub time_window_seconds: u64,
    #[serde(default = "default_policy_type")]
    pub policy_type: PolicyType,
    /// Methods subject to rate limiting; empty means all
    #[serde(default)]
    pub allowed_methods: Vec<String>,
    #[serde(default = "default_ddos_protection")]
    pub ddos_protection: bool,
}

fn default_policy_type() -> PolicyType {
    PolicyType::IpBased
}

fn default_ddos_protection() -> bool {
    true
}

impl Default for PolicyHint {
    fn default() -> Self {
        Self {
            limit: 0,
            time_window_seconds: 0,
            policy_type: default_policy_type(),
            allowed_methods: Vec::new(),
            ddos_protection: default_ddos_protection(),
        }
    }
}

impl PolicyHint {
    /// Hint with a limit and window for the given policy type.
    pub fn new(policy_type: PolicyType, limit: u64, time_window_seconds: u64) -> Self {
        Self {
            limit,
            time_window_seconds,
            policy_type,
            ..Default::default()
        }
    }

    /// Hint used for routes nobody registered: IP-based, no limits, no abuse
    /// tracking.
    pub fn unregistered() -> Self {
        Self {
            ddos_protection: false,
            ..Default::default()
        }
    }

    /// Restrict rate limiting to the given methods.
    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_methods = methods.into_iter().map(Into::into).collect();
        self
    }

    /// Toggle abuse tracking for this route.
    pub fn with_ddos_protection(mut self, enabled: bool) -> Self {
        self.ddos_protection = enabled;
        self
    }

    /// Whether a request with `method` is subject to this route's limit.
    pub fn applies_to_method(&self, method: Option<&str>) -> bool {
        if self.allowed_methods.is_empty() {
            return true;
        }
        match method {
            Some(method) => self
                .allowed_methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method)),
            None => false,
        }
    }
}

/// Identity details of a request used for key derivation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Authenticated user name
    pub principal: Option<String>,
    /// HTTP method
    pub method: Option<String>,
    /// Value of the API key header
    pub api_key: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// The API key header value, if present and non-empty.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.is_empty())
    }

    /// The authenticated user, if present and non-empty.
    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref().filter(|p| !p.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_type_round_trips_through_name() {
        for policy in PolicyType::ALL {
            assert_eq!(policy.name().parse::<PolicyType>().unwrap(), policy);
        }
        assert_eq!("IP_BASED".parse::<PolicyType>().unwrap(), PolicyType::IpBased);
        assert!("per-tenant".parse::<PolicyType>().is_err());
    }

    #[test]
    fn test_rejection_messages() {
        assert_eq!(
            PolicyType::IpBased.rejection_message(7),
            "IP-based rate limit exceeded. Please try again in 7 seconds."
        );
        assert_eq!(
            PolicyType::Global.rejection_message(1),
            "Rate limit exceeded. Please try again in 1 seconds."
        );
    }

    #[test]
    fn test_hint_method_filter() {
        let hint = PolicyHint::default();
        assert!(hint.applies_to_method(Some("DELETE")));
        assert!(hint.applies_to_method(None));

        let hint = PolicyHint::default().with_methods(["POST", "put"]);
        assert!(hint.applies_to_method(Some("post")));
        assert!(hint.applies_to_method(Some("PUT")));
        assert!(!hint.applies_to_method(Some("GET")));
        assert!(!hint.applies_to_method(None));
    }

    #[test]
    fn test_parse_hint_yaml() {
        let hint: PolicyHint = serde_yaml::from_str(
            "limit: 10\ntime-window-seconds: 5\npolicy-type: api-key-based\n",
        )
        .unwrap();
        assert_eq!(hint.policy_type, PolicyType::ApiKeyBased);
        assert_eq!(hint.limit, 10);
        assert!(hint.ddos_protection);
    }
}
