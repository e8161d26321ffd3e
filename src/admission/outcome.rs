//! Admission outcomes and their rendering at the request boundary.

use serde::{Deserialize, Serialize};

use crate::ratelimit::PolicyType;

/// Message returned to blacklisted clients.
pub const ACCESS_DENIED_MESSAGE: &str = "Access denied: Your IP address is blacklisted";

/// Message returned to banned clients.
pub const DDOS_BLOCKED_MESSAGE: &str =
    "Request blocked due to DDoS protection. Your IP has been temporarily banned.";

/// Why a request was rejected for rate reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionCause {
    /// The partition's budget is exhausted
    RateLimit(PolicyType),
    /// The source address is banned
    Ddos,
}

/// A recoverable rejection carrying a retry hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub cause: RejectionCause,
    pub wait_seconds: u64,
    pub message: String,
}

impl Rejection {
    pub fn rate_limited(policy: PolicyType, wait_seconds: u64) -> Self {
        Self {
            cause: RejectionCause::RateLimit(policy),
            wait_seconds,
            message: policy.rejection_message(wait_seconds),
        }
    }

    pub fn banned(ban_duration_seconds: u64) -> Self {
        Self {
            cause: RejectionCause::Ddos,
            wait_seconds: ban_duration_seconds,
            message: DDOS_BLOCKED_MESSAGE.to_string(),
        }
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Let the request through
    Admit,
    /// Rate limited or banned; retry later
    Reject(Rejection),
    /// Blacklisted; retrying does not help
    Deny,
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admit)
    }

    /// The retry hint, for rate-limit and ban rejections.
    pub fn wait_seconds(&self) -> Option<u64> {
        match self {
            Decision::Reject(r) => Some(r.wait_seconds),
            _ => None,
        }
    }

    /// Render the response the transport should send instead of the request,
    /// or `None` to pass the request through.
    pub fn into_response(self, timestamp_ms: i64) -> Option<BoundaryResponse> {
        match self {
            Decision::Admit => None,
            Decision::Reject(rejection) => Some(BoundaryResponse {
                status: TOO_MANY_REQUESTS,
                retry_after: Some(rejection.wait_seconds),
                body: ErrorBody {
                    status: TOO_MANY_REQUESTS,
                    message: rejection.message,
                    timestamp: timestamp_ms,
                },
            }),
            Decision::Deny => Some(BoundaryResponse {
                status: FORBIDDEN,
                retry_after: None,
                body: ErrorBody {
                    status: FORBIDDEN,
                    message: ACCESS_DENIED_MESSAGE.to_string(),
                    timestamp: timestamp_ms,
                },
            }),
        }
    }
}

const TOO_MANY_REQUESTS: u16 = 429;
const FORBIDDEN: u16 = 403;

/// JSON body of a rejection response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: u16,
    pub message: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

/// Response replacing a rejected request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryResponse {
    pub status: u16,
    /// Seconds for the `Retry-After` header
    pub retry_after: Option<u64>,
    pub body: ErrorBody,
}

impl BoundaryResponse {
    /// Headers to set on the response.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![("Content-Type", "application/json".to_string())];
        if let Some(wait) = self.retry_after {
            headers.push(("Retry-After", wait.to_string()));
        }
        headers
    }

    /// The serialized body.
    pub fn body_json(&self) -> String {
        serde_json::to_string(&self.body).unwrap_or_default()
    }
}
