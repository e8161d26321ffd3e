//! Request metadata handed over by the transport layer.

use std::collections::HashMap;

use crate::ratelimit::RequestContext;

/// Header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Headers consulted, in order, for the originating client address.
const CLIENT_ADDRESS_HEADERS: [&str; 5] = [
    "X-Forwarded-For",
    "Proxy-Client-IP",
    "WL-Proxy-Client-IP",
    "HTTP_CLIENT_IP",
    "HTTP_X_FORWARDED_FOR",
];

/// What the core needs to know about an incoming request.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    /// Peer address of the connection
    pub remote_addr: String,
    pub method: String,
    /// Request path, used as the endpoint identifier
    pub path: String,
    /// Header names are matched case-insensitively
    pub headers: HashMap<String, String>,
    /// Authenticated user name, if any
    pub principal: Option<String>,
}

impl RequestMetadata {
    pub fn new(remote_addr: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The originating client address, preferring proxy headers over the
    /// peer address.
    pub fn client_address(&self) -> &str {
        CLIENT_ADDRESS_HEADERS
            .iter()
            .filter_map(|h| self.header(h))
            .map(str::trim)
            .find(|v| !v.is_empty() && !v.eq_ignore_ascii_case("unknown"))
            .unwrap_or(&self.remote_addr)
    }

    /// Identity details for key derivation.
    pub fn context(&self) -> RequestContext {
        RequestContext {
            principal: self.principal.clone(),
            method: Some(self.method.clone()).filter(|m| !m.is_empty()),
            api_key: self.header(API_KEY_HEADER).map(String::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_address_defaults_to_peer() {
        let req = RequestMetadata::new("192.168.1.5", "GET", "/api");
        assert_eq!(req.client_address(), "192.168.1.5");
    }

    #[test]
    fn test_client_address_prefers_forwarded_header() {
        let req = RequestMetadata::new("10.0.0.1", "GET", "/api")
            .with_header("x-forwarded-for", "203.0.113.7");
        assert_eq!(req.client_address(), "203.0.113.7");
    }

    #[test]
    fn test_client_address_skips_unknown() {
        let req = RequestMetadata::new("10.0.0.1", "GET", "/api")
            .with_header("X-Forwarded-For", "unknown")
            .with_header("Proxy-Client-IP", "")
            .with_header("WL-Proxy-Client-IP", "198.51.100.2");
        assert_eq!(req.client_address(), "198.51.100.2");
    }

    #[test]
    fn test_context() {
        let req = RequestMetadata::new("10.0.0.1", "POST", "/api")
            .with_header("x-api-key", "secret")
            .with_principal("alice");
        let ctx = req.context();
        assert_eq!(ctx.api_key(), Some("secret"));
        assert_eq!(ctx.principal(), Some("alice"));
        assert_eq!(ctx.method.as_deref(), Some("POST"));
    }
}
