//! Effective limit resolution.
//!
//! Four sources contribute to the limit applied to an endpoint, consulted in
//! fixed order:
//!
//! 1. `RATE_LIMITER_ENDPOINTS_<ENDPOINT>_*` environment overrides
//! 2. the statically configured `endpoints` table
//! 3. the route's [`PolicyHint`]
//! 4. the global default (itself overridable through the environment)
//!
//! `limit` and `time_window_seconds` are resolved independently: each takes the
//! first non-zero value found, so an endpoint may take its limit from one
//! source and its window from another. `enabled` takes the first explicit
//! value; a disable short-circuits resolution.

use std::sync::Arc;

use tracing::debug;

use super::policy::PolicyHint;
use crate::config::{endpoint_env_key, env_key, lookup_bool, lookup_u64, EnvLookup, RateLimiterConfig};

/// The limit applied to one request. Zero means "unset" wherever it appears
/// in a source; a resolved limit is always taken from some source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveLimit {
    pub limit: u64,
    pub time_window_seconds: u64,
    pub enabled: bool,
}

impl EffectiveLimit {
    /// A disabled limit; the request bypasses accounting.
    pub fn disabled() -> Self {
        Self {
            limit: 0,
            time_window_seconds: 0,
            enabled: false,
        }
    }
}

/// One layer of the resolution chain.
trait LimitSource {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    fn limit(&self, endpoint: &str) -> Option<u64>;

    fn time_window_seconds(&self, endpoint: &str) -> Option<u64>;

    fn enabled(&self, _endpoint: &str) -> Option<bool> {
        None
    }
}

struct EnvSource<'a> {
    env: &'a EnvLookup,
}

impl LimitSource for EnvSource<'_> {
    fn name(&self) -> &'static str {
        "environment"
    }

    fn limit(&self, endpoint: &str) -> Option<u64> {
        lookup_u64(self.env, &endpoint_env_key(endpoint, "limit"))
    }

    fn time_window_seconds(&self, endpoint: &str) -> Option<u64> {
        lookup_u64(self.env, &endpoint_env_key(endpoint, "time-window-seconds"))
    }

    fn enabled(&self, endpoint: &str) -> Option<bool> {
        lookup_bool(self.env, &endpoint_env_key(endpoint, "enabled"))
    }
}

struct StaticSource<'a> {
    config: &'a RateLimiterConfig,
}

impl LimitSource for StaticSource<'_> {
    fn name(&self) -> &'static str {
        "configuration"
    }

    fn limit(&self, endpoint: &str) -> Option<u64> {
        self.config.endpoints.get(endpoint).map(|e| e.limit)
    }

    fn time_window_seconds(&self, endpoint: &str) -> Option<u64> {
        self.config
            .endpoints
            .get(endpoint)
            .map(|e| e.time_window_seconds)
    }

    fn enabled(&self, endpoint: &str) -> Option<bool> {
        self.config.endpoints.get(endpoint).map(|e| e.enabled)
    }
}

struct HintSource<'a> {
    hint: &'a PolicyHint,
}

impl LimitSource for HintSource<'_> {
    fn name(&self) -> &'static str {
        "route hint"
    }

    fn limit(&self, _endpoint: &str) -> Option<u64> {
        Some(self.hint.limit)
    }

    fn time_window_seconds(&self, _endpoint: &str) -> Option<u64> {
        Some(self.hint.time_window_seconds)
    }
}

struct DefaultSource<'a> {
    config: &'a RateLimiterConfig,
    env: &'a EnvLookup,
}

impl LimitSource for DefaultSource<'_> {
    fn name(&self) -> &'static str {
        "default"
    }

    fn limit(&self, _endpoint: &str) -> Option<u64> {
        lookup_u64(self.env, &env_key("default-limit"))
            .filter(|v| *v > 0)
            .or(Some(self.config.default_limit))
    }

    fn time_window_seconds(&self, _endpoint: &str) -> Option<u64> {
        lookup_u64(self.env, &env_key("default-time-window-seconds"))
            .filter(|v| *v > 0)
            .or(Some(self.config.default_time_window_seconds))
    }
}

/// Merges environment, configuration, route hints and defaults into one
/// [`EffectiveLimit`] per endpoint.
#[derive(Clone)]
pub struct PolicyResolver {
    config: Arc<RateLimiterConfig>,
    env: EnvLookup,
}

impl std::fmt::Debug for PolicyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyResolver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PolicyResolver {
    /// Create a resolver over a configuration snapshot and an environment.
    pub fn new(config: Arc<RateLimiterConfig>, env: EnvLookup) -> Self {
        Self { config, env }
    }

    /// The configuration snapshot this resolver reads.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Resolve the effective limit for `endpoint`.
    pub fn resolve(&self, endpoint: &str, hint: &PolicyHint) -> EffectiveLimit {
        let env = EnvSource { env: &self.env };
        let configured = StaticSource {
            config: &self.config,
        };
        let route = HintSource { hint };
        let default = DefaultSource {
            config: &self.config,
            env: &self.env,
        };
        let chain: [&dyn LimitSource; 4] = [&env, &configured, &route, &default];

        if let Some(source) = chain
            .iter()
            .find(|s| s.enabled(endpoint).is_some())
        {
            if source.enabled(endpoint) == Some(false) {
                debug!(endpoint = %endpoint, source = source.name(), "Rate limiting disabled for endpoint");
                return EffectiveLimit::disabled();
            }
        }

        let (limit, limit_source) = first_non_zero(&chain, |s| s.limit(endpoint));
        let (window, window_source) = first_non_zero(&chain, |s| s.time_window_seconds(endpoint));

        debug!(
            endpoint = %endpoint,
            limit = limit,
            limit_source = limit_source,
            window = window,
            window_source = window_source,
            "Resolved effective limit"
        );

        EffectiveLimit {
            limit,
            time_window_seconds: window,
            enabled: true,
        }
    }
}

fn first_non_zero<F>(chain: &[&dyn LimitSource], field: F) -> (u64, &'static str)
where
    F: Fn(&dyn LimitSource) -> Option<u64>,
{
    chain
        .iter()
        .find_map(|s| field(*s).filter(|v| *v > 0).map(|v| (v, s.name())))
        .unwrap_or((0, "none"))
}
