//! Configuration management for ratewarden.
//!
//! Configuration is read from a file through the `config` crate and then
//! overlaid with `RATE_LIMITER_*` environment variables. Per-endpoint and
//! default limit overrides are not baked in here; the
//! [`PolicyResolver`](crate::ratelimit::PolicyResolver) consults them on every
//! resolution through an [`EnvLookup`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, WardenError};

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "RATE_LIMITER";

/// Function used to read environment-style overrides.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Lookup backed by the process environment.
pub fn process_env() -> EnvLookup {
    Arc::new(|key| std::env::var(key).ok())
}

/// Lookup backed by a fixed map, mostly useful in tests.
pub fn map_env<I, K, V>(vars: I) -> EnvLookup
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let vars: HashMap<String, String> = vars
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    Arc::new(move |key| vars.get(key).cloned())
}

/// Lookup that never finds anything.
pub fn empty_env() -> EnvLookup {
    Arc::new(|_| None)
}

/// Environment key for a global option path, e.g. `ddos.ban-duration-seconds`
/// becomes `RATE_LIMITER_DDOS_BAN_DURATION_SECONDS`.
pub fn env_key(path: &str) -> String {
    format!("{}_{}", ENV_PREFIX, env_key_tail(path))
}

/// Environment key for a per-endpoint field, e.g. (`/api/login`, `limit`)
/// becomes `RATE_LIMITER_ENDPOINTS_API_LOGIN_LIMIT`.
pub fn endpoint_env_key(endpoint: &str, field: &str) -> String {
    let name: String = endpoint
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    let name = name.trim_matches('_');
    format!("{}_ENDPOINTS_{}_{}", ENV_PREFIX, name, env_key_tail(field))
}

fn env_key_tail(field: &str) -> String {
    field
        .chars()
        .map(|c| match c {
            '-' | '.' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

/// Read a non-empty override value.
pub(crate) fn lookup_raw(env: &EnvLookup, key: &str) -> Option<String> {
    env(key).filter(|v| !v.trim().is_empty())
}

/// Read and parse a numeric override. Unparsable values are logged and
/// treated as absent.
pub(crate) fn lookup_u64(env: &EnvLookup, key: &str) -> Option<u64> {
    let raw = lookup_raw(env, key)?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key = %key, value = %raw, error = %e, "Ignoring unparsable numeric override");
            None
        }
    }
}

/// Read and parse a boolean override (`true`/`false`, any case).
pub(crate) fn lookup_bool(env: &EnvLookup, key: &str) -> Option<bool> {
    let raw = lookup_raw(env, key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => {
            warn!(key = %key, value = %raw, "Ignoring unparsable boolean override");
            None
        }
    }
}

/// Main configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WardenConfig {
    /// Admission-control settings
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,

    /// Shared store settings for distributed mode
    #[serde(default)]
    pub redis: RedisConfig,
}

/// Admission-control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RateLimiterConfig {
    /// Master switch; when off every non-blacklisted request is admitted
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Limit applied when nothing more specific is configured
    #[serde(default = "default_limit")]
    pub default_limit: u64,

    /// Window applied when nothing more specific is configured
    #[serde(default = "default_window")]
    pub default_time_window_seconds: u64,

    /// Use the shared store instead of in-process windows
    #[serde(default)]
    pub enable_distributed: bool,

    /// Consult the whitelist and blacklist
    #[serde(default)]
    pub enable_ip_filtering: bool,

    /// Per-endpoint overrides keyed by endpoint path
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointLimit>,

    /// Abuse detection settings
    #[serde(default)]
    pub ddos: DdosConfig,

    /// Addresses that bypass every check
    #[serde(default)]
    pub whitelisted_ips: Vec<String>,

    /// Addresses that are always denied
    #[serde(default)]
    pub blacklisted_ips: Vec<String>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_limit: default_limit(),
            default_time_window_seconds: default_window(),
            enable_distributed: false,
            enable_ip_filtering: false,
            endpoints: HashMap::new(),
            ddos: DdosConfig::default(),
            whitelisted_ips: Vec::new(),
            blacklisted_ips: Vec::new(),
        }
    }
}

/// Statically configured override for one endpoint. Zero means "unset".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EndpointLimit {
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub time_window_seconds: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for EndpointLimit {
    fn default() -> Self {
        Self {
            limit: 0,
            time_window_seconds: 0,
            enabled: true,
        }
    }
}

/// Abuse detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DdosConfig {
    /// Requests per reset interval before an address is banned
    #[serde(default = "default_ddos_threshold")]
    pub threshold: u64,

    /// How long a ban lasts
    #[serde(default = "default_ban_duration")]
    pub ban_duration_seconds: u64,

    /// Period of the hard counter reset
    #[serde(default = "default_reset_interval")]
    pub count_reset_interval_seconds: u64,
}

impl Default for DdosConfig {
    fn default() -> Self {
        Self {
            threshold: default_ddos_threshold(),
            ban_duration_seconds: default_ban_duration(),
            count_reset_interval_seconds: default_reset_interval(),
        }
    }
}

/// Shared store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RedisConfig {
    /// Connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix prepended to every partition key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_limit() -> u64 {
    100
}

fn default_window() -> u64 {
    60
}

fn default_ddos_threshold() -> u64 {
    1000
}

fn default_ban_duration() -> u64 {
    3600
}

fn default_reset_interval() -> u64 {
    60
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}

fn default_key_prefix() -> String {
    "rate_limit:".to_string()
}

impl WardenConfig {
    /// Load configuration from a file path. The format is picked from the
    /// file extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        if !path.exists() {
            return Err(WardenError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Overlay global `RATE_LIMITER_*` overrides onto this configuration.
    ///
    /// Malformed values are ignored and the file value is kept.
    pub fn apply_env_overrides(&mut self, env: &EnvLookup) {
        let rl = &mut self.rate_limiter;

        if let Some(v) = lookup_bool(env, &env_key("enabled")) {
            rl.enabled = v;
        }
        if let Some(v) = lookup_bool(env, &env_key("enable-distributed")) {
            rl.enable_distributed = v;
        }
        if let Some(v) = lookup_bool(env, &env_key("enable-ip-filtering")) {
            rl.enable_ip_filtering = v;
        }
        if let Some(v) = lookup_u64(env, &env_key("ddos.threshold")) {
            rl.ddos.threshold = v;
        }
        if let Some(v) = lookup_u64(env, &env_key("ddos.ban-duration-seconds")) {
            rl.ddos.ban_duration_seconds = v;
        }
        if let Some(v) = lookup_u64(env, &env_key("ddos.count-reset-interval-seconds")) {
            rl.ddos.count_reset_interval_seconds = v;
        }
        if let Some(v) = lookup_raw(env, &env_key("whitelisted-ips")) {
            rl.whitelisted_ips = split_list(&v);
        }
        if let Some(v) = lookup_raw(env, &env_key("blacklisted-ips")) {
            rl.blacklisted_ips = split_list(&v);
        }
        if let Some(v) = lookup_raw(env, "RATE_LIMITER_REDIS_URL") {
            self.redis.url = v;
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
