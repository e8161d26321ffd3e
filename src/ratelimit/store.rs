//! Shared stores for distributed admission.
//!
//! A store exposes one indivisible check-and-consume operation. Given a key,
//! limit, window and the caller's current time it:
//!
//! - creates the counter at `limit - 1` expiring after `window` seconds and
//!   admits, when the key is absent;
//! - decrements and admits, when the counter is positive;
//! - rejects without touching the counter otherwise.
//!
//! The bucket therefore refills completely, and only, when the key expires.
//! [`RedisStore`] runs the operation as a Lua script; [`InMemoryStore`]
//! provides the same semantics in-process.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script, Value};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::RedisConfig;
use crate::error::Result;

/// Lua implementation of the check-and-consume operation.
///
/// KEYS[1] = counter key, ARGV = limit, window seconds, current epoch seconds.
pub const CONSUME_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

local current = redis.call('GET', key)
if not current then
    if limit <= 0 then
        return 0
    end
    if window < 1 then
        window = 1
    end
    redis.call('SET', key, limit - 1, 'EX', window)
    return 1
end

if tonumber(current) > 0 then
    redis.call('DECR', key)
    return 1
end

return 0
"#;

/// A store able to run the check-and-consume operation atomically.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Run the check-and-consume operation for `key`.
    async fn consume(&self, key: &str, limit: u64, window_seconds: u64, now_secs: i64) -> Result<bool>;

    /// Remaining lifetime of the counter for `key`, `None` if absent or
    /// without expiry.
    async fn ttl_seconds(&self, key: &str) -> Result<Option<u64>>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Redis-backed store.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    script: Arc<Script>,
    key_prefix: String,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect using the given configuration.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        info!(url = %config.url, prefix = %config.key_prefix, "Connecting to shared store");
        let client = Client::open(config.url.as_str())?;
        let connection = ConnectionManager::new(client).await?;

        Ok(Self {
            connection,
            script: Arc::new(Script::new(CONSUME_SCRIPT)),
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn consume(&self, key: &str, limit: u64, window_seconds: u64, now_secs: i64) -> Result<bool> {
        let mut conn = self.connection.clone();
        let reply: Value = self
            .script
            .key(self.key(key))
            .arg(limit)
            .arg(window_seconds)
            .arg(now_secs)
            .invoke_async(&mut conn)
            .await?;

        Ok(reply_admits(key, &reply))
    }

    async fn ttl_seconds(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.connection.clone();
        let ttl: i64 = conn.ttl(self.key(key)).await?;
        // -2: missing key, -1: no expiry
        Ok(if ttl >= 0 { Some(ttl as u64) } else { None })
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: i64,
    expires_at: i64,
}

/// Interpret a consume script reply. Only integer 1 admits; anything
/// unexpected is treated as a rejection.
pub(crate) fn reply_admits(key: &str, reply: &Value) -> bool {
    match reply {
        Value::Int(1) => true,
        Value::Int(0) => false,
        other => {
            warn!(key = %key, reply = ?other, "Unexpected consume script reply, rejecting");
            false
        }
    }
}

/// In-process store with the same semantics as the Lua script.
///
/// Useful for single-node deployments that want token-bucket behavior and
/// for tests.
pub struct InMemoryStore {
    buckets: DashMap<String, Bucket>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            clock,
        }
    }

    /// Tokens left for `key`, if a live bucket exists.
    pub fn tokens(&self, key: &str) -> Option<i64> {
        let now = self.clock.now_secs();
        self.buckets
            .get(key)
            .filter(|b| b.expires_at > now)
            .map(|b| b.tokens)
    }
}

#[async_trait]
impl AtomicStore for InMemoryStore {
    // Expiry is judged against the store's own clock, like a real server.
    async fn consume(&self, key: &str, limit: u64, window_seconds: u64, _now_secs: i64) -> Result<bool> {
        let now = self.clock.now_secs();
        let window = i64::try_from(window_seconds.max(1)).unwrap_or(i64::MAX);
        let fresh = || Bucket {
            tokens: limit as i64 - 1,
            expires_at: now.saturating_add(window),
        };

        let admitted = match self.buckets.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                if limit == 0 {
                    return Ok(false);
                }
                vacant.insert(fresh());
                true
            }
            Entry::Occupied(mut occupied) => {
                let bucket = occupied.get_mut();
                if bucket.expires_at <= now {
                    if limit == 0 {
                        occupied.remove();
                        return Ok(false);
                    }
                    *bucket = fresh();
                    true
                } else if bucket.tokens > 0 {
                    bucket.tokens -= 1;
                    true
                } else {
                    false
                }
            }
        };

        debug!(key = %key, admitted = admitted, "In-memory consume");
        Ok(admitted)
    }

    async fn ttl_seconds(&self, key: &str) -> Result<Option<u64>> {
        let now = self.clock.now_secs();
        Ok(self
            .buckets
            .get(key)
            .map(|b| b.expires_at - now)
            .filter(|ttl| *ttl > 0)
            .map(|ttl| ttl as u64))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
