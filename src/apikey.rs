//! API key issuance, validation and revocation.
//!
//! Keys act both as an identity for API-key partitioned policies and as a
//! source of per-key limits that replace the endpoint policy entirely.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;

/// Random bytes per issued secret.
const SECRET_BYTES: usize = 32;

/// An issued API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApiKeyRecord {
    pub secret: String,
    pub owner: String,
    pub limit: u64,
    pub time_window_seconds: u64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    /// `None` means the key never expires
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    /// Whether the key is enabled and not past its expiry at `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.expires_at.map_or(true, |expires| now <= expires)
    }
}

/// In-memory registry of API keys. Records are never deleted; revocation
/// only disables them.
pub struct ApiKeyRegistry {
    keys: DashMap<String, ApiKeyRecord>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ApiKeyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyRegistry")
            .field("keys", &self.keys.len())
            .finish()
    }
}

impl ApiKeyRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            keys: DashMap::new(),
            clock,
        }
    }

    /// Issue a key for `owner`. `expiry_days == 0` issues a key that never
    /// expires.
    pub fn issue(
        &self,
        owner: &str,
        limit: u64,
        time_window_seconds: u64,
        expiry_days: u32,
    ) -> ApiKeyRecord {
        let now = self.clock.now();
        let expires_at = (expiry_days > 0).then(|| now + Duration::days(i64::from(expiry_days)));

        let record = loop {
            let secret = generate_secret();
            if self.keys.contains_key(&secret) {
                continue;
            }
            break ApiKeyRecord {
                secret,
                owner: owner.to_string(),
                limit,
                time_window_seconds,
                enabled: true,
                created_at: now,
                expires_at,
            };
        };

        self.keys.insert(record.secret.clone(), record.clone());
        info!(
            owner = %owner,
            limit = limit,
            window = time_window_seconds,
            expires_at = ?expires_at,
            "Issued API key"
        );
        record
    }

    /// Whether `secret` names an enabled, unexpired key.
    pub fn validate(&self, secret: &str) -> bool {
        self.active(secret).is_some()
    }

    /// The record for `secret` if it is enabled and unexpired.
    pub fn active(&self, secret: &str) -> Option<ApiKeyRecord> {
        let now = self.clock.now();
        let record = self.keys.get(secret)?;
        if record.is_active_at(now) {
            Some(record.clone())
        } else {
            debug!(owner = %record.owner, "Inactive API key presented");
            None
        }
    }

    /// The record for `secret` regardless of state.
    pub fn get(&self, secret: &str) -> Option<ApiKeyRecord> {
        self.keys.get(secret).map(|r| r.clone())
    }

    /// Disable `secret`. Returns `false` if no such key exists.
    pub fn revoke(&self, secret: &str) -> bool {
        match self.keys.get_mut(secret) {
            Some(mut record) => {
                record.enabled = false;
                info!(owner = %record.owner, "Revoked API key");
                true
            }
            None => false,
        }
    }

    /// Number of issued keys, including revoked ones.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
