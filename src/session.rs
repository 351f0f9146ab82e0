//! Session record and its cache hash encoding.
//!
//! A record is stored as a flat hash of string fields:
//!
//! ```text
//! v             schema version (must equal CURRENT_SCHEMA_VERSION)
//! session_id    user_id    token_hash    email
//! expires_at    last_activity            "<unix secs>.<nanos>"
//! ip  user_agent  display_name           optional, omitted when absent
//! ```
//!
//! Timestamps keep full precision so a record served from cache is identical
//! to the one the system-of-record returned.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current schema version of the cached hash layout.
///
/// Bump when fields are added, removed or re-encoded. Entries carrying any
/// other version are treated as corrupt, deleted, and reloaded.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

const F_VERSION: &str = "v";
const F_SESSION_ID: &str = "session_id";
const F_USER_ID: &str = "user_id";
const F_TOKEN_HASH: &str = "token_hash";
const F_EXPIRES_AT: &str = "expires_at";
const F_LAST_ACTIVITY: &str = "last_activity";
const F_IP: &str = "ip";
const F_USER_AGENT: &str = "user_agent";
const F_EMAIL: &str = "email";
const F_DISPLAY_NAME: &str = "display_name";

/// Hash an opaque session token. Only the hash is ever stored or compared.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// A validated session with the denormalized profile fields needed on a hit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    /// SHA-256 hex of the session token.
    pub token_hash: String,
    pub expires_at: SystemTime,
    pub last_activity: SystemTime,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub email: String,
    pub display_name: Option<String>,
}

impl SessionRecord {
    /// Whether the session is still valid at `now`.
    pub fn is_live_at(&self, now: SystemTime) -> bool {
        self.expires_at > now
    }

    /// Time left until expiry, `None` once expired.
    pub fn remaining_at(&self, now: SystemTime) -> Option<Duration> {
        match self.expires_at.duration_since(now) {
            Ok(left) if !left.is_zero() => Some(left),
            _ => None,
        }
    }

    /// TTL to store this record with: `max_ttl` clamped to the session's
    /// remaining lifetime, floored to whole milliseconds.
    ///
    /// Returns `None` when the record must not be cached at all.
    pub fn cache_ttl_at(&self, max_ttl: Duration, now: SystemTime) -> Option<Duration> {
        let remaining = self.remaining_at(now)?;
        let ttl = Duration::from_millis(remaining.min(max_ttl).as_millis() as u64);
        (!ttl.is_zero()).then_some(ttl)
    }

    /// Encode into hash fields.
    pub fn to_fields(&self) -> Result<Vec<(String, String)>> {
        let mut fields = vec![
            (F_VERSION.to_string(), CURRENT_SCHEMA_VERSION.to_string()),
            (F_SESSION_ID.to_string(), self.session_id.clone()),
            (F_USER_ID.to_string(), self.user_id.clone()),
            (F_TOKEN_HASH.to_string(), self.token_hash.clone()),
            (F_EXPIRES_AT.to_string(), encode_time(self.expires_at)?),
            (F_LAST_ACTIVITY.to_string(), encode_time(self.last_activity)?),
            (F_EMAIL.to_string(), self.email.clone()),
        ];
        let optional = [
            (F_IP, &self.ip_address),
            (F_USER_AGENT, &self.user_agent),
            (F_DISPLAY_NAME, &self.display_name),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                fields.push((name.to_string(), value.clone()));
            }
        }
        Ok(fields)
    }

    /// Decode from hash fields, checking the schema version.
    ///
    /// # Errors
    /// - `Error::Integrity` on a missing or different schema version
    /// - `Error::Deserialization` on missing required fields or bad timestamps
    pub fn from_fields(mut fields: HashMap<String, String>) -> Result<Self> {
        match fields.get(F_VERSION).map(|v| v.parse::<u32>()) {
            Some(Ok(CURRENT_SCHEMA_VERSION)) => {}
            Some(Ok(found)) => {
                return Err(Error::Integrity(format!(
                    "schema version mismatch: expected {}, found {}",
                    CURRENT_SCHEMA_VERSION, found
                )))
            }
            _ => return Err(Error::Integrity("missing schema version".to_string())),
        }

        let mut required = |name: &str| {
            fields
                .remove(name)
                .ok_or_else(|| Error::Deserialization(format!("missing field {}", name)))
        };

        let session_id = required(F_SESSION_ID)?;
        let user_id = required(F_USER_ID)?;
        let token_hash = required(F_TOKEN_HASH)?;
        let email = required(F_EMAIL)?;
        let expires_at = decode_time(&required(F_EXPIRES_AT)?)?;
        let last_activity = decode_time(&required(F_LAST_ACTIVITY)?)?;

        Ok(SessionRecord {
            session_id,
            user_id,
            token_hash,
            expires_at,
            last_activity,
            ip_address: fields.remove(F_IP),
            user_agent: fields.remove(F_USER_AGENT),
            email,
            display_name: fields.remove(F_DISPLAY_NAME),
        })
    }
}

fn encode_time(t: SystemTime) -> Result<String> {
    let since = t
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Deserialization(format!("timestamp before epoch: {}", e)))?;
    Ok(format!("{}.{:09}", since.as_secs(), since.subsec_nanos()))
}

fn decode_time(raw: &str) -> Result<SystemTime> {
    let bad = || Error::Deserialization(format!("invalid timestamp {:?}", raw));
    let (secs, nanos) = raw.split_once('.').ok_or_else(bad)?;
    let secs: u64 = secs.parse().map_err(|_| bad())?;
    let nanos: u32 = nanos.parse().map_err(|_| bad())?;
    if nanos >= 1_000_000_000 {
        return Err(bad());
    }
    Ok(UNIX_EPOCH + Duration::new(secs, nanos))
}
