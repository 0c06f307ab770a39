//! TTL-capable metadata store over sled.
//!
//! Holds the small records that make listing and auth cheap: per-context
//! index entries, per-context access counters, and API key mappings. Values
//! are opaque bytes; expiry is advisory and enforced by this implementation
//! (lazily on read, plus a periodic [`SledIndex::sweep_expired`] pass driven
//! from the binary), not by callers.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ContextError, Result};

/// Small key-value store with advisory TTL expiry.
#[async_trait]
pub trait MetadataIndex: Send + Sync {
    /// Store an opaque value, expiring after `ttl` when given.
    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Fetch a value; expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove an entry. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// On-disk envelope: the value plus its optional absolute expiry
#[derive(Serialize, Deserialize)]
struct Entry {
    /// Unix seconds; `None` means the entry never expires
    expires_at: Option<i64>,
    value: Vec<u8>,
}

/// sled-backed [`MetadataIndex`]
pub struct SledIndex {
    db: sled::Db,
}

impl SledIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// In-memory instance, used by tests.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn encode(entry: &Entry) -> Result<Vec<u8>> {
        rmp_serde::to_vec(entry)
            .map_err(|e| ContextError::Storage(format!("metadata encode failed: {}", e)))
    }

    fn decode(bytes: &[u8]) -> Result<Entry> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| ContextError::Storage(format!("metadata decode failed: {}", e)))
    }

    /// Drop every expired entry; returns how many were removed. Entries that
    /// no longer decode are dropped as well.
    pub fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now().timestamp();
        let mut removed = 0;
        for item in self.db.iter() {
            let (key, value) = item?;
            let expired = match Self::decode(&value) {
                Ok(entry) => matches!(entry.expires_at, Some(at) if at <= now),
                Err(_) => true,
            };
            if expired {
                self.db.remove(&key)?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "metadata sweep dropped expired entries");
        }
        Ok(removed)
    }
}

#[async_trait]
impl MetadataIndex for SledIndex {
    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let entry = Entry {
            expires_at: ttl.map(|t| Utc::now().timestamp() + t.as_secs() as i64),
            value: value.to_vec(),
        };
        self.db.insert(key.as_bytes(), Self::encode(&entry)?)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let raw = match self.db.get(key.as_bytes())? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let entry = Self::decode(&raw)?;
        if let Some(at) = entry.expires_at {
            if at <= Utc::now().timestamp() {
                // Lazy expiry on read
                self.db.remove(key.as_bytes())?;
                return Ok(None);
            }
        }
        Ok(Some(entry.value))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.db.remove(key.as_bytes())?;
        Ok(())
    }
}
