//! Context repository: the versioned, encrypted storage core.
//!
//! Owns the protocol between three kinds of stored state:
//! - the **current object** per `(userId, contextId)`, mutable, always the
//!   latest save, fetched in O(1) without scanning history;
//! - the **version log**, one immutable record per save, only ever deleted
//!   in bulk with its context;
//! - the **metadata index**, cheap summaries and access counters with TTLs.
//!
//! Writes race last-write-wins: two concurrent saves of the same context
//! both land, and the later current-object write is authoritative. There is
//! no locking and no transaction spanning the blob and metadata stores; a
//! save that fails midway leaves the current object and version log mutually
//! consistent, and the index entry is corrected by the next save.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::blob_store::{Attributes, BlobStore, ListOptions};
use crate::crypto::{self, EncryptionKey};
use crate::error::{ContextError, Result};
use crate::keys;
use crate::metadata::MetadataIndex;

/// Index entries expire after 90 days without a save
const INDEX_TTL: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Access records expire after 30 days without a read
const ACCESS_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Default cap on version listings
pub const DEFAULT_VERSION_LIMIT: usize = 50;

/// A decrypted context record: caller content plus layered metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRecord {
    pub content: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Returned by [`ContextRepository::save`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveReceipt {
    pub context_id: String,
    pub version: i64,
    pub timestamp: String,
}

/// Per-context summary kept in the metadata index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub last_modified: String,
    pub version: i64,
    pub size: u64,
}

/// Per-context access counter kept in the metadata index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRecord {
    pub last_accessed: String,
    pub access_count: u64,
}

/// One element of a [`ContextRepository::list`] result. Contexts whose index
/// entry has expired still appear, with only the id set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSummary {
    pub context_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// One element of a [`ContextRepository::versions`] result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: i64,
    pub size: u64,
    pub uploaded_at: String,
    pub attributes: Attributes,
}

/// Outcome of [`ContextRepository::sync`]: either the caller is behind and
/// gets the full decrypted context (`pull`), or it is at least as current
/// and is expected to push via `save` (`push`). Advisory last-write-wins;
/// no server-side merge.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SyncOutcome {
    Pull {
        context: ContextRecord,
        timestamp: String,
    },
    Push {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
}

/// System-assigned metadata for one save.
struct SystemFields<'a> {
    user_id: &'a str,
    context_id: &'a str,
    session_id: &'a str,
    timestamp: &'a str,
    version: i64,
    checksum: &'a str,
}

/// Layer system fields over caller metadata; system fields win on collision.
/// Non-object caller metadata contributes nothing.
fn merge_metadata(
    caller: Option<&serde_json::Value>,
    system: &SystemFields<'_>,
) -> serde_json::Map<String, serde_json::Value> {
    let mut merged = match caller {
        Some(serde_json::Value::Object(map)) => map.clone(),
        _ => serde_json::Map::new(),
    };
    merged.insert("userId".to_string(), json!(system.user_id));
    merged.insert("contextId".to_string(), json!(system.context_id));
    merged.insert("sessionId".to_string(), json!(system.session_id));
    merged.insert("timestamp".to_string(), json!(system.timestamp));
    merged.insert("version".to_string(), json!(system.version));
    merged.insert("checksum".to_string(), json!(system.checksum));
    merged
}

/// Current time as ISO-8601 UTC with millisecond precision.
fn iso_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 timestamp; anything absent or unparseable compares as
/// the epoch.
fn parse_instant(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// The core orchestrator. Stateless per request: all state lives in the two
/// stores, so instances are freely shared behind an `Arc`.
pub struct ContextRepository {
    blobs: Arc<dyn BlobStore>,
    index: Arc<dyn MetadataIndex>,
    key: EncryptionKey,
}

impl ContextRepository {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        index: Arc<dyn MetadataIndex>,
        encryption_key: &str,
    ) -> Self {
        Self {
            blobs,
            index,
            key: EncryptionKey::derive(encryption_key),
        }
    }

    /// Save a context: encrypt the record and issue the three writes
    /// (current object, version record, index entry) concurrently.
    pub async fn save(
        &self,
        user_id: &str,
        context_id: &str,
        content: &serde_json::Value,
        caller_metadata: Option<&serde_json::Value>,
        session_id: &str,
    ) -> Result<SaveReceipt> {
        check_ids(user_id, context_id)?;
        if !content.is_object() {
            return Err(ContextError::Validation(
                "Invalid context structure".to_string(),
            ));
        }

        let version = Utc::now().timestamp_micros();
        let timestamp = iso_now();
        let checksum = crypto::checksum(serde_json::to_string(content)?.as_bytes());

        let record = ContextRecord {
            content: content.clone(),
            metadata: merge_metadata(
                caller_metadata,
                &SystemFields {
                    user_id,
                    context_id,
                    session_id,
                    timestamp: &timestamp,
                    version,
                    checksum: &checksum,
                },
            ),
        };

        let envelope = crypto::encrypt(&serde_json::to_vec(&record)?, &self.key)?;
        let ciphertext = envelope.as_bytes();
        let size = ciphertext.len() as u64;

        let mut attributes = Attributes::new();
        attributes.insert("userId".to_string(), user_id.to_string());
        attributes.insert("contextId".to_string(), context_id.to_string());
        attributes.insert("sessionId".to_string(), session_id.to_string());
        attributes.insert("timestamp".to_string(), timestamp.clone());

        let entry = IndexEntry {
            last_modified: timestamp.clone(),
            version,
            size,
        };
        let entry_bytes = serde_json::to_vec(&entry)?;

        let current_key = keys::current_key(user_id, context_id);
        let version_key = keys::version_key(user_id, context_id, version);
        let index_key = keys::index_key(user_id, context_id);
        let no_attributes = Attributes::new();

        let current = self.blobs.put(&current_key, ciphertext, &attributes);
        let snapshot = self.blobs.put(&version_key, ciphertext, &no_attributes);
        let summary = self.index.put(&index_key, &entry_bytes, Some(INDEX_TTL));
        tokio::try_join!(current, snapshot, summary)?;

        info!(user_id = %user_id, context_id = %context_id, version, size, "context saved");
        Ok(SaveReceipt {
            context_id: context_id.to_string(),
            version,
            timestamp,
        })
    }

    /// Fetch and decrypt the current context.
    pub async fn get(&self, user_id: &str, context_id: &str) -> Result<ContextRecord> {
        check_ids(user_id, context_id)?;
        let current_key = keys::current_key(user_id, context_id);
        let record = self.fetch_decrypted(&current_key).await?;

        self.record_access(user_id, context_id).await;
        Ok(record)
    }

    /// Delete a context: every blob under its prefix, concurrently, plus its
    /// metadata. Returns how many objects were deleted (0 means nothing
    /// existed; not an error).
    pub async fn delete(&self, user_id: &str, context_id: &str) -> Result<usize> {
        check_ids(user_id, context_id)?;
        let prefix = keys::context_prefix(user_id, context_id);
        let listing = self.blobs.list(&prefix, ListOptions::default()).await?;

        let deletes = listing.objects.iter().map(|obj| self.blobs.delete(&obj.key));
        let results = futures::future::join_all(deletes).await;
        let deleted = results.iter().filter(|r| r.is_ok()).count();
        for err in results.into_iter().filter_map(|r| r.err()) {
            warn!(error = %err, context_id = %context_id, "object delete failed");
        }

        // Best-effort metadata cleanup
        if let Err(e) = self.index.delete(&keys::index_key(user_id, context_id)).await {
            warn!(error = %e, "index entry delete failed");
        }
        if let Err(e) = self.index.delete(&keys::access_key(user_id, context_id)).await {
            warn!(error = %e, "access record delete failed");
        }

        info!(user_id = %user_id, context_id = %context_id, deleted, "context deleted");
        Ok(deleted)
    }

    /// List the user's contexts with their index summaries. Ordering is the
    /// blob store's listing order, not guaranteed sorted.
    pub async fn list(&self, user_id: &str) -> Result<Vec<ContextSummary>> {
        if !keys::is_safe_id(user_id) {
            return Err(ContextError::Validation("Invalid user id".to_string()));
        }
        let prefix = keys::user_prefix(user_id);
        let listing = self
            .blobs
            .list(
                &prefix,
                ListOptions {
                    delimiter: Some("/".to_string()),
                    limit: None,
                },
            )
            .await?;

        let mut contexts = Vec::new();
        for group in &listing.common_prefixes {
            let context_id = match keys::context_id_from_prefix(group) {
                Some(id) => id.to_string(),
                None => continue,
            };
            let summary = match self.read_index_entry(user_id, &context_id).await {
                Some(entry) => ContextSummary {
                    context_id,
                    last_modified: Some(entry.last_modified),
                    version: Some(entry.version),
                    size: Some(entry.size),
                },
                None => ContextSummary {
                    context_id,
                    last_modified: None,
                    version: None,
                    size: None,
                },
            };
            contexts.push(summary);
        }
        Ok(contexts)
    }

    /// Compare the current object's save timestamp against the client's last
    /// sync point. Reads attributes only, unless the client turns out to be
    /// behind and the body is needed.
    pub async fn sync(
        &self,
        user_id: &str,
        context_id: &str,
        last_sync: Option<&str>,
    ) -> Result<SyncOutcome> {
        check_ids(user_id, context_id)?;
        let current_key = keys::current_key(user_id, context_id);
        let info = self
            .blobs
            .head(&current_key)
            .await?
            .ok_or_else(|| ContextError::NotFound("Context not found".to_string()))?;

        let server_timestamp = info.attributes.get("timestamp").cloned();
        let client_instant = last_sync
            .map(parse_instant)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        // An absent server timestamp compares as epoch, so only a present
        // one can be ahead of the client.
        match server_timestamp {
            Some(timestamp) if parse_instant(&timestamp) > client_instant => {
                let context = self.fetch_decrypted(&current_key).await?;
                Ok(SyncOutcome::Pull { context, timestamp })
            }
            timestamp => Ok(SyncOutcome::Push { timestamp }),
        }
    }

    /// List the version log, ascending by version, capped at `limit`.
    pub async fn versions(
        &self,
        user_id: &str,
        context_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<VersionInfo>> {
        check_ids(user_id, context_id)?;
        let prefix = keys::versions_prefix(user_id, context_id);
        let listing = self
            .blobs
            .list(
                &prefix,
                ListOptions {
                    delimiter: None,
                    limit: Some(limit.unwrap_or(DEFAULT_VERSION_LIMIT)),
                },
            )
            .await?;

        Ok(listing
            .objects
            .into_iter()
            .filter_map(|obj| {
                let version = keys::version_from_key(&obj.key)?;
                Some(VersionInfo {
                    version,
                    size: obj.size,
                    uploaded_at: obj
                        .uploaded_at
                        .to_rfc3339_opts(SecondsFormat::Millis, true),
                    attributes: obj.attributes,
                })
            })
            .collect())
    }

    /// Point the current object at an old version by copying its ciphertext
    /// verbatim. History is never extended by a restore; only the live
    /// object changes, and the next save records it as a fresh version.
    pub async fn restore(&self, user_id: &str, context_id: &str, version: i64) -> Result<i64> {
        check_ids(user_id, context_id)?;
        let version_key = keys::version_key(user_id, context_id, version);
        let object = self
            .blobs
            .get(&version_key)
            .await?
            .ok_or_else(|| ContextError::NotFound("Version not found".to_string()))?;

        let mut attributes = object.info.attributes;
        attributes.insert("restoredFrom".to_string(), version.to_string());
        attributes.insert("restoredAt".to_string(), iso_now());

        let current_key = keys::current_key(user_id, context_id);
        self.blobs.put(&current_key, &object.bytes, &attributes).await?;

        info!(user_id = %user_id, context_id = %context_id, version, "context restored");
        Ok(version)
    }

    async fn fetch_decrypted(&self, key: &str) -> Result<ContextRecord> {
        let object = self
            .blobs
            .get(key)
            .await?
            .ok_or_else(|| ContextError::NotFound("Context not found".to_string()))?;
        let envelope = String::from_utf8(object.bytes)
            .map_err(|_| ContextError::Crypto("stored envelope is not valid UTF-8".to_string()))?;
        let plaintext = crypto::decrypt(&envelope, &self.key)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Best-effort access accounting; never fails the read it rides on.
    async fn record_access(&self, user_id: &str, context_id: &str) {
        let key = keys::access_key(user_id, context_id);
        let count = match self.index.get(&key).await {
            Ok(Some(bytes)) => serde_json::from_slice::<AccessRecord>(&bytes)
                .map(|r| r.access_count)
                .unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                warn!(error = %e, "access record read failed");
                0
            }
        };
        let record = AccessRecord {
            last_accessed: iso_now(),
            access_count: count + 1,
        };
        let result = match serde_json::to_vec(&record) {
            Ok(bytes) => self.index.put(&key, &bytes, Some(ACCESS_TTL)).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(error = %e, "access record update failed");
        }
    }

    /// Index reads are enrichment only; failures and unreadable entries read
    /// as absent.
    async fn read_index_entry(&self, user_id: &str, context_id: &str) -> Option<IndexEntry> {
        let key = keys::index_key(user_id, context_id);
        match self.index.get(&key).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "index entry read failed");
                None
            }
        }
    }
}

fn check_ids(user_id: &str, context_id: &str) -> Result<()> {
    if !keys::is_safe_id(user_id) {
        return Err(ContextError::Validation("Invalid user id".to_string()));
    }
    if !keys::is_safe_id(context_id) {
        return Err(ContextError::Validation("Invalid context id".to_string()));
    }
    Ok(())
}
