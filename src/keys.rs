//! Physical key layout for stored contexts.
//!
//! The repository exclusively owns the mapping from `(userId, contextId,
//! version)` to blob keys and metadata keys; no other layer interprets this
//! layout. Existing deployments depend on the exact blob paths:
//!
//! ```text
//! contexts/{userId}/{contextId}/current.json
//! contexts/{userId}/{contextId}/versions/{version}.json
//! ```

/// Maximum accepted length for user and context ids
const MAX_ID_LEN: usize = 128;

/// Blob prefix covering every context owned by a user
pub fn user_prefix(user_id: &str) -> String {
    format!("contexts/{}/", user_id)
}

/// Blob prefix covering one context (current object + version log)
pub fn context_prefix(user_id: &str, context_id: &str) -> String {
    format!("contexts/{}/{}/", user_id, context_id)
}

/// Key of the live (current) object
pub fn current_key(user_id: &str, context_id: &str) -> String {
    format!("contexts/{}/{}/current.json", user_id, context_id)
}

/// Blob prefix of the immutable version log
pub fn versions_prefix(user_id: &str, context_id: &str) -> String {
    format!("contexts/{}/{}/versions/", user_id, context_id)
}

/// Key of a single version record
pub fn version_key(user_id: &str, context_id: &str, version: i64) -> String {
    format!("contexts/{}/{}/versions/{}.json", user_id, context_id, version)
}

/// Parse the version number back out of a version-record key.
/// Returns `None` for keys that are not version records.
pub fn version_from_key(key: &str) -> Option<i64> {
    let name = key.rsplit('/').next()?;
    name.strip_suffix(".json")?.parse().ok()
}

/// Extract the contextId from a delimiter-grouped listing prefix
/// (`contexts/{user}/{context}/` -> `{context}`).
pub fn context_id_from_prefix(prefix: &str) -> Option<&str> {
    let id = prefix.trim_end_matches('/').rsplit('/').next()?;
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

/// Metadata key of a context's index entry
pub fn index_key(user_id: &str, context_id: &str) -> String {
    format!("context:{}:{}", user_id, context_id)
}

/// Metadata key of a context's access record
pub fn access_key(user_id: &str, context_id: &str) -> String {
    format!("access:{}:{}", user_id, context_id)
}

/// Metadata key an opaque API key is looked up under
pub fn api_key_lookup(token: &str) -> String {
    format!("apikey:{}", token)
}

/// Check an id before it becomes part of a storage key.
///
/// Ids are opaque strings, but they end up as path segments in the blob
/// store, so separators and dot components are rejected.
pub fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && !id.contains(['/', '\\', '\0'])
        && id != "."
        && id != ".."
}
