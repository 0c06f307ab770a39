//! Prefix-addressable object storage.
//!
//! [`BlobStore`] is the seam the repository writes through: opaque objects
//! under string keys, caller-supplied attributes retrievable without the
//! body, and prefix listing with optional directory-style grouping.
//!
//! [`FsBlobStore`] keeps objects as plain files under a root directory, with
//! a JSON sidecar (`<key>.meta`) holding attributes and the upload time:
//!
//! ```text
//! <root>/contexts/u1/c1/current.json
//! <root>/contexts/u1/c1/current.json.meta
//! <root>/contexts/u1/c1/versions/1734000000000123.json
//! ```

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::error::Result;

/// Suffix of the attribute sidecar files; never listed as objects
const META_SUFFIX: &str = ".meta";

/// String attributes attached to a stored object
pub type Attributes = HashMap<String, String>;

/// Object metadata, available without reading the body
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
    pub attributes: Attributes,
}

/// A stored object: metadata plus body bytes
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub info: ObjectInfo,
    pub bytes: Vec<u8>,
}

/// Listing controls. `limit` caps returned objects; grouped prefixes are
/// always complete.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub delimiter: Option<String>,
    pub limit: Option<usize>,
}

/// Listing result: objects in lexicographic key order, plus the distinct
/// grouped prefixes when a delimiter was given.
#[derive(Debug, Default)]
pub struct Listing {
    pub objects: Vec<ObjectInfo>,
    pub common_prefixes: Vec<String>,
}

/// Abstract prefix-addressable object store.
///
/// `get`/`head` return `None` for missing keys rather than erroring;
/// transient backend failures surface as storage errors and are not retried
/// here.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store or overwrite an object together with its attributes.
    async fn put(&self, key: &str, bytes: &[u8], attributes: &Attributes) -> Result<()>;

    /// Fetch body and metadata, or `None` when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<StoredObject>>;

    /// Fetch metadata only, or `None` when the key is absent.
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>>;

    /// Remove an object. Idempotent; deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List keys under `prefix`, optionally grouped at the first `delimiter`
    /// past the prefix.
    async fn list(&self, prefix: &str, options: ListOptions) -> Result<Listing>;
}

/// Sidecar contents stored next to each object body
#[derive(Debug, Serialize, Deserialize)]
struct SidecarMeta {
    uploaded_at: DateTime<Utc>,
    #[serde(default)]
    attributes: Attributes,
}

/// Filesystem-backed blob store
pub struct FsBlobStore {
    root_dir: PathBuf,
}

impl FsBlobStore {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    /// Create the root directory if needed.
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root_dir).await?;
        Ok(())
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key)
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut os = path.as_os_str().to_owned();
        os.push(META_SUFFIX);
        PathBuf::from(os)
    }

    async fn read_sidecar(path: &Path) -> Option<SidecarMeta> {
        let bytes = fs::read(Self::sidecar_path(path)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Build [`ObjectInfo`] for an existing body file. Returns `None` when
    /// the file disappeared underneath us. A missing or unreadable sidecar
    /// degrades to empty attributes and the file's mtime.
    async fn object_info(&self, key: &str, path: &Path) -> Result<Option<ObjectInfo>> {
        let meta = match fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let (uploaded_at, attributes) = match Self::read_sidecar(path).await {
            Some(sidecar) => (sidecar.uploaded_at, sidecar.attributes),
            None => {
                let mtime = meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                (mtime, Attributes::new())
            }
        };
        Ok(Some(ObjectInfo {
            key: key.to_string(),
            size: meta.len(),
            uploaded_at,
            attributes,
        }))
    }

    /// Remove now-empty parent directories up to the root. Failures
    /// (directory not empty, concurrent writer recreating it) end the walk.
    async fn prune_empty_dirs(&self, path: &Path) {
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.root_dir || !d.starts_with(&self.root_dir) {
                break;
            }
            if fs::remove_dir(d).await.is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8], attributes: &Attributes) -> Result<()> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, bytes).await?;

        let sidecar = SidecarMeta {
            uploaded_at: Utc::now(),
            attributes: attributes.clone(),
        };
        fs::write(Self::sidecar_path(&path), serde_json::to_vec(&sidecar)?).await?;

        debug!(key = %key, size = bytes.len(), "object stored");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoredObject>> {
        let path = self.object_path(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match self.object_info(key, &path).await? {
            Some(info) => Ok(Some(StoredObject { info, bytes })),
            None => Ok(None),
        }
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>> {
        let path = self.object_path(key);
        self.object_info(key, &path).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let _ = fs::remove_file(Self::sidecar_path(&path)).await;
        self.prune_empty_dirs(&path).await;
        debug!(key = %key, "object deleted");
        Ok(())
    }

    async fn list(&self, prefix: &str, options: ListOptions) -> Result<Listing> {
        // Walk from the deepest directory the prefix implies, then filter by
        // full string prefix so partial-segment prefixes still work.
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx + 1],
            None => "",
        };
        let mut stack = vec![self.root_dir.join(dir_part)];
        let mut keys = Vec::new();

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                    continue;
                }
                let rel = match path.strip_prefix(&self.root_dir) {
                    Ok(rel) => rel,
                    Err(_) => continue,
                };
                let key = rel.to_string_lossy().into_owned();
                if key.starts_with(prefix) && !key.ends_with(META_SUFFIX) {
                    keys.push((key, path));
                }
            }
        }
        keys.sort_by(|a, b| a.0.cmp(&b.0));

        let limit = options.limit.unwrap_or(usize::MAX);
        let mut objects = Vec::new();
        let mut common_prefixes: Vec<String> = Vec::new();

        for (key, path) in keys {
            if let Some(delimiter) = &options.delimiter {
                let rest = &key[prefix.len()..];
                if let Some(pos) = rest.find(delimiter.as_str()) {
                    let group = format!("{}{}", prefix, &rest[..pos + delimiter.len()]);
                    // Keys are sorted, so duplicates arrive adjacent
                    if common_prefixes.last() != Some(&group) {
                        common_prefixes.push(group);
                    }
                    continue;
                }
            }
            if objects.len() >= limit {
                if options.delimiter.is_none() {
                    break;
                }
                continue;
            }
            if let Some(info) = self.object_info(&key, &path).await? {
                objects.push(info);
            }
        }

        Ok(Listing {
            objects,
            common_prefixes,
        })
    }
}
