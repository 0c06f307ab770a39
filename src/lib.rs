//! context-vault - versioned, encrypted context storage over HTTP
//!
//! Stores JSON "contexts" per user: every save snapshots an immutable
//! version record and overwrites a mutable current pointer, so reads are
//! one fetch while history accretes on the side. Content is sealed with
//! AES-256-GCM before it touches disk; the data path never sees plaintext.
//!
//! ## Storage Layout
//!
//! ```text
//! <data_dir>/
//! ├── objects/                              # encrypted object store
//! │   └── contexts/{user}/{context}/
//! │       ├── current.json                  # live pointer (ciphertext)
//! │       └── versions/{version}.json       # immutable snapshots
//! └── metadata.sled/                        # TTL'd lookup index
//!     ├── context:{user}:{context}          # listing summaries (90d)
//!     ├── access:{user}:{context}           # access tracking (30d)
//!     └── apikey:{token}                    # API key -> user
//! ```
//!
//! Consistency is last-write-wins: the three writes of a save are issued
//! concurrently and there are no cross-store transactions. Version ids are
//! microsecond timestamps, so ordering holds as long as writers do not race
//! within the same microsecond.

pub mod auth;
pub mod blob_store;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod http;
pub mod keys;
pub mod metadata;
pub mod repository;

// Re-exports
pub use blob_store::{BlobStore, FsBlobStore};
pub use client::{ClientConfig, ContextClient};
pub use config::Config;
pub use error::{ContextError, Result};
pub use http::HttpServer;
pub use metadata::{MetadataIndex, SledIndex};
pub use repository::{ContextRepository, SyncOutcome};
