//! Configuration for context-vault.
//!
//! CLI arguments and environment variable handling using clap. Secrets are
//! passed in explicitly at startup and handed to the components that need
//! them; nothing reads the environment after boot.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Context Vault - versioned encrypted context store
#[derive(Parser, Debug, Clone)]
#[command(name = "context-vault")]
#[command(about = "Versioned encrypted context store over HTTP")]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8087")]
    pub listen: SocketAddr,

    /// Data directory holding blob objects and the metadata database
    #[arg(long, env = "DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Encryption key for context payloads, coerced to exactly 32 bytes
    /// (required in production)
    #[arg(long, env = "ENCRYPTION_KEY")]
    pub encryption_key: Option<String>,

    /// Secret for verifying bearer JWTs (required in production)
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// API keys to seed at startup, comma-separated `token:userId` pairs
    #[arg(long, env = "API_KEYS")]
    pub api_keys: Option<String>,

    /// Enable development mode (falls back to built-in secrets)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Get effective encryption key (uses default in dev mode)
    pub fn encryption_key(&self) -> String {
        if self.dev_mode {
            self.encryption_key
                .clone()
                .unwrap_or_else(|| "dev-only-insecure-encryption-key".to_string())
        } else {
            self.encryption_key
                .clone()
                .expect("ENCRYPTION_KEY is required in production mode")
        }
    }

    /// Get effective JWT secret (uses default in dev mode)
    pub fn jwt_secret(&self) -> String {
        if self.dev_mode {
            self.jwt_secret
                .clone()
                .unwrap_or_else(|| "dev-only-insecure-secret".to_string())
        } else {
            self.jwt_secret
                .clone()
                .expect("JWT_SECRET is required in production mode")
        }
    }

    /// Blob store root under the data directory
    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("objects")
    }

    /// Metadata database path under the data directory
    pub fn metadata_db_path(&self) -> PathBuf {
        self.data_dir.join("metadata.sled")
    }

    /// Parsed `token:userId` API key pairs; malformed entries are skipped
    pub fn api_key_pairs(&self) -> Vec<(String, String)> {
        self.api_keys
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .filter_map(|pair| {
                let (token, user) = pair.trim().split_once(':')?;
                if token.is_empty() || user.is_empty() {
                    return None;
                }
                Some((token.to_string(), user.to_string()))
            })
            .collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode {
            if self.encryption_key.is_none() {
                return Err("ENCRYPTION_KEY is required in production mode".to_string());
            }
            if self.jwt_secret.is_none() {
                return Err("JWT_SECRET is required in production mode".to_string());
            }
        }
        Ok(())
    }
}
