//! API-key authentication
//!
//! Keys are random 32-byte values handed out exactly once; only the SHA-256
//! hash is persisted in `.context/auth.json`. Presented keys are hashed and
//! compared in constant time. The core never sees key material; this module
//! is middleware for the transport layer.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::ops::derive_author_id;
use crate::position::AuthorId;
use crate::storage::CONTEXT_DIR;

pub const AUTH_FILE: &str = "auth.json";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid or unknown API key")]
    InvalidKey,

    #[error("API key not found: {0}")]
    KeyNotFound(String),

    #[error("permission denied: {0} required")]
    PermissionDenied(Permission),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Fixed permission vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "read:operations")]
    ReadOperations,
    #[serde(rename = "write:operations")]
    WriteOperations,
    #[serde(rename = "read:documents")]
    ReadDocuments,
    #[serde(rename = "write:documents")]
    WriteDocuments,
    #[serde(rename = "analyze")]
    Analyze,
    #[serde(rename = "search")]
    Search,
    #[serde(rename = "admin")]
    Admin,
    #[serde(rename = "*")]
    All,
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Permission::ReadOperations => "read:operations",
            Permission::WriteOperations => "write:operations",
            Permission::ReadDocuments => "read:documents",
            Permission::WriteDocuments => "write:documents",
            Permission::Analyze => "analyze",
            Permission::Search => "search",
            Permission::Admin => "admin",
            Permission::All => "*",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub name: String,
    pub key_hash: String,
    pub author_id: AuthorId,
    pub permissions: Vec<Permission>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    pub api_keys: Vec<ApiKey>,
    pub default_author: AuthorId,
    pub require_auth: bool,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

/// Who a validated request is acting as.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub author_id: AuthorId,
    pub api_key_id: Option<String>,
    pub permissions: Vec<Permission>,
    pub authenticated: bool,
}

impl AuthContext {
    pub fn has_permission(&self, needed: Permission) -> bool {
        self.permissions
            .iter()
            .any(|p| *p == needed || *p == Permission::All || *p == Permission::Admin)
    }
}

/// Owner of the auth configuration file and the key lifecycle.
pub struct AuthManager {
    config_path: PathBuf,
    config: RwLock<AuthConfig>,
}

impl AuthManager {
    /// Load `<base>/.context/auth.json`, creating a default (auth disabled)
    /// configuration on first use.
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self, AuthError> {
        let config_path = base_dir.as_ref().join(CONTEXT_DIR).join(AUTH_FILE);

        let config = if config_path.exists() {
            let raw = fs::read_to_string(&config_path)?;
            serde_json::from_str(&raw)?
        } else {
            let now = Utc::now();
            let config = AuthConfig {
                api_keys: Vec::new(),
                default_author: derive_author_id("local-dev"),
                require_auth: false,
                created_at: now,
                last_modified: now,
            };
            if let Some(parent) = config_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&config_path, serde_json::to_string_pretty(&config)?)?;
            config
        };

        Ok(Self {
            config_path,
            config: RwLock::new(config),
        })
    }

    pub fn require_auth(&self) -> bool {
        self.read().map(|c| c.require_auth).unwrap_or(true)
    }

    pub fn set_require_auth(&self, required: bool) -> Result<(), AuthError> {
        let snapshot = {
            let mut config = self.write()?;
            config.require_auth = required;
            config.last_modified = Utc::now();
            config.clone()
        };
        self.persist(&snapshot)
    }

    /// Mint a new key. The plaintext key is returned exactly once; only its
    /// hash is stored.
    pub fn create_key(
        &self,
        name: impl Into<String>,
        author_id: AuthorId,
        permissions: Vec<Permission>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(ApiKey, String), AuthError> {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let plaintext = hex::encode(raw);

        let key = ApiKey {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            key_hash: hash_key(&plaintext),
            author_id,
            permissions,
            created_at: Utc::now(),
            last_used: None,
            expires_at,
        };

        let snapshot = {
            let mut config = self.write()?;
            config.api_keys.push(key.clone());
            config.last_modified = Utc::now();
            config.clone()
        };
        self.persist(&snapshot)?;
        Ok((key, plaintext))
    }

    pub fn list_keys(&self) -> Result<Vec<ApiKey>, AuthError> {
        Ok(self.read()?.api_keys.clone())
    }

    pub fn revoke_key(&self, id: &str) -> Result<(), AuthError> {
        let snapshot = {
            let mut config = self.write()?;
            let before = config.api_keys.len();
            config.api_keys.retain(|k| k.id != id);
            if config.api_keys.len() == before {
                return Err(AuthError::KeyNotFound(id.to_string()));
            }
            config.last_modified = Utc::now();
            config.clone()
        };
        self.persist(&snapshot)
    }

    /// Validate a presented key against the stored hashes.
    pub fn validate_key(&self, presented: &str) -> Result<AuthContext, AuthError> {
        let presented_hash = hash_key(presented);
        let now = Utc::now();

        let mut config = self.write()?;
        for key in config.api_keys.iter_mut() {
            if !constant_time_compare(&presented_hash, &key.key_hash) {
                continue;
            }
            if key.expires_at.is_some_and(|exp| exp < now) {
                return Err(AuthError::InvalidKey);
            }
            key.last_used = Some(now);
            return Ok(AuthContext {
                author_id: key.author_id.clone(),
                api_key_id: Some(key.id.clone()),
                permissions: key.permissions.clone(),
                authenticated: true,
            });
        }
        Err(AuthError::InvalidKey)
    }

    /// The context handed to requests when auth is disabled.
    pub fn anonymous_context(&self) -> Result<AuthContext, AuthError> {
        let config = self.read()?;
        Ok(AuthContext {
            author_id: config.default_author.clone(),
            api_key_id: None,
            permissions: vec![Permission::All],
            authenticated: false,
        })
    }

    /// Resolve an `Authorization` header value (`Bearer …` or `ApiKey …`)
    /// into an auth context, honoring the require-auth flag.
    pub fn authorize(&self, header: Option<&str>) -> Result<AuthContext, AuthError> {
        match header.and_then(extract_key) {
            Some(key) => self.validate_key(key),
            None if !self.require_auth() => self.anonymous_context(),
            None => Err(AuthError::InvalidKey),
        }
    }

    fn persist(&self, config: &AuthConfig) -> Result<(), AuthError> {
        fs::write(&self.config_path, serde_json::to_string_pretty(config)?)?;
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, AuthConfig>, AuthError> {
        self.config
            .read()
            .map_err(|e| AuthError::Internal(format!("auth lock poisoned: {e}")))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, AuthConfig>, AuthError> {
        self.config
            .write()
            .map_err(|e| AuthError::Internal(format!("auth lock poisoned: {e}")))
    }
}

fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn extract_key(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("ApiKey "))
        .map(str::trim)
        .filter(|k| !k.is_empty())
}

/// Constant-time comparison so hash checks leak no timing signal.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}
