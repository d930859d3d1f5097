//! Store manifest
//!
//! Every store directory carries a `manifest.json` naming the creating
//! system and its version. Opening a directory without the marker, or with
//! an incompatible major version, is refused rather than guessed at.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StorageError;

pub const CONTEXT_DIR: &str = ".context";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const DATABASE_FILE: &str = "contextdb.sqlite";
pub const CURRENT_VERSION: &str = "1.0.0";
pub const SCHEMA_VERSION: &str = "1.0";

const CREATED_BY: &str = "contextdb";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub schema_version: String,
    pub storage_type: String,
    pub database_file: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Manifest {
    pub fn new() -> Self {
        let now = Utc::now();
        let mut metadata = HashMap::new();
        metadata.insert("created_by".to_string(), CREATED_BY.to_string());
        metadata.insert(
            "description".to_string(),
            "contextdb SQLite storage".to_string(),
        );
        Self {
            version: CURRENT_VERSION.to_string(),
            created: now,
            last_modified: now,
            schema_version: SCHEMA_VERSION.to_string(),
            storage_type: "sqlite".to_string(),
            database_file: DATABASE_FILE.to_string(),
            metadata,
        }
    }

    pub fn load(path: &Path) -> Result<Self, StorageError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw)?;
        Ok(())
    }

    /// The directory belongs to us and the version shares our major.
    pub fn validate(&self, context_path: &Path) -> Result<(), StorageError> {
        if self.metadata.get("created_by").map(String::as_str) != Some(CREATED_BY) {
            return Err(StorageError::UnrecognizedStore(context_path.to_path_buf()));
        }
        if major_of(&self.version) != major_of(CURRENT_VERSION) {
            return Err(StorageError::IncompatibleStore {
                found: self.version.clone(),
                expected: CURRENT_VERSION.to_string(),
            });
        }
        Ok(())
    }

    pub fn touch(&mut self) {
        self.last_modified = Utc::now();
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

fn major_of(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}
