//! Persistence for operations and documents
//!
//! A pair of store traits with a SQLite reference implementation and an
//! in-memory store for tests and demos. All calls are explicit-error; the
//! engine treats whatever store it is handed as authoritative across
//! restarts.

mod manifest;
mod memory;
mod sqlite;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::document::DocumentSnapshot;
use crate::ops::{OpId, Operation};
use crate::position::AuthorId;

pub use manifest::{Manifest, CONTEXT_DIR, CURRENT_VERSION, DATABASE_FILE, MANIFEST_FILE};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation not found: {0}")]
    OperationNotFound(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("not a contextdb store: {}", .0.display())]
    UnrecognizedStore(PathBuf),

    #[error("incompatible store version {found}, expected {expected}")]
    IncompatibleStore { found: String, expected: String },

    #[error("internal error: {0}")]
    Internal(String),
}

/// Where a store keeps its data.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Base directory; the store lives under `<base>/.context/`.
    pub base_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
        }
    }
}

#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn put_operation(&self, op: &Operation) -> Result<(), StorageError>;
    async fn operation(&self, id: &str) -> Result<Operation, StorageError>;
    async fn operations(&self, ids: &[OpId]) -> Result<Vec<Operation>, StorageError>;
    async fn operations_since(&self, since: DateTime<Utc>) -> Result<Vec<Operation>, StorageError>;
    async fn operations_by_author(&self, author: &AuthorId)
        -> Result<Vec<Operation>, StorageError>;
    async fn delete_operation(&self, id: &str) -> Result<(), StorageError>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put_document(&self, snapshot: &DocumentSnapshot) -> Result<(), StorageError>;
    async fn document(&self, file_path: &str) -> Result<DocumentSnapshot, StorageError>;
    async fn list_documents(&self) -> Result<Vec<String>, StorageError>;
    async fn delete_document(&self, file_path: &str) -> Result<(), StorageError>;
}

/// The full persistence contract the engine drives.
pub trait Store: OperationStore + DocumentStore {
    fn close(&self) -> Result<(), StorageError>;
}
