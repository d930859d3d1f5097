//! In-memory store for tests and demos

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::document::DocumentSnapshot;
use crate::ops::{OpId, Operation};
use crate::position::AuthorId;

use super::{DocumentStore, OperationStore, StorageError, Store};

/// HashMap-backed `Store` with the same contract as the SQLite store.
#[derive(Default)]
pub struct MemoryStore {
    operations: RwLock<HashMap<OpId, Operation>>,
    documents: RwLock<HashMap<String, DocumentSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OperationStore for MemoryStore {
    async fn put_operation(&self, op: &Operation) -> Result<(), StorageError> {
        self.operations
            .write()
            .await
            .insert(op.id.clone(), op.clone());
        Ok(())
    }

    async fn operation(&self, id: &str) -> Result<Operation, StorageError> {
        self.operations
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::OperationNotFound(id.to_string()))
    }

    async fn operations(&self, ids: &[OpId]) -> Result<Vec<Operation>, StorageError> {
        let ops = self.operations.read().await;
        Ok(ids.iter().filter_map(|id| ops.get(id).cloned()).collect())
    }

    async fn operations_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Operation>, StorageError> {
        let ops = self.operations.read().await;
        Ok(ops
            .values()
            .filter(|op| op.timestamp > since)
            .cloned()
            .collect())
    }

    async fn operations_by_author(
        &self,
        author: &AuthorId,
    ) -> Result<Vec<Operation>, StorageError> {
        let ops = self.operations.read().await;
        Ok(ops
            .values()
            .filter(|op| &op.author == author)
            .cloned()
            .collect())
    }

    async fn delete_operation(&self, id: &str) -> Result<(), StorageError> {
        self.operations.write().await.remove(id);
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn put_document(&self, snapshot: &DocumentSnapshot) -> Result<(), StorageError> {
        self.documents
            .write()
            .await
            .insert(snapshot.file_path.clone(), snapshot.clone());
        Ok(())
    }

    async fn document(&self, file_path: &str) -> Result<DocumentSnapshot, StorageError> {
        self.documents
            .read()
            .await
            .get(file_path)
            .cloned()
            .ok_or_else(|| StorageError::DocumentNotFound(file_path.to_string()))
    }

    async fn list_documents(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.documents.read().await.keys().cloned().collect())
    }

    async fn delete_document(&self, file_path: &str) -> Result<(), StorageError> {
        self.documents.write().await.remove(file_path);
        Ok(())
    }
}

impl Store for MemoryStore {
    fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
