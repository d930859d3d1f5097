//! The per-document positional index

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::ops::{OpId, OpKind, Operation};
use crate::position::{Position, PositionKey};

use super::construct::{infer_kind, Construct, ConstructKind, ConstructMeta};

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("position is not valid")]
    InvalidPosition,

    #[error("position already occupied by a construct")]
    PositionOccupied,

    #[error("no construct at the given position")]
    ConstructNotFound,

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Default)]
struct DocumentInner {
    constructs: HashMap<PositionKey, Construct>,
    // Strictly sorted by position order; parallel to the construct map.
    position_index: Vec<Position>,
    content_hash: [u8; 32],
    version: u64,
    last_operation: Option<OpId>,
}

/// A document: constructs keyed by position, rendered in position order.
///
/// Each document carries its own reader-writer lock; applies take the write
/// lock, renders and lookups the read lock.
pub struct Document {
    file_path: String,
    inner: RwLock<DocumentInner>,
}

/// Owned, serializable copy of a document's state, used by storage and the
/// API surface. Constructs are listed in position order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub file_path: String,
    pub constructs: Vec<Construct>,
    pub content_hash: String,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<OpId>,
}

impl Document {
    pub fn new(file_path: impl Into<String>) -> Self {
        let mut inner = DocumentInner::default();
        inner.content_hash = Sha256::digest(b"").into();
        Self {
            file_path: file_path.into(),
            inner: RwLock::new(inner),
        }
    }

    /// Rebuild a document from its persisted snapshot. The version counter
    /// and last-operation id are restored as recorded; the content hash is
    /// recomputed from the constructs so hash/render agreement holds even if
    /// the stored hex was damaged.
    pub fn from_snapshot(snapshot: DocumentSnapshot) -> Result<Self, DocumentError> {
        let doc = Self::new(snapshot.file_path);
        {
            let mut inner = doc.write()?;
            for construct in snapshot.constructs {
                if !construct.position.is_valid() {
                    return Err(DocumentError::InvalidPosition);
                }
                let key = construct.position.key();
                if inner.constructs.contains_key(&key) {
                    return Err(DocumentError::PositionOccupied);
                }
                Self::index_position(&mut inner.position_index, construct.position.clone());
                inner.constructs.insert(key, construct);
            }
            inner.version = snapshot.version;
            inner.last_operation = snapshot.last_operation;
            Self::rehash(&mut inner);
        }
        Ok(doc)
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub fn version(&self) -> Result<u64, DocumentError> {
        Ok(self.read()?.version)
    }

    pub fn content_hash(&self) -> Result<[u8; 32], DocumentError> {
        Ok(self.read()?.content_hash)
    }

    pub fn content_hash_hex(&self) -> Result<String, DocumentError> {
        Ok(hex::encode(self.read()?.content_hash))
    }

    pub fn last_operation(&self) -> Result<Option<OpId>, DocumentError> {
        Ok(self.read()?.last_operation.clone())
    }

    pub fn insert_construct(&self, construct: Construct) -> Result<(), DocumentError> {
        let mut inner = self.write()?;
        Self::insert_locked(&mut inner, construct)?;
        Ok(())
    }

    /// Remove and return the construct at `pos`.
    pub fn delete_construct(&self, pos: &Position) -> Result<Construct, DocumentError> {
        let mut inner = self.write()?;
        Self::delete_locked(&mut inner, pos)
    }

    pub fn construct_at(&self, pos: &Position) -> Result<Construct, DocumentError> {
        let inner = self.read()?;
        inner
            .constructs
            .get(&pos.key())
            .cloned()
            .ok_or(DocumentError::ConstructNotFound)
    }

    /// Constructs at positions `p` with `start <= p <= end`, in order.
    pub fn constructs_in_range(
        &self,
        start: &Position,
        end: &Position,
    ) -> Result<Vec<Construct>, DocumentError> {
        let inner = self.read()?;
        Ok(inner
            .position_index
            .iter()
            .filter(|p| **p >= *start && **p <= *end)
            .filter_map(|p| inner.constructs.get(&p.key()).cloned())
            .collect())
    }

    pub fn constructs_by_kind(&self, kind: ConstructKind) -> Result<Vec<Construct>, DocumentError> {
        let inner = self.read()?;
        Ok(inner
            .constructs
            .values()
            .filter(|c| c.kind == kind)
            .cloned()
            .collect())
    }

    /// Concatenate construct content in position order.
    pub fn render(&self) -> Result<String, DocumentError> {
        let inner = self.read()?;
        Ok(Self::render_locked(&inner))
    }

    pub fn snapshot(&self) -> Result<DocumentSnapshot, DocumentError> {
        let inner = self.read()?;
        let constructs = inner
            .position_index
            .iter()
            .filter_map(|p| inner.constructs.get(&p.key()).cloned())
            .collect();
        Ok(DocumentSnapshot {
            file_path: self.file_path.clone(),
            constructs,
            content_hash: hex::encode(inner.content_hash),
            version: inner.version,
            last_operation: inner.last_operation.clone(),
        })
    }

    /// Apply an operation to the index.
    ///
    /// Inserts (and moves, which land as inserts at the operation's
    /// position) fail on an occupied position. Deletes at an empty position
    /// are a no-op and do not advance the version.
    pub fn apply(&self, op: &Operation) -> Result<(), DocumentError> {
        let mut inner = self.write()?;
        match op.kind {
            OpKind::Insert | OpKind::Move => Self::apply_insert(&mut inner, op),
            OpKind::Delete => Self::apply_delete(&mut inner, op),
        }
    }

    fn apply_insert(inner: &mut DocumentInner, op: &Operation) -> Result<(), DocumentError> {
        let kind = infer_kind(&op.content, &op.metadata);
        let construct = Construct {
            id: op.id.clone(),
            content: op.content.clone(),
            kind,
            position: op.position.clone(),
            created_by: op.id.clone(),
            modified_by: op.id.clone(),
            metadata: construct_meta_from(op),
        };
        Self::insert_locked(inner, construct)?;
        inner.last_operation = Some(op.id.clone());
        Ok(())
    }

    fn apply_delete(inner: &mut DocumentInner, op: &Operation) -> Result<(), DocumentError> {
        if !inner.constructs.contains_key(&op.position.key()) {
            // Deleting what is not there is success; version stays put.
            return Ok(());
        }
        Self::delete_locked(inner, &op.position)?;
        inner.last_operation = Some(op.id.clone());
        Ok(())
    }

    fn insert_locked(inner: &mut DocumentInner, construct: Construct) -> Result<(), DocumentError> {
        if !construct.position.is_valid() {
            return Err(DocumentError::InvalidPosition);
        }
        let key = construct.position.key();
        if inner.constructs.contains_key(&key) {
            return Err(DocumentError::PositionOccupied);
        }

        Self::index_position(&mut inner.position_index, construct.position.clone());
        inner.constructs.insert(key, construct);
        inner.version += 1;
        Self::rehash(inner);
        Ok(())
    }

    fn delete_locked(
        inner: &mut DocumentInner,
        pos: &Position,
    ) -> Result<Construct, DocumentError> {
        let construct = inner
            .constructs
            .remove(&pos.key())
            .ok_or(DocumentError::ConstructNotFound)?;
        if let Ok(idx) = inner.position_index.binary_search(pos) {
            inner.position_index.remove(idx);
        }
        inner.version += 1;
        Self::rehash(inner);
        Ok(construct)
    }

    fn index_position(index: &mut Vec<Position>, pos: Position) {
        if let Err(idx) = index.binary_search(&pos) {
            index.insert(idx, pos);
        }
    }

    fn render_locked(inner: &DocumentInner) -> String {
        let mut out = String::new();
        for pos in &inner.position_index {
            if let Some(construct) = inner.constructs.get(&pos.key()) {
                out.push_str(&construct.content);
            }
        }
        out
    }

    fn rehash(inner: &mut DocumentInner) {
        inner.content_hash = Sha256::digest(Self::render_locked(inner).as_bytes()).into();
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, DocumentInner>, DocumentError> {
        self.inner
            .read()
            .map_err(|e| DocumentError::Internal(format!("document lock poisoned: {e}")))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, DocumentInner>, DocumentError> {
        self.inner
            .write()
            .map_err(|e| DocumentError::Internal(format!("document lock poisoned: {e}")))
    }
}

fn construct_meta_from(op: &Operation) -> ConstructMeta {
    ConstructMeta {
        semantic: op.metadata.intent.clone(),
        tags: Vec::new(),
        references: Vec::new(),
        confidence: 1.0,
        attributes: op.metadata.context.clone(),
    }
}
