//! The operation record
//!
//! Operations are immutable once built: the identifier is a SHA-256 over the
//! derivation tuple (author, content, nanosecond timestamp), so replaying an
//! operation always lands on the same identity.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::position::{AuthorId, Position};

/// Content-hash identifier of an operation (hex SHA-256).
pub type OpId = String;

pub const CONTENT_TYPE_TEXT: &str = "text";
pub const CONTENT_TYPE_JSON: &str = "json";
pub const CONTENT_TYPE_BINARY: &str = "binary";

/// Metadata context key naming the target document.
pub const META_DOCUMENT_ID: &str = "document_id";

/// The three permitted edit kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Delete,
    Move,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Delete => "delete",
            OpKind::Move => "move",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(OpKind::Insert),
            "delete" => Some(OpKind::Delete),
            "move" => Some(OpKind::Move),
            _ => None,
        }
    }
}

/// Free-form metadata travelling with an operation.
///
/// Only recognized context keys (`document_id`, `type`, …) are consumed by
/// the core; everything else passes through untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationMeta {
    #[serde(default)]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
}

impl OperationMeta {
    pub fn for_document(document_id: impl Into<String>) -> Self {
        let mut context = HashMap::new();
        context.insert(META_DOCUMENT_ID.to_string(), document_id.into());
        Self {
            context,
            ..Default::default()
        }
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }

    pub fn document_id(&self) -> Option<&str> {
        self.context.get(META_DOCUMENT_ID).map(String::as_str)
    }
}

/// A single edit, immutable after construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    #[serde(rename = "type")]
    pub kind: OpKind,
    pub position: Position,
    pub content: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    pub author: AuthorId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub parents: Vec<OpId>,
    #[serde(default)]
    pub metadata: OperationMeta,
}

fn default_content_type() -> String {
    CONTENT_TYPE_TEXT.to_string()
}

impl Operation {
    /// Build an operation, deriving its identifier from the author, content
    /// and the current nanosecond timestamp.
    pub fn new(
        kind: OpKind,
        position: Position,
        content: impl Into<String>,
        author: impl Into<AuthorId>,
        parents: Vec<OpId>,
        metadata: OperationMeta,
    ) -> Self {
        let content = content.into();
        let author = author.into();
        let timestamp = Utc::now();
        let id = derive_op_id(&author, &content, timestamp);
        Self {
            id,
            kind,
            position,
            content,
            content_type: default_content_type(),
            length: None,
            author,
            timestamp,
            parents,
            metadata,
        }
    }

    pub fn insert(
        position: Position,
        content: impl Into<String>,
        author: impl Into<AuthorId>,
        metadata: OperationMeta,
    ) -> Self {
        Self::new(OpKind::Insert, position, content, author, Vec::new(), metadata)
    }

    pub fn delete(
        position: Position,
        author: impl Into<AuthorId>,
        metadata: OperationMeta,
    ) -> Self {
        Self::new(OpKind::Delete, position, "", author, Vec::new(), metadata)
    }

    pub fn with_parents(mut self, parents: Vec<OpId>) -> Self {
        self.parents = parents;
        self
    }
}

/// Identifier derivation: SHA-256 over author, content, and the nanosecond
/// timestamp. Pure, so a persisted operation re-derives to the same id.
pub fn derive_op_id(author: &str, content: &str, timestamp: DateTime<Utc>) -> OpId {
    let mut hasher = Sha256::new();
    hasher.update(author.as_bytes());
    hasher.update(content.as_bytes());
    hasher.update(
        timestamp
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_be_bytes(),
    );
    hex::encode(hasher.finalize())
}

/// Author identifiers are hex SHA-256 of a display name, opaque on the wire.
pub fn derive_author_id(name: &str) -> AuthorId {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Position;

    #[test]
    fn test_op_id_depends_on_derivation_tuple() {
        let ts = Utc::now();
        let a = derive_op_id("alice", "hello", ts);
        let b = derive_op_id("alice", "hello", ts);
        assert_eq!(a, b);

        assert_ne!(a, derive_op_id("bob", "hello", ts));
        assert_ne!(a, derive_op_id("alice", "world", ts));
    }

    #[test]
    fn test_kind_round_trips_through_json() {
        let op = Operation::insert(
            Position::single(1, "alice"),
            "hello",
            "alice",
            OperationMeta::for_document("doc.txt"),
        );
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"type\":\"insert\""));

        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_metadata_document_id() {
        let meta = OperationMeta::for_document("src/main.rs");
        assert_eq!(meta.document_id(), Some("src/main.rs"));
        assert_eq!(OperationMeta::default().document_id(), None);
    }
}
