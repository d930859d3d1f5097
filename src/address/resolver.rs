//! The address resolver
//!
//! Keeps addresses pointing at the right content as operations land. All
//! cross-references are by identifier or position key, never by owning
//! pointer; callers get by-value snapshots they can read without holding
//! the resolver's lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::{Construct, ConstructId, DocumentSnapshot};
use crate::ops::{OpId, OpKind, Operation};
use crate::position::PositionKey;

use super::stable::{AddressKey, PositionRange, RepositoryId, StableAddress};

#[derive(Error, Debug)]
pub enum AddressError {
    #[error("operation not found: {0}")]
    OperationNotFound(OpId),

    #[error("address not found: {0}")]
    AddressNotFound(AddressKey),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Why an address moved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementReason {
    Refactor,
    Move,
    Edit,
    Delete,
}

/// One transition in an address's life. `to_range = None` records that the
/// span ceased to exist.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MovementRecord {
    pub timestamp: DateTime<Utc>,
    pub from_range: Option<PositionRange>,
    pub to_range: Option<PositionRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<OpId>,
    pub reason: MovementReason,
}

/// Snapshot of an address handed to callers: deep enough (movement log,
/// construct list, creation operation) to read without the resolver's lock.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolvedAddress {
    pub address: StableAddress,
    pub current_range: Option<PositionRange>,
    pub constructs: Vec<Construct>,
    pub creation_op: Operation,
    pub last_modified: DateTime<Utc>,
    pub is_valid: bool,
    pub movement_history: Vec<MovementRecord>,
}

struct AddressEntry {
    address: StableAddress,
    current_range: Option<PositionRange>,
    constructs: Vec<Construct>,
    creation_op: Arc<Operation>,
    last_modified: DateTime<Utc>,
    is_valid: bool,
    history: Vec<MovementRecord>,
}

impl AddressEntry {
    fn snapshot(&self) -> ResolvedAddress {
        ResolvedAddress {
            address: self.address.clone(),
            current_range: self.current_range.clone(),
            constructs: self.constructs.clone(),
            creation_op: (*self.creation_op).clone(),
            last_modified: self.last_modified,
            is_valid: self.is_valid,
            movement_history: self.history.clone(),
        }
    }
}

#[derive(Default)]
struct ResolverInner {
    operations: HashMap<OpId, Arc<Operation>>,
    constructs: HashMap<PositionKey, Construct>,
    addresses: HashMap<AddressKey, AddressEntry>,
    // Old address key -> new address key. Reserved for splits/merges; read
    // on resolve, never written by current paths.
    forwarding: HashMap<AddressKey, AddressKey>,
    // Document path -> position key -> construct id, for ownership checks.
    documents: HashMap<String, HashMap<PositionKey, ConstructId>>,
}

/// Resolver over all four indices, guarded by a single reader-writer lock.
#[derive(Default)]
pub struct AddressResolver {
    inner: RwLock<ResolverInner>,
}

impl AddressResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and index an address anchored at `creation_op_id` covering
    /// `range`. The creation operation must already be indexed.
    pub fn create_address(
        &self,
        repository: RepositoryId,
        creation_op_id: OpId,
        range: PositionRange,
    ) -> Result<StableAddress, AddressError> {
        let mut inner = self.write()?;

        let creation_op = inner
            .operations
            .get(&creation_op_id)
            .cloned()
            .ok_or_else(|| AddressError::OperationNotFound(creation_op_id.clone()))?;

        let address = StableAddress::new(repository, creation_op_id, range.clone());
        let constructs = constructs_in_range(&inner.constructs, &range);

        let entry = AddressEntry {
            address: address.clone(),
            current_range: Some(range),
            constructs,
            creation_op,
            last_modified: Utc::now(),
            is_valid: true,
            history: Vec::new(),
        };

        inner.addresses.insert(address.key(), entry);
        Ok(address)
    }

    /// Resolve an address to its current state, following forwarding.
    pub fn resolve(&self, address: &StableAddress) -> Result<ResolvedAddress, AddressError> {
        self.resolve_by_key(&address.key())
    }

    /// Resolve by the derived address key, following forwarding.
    pub fn resolve_by_key(&self, key: &str) -> Result<ResolvedAddress, AddressError> {
        let inner = self.read()?;
        let mut key = key.to_string();
        if let Some(forwarded) = inner.forwarding.get(&key) {
            key = forwarded.clone();
        }
        inner
            .addresses
            .get(&key)
            .map(AddressEntry::snapshot)
            .ok_or(AddressError::AddressNotFound(key))
    }

    /// Move an address to `new_range`, recording the transition.
    pub fn update_location(
        &self,
        address: &StableAddress,
        new_range: PositionRange,
        caused_by: OpId,
        reason: MovementReason,
    ) -> Result<(), AddressError> {
        let mut inner = self.write()?;
        let key = address.key();
        let constructs = constructs_in_range(&inner.constructs, &new_range);
        let entry = inner
            .addresses
            .get_mut(&key)
            .ok_or(AddressError::AddressNotFound(key))?;

        entry.history.push(MovementRecord {
            timestamp: Utc::now(),
            from_range: entry.current_range.clone(),
            to_range: Some(new_range.clone()),
            caused_by: Some(caused_by),
            reason,
        });
        entry.is_valid = !new_range.is_empty() && !constructs.is_empty();
        entry.current_range = Some(new_range);
        entry.constructs = constructs;
        entry.last_modified = Utc::now();
        Ok(())
    }

    /// Mark an address invalid, recording why.
    pub fn invalidate(
        &self,
        address: &StableAddress,
        reason: MovementReason,
    ) -> Result<(), AddressError> {
        let mut inner = self.write()?;
        let key = address.key();
        let entry = inner
            .addresses
            .get_mut(&key)
            .ok_or(AddressError::AddressNotFound(key))?;

        entry.history.push(MovementRecord {
            timestamp: Utc::now(),
            from_range: entry.current_range.clone(),
            to_range: None,
            caused_by: None,
            reason,
        });
        entry.is_valid = false;
        entry.last_modified = Utc::now();
        Ok(())
    }

    /// A copy of the movement log.
    pub fn history(&self, address: &StableAddress) -> Result<Vec<MovementRecord>, AddressError> {
        self.history_by_key(&address.key())
    }

    pub fn history_by_key(&self, key: &str) -> Result<Vec<MovementRecord>, AddressError> {
        let inner = self.read()?;
        inner
            .addresses
            .get(key)
            .map(|entry| entry.history.clone())
            .ok_or_else(|| AddressError::AddressNotFound(key.to_string()))
    }

    /// Ingest an operation into the shared operation index.
    pub fn index_operation(&self, op: Arc<Operation>) -> Result<(), AddressError> {
        let mut inner = self.write()?;
        inner.operations.insert(op.id.clone(), op);
        Ok(())
    }

    /// Ingest a document's constructs into the construct index.
    pub fn index_document(&self, snapshot: &DocumentSnapshot) -> Result<(), AddressError> {
        let mut inner = self.write()?;
        let mut owned = HashMap::new();
        for construct in &snapshot.constructs {
            let key = construct.position.key();
            owned.insert(key.clone(), construct.id.clone());
            inner.constructs.insert(key, construct.clone());
        }
        inner.documents.insert(snapshot.file_path.clone(), owned);
        Ok(())
    }

    /// Drop a document's constructs from the index. Must run before the
    /// document's own storage is freed.
    pub fn purge_document(&self, file_path: &str) -> Result<(), AddressError> {
        let mut inner = self.write()?;
        if let Some(owned) = inner.documents.remove(file_path) {
            for key in owned.keys() {
                inner.constructs.remove(key);
            }
        }
        Ok(())
    }

    /// Apply an operation's effect to every address whose current range
    /// contains its position. Each affected address gets exactly one
    /// movement record for this operation.
    pub fn process_operation(&self, op: &Arc<Operation>) -> Result<(), AddressError> {
        let mut inner = self.write()?;
        inner.operations.insert(op.id.clone(), Arc::clone(op));

        let affected: Vec<AddressKey> = inner
            .addresses
            .iter()
            .filter(|(_, entry)| {
                entry
                    .current_range
                    .as_ref()
                    .map_or(false, |r| r.contains(&op.position))
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in affected {
            let (new_range, reason, still_valid) = {
                let entry = &inner.addresses[&key];
                match op.kind {
                    OpKind::Delete => (None, MovementReason::Delete, false),
                    OpKind::Insert => (
                        entry.current_range.clone(),
                        MovementReason::Edit,
                        entry.is_valid,
                    ),
                    OpKind::Move => (
                        entry.current_range.clone(),
                        MovementReason::Move,
                        entry.is_valid,
                    ),
                }
            };
            let constructs = match &new_range {
                Some(range) => constructs_in_range(&inner.constructs, range),
                None => Vec::new(),
            };
            if let Some(entry) = inner.addresses.get_mut(&key) {
                entry.history.push(MovementRecord {
                    timestamp: Utc::now(),
                    from_range: entry.current_range.clone(),
                    to_range: new_range.clone(),
                    caused_by: Some(op.id.clone()),
                    reason,
                });
                entry.current_range = new_range;
                entry.constructs = constructs;
                entry.is_valid = still_valid;
                entry.last_modified = Utc::now();
            }
        }
        Ok(())
    }

    /// Addresses whose constructs currently belong to the given document.
    pub fn addresses_for_document(
        &self,
        file_path: &str,
    ) -> Result<Vec<StableAddress>, AddressError> {
        let inner = self.read()?;
        let Some(owned) = inner.documents.get(file_path) else {
            return Ok(Vec::new());
        };

        let mut addresses = Vec::new();
        for entry in inner.addresses.values() {
            let belongs = entry.constructs.iter().any(|construct| {
                owned
                    .get(&construct.position.key())
                    .map_or(false, |id| *id == construct.id)
            });
            if belongs {
                addresses.push(entry.address.clone());
            }
        }
        Ok(addresses)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, ResolverInner>, AddressError> {
        self.inner
            .read()
            .map_err(|e| AddressError::Internal(format!("resolver lock poisoned: {e}")))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, ResolverInner>, AddressError> {
        self.inner
            .write()
            .map_err(|e| AddressError::Internal(format!("resolver lock poisoned: {e}")))
    }
}

fn constructs_in_range(
    index: &HashMap<PositionKey, Construct>,
    range: &PositionRange,
) -> Vec<Construct> {
    let mut found: Vec<Construct> = index
        .values()
        .filter(|c| range.contains(&c.position))
        .cloned()
        .collect();
    found.sort_by(|a, b| a.position.cmp(&b.position));
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::ops::{OpKind, Operation, OperationMeta};
    use crate::position::Position;

    fn insert_op(value: u64, content: &str) -> Arc<Operation> {
        Arc::new(Operation::new(
            OpKind::Insert,
            Position::single(value, "alice"),
            content,
            "alice",
            vec![],
            OperationMeta::default(),
        ))
    }

    fn delete_op(value: u64) -> Arc<Operation> {
        Arc::new(Operation::new(
            OpKind::Delete,
            Position::single(value, "alice"),
            "",
            "alice",
            vec![],
            OperationMeta::default(),
        ))
    }

    fn indexed_doc(resolver: &AddressResolver, ops: &[&Arc<Operation>]) {
        let doc = Document::new("test.rs");
        for op in ops {
            doc.apply(op).unwrap();
        }
        resolver.index_document(&doc.snapshot().unwrap()).unwrap();
    }

    #[test]
    fn test_create_requires_known_operation() {
        let resolver = AddressResolver::new();
        let err = resolver
            .create_address(
                "repo".to_string(),
                "unknown".to_string(),
                PositionRange::at(Position::single(1, "alice")),
            )
            .unwrap_err();
        assert!(matches!(err, AddressError::OperationNotFound(_)));
    }

    #[test]
    fn test_create_and_resolve() {
        let resolver = AddressResolver::new();
        let op = insert_op(1, "hello");
        resolver.index_operation(Arc::clone(&op)).unwrap();
        indexed_doc(&resolver, &[&op]);

        let range = PositionRange::at(op.position.clone());
        let addr = resolver
            .create_address("repo".to_string(), op.id.clone(), range.clone())
            .unwrap();

        let resolved = resolver.resolve(&addr).unwrap();
        assert!(resolved.is_valid);
        assert_eq!(resolved.current_range, Some(range));
        assert_eq!(resolved.constructs.len(), 1);
        assert_eq!(resolved.constructs[0].content, "hello");
        assert!(resolved.movement_history.is_empty());
        assert_eq!(resolved.creation_op.id, op.id);
    }

    #[test]
    fn test_resolve_unknown_address() {
        let resolver = AddressResolver::new();
        let addr = StableAddress::new(
            "repo".to_string(),
            "op".to_string(),
            PositionRange::at(Position::single(1, "alice")),
        );
        assert!(matches!(
            resolver.resolve(&addr),
            Err(AddressError::AddressNotFound(_))
        ));
    }

    #[test]
    fn test_update_location_records_movement() {
        let resolver = AddressResolver::new();
        let op = insert_op(1, "hello");
        resolver.index_operation(Arc::clone(&op)).unwrap();
        indexed_doc(&resolver, &[&op]);

        let addr = resolver
            .create_address(
                "repo".to_string(),
                op.id.clone(),
                PositionRange::at(op.position.clone()),
            )
            .unwrap();

        let new_range = PositionRange::at(Position::single(5, "alice"));
        resolver
            .update_location(&addr, new_range.clone(), "mover".to_string(), MovementReason::Refactor)
            .unwrap();

        let history = resolver.history(&addr).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, MovementReason::Refactor);
        assert_eq!(history[0].caused_by.as_deref(), Some("mover"));
        assert_eq!(history[0].to_range, Some(new_range.clone()));

        // Nothing lives at the new range, so the address is no longer valid.
        let resolved = resolver.resolve(&addr).unwrap();
        assert!(!resolved.is_valid);
        assert_eq!(resolved.current_range, Some(new_range));
    }

    #[test]
    fn test_invalidate() {
        let resolver = AddressResolver::new();
        let op = insert_op(1, "hello");
        resolver.index_operation(Arc::clone(&op)).unwrap();

        let addr = resolver
            .create_address(
                "repo".to_string(),
                op.id.clone(),
                PositionRange::at(op.position.clone()),
            )
            .unwrap();

        resolver.invalidate(&addr, MovementReason::Delete).unwrap();

        let resolved = resolver.resolve(&addr).unwrap();
        assert!(!resolved.is_valid);
        let last = resolved.movement_history.last().unwrap();
        assert_eq!(last.reason, MovementReason::Delete);
        assert!(last.to_range.is_none());
    }

    #[test]
    fn test_process_delete_invalidates_containing_address() {
        let resolver = AddressResolver::new();
        let op = insert_op(1, "hello");
        resolver.index_operation(Arc::clone(&op)).unwrap();
        indexed_doc(&resolver, &[&op]);

        let addr = resolver
            .create_address(
                "repo".to_string(),
                op.id.clone(),
                PositionRange::at(op.position.clone()),
            )
            .unwrap();

        let del = delete_op(1);
        resolver.process_operation(&del).unwrap();

        let resolved = resolver.resolve(&addr).unwrap();
        assert!(!resolved.is_valid);
        assert!(resolved.current_range.is_none());
        assert_eq!(resolved.movement_history.len(), 1);
        let record = &resolved.movement_history[0];
        assert_eq!(record.reason, MovementReason::Delete);
        assert!(record.to_range.is_none());
        assert_eq!(record.caused_by, Some(del.id.clone()));
    }

    #[test]
    fn test_process_insert_outside_range_leaves_address_alone() {
        let resolver = AddressResolver::new();
        let op = insert_op(5, "hello");
        resolver.index_operation(Arc::clone(&op)).unwrap();
        indexed_doc(&resolver, &[&op]);

        let addr = resolver
            .create_address(
                "repo".to_string(),
                op.id.clone(),
                PositionRange::at(op.position.clone()),
            )
            .unwrap();

        let outside = insert_op(1, "before");
        resolver.process_operation(&outside).unwrap();

        let resolved = resolver.resolve(&addr).unwrap();
        assert!(resolved.is_valid);
        assert!(resolved.movement_history.is_empty());
    }

    #[test]
    fn test_process_insert_inside_range_records_edit() {
        let resolver = AddressResolver::new();
        let first = insert_op(1, "a");
        let last = insert_op(5, "b");
        resolver.index_operation(Arc::clone(&first)).unwrap();
        resolver.index_operation(Arc::clone(&last)).unwrap();
        indexed_doc(&resolver, &[&first, &last]);

        let range = PositionRange::new(first.position.clone(), last.position.clone());
        let addr = resolver
            .create_address("repo".to_string(), first.id.clone(), range.clone())
            .unwrap();

        let inside = insert_op(3, "mid");
        resolver.process_operation(&inside).unwrap();

        let resolved = resolver.resolve(&addr).unwrap();
        assert!(resolved.is_valid);
        assert_eq!(resolved.current_range, Some(range));
        assert_eq!(resolved.movement_history.len(), 1);
        assert_eq!(resolved.movement_history[0].reason, MovementReason::Edit);
    }

    #[test]
    fn test_addresses_for_document() {
        let resolver = AddressResolver::new();
        let op = insert_op(1, "hello");
        resolver.index_operation(Arc::clone(&op)).unwrap();
        indexed_doc(&resolver, &[&op]);

        let addr = resolver
            .create_address(
                "repo".to_string(),
                op.id.clone(),
                PositionRange::at(op.position.clone()),
            )
            .unwrap();

        let found = resolver.addresses_for_document("test.rs").unwrap();
        assert_eq!(found, vec![addr]);
        assert!(resolver
            .addresses_for_document("other.rs")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_purge_document_clears_construct_index() {
        let resolver = AddressResolver::new();
        let op = insert_op(1, "hello");
        resolver.index_operation(Arc::clone(&op)).unwrap();
        indexed_doc(&resolver, &[&op]);

        resolver.purge_document("test.rs").unwrap();
        assert!(resolver
            .addresses_for_document("test.rs")
            .unwrap()
            .is_empty());
    }
}
