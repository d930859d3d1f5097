//! Causal operation DAG
//!
//! Operations are stored by identifier with children edges, a root set
//! (no parents) and a head set (no observed children). Insertion is
//! idempotent on identifier, so replaying persisted operations is harmless.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::position::AuthorId;

use super::operation::{OpId, Operation};

#[derive(Error, Debug)]
pub enum DagError {
    #[error("operation not found: {0}")]
    OperationNotFound(OpId),

    #[error("operation author must not be empty")]
    EmptyAuthor,

    #[error("operation parents missing from the graph: {0:?}")]
    CausalityViolation(Vec<OpId>),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Default)]
struct DagInner {
    operations: HashMap<OpId, Arc<Operation>>,
    children: HashMap<OpId, Vec<OpId>>,
    roots: Vec<OpId>,
    heads: Vec<OpId>,
}

/// The causal history of a repository's edits.
///
/// One reader-writer lock guards the whole store: writes are exclusive,
/// reads (including causal traversals) may overlap.
#[derive(Default)]
pub struct OperationDag {
    inner: RwLock<DagInner>,
}

impl OperationDag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Structural validation shared with the engine: the kind set is
    /// enforced by the type, so only the author remains to check.
    pub fn validate(op: &Operation) -> Result<(), DagError> {
        if op.author.is_empty() {
            return Err(DagError::EmptyAuthor);
        }
        Ok(())
    }

    /// Insert an operation. A duplicate identifier is success and leaves
    /// the graph untouched (at-most-once insertion).
    pub fn add(&self, op: Arc<Operation>) -> Result<(), DagError> {
        Self::validate(&op)?;

        let mut inner = self.write()?;
        if inner.operations.contains_key(&op.id) {
            return Ok(());
        }

        let id = op.id.clone();
        let parents = op.parents.clone();
        inner.operations.insert(id.clone(), op);

        if parents.is_empty() {
            inner.roots.push(id.clone());
        } else {
            for parent in &parents {
                inner
                    .children
                    .entry(parent.clone())
                    .or_default()
                    .push(id.clone());
                inner.heads.retain(|h| h != parent);
            }
        }

        inner.heads.push(id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<Operation>, DagError> {
        let inner = self.read()?;
        inner
            .operations
            .get(id)
            .cloned()
            .ok_or_else(|| DagError::OperationNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> Result<bool, DagError> {
        Ok(self.read()?.operations.contains_key(id))
    }

    pub fn len(&self) -> Result<usize, DagError> {
        Ok(self.read()?.operations.len())
    }

    pub fn is_empty(&self) -> Result<bool, DagError> {
        Ok(self.read()?.operations.is_empty())
    }

    pub fn by_author(&self, author: &AuthorId) -> Result<Vec<Arc<Operation>>, DagError> {
        let inner = self.read()?;
        Ok(inner
            .operations
            .values()
            .filter(|op| &op.author == author)
            .cloned()
            .collect())
    }

    /// Operations strictly later than the given instant.
    pub fn since(&self, timestamp: DateTime<Utc>) -> Result<Vec<Arc<Operation>>, DagError> {
        let inner = self.read()?;
        Ok(inner
            .operations
            .values()
            .filter(|op| op.timestamp > timestamp)
            .cloned()
            .collect())
    }

    pub fn roots(&self) -> Result<Vec<OpId>, DagError> {
        Ok(self.read()?.roots.clone())
    }

    pub fn heads(&self) -> Result<Vec<OpId>, DagError> {
        Ok(self.read()?.heads.clone())
    }

    /// Every ancestor of `id` (including `id` itself), each exactly once,
    /// parents before children. Depth-first, post-order, iterative so deep
    /// histories cannot overflow the stack.
    pub fn causal_history(&self, id: &str) -> Result<Vec<Arc<Operation>>, DagError> {
        let inner = self.read()?;
        if !inner.operations.contains_key(id) {
            return Err(DagError::OperationNotFound(id.to_string()));
        }

        let mut history = Vec::new();
        let mut visited: HashSet<OpId> = HashSet::new();
        // (id, parents already expanded?)
        let mut stack: Vec<(OpId, bool)> = vec![(id.to_string(), false)];

        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                if let Some(op) = inner.operations.get(&current) {
                    history.push(op.clone());
                }
                continue;
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            let Some(op) = inner.operations.get(&current) else {
                // Parent not in the graph; skip it (see missing_parents).
                continue;
            };
            stack.push((current, true));
            for parent in op.parents.iter().rev() {
                if !visited.contains(parent) {
                    stack.push((parent.clone(), false));
                }
            }
        }

        Ok(history)
    }

    /// Parents an operation names that are not present in the graph.
    /// Detection only; add() does not reject on these yet.
    pub fn missing_parents(&self, op: &Operation) -> Result<Vec<OpId>, DagError> {
        let inner = self.read()?;
        Ok(op
            .parents
            .iter()
            .filter(|p| !inner.operations.contains_key(*p))
            .cloned()
            .collect())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, DagInner>, DagError> {
        self.inner
            .read()
            .map_err(|e| DagError::Internal(format!("dag lock poisoned: {e}")))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, DagInner>, DagError> {
        self.inner
            .write()
            .map_err(|e| DagError::Internal(format!("dag lock poisoned: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{OpKind, OperationMeta};
    use crate::position::Position;

    fn op(content: &str, parents: Vec<OpId>) -> Arc<Operation> {
        Arc::new(
            Operation::new(
                OpKind::Insert,
                Position::single(1, "alice"),
                content,
                "alice",
                parents,
                OperationMeta::default(),
            ),
        )
    }

    #[test]
    fn test_add_and_get() {
        let dag = OperationDag::new();
        let o = op("hello", vec![]);
        dag.add(o.clone()).unwrap();

        let got = dag.get(&o.id).unwrap();
        assert_eq!(got.content, "hello");

        assert!(matches!(
            dag.get("missing"),
            Err(DagError::OperationNotFound(_))
        ));
    }

    #[test]
    fn test_add_rejects_empty_author() {
        let dag = OperationDag::new();
        let mut bad = Operation::new(
            OpKind::Insert,
            Position::single(1, "alice"),
            "x",
            "alice",
            vec![],
            OperationMeta::default(),
        );
        bad.author = String::new();
        assert!(matches!(
            dag.add(Arc::new(bad)),
            Err(DagError::EmptyAuthor)
        ));
    }

    #[test]
    fn test_add_is_idempotent() {
        let dag = OperationDag::new();
        let o = op("hello", vec![]);

        dag.add(o.clone()).unwrap();
        dag.add(o.clone()).unwrap();

        assert_eq!(dag.len().unwrap(), 1);
        assert_eq!(dag.roots().unwrap(), vec![o.id.clone()]);
        assert_eq!(dag.heads().unwrap(), vec![o.id.clone()]);
    }

    #[test]
    fn test_heads_and_roots_track_edges() {
        let dag = OperationDag::new();
        let o1 = op("one", vec![]);
        let o2 = op("two", vec![o1.id.clone()]);

        dag.add(o1.clone()).unwrap();
        dag.add(o2.clone()).unwrap();

        assert_eq!(dag.roots().unwrap(), vec![o1.id.clone()]);
        // o1 gained a child, so only o2 remains a head.
        assert_eq!(dag.heads().unwrap(), vec![o2.id.clone()]);
    }

    #[test]
    fn test_causal_history_diamond() {
        let dag = OperationDag::new();
        let o1 = op("o1", vec![]);
        let o2 = op("o2", vec![o1.id.clone()]);
        let o3 = op("o3", vec![o1.id.clone()]);
        let o4 = op("o4", vec![o2.id.clone(), o3.id.clone()]);

        for o in [&o1, &o2, &o3, &o4] {
            dag.add(Arc::clone(o)).unwrap();
        }

        let history = dag.causal_history(&o4.id).unwrap();
        let ids: Vec<&str> = history.iter().map(|o| o.id.as_str()).collect();

        assert_eq!(history.len(), 4, "each ancestor exactly once: {:?}", ids);
        let idx = |id: &str| ids.iter().position(|x| *x == id).unwrap();
        assert!(idx(&o1.id) < idx(&o2.id));
        assert!(idx(&o1.id) < idx(&o3.id));
        assert!(idx(&o2.id) < idx(&o4.id));
        assert!(idx(&o3.id) < idx(&o4.id));
    }

    #[test]
    fn test_by_author_and_since() {
        let dag = OperationDag::new();
        let before = Utc::now();

        let o1 = op("one", vec![]);
        dag.add(o1.clone()).unwrap();

        let other = Operation::new(
            OpKind::Insert,
            Position::single(2, "bob"),
            "two",
            "bob",
            vec![],
            OperationMeta::default(),
        );
        dag.add(Arc::new(other)).unwrap();

        assert_eq!(dag.by_author(&"alice".to_string()).unwrap().len(), 1);
        assert_eq!(dag.by_author(&"bob".to_string()).unwrap().len(), 1);
        assert_eq!(dag.since(before).unwrap().len(), 2);
        assert_eq!(dag.since(Utc::now()).unwrap().len(), 0);
    }

    #[test]
    fn test_missing_parents_detected() {
        let dag = OperationDag::new();
        let o1 = op("one", vec![]);
        dag.add(o1.clone()).unwrap();

        let orphan = op("two", vec![o1.id.clone(), "nonexistent".to_string()]);
        let missing = dag.missing_parents(&orphan).unwrap();
        assert_eq!(missing, vec!["nonexistent".to_string()]);
    }
}
