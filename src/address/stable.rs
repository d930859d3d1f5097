//! Address and range types

use std::fmt;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::ops::OpId;
use crate::position::Position;

/// URI scheme constant for stable addresses.
pub const ADDRESS_SCHEME: &str = "contextdb";

/// Size reported for ranges whose extent is not representable.
const VERY_LARGE_RANGE: u64 = 1_000_000;

pub type RepositoryId = String;
pub type AddressKey = String;

/// An inclusive range `[start, end]` in the dense position order.
/// A range with `start > end` is empty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRange {
    pub start: Position,
    pub end: Position,
}

impl PositionRange {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    /// A degenerate range covering a single position.
    pub fn at(pos: Position) -> Self {
        Self {
            start: pos.clone(),
            end: pos,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, pos: &Position) -> bool {
        *pos >= self.start && *pos <= self.end
    }

    pub fn overlaps(&self, other: &PositionRange) -> bool {
        !(self.end < other.start || other.end < self.start)
    }

    /// Approximate extent: the first-segment value difference when it fits
    /// in a machine word, a fixed large sentinel otherwise.
    pub fn size(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        let (Some(start), Some(end)) = (
            self.start.segments().first(),
            self.end.segments().first(),
        ) else {
            return 1;
        };
        if end.value <= start.value {
            return 1;
        }
        let diff: BigUint = &end.value - &start.value;
        u64::try_from(diff).unwrap_or(VERY_LARGE_RANGE).max(1)
    }
}

/// An opaque reference to a content span: the operation that originated the
/// content plus its current range. Survives as a permalink while the
/// resolver tracks displacement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StableAddress {
    pub scheme: String,
    pub repository: RepositoryId,
    pub operation_id: OpId,
    pub range: PositionRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment: Option<String>,
}

impl StableAddress {
    pub fn new(repository: RepositoryId, operation_id: OpId, range: PositionRange) -> Self {
        Self {
            scheme: ADDRESS_SCHEME.to_string(),
            repository,
            operation_id,
            range,
            fragment: None,
        }
    }

    pub fn with_fragment(mut self, fragment: impl Into<String>) -> Self {
        self.fragment = Some(fragment.into());
        self
    }

    /// Lookup key: originating operation prefix plus the range's position
    /// key prefixes.
    pub fn key(&self) -> AddressKey {
        format!(
            "{}:{}:{}",
            prefix(&self.operation_id, 16),
            prefix(&self.range.start.key(), 8),
            prefix(&self.range.end.key(), 8),
        )
    }

    pub fn is_valid(&self) -> bool {
        self.scheme == ADDRESS_SCHEME
            && !self.repository.is_empty()
            && self.range.start.is_valid()
            && self.range.end.is_valid()
            && !self.range.is_empty()
    }
}

impl fmt::Display for StableAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}/{}/{}-{}",
            self.scheme,
            self.repository,
            prefix(&self.operation_id, 8),
            self.range.start,
            self.range.end,
        )
    }
}

fn prefix(s: &str, n: usize) -> &str {
    &s[..s.len().min(n)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::derive_op_id;
    use chrono::Utc;

    fn range(a: u64, b: u64) -> PositionRange {
        PositionRange::new(Position::single(a, "alice"), Position::single(b, "alice"))
    }

    #[test]
    fn test_contains_is_inclusive() {
        let r = range(2, 4);
        assert!(!r.contains(&Position::single(1, "alice")));
        assert!(r.contains(&Position::single(2, "alice")));
        assert!(r.contains(&Position::single(3, "alice")));
        assert!(r.contains(&Position::single(4, "alice")));
        assert!(!r.contains(&Position::single(5, "alice")));
    }

    #[test]
    fn test_empty_when_inverted() {
        assert!(range(5, 2).is_empty());
        assert!(!range(2, 2).is_empty());
        assert!(!range(5, 2).contains(&Position::single(3, "alice")));
    }

    #[test]
    fn test_overlaps() {
        assert!(range(1, 5).overlaps(&range(4, 8)));
        assert!(range(4, 8).overlaps(&range(1, 5)));
        assert!(range(1, 5).overlaps(&range(2, 3)));
        assert!(!range(1, 3).overlaps(&range(4, 8)));
    }

    #[test]
    fn test_size() {
        assert_eq!(range(5, 2).size(), 0);
        assert_eq!(range(2, 2).size(), 1);
        assert_eq!(range(2, 12).size(), 10);
    }

    #[test]
    fn test_address_key_is_stable() {
        let op = derive_op_id("alice", "hello", Utc::now());
        let a = StableAddress::new("repo".to_string(), op.clone(), range(1, 2));
        let b = StableAddress::new("repo".to_string(), op.clone(), range(1, 2));
        assert_eq!(a.key(), b.key());

        let c = StableAddress::new("repo".to_string(), op, range(1, 3));
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_address_validity() {
        let op = derive_op_id("alice", "hello", Utc::now());
        let good = StableAddress::new("repo".to_string(), op.clone(), range(1, 2));
        assert!(good.is_valid());

        let empty_repo = StableAddress::new(String::new(), op.clone(), range(1, 2));
        assert!(!empty_repo.is_valid());

        let inverted = StableAddress::new("repo".to_string(), op, range(3, 1));
        assert!(!inverted.is_valid());
    }

    #[test]
    fn test_display_form() {
        let op = "abcdef0123456789deadbeef".to_string();
        let addr = StableAddress::new("repo".to_string(), op, range(1, 2));
        let s = addr.to_string();
        assert!(s.starts_with("contextdb://repo/abcdef01/"));
    }
}
