//! Dense ordered position identifiers
//!
//! A position is a non-empty sequence of (value, author) segments that admits
//! a new position strictly between any two others. Positions give documents a
//! total order that concurrent authors can extend without coordination: the
//! appended segment's author field breaks ties between simultaneous
//! generations.

use std::fmt;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque author identifier carried in segments and operations.
pub type AuthorId = String;

/// Derived map key for a position: hex SHA-256 over its segments.
pub type PositionKey = String;

/// One level of a position identifier.
///
/// Ordering is value first, then author (lexicographic), which is exactly
/// the per-segment order the document index relies on.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Segment {
    #[serde(with = "biguint_decimal")]
    pub value: BigUint,
    pub author: AuthorId,
}

/// Segment values cross the wire as decimal strings, which stay readable
/// and exact at any magnitude.
mod biguint_decimal {
    use num_bigint::BigUint;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

impl Segment {
    pub fn new(value: impl Into<BigUint>, author: impl Into<AuthorId>) -> Self {
        Self {
            value: value.into(),
            author: author.into(),
        }
    }
}

/// A dense ordered position.
///
/// The derived ordering on the segment vector is the position total order:
/// segment-wise comparison with a strict prefix sorting before its
/// extensions.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    segments: Vec<Segment>,
}

impl Position {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    /// Convenience for a single-segment position.
    pub fn single(value: u64, author: impl Into<AuthorId>) -> Self {
        Self::new(vec![Segment::new(value, author)])
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// A position is valid iff it has at least one segment and every
    /// segment names an author.
    pub fn is_valid(&self) -> bool {
        !self.segments.is_empty() && self.segments.iter().all(|s| !s.author.is_empty())
    }

    /// Hex SHA-256 over the segment values (big-endian bytes) and authors.
    /// A pure function of the segments; distinct segment sequences yield
    /// distinct keys within the address space of the hash.
    pub fn key(&self) -> PositionKey {
        let mut hasher = Sha256::new();
        for segment in &self.segments {
            hasher.update(segment.value.to_bytes_be());
            hasher.update(segment.author.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Generate a position strictly between `left` and `right`.
    ///
    /// Either side may be absent: with no `left` the result sorts before
    /// `right`, with no `right` it sorts after `left`, and with neither the
    /// initial position `[(1, author)]` is produced. Generation never fails
    /// and terminates after at most one segment beyond the longer input.
    pub fn between(
        left: Option<&Position>,
        right: Option<&Position>,
        author: impl Into<AuthorId>,
    ) -> Position {
        let author = author.into();
        let left = left.filter(|p| p.is_valid());
        let right = right.filter(|p| p.is_valid());

        match (left, right) {
            (None, None) => Position::new(vec![Segment::new(1u32, author)]),
            (None, Some(right)) => {
                let first = &right.segments[0].value;
                if *first > BigUint::from(1u32) {
                    Position::new(vec![Segment {
                        value: first - 1u32,
                        author,
                    }])
                } else {
                    // No room before the first segment; prepend a zero level.
                    let mut segments = Vec::with_capacity(right.segments.len() + 1);
                    segments.push(Segment::new(0u32, author));
                    segments.extend(right.segments.iter().cloned());
                    Position::new(segments)
                }
            }
            (Some(left), None) => Position::new(vec![Segment {
                value: &left.segments[0].value + 1u32,
                author,
            }]),
            (Some(left), Some(right)) => Self::between_inner(left, right, author),
        }
    }

    fn between_inner(left: &Position, right: &Position, author: AuthorId) -> Position {
        let min_len = left.segments.len().min(right.segments.len());

        let mut prefix_len = 0;
        while prefix_len < min_len && left.segments[prefix_len] == right.segments[prefix_len] {
            prefix_len += 1;
        }

        let mut segments: Vec<Segment> = left.segments[..prefix_len].to_vec();

        if prefix_len < min_len {
            let left_val = &left.segments[prefix_len].value;
            let right_val = &right.segments[prefix_len].value;

            if right_val > left_val && right_val - left_val > BigUint::from(1u32) {
                // Wide gap: bisect it at this level.
                let diff = right_val - left_val;
                segments.push(Segment {
                    value: left_val + (diff >> 1),
                    author,
                });
            } else {
                // Adjacent values: keep the left segment and descend.
                segments.push(left.segments[prefix_len].clone());
                segments.push(Segment::new(1u32, author));
            }
        } else if left.segments.len() == prefix_len {
            // Left is a strict prefix of right; extend it one level.
            segments.push(Segment::new(1u32, author));
        } else {
            segments.push(left.segments[prefix_len].clone());
            segments.push(Segment::new(1u32, author));
        }

        Position::new(segments)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}:{}", segment.value, segment.author)?;
        }
        Ok(())
    }
}
