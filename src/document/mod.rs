//! Documents as positional indices over constructs
//!
//! A document is a mapping from dense positions to constructs plus a sorted
//! sequence of the live positions. Applying operations keeps the rendered
//! text, the content hash and the version counter in agreement.

mod construct;
mod index;

pub use construct::{infer_kind, Construct, ConstructId, ConstructKind, ConstructMeta};
pub use index::{Document, DocumentError, DocumentSnapshot};
