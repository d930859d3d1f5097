//! Stable addresses and their resolver
//!
//! An address is a logical anchor, not a byte offset: it names the operation
//! that created a span plus the span's current range in the dense order. The
//! resolver keeps that promise as later operations displace, split or delete
//! the referenced content, recording every transition in a movement log.

mod resolver;
mod stable;

pub use resolver::{AddressError, AddressResolver, MovementReason, MovementRecord, ResolvedAddress};
pub use stable::{AddressKey, PositionRange, RepositoryId, StableAddress, ADDRESS_SCHEME};
