//! contextdb: a convergent, operation-based collaborative document store
//!
//! Authors concurrently edit named documents by emitting insert, delete and
//! move operations tagged with dense ordered positions. The engine merges
//! operations arriving in any order into a single convergent state, keeps
//! the full causal history, and issues stable addresses that keep naming a
//! content span as the text around it changes.

pub mod address;
pub mod api;
pub mod auth;
pub mod document;
pub mod engine;
pub mod ops;
pub mod position;
pub mod storage;
