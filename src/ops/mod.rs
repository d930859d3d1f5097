//! Operations and their causal history
//!
//! Every edit is an immutable, content-addressed operation. The DAG records
//! the happens-before edges supplied by submitters and answers causal
//! queries over them.

mod dag;
mod operation;

pub use dag::{DagError, OperationDag};
pub use operation::{
    derive_author_id, derive_op_id, OpId, OpKind, Operation, OperationMeta, CONTENT_TYPE_BINARY,
    CONTENT_TYPE_JSON, CONTENT_TYPE_TEXT, META_DOCUMENT_ID,
};
