//! Crate-wide error type.
//!
//! The core algorithms never log and never print: every failure is returned
//! to the caller as a tagged `PhyloError`. The variants follow the four
//! error families the library distinguishes (shape mismatches between
//! collaborating structures, out-of-range arguments, broken structural
//! invariants, and data the caller was supposed to provide first), plus
//! wrappers used only by the `io` layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PhyloError {
    /// Two structures that must agree in shape do not (matrix size vs leaf
    /// count, inconsistent label sets, permutation of the wrong length).
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// An argument is outside its documented domain.
    #[error("argument out of range: {0}")]
    OutOfRange(String),

    /// A structural invariant the algorithms rely on was found broken.
    /// Non-recoverable: the caller must assume the involved scratch state
    /// is corrupt and rebuild it.
    #[error("structural invariant violated: {0}")]
    InvariantViolated(String),

    /// Optional data the operation needs is absent, e.g. branch lengths or
    /// a stale traversal the caller must refresh first.
    #[error("missing data: {0}")]
    MissingData(String),

    /// Newick/tree-source parsing failed (ambient `io` layer only).
    #[error("tree parsing failed: {0}")]
    Parse(String),

    #[error(transparent)]
    Tree(#[from] phylotree::tree::TreeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PhyloError>;
