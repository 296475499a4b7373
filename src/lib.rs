//! Crate root: lightweight module orchestration and public re-exports.
//!
//! `phylodist` is a low-level library for phylogenomic analysis: it compares
//! collections of gene trees against a reference species tree and computes
//! reconciliation distances (duplications, losses, deep coalescences),
//! split-based distances (Robinson-Foulds, Hungarian-matched edge
//! disagreement, approximate SPR), patristic distance matrices, distance
//! based tree builders (UPGMA, single linkage, BIONJ, OLS branch lengths)
//! and OPTICS clusterings over an abstract distance source.
//!
//! Modules:
//! - `bitset`: compact bipartition (split) representation.
//! - `catalog`: ordered leaf-label catalog shared across trees.
//! - `topology`: rooted binary topology, traversal, splits, equality.
//! - `distmatrix`: square and packed per-species distance matrices.
//! - `patristic`: leaf-to-leaf distances and OLS branch lengths.
//! - `hungarian`: rectangular minimum-cost assignment.
//! - `splitset`: RF / H-distance / approximate-SPR engine.
//! - `reconcile`: LCA reconciliation of gene trees with a species tree.
//! - `upgma`: UPGMA, single-linkage and BIONJ tree builders.
//! - `optics`: OPTICS ordering and cluster extraction.
//! - `io`: Newick file reading and TSV output for the CLI.

pub mod bitset;
pub mod catalog;
pub mod distmatrix;
pub mod error;
pub mod hungarian;
pub mod io;
pub mod optics;
pub mod patristic;
pub mod reconcile;
pub mod splitset;
pub mod topology;
pub mod upgma;

// Re-export frequently used types & functions
pub use bitset::Split;
pub use catalog::LabelCatalog;
pub use distmatrix::{DistanceMatrix, SpDistMatrix};
pub use error::{PhyloError, Result};
pub use hungarian::Hungarian;
pub use optics::{CachedDistance, DistanceGenerator, Goptics};
pub use reconcile::{GeneTree, Reconciliation, SpeciesTree};
pub use splitset::SplitSet;
pub use topology::{Topology, TreeShape, TreeSource};
