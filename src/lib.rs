#![cfg_attr(docsrs, feature(doc_cfg))]
//! # mesh-forest
//!
//! mesh-forest manages distributed adaptive forests of refinement trees. A
//! [`CoarseMesh`](cmesh::CoarseMesh) describes the macro mesh of trees and their
//! face connectivity; a [`Forest`](forest::Forest) holds the leaf elements
//! obtained by recursively refining those trees, ordered along a space-filling
//! curve and split into contiguous ranges over the ranks of a process group.
//!
//! ## Features
//! - Coarse meshes that are replicated or partitioned, and repartitioned in
//!   lockstep with the forests built on them
//! - Pluggable element schemes per element class (hypercube Morton scheme
//!   included for lines, quads and hexes)
//! - Forest construction by uniform refinement, callback-driven adaptation
//!   (optionally recursive) and count- or weight-balanced partitioning
//! - Pluggable communication backends (serial, in-process threads, MPI)
//!
//! ## Lifecycle
//!
//! Every object goes through init → set_* → commit. `commit` consumes the
//! builder, validates the configuration, and on success returns an immutable
//! handle. Cloning a handle adds a reference, dropping it removes one. Commit is
//! collective whenever it communicates: every rank must call it with matching
//! configuration.
//!
//! ```toml
//! [dependencies]
//! mesh-forest = "0.1"
//! # features = ["mpi-support"]
//! ```

pub mod algs;
pub mod cmesh;
pub mod debug_invariants;
pub mod forest;
pub mod mesh_error;
pub mod scheme;

pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::communicator::{Communicator, NoComm, RayonComm};
    pub use crate::cmesh::{CoarseMesh, CoarseMeshBuilder, FaceLink, TreeId, TreeRange};
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::forest::{
        AdaptContext, AdaptFn, AdaptStats, Forest, ForestBuilder, WeightFn, adapt_fn, weight_fn,
    };
    pub use crate::mesh_error::MeshForestError;
    pub use crate::scheme::{
        AdaptDecision, Element, ElementClass, ElementScheme, HypercubeScheme, SchemeTable,
    };
}
