//! Coarse mesh: the partitioned macro graph of trees a forest is built on.
//!
//! A committed [`CoarseMesh`] is immutable and cheap to clone; clones share the
//! same data (`Clone` is a reference, `Drop` an unreference). The per-tree class
//! table is replicated on every rank, face connectivity is only stored for the
//! trees a rank holds. A derived mesh remembers its base weakly: provenance is
//! queryable while the base is alive but never keeps it alive.

pub mod builder;
pub mod partition;
pub mod tree;

pub use builder::CoarseMeshBuilder;
pub use partition::{PartitionTable, TreeRange};
pub use tree::{FaceLink, Tree, TreeId};

use crate::debug_invariants::DebugInvariants;
use crate::mesh_error::MeshForestError;
use crate::scheme::ElementClass;
use std::fmt;
use std::sync::{Arc, Weak};

/// A committed coarse mesh.
#[derive(Clone)]
pub struct CoarseMesh {
    inner: Arc<CoarseMeshData>,
}

pub(crate) struct CoarseMeshData {
    pub(crate) classes: Arc<Vec<ElementClass>>,
    pub(crate) partition: Option<PartitionTable>,
    pub(crate) trees: Vec<Tree>,
    pub(crate) derived_from: Option<Weak<CoarseMeshData>>,
    pub(crate) rank: usize,
    pub(crate) size: usize,
}

impl CoarseMesh {
    pub(crate) fn from_data(data: CoarseMeshData) -> Self {
        let cmesh = Self {
            inner: Arc::new(data),
        };
        crate::debug_invariants!(cmesh.validate_invariants(), "CoarseMesh::commit");
        cmesh
    }

    pub fn num_trees(&self) -> u64 {
        self.inner.classes.len() as u64
    }

    pub fn num_local_trees(&self) -> usize {
        self.inner.trees.len()
    }

    /// Trees held by this rank (all trees for a replicated mesh).
    pub fn local_range(&self) -> TreeRange {
        match &self.inner.partition {
            Some(table) => table.range(self.inner.rank),
            None => TreeRange::new(0, self.num_trees()),
        }
    }

    pub fn first_local_tree(&self) -> Option<TreeId> {
        self.local_range().first_tree()
    }

    pub fn last_local_tree(&self) -> Option<TreeId> {
        self.local_range().last_tree()
    }

    /// Global id of the `local`-th tree held by this rank.
    pub fn get_global_id(&self, local: usize) -> Option<TreeId> {
        self.inner.trees.get(local).map(|t| t.id)
    }

    /// Position of `tree` among this rank's trees.
    pub fn get_local_id(&self, tree: TreeId) -> Option<usize> {
        let range = self.local_range();
        range
            .contains(tree)
            .then(|| (tree.get() - range.first) as usize)
    }

    pub fn local_trees(&self) -> &[Tree] {
        &self.inner.trees
    }

    /// Connectivity record of a locally held tree.
    pub fn tree(&self, tree: TreeId) -> Result<&Tree, MeshForestError> {
        self.get_local_id(tree)
            .and_then(|i| self.inner.trees.get(i))
            .ok_or(MeshForestError::UnknownTree(tree))
    }

    /// Class of any tree of the mesh, held locally or not.
    pub fn tree_class(&self, tree: TreeId) -> Result<ElementClass, MeshForestError> {
        self.inner
            .classes
            .get(tree.index())
            .copied()
            .ok_or(MeshForestError::UnknownTree(tree))
    }

    pub fn face_neighbor(&self, tree: TreeId, face: u8) -> Result<Option<FaceLink>, MeshForestError> {
        let t = self.tree(tree)?;
        if face >= t.num_faces() {
            return Err(MeshForestError::connectivity(
                tree,
                face,
                format!("{:?} has {} faces", t.class, t.num_faces()),
            ));
        }
        Ok(t.face(face).copied())
    }

    /// Authoritative holder of `tree` (rank 0 for a replicated mesh).
    pub fn tree_owner(&self, tree: TreeId) -> Option<usize> {
        if tree.get() >= self.num_trees() {
            return None;
        }
        match &self.inner.partition {
            Some(table) => table.owner(tree),
            None => Some(0),
        }
    }

    pub fn is_partitioned(&self) -> bool {
        self.inner.partition.is_some()
    }

    pub fn partition_table(&self) -> Option<&PartitionTable> {
        self.inner.partition.as_ref()
    }

    /// The mesh this one was derived from, if it is still alive.
    pub fn derived_from(&self) -> Option<CoarseMesh> {
        self.inner
            .derived_from
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| CoarseMesh { inner })
    }

    pub fn rank(&self) -> usize {
        self.inner.rank
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Live references to this mesh on this rank (derived meshes and forests count).
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub(crate) fn classes(&self) -> &Arc<Vec<ElementClass>> {
        &self.inner.classes
    }

    pub(crate) fn downgrade(&self) -> Weak<CoarseMeshData> {
        Arc::downgrade(&self.inner)
    }
}

impl fmt::Debug for CoarseMesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoarseMesh")
            .field("rank", &self.inner.rank)
            .field("num_trees", &self.num_trees())
            .field("local_range", &self.local_range())
            .field("partitioned", &self.is_partitioned())
            .finish()
    }
}

impl DebugInvariants for CoarseMesh {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "CoarseMesh");
    }

    fn validate_invariants(&self) -> Result<(), MeshForestError> {
        let range = self.local_range();
        if self.inner.trees.len() as u64 != range.len() {
            return Err(MeshForestError::InvariantViolation(format!(
                "{} local tree records for range {range:?}",
                self.inner.trees.len()
            )));
        }
        for (t, expected) in self.inner.trees.iter().zip(range.iter()) {
            if t.id != expected {
                return Err(MeshForestError::InvariantViolation(format!(
                    "tree record {} at position of tree {expected}",
                    t.id
                )));
            }
            if self.tree_class(t.id)? != t.class {
                return Err(MeshForestError::InvariantViolation(format!(
                    "tree {} class disagrees with the class table",
                    t.id
                )));
            }
            if t.faces.len() != t.class.num_faces() as usize {
                return Err(MeshForestError::InvariantViolation(format!(
                    "tree {} has {} face slots",
                    t.id,
                    t.faces.len()
                )));
            }
            for (face, link) in t.faces.iter().enumerate() {
                let Some(link) = link else { continue };
                let Ok(other) = self.tree(link.tree) else {
                    continue;
                };
                let back = other.face(link.face);
                if back.map(|b| (b.tree, b.face)) != Some((t.id, face as u8)) {
                    return Err(MeshForestError::connectivity(
                        t.id,
                        face as u8,
                        "face link is not symmetric",
                    ));
                }
            }
        }
        Ok(())
    }
}
