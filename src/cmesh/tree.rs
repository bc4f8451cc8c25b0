//! `TreeId` and the per-tree connectivity record of a coarse mesh.
//!
//! Face connectivity is an index table: each face slot names the neighbor tree,
//! the neighbor's face and the orientation between them. Trees never hold
//! references to each other, so the (cyclic) face graph has no ownership cycle.

use crate::scheme::ElementClass;
use std::fmt;

/// Dense, 0-based global tree index.
///
/// `repr(transparent)` over `u64` so it can be carried on the wire as-is.
#[derive(
    Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TreeId(u64);

impl TreeId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        TreeId(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The id as a `usize` index into dense per-tree tables.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TreeId").field(&self.0).finish()
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TreeId {
    fn from(raw: u64) -> Self {
        TreeId(raw)
    }
}

/// Target of one face join.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct FaceLink {
    pub tree: TreeId,
    pub face: u8,
    pub orientation: u8,
}

/// One coarse tree: class tag plus one optional link per face.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Tree {
    pub id: TreeId,
    pub class: ElementClass,
    /// `faces.len() == class.num_faces()`; `None` is a domain boundary.
    pub faces: Vec<Option<FaceLink>>,
}

impl Tree {
    /// Tree with every face on the domain boundary.
    pub fn new(id: TreeId, class: ElementClass) -> Self {
        Self {
            id,
            class,
            faces: vec![None; class.num_faces() as usize],
        }
    }

    pub fn face(&self, face: u8) -> Option<&FaceLink> {
        self.faces.get(face as usize).and_then(Option::as_ref)
    }

    pub fn num_faces(&self) -> u8 {
        self.faces.len() as u8
    }

    /// Number of faces joined to some tree.
    pub fn num_joined_faces(&self) -> usize {
        self.faces.iter().filter(|f| f.is_some()).count()
    }
}
