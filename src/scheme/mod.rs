//! Element classes and the per-class scheme capability consumed by the forest.
//!
//! The forest never interprets element geometry itself. Everything it needs to
//! know about an element (level, order, parent/children, family membership) is
//! asked of the [`ElementScheme`] registered for the element's class in a
//! [`SchemeTable`].

pub mod hypercube;

use crate::mesh_error::MeshForestError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

pub use hypercube::HypercubeScheme;

/// Coarse element classes. The discriminant is the wire encoding.
#[derive(
    Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum ElementClass {
    /// 0D vertex.
    Vertex = 0,
    /// 1D line segment.
    Line = 1,
    /// 2D quadrilateral.
    Quad = 2,
    /// 2D triangle.
    Triangle = 3,
    /// 3D hexahedron.
    Hex = 4,
    /// 3D tetrahedron.
    Tet = 5,
    /// 3D wedge/prism.
    Prism = 6,
    /// 3D pyramid.
    Pyramid = 7,
}

impl ElementClass {
    pub const ALL: [ElementClass; 8] = [
        ElementClass::Vertex,
        ElementClass::Line,
        ElementClass::Quad,
        ElementClass::Triangle,
        ElementClass::Hex,
        ElementClass::Tet,
        ElementClass::Prism,
        ElementClass::Pyramid,
    ];

    /// Largest face count of any class.
    pub const MAX_FACES: usize = 6;

    /// Topological dimension.
    pub fn dimension(self) -> u8 {
        match self {
            ElementClass::Vertex => 0,
            ElementClass::Line => 1,
            ElementClass::Quad | ElementClass::Triangle => 2,
            ElementClass::Hex | ElementClass::Tet | ElementClass::Prism | ElementClass::Pyramid => 3,
        }
    }

    pub fn num_faces(self) -> u8 {
        match self {
            ElementClass::Vertex => 0,
            ElementClass::Line => 2,
            ElementClass::Triangle => 3,
            ElementClass::Quad | ElementClass::Tet => 4,
            ElementClass::Prism | ElementClass::Pyramid => 5,
            ElementClass::Hex => 6,
        }
    }

    /// Class of face `face`, or `None` if the face does not exist.
    pub fn face_class(self, face: u8) -> Option<ElementClass> {
        if face >= self.num_faces() {
            return None;
        }
        Some(match self {
            ElementClass::Vertex => return None,
            ElementClass::Line => ElementClass::Vertex,
            ElementClass::Quad | ElementClass::Triangle => ElementClass::Line,
            ElementClass::Hex => ElementClass::Quad,
            ElementClass::Tet => ElementClass::Triangle,
            ElementClass::Prism if face < 3 => ElementClass::Quad,
            ElementClass::Prism => ElementClass::Triangle,
            ElementClass::Pyramid if face < 4 => ElementClass::Triangle,
            ElementClass::Pyramid => ElementClass::Quad,
        })
    }

    /// Number of children produced by one refinement step.
    pub fn num_children(self) -> usize {
        match self {
            ElementClass::Vertex => 1,
            ElementClass::Line => 2,
            ElementClass::Quad | ElementClass::Triangle => 4,
            ElementClass::Hex | ElementClass::Tet | ElementClass::Prism => 8,
            ElementClass::Pyramid => 10,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }
}

/// A leaf of a tree's refinement hierarchy.
///
/// `anchor` is a scheme-defined coordinate payload; the forest only moves it
/// around and hands it back to the scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Element {
    pub class: ElementClass,
    pub level: u8,
    pub anchor: [u32; 3],
}

/// Decision returned by an adapt callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AdaptDecision {
    /// Replace a complete family by its parent.
    Coarsen,
    /// Leave the element(s) unchanged.
    Keep,
    /// Replace a single element by its children.
    Refine,
}

/// Per-class element operations.
pub trait ElementScheme: Send + Sync + fmt::Debug {
    fn class(&self) -> ElementClass;

    /// Deepest level an element of this class can reach.
    fn max_level(&self) -> u8;

    fn children_count(&self) -> usize {
        self.class().num_children()
    }

    fn level(&self, e: &Element) -> u8 {
        e.level
    }

    /// The level-0 element covering a whole tree.
    fn root(&self) -> Element;

    /// Tree-local total order (space-filling curve order).
    fn compare_key(&self, a: &Element, b: &Element) -> Ordering;

    fn parent(&self, e: &Element) -> Option<Element>;

    /// Position of `e` among its siblings, `0..children_count`.
    fn child_id(&self, e: &Element) -> usize;

    /// Children of `e` in curve order; empty at `max_level`.
    fn refine(&self, e: &Element) -> Vec<Element>;

    /// Index of `e` (or its ancestor/descendant) among all elements of `level`
    /// of the tree, in curve order.
    fn linear_id(&self, e: &Element, level: u8) -> u64;

    /// Inverse of [`ElementScheme::linear_id`] at `level`.
    fn from_linear_id(&self, level: u8, id: u64) -> Element;

    /// Range of max-level leaf indices covered by `e`.
    fn leaf_range(&self, e: &Element) -> Range<u64>;

    /// Whether `candidates` are exactly the children of one parent, in order.
    fn family_is_complete(&self, candidates: &[Element]) -> bool {
        if candidates.len() != self.children_count() || candidates.len() < 2 {
            return false;
        }
        let level = candidates[0].level;
        if level == 0 {
            return false;
        }
        let Some(parent) = self.parent(&candidates[0]) else {
            return false;
        };
        candidates.iter().enumerate().all(|(i, c)| {
            c.class == self.class()
                && c.level == level
                && self.child_id(c) == i
                && self.parent(c).as_ref() == Some(&parent)
        })
    }

    /// Parent of a complete family, `None` otherwise.
    fn coarsen(&self, family: &[Element]) -> Option<Element> {
        if self.family_is_complete(family) {
            self.parent(&family[0])
        } else {
            None
        }
    }

    /// Number of elements of a uniform refinement to `level`, if it fits in `u64`.
    fn count_at_level(&self, level: u8) -> Option<u64> {
        (self.children_count() as u64).checked_pow(level as u32)
    }
}

/// Capability table: element class → scheme.
#[derive(Clone, Default)]
pub struct SchemeTable {
    schemes: Arc<BTreeMap<ElementClass, Arc<dyn ElementScheme>>>,
}

impl SchemeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Morton-order schemes for lines, quads and hexes.
    pub fn hypercube() -> Self {
        Self::new()
            .with_scheme(Arc::new(HypercubeScheme::line()))
            .with_scheme(Arc::new(HypercubeScheme::quad()))
            .with_scheme(Arc::new(HypercubeScheme::hex()))
    }

    /// Register (or replace) the scheme for `scheme.class()`.
    pub fn with_scheme(mut self, scheme: Arc<dyn ElementScheme>) -> Self {
        Arc::make_mut(&mut self.schemes).insert(scheme.class(), scheme);
        self
    }

    pub fn get(&self, class: ElementClass) -> Result<&dyn ElementScheme, MeshForestError> {
        self.schemes
            .get(&class)
            .map(|s| s.as_ref())
            .ok_or(MeshForestError::UnknownClass(class))
    }

    pub fn contains(&self, class: ElementClass) -> bool {
        self.schemes.contains_key(&class)
    }

    pub fn classes(&self) -> impl Iterator<Item = ElementClass> + '_ {
        self.schemes.keys().copied()
    }

    /// Largest children count over all registered schemes (1 if empty).
    pub fn max_children_count(&self) -> usize {
        self.schemes
            .values()
            .map(|s| s.children_count())
            .max()
            .unwrap_or(1)
    }
}

impl fmt::Debug for SchemeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.schemes.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_tables_are_consistent() {
        for class in ElementClass::ALL {
            assert_eq!(ElementClass::from_u8(class.as_u8()), Some(class));
            for face in 0..class.num_faces() {
                let fc = class.face_class(face).unwrap();
                assert_eq!(fc.dimension() + 1, class.dimension());
            }
            assert_eq!(class.face_class(class.num_faces()), None);
        }
        assert_eq!(ElementClass::from_u8(8), None);
        assert_eq!(ElementClass::Prism.face_class(4), Some(ElementClass::Triangle));
        assert_eq!(ElementClass::Pyramid.face_class(4), Some(ElementClass::Quad));
    }

    #[test]
    fn table_lookup_and_missing_class() {
        let table = SchemeTable::hypercube();
        assert!(table.contains(ElementClass::Hex));
        assert_eq!(table.max_children_count(), 8);
        assert_eq!(
            table.get(ElementClass::Tet).unwrap_err(),
            MeshForestError::UnknownClass(ElementClass::Tet)
        );
        let classes: Vec<_> = table.classes().collect();
        assert_eq!(
            classes,
            vec![ElementClass::Line, ElementClass::Quad, ElementClass::Hex]
        );
    }
}
