//! Morton-order scheme for line, quadrilateral and hexahedral trees.
//!
//! An element is its level plus the integer anchor of its lower corner on the
//! `2^max_level` grid. Children are numbered by coordinate bits (x is bit 0),
//! which makes child order coincide with Morton order.

use super::{Element, ElementClass, ElementScheme};
use crate::mesh_error::MeshForestError;
use std::cmp::Ordering;
use std::ops::Range;

/// Quad/oct-tree style scheme for the tensor-product classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HypercubeScheme {
    class: ElementClass,
    dim: usize,
    max_level: u8,
}

impl HypercubeScheme {
    pub fn line() -> Self {
        Self {
            class: ElementClass::Line,
            dim: 1,
            max_level: 30,
        }
    }

    pub fn quad() -> Self {
        Self {
            class: ElementClass::Quad,
            dim: 2,
            max_level: 30,
        }
    }

    pub fn hex() -> Self {
        Self {
            class: ElementClass::Hex,
            dim: 3,
            max_level: 21,
        }
    }

    /// Scheme for `class` capped at `max_level`. Fails for classes that are not
    /// tensor products and for levels whose Morton keys would not fit in 64 bits.
    pub fn with_max_level(class: ElementClass, max_level: u8) -> Result<Self, MeshForestError> {
        let dim = match class {
            ElementClass::Line => 1,
            ElementClass::Quad => 2,
            ElementClass::Hex => 3,
            other => {
                return Err(MeshForestError::config(format!(
                    "{other:?} is not a hypercube class"
                )));
            }
        };
        if dim * max_level as usize > 63 || max_level > 31 {
            return Err(MeshForestError::config(format!(
                "max level {max_level} too deep for {class:?}"
            )));
        }
        Ok(Self {
            class,
            dim,
            max_level,
        })
    }

    /// Edge length of an element of `level` on the max-level grid.
    fn len(&self, level: u8) -> u32 {
        1u32 << (self.max_level - level)
    }

    /// Morton index of the element's first max-level leaf.
    fn morton(&self, e: &Element) -> u64 {
        let mut key = 0u64;
        for bit in 0..self.max_level as usize {
            for d in 0..self.dim {
                let b = ((e.anchor[d] >> bit) & 1) as u64;
                key |= b << (bit * self.dim + d);
            }
        }
        key
    }
}

impl ElementScheme for HypercubeScheme {
    fn class(&self) -> ElementClass {
        self.class
    }

    fn max_level(&self) -> u8 {
        self.max_level
    }

    fn children_count(&self) -> usize {
        1 << self.dim
    }

    fn root(&self) -> Element {
        Element {
            class: self.class,
            level: 0,
            anchor: [0; 3],
        }
    }

    fn compare_key(&self, a: &Element, b: &Element) -> Ordering {
        (self.morton(a), a.level).cmp(&(self.morton(b), b.level))
    }

    fn parent(&self, e: &Element) -> Option<Element> {
        if e.level == 0 {
            return None;
        }
        let plen = self.len(e.level - 1);
        let mut anchor = e.anchor;
        for coord in anchor.iter_mut().take(self.dim) {
            *coord &= !(plen - 1);
        }
        Some(Element {
            class: e.class,
            level: e.level - 1,
            anchor,
        })
    }

    fn child_id(&self, e: &Element) -> usize {
        if e.level == 0 {
            return 0;
        }
        let shift = self.max_level - e.level;
        (0..self.dim)
            .map(|d| (((e.anchor[d] >> shift) & 1) as usize) << d)
            .sum()
    }

    fn refine(&self, e: &Element) -> Vec<Element> {
        if e.level >= self.max_level {
            return Vec::new();
        }
        let half = self.len(e.level + 1);
        (0..self.children_count())
            .map(|id| {
                let mut anchor = e.anchor;
                for (d, coord) in anchor.iter_mut().enumerate().take(self.dim) {
                    *coord += ((id >> d) & 1) as u32 * half;
                }
                Element {
                    class: e.class,
                    level: e.level + 1,
                    anchor,
                }
            })
            .collect()
    }

    fn linear_id(&self, e: &Element, level: u8) -> u64 {
        self.morton(e) >> (self.dim * (self.max_level - level) as usize)
    }

    fn from_linear_id(&self, level: u8, id: u64) -> Element {
        let shift = self.max_level - level;
        let mut anchor = [0u32; 3];
        for bit in 0..level as usize {
            for (d, coord) in anchor.iter_mut().enumerate().take(self.dim) {
                let b = ((id >> (bit * self.dim + d)) & 1) as u32;
                *coord |= b << (bit as u8 + shift);
            }
        }
        Element {
            class: self.class,
            level,
            anchor,
        }
    }

    fn leaf_range(&self, e: &Element) -> Range<u64> {
        let start = self.morton(e);
        let count = 1u64 << (self.dim * (self.max_level - e.level) as usize);
        start..start + count
    }
}
