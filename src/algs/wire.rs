//! Fixed, versioned, little-endian wire types for forest and coarse-mesh exchanges.
//!
//! Every message is one frame: a [`WireHdr`] followed by `count` records of a
//! single `Pod` type. Records are decoded into freshly zeroed, properly aligned
//! buffers so received byte vectors never need to be aligned themselves.

use crate::cmesh::tree::{FaceLink, Tree, TreeId};
use crate::mesh_error::MeshForestError;
use crate::scheme::{Element, ElementClass};
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::size_of;

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// Record kinds carried in [`WireHdr::kind_le`].
pub mod kind {
    pub const U64: u16 = 1;
    pub const ELEMENT: u16 = 2;
    pub const TREE: u16 = 3;
    pub const TREE_CLASS: u16 = 4;
    pub const RANGE: u16 = 5;
    pub const ORDER_PROBE: u16 = 6;
    pub const JOIN: u16 = 7;
}

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

// All multi-byte integers below are stored pre-LE with `.to_le()` and decoded
// with `::from_le()`.

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireHdr {
    pub version_le: u16,
    pub kind_le: u16,
    pub count_le: u32,
}

impl WireHdr {
    pub fn new(kind: u16, count: usize) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            kind_le: kind.to_le(),
            count_le: (count as u32).to_le(),
        }
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
    pub fn kind(&self) -> u16 {
        u16::from_le(self.kind_le)
    }
    pub fn count(&self) -> usize {
        u32::from_le(self.count_le) as usize
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct WireU64 {
    pub v_le: u64,
}
impl WireU64 {
    pub fn of(v: u64) -> Self {
        Self { v_le: v.to_le() }
    }
    pub fn get(&self) -> u64 {
        u64::from_le(self.v_le)
    }
}

/// One forest element tagged with its tree.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct WireElement {
    pub tree_le: u64,
    pub anchor_le: [u32; 3],
    pub level: u8,
    pub class: u8,
    pub _pad: [u8; 2],
}

impl WireElement {
    pub fn new(tree: TreeId, e: &Element) -> Self {
        Self {
            tree_le: tree.get().to_le(),
            anchor_le: e.anchor.map(u32::to_le),
            level: e.level,
            class: e.class.as_u8(),
            _pad: [0; 2],
        }
    }

    pub fn tree(&self) -> TreeId {
        TreeId::new(u64::from_le(self.tree_le))
    }

    /// Decode the element; `peer` is only used for error context.
    pub fn element(&self, peer: usize) -> Result<Element, MeshForestError> {
        Ok(Element {
            class: decode_class(self.class, peer)?,
            level: self.level,
            anchor: self.anchor_le.map(u32::from_le),
        })
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct WireFace {
    pub neighbor_le: u64,
    pub face: u8,
    pub orientation: u8,
    pub present: u8,
    pub _pad: [u8; 5],
}

/// A coarse tree with its whole face table.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct WireTree {
    pub id_le: u64,
    pub class: u8,
    pub num_faces: u8,
    pub _pad: [u8; 6],
    pub faces: [WireFace; ElementClass::MAX_FACES],
}

impl WireTree {
    pub fn new(tree: &Tree) -> Self {
        let mut faces = [WireFace::zeroed(); ElementClass::MAX_FACES];
        for (slot, link) in faces.iter_mut().zip(tree.faces.iter()) {
            if let Some(link) = link {
                *slot = WireFace {
                    neighbor_le: link.tree.get().to_le(),
                    face: link.face,
                    orientation: link.orientation,
                    present: 1,
                    _pad: [0; 5],
                };
            }
        }
        Self {
            id_le: tree.id.get().to_le(),
            class: tree.class.as_u8(),
            num_faces: tree.faces.len() as u8,
            _pad: [0; 6],
            faces,
        }
    }

    pub fn tree(&self, peer: usize) -> Result<Tree, MeshForestError> {
        let class = decode_class(self.class, peer)?;
        let n = self.num_faces as usize;
        if n != class.num_faces() as usize {
            return Err(MeshForestError::CommError {
                neighbor: peer,
                message: format!("tree record with {n} faces for class {class:?}"),
            });
        }
        let faces = self.faces[..n]
            .iter()
            .map(|f| {
                (f.present != 0).then(|| FaceLink {
                    tree: TreeId::new(u64::from_le(f.neighbor_le)),
                    face: f.face,
                    orientation: f.orientation,
                })
            })
            .collect();
        Ok(Tree {
            id: TreeId::new(u64::from_le(self.id_le)),
            class,
            faces,
        })
    }
}

/// (tree id, class) pair used to assemble the replicated class table.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct WireTreeClass {
    pub id_le: u64,
    pub class: u8,
    pub _pad: [u8; 7],
}

impl WireTreeClass {
    pub fn new(id: TreeId, class: ElementClass) -> Self {
        Self {
            id_le: id.get().to_le(),
            class: class.as_u8(),
            _pad: [0; 7],
        }
    }
    pub fn id(&self) -> TreeId {
        TreeId::new(u64::from_le(self.id_le))
    }
    pub fn class(&self, peer: usize) -> Result<ElementClass, MeshForestError> {
        decode_class(self.class, peer)
    }
}

/// One face join as described to a coarse-mesh builder.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct WireJoin {
    pub a_le: u64,
    pub b_le: u64,
    pub face_a: u8,
    pub face_b: u8,
    pub orientation: u8,
    pub _pad: [u8; 5],
}

impl WireJoin {
    pub fn new(a: TreeId, face_a: u8, b: TreeId, face_b: u8, orientation: u8) -> Self {
        Self {
            a_le: a.get().to_le(),
            b_le: b.get().to_le(),
            face_a,
            face_b,
            orientation,
            _pad: [0; 5],
        }
    }
    pub fn a(&self) -> TreeId {
        TreeId::new(u64::from_le(self.a_le))
    }
    pub fn b(&self) -> TreeId {
        TreeId::new(u64::from_le(self.b_le))
    }
}

/// Half-open `[first, end)` range; `first == end` is empty.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct WireRange {
    pub first_le: u64,
    pub end_le: u64,
}
impl WireRange {
    pub fn new(first: u64, end: u64) -> Self {
        Self {
            first_le: first.to_le(),
            end_le: end.to_le(),
        }
    }
    pub fn first(&self) -> u64 {
        u64::from_le(self.first_le)
    }
    pub fn end(&self) -> u64 {
        u64::from_le(self.end_le)
    }
}

/// First and last local element of a rank, as (tree, leaf range) pairs.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct WireOrderProbe {
    pub count_le: u64,
    pub first_tree_le: u64,
    pub first_leaf_start_le: u64,
    pub last_tree_le: u64,
    pub last_leaf_end_le: u64,
}
impl WireOrderProbe {
    pub fn new(count: u64, first: (u64, u64), last: (u64, u64)) -> Self {
        Self {
            count_le: count.to_le(),
            first_tree_le: first.0.to_le(),
            first_leaf_start_le: first.1.to_le(),
            last_tree_le: last.0.to_le(),
            last_leaf_end_le: last.1.to_le(),
        }
    }
    pub fn count(&self) -> u64 {
        u64::from_le(self.count_le)
    }
    pub fn first(&self) -> (u64, u64) {
        (
            u64::from_le(self.first_tree_le),
            u64::from_le(self.first_leaf_start_le),
        )
    }
    pub fn last(&self) -> (u64, u64) {
        (
            u64::from_le(self.last_tree_le),
            u64::from_le(self.last_leaf_end_le),
        )
    }
}

const_assert_eq!(size_of::<WireHdr>(), 8);
const_assert_eq!(size_of::<WireU64>(), 8);
const_assert_eq!(size_of::<WireElement>(), 24);
const_assert_eq!(size_of::<WireFace>(), 16);
const_assert_eq!(size_of::<WireTree>(), 16 + 16 * ElementClass::MAX_FACES);
const_assert_eq!(size_of::<WireTreeClass>(), 16);
const_assert_eq!(size_of::<WireJoin>(), 24);
const_assert_eq!(size_of::<WireRange>(), 16);
const_assert_eq!(size_of::<WireOrderProbe>(), 40);

fn decode_class(raw: u8, peer: usize) -> Result<ElementClass, MeshForestError> {
    ElementClass::from_u8(raw).ok_or_else(|| MeshForestError::CommError {
        neighbor: peer,
        message: format!("unknown element class tag {raw}"),
    })
}

/// Header plus records, ready to hand to `isend`.
pub fn encode_frame<T: Pod>(kind: u16, records: &[T]) -> Vec<u8> {
    let hdr = WireHdr::new(kind, records.len());
    let mut buf = Vec::with_capacity(size_of::<WireHdr>() + size_of::<T>() * records.len());
    buf.extend_from_slice(cast_slice(std::slice::from_ref(&hdr)));
    buf.extend_from_slice(cast_slice(records));
    buf
}

/// Validate header and length of a frame received from `peer`, then copy the
/// records out.
pub fn decode_frame<T: Pod>(
    expected_kind: u16,
    bytes: &[u8],
    peer: usize,
) -> Result<Vec<T>, MeshForestError> {
    let hdr_len = size_of::<WireHdr>();
    if bytes.len() < hdr_len {
        return Err(MeshForestError::CommError {
            neighbor: peer,
            message: format!("short frame: {} bytes", bytes.len()),
        });
    }
    let mut hdr = WireHdr::zeroed();
    cast_slice_mut(std::slice::from_mut(&mut hdr)).copy_from_slice(&bytes[..hdr_len]);
    if hdr.version() != WIRE_VERSION {
        return Err(MeshForestError::CommError {
            neighbor: peer,
            message: format!("wire version {} (expected {WIRE_VERSION})", hdr.version()),
        });
    }
    if hdr.kind() != expected_kind {
        return Err(MeshForestError::CollectiveMismatch(format!(
            "rank {peer} sent record kind {} while kind {expected_kind} was expected",
            hdr.kind()
        )));
    }
    let body = &bytes[hdr_len..];
    let expected = hdr.count() * size_of::<T>();
    if body.len() != expected {
        return Err(MeshForestError::CommError {
            neighbor: peer,
            message: format!("expected {expected} payload bytes, got {}", body.len()),
        });
    }
    let mut out = vec![T::zeroed(); hdr.count()];
    cast_slice_mut(&mut out).copy_from_slice(body);
    Ok(out)
}
