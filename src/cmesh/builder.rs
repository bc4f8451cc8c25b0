//! `CoarseMeshBuilder`: init → set_* → commit for coarse meshes.
//!
//! A builder has exactly one topology source: either tree classes and joins set
//! on it directly, or a committed base mesh via [`CoarseMeshBuilder::set_derive`].
//! Input errors are reported by `commit` before any communication, except in
//! range mode: there every rank's classes and joins are gathered first and the
//! merged description is validated identically on all ranks.

use crate::algs::collective::allgather_records;
use crate::algs::communicator::Communicator;
use crate::algs::wire::{WireJoin, WireRange, WireTreeClass, kind};
use crate::cmesh::partition::{
    PartitionTable, TreeRange, redistribute_trees, uniform_boundary, uniform_tree_offsets,
};
use crate::cmesh::tree::{FaceLink, Tree, TreeId};
use crate::cmesh::{CoarseMesh, CoarseMeshData};
use crate::mesh_error::MeshForestError;
use crate::scheme::ElementClass;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
enum PartitionRequest {
    Range(TreeRange),
    Offsets(Vec<u64>),
    Uniform(u8),
}

#[derive(Clone, Copy, Debug)]
struct Join {
    a: TreeId,
    face_a: u8,
    b: TreeId,
    face_b: u8,
    orientation: u8,
}

/// Mutable coarse mesh under construction.
#[derive(Debug, Default)]
pub struct CoarseMeshBuilder {
    classes: BTreeMap<TreeId, ElementClass>,
    joins: Vec<Join>,
    partition: Option<PartitionRequest>,
    derive: Option<CoarseMesh>,
    error: Option<MeshForestError>,
}

impl CoarseMeshBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn fail(&mut self, err: MeshForestError) {
        self.error.get_or_insert(err);
    }

    pub fn set_tree_class(&mut self, tree: TreeId, class: ElementClass) -> &mut Self {
        match self.classes.insert(tree, class) {
            Some(prev) if prev != class => self.fail(MeshForestError::config(format!(
                "tree {tree} set to {class:?} after {prev:?}"
            ))),
            _ => {}
        }
        self
    }

    /// Join face `face_a` of tree `a` with face `face_b` of tree `b`. Both sides
    /// are recorded.
    pub fn set_join(
        &mut self,
        a: TreeId,
        face_a: u8,
        b: TreeId,
        face_b: u8,
        orientation: u8,
    ) -> &mut Self {
        self.joins.push(Join {
            a,
            face_a,
            b,
            face_b,
            orientation,
        });
        self
    }

    fn request(&mut self, req: PartitionRequest) -> &mut Self {
        if self.partition.is_some() {
            self.fail(MeshForestError::config("more than one partition requested"));
        } else {
            self.partition = Some(req);
        }
        self
    }

    /// This rank holds trees `first..=last`; `first > last` holds none.
    /// Each rank describes the classes of (at least) its own trees; joins set on
    /// any rank apply to the whole mesh and must agree across ranks.
    pub fn set_partition_range(&mut self, first: u64, last: u64) -> &mut Self {
        let range = if first > last {
            TreeRange::empty()
        } else {
            TreeRange::new(first, last + 1)
        };
        self.request(PartitionRequest::Range(range))
    }

    /// Rank `r` holds trees `[offsets[r], offsets[r + 1])`. Identical on all ranks.
    pub fn set_partition_offsets(&mut self, offsets: &[u64]) -> &mut Self {
        self.request(PartitionRequest::Offsets(offsets.to_vec()))
    }

    /// Ranks hold the trees their share of a uniform `level` forest touches.
    pub fn set_partition_uniform(&mut self, level: u8) -> &mut Self {
        self.request(PartitionRequest::Uniform(level))
    }

    /// Take topology from the committed `base`; a partition request is required.
    pub fn set_derive(&mut self, base: &CoarseMesh) -> &mut Self {
        if self.derive.is_some() {
            self.fail(MeshForestError::config("derive source set twice"));
        }
        self.derive = Some(base.clone());
        self
    }

    /// Validate and finalize. Collective when a range partition or a derive
    /// source is configured.
    pub fn commit<C: Communicator>(self, comm: &C) -> Result<CoarseMesh, MeshForestError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let (rank, size) = (comm.rank(), comm.size());

        let cmesh = if let Some(base) = self.derive {
            if !self.classes.is_empty() || !self.joins.is_empty() {
                return Err(MeshForestError::config(
                    "derive cannot be combined with tree classes or joins",
                ));
            }
            let req = self
                .partition
                .ok_or_else(|| MeshForestError::config("derive requires a partition request"))?;
            if base.size() != size {
                return Err(MeshForestError::config(format!(
                    "base mesh lives on {} ranks, communicator has {size}",
                    base.size()
                )));
            }
            let classes = base.classes().clone();
            let table = resolve_partition(comm, &req, &classes)?;
            let trees = redistribute_trees(comm, base.partition_table(), base.local_trees(), &table)?;
            CoarseMesh::from_data(CoarseMeshData {
                classes,
                partition: Some(table),
                trees,
                derived_from: Some(base.downgrade()),
                rank,
                size,
            })
        } else {
            let (described, joins) = match &self.partition {
                Some(PartitionRequest::Range(_)) => (
                    gather_classes(comm, &self.classes)?,
                    gather_joins(comm, &self.joins)?,
                ),
                _ => (self.classes, self.joins),
            };
            let classes = Arc::new(dense_classes(&described)?);
            let table = match &self.partition {
                Some(req) => Some(resolve_partition(comm, req, &classes)?),
                None => None,
            };
            let links = validate_joins(&classes, &joins)?;
            let range = table
                .as_ref()
                .map_or(TreeRange::new(0, classes.len() as u64), |t| t.range(rank));
            let trees = range
                .iter()
                .map(|id| {
                    let mut tree = Tree::new(id, classes[id.index()]);
                    for (face, slot) in tree.faces.iter_mut().enumerate() {
                        *slot = links.get(&(id, face as u8)).copied();
                    }
                    tree
                })
                .collect();
            CoarseMesh::from_data(CoarseMeshData {
                classes,
                partition: table,
                trees,
                derived_from: None,
                rank,
                size,
            })
        };

        log::debug!(
            "[rank {rank}] committed coarse mesh: {} trees, local {:?}, partitioned={}",
            cmesh.num_trees(),
            cmesh.local_range(),
            cmesh.is_partitioned()
        );
        Ok(cmesh)
    }
}

/// Merge every rank's described tree classes. Disagreement is a collective mismatch.
fn gather_classes<C: Communicator>(
    comm: &C,
    local: &BTreeMap<TreeId, ElementClass>,
) -> Result<BTreeMap<TreeId, ElementClass>, MeshForestError> {
    let records: Vec<WireTreeClass> = local
        .iter()
        .map(|(&id, &class)| WireTreeClass::new(id, class))
        .collect();
    let mut merged = BTreeMap::new();
    for (peer, part) in allgather_records(comm, kind::TREE_CLASS, &records)?
        .into_iter()
        .enumerate()
    {
        for rec in part {
            let class = rec.class(peer)?;
            match merged.insert(rec.id(), class) {
                Some(prev) if prev != class => {
                    return Err(MeshForestError::CollectiveMismatch(format!(
                        "tree {} described as both {prev:?} and {class:?}",
                        rec.id()
                    )));
                }
                _ => {}
            }
        }
    }
    Ok(merged)
}

/// Every rank's joins, concatenated in rank order so all ranks validate the
/// same sequence and reach the same verdict.
fn gather_joins<C: Communicator>(comm: &C, local: &[Join]) -> Result<Vec<Join>, MeshForestError> {
    let records: Vec<WireJoin> = local
        .iter()
        .map(|j| WireJoin::new(j.a, j.face_a, j.b, j.face_b, j.orientation))
        .collect();
    Ok(allgather_records(comm, kind::JOIN, &records)?
        .into_iter()
        .flatten()
        .map(|w| Join {
            a: w.a(),
            face_a: w.face_a,
            b: w.b(),
            face_b: w.face_b,
            orientation: w.orientation,
        })
        .collect())
}

/// Class table for trees `0..n`; every id must be described.
fn dense_classes(
    described: &BTreeMap<TreeId, ElementClass>,
) -> Result<Vec<ElementClass>, MeshForestError> {
    described
        .iter()
        .enumerate()
        .map(|(i, (&id, &class))| {
            if id.index() == i {
                Ok(class)
            } else {
                Err(MeshForestError::config(format!("tree {i} has no class")))
            }
        })
        .collect()
}

fn resolve_partition<C: Communicator>(
    comm: &C,
    req: &PartitionRequest,
    classes: &[ElementClass],
) -> Result<PartitionTable, MeshForestError> {
    let num_trees = classes.len() as u64;
    let size = comm.size();
    match req {
        PartitionRequest::Range(range) => {
            let all = allgather_records(comm, kind::RANGE, &[WireRange::new(range.first, range.end)])?;
            let ranges = all
                .into_iter()
                .enumerate()
                .map(|(peer, part)| match part.as_slice() {
                    [one] => Ok(TreeRange::new(one.first(), one.end())),
                    _ => Err(MeshForestError::CommError {
                        neighbor: peer,
                        message: format!("expected one range, got {}", part.len()),
                    }),
                })
                .collect::<Result<Vec<_>, _>>()?;
            PartitionTable::new(num_trees, ranges)
        }
        PartitionRequest::Offsets(offsets) => {
            PartitionTable::from_offsets(num_trees, offsets, size)
        }
        PartitionRequest::Uniform(level) => {
            let tree_offsets =
                uniform_tree_offsets(classes, *level, |c| Ok(c.num_children() as u64))?;
            let total = tree_offsets.last().copied().unwrap_or(0);
            let element_offsets: Vec<u64> = (0..=size)
                .map(|r| uniform_boundary(total, size, r))
                .collect();
            PartitionTable::from_element_offsets(&tree_offsets, &element_offsets)
        }
    }
}

/// Check every join against the class table and return the symmetric
/// `(tree, face) → link` map.
fn validate_joins(
    classes: &[ElementClass],
    joins: &[Join],
) -> Result<BTreeMap<(TreeId, u8), FaceLink>, MeshForestError> {
    let class_of = |t: TreeId, face: u8, other: TreeId| {
        classes.get(t.index()).copied().ok_or_else(|| {
            MeshForestError::connectivity(other, face, format!("neighbor tree {t} does not exist"))
        })
    };
    let mut links = BTreeMap::new();
    for j in joins {
        let class_a = class_of(j.a, j.face_a, j.a)?;
        let class_b = class_of(j.b, j.face_a, j.a)?;
        let shape_a = class_a.face_class(j.face_a).ok_or_else(|| {
            MeshForestError::connectivity(j.a, j.face_a, format!("{class_a:?} has no such face"))
        })?;
        let shape_b = class_b.face_class(j.face_b).ok_or_else(|| {
            MeshForestError::connectivity(j.b, j.face_b, format!("{class_b:?} has no such face"))
        })?;
        if j.a == j.b && j.face_a == j.face_b {
            return Err(MeshForestError::connectivity(j.a, j.face_a, "self join"));
        }
        if shape_a != shape_b {
            return Err(MeshForestError::connectivity(
                j.a,
                j.face_a,
                format!("{shape_a:?} face joined to {shape_b:?} face of tree {}", j.b),
            ));
        }
        for (tree, face, link) in [
            (
                j.a,
                j.face_a,
                FaceLink {
                    tree: j.b,
                    face: j.face_b,
                    orientation: j.orientation,
                },
            ),
            (
                j.b,
                j.face_b,
                FaceLink {
                    tree: j.a,
                    face: j.face_a,
                    orientation: j.orientation,
                },
            ),
        ] {
            match links.insert((tree, face), link) {
                Some(prev) if prev != link => {
                    return Err(MeshForestError::connectivity(
                        tree,
                        face,
                        format!(
                            "joined to tree {} face {} and to tree {} face {}",
                            prev.tree, prev.face, link.tree, link.face
                        ),
                    ));
                }
                _ => {}
            }
        }
    }
    Ok(links)
}
