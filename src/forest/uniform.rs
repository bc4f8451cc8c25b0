//! Uniform construction: every tree refined to one level, split evenly over ranks.
//!
//! Rank `r` receives global elements `[ceil(rN/P), ceil((r+1)N/P))`. No
//! messages are exchanged; every rank derives the same layout from the
//! replicated class table.

use crate::algs::communicator::Communicator;
use crate::cmesh::partition::{tree_of, uniform_boundary, uniform_tree_offsets};
use crate::cmesh::{CoarseMesh, TreeId};
use crate::forest::{Forest, ForestData, Fringe, LocalTree, UserData};
use crate::mesh_error::MeshForestError;
use crate::scheme::SchemeTable;

pub(crate) fn commit_uniform<C: Communicator>(
    comm: &C,
    cmesh: CoarseMesh,
    schemes: SchemeTable,
    level: u8,
    user_data: Option<UserData>,
) -> Result<Forest, MeshForestError> {
    let (rank, size) = (comm.rank(), comm.size());
    if cmesh.rank() != rank || cmesh.size() != size {
        return Err(MeshForestError::config(format!(
            "coarse mesh of rank {}/{} used with communicator rank {rank}/{size}",
            cmesh.rank(),
            cmesh.size()
        )));
    }
    let classes = cmesh.classes().clone();
    for &class in classes.iter() {
        let scheme = schemes.get(class)?;
        if level > scheme.max_level() {
            return Err(MeshForestError::config(format!(
                "level {level} exceeds max level {} of {class:?}",
                scheme.max_level()
            )));
        }
    }

    let tree_offsets = uniform_tree_offsets(&classes, level, |c| {
        Ok(schemes.get(c)?.children_count() as u64)
    })?;
    let total = tree_offsets.last().copied().unwrap_or(0);
    let element_offsets: Vec<u64> = (0..=size)
        .map(|r| uniform_boundary(total, size, r))
        .collect();

    if let Some(table) = cmesh.partition_table() {
        for r in 0..size {
            let (begin, end) = (element_offsets[r], element_offsets[r + 1]);
            if begin == end {
                continue;
            }
            let first = TreeId::new(tree_of(&tree_offsets, begin));
            let last = TreeId::new(tree_of(&tree_offsets, end - 1));
            let held = table.range(r);
            if !held.contains(first) || !held.contains(last) {
                return Err(MeshForestError::Range(format!(
                    "rank {r} needs trees [{first}, {last}] for level {level} but holds {held:?}"
                )));
            }
        }
    }

    let (begin, end) = (element_offsets[rank], element_offsets[rank + 1]);
    let mut trees = Vec::new();
    if begin < end {
        let first = tree_of(&tree_offsets, begin);
        let last = tree_of(&tree_offsets, end - 1);
        for t in first..=last {
            let id = TreeId::new(t);
            let class = classes[id.index()];
            let scheme = schemes.get(class)?;
            let tree_begin = tree_offsets[id.index()];
            let lo = begin.max(tree_begin) - tree_begin;
            let hi = end.min(tree_offsets[id.index() + 1]) - tree_begin;
            let elements = (lo..hi).map(|i| scheme.from_linear_id(level, i)).collect();
            log::trace!("[rank {rank}] uniform tree {id}: elements [{lo}, {hi})");
            trees.push(LocalTree::new(id, class, elements));
        }
    }

    Ok(Forest::from_data(ForestData {
        cmesh,
        schemes,
        trees,
        element_offsets,
        rank,
        size,
        source: None,
        user_data,
        fringe: Fringe::default(),
        adapt_stats: None,
    }))
}
