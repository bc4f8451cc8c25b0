//! Per-rank tree ranges of a partitioned coarse mesh.
//!
//! Each rank holds one contiguous half-open range of trees. Consecutive
//! non-empty ranges either meet (`next.first == prev.end`) or share exactly one
//! boundary tree (`next.first == prev.end - 1`). The authoritative holder of a
//! tree is the lowest rank whose range contains it.

use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::exchange::exchange_records;
use crate::algs::wire::{WireTree, kind};
use crate::cmesh::tree::{Tree, TreeId};
use crate::mesh_error::MeshForestError;
use crate::scheme::ElementClass;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Half-open range `[first, end)` of tree ids.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TreeRange {
    pub first: u64,
    pub end: u64,
}

impl TreeRange {
    pub fn new(first: u64, end: u64) -> Self {
        Self { first, end }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.first
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.first)
    }

    pub fn contains(&self, tree: TreeId) -> bool {
        (self.first..self.end).contains(&tree.get())
    }

    pub fn first_tree(&self) -> Option<TreeId> {
        (!self.is_empty()).then(|| TreeId::new(self.first))
    }

    pub fn last_tree(&self) -> Option<TreeId> {
        (!self.is_empty()).then(|| TreeId::new(self.end - 1))
    }

    pub fn iter(&self) -> impl Iterator<Item = TreeId> + use<> {
        (self.first..self.end.max(self.first)).map(TreeId::new)
    }
}

/// Validated tree ranges of every rank in the group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTable {
    num_trees: u64,
    ranges: Vec<TreeRange>,
}

impl PartitionTable {
    /// Validate `ranges` (one per rank) against `num_trees`.
    pub fn new(num_trees: u64, ranges: Vec<TreeRange>) -> Result<Self, MeshForestError> {
        if ranges.is_empty() {
            return Err(MeshForestError::Range("partition over zero ranks".into()));
        }
        let mut covered_end: Option<u64> = None;
        for (rank, r) in ranges.iter().enumerate() {
            if r.is_empty() {
                continue;
            }
            if r.end > num_trees {
                return Err(MeshForestError::Range(format!(
                    "rank {rank} range [{}, {}) exceeds {num_trees} trees",
                    r.first, r.end
                )));
            }
            match covered_end {
                None if r.first != 0 => {
                    return Err(MeshForestError::Range(format!(
                        "trees [0, {}) are not held by any rank",
                        r.first
                    )));
                }
                Some(prev) if r.first > prev => {
                    return Err(MeshForestError::Range(format!(
                        "gap before rank {rank}: trees [{prev}, {}) unheld",
                        r.first
                    )));
                }
                Some(prev) if r.first + 1 < prev => {
                    return Err(MeshForestError::Range(format!(
                        "rank {rank} range [{}, {}) overlaps its predecessor beyond one shared tree",
                        r.first, r.end
                    )));
                }
                _ => {}
            }
            covered_end = Some(r.end);
        }
        let covered = covered_end.unwrap_or(0);
        if covered != num_trees {
            return Err(MeshForestError::Range(format!(
                "ranges cover trees [0, {covered}) of {num_trees}"
            )));
        }
        Ok(Self { num_trees, ranges })
    }

    /// Ranges from a `P + 1` monotone offsets array; rank `r` holds
    /// `[offsets[r], offsets[r + 1])`.
    pub fn from_offsets(
        num_trees: u64,
        offsets: &[u64],
        size: usize,
    ) -> Result<Self, MeshForestError> {
        if offsets.len() != size + 1 {
            return Err(MeshForestError::Range(format!(
                "expected {} offsets for {size} ranks, got {}",
                size + 1,
                offsets.len()
            )));
        }
        if offsets.windows(2).any(|w| w[1] < w[0]) {
            return Err(MeshForestError::Range(format!(
                "offsets {offsets:?} are not monotone"
            )));
        }
        if offsets[0] != 0 || offsets[size] != num_trees {
            return Err(MeshForestError::Range(format!(
                "offsets must span [0, {num_trees}], got [{}, {}]",
                offsets[0], offsets[size]
            )));
        }
        let ranges = offsets
            .windows(2)
            .map(|w| TreeRange::new(w[0], w[1]))
            .collect();
        Self::new(num_trees, ranges)
    }

    /// Ranges of the trees touched by each rank's slice of a global element
    /// sequence. `tree_offsets[t]` is the first element of tree `t`
    /// (length `T + 1`), `element_offsets[r]` the first element of rank `r`
    /// (length `P + 1`).
    pub fn from_element_offsets(
        tree_offsets: &[u64],
        element_offsets: &[u64],
    ) -> Result<Self, MeshForestError> {
        let num_trees = tree_offsets.len().saturating_sub(1) as u64;
        let ranges = element_offsets
            .windows(2)
            .map(|w| {
                let (begin, end) = (w[0], w[1]);
                if begin >= end {
                    return TreeRange::empty();
                }
                let first = tree_of(tree_offsets, begin);
                let last = tree_of(tree_offsets, end - 1);
                TreeRange::new(first, last + 1)
            })
            .collect();
        Self::new(num_trees, ranges)
    }

    pub fn num_trees(&self) -> u64 {
        self.num_trees
    }

    pub fn size(&self) -> usize {
        self.ranges.len()
    }

    pub fn ranges(&self) -> &[TreeRange] {
        &self.ranges
    }

    pub fn range(&self, rank: usize) -> TreeRange {
        self.ranges.get(rank).copied().unwrap_or_default()
    }

    /// Lowest rank holding `tree`.
    pub fn owner(&self, tree: TreeId) -> Option<usize> {
        self.ranges.iter().position(|r| r.contains(tree))
    }

    /// All ranks holding `tree` (more than one only for shared boundary trees).
    pub fn holders(&self, tree: TreeId) -> impl Iterator<Item = usize> + '_ {
        self.ranges
            .iter()
            .enumerate()
            .filter(move |(_, r)| r.contains(tree))
            .map(|(rank, _)| rank)
    }
}

/// Tree containing global element `element` (last tree whose first element is
/// not past it).
pub(crate) fn tree_of(tree_offsets: &[u64], element: u64) -> u64 {
    let idx = tree_offsets.partition_point(|&off| off <= element);
    idx.saturating_sub(1) as u64
}

/// `ceil(rank * total / size)`: first element of `rank` in a balanced split.
pub fn uniform_boundary(total: u64, size: usize, rank: usize) -> u64 {
    if size == 0 {
        return 0;
    }
    let num = total as u128 * rank as u128;
    num.div_ceil(size as u128) as u64
}

/// First global element of every tree (length `T + 1`) when tree `t` is
/// refined uniformly to `level`; `children(class)` is the branching factor.
pub(crate) fn uniform_tree_offsets<F>(
    classes: &[ElementClass],
    level: u8,
    mut children: F,
) -> Result<Vec<u64>, MeshForestError>
where
    F: FnMut(ElementClass) -> Result<u64, MeshForestError>,
{
    let mut offsets = Vec::with_capacity(classes.len() + 1);
    let mut acc = 0u64;
    offsets.push(acc);
    for &class in classes {
        let per_tree = children(class)?
            .checked_pow(level as u32)
            .ok_or_else(|| {
                MeshForestError::config(format!(
                    "uniform level {level} overflows the element count of a {class:?} tree"
                ))
            })?;
        acc = acc.checked_add(per_tree).ok_or_else(|| {
            MeshForestError::config(format!("uniform level {level} overflows the global element count"))
        })?;
        offsets.push(acc);
    }
    Ok(offsets)
}

/// Move tree records so each rank ends up with the trees of `target`.
///
/// `base` is the source layout (`None` = every rank holds every tree) and
/// `local` the records this rank holds under it, in id order. Trees a rank
/// already holds are kept; the rest are sent by their authoritative holder in
/// `base`.
pub(crate) fn redistribute_trees<C: Communicator>(
    comm: &C,
    base: Option<&PartitionTable>,
    local: &[Tree],
    target: &PartitionTable,
) -> Result<Vec<Tree>, MeshForestError> {
    let me = comm.rank();
    let held = |rank: usize, t: TreeId| base.is_none_or(|b| b.range(rank).contains(t));
    let source_of = |t: TreeId| base.and_then(|b| b.owner(t));

    let mut outgoing: BTreeMap<usize, Vec<WireTree>> = BTreeMap::new();
    for (dst, range) in target.ranges().iter().enumerate() {
        if dst == me {
            continue;
        }
        for t in range.iter() {
            if !held(dst, t) && source_of(t) == Some(me) {
                let tree = find_tree(local, t)?;
                outgoing.entry(dst).or_default().push(WireTree::new(tree));
            }
        }
    }

    let mut expected: BTreeMap<usize, usize> = BTreeMap::new();
    for t in target.range(me).iter() {
        if !held(me, t) {
            let src = source_of(t).ok_or(MeshForestError::UnknownTree(t))?;
            *expected.entry(src).or_default() += 1;
        }
    }
    let sources: Vec<usize> = expected.keys().copied().collect();

    log::trace!(
        "[rank {me}] tree transfer: sending to {:?}, receiving from {sources:?}",
        outgoing.keys().collect::<Vec<_>>()
    );

    let received = exchange_records(comm, CommTag::TREES, kind::TREE, &outgoing, &sources)?;

    let mut incoming: BTreeMap<TreeId, Tree> = BTreeMap::new();
    for (peer, records) in &received {
        if records.len() != expected[peer] {
            return Err(MeshForestError::CollectiveMismatch(format!(
                "rank {peer} sent {} tree records, expected {}",
                records.len(),
                expected[peer]
            )));
        }
        for rec in records {
            let tree = rec.tree(*peer)?;
            incoming.insert(tree.id, tree);
        }
    }

    target
        .range(me)
        .iter()
        .map(|t| {
            if held(me, t) {
                find_tree(local, t).cloned()
            } else {
                incoming.remove(&t).ok_or(MeshForestError::UnknownTree(t))
            }
        })
        .collect()
}

fn find_tree(local: &[Tree], t: TreeId) -> Result<&Tree, MeshForestError> {
    local
        .binary_search_by_key(&t, |tree| tree.id)
        .map(|i| &local[i])
        .map_err(|_| MeshForestError::UnknownTree(t))
}
