//! Partition: move elements between ranks so each holds a balanced share.
//!
//! New boundaries split the global sequence evenly by count, or by summed
//! weight when a [`WeightFn`] is given. Elements keep their global order; only
//! ownership moves. The coarse mesh is repartitioned in lockstep so every rank
//! holds the trees its new elements live in.
//!
//! With boundary slack each rank additionally receives up to
//! `max_children_count - 1` elements on either side of its range as a
//! [`Fringe`], which lets the next adapt coarsen families that straddle a rank
//! boundary without further communication.

use crate::algs::collective::{allgather_records, allgather_u64};
use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::exchange::exchange_records;
use crate::algs::wire::{WireElement, WireRange, kind};
use crate::cmesh::partition::uniform_boundary;
use crate::cmesh::{CoarseMeshBuilder, TreeId};
use crate::forest::{Forest, ForestData, Fringe, LocalTree, UserData};
use crate::mesh_error::MeshForestError;
use crate::scheme::Element;
use itertools::Itertools;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Per-element load used for weighted partitioning. A weight of zero counts as one.
pub type WeightFn = Arc<dyn Fn(TreeId, &Element) -> u64 + Send + Sync>;

/// Wrap a closure as a [`WeightFn`].
pub fn weight_fn<F>(f: F) -> WeightFn
where
    F: Fn(TreeId, &Element) -> u64 + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Clip `[lo, hi)` to `[lo2, hi2)`.
fn intersect((lo, hi): (u64, u64), (lo2, hi2): (u64, u64)) -> (u64, u64) {
    let lo = lo.max(lo2);
    (lo, hi.min(hi2).max(lo))
}

/// Global index range rank `r` receives: its core widened by `slack` on both
/// sides and clipped to the sequence. Ranks without a core receive nothing.
fn extended_range(bounds: &[u64], r: usize, slack: u64) -> (u64, u64) {
    let (begin, end) = (bounds[r], bounds[r + 1]);
    if begin == end {
        return (begin, begin);
    }
    let total = bounds[bounds.len() - 1];
    (begin.saturating_sub(slack), (end + slack).min(total))
}

/// Weighted boundaries: `b[r]` is one past the element whose cumulative weight
/// first reaches `r * W / P`.
fn weighted_bounds<C: Communicator>(
    comm: &C,
    source: &Forest,
    weight: &WeightFn,
) -> Result<Vec<u64>, MeshForestError> {
    let (rank, size) = (comm.rank(), comm.size());
    let mut clamped = 0u64;
    let weights: Vec<u64> = source
        .iter_elements()
        .map(|(tree, e)| match weight(tree, e) {
            0 => {
                clamped += 1;
                1
            }
            w => w,
        })
        .collect();
    if clamped > 0 {
        log::warn!("[rank {rank}] {clamped} element weights of zero counted as one");
    }
    let local_sum = weights
        .iter()
        .try_fold(0u64, |acc, &w| acc.checked_add(w))
        .ok_or_else(|| MeshForestError::Range("local weight sum overflows u64".into()))?;

    let sums = allgather_u64(comm, local_sum)?;
    let mut before = 0u128;
    for &s in &sums[..rank] {
        before += s as u128;
    }
    let total: u128 = sums.iter().map(|&s| s as u128).sum();
    let p = size as u128;

    let mut claimed = Vec::new();
    if total > 0 {
        let first = source.first_global_element();
        let mut next = 1usize;
        let mut cum = before;
        for (i, &w) in weights.iter().enumerate() {
            let after = cum + w as u128;
            while next < size && (next as u128) * total <= after * p {
                if (next as u128) * total > cum * p {
                    let boundary = first + i as u64 + 1;
                    claimed.push(WireRange::new(next as u64, boundary));
                }
                next += 1;
            }
            cum = after;
        }
    }

    let total_elements = source.num_global_elements();
    let mut bounds = vec![None; size + 1];
    bounds[0] = Some(0);
    bounds[size] = Some(total_elements);
    for (peer, part) in allgather_records(comm, kind::RANGE, &claimed)?
        .into_iter()
        .enumerate()
    {
        for rec in part {
            let r = rec.first() as usize;
            if r == 0 || r >= size || bounds[r].is_some() {
                return Err(MeshForestError::CollectiveMismatch(format!(
                    "rank {peer} claimed boundary {r} twice or out of range"
                )));
            }
            bounds[r] = Some(rec.end());
        }
    }
    if total == 0 {
        return Ok(vec![0; size + 1]);
    }
    bounds
        .into_iter()
        .enumerate()
        .map(|(r, b)| {
            b.ok_or_else(|| {
                MeshForestError::CollectiveMismatch(format!("no rank claimed boundary {r}"))
            })
        })
        .collect()
}

pub(crate) fn commit_partition<C: Communicator>(
    comm: &C,
    source: &Forest,
    slack: bool,
    weight: Option<&WeightFn>,
    user_data: Option<UserData>,
) -> Result<Forest, MeshForestError> {
    source.check_comm(comm)?;
    let (me, size) = (comm.rank(), comm.size());
    let old = source.element_offsets();
    let total = source.num_global_elements();

    let bounds: Vec<u64> = match weight {
        Some(w) => weighted_bounds(comm, source, w)?,
        None => (0..=size).map(|r| uniform_boundary(total, size, r)).collect(),
    };
    let slack = if slack {
        source.schemes().max_children_count().saturating_sub(1) as u64
    } else {
        0
    };
    log::trace!("[rank {me}] partition boundaries {bounds:?}, slack {slack}");

    // ship every element to each rank whose widened range covers it
    let local: Vec<WireElement> = source
        .iter_elements()
        .map(|(tree, e)| WireElement::new(tree, e))
        .collect();
    let mine = (old[me], old[me + 1]);
    let mut outgoing: BTreeMap<usize, Vec<WireElement>> = BTreeMap::new();
    for dst in 0..size {
        let (lo, hi) = intersect(mine, extended_range(&bounds, dst, slack));
        if lo < hi {
            let slice = &local[(lo - mine.0) as usize..(hi - mine.0) as usize];
            outgoing.insert(dst, slice.to_vec());
        }
    }

    let want = extended_range(&bounds, me, slack);
    let mut expected: BTreeMap<usize, u64> = BTreeMap::new();
    for src in 0..size {
        let (lo, hi) = intersect(want, (old[src], old[src + 1]));
        if lo < hi {
            expected.insert(src, hi - lo);
        }
    }
    let sources: Vec<usize> = expected.keys().copied().collect();
    let received = exchange_records(comm, CommTag::ELEMENTS, kind::ELEMENT, &outgoing, &sources)?;

    let mut incoming = Vec::with_capacity((want.1 - want.0) as usize);
    for (peer, records) in &received {
        if records.len() as u64 != expected[peer] {
            return Err(MeshForestError::CollectiveMismatch(format!(
                "rank {peer} sent {} elements, expected {}",
                records.len(),
                expected[peer]
            )));
        }
        for rec in records {
            incoming.push((rec.tree(), rec.element(*peer)?));
        }
    }

    let (begin, end) = (bounds[me], bounds[me + 1]);
    let after = incoming.split_off((end - want.0) as usize);
    let core = incoming.split_off((begin - want.0) as usize);
    let fringe = Fringe {
        before: incoming,
        after,
    };

    let cmesh = source.cmesh();
    let mut trees = Vec::new();
    for (id, group) in &core.into_iter().chunk_by(|(tree, _)| *tree) {
        let class = cmesh.tree_class(id)?;
        trees.push(LocalTree::new(id, class, group.map(|(_, e)| e).collect()));
    }

    let mut builder = CoarseMeshBuilder::new();
    builder.set_derive(cmesh);
    match (trees.first(), trees.last()) {
        (Some(first), Some(last)) => builder.set_partition_range(first.id.get(), last.id.get()),
        _ => builder.set_partition_range(1, 0),
    };
    let cmesh = builder.commit(comm)?;

    log::debug!(
        "[rank {me}] partitioned forest: elements [{begin}, {end}), trees {:?}, fringe {}+{}",
        cmesh.local_range(),
        fringe.before.len(),
        fringe.after.len()
    );

    Ok(Forest::from_data(ForestData {
        cmesh,
        schemes: source.schemes().clone(),
        trees,
        element_offsets: bounds,
        rank: me,
        size,
        source: Some(source.downgrade()),
        user_data: user_data.or_else(|| source.user_data_handle().cloned()),
        fringe,
        adapt_stats: None,
    }))
}
