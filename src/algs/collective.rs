//! Group-wide collectives assembled from the point-to-point exchange.
//!
//! Every rank sends its contribution to every other rank under
//! [`CommTag::ALLGATHER`]. Per-pair FIFO delivery keeps consecutive
//! collectives from mixing.

use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::exchange::exchange_records;
use crate::algs::wire::{WireU64, kind};
use crate::mesh_error::MeshForestError;
use bytemuck::Pod;
use std::collections::BTreeMap;

/// Gather every rank's `local` records; result is indexed by rank.
pub fn allgather_records<T, C>(
    comm: &C,
    kind: u16,
    local: &[T],
) -> Result<Vec<Vec<T>>, MeshForestError>
where
    T: Pod,
    C: Communicator,
{
    let size = comm.size();
    let peers: Vec<usize> = (0..size).collect();
    let outgoing: BTreeMap<usize, Vec<T>> =
        peers.iter().map(|&p| (p, local.to_vec())).collect();
    let mut received = exchange_records(comm, CommTag::ALLGATHER, kind, &outgoing, &peers)?;
    (0..size)
        .map(|r| {
            received.remove(&r).ok_or_else(|| MeshForestError::CommError {
                neighbor: r,
                message: "missing allgather contribution".into(),
            })
        })
        .collect()
}

/// Gather one `u64` per rank.
pub fn allgather_u64<C: Communicator>(comm: &C, value: u64) -> Result<Vec<u64>, MeshForestError> {
    let parts = allgather_records(comm, kind::U64, &[WireU64::of(value)])?;
    parts
        .into_iter()
        .enumerate()
        .map(|(r, v)| match v.as_slice() {
            [one] => Ok(one.get()),
            _ => Err(MeshForestError::CommError {
                neighbor: r,
                message: format!("expected one value, got {}", v.len()),
            }),
        })
        .collect()
}

pub fn allreduce_sum_u64<C: Communicator>(comm: &C, value: u64) -> Result<u64, MeshForestError> {
    let all = allgather_u64(comm, value)?;
    all.iter()
        .try_fold(0u64, |acc, &v| acc.checked_add(v))
        .ok_or_else(|| MeshForestError::Range("global sum overflows u64".into()))
}

/// Offsets table of length `P + 1`: entry `r` is the sum of the counts of
/// ranks `< r`, the last entry is the global total.
pub fn exclusive_offsets<C: Communicator>(
    comm: &C,
    count: u64,
) -> Result<Vec<u64>, MeshForestError> {
    offsets_from_counts(&allgather_u64(comm, count)?)
}

pub(crate) fn offsets_from_counts(counts: &[u64]) -> Result<Vec<u64>, MeshForestError> {
    let mut offsets = Vec::with_capacity(counts.len() + 1);
    let mut acc = 0u64;
    offsets.push(acc);
    for &c in counts {
        acc = acc
            .checked_add(c)
            .ok_or_else(|| MeshForestError::Range("prefix sum overflows u64".into()))?;
        offsets.push(acc);
    }
    Ok(offsets)
}
