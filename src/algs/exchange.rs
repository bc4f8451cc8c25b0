//! Point-to-point record exchange between an explicit set of peers.
//!
//! Receives are posted first, then sends; every receive handle is waited on
//! and every send handle drained before returning, even when an earlier
//! frame failed to decode. The first error wins.

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{decode_frame, encode_frame};
use crate::mesh_error::MeshForestError;
use bytemuck::Pod;
use std::collections::BTreeMap;

/// Send `outgoing[peer]` to each peer and receive one frame from each rank in
/// `sources`. Messages addressed to this rank are looped back locally.
pub fn exchange_records<T, C>(
    comm: &C,
    tag: CommTag,
    kind: u16,
    outgoing: &BTreeMap<usize, Vec<T>>,
    sources: &[usize],
) -> Result<BTreeMap<usize, Vec<T>>, MeshForestError>
where
    T: Pod,
    C: Communicator,
{
    let me = comm.rank();
    let size = comm.size();
    if let Some(&bad) = outgoing
        .keys()
        .chain(sources.iter())
        .find(|&&peer| peer >= size)
    {
        return Err(MeshForestError::CommError {
            neighbor: bad,
            message: format!("peer rank outside group of {size}"),
        });
    }

    // 1) post all receives
    let mut pending_recvs = Vec::with_capacity(sources.len());
    for &peer in sources.iter().filter(|&&p| p != me) {
        pending_recvs.push((peer, comm.irecv(peer, tag.as_u16())));
    }

    // 2) post all sends
    let mut pending_sends = Vec::with_capacity(outgoing.len());
    for (&peer, records) in outgoing.iter().filter(|(p, _)| **p != me) {
        let frame = encode_frame(kind, records);
        pending_sends.push(comm.isend(peer, tag.as_u16(), &frame));
    }

    let mut received = BTreeMap::new();
    if sources.contains(&me) {
        received.insert(me, outgoing.get(&me).cloned().unwrap_or_default());
    }

    // 3) wait for all receives without early return
    let mut maybe_err = None;
    for (peer, h) in pending_recvs {
        match h.wait() {
            Some(bytes) if maybe_err.is_none() => match decode_frame::<T>(kind, &bytes, peer) {
                Ok(records) => {
                    received.insert(peer, records);
                }
                Err(e) => maybe_err = Some(e),
            },
            None if maybe_err.is_none() => {
                maybe_err = Some(MeshForestError::CommError {
                    neighbor: peer,
                    message: format!("no frame received from rank {peer}"),
                });
            }
            _ => {}
        }
    }

    // 4) always drain sends
    for send in pending_sends {
        let _ = send.wait();
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(received),
    }
}
