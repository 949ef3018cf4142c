//! Stage 1 of every round: exchange one count with each neighbor.
//!
//! Sizes are exchanged in a separate round trip so receive buffers can be
//! allocated to their exact length before the payload round.

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{WireCount, cast_slice, cast_slice_mut};
use crate::compgrid_error::CompGridError;
use std::collections::HashMap;

/// Send `count` to each `(peer, count)` in `outgoing` and receive one count from
/// every rank in `incoming`. Returns `peer -> count` once all receives completed.
pub fn exchange_counts<C>(
    outgoing: &[(usize, usize)],
    incoming: &[usize],
    comm: &C,
    tag: CommTag,
) -> Result<HashMap<usize, usize>, CompGridError>
where
    C: Communicator,
{
    // 1) post all receives
    let mut recv_size = Vec::with_capacity(incoming.len());
    for &nbr in incoming {
        let mut cnt = WireCount::new(0);
        let h = comm.irecv(
            nbr,
            tag.as_u16(),
            cast_slice_mut(std::slice::from_mut(&mut cnt)),
        );
        recv_size.push((nbr, h));
    }

    // 2) post all sends
    let mut pending_sends = Vec::with_capacity(outgoing.len());
    for &(nbr, n) in outgoing {
        let count = WireCount::new(n);
        pending_sends.push(comm.isend(
            nbr,
            tag.as_u16(),
            cast_slice(std::slice::from_ref(&count)),
        ));
    }

    // 3) wait for all recvs, collect counts (but do not early-return)
    let mut sizes_in = HashMap::with_capacity(incoming.len());
    let mut maybe_err = None;
    for (nbr, h) in recv_size {
        match h.wait() {
            Some(data) if data.len() == std::mem::size_of::<WireCount>() => {
                if maybe_err.is_none() {
                    let mut cnt = WireCount::new(0);
                    cast_slice_mut(std::slice::from_mut(&mut cnt)).copy_from_slice(&data);
                    sizes_in.insert(nbr, cnt.get());
                }
            }
            Some(data) if maybe_err.is_none() => {
                maybe_err = Some(CompGridError::comm(
                    nbr,
                    format!(
                        "expected {} bytes for size header, got {}",
                        std::mem::size_of::<WireCount>(),
                        data.len()
                    ),
                ));
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(CompGridError::comm(
                    nbr,
                    format!("failed to receive size from rank {nbr}"),
                ));
            }
            _ => {} // already have an error; just drain
        }
    }

    // 4) always drain all send handles before returning
    for send in pending_sends {
        let _ = send.wait();
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(sizes_in),
    }
}
