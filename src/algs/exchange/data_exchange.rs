//! Stage 2 of every round: exchange the word buffers themselves.

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{WireCount, WireWord, cast_slice, cast_slice_mut, words_from_bytes};
use crate::compgrid_error::CompGridError;

/// Send each `(peer, words)` buffer and receive one buffer of the announced
/// length from each `(peer, len)` in `incoming`.
///
/// Received buffers are returned in the order of `incoming`, so callers can
/// pair them with their receive lists by position.
pub fn exchange_words<C>(
    outgoing: &[(usize, &[WireWord])],
    incoming: &[(usize, usize)],
    comm: &C,
    tag: CommTag,
) -> Result<Vec<Vec<WireWord>>, CompGridError>
where
    C: Communicator,
{
    let mut recv_data = Vec::with_capacity(incoming.len());
    for &(nbr, len) in incoming {
        let mut buffer = vec![WireWord::default(); len];
        let h = comm.irecv(nbr, tag.as_u16(), cast_slice_mut(&mut buffer));
        recv_data.push((nbr, len, h));
    }

    let mut pending_sends = Vec::with_capacity(outgoing.len());
    for &(nbr, words) in outgoing {
        pending_sends.push(comm.isend(nbr, tag.as_u16(), cast_slice(words)));
    }

    let mut out = Vec::with_capacity(recv_data.len());
    let mut maybe_err = None;
    for (nbr, len, h) in recv_data {
        let raw = h.wait();
        if maybe_err.is_some() {
            continue;
        }
        match raw {
            Some(bytes) if bytes.len() == len * std::mem::size_of::<WireWord>() => {
                match words_from_bytes(&bytes) {
                    Ok(words) => out.push(words),
                    Err(msg) => maybe_err = Some(CompGridError::comm(nbr, msg)),
                }
            }
            Some(bytes) => {
                maybe_err = Some(CompGridError::comm(
                    nbr,
                    format!(
                        "payload: expected {} bytes, got {}",
                        len * std::mem::size_of::<WireWord>(),
                        bytes.len()
                    ),
                ));
            }
            None => {
                maybe_err = Some(CompGridError::comm(nbr, "missing payload"));
            }
        }
    }

    for send in pending_sends {
        let _ = send.wait();
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(out),
    }
}

/// Root-to-all broadcast built from point-to-point messages.
///
/// The root passes `Some(words)`; every other rank passes `None` and receives
/// the root's buffer. Costs `size - 1` messages per call.
pub fn broadcast_words<C>(
    root: usize,
    words: Option<&[WireWord]>,
    comm: &C,
    tag: CommTag,
) -> Result<Vec<WireWord>, CompGridError>
where
    C: Communicator,
{
    let me = comm.rank();
    if me == root {
        let words = words.ok_or_else(|| {
            CompGridError::InvalidParams(format!("broadcast root {root} has no payload"))
        })?;
        let count = WireCount::new(words.len());
        let mut pending = Vec::with_capacity(2 * comm.size());
        for peer in (0..comm.size()).filter(|&p| p != root) {
            pending.push(comm.isend(peer, tag.as_u16(), cast_slice(std::slice::from_ref(&count))));
            pending.push(comm.isend(peer, tag.offset(1).as_u16(), cast_slice(words)));
        }
        for send in pending {
            let _ = send.wait();
        }
        return Ok(words.to_vec());
    }

    let mut cnt = WireCount::new(0);
    let raw = comm
        .irecv(root, tag.as_u16(), cast_slice_mut(std::slice::from_mut(&mut cnt)))
        .wait()
        .ok_or_else(|| CompGridError::comm(root, "missing broadcast size"))?;
    if raw.len() != std::mem::size_of::<WireCount>() {
        return Err(CompGridError::comm(
            root,
            format!("broadcast size: expected 8 bytes, got {}", raw.len()),
        ));
    }
    cast_slice_mut(std::slice::from_mut(&mut cnt)).copy_from_slice(&raw);

    let mut buffer = vec![WireWord::default(); cnt.get()];
    let raw = comm
        .irecv(root, tag.offset(1).as_u16(), cast_slice_mut(&mut buffer))
        .wait()
        .ok_or_else(|| CompGridError::comm(root, "missing broadcast payload"))?;
    words_from_bytes(&raw).map_err(|msg| CompGridError::comm(root, msg))
}
