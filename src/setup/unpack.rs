//! Receive side of the assembly round, plus the send-map correction that
//! tells each sender which of its nodes were actually kept.

use crate::algs::wire::{WireReader, WireWord, WireWriter};
use crate::comp_grid::{CompGrid, IncomingNode, MatrixRow, NodeHandle};
use crate::compgrid_error::CompGridError;

/// What one received buffer did to the local grids.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnpackOutcome {
    /// Per absolute level, the destination of each incoming node (`None` = discarded).
    /// Levels the buffer did not reach stay empty.
    pub recv_map_send: Vec<Vec<Option<NodeHandle>>>,
    pub num_incoming_nodes: Vec<usize>,
    /// Fresh nodes per level.
    pub num_recv_nodes: Vec<usize>,
    /// Word count of the matching [`pack_recv_map_send_buffer`] message.
    pub recv_map_send_buffer_size: usize,
}

/// Parse one neighbor's buffer and merge every psi level into `grids`.
pub fn unpack_recv_buffer(
    words: &[WireWord],
    grids: &mut [CompGrid],
    current_level: usize,
) -> Result<UnpackOutcome, CompGridError> {
    let num_levels = grids.len();
    let mut r = WireReader::new(words);
    let raw = r.int()?;
    let num_psi_levels = usize::try_from(raw)
        .ok()
        .filter(|&n| n > 0 && current_level + n <= num_levels)
        .ok_or(CompGridError::WireValueOutOfRange {
            value: raw,
            what: "psi level count",
        })?;

    let mut out = UnpackOutcome {
        recv_map_send: vec![Vec::new(); num_levels],
        num_incoming_nodes: vec![0; num_levels],
        num_recv_nodes: vec![0; num_levels],
        recv_map_send_buffer_size: num_levels - current_level,
    };
    for level in current_level..current_level + num_psi_levels {
        let has_coarse = grids[level].has_coarse();
        let n = r.len_value("incoming node count")?;
        let globals = r.ints(n)?;
        let residuals = r.reals(n)?;
        let (ghost, coarse) = if has_coarse {
            (r.ints(n)?, r.ints(n)?)
        } else {
            (vec![0; n], vec![-1; n])
        };
        let mut nodes = Vec::with_capacity(n);
        for i in 0..n {
            let a_row = read_row(&mut r)?;
            let p_row = if has_coarse { Some(read_row(&mut r)?) } else { None };
            nodes.push(IncomingNode {
                global: globals[i],
                residual: residuals[i],
                ghost: ghost[i] != 0,
                coarse_global: coarse[i],
                a_row,
                p_row,
            });
        }
        let merged = grids[level].merge_incoming(nodes)?;
        log::trace!("level {level}: {n} incoming, {} new", merged.added);
        out.num_incoming_nodes[level] = n;
        out.num_recv_nodes[level] = merged.added;
        out.recv_map_send[level] = merged.dest;
        out.recv_map_send_buffer_size += n;
    }
    if r.remaining() != 0 {
        return Err(CompGridError::WireLengthMismatch {
            expected: r.position(),
            actual: words.len(),
        });
    }
    Ok(out)
}

fn read_row(r: &mut WireReader<'_>) -> Result<MatrixRow, CompGridError> {
    let len = r.len_value("row length")?;
    let vals = r.reals(len)?;
    let globals = r.ints(len)?;
    Ok(MatrixRow::new(vals, globals))
}

/// Per level from `current_level`: the incoming count, then each node's handle or `-1`.
pub fn pack_recv_map_send_buffer(
    recv_map_send: &[Vec<Option<NodeHandle>>],
    current_level: usize,
) -> Result<Vec<WireWord>, CompGridError> {
    let levels = &recv_map_send[current_level..];
    let len = levels.iter().map(|l| 1 + l.len()).sum();
    let mut w = WireWriter::with_exact_len(len);
    for dest in levels {
        w.put_len(dest.len());
        w.put_ints(dest.iter().map(|d| d.map_or(-1, |h| h.index() as i64)));
    }
    w.finish()
}

/// Drop every node the receiver discarded from `send_flag` (indexed by absolute level).
///
/// Returns the word count of a later solve-phase message to that receiver.
pub fn unpack_send_flag_buffer(
    words: &[WireWord],
    send_flag: &mut [Vec<NodeHandle>],
    current_level: usize,
) -> Result<usize, CompGridError> {
    let num_levels = send_flag.len();
    let mut r = WireReader::new(words);
    let mut send_buffer_size = num_levels - current_level;
    for flags in &mut send_flag[current_level..] {
        let n = r.len_value("send flag count")?;
        if n != flags.len() {
            return Err(CompGridError::WireLengthMismatch {
                expected: flags.len(),
                actual: n,
            });
        }
        let kept = r.ints(n)?;
        let mut keep = kept.iter().map(|&d| d != -1);
        flags.retain(|_| keep.next().unwrap_or(false));
        send_buffer_size += flags.len();
    }
    if r.remaining() != 0 {
        return Err(CompGridError::WireLengthMismatch {
            expected: r.position(),
            actual: words.len(),
        });
    }
    Ok(send_buffer_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{AmgLevel, CsrCommPkg, ParCsrMatrix, SparseRow};

    fn level(first: i64, n: i64, with_p: bool) -> AmgLevel {
        let rows = (first..first + n)
            .map(|g| SparseRow::new(vec![g], vec![1.0]))
            .collect();
        AmgLevel {
            a: ParCsrMatrix::new(first, rows, CsrCommPkg::default()),
            p: with_p.then(|| {
                ParCsrMatrix::new(first, vec![SparseRow::default(); n as usize], CsrCommPkg::default())
            }),
            residual: vec![0.0; n as usize],
            cf_marker: if with_p { vec![-1; n as usize] } else { Vec::new() },
            coarse_first_index: 0,
        }
    }

    /// One psi level starting at `current`; `with_coarse` adds ghost/coarse words and empty P rows.
    fn buffer(nodes: &[(i64, bool)], with_coarse: bool) -> Vec<WireWord> {
        let n = nodes.len();
        let len = if with_coarse { 2 + 8 * n } else { 2 + 5 * n };
        let mut w = WireWriter::with_exact_len(len);
        w.put_len(1);
        w.put_len(n);
        w.put_ints(nodes.iter().map(|&(g, _)| g));
        w.put_reals(nodes.iter().map(|&(g, _)| g as f64));
        if with_coarse {
            w.put_ints(nodes.iter().map(|&(_, ghost)| i64::from(ghost)));
            w.put_ints(nodes.iter().map(|_| -1));
        }
        for &(g, _) in nodes {
            w.put_len(1);
            w.put_real(1.0);
            w.put_int(g);
            if with_coarse {
                w.put_len(0);
            }
        }
        w.finish().unwrap()
    }

    #[test]
    fn owned_and_known_nodes_are_discarded() {
        let mut grids = vec![CompGrid::from_level(0, &level(0, 3, false)).unwrap()];
        let first = unpack_recv_buffer(&buffer(&[(3, false), (4, false)], false), &mut grids, 0).unwrap();
        assert_eq!(first.num_recv_nodes[0], 2);
        assert_eq!(first.recv_map_send_buffer_size, 1 + 2);

        let second = unpack_recv_buffer(&buffer(&[(2, false), (4, false), (5, false)], false), &mut grids, 0).unwrap();
        assert_eq!(second.recv_map_send[0][..2], [None, None]);
        assert!(second.recv_map_send[0][2].is_some());
        assert_eq!(second.num_recv_nodes[0], 1);
        assert_eq!(grids[0].global_indices(), vec![0, 1, 2, 3, 4, 5]);

        let words = pack_recv_map_send_buffer(&second.recv_map_send, 0).unwrap();
        assert_eq!(
            words.iter().map(|w| w.int()).collect::<Vec<_>>(),
            vec![3, -1, -1, 5]
        );
    }

    #[test]
    fn real_copy_upgrades_a_ghost() {
        let mut grids = vec![
            CompGrid::from_level(0, &level(0, 2, true)).unwrap(),
            CompGrid::from_level(1, &level(0, 1, false)).unwrap(),
        ];
        unpack_recv_buffer(&buffer(&[(2, true), (3, true)], true), &mut grids, 0).unwrap();
        assert_eq!(grids[0].ghost_markers(), vec![false, false, true, true]);
        unpack_recv_buffer(&buffer(&[(2, false), (3, true)], true), &mut grids, 0).unwrap();
        assert_eq!(grids[0].ghost_markers(), vec![false, false, false, true]);
    }

    #[test]
    fn trailing_words_are_rejected() {
        let mut grids = vec![CompGrid::from_level(0, &level(0, 1, false)).unwrap()];
        let mut words = buffer(&[(5, false)], false);
        words.push(WireWord::from_int(0));
        assert!(matches!(
            unpack_recv_buffer(&words, &mut grids, 0),
            Err(CompGridError::WireLengthMismatch { .. })
        ));
    }

    #[test]
    fn send_flags_keep_only_accepted_nodes() {
        let h = NodeHandle::new;
        let mut send_flag = vec![vec![h(0), h(1), h(2)], vec![h(4)]];
        let mut w = WireWriter::with_exact_len(6);
        w.put_len(3);
        w.put_ints([7, -1, 9]);
        w.put_len(1);
        w.put_int(-1);
        let size = unpack_send_flag_buffer(&w.finish().unwrap(), &mut send_flag, 0).unwrap();
        assert_eq!(send_flag, vec![vec![h(0), h(2)], vec![]]);
        assert_eq!(size, 2 + 2);
    }
}
