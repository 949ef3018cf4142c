//! Send-buffer packing: everything one neighbor needs from this rank, on
//! the current level and on every coarser level reached through `P`.
//!
//! Buffer layout (all words, see [`crate::algs::wire`]):
//!
//! ```text
//! num_psi_levels
//! per psi level:
//!   n, global[n], residual[n]
//!   if the level has a coarser one: ghost[n], coarse_global[n]
//!   per node: len(A), A values, A globals
//!             if the level has a coarser one: len(P), P values, P globals
//! ```

use super::SetupParams;
use super::distance_search::{CoarseMarks, expand_psi_composite};
use crate::algs::wire::{WireWord, WireWriter};
use crate::comp_grid::{CompGrid, LevelCommPkg, NodeHandle};
use crate::compgrid_error::CompGridError;

/// Packed buffer for one neighbor plus what the sender must remember about it.
#[derive(Clone, Debug, Default)]
pub struct PackedBuffer {
    pub words: Vec<WireWord>,
    /// Nodes sent, indexed by absolute level; empty below the current level
    /// and past the last psi level. Every level is in global-index order
    /// except the current one, which follows the send map.
    pub send_flag: Vec<Vec<NodeHandle>>,
    /// Words needed later to tell the receiver which of these nodes it kept.
    pub send_flag_buffer_size: usize,
    /// Columns the psi-composite expansion could not follow.
    pub psi_composite_errors: usize,
}

/// Pack the buffer for `pkg.send_procs[proc_index]` on `current_level`.
pub fn pack_send_buffer(
    grids: &[CompGrid],
    pkg: &LevelCommPkg,
    proc_index: usize,
    current_level: usize,
    params: &SetupParams,
) -> Result<PackedBuffer, CompGridError> {
    let num_levels = grids.len();
    let padding = params.padding;
    let ghost_layers = params.num_ghost_layers;
    let mut send_flag: Vec<Vec<NodeHandle>> = vec![Vec::new(); num_levels];
    let mut ghost: Vec<Vec<bool>> = vec![Vec::new(); num_levels];
    let mut errors = 0;

    // current level: the send map, with coarse counterparts of its real nodes
    let elmts = pkg.send_slice(proc_index);
    let markers = pkg.ghost_slice(proc_index);
    send_flag[current_level] = elmts.to_vec();
    ghost[current_level] = markers.to_vec();
    let mut next_flags: Option<Vec<usize>> = None;
    let mut nodes_to_add = false;
    if current_level + 1 < num_levels {
        let fine = &grids[current_level];
        let mut flags = vec![0; grids[current_level + 1].num_handles()];
        for (&h, &is_ghost) in elmts.iter().zip(markers) {
            if is_ghost {
                continue;
            }
            if let Some(c) = fine.coarse_of(h) {
                flags[c.index()] = padding + 1;
                nodes_to_add = true;
            }
        }
        next_flags = Some(flags);
    }

    // coarser levels: grow each psi-composite region, then its ghost layer
    let mut num_psi_levels = 1;
    for level in current_level + 1..num_levels {
        if !nodes_to_add {
            break;
        }
        let Some(mut flags) = next_flags.take() else {
            break;
        };
        num_psi_levels += 1;
        let grid = &grids[level];
        let need_coarse = level + 1 < num_levels;
        let mut coarse_flags = if need_coarse {
            vec![0; grids[level + 1].num_handles()]
        } else {
            Vec::new()
        };

        let mut marks = CoarseMarks::new(&mut coarse_flags, padding + 1);
        let seeds: Vec<NodeHandle> = grid
            .handles()
            .filter(|h| flags[h.index()] == padding + 1)
            .collect();
        for h in seeds {
            let coarse = if need_coarse { Some(&mut marks) } else { None };
            errors += expand_psi_composite(grid, h, padding, &mut flags, coarse);
        }
        nodes_to_add = marks.touched;

        for f in flags.iter_mut() {
            if *f > 1 {
                *f = ghost_layers + 2;
            } else if *f == 1 {
                *f = ghost_layers + 1;
            }
        }
        let frontier: Vec<NodeHandle> = grid
            .handles()
            .filter(|h| flags[h.index()] == ghost_layers + 1)
            .collect();
        for h in frontier {
            errors += expand_psi_composite(grid, h, ghost_layers, &mut flags, None);
        }

        for h in grid.handles_by_global() {
            let f = flags[h.index()];
            if f > 0 {
                send_flag[level].push(h);
                ghost[level].push(f < ghost_layers + 1);
            }
        }
        next_flags = need_coarse.then_some(coarse_flags);
    }

    let psi_levels = current_level..current_level + num_psi_levels;
    let len = 1 + psi_levels
        .clone()
        .map(|l| level_words(&grids[l], &send_flag[l]))
        .sum::<usize>();
    let mut w = WireWriter::with_exact_len(len);
    w.put_len(num_psi_levels);
    for level in psi_levels {
        let grid = &grids[level];
        let nodes = &send_flag[level];
        w.put_len(nodes.len());
        w.put_ints(nodes.iter().map(|&h| grid.global_of(h)));
        w.put_reals(nodes.iter().map(|&h| grid.residual_of(h)));
        if grid.has_coarse() {
            w.put_ints(ghost[level].iter().map(|&g| i64::from(g)));
            w.put_ints(nodes.iter().map(|&h| grid.coarse_global_of(h)));
        }
        for &h in nodes {
            let a = grid.a_row(h);
            w.put_len(a.len());
            w.put_reals(a.vals().iter().copied());
            w.put_ints(a.globals().iter().copied());
            if let Some(p) = grid.p_row(h) {
                w.put_len(p.len());
                w.put_reals(p.vals().iter().copied());
                w.put_ints(p.globals().iter().copied());
            }
        }
    }
    let words = w.finish()?;

    let send_flag_buffer_size = (num_levels - current_level) + send_flag.iter().map(Vec::len).sum::<usize>();
    if errors > 0 {
        log::warn!(
            "level {current_level}: {errors} unresolved column(s) while packing for rank {}",
            pkg.send_procs[proc_index]
        );
    }
    Ok(PackedBuffer {
        words,
        send_flag,
        send_flag_buffer_size,
        psi_composite_errors: errors,
    })
}

/// Exact word count of one psi level.
fn level_words(grid: &CompGrid, nodes: &[NodeHandle]) -> usize {
    let per_node = if grid.has_coarse() { 4 } else { 2 };
    1 + per_node * nodes.len()
        + nodes
            .iter()
            .map(|&h| 1 + 2 * grid.a_row(h).len() + grid.p_row(h).map_or(0, |p| 1 + 2 * p.len()))
            .sum::<usize>()
}
