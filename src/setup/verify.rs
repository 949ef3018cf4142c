//! Debug-time verification of finished composite grids.
//!
//! Each test returns `true` when it found a discrepancy and logs every
//! discrepancy with `log::error!`.

use super::TAG_VERIFY;
use super::distance_search::{CoarseMarks, expand_psi_composite};
use crate::algs::communicator::Communicator;
use crate::algs::exchange::broadcast_words;
use crate::algs::wire::{WireReader, WireWord, WireWriter};
use crate::comp_grid::{CompGrid, MatrixRow, NodeHandle};
use crate::compgrid_error::CompGridError;
use crate::hierarchy::{AmgHierarchy, SparseRow};

/// Rebuild the composite grids serially from the owned fine nodes and compare shapes.
///
/// Fails when a grid holds a node the serial construction never reaches, when
/// a ghost marker disagrees with the distance, or when the expansion hits a
/// column whose node is missing.
pub fn test_comp_grids_1(grids: &[CompGrid], padding: usize, num_ghost_layers: usize) -> bool {
    let num_levels = grids.len();
    let mut failed = false;
    let mut flags: Vec<Vec<usize>> = grids.iter().map(|g| vec![0; g.num_handles()]).collect();
    if let Some(finest) = grids.first() {
        for h in finest.handles().take(finest.num_owned_nodes()) {
            flags[0][h.index()] = padding + 1;
        }
    }

    let mut nodes_to_add = true;
    for level in 0..num_levels {
        if !nodes_to_add {
            break;
        }
        let grid = &grids[level];
        let need_coarse = level + 1 < num_levels;
        let (head, tail) = flags.split_at_mut(level + 1);
        let fine_flags = &mut head[level][..];
        let coarse_flags = tail.first_mut();

        let mut errors = 0;
        let mut spare: Vec<usize> = Vec::new();
        let mut marks = CoarseMarks::new(coarse_flags.map_or(&mut spare[..], |c| &mut c[..]), padding + 1);
        let seeds: Vec<NodeHandle> = grid
            .handles()
            .filter(|h| fine_flags[h.index()] == padding + 1)
            .collect();
        for h in seeds {
            let coarse = if need_coarse { Some(&mut marks) } else { None };
            errors += expand_psi_composite(grid, h, padding, fine_flags, coarse);
        }
        nodes_to_add = marks.touched;

        for f in fine_flags.iter_mut() {
            if *f > 1 {
                *f = num_ghost_layers + 2;
            } else if *f == 1 {
                *f = num_ghost_layers + 1;
            }
        }
        let frontier: Vec<NodeHandle> = grid
            .handles()
            .filter(|h| fine_flags[h.index()] == num_ghost_layers + 1)
            .collect();
        for h in frontier {
            errors += expand_psi_composite(grid, h, num_ghost_layers, fine_flags, None);
        }
        if errors > 0 {
            log::error!("level {level}: {errors} missing column(s) while rebuilding the composite grid");
            failed = true;
        }

        for h in grid.handles() {
            let f = fine_flags[h.index()];
            if f == 0 {
                log::error!("level {level}: extra node {} present in composite grid", grid.global_of(h));
                failed = true;
            }
            if grid.has_coarse() {
                if f < num_ghost_layers + 1 && !grid.is_ghost(h) {
                    log::error!("level {level}: node {} should be ghost but is real", grid.global_of(h));
                    failed = true;
                }
                if f > num_ghost_layers && grid.is_ghost(h) {
                    log::error!("level {level}: node {} should be real but is ghost", grid.global_of(h));
                    failed = true;
                }
            }
        }
    }
    failed
}

/// Check that every coarse node a correct restriction needs is marked restrictable.
///
/// A fine node coupled through `A` to a real node has its residual changed by
/// relaxation, so every coarse node in its `P` row must be present and carry
/// coarse residual marker 2. Requires [`crate::comp_grid::finalize_grids`] to
/// have run.
pub fn test_comp_grids_2(grids: &[CompGrid]) -> bool {
    let mut failed = false;
    for level in 0..grids.len().saturating_sub(1) {
        let (grid, coarse) = (&grids[level], &grids[level + 1]);
        let (Some(fine_csr), Some(coarse_csr)) = (grid.finalized(), coarse.finalized()) else {
            log::error!("level {level}: composite grids were not finalized");
            return true;
        };
        let (Some(p), Some(marker)) = (&fine_csr.p, &coarse_csr.coarse_residual_marker) else {
            continue;
        };
        let mut needs_restrict = vec![false; coarse.num_nodes()];
        for i in 0..grid.num_nodes() {
            let (cols, _) = fine_csr.a.row(i);
            let touches_real = cols
                .iter()
                .filter_map(|&c| usize::try_from(c).ok())
                .any(|c| !grid.is_ghost(grid.handle_at(c)));
            if !touches_real {
                continue;
            }
            for &c in p.row(i).0 {
                match usize::try_from(c) {
                    Ok(c) => needs_restrict[c] = true,
                    Err(_) => {
                        log::error!(
                            "level {level}: node {} interpolates from a coarse node missing on level {}",
                            grid.global_index(i),
                            level + 1
                        );
                        failed = true;
                    }
                }
            }
        }
        for (i, _) in needs_restrict.iter().enumerate().filter(|(_, n)| **n) {
            if marker[i] != 2 {
                log::error!(
                    "level {}: residual must be restricted at {} where it cannot be",
                    level + 1,
                    coarse.global_index(i)
                );
                failed = true;
            }
        }
    }
    failed
}

/// Positional CSR of `rows` against `target`, as broadcast by [`test_comp_grids_3`].
fn positional<'a>(rows: impl Iterator<Item = &'a MatrixRow>, target: &CompGrid) -> (Vec<i64>, Vec<i64>, Vec<f64>) {
    let mut row_ptr = vec![0];
    let mut cols = Vec::new();
    let mut data = Vec::new();
    for row in rows {
        cols.extend((0..row.len()).map(|j| row.local_column(j, target)));
        data.extend_from_slice(row.vals());
        row_ptr.push(cols.len() as i64);
    }
    (row_ptr, cols, data)
}

fn encode_level(grids: &[CompGrid], level: usize) -> Result<Vec<WireWord>, CompGridError> {
    let grid = &grids[level];
    let n = grid.num_nodes();
    let (a_ptr, a_cols, a_data) = positional(grid.handles().map(|h| grid.a_row(h)), grid);
    let coarse = grids.get(level + 1).filter(|_| grid.has_coarse());
    let p = coarse.map(|c| positional(grid.handles().filter_map(|h| grid.p_row(h)), c));

    let (nc, nc_owned, nnz_p) = match (coarse, &p) {
        (Some(c), Some((_, cols, _))) => (c.num_nodes(), c.num_owned_nodes(), cols.len()),
        _ => (0, 0, 0),
    };
    let mut len = 6 + 2 * n + (n + 1) + 2 * a_cols.len();
    if p.is_some() {
        len += nc + (n + 1) + 2 * nnz_p;
    }
    let mut w = WireWriter::with_exact_len(len);
    for v in [n, grid.num_owned_nodes(), nc, nc_owned, a_cols.len(), nnz_p] {
        w.put_len(v);
    }
    w.put_reals(grid.handles().map(|h| grid.residual_of(h)));
    w.put_ints(grid.global_indices());
    w.put_ints(a_ptr);
    w.put_ints(a_cols);
    w.put_reals(a_data);
    if let (Some(c), Some((p_ptr, p_cols, p_data))) = (coarse, p) {
        w.put_ints(c.global_indices());
        w.put_ints(p_ptr);
        w.put_ints(p_cols);
        w.put_reals(p_data);
    }
    w.finish()
}

/// `true` when `global` is among the owned prefix or the sorted suffix of `globals`.
fn listed(globals: &[i64], num_owned: usize, global: i64) -> bool {
    let (owned, rest) = globals.split_at(num_owned.min(globals.len()));
    owned.binary_search(&global).is_ok() || rest.binary_search(&global).is_ok()
}

struct RowCheck<'a> {
    root: usize,
    me: usize,
    level: usize,
    what: &'static str,
    global: i64,
    expected: &'a SparseRow,
    col_globals: &'a [i64],
    col_owned: usize,
}

impl RowCheck<'_> {
    fn run(&self, cols: &[i64], data: &[f64]) -> bool {
        let mut failed = false;
        let (root, me, level, what, global) = (self.root, self.me, self.level, self.what, self.global);
        if cols.len() != self.expected.len() {
            log::error!("rank {root} has incorrect {what} row size at {global} on level {level}, checked by rank {me}");
            return true;
        }
        for (j, (&c, &expected_col)) in cols.iter().zip(&self.expected.cols).enumerate() {
            let col_ok = match usize::try_from(c) {
                Ok(pos) => self.col_globals.get(pos) == Some(&expected_col),
                Err(_) => !listed(self.col_globals, self.col_owned, expected_col),
            };
            if !col_ok {
                log::error!("rank {root} has incorrect {what} column {j} at {global} on level {level}, checked by rank {me}");
                failed = true;
            }
            if data[j] != self.expected.vals[j] {
                log::error!("rank {root} has incorrect {what} data at {global} on level {level}, checked by rank {me}");
                failed = true;
            }
        }
        failed
    }
}

/// Every rank in turn broadcasts its composite grids; owners check the rows they own.
///
/// Collective: all ranks must call it. Costs one broadcast per rank and level.
pub fn test_comp_grids_3<C>(grids: &[CompGrid], hierarchy: &AmgHierarchy, comm: &C) -> Result<bool, CompGridError>
where
    C: Communicator,
{
    let me = comm.rank();
    let mut failed = false;
    for root in 0..comm.size() {
        for level in 0..grids.len() {
            let mine = if root == me { Some(encode_level(grids, level)?) } else { None };
            let words = broadcast_words(root, mine.as_deref(), comm, TAG_VERIFY)?;
            failed |= check_level(&words, grids, hierarchy, level, root, me)?;
        }
    }
    Ok(failed)
}

fn check_level(
    words: &[WireWord],
    grids: &[CompGrid],
    hierarchy: &AmgHierarchy,
    level: usize,
    root: usize,
    me: usize,
) -> Result<bool, CompGridError> {
    let mut r = WireReader::new(words);
    let n = r.len_value("node count")?;
    let n_owned = r.len_value("owned count")?;
    let nc = r.len_value("coarse node count")?;
    let nc_owned = r.len_value("coarse owned count")?;
    let nnz_a = r.len_value("A nonzeros")?;
    let nnz_p = r.len_value("P nonzeros")?;
    let residual = r.reals(n)?;
    let globals = r.ints(n)?;
    let a_ptr = r.ints(n + 1)?;
    let a_cols = r.ints(nnz_a)?;
    let a_data = r.reals(nnz_a)?;
    let with_p = grids[level].has_coarse();
    let (coarse_globals, p_ptr, p_cols, p_data) = if with_p {
        (r.ints(nc)?, r.ints(n + 1)?, r.ints(nnz_p)?, r.reals(nnz_p)?)
    } else {
        Default::default()
    };

    let input = &hierarchy.levels[level];
    let owned = grids[level].owned_range();
    let span = |ptr: &[i64], i: usize| -> Result<std::ops::Range<usize>, CompGridError> {
        let lo = usize::try_from(ptr[i]).map_err(|_| CompGridError::WireValueOutOfRange { value: ptr[i], what: "row pointer" })?;
        let hi = usize::try_from(ptr[i + 1]).map_err(|_| CompGridError::WireValueOutOfRange { value: ptr[i + 1], what: "row pointer" })?;
        if lo > hi {
            return Err(CompGridError::WireValueOutOfRange { value: ptr[i + 1], what: "row pointer" });
        }
        Ok(lo..hi)
    };

    let mut failed = false;
    for (i, &g) in globals.iter().enumerate() {
        if !owned.contains(&g) {
            continue;
        }
        let local = (g - owned.start) as usize;
        if residual[i] != input.residual[local] {
            log::error!("rank {root} has incorrect residual at {g} on level {level}, checked by rank {me}");
            failed = true;
        }
        let a_span = span(&a_ptr, i)?;
        failed |= RowCheck {
            root,
            me,
            level,
            what: "A",
            global: g,
            expected: &input.a.rows[local],
            col_globals: &globals,
            col_owned: n_owned,
        }
        .run(&a_cols[a_span.clone()], &a_data[a_span]);

        if let (true, Some(p)) = (with_p, &input.p) {
            let p_span = span(&p_ptr, i)?;
            failed |= RowCheck {
                root,
                me,
                level,
                what: "P",
                global: g,
                expected: &p.rows[local],
                col_globals: &coarse_globals,
                col_owned: nc_owned,
            }
            .run(&p_cols[p_span.clone()], &p_data[p_span]);
        }
    }
    Ok(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::comp_grid::{IncomingNode, finalize_grids, resolve_local_indices};
    use crate::hierarchy::{AmgLevel, CsrCommPkg, ParCsrMatrix};

    fn chain_hierarchy(n: i64) -> AmgHierarchy {
        let rows = (0..n)
            .map(|g| {
                let cols: Vec<i64> = [g - 1, g, g + 1].into_iter().filter(|c| (0..n).contains(c)).collect();
                let vals = cols.iter().map(|&c| if c == g { 2.0 } else { -1.0 }).collect();
                SparseRow::new(cols, vals)
            })
            .collect();
        AmgHierarchy::new(vec![AmgLevel {
            a: ParCsrMatrix::new(0, rows, CsrCommPkg::default()),
            residual: (0..n).map(|g| g as f64).collect(),
            ..Default::default()
        }])
    }

    #[test]
    fn serial_grid_passes_every_test() {
        let h = chain_hierarchy(5);
        let mut grids = vec![CompGrid::from_level(0, &h.levels[0]).unwrap()];
        finalize_grids(&mut grids);
        assert!(!test_comp_grids_1(&grids, 1, 1));
        assert!(!test_comp_grids_2(&grids));
        assert!(!test_comp_grids_3(&grids, &h, &NoComm).unwrap());
    }

    /// Serial two-level chain: even fine nodes are C-points of coarse node `g / 2`.
    fn two_level_hierarchy(n: i64) -> AmgHierarchy {
        let mut h = chain_hierarchy(n);
        let nc = (n + 1) / 2;
        let p_rows = (0..n)
            .map(|g| {
                let cols: Vec<i64> = if g % 2 == 0 {
                    vec![g / 2]
                } else {
                    [(g - 1) / 2, (g + 1) / 2].into_iter().filter(|&c| c < nc).collect()
                };
                let vals = vec![1.0 / cols.len() as f64; cols.len()];
                SparseRow::new(cols, vals)
            })
            .collect();
        let fine = &mut h.levels[0];
        fine.p = Some(ParCsrMatrix::new(0, p_rows, CsrCommPkg::default()));
        fine.cf_marker = (0..n).map(|g| if g % 2 == 0 { 1 } else { -1 }).collect();
        let coarse = chain_hierarchy(nc).levels.remove(0);
        h.levels.push(coarse);
        h
    }

    fn serial_grids(h: &AmgHierarchy) -> Vec<CompGrid> {
        h.levels
            .iter()
            .enumerate()
            .map(|(l, level)| CompGrid::from_level(l, level).unwrap())
            .collect()
    }

    #[test]
    fn serial_two_level_grid_restricts_everywhere() {
        let h = two_level_hierarchy(6);
        let mut grids = serial_grids(&h);
        finalize_grids(&mut grids);
        assert!(!test_comp_grids_1(&grids, 1, 1));
        assert!(!test_comp_grids_2(&grids));
        assert!(!test_comp_grids_3(&grids, &h, &NoComm).unwrap());
    }

    #[test]
    fn shape_check_runs_on_resolved_links_alone() {
        let h = two_level_hierarchy(6);
        let mut grids = serial_grids(&h);
        resolve_local_indices(&mut grids);
        assert!(grids.iter().all(|g| g.finalized().is_none()));
        assert!(!test_comp_grids_1(&grids, 1, 1));
        // restriction coverage needs the finalized CSR
        assert!(test_comp_grids_2(&grids));
    }

    #[test]
    fn ghost_next_to_a_real_node_needs_its_coarse_nodes() {
        let h = two_level_hierarchy(6);
        let mut grids = serial_grids(&h);
        // ghost 7 couples to real node 5 but its coarse node 4 never arrived
        grids[0]
            .merge_incoming(vec![IncomingNode {
                global: 7,
                residual: 0.0,
                ghost: true,
                coarse_global: -1,
                a_row: MatrixRow::new(vec![-1.0, 2.0], vec![5, 7]),
                p_row: Some(MatrixRow::new(vec![1.0], vec![4])),
            }])
            .unwrap();
        finalize_grids(&mut grids);
        assert!(test_comp_grids_2(&grids));
    }

    #[test]
    fn stale_marker_fails_restriction_coverage() {
        let h = two_level_hierarchy(6);
        let mut grids = serial_grids(&h);
        finalize_grids(&mut grids);
        let mut coarse = grids[1].finalized().cloned().unwrap();
        coarse.coarse_residual_marker = Some(vec![2, 1, 2]);
        grids[1].set_finalized(coarse);
        assert!(test_comp_grids_2(&grids));
    }

    #[test]
    fn unreachable_node_is_reported() {
        let h = chain_hierarchy(3);
        let mut grids = vec![CompGrid::from_level(0, &h.levels[0]).unwrap()];
        grids[0]
            .merge_incoming(vec![IncomingNode {
                global: 40,
                residual: 0.0,
                ghost: false,
                coarse_global: -1,
                a_row: MatrixRow::new(vec![1.0], vec![40]),
                p_row: None,
            }])
            .unwrap();
        grids[0].finalize_local_indices(None);
        assert!(test_comp_grids_1(&grids, 1, 1));
    }

    #[test]
    fn wrong_residual_is_caught_by_the_owner() {
        let h = chain_hierarchy(3);
        let mut grids = vec![CompGrid::from_level(0, &h.levels[0]).unwrap()];
        finalize_grids(&mut grids);
        let mut other = h.clone();
        other.levels[0].residual[1] = 99.0;
        assert!(test_comp_grids_3(&grids, &other, &NoComm).unwrap());
    }

    #[test]
    fn listed_searches_both_blocks() {
        assert!(listed(&[3, 4, 5, 0, 7], 3, 7));
        assert!(listed(&[3, 4, 5, 0, 7], 3, 4));
        assert!(!listed(&[3, 4, 5, 0, 7], 3, 6));
    }
}
