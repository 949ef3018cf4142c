//! Post-setup conversion of every composite grid to positional CSR.

use super::grid::{CompGrid, NodeHandle};
use super::matrix_row::MatrixRow;

/// CSR block whose columns are local positions in the target grid, `-1` when absent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompositeCsr {
    pub row_ptr: Vec<usize>,
    pub col_ind: Vec<i64>,
    pub data: Vec<f64>,
}

impl CompositeCsr {
    fn from_rows<'a>(rows: impl Iterator<Item = &'a MatrixRow>, target: &CompGrid) -> Self {
        let mut csr = CompositeCsr {
            row_ptr: vec![0],
            ..Default::default()
        };
        for row in rows {
            csr.col_ind
                .extend((0..row.len()).map(|j| row.local_column(j, target)));
            csr.data.extend_from_slice(row.vals());
            csr.row_ptr.push(csr.col_ind.len());
        }
        csr
    }

    pub fn num_rows(&self) -> usize {
        self.row_ptr.len() - 1
    }

    pub fn row(&self, i: usize) -> (&[i64], &[f64]) {
        let r = self.row_ptr[i]..self.row_ptr[i + 1];
        (&self.col_ind[r.clone()], &self.data[r])
    }
}

/// Solve-ready form of one level.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FinalizedGrid {
    pub a: CompositeCsr,
    /// Interpolation into this level from the next one; `None` on the coarsest level.
    pub p: Option<CompositeCsr>,
    /// Per node: 2 when it is in the `P` row of a fine node coupled to a real
    /// fine node, 1 when only other fine nodes interpolate from it, 0 when no
    /// present fine node does. `None` on level 0.
    pub coarse_residual_marker: Option<Vec<u8>>,
}

/// Resolve the `A`, coarse and `P` links of every level against the current grids.
pub fn resolve_local_indices(grids: &mut [CompGrid]) {
    for l in 0..grids.len() {
        let (fine, rest) = grids.split_at_mut(l + 1);
        let coarse = rest.first();
        fine[l].finalize_local_indices(coarse);
        if let Some(coarse) = coarse {
            fine[l].finalize_local_indices_p(coarse);
        }
    }
}

/// Resolve every remaining link and attach a [`FinalizedGrid`] to each level.
pub fn finalize_grids(grids: &mut [CompGrid]) {
    resolve_local_indices(grids);

    let finalized: Vec<FinalizedGrid> = (0..grids.len())
        .map(|l| {
            let grid = &grids[l];
            let a = CompositeCsr::from_rows(grid.handles().map(|h| grid.a_row(h)), grid);
            let p = grids.get(l + 1).filter(|_| grid.has_coarse()).map(|coarse| {
                CompositeCsr::from_rows(grid.handles().filter_map(|h| grid.p_row(h)), coarse)
            });
            let coarse_residual_marker = (l > 0).then(|| coarse_residual_marker(&grids[l - 1], grid));
            FinalizedGrid {
                a,
                p,
                coarse_residual_marker,
            }
        })
        .collect();

    for (grid, f) in grids.iter_mut().zip(finalized) {
        grid.set_finalized(f);
    }
    log::debug!("finalized {} composite grid level(s)", grids.len());
}

/// Whether relaxing the real nodes of `grid` changes the residual at `h`.
pub(crate) fn coupled_to_real(grid: &CompGrid, h: NodeHandle) -> bool {
    !grid.is_ghost(h)
        || grid
            .a_row(h)
            .locals()
            .iter()
            .flatten()
            .any(|&n| !grid.is_ghost(n))
}

fn coarse_residual_marker(fine: &CompGrid, coarse: &CompGrid) -> Vec<u8> {
    let mut marker = vec![0u8; coarse.num_nodes()];
    for h in fine.handles() {
        let Some(p) = fine.p_row(h) else {
            continue;
        };
        let m = if coupled_to_real(fine, h) { 2 } else { 1 };
        for &c in p.locals().iter().flatten() {
            let pos = coarse.local_index(c);
            marker[pos] = marker[pos].max(m);
        }
    }
    marker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comp_grid::IncomingNode;
    use crate::hierarchy::{AmgLevel, CsrCommPkg, ParCsrMatrix, SparseRow};

    /// Two fine nodes {0, 1} over one coarse node {0}; node 0 is the C-point.
    fn two_level() -> Vec<CompGrid> {
        let fine = AmgLevel {
            a: ParCsrMatrix::new(
                0,
                vec![
                    SparseRow::new(vec![0, 1], vec![2.0, -1.0]),
                    SparseRow::new(vec![0, 1, 2], vec![-1.0, 2.0, -1.0]),
                ],
                CsrCommPkg::default(),
            ),
            p: Some(ParCsrMatrix::new(
                0,
                vec![SparseRow::new(vec![0], vec![1.0]), SparseRow::new(vec![0, 1], vec![0.5, 0.5])],
                CsrCommPkg::default(),
            )),
            residual: vec![1.0, 2.0],
            cf_marker: vec![1, -1],
            coarse_first_index: 0,
        };
        let coarse = AmgLevel {
            a: ParCsrMatrix::new(0, vec![SparseRow::new(vec![0, 1], vec![1.0, -0.5])], CsrCommPkg::default()),
            residual: vec![0.0],
            ..Default::default()
        };
        vec![
            CompGrid::from_level(0, &fine).unwrap(),
            CompGrid::from_level(1, &coarse).unwrap(),
        ]
    }

    #[test]
    fn positional_columns_mark_missing_nodes() {
        let mut grids = two_level();
        finalize_grids(&mut grids);
        let f = grids[0].finalized().unwrap();
        assert_eq!(f.a.row_ptr, vec![0, 2, 5]);
        assert_eq!(f.a.col_ind, vec![0, 1, 0, 1, -1]);
        let p = f.p.as_ref().unwrap();
        assert_eq!(p.row(1), (&[0, -1][..], &[0.5, 0.5][..]));
        assert!(f.coarse_residual_marker.is_none());
        assert_eq!(grids[1].finalized().unwrap().coarse_residual_marker, Some(vec![2]));
    }

    #[test]
    fn late_arrivals_resolve_on_finalize() {
        let mut grids = two_level();
        grids[0]
            .merge_incoming(vec![IncomingNode {
                global: 2,
                residual: 3.0,
                ghost: true,
                coarse_global: 1,
                a_row: MatrixRow::new(vec![-1.0, 2.0], vec![1, 2]),
                p_row: Some(MatrixRow::new(vec![1.0], vec![1])),
            }])
            .unwrap();
        grids[1]
            .merge_incoming(vec![IncomingNode {
                global: 1,
                residual: 0.0,
                ghost: false,
                coarse_global: -1,
                a_row: MatrixRow::new(vec![1.0], vec![1]),
                p_row: None,
            }])
            .unwrap();
        finalize_grids(&mut grids);
        assert_eq!(grids[0].coarse_of(NodeHandle::new(2)), Some(NodeHandle::new(1)));
        let f = grids[0].finalized().unwrap();
        assert_eq!(f.a.col_ind, vec![0, 1, 0, 1, 2, 1, 2]);
        assert_eq!(f.p.as_ref().unwrap().row(1).0, &[0, 1]);
        // node 2 is a ghost next to real node 1
        assert_eq!(grids[1].finalized().unwrap().coarse_residual_marker, Some(vec![2, 2]));
    }

    #[test]
    fn marker_separates_relaxed_and_ghost_only_sources() {
        let mut grids = two_level();
        grids[0]
            .merge_incoming(vec![IncomingNode {
                global: 3,
                residual: 0.0,
                ghost: true,
                coarse_global: -1,
                a_row: MatrixRow::new(vec![2.0, -1.0], vec![3, 4]),
                p_row: Some(MatrixRow::new(vec![1.0], vec![2])),
            }])
            .unwrap();
        grids[1]
            .merge_incoming(
                [2, 5]
                    .into_iter()
                    .map(|g| IncomingNode {
                        global: g,
                        residual: 0.0,
                        ghost: false,
                        coarse_global: -1,
                        a_row: MatrixRow::new(vec![1.0], vec![g]),
                        p_row: None,
                    })
                    .collect(),
            )
            .unwrap();
        finalize_grids(&mut grids);
        assert!(coupled_to_real(&grids[0], NodeHandle::new(1)));
        assert!(!coupled_to_real(&grids[0], NodeHandle::new(2)));
        assert_eq!(grids[1].finalized().unwrap().coarse_residual_marker, Some(vec![2, 1, 0]));
    }
}
