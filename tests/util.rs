#![allow(dead_code)]
use amgdd_compgrid::{
    algs::communicator::RayonComm,
    hierarchy::{AmgHierarchy, AmgLevel, CsrCommPkg, ParCsrMatrix, RowPartition, SparseRow},
};

/// 1-D Laplacian row `g` of a chain with `total` nodes.
pub fn chain_row(g: i64, total: i64) -> SparseRow {
    let cols: Vec<i64> = [g - 1, g, g + 1]
        .into_iter()
        .filter(|c| (0..total).contains(c))
        .collect();
    let vals = cols.iter().map(|&c| if c == g { 2.0 } else { -1.0 }).collect();
    SparseRow::new(cols, vals)
}

/// Residual value used for global node `g`, so copies can be checked anywhere.
pub fn residual_of(g: i64) -> f64 {
    0.5 + g as f64
}

/// `rank`'s share of a chain level (no coarser level).
pub fn chain_level(part: &RowPartition, rank: usize) -> AmgLevel {
    let rows = (part.first(rank)..part.end(rank))
        .map(|g| chain_row(g, part.total()))
        .collect();
    AmgLevel {
        a: ParCsrMatrix::distributed(rows, part, rank),
        residual: (part.first(rank)..part.end(rank)).map(residual_of).collect(),
        ..Default::default()
    }
}

/// Two-level chain: even fine nodes are C-points, coarse node `c` sits at fine node `2c`.
///
/// `fine` must split at even boundaries so each rank's C-points map onto a
/// contiguous coarse range; `coarse` is derived from it.
pub fn two_level_chain(fine: &RowPartition, rank: usize) -> AmgHierarchy {
    let n_fine = fine.total();
    let n_coarse = (n_fine + 1) / 2;
    let coarse_starts = (0..fine.num_ranks())
        .map(|r| (fine.first(r) + 1) / 2)
        .collect();
    let coarse = RowPartition::from_starts(coarse_starts, n_coarse).unwrap();

    let owned = fine.first(rank)..fine.end(rank);
    let p_rows = owned
        .clone()
        .map(|g| {
            if g % 2 == 0 {
                SparseRow::new(vec![g / 2], vec![1.0])
            } else {
                let cols: Vec<i64> = [(g - 1) / 2, (g + 1) / 2]
                    .into_iter()
                    .filter(|&c| c < n_coarse)
                    .collect();
                let vals = vec![0.5; cols.len()];
                SparseRow::new(cols, vals)
            }
        })
        .collect();
    let mut fine_level = chain_level(fine, rank);
    fine_level.p = Some(ParCsrMatrix::new(fine.first(rank), p_rows, CsrCommPkg::default()));
    fine_level.cf_marker = owned.map(|g| if g % 2 == 0 { 1 } else { -1 }).collect();
    fine_level.coarse_first_index = coarse.first(rank);

    AmgHierarchy::new(vec![fine_level, chain_level(&coarse, rank)])
}

/// Run `f` once per rank of a fresh in-process world, each on its own thread.
pub fn run_ranks<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&RayonComm) -> T + Sync,
{
    let comms = RayonComm::world(size);
    std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .iter()
            .map(|c| {
                let f = &f;
                s.spawn(move || f(c))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}
