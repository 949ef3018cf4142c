//! Row-distributed sparse matrices as handed over by the outer multigrid setup.

use super::partition::RowPartition;
use std::collections::BTreeMap;

/// One sparse row with global column indices.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SparseRow {
    pub cols: Vec<i64>,
    pub vals: Vec<f64>,
}

impl SparseRow {
    pub fn new(cols: Vec<i64>, vals: Vec<f64>) -> Self {
        debug_assert_eq!(cols.len(), vals.len());
        Self { cols, vals }
    }

    pub fn len(&self) -> usize {
        self.cols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cols.is_empty()
    }

    /// `(global column, value)` pairs in storage order.
    pub fn entries(&self) -> impl Iterator<Item = (i64, f64)> + '_ {
        self.cols.iter().copied().zip(self.vals.iter().copied())
    }
}

/// One-hop communication pattern of a distributed matrix.
///
/// `send_map_elmts[send_map_starts[i]..send_map_starts[i + 1]]` are the local
/// rows whose values rank `send_procs[i]` needs.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CsrCommPkg {
    pub send_procs: Vec<usize>,
    pub send_map_starts: Vec<usize>,
    pub send_map_elmts: Vec<usize>,
    pub recv_procs: Vec<usize>,
}

impl CsrCommPkg {
    /// Derive the pattern of a structurally symmetric matrix from its local rows.
    ///
    /// Local row `i` is sent to every rank owning one of its off-process columns;
    /// the same ranks are the receive neighbors.
    pub fn from_rows(rows: &[SparseRow], partition: &RowPartition, rank: usize) -> Self {
        let mut sends: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, row) in rows.iter().enumerate() {
            for &col in &row.cols {
                match partition.owner_of(col) {
                    Some(owner) if owner != rank => {
                        let elmts = sends.entry(owner).or_default();
                        if elmts.last() != Some(&i) {
                            elmts.push(i);
                        }
                    }
                    _ => {}
                }
            }
        }
        let mut pkg = CsrCommPkg {
            send_map_starts: vec![0],
            ..Default::default()
        };
        for (proc, elmts) in sends {
            pkg.send_procs.push(proc);
            pkg.send_map_elmts.extend(elmts);
            pkg.send_map_starts.push(pkg.send_map_elmts.len());
        }
        pkg.recv_procs = pkg.send_procs.clone();
        pkg
    }

    pub fn num_sends(&self) -> usize {
        self.send_procs.len()
    }

    pub fn num_recvs(&self) -> usize {
        self.recv_procs.len()
    }

    /// Local rows sent to `send_procs[i]`.
    pub fn send_elmts(&self, i: usize) -> &[usize] {
        &self.send_map_elmts[self.send_map_starts[i]..self.send_map_starts[i + 1]]
    }

    /// `true` when the send and receive neighbor sets coincide.
    pub fn is_symmetric(&self) -> bool {
        let mut s = self.send_procs.clone();
        let mut r = self.recv_procs.clone();
        s.sort_unstable();
        r.sort_unstable();
        s == r
    }
}

/// Locally owned block of rows of a distributed matrix.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ParCsrMatrix {
    pub first_row: i64,
    pub rows: Vec<SparseRow>,
    pub comm_pkg: CsrCommPkg,
}

impl ParCsrMatrix {
    pub fn new(first_row: i64, rows: Vec<SparseRow>, comm_pkg: CsrCommPkg) -> Self {
        Self {
            first_row,
            rows,
            comm_pkg,
        }
    }

    /// Rows owned by `rank` under `partition`, with the one-hop pattern derived from them.
    pub fn distributed(rows: Vec<SparseRow>, partition: &RowPartition, rank: usize) -> Self {
        let comm_pkg = CsrCommPkg::from_rows(&rows, partition, rank);
        Self::new(partition.first(rank), rows, comm_pkg)
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Last owned global row (inclusive); `first_row - 1` when nothing is owned.
    pub fn last_row(&self) -> i64 {
        self.first_row + self.rows.len() as i64 - 1
    }

    /// Row for an owned global index.
    pub fn row(&self, global: i64) -> Option<&SparseRow> {
        let local = usize::try_from(global - self.first_row).ok()?;
        self.rows.get(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_rows(first: i64, n: i64, total: i64) -> Vec<SparseRow> {
        (first..first + n)
            .map(|g| {
                let mut cols = Vec::new();
                let mut vals = Vec::new();
                for (c, v) in [(g - 1, -1.0), (g, 2.0), (g + 1, -1.0)] {
                    if (0..total).contains(&c) {
                        cols.push(c);
                        vals.push(v);
                    }
                }
                SparseRow::new(cols, vals)
            })
            .collect()
    }

    #[test]
    fn middle_rank_of_chain_talks_to_both_sides() {
        let part = RowPartition::uniform(9, 3);
        let a = ParCsrMatrix::distributed(chain_rows(3, 3, 9), &part, 1);
        assert_eq!(a.comm_pkg.send_procs, vec![0, 2]);
        assert_eq!(a.comm_pkg.send_elmts(0), &[0]);
        assert_eq!(a.comm_pkg.send_elmts(1), &[2]);
        assert!(a.comm_pkg.is_symmetric());
        assert_eq!(a.last_row(), 5);
        assert_eq!(a.row(4).map(SparseRow::len), Some(3));
        assert!(a.row(6).is_none());
    }

    #[test]
    fn single_rank_has_no_neighbors() {
        let part = RowPartition::uniform(4, 1);
        let a = ParCsrMatrix::distributed(chain_rows(0, 4, 4), &part, 0);
        assert_eq!(a.comm_pkg.num_sends(), 0);
        assert_eq!(a.comm_pkg.send_map_starts, vec![0]);
    }
}
