//! Per-level inputs consumed from the outer multigrid setup.
//!
//! Level `l` carries the operator `A_l`, the interpolation `P_l` into level
//! `l` from level `l + 1` (absent on the coarsest level), the residual and the
//! coarsening marker. Columns of `P_l` are global indices of level `l + 1`.

mod par_csr;
mod partition;

pub use par_csr::{CsrCommPkg, ParCsrMatrix, SparseRow};
pub use partition::RowPartition;

use crate::compgrid_error::CompGridError;

/// One level of a multigrid hierarchy, as owned by the calling rank.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct AmgLevel {
    pub a: ParCsrMatrix,
    pub p: Option<ParCsrMatrix>,
    pub residual: Vec<f64>,
    /// Positive for C-points; C-points keep their relative order on the next level.
    pub cf_marker: Vec<i32>,
    /// Global index of this rank's first node on the next-coarser level.
    pub coarse_first_index: i64,
}

impl AmgLevel {
    pub fn num_owned(&self) -> usize {
        self.a.num_rows()
    }

    /// Coarse global index of every owned node (`-1` for F-points).
    pub fn coarse_global_indices(&self) -> Vec<i64> {
        let mut next = self.coarse_first_index;
        self.cf_marker
            .iter()
            .map(|&m| {
                if m > 0 {
                    next += 1;
                    next - 1
                } else {
                    -1
                }
            })
            .collect()
    }
}

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct AmgHierarchy {
    pub levels: Vec<AmgLevel>,
}

impl AmgHierarchy {
    pub fn new(levels: Vec<AmgLevel>) -> Self {
        Self { levels }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Check that every level is shaped consistently.
    ///
    /// All levels but the coarsest need `P`, and every per-node array must
    /// match the number of owned rows of `A`.
    pub fn validate(&self) -> Result<(), CompGridError> {
        if self.levels.is_empty() {
            return Err(CompGridError::LevelMismatch {
                level: 0,
                reason: "hierarchy has no levels".into(),
            });
        }
        let coarsest = self.levels.len() - 1;
        for (level, lv) in self.levels.iter().enumerate() {
            let n = lv.num_owned();
            let mismatch = |reason: String| CompGridError::LevelMismatch { level, reason };
            if lv.residual.len() != n {
                return Err(mismatch(format!(
                    "residual has {} entries for {n} rows",
                    lv.residual.len()
                )));
            }
            match (&lv.p, level == coarsest) {
                (Some(_), true) => {
                    return Err(mismatch("coarsest level carries an interpolation".into()));
                }
                (None, false) => return Err(mismatch("missing interpolation".into())),
                (Some(p), false) => {
                    if p.num_rows() != n {
                        return Err(mismatch(format!("P has {} rows for {n} rows", p.num_rows())));
                    }
                    if lv.cf_marker.len() != n {
                        return Err(mismatch(format!(
                            "cf_marker has {} entries for {n} rows",
                            lv.cf_marker.len()
                        )));
                    }
                }
                (None, true) => {}
            }
            if let Some((i, row)) = lv
                .a
                .rows
                .iter()
                .enumerate()
                .find(|(_, r)| r.cols.len() != r.vals.len())
            {
                return Err(mismatch(format!(
                    "row {i} has {} columns and {} values",
                    row.cols.len(),
                    row.vals.len()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(n: usize, with_p: bool) -> AmgLevel {
        AmgLevel {
            a: ParCsrMatrix::new(0, vec![SparseRow::default(); n], CsrCommPkg::default()),
            p: with_p.then(|| ParCsrMatrix::new(0, vec![SparseRow::default(); n], CsrCommPkg::default())),
            residual: vec![0.0; n],
            cf_marker: if with_p { vec![1; n] } else { Vec::new() },
            coarse_first_index: 0,
        }
    }

    #[test]
    fn coarse_indices_count_c_points_only() {
        let lv = AmgLevel {
            cf_marker: vec![1, -1, 1, -1],
            coarse_first_index: 10,
            ..Default::default()
        };
        assert_eq!(lv.coarse_global_indices(), vec![10, -1, 11, -1]);
    }

    #[test]
    fn validate_requires_p_above_the_coarsest_level() {
        let ok = AmgHierarchy::new(vec![level(3, true), level(2, false)]);
        assert!(ok.validate().is_ok());
        let missing = AmgHierarchy::new(vec![level(3, false), level(2, false)]);
        assert!(matches!(
            missing.validate(),
            Err(CompGridError::LevelMismatch { level: 0, .. })
        ));
        let extra = AmgHierarchy::new(vec![level(2, true)]);
        assert!(extra.validate().is_err());
    }

    #[test]
    fn residual_length_is_checked() {
        let mut lv = level(3, false);
        lv.residual.pop();
        assert!(AmgHierarchy::new(vec![lv]).validate().is_err());
    }
}
