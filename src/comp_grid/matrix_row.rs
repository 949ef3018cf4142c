//! Matrix rows stored in a composite grid.

use super::grid::{CompGrid, NodeHandle};
use crate::hierarchy::SparseRow;

/// Row of `A` or `P` with global columns and, once resolved, the local node of each column.
///
/// A `None` local means the column's node is not (yet) present in the target grid.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MatrixRow {
    vals: Vec<f64>,
    globals: Vec<i64>,
    locals: Vec<Option<NodeHandle>>,
}

impl MatrixRow {
    /// New row with every column unresolved.
    pub fn new(vals: Vec<f64>, globals: Vec<i64>) -> Self {
        debug_assert_eq!(vals.len(), globals.len());
        let locals = vec![None; globals.len()];
        Self {
            vals,
            globals,
            locals,
        }
    }

    /// Copy a distributed-matrix row, resolving columns with `resolve`.
    pub fn from_sparse(row: &SparseRow, mut resolve: impl FnMut(i64) -> Option<NodeHandle>) -> Self {
        Self {
            vals: row.vals.clone(),
            globals: row.cols.clone(),
            locals: row.cols.iter().map(|&g| resolve(g)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.globals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.globals.is_empty()
    }

    pub fn vals(&self) -> &[f64] {
        &self.vals
    }

    pub fn globals(&self) -> &[i64] {
        &self.globals
    }

    pub fn locals(&self) -> &[Option<NodeHandle>] {
        &self.locals
    }

    /// `(global, local)` per column.
    pub fn columns(&self) -> impl Iterator<Item = (i64, Option<NodeHandle>)> + '_ {
        self.globals.iter().copied().zip(self.locals.iter().copied())
    }

    /// Number of columns still unresolved.
    pub fn num_unresolved(&self) -> usize {
        self.locals.iter().filter(|l| l.is_none()).count()
    }

    /// Fill unresolved columns through `lookup`; resolved columns are left untouched.
    pub fn resolve_missing(&mut self, mut lookup: impl FnMut(i64) -> Option<NodeHandle>) {
        for (local, &global) in self.locals.iter_mut().zip(&self.globals) {
            if local.is_none() {
                *local = lookup(global);
            }
        }
    }

    /// Position of column `j` in `target` (the grid the columns index into), or `-1`.
    pub fn local_column(&self, j: usize, target: &CompGrid) -> i64 {
        match self.locals[j] {
            Some(h) => target.local_index(h) as i64,
            None => -1,
        }
    }
}
