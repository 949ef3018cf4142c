//! Distance-bounded searches over the rows of a composite grid.
//!
//! Both searches walk `A` row by row from a starting node, labelling each
//! visited node with the remaining distance budget. A node is revisited only
//! when it is reached with a strictly larger budget, so every node is expanded
//! at most once per budget value.

use crate::comp_grid::{CompGrid, NodeHandle};
use hashbrown::HashMap;

/// Off-process nodes requested from one neighbor, each with the distance still to cover.
///
/// Entries keep their first-insertion order; inserting a global index again
/// keeps the larger distance.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestList {
    entries: Vec<(i64, usize)>,
    index: HashMap<i64, usize>,
}

impl RequestList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, global: i64, distance: usize) {
        match self.index.get(&global) {
            Some(&pos) => {
                let d = &mut self.entries[pos].1;
                *d = (*d).max(distance);
            }
            None => {
                self.index.insert(global, self.entries.len());
                self.entries.push((global, distance));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    pub fn get(&self, global: i64) -> Option<usize> {
        self.index.get(&global).map(|&pos| self.entries[pos].1)
    }

    /// `(global, distance)` in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, usize)> + '_ {
        self.entries.iter().copied()
    }
}

/// Label every node within distance `m` of `node` in `add_flag`.
///
/// Columns that are not present locally are recorded in `requests` with the
/// budget `m` that reached them; the owning rank continues the search.
pub fn expand_neighbors(
    grid: &CompGrid,
    node: NodeHandle,
    m: usize,
    add_flag: &mut [usize],
    requests: &mut RequestList,
) {
    for (global, local) in grid.a_row(node).columns() {
        match local {
            Some(nb) => {
                if add_flag[nb.index()] < m {
                    add_flag[nb.index()] = m;
                    if m > 1 {
                        expand_neighbors(grid, nb, m - 1, add_flag, requests);
                    }
                }
            }
            None => requests.insert(global, m),
        }
    }
}

/// Coarse-level flags raised while expanding a psi-composite region.
#[derive(Debug)]
pub struct CoarseMarks<'a> {
    pub flags: &'a mut [usize],
    /// Value written for every coarse counterpart (`padding + 1`).
    pub value: usize,
    /// Set once anything was flagged.
    pub touched: bool,
}

impl<'a> CoarseMarks<'a> {
    pub fn new(flags: &'a mut [usize], value: usize) -> Self {
        Self {
            flags,
            value,
            touched: false,
        }
    }

    fn mark(&mut self, grid: &CompGrid, h: NodeHandle) {
        if let Some(c) = grid.coarse_of(h) {
            let f = &mut self.flags[c.index()];
            *f = (*f).max(self.value);
            self.touched = true;
        }
    }
}

/// Local-only variant of [`expand_neighbors`] used to build psi-composite regions.
///
/// With `coarse`, the coarse counterpart of `node` and of every node reached
/// on the last step is flagged on the next level. Returns the number of
/// columns that could not be followed because their node is missing.
pub fn expand_psi_composite(
    grid: &CompGrid,
    node: NodeHandle,
    m: usize,
    add_flag: &mut [usize],
    mut coarse: Option<&mut CoarseMarks<'_>>,
) -> usize {
    let mut errors = 0;
    for (_, local) in grid.a_row(node).columns() {
        let Some(nb) = local else {
            errors += 1;
            continue;
        };
        if add_flag[nb.index()] < m {
            add_flag[nb.index()] = m;
            if m > 1 {
                errors += expand_psi_composite(grid, nb, m - 1, add_flag, coarse.as_deref_mut());
            }
        }
        if m == 1 {
            if let Some(c) = coarse.as_deref_mut() {
                c.mark(grid, nb);
            }
        }
    }
    if let Some(c) = coarse {
        c.mark(grid, node);
    }
    errors
}
