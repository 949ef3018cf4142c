//! Per-level composite grid with stable node handles.
//!
//! Node payload lives in an arena indexed by [`NodeHandle`] and never moves.
//! The local ordering (owned prefix in original row order, then the non-owned
//! suffix sorted by global index) is a separate indirection table, so merging
//! fresh nodes only rebuilds `order`/`slot_of` and every handle recorded
//! elsewhere stays valid.

use super::finalize::FinalizedGrid;
use super::matrix_row::MatrixRow;
use crate::compgrid_error::CompGridError;
use crate::debug_invariants::DebugInvariants;
use crate::hierarchy::AmgLevel;
use itertools::Itertools;
use std::io::Write;
use std::ops::Range;

/// Stable identity of a node within one level's composite grid.
///
/// Owned nodes have handle == owned local index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(usize);

impl NodeHandle {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

/// A node received from another rank, before it is merged.
#[derive(Clone, Debug, PartialEq)]
pub struct IncomingNode {
    pub global: i64,
    pub residual: f64,
    pub ghost: bool,
    pub coarse_global: i64,
    pub a_row: MatrixRow,
    pub p_row: Option<MatrixRow>,
}

/// Result of merging one sorted batch of incoming nodes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Per incoming node: the new handle, or `None` when it was discarded.
    pub dest: Vec<Option<NodeHandle>>,
    pub added: usize,
}

#[derive(Copy, Clone, Debug)]
enum Slot {
    Discard,
    Duplicate(NodeHandle),
    New,
}

/// Composite grid of one multigrid level.
#[derive(Clone, Debug)]
pub struct CompGrid {
    level: usize,
    has_coarse: bool,
    owned: Range<i64>,

    global: Vec<i64>,
    residual: Vec<f64>,
    ghost: Vec<bool>,
    coarse_global: Vec<i64>,
    coarse: Vec<Option<NodeHandle>>,
    a_rows: Vec<MatrixRow>,
    p_rows: Vec<MatrixRow>,

    order: Vec<NodeHandle>,
    slot_of: Vec<usize>,
    capacity: usize,

    finalized: Option<FinalizedGrid>,
}

/// Global-to-handle lookup over borrowed grid fields.
struct Lookup<'a> {
    owned: Range<i64>,
    suffix: &'a [NodeHandle],
    global: &'a [i64],
}

impl Lookup<'_> {
    fn find(&self, g: i64) -> Option<NodeHandle> {
        if self.owned.contains(&g) {
            return Some(NodeHandle((g - self.owned.start) as usize));
        }
        self.suffix
            .binary_search_by_key(&g, |h| self.global[h.0])
            .ok()
            .map(|i| self.suffix[i])
    }
}

impl CompGrid {
    /// Empty grid for `level`; `has_coarse` is false only on the coarsest level.
    pub fn new(level: usize, has_coarse: bool) -> Self {
        Self {
            level,
            has_coarse,
            owned: 0..0,
            global: Vec::new(),
            residual: Vec::new(),
            ghost: Vec::new(),
            coarse_global: Vec::new(),
            coarse: Vec::new(),
            a_rows: Vec::new(),
            p_rows: Vec::new(),
            order: Vec::new(),
            slot_of: Vec::new(),
            capacity: 0,
            finalized: None,
        }
    }

    /// Create and seed a grid from this rank's share of a hierarchy level.
    pub fn from_level(level: usize, input: &AmgLevel) -> Result<Self, CompGridError> {
        let mut grid = Self::new(level, input.p.is_some());
        grid.initialize_from_level(input)?;
        Ok(grid)
    }

    /// Seed owned nodes, residuals and rows from `input`, replacing any content.
    ///
    /// Owned columns of `A` and owned coarse columns of `P` are resolved
    /// immediately; off-process columns stay unresolved.
    pub fn initialize_from_level(&mut self, input: &AmgLevel) -> Result<(), CompGridError> {
        if input.p.is_some() != self.has_coarse {
            return Err(CompGridError::LevelMismatch {
                level: self.level,
                reason: "interpolation presence disagrees with the grid".into(),
            });
        }
        let n = input.num_owned();
        if input.residual.len() != n {
            return Err(CompGridError::LevelMismatch {
                level: self.level,
                reason: format!("residual has {} entries for {n} rows", input.residual.len()),
            });
        }
        let first = input.a.first_row;
        self.owned = first..first + n as i64;
        self.global = self.owned.clone().collect();
        self.residual = input.residual.clone();
        self.ghost = vec![false; n];

        let owned = self.owned.clone();
        self.a_rows = input
            .a
            .rows
            .iter()
            .map(|row| {
                MatrixRow::from_sparse(row, |g| {
                    owned
                        .contains(&g)
                        .then(|| NodeHandle((g - owned.start) as usize))
                })
            })
            .collect();

        match &input.p {
            Some(p) => {
                if input.cf_marker.len() != n {
                    return Err(CompGridError::LevelMismatch {
                        level: self.level,
                        reason: format!("cf_marker has {} entries for {n} rows", input.cf_marker.len()),
                    });
                }
                self.coarse_global = input.coarse_global_indices();
                self.coarse = self
                    .coarse_global
                    .iter()
                    .map(|&cg| (cg >= 0).then(|| NodeHandle((cg - input.coarse_first_index) as usize)))
                    .collect();
                let num_coarse = self.coarse.iter().flatten().count() as i64;
                let coarse_owned = input.coarse_first_index..input.coarse_first_index + num_coarse;
                self.p_rows = p
                    .rows
                    .iter()
                    .map(|row| {
                        MatrixRow::from_sparse(row, |g| {
                            coarse_owned
                                .contains(&g)
                                .then(|| NodeHandle((g - coarse_owned.start) as usize))
                        })
                    })
                    .collect();
            }
            None => {
                self.coarse_global = vec![-1; n];
                self.coarse = vec![None; n];
                self.p_rows = Vec::new();
            }
        }

        self.order = (0..n).map(NodeHandle).collect();
        self.slot_of = (0..n).collect();
        self.capacity = self.capacity.max(n);
        self.finalized = None;
        crate::debug_invariants!(self.validate_invariants(), "CompGrid after initialization");
        Ok(())
    }

    /// Grow backing storage to hold at least `new_capacity` nodes; content is preserved.
    pub fn resize(&mut self, new_capacity: usize) {
        if new_capacity <= self.capacity {
            return;
        }
        let extra = new_capacity - self.global.len();
        self.global.reserve_exact(extra);
        self.residual.reserve_exact(extra);
        self.ghost.reserve_exact(extra);
        self.coarse_global.reserve_exact(extra);
        self.coarse.reserve_exact(extra);
        self.a_rows.reserve_exact(extra);
        if self.has_coarse {
            self.p_rows.reserve_exact(extra);
        }
        self.order.reserve_exact(extra);
        self.slot_of.reserve_exact(extra);
        self.capacity = new_capacity;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn level(&self) -> usize {
        self.level
    }

    /// `false` on the coarsest level, which has no `P`, ghost markers or coarse links.
    pub fn has_coarse(&self) -> bool {
        self.has_coarse
    }

    pub fn num_nodes(&self) -> usize {
        self.order.len()
    }

    pub fn num_owned_nodes(&self) -> usize {
        (self.owned.end - self.owned.start) as usize
    }

    pub fn num_non_owned_nodes(&self) -> usize {
        self.num_nodes() - self.num_owned_nodes()
    }

    /// Size of the handle space; per-node scratch arrays are sized by this.
    pub fn num_handles(&self) -> usize {
        self.global.len()
    }

    /// Owned global indices as a half-open range.
    pub fn owned_range(&self) -> Range<i64> {
        self.owned.clone()
    }

    pub fn is_owned_global(&self, global: i64) -> bool {
        self.owned.contains(&global)
    }

    /// Global index of the node at local position `local`.
    pub fn global_index(&self, local: usize) -> i64 {
        self.global[self.order[local].0]
    }

    pub fn handle_at(&self, local: usize) -> NodeHandle {
        self.order[local]
    }

    /// Current local position of `handle`.
    pub fn local_index(&self, handle: NodeHandle) -> usize {
        self.slot_of[handle.0]
    }

    /// Handles in local order.
    pub fn handles(&self) -> impl Iterator<Item = NodeHandle> + '_ {
        self.order.iter().copied()
    }

    /// The sorted non-owned suffix.
    pub fn non_owned(&self) -> &[NodeHandle] {
        &self.order[self.num_owned_nodes()..]
    }

    /// Global indices in local order.
    pub fn global_indices(&self) -> Vec<i64> {
        self.handles().map(|h| self.global[h.0]).collect()
    }

    /// Ghost markers in local order (all `false` on the coarsest level).
    pub fn ghost_markers(&self) -> Vec<bool> {
        self.handles().map(|h| self.ghost[h.0]).collect()
    }

    fn lookup(&self) -> Lookup<'_> {
        Lookup {
            owned: self.owned.clone(),
            suffix: self.non_owned(),
            global: &self.global,
        }
    }

    /// Handle of the node with global index `global`, if present.
    ///
    /// Owned indices are answered by a range check, others by binary search of
    /// the sorted suffix.
    pub fn find_global(&self, global: i64) -> Option<NodeHandle> {
        self.lookup().find(global)
    }

    pub fn global_of(&self, h: NodeHandle) -> i64 {
        self.global[h.0]
    }

    pub fn residual_of(&self, h: NodeHandle) -> f64 {
        self.residual[h.0]
    }

    pub fn is_ghost(&self, h: NodeHandle) -> bool {
        self.ghost[h.0]
    }

    /// Coarse global index, `-1` for F-points and on the coarsest level.
    pub fn coarse_global_of(&self, h: NodeHandle) -> i64 {
        self.coarse_global[h.0]
    }

    /// Resolved coarse counterpart on the next level.
    pub fn coarse_of(&self, h: NodeHandle) -> Option<NodeHandle> {
        self.coarse[h.0]
    }

    pub fn a_row(&self, h: NodeHandle) -> &MatrixRow {
        &self.a_rows[h.0]
    }

    pub fn p_row(&self, h: NodeHandle) -> Option<&MatrixRow> {
        if self.has_coarse {
            self.p_rows.get(h.0)
        } else {
            None
        }
    }

    /// Local position at which the owned block sorts among the non-owned suffix.
    pub fn owned_insert_position(&self) -> usize {
        let n_owned = self.num_owned_nodes();
        let suffix = self.non_owned();
        let (Some(first), Some(last)) = (suffix.first(), suffix.last()) else {
            return n_owned;
        };
        if n_owned == 0 {
            0
        } else if self.owned.end - 1 < self.global[first.0] {
            n_owned
        } else if self.owned.start > self.global[last.0] {
            self.num_nodes()
        } else {
            n_owned + suffix.partition_point(|h| self.global[h.0] < self.owned.start)
        }
    }

    /// All handles in ascending global order.
    pub fn handles_by_global(&self) -> impl Iterator<Item = NodeHandle> + '_ {
        let n_owned = self.num_owned_nodes();
        let insert = self.owned_insert_position();
        self.order[n_owned..insert]
            .iter()
            .chain(&self.order[..n_owned])
            .chain(&self.order[insert..])
            .copied()
    }

    /// Merge a batch of incoming nodes sorted by global index.
    ///
    /// Owned nodes are discarded. A node already present is discarded too,
    /// but a real incoming copy upgrades a ghost to real. Everything else gets
    /// a fresh handle and joins the sorted suffix. Storage grows before any
    /// node is added.
    pub fn merge_incoming(&mut self, incoming: Vec<IncomingNode>) -> Result<MergeOutcome, CompGridError> {
        let suffix: Vec<NodeHandle> = self.non_owned().to_vec();
        let mut slots = Vec::with_capacity(incoming.len());
        let mut added = 0;
        let mut e = 0;
        let mut prev: Option<i64> = None;
        for node in &incoming {
            if prev.is_some_and(|p| p >= node.global) {
                return Err(CompGridError::InvariantViolation(format!(
                    "level {}: incoming node {} out of order",
                    self.level, node.global
                )));
            }
            prev = Some(node.global);
            if node.p_row.is_some() != self.has_coarse {
                return Err(CompGridError::LevelMismatch {
                    level: self.level,
                    reason: format!("incoming node {} has the wrong row set", node.global),
                });
            }
            if self.owned.contains(&node.global) {
                slots.push(Slot::Discard);
                continue;
            }
            while e < suffix.len() && self.global[suffix[e].0] < node.global {
                e += 1;
            }
            if e < suffix.len() && self.global[suffix[e].0] == node.global {
                slots.push(Slot::Duplicate(suffix[e]));
            } else {
                slots.push(Slot::New);
                added += 1;
            }
        }

        let needed = self.num_handles() + added;
        if needed > self.capacity {
            self.resize(needed.max(2 * self.capacity));
        }

        let mut dest = Vec::with_capacity(incoming.len());
        let mut fresh = Vec::with_capacity(added);
        for (node, slot) in incoming.into_iter().zip(slots) {
            match slot {
                Slot::Discard => dest.push(None),
                Slot::Duplicate(h) => {
                    if self.has_coarse && !node.ghost {
                        self.ghost[h.0] = false;
                    }
                    dest.push(None);
                }
                Slot::New => {
                    let h = self.push_node(node);
                    fresh.push(h);
                    dest.push(Some(h));
                }
            }
        }

        let global = &self.global;
        let merged: Vec<NodeHandle> = suffix
            .into_iter()
            .merge_by(fresh, |a, b| global[a.0] < global[b.0])
            .collect();
        let n_owned = self.num_owned_nodes();
        self.order.truncate(n_owned);
        self.order.extend(merged);
        self.reindex();
        self.finalized = None;
        crate::debug_invariants!(self.validate_invariants(), "CompGrid after merge");
        Ok(MergeOutcome { dest, added })
    }

    fn push_node(&mut self, node: IncomingNode) -> NodeHandle {
        let h = NodeHandle(self.global.len());
        self.global.push(node.global);
        self.residual.push(node.residual);
        self.ghost.push(self.has_coarse && node.ghost);
        self.coarse_global.push(if self.has_coarse { node.coarse_global } else { -1 });
        self.coarse.push(None);
        self.a_rows.push(node.a_row);
        if let Some(p) = node.p_row {
            self.p_rows.push(p);
        }
        h
    }

    fn reindex(&mut self) {
        self.slot_of.resize(self.global.len(), 0);
        for (pos, h) in self.order.iter().enumerate() {
            self.slot_of[h.0] = pos;
        }
    }

    /// Resolve `A` columns and coarse links that are still missing.
    ///
    /// Safe to repeat: links that are already resolved are never changed.
    pub fn finalize_local_indices(&mut self, coarse: Option<&CompGrid>) {
        let n_owned = self.num_owned_nodes();
        let lookup = Lookup {
            owned: self.owned.clone(),
            suffix: &self.order[n_owned..],
            global: &self.global,
        };
        for row in &mut self.a_rows {
            row.resolve_missing(|g| lookup.find(g));
        }
        if let Some(coarse) = coarse {
            for (link, &cg) in self.coarse.iter_mut().zip(&self.coarse_global) {
                if link.is_none() && cg >= 0 {
                    *link = coarse.find_global(cg);
                }
            }
        }
    }

    /// Resolve `P` columns against the next-coarser grid.
    pub fn finalize_local_indices_p(&mut self, coarse: &CompGrid) {
        for row in &mut self.p_rows {
            row.resolve_missing(|g| coarse.find_global(g));
        }
    }

    /// Final CSR form, present after [`super::finalize_grids`].
    pub fn finalized(&self) -> Option<&FinalizedGrid> {
        self.finalized.as_ref()
    }

    pub(crate) fn set_finalized(&mut self, f: FinalizedGrid) {
        self.finalized = Some(f);
    }

    /// Human-readable listing of every node in global order.
    pub fn dump_sorted<W: Write>(&self, mut out: W) -> std::io::Result<()> {
        writeln!(
            out,
            "level {}: {} nodes, {} owned ({}..{})",
            self.level,
            self.num_nodes(),
            self.num_owned_nodes(),
            self.owned.start,
            self.owned.end
        )?;
        for h in self.handles_by_global() {
            let row = self.a_row(h);
            write!(
                out,
                "{:>8} res {:<12e} {} coarse {:>6} | A:",
                self.global[h.0],
                self.residual[h.0],
                if self.ghost[h.0] { "ghost" } else { "real " },
                self.coarse_global[h.0]
            )?;
            for (g, v) in row.globals().iter().zip(row.vals()) {
                write!(out, " {g}:{v}")?;
            }
            if let Some(p) = self.p_row(h) {
                write!(out, " | P:")?;
                for (g, v) in p.globals().iter().zip(p.vals()) {
                    write!(out, " {g}:{v}")?;
                }
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

impl DebugInvariants for CompGrid {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "CompGrid invalid");
    }

    fn validate_invariants(&self) -> Result<(), CompGridError> {
        let bad = |msg: String| Err(CompGridError::InvariantViolation(format!("level {}: {msg}", self.level)));
        let n = self.global.len();

        // 1) per-handle arrays agree
        let lens = [
            self.residual.len(),
            self.ghost.len(),
            self.coarse_global.len(),
            self.coarse.len(),
            self.a_rows.len(),
            self.slot_of.len(),
            self.order.len(),
        ];
        if lens.iter().any(|&l| l != n) {
            return bad(format!("per-node arrays disagree: {n} handles vs {lens:?}"));
        }
        if self.has_coarse && self.p_rows.len() != n {
            return bad(format!("{} P rows for {n} handles", self.p_rows.len()));
        }
        if n > self.capacity {
            return bad(format!("{n} nodes exceed capacity {}", self.capacity));
        }

        // 2) order and slot_of are inverse permutations
        for (pos, h) in self.order.iter().enumerate() {
            if h.0 >= n || self.slot_of[h.0] != pos {
                return bad(format!("handle {} at position {pos} is not indexed back", h.0));
            }
        }

        // 3) owned prefix is the identity over the owned range
        let n_owned = self.num_owned_nodes();
        for (i, h) in self.order[..n_owned].iter().enumerate() {
            if h.0 != i || self.global[i] != self.owned.start + i as i64 {
                return bad(format!("owned position {i} was reordered"));
            }
        }

        // 4) suffix strictly ascending and disjoint from the owned range
        for (a, b) in self.non_owned().iter().tuple_windows() {
            if self.global[a.0] >= self.global[b.0] {
                return bad(format!(
                    "non-owned suffix not strictly ascending at {} >= {}",
                    self.global[a.0], self.global[b.0]
                ));
            }
        }
        if let Some(h) = self.non_owned().iter().find(|h| self.owned.contains(&self.global[h.0])) {
            return bad(format!("owned index {} appears in the non-owned suffix", self.global[h.0]));
        }
        Ok(())
    }
}
