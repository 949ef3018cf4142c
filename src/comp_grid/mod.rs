//! Composite grids: per-level local extended neighborhoods.
//!
//! A [`CompGrid`] starts out holding the rows this rank owns on one level and
//! grows as the setup merges rows received from other ranks. The matching
//! [`CompGridCommPkg`] records who exchanges what on every level.

pub mod comm_pkg;
mod finalize;
mod grid;
mod matrix_row;

pub use comm_pkg::{CompGridCommPkg, LevelCommPkg};
pub use finalize::{CompositeCsr, FinalizedGrid, finalize_grids, resolve_local_indices};
pub use grid::{CompGrid, IncomingNode, MergeOutcome, NodeHandle};
pub use matrix_row::MatrixRow;
