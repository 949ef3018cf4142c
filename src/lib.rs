//! # amgdd-compgrid
//!
//! Distributed construction of AMG-DD composite grids.
//!
//! Given a multigrid hierarchy partitioned across ranks (operator `A`,
//! interpolation `P`, residual and coarsening marker per level), every rank
//! builds one composite grid per level: its own nodes, plus real nodes within
//! `padding` graph hops of them, plus `num_ghost_layers` further ghost layers,
//! and on coarser levels the psi-composite region reached through `P`. The
//! resulting [`comp_grid::CompGridCommPkg`] records exactly which nodes each
//! neighbor sent and kept, ready for later residual and solution exchanges.
//!
//! ## Layout
//! - [`hierarchy`]: per-level inputs (`ParCsrMatrix`, row partitions).
//! - [`comp_grid`]: the composite grid with stable node handles, its
//!   communication package and the finalized positional CSR.
//! - [`setup`]: neighbor discovery, pack/unpack, the per-level driver
//!   [`setup::comp_grid_setup`] and the debug verification tests.
//! - [`algs`]: the [`algs::communicator::Communicator`] abstraction, the
//!   word-level wire format and the two-round exchange helpers.
//!
//! ## Determinism
//! Send and receive neighbor lists come out sorted by rank, and every
//! non-owned node list is ordered by global index, so two runs over the same
//! partitioned input produce identical grids and packages regardless of
//! message arrival order.
//!
//! ## Backends
//! [`algs::communicator::NoComm`] runs a single rank,
//! [`algs::communicator::RayonComm`] simulates several ranks on threads, and
//! `MpiComm` (feature `mpi-support`) runs over MPI. With the `rayon` feature the
//! per-neighbor buffers of a level are packed in parallel.
//!
//! ## Usage
//! ```toml
//! [dependencies]
//! amgdd-compgrid = "0.3"
//! # features = ["mpi-support", "rayon", "strict-invariants"]
//! ```

pub mod algs;
pub mod comp_grid;
pub mod compgrid_error;
pub mod debug_invariants;
pub mod hierarchy;
pub mod setup;

pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{Communicator, NoComm, RayonComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::comp_grid::{CompGrid, CompGridCommPkg, LevelCommPkg, NodeHandle};
    pub use crate::compgrid_error::CompGridError;
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::hierarchy::{AmgHierarchy, AmgLevel, ParCsrMatrix, RowPartition, SparseRow};
    pub use crate::setup::{SetupOutput, SetupParams, SetupStatus, comp_grid_setup};
}
