//! Structural self-checks for composite-grid data.

use crate::compgrid_error::CompGridError;

/// Invariant checks for composite-grid structures.
///
/// For a [`crate::comp_grid::CompGrid`]: per-node arrays of equal length, an
/// `order`/`slot_of` pair that invert each other, an untouched owned prefix,
/// and a strictly ascending non-owned suffix disjoint from the owned range.
pub trait DebugInvariants {
    /// Assert invariants in debug builds or when invariant checking is enabled.
    fn debug_assert_invariants(&self);
    /// Validate invariants and return the first error encountered.
    fn validate_invariants(&self) -> Result<(), CompGridError>;
}

/// Panic with the first violation reported by a `Result`-returning check.
///
/// Compiled in under `debug_assertions` or the `strict-invariants` feature and
/// a no-op otherwise. Composite grids run it after initialization from an AMG
/// level and after every merge of received nodes. The message is prefixed with
/// `[invariants]` and the given context.
#[macro_export]
macro_rules! debug_invariants {
    ($expr:expr, $($ctx:tt)*) => {
        #[cfg(any(debug_assertions, feature = "strict-invariants"))]
        if let Err(e) = $expr {
            panic!(concat!("[invariants] ", $($ctx)*, ": {}"), e);
        }
    };
}
