//! CompGridError: Unified error type for the composite-grid setup.
//!
//! Transport and wire failures are fatal and surface as `Err`. Data-consistency
//! problems found while building composite grids are counted and logged
//! instead (see [`crate::setup::SetupStatus`]).

use thiserror::Error;

/// Boxed source error carried by communication failures.
pub type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Plain-string error used as the `source` of [`CompGridError::CommError`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CommError(pub String);

/// Unified error type for composite-grid operations.
#[derive(Debug, Error)]
pub enum CompGridError {
    /// A message to or from `neighbor` failed or had the wrong size.
    #[error("communication with rank {neighbor} failed: {source}")]
    CommError {
        neighbor: usize,
        #[source]
        source: BoxedSource,
    },
    /// A reader asked for more words than the buffer holds.
    #[error("wire buffer underflow: needed {needed} more word(s) at offset {offset}, buffer has {len}")]
    WireUnderflow {
        offset: usize,
        needed: usize,
        len: usize,
    },
    /// A writer produced a different number of words than it reserved.
    #[error("wire buffer length mismatch: reserved {expected} words, wrote {actual}")]
    WireLengthMismatch { expected: usize, actual: usize },
    /// A wire word could not be converted to the expected integer range.
    #[error("wire value {value} out of range for {what}")]
    WireValueOutOfRange { value: i64, what: &'static str },
    /// Setup parameters are unusable.
    #[error("invalid setup parameters: {0}")]
    InvalidParams(String),
    /// Hierarchy inputs disagree with each other (missing P, wrong lengths, ...).
    #[error("level {level}: {reason}")]
    LevelMismatch { level: usize, reason: String },
    /// Send and receive neighbor sets are not symmetric.
    #[error("level {level}: rank {rank} sends to rank {peer} but not the reverse")]
    AsymmetricTopology {
        level: usize,
        rank: usize,
        peer: usize,
    },
    /// A composite-grid invariant does not hold.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl CompGridError {
    /// Shorthand for a [`CompGridError::CommError`] with a string message.
    pub fn comm(neighbor: usize, msg: impl Into<String>) -> Self {
        CompGridError::CommError {
            neighbor,
            source: Box::new(CommError(msg.into())),
        }
    }
}
