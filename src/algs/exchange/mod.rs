//! Round-based message exchange used by every setup phase.
//!
//! Each round posts all receives, then all sends, then waits. Every handle is
//! drained before returning, even when an error is detected on the way.

pub mod data_exchange;
pub mod size_exchange;

pub use data_exchange::{broadcast_words, exchange_words};
pub use size_exchange::exchange_counts;
