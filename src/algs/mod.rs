//! Communication plumbing shared by every setup phase.

pub mod communicator;
pub mod exchange;
pub mod wire;

pub use communicator::{CommTag, Communicator, NoComm, RayonComm, Wait};
pub use exchange::{broadcast_words, exchange_counts, exchange_words};
