//! Adaptive per-shard log scanner: head poll -> range compute -> filtered
//! fetch -> atomic append -> widen/narrow step.

mod partition;
mod scanner;

pub use partition::{event_id, partition_key};
pub use scanner::{compute_range, run, ScannerConfig};
