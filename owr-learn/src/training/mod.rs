//! Training infrastructure shared by the learners.
//!
//! - [`Trainer`] - live network, per-group optimizer, epoch/validate/test passes
//! - [`CheckpointManager`] - JSON states with a hashed manifest per run
//! - [`RunLogs`] - per-group metrics returned to the caller

pub mod checkpoint;
pub mod logs;
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointManager};
pub use logs::RunLogs;
pub use trainer::{EpochStats, TestOutcome, Trainer, eval_batches};
