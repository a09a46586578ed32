//! Training-side executors and the state they share.

pub mod checkpoint;
pub mod executor;
pub mod lr_finder;
pub mod trackers;
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointManager};
pub use executor::{Executor, RunContext};
pub use lr_finder::{LearningRateFinder, LrFinderReport, LrHistory, LrSearch};
pub use trackers::ExponentialTracker;
pub use trainer::{EpochReport, SchedulerStrategy, Trainer, TrainerState, TrainingSummary};
