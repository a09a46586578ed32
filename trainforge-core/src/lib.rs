//! # Trainforge Core
//!
//! Executors for supervised neural-network workflows: a trainer with
//! exponential loss tracking and best-model checkpointing, a predictor with
//! optional MC-dropout and hidden-layer probing, evaluators, a checkpoint
//! sweep that picks the best model by majority vote, and a learning-rate
//! range search. Every executor publishes lifecycle events that observers
//! can use to rewrite intermediate values.

pub mod batch;
pub mod components;
pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod inference;
pub mod persistence;
pub mod pipeline;
pub mod plot;
pub mod progress;
pub mod tensor;
pub mod training;

pub use batch::{Batch, InputValue, Inputs};
pub use config::{ComponentSpec, Config, InferenceMode, Overrides, load_config};
pub use data::{DataLoader, InMemoryLoader, JsonDataset};
pub use error::{ExecutorError, Result};
pub use events::{EventManager, Payload};
pub use inference::{Evaluator, Prediction, Predictor, ThresholdFinder};
pub use pipeline::{CheckpointResult, Pipeliner};
pub use tensor::{Device, Tensor};
pub use training::{LearningRateFinder, RunContext, Trainer};
