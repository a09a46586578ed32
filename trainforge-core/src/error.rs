//! Error types for the trainforge-core crate.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for executor operations.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// No checkpoint is configured, or the configured file does not exist.
    ///
    /// Recoverable: trainers treat it as "start from scratch".
    #[error("Checkpoint not found: {}", .0.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "no checkpoint path configured".to_string()))]
    CheckpointNotFound(Option<PathBuf>),

    #[error("Corrupt checkpoint {path}: {reason}")]
    CorruptCheckpoint { path: PathBuf, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("Component error: {0}")]
    Component(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Numerical error: {0}")]
    Numerical(String),

    #[error("Metric error: {0}")]
    Metric(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Plot error: {0}")]
    Plot(String),

    #[error("Observer '{event}' failed: {reason}")]
    Observer { event: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Configuration loading error: {0}")]
    Figment(#[from] Box<figment::Error>),
}

impl ExecutorError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    pub fn component(msg: impl Into<String>) -> Self {
        Self::Component(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn numerical(msg: impl Into<String>) -> Self {
        Self::Numerical(msg.into())
    }

    pub fn metric(msg: impl Into<String>) -> Self {
        Self::Metric(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub fn plot(msg: impl Into<String>) -> Self {
        Self::Plot(msg.into())
    }

    pub fn observer(event: &str, reason: impl Into<String>) -> Self {
        Self::Observer {
            event: event.to_string(),
            reason: reason.into(),
        }
    }

    /// True for the one recoverable error: a missing checkpoint.
    pub fn is_checkpoint_not_found(&self) -> bool {
        matches!(self, Self::CheckpointNotFound(_))
    }
}

pub type Result<T, E = ExecutorError> = std::result::Result<T, E>;
