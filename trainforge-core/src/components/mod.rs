//! Pluggable building blocks resolved by name from configuration.

pub mod criterion;
pub mod metrics;
pub mod network;
pub mod optimizer;
pub mod registry;
pub mod scheduler;

pub use criterion::{Criterion, LossOutput};
pub use metrics::{Aggregator, MetricProcessor, Metrics, PredictionProcessor};
pub use network::{NamedOutputs, Network, Outputs, StateDict};
pub use optimizer::Optimizer;
pub use registry::ComponentRegistry;
pub use scheduler::{Cadence, Scheduler};
