pub mod evaluator;
pub mod predictor;

pub use evaluator::{Evaluator, ThresholdFinder};
pub use predictor::{Prediction, Predictor};
