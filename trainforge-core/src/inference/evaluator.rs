use crate::components::metrics::{MetricProcessor, Metrics, PredictionProcessor};
use crate::data::DataLoader;
use crate::error::Result;
use crate::inference::predictor::Predictor;
use crate::training::executor::RunContext;
use std::path::PathBuf;
use tracing::info;

/// Scores a checkpoint on a dataset with the configured test metrics.
pub struct Evaluator {
    predictor: Predictor,
    processor: Box<dyn MetricProcessor>,
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("predictor", &self.predictor)
            .finish_non_exhaustive()
    }
}

impl Evaluator {
    pub fn new(ctx: RunContext, checkpoint_path: Option<PathBuf>) -> Result<Self> {
        let processor =
            PredictionProcessor::new(&ctx.config.test_metrics, ctx.config.threshold)?;
        let predictor = Predictor::new(ctx, checkpoint_path)?;
        Ok(Self::with_processor(predictor, Box::new(processor)))
    }

    pub fn with_processor(predictor: Predictor, processor: Box<dyn MetricProcessor>) -> Self {
        Self {
            predictor,
            processor,
        }
    }

    pub fn predictor(&self) -> &Predictor {
        &self.predictor
    }

    /// Per-metric, per-target values over the whole loader.
    pub fn run(&mut self, loader: &dyn DataLoader) -> Result<Metrics> {
        let (ground_truth, logits) = self.predictor.run_all(loader)?;
        let metrics = self.processor.compute_metrics(&ground_truth, &logits)?;
        info!(
            checkpoint = ?self.predictor.executor().checkpoint_path(),
            metrics = ?metrics,
            "Evaluation finished"
        );
        Ok(metrics)
    }
}

/// Picks a per-target decision threshold from a checkpoint's predictions.
#[derive(Debug)]
pub struct ThresholdFinder {
    evaluator: Evaluator,
}

impl ThresholdFinder {
    pub fn new(ctx: RunContext, checkpoint_path: Option<PathBuf>) -> Result<Self> {
        Ok(Self {
            evaluator: Evaluator::new(ctx, checkpoint_path)?,
        })
    }

    pub fn run(&mut self, loader: &dyn DataLoader) -> Result<Vec<f32>> {
        let (ground_truth, logits) = self.evaluator.predictor.run_all(loader)?;
        let thresholds = self
            .evaluator
            .processor
            .find_best_threshold(&ground_truth, &logits)?;
        info!(thresholds = ?thresholds, "Best thresholds found");
        Ok(thresholds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Batch, InputValue, Inputs};
    use crate::components::network::StateDict;
    use crate::config::{ComponentSpec, Config};
    use crate::data::InMemoryLoader;
    use crate::error::ExecutorError;
    use crate::tensor::Tensor;
    use crate::training::checkpoint::{Checkpoint, CheckpointManager};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn loader(rows: &[(f32, f32)]) -> InMemoryLoader {
        let batches = rows
            .chunks(2)
            .map(|chunk| {
                let x: Vec<Vec<f32>> = chunk.iter().map(|(x, _)| vec![*x]).collect();
                let y: Vec<Vec<f32>> = chunk.iter().map(|(_, y)| vec![*y]).collect();
                let inputs = Inputs::from([(
                    "features".to_string(),
                    InputValue::Tensor(Tensor::from_rows(&x).unwrap()),
                )]);
                Batch::new(inputs, Tensor::from_rows(&y).unwrap())
            })
            .collect();
        InMemoryLoader::new(batches)
    }

    /// An identity network `y = x` saved as the only checkpoint in `dir`.
    fn identity(dir: &TempDir, cfg: &Config) -> PathBuf {
        let mut model = StateDict::new();
        model.insert("output.weight".into(), Tensor::new(vec![1, 1], vec![1.0]).unwrap());
        model.insert("output.bias".into(), Tensor::zeros(&[1]));
        let path = dir.path().join("checkpoint.best.pt");
        CheckpointManager::new(&cfg.output_path)
            .save(&mut Checkpoint::weights_only(model), &path)
            .unwrap();
        path
    }

    fn config(dir: &TempDir, metrics: &[&str]) -> Config {
        Config {
            model: ComponentSpec::new("linear")
                .with_param("in_features", 1)
                .with_param("out_features", 1),
            test_metrics: metrics.iter().map(|m| m.to_string()).collect(),
            output_path: dir.path().to_path_buf(),
            show_progress: false,
            ..Config::default()
        }
    }

    #[test]
    fn test_perfect_predictions_score_perfectly() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, &["mae", "rmse"]);
        let path = identity(&dir, &cfg);
        let mut evaluator = Evaluator::new(RunContext::new(cfg), Some(path)).unwrap();
        let metrics = evaluator
            .run(&loader(&[(1.0, 1.0), (2.0, 2.0), (-3.0, -3.0)]))
            .unwrap();
        assert_eq!(metrics["mae"], vec![0.0]);
        assert_eq!(metrics["rmse"], vec![0.0]);
    }

    #[test]
    fn test_unknown_metric_fails_construction() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, &["bogus"]);
        let path = identity(&dir, &cfg);
        let err = Evaluator::new(RunContext::new(cfg), Some(path)).unwrap_err();
        assert!(matches!(err, ExecutorError::Metric(_)));
    }

    #[test]
    fn test_threshold_per_target() {
        let dir = TempDir::new().unwrap();
        let cfg = Config {
            criterion: ComponentSpec::new("bce_with_logits"),
            ..config(&dir, &["accuracy"])
        };
        let path = identity(&dir, &cfg);
        let mut finder = ThresholdFinder::new(RunContext::new(cfg), Some(path)).unwrap();
        let thresholds = finder
            .run(&loader(&[(-2.0, 0.0), (-1.0, 0.0), (1.0, 1.0), (2.0, 1.0)]))
            .unwrap();
        assert_eq!(thresholds.len(), 1);
        assert!((0.0..=1.0).contains(&thresholds[0]));
    }
}
