//! End-to-end orchestration: train, evaluate, predict and choose among the
//! checkpoints a run produced.

use crate::components::metrics::{MetricProcessor, Metrics, PredictionProcessor};
use crate::components::network::Network;
use crate::data::DataLoader;
use crate::error::{ExecutorError, Result};
use crate::inference::predictor::Predictor;
use crate::tensor::Tensor;
use crate::training::checkpoint::CheckpointManager;
use crate::training::executor::{Executor, RunContext};
use crate::training::trainer::{Trainer, TrainingSummary};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Metrics of one checkpoint from a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointResult {
    pub path: PathBuf,
    pub metrics: Metrics,
}

/// Index of the checkpoint winning the most per-target comparisons of
/// `target_metric`. Each target votes for the result with the highest value
/// (first one on ties, NaN never wins); vote ties go to the lowest index.
pub fn select_best(results: &[Metrics], target_metric: &str) -> Result<usize> {
    if results.is_empty() {
        return Err(ExecutorError::CheckpointNotFound(None));
    }
    let columns = results
        .iter()
        .map(|metrics| {
            metrics.get(target_metric).ok_or_else(|| {
                ExecutorError::metric(format!("results do not contain '{target_metric}'"))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let targets = columns.iter().map(|c| c.len()).min().unwrap_or(0);

    let mut votes = vec![0usize; results.len()];
    for target in 0..targets {
        let mut winner: Option<(usize, f64)> = None;
        for (index, column) in columns.iter().enumerate() {
            let value = column[target];
            if value.is_nan() {
                continue;
            }
            if winner.is_none_or(|(_, best)| value > best) {
                winner = Some((index, value));
            }
        }
        if let Some((index, _)) = winner {
            votes[index] += 1;
        }
    }

    let mut best = 0;
    for (index, count) in votes.iter().enumerate() {
        if *count > votes[best] {
            best = index;
        }
    }
    debug!(votes = ?votes, best, "Checkpoint votes");
    Ok(best)
}

pub struct Pipeliner {
    ctx: RunContext,
    trainer: Trainer,
    processor: PredictionProcessor,
    predictor: Option<Predictor>,
    checkpoint_path: Option<PathBuf>,
    checkpoints: CheckpointManager,
}

impl std::fmt::Debug for Pipeliner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeliner")
            .field("checkpoint_path", &self.checkpoint_path)
            .field("predictor", &self.predictor.is_some())
            .field("output_dir", &self.checkpoints.output_dir())
            .finish()
    }
}

impl Pipeliner {
    /// `checkpoint_path` is both the checkpoint training resumes from and the
    /// one the predictor loads until [`Pipeliner::find_best_checkpoint`]
    /// re-points it.
    pub fn new(ctx: RunContext, checkpoint_path: Option<PathBuf>) -> Result<Self> {
        let processor = PredictionProcessor::new(&ctx.config.test_metrics, ctx.config.threshold)?;
        let trainer = Trainer::new(ctx.clone(), checkpoint_path.clone())?;
        let checkpoints = CheckpointManager::new(&ctx.config.output_path);
        Ok(Self {
            ctx,
            trainer,
            processor,
            predictor: None,
            checkpoint_path,
            checkpoints,
        })
    }

    pub fn checkpoint_path(&self) -> Option<&Path> {
        self.checkpoint_path.as_deref()
    }

    pub fn set_checkpoint_path(&mut self, path: Option<PathBuf>) {
        self.checkpoint_path = path;
        self.predictor = None;
    }

    pub fn trainer(&self) -> &Trainer {
        &self.trainer
    }

    pub fn predictor(&self) -> Option<&Predictor> {
        self.predictor.as_ref()
    }

    /// (Re)build the predictor from the current checkpoint path.
    pub fn initialize_predictor(&mut self) -> Result<&mut Predictor> {
        let predictor = Predictor::new(self.ctx.clone(), self.checkpoint_path.clone())?;
        Ok(self.predictor.insert(predictor))
    }

    fn predictor_mut(&mut self) -> Result<&mut Predictor> {
        if self.predictor.is_none() {
            self.initialize_predictor()?;
        }
        self.predictor
            .as_mut()
            .ok_or_else(|| ExecutorError::config("predictor is not initialized"))
    }

    pub fn train(
        &mut self,
        loader: &dyn DataLoader,
        val_loader: Option<&dyn DataLoader>,
    ) -> Result<TrainingSummary> {
        self.trainer.run(loader, val_loader)
    }

    pub fn evaluate(&mut self, loader: &dyn DataLoader) -> Result<Metrics> {
        let (ground_truth, logits) = self.predictor_mut()?.run_all(loader)?;
        self.processor.compute_metrics(&ground_truth, &logits)
    }

    /// Ground truth and logits, building the predictor on first use.
    pub fn predict(&mut self, loader: &dyn DataLoader) -> Result<(Vec<Tensor>, Vec<Tensor>)> {
        self.predictor_mut()?.run_all(loader)
    }

    /// Every checkpoint under the output directory, shortest path first.
    pub fn find_all_checkpoints(&self) -> Vec<PathBuf> {
        self.checkpoints.discover()
    }

    /// Evaluate each discovered checkpoint with a fresh predictor.
    pub fn evaluate_all(&self, loader: &dyn DataLoader) -> Result<Vec<CheckpointResult>> {
        let paths = self.find_all_checkpoints();
        info!(count = paths.len(), "Evaluating checkpoints");
        paths
            .into_iter()
            .map(|path| -> Result<CheckpointResult> {
                let mut predictor = Predictor::new(self.ctx.clone(), Some(path.clone()))?;
                let (ground_truth, logits) = predictor.run_all(loader)?;
                let metrics = self.processor.compute_metrics(&ground_truth, &logits)?;
                debug!(path = %path.display(), metrics = ?metrics, "Checkpoint evaluated");
                Ok(CheckpointResult { path, metrics })
            })
            .collect()
    }

    /// Evaluate every checkpoint, pick the majority-vote winner on the
    /// target metric, point the predictor at it and return its path.
    pub fn find_best_checkpoint(&mut self, loader: &dyn DataLoader) -> Result<PathBuf> {
        let results = self.evaluate_all(loader)?;
        if results.is_empty() {
            return Err(ExecutorError::CheckpointNotFound(Some(
                self.checkpoints.output_dir().to_path_buf(),
            )));
        }
        let metrics: Vec<Metrics> = results.iter().map(|r| r.metrics.clone()).collect();
        let index = select_best(&metrics, &self.ctx.config.target_metric)?;
        let best = results[index].path.clone();
        info!(path = %best.display(), "Best checkpoint selected");

        self.checkpoint_path = Some(best.clone());
        self.initialize_predictor()?;
        Ok(best)
    }

    /// A fresh network restored from the current checkpoint.
    pub fn get_network(&self) -> Result<Box<dyn Network>> {
        let mut executor = Executor::new(self.ctx.clone(), self.checkpoint_path.clone())?;
        executor.load_checkpoint(false, None, None)?;
        Ok(executor.into_network())
    }
}
