//! Learning-rate range search.
//!
//! Trains for a fixed number of iterations while the learning rate grows
//! exponentially, recording the smoothed loss at each step, and stops early
//! once the loss diverges. See <https://sgugger.github.io/how-do-you-find-a-good-learning-rate.html>.

use crate::components::scheduler::ExponentialRange;
use crate::data::DataLoader;
use crate::error::{ExecutorError, Result};
use crate::events::Payload;
use crate::persistence;
use crate::plot::{self, PlotOptions};
use crate::progress;
use crate::training::executor::RunContext;
use crate::training::trainer::{SchedulerStrategy, Trainer};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

pub const START_LR: f64 = 1e-5;
pub const END_LR: f64 = 100.0;
pub const NUM_ITERATIONS: usize = 100;
pub const DIVERGENCE_THRESHOLD: f64 = 5.0;
pub const SMOOTHING: f64 = 0.05;
pub const HISTORY_FILE: &str = "history.json";
pub const PLOT_FILE: &str = "lr_finder_results.png";
/// Trailing points left out of the plot and the suggestion.
pub const SKIP_END: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrSearch {
    pub start_lr: f64,
    pub end_lr: f64,
    pub num_iterations: usize,
    pub divergence_threshold: f64,
    /// Weight of the newest loss in the smoothed loss.
    pub smoothing: f64,
}

impl Default for LrSearch {
    fn default() -> Self {
        Self {
            start_lr: START_LR,
            end_lr: END_LR,
            num_iterations: NUM_ITERATIONS,
            divergence_threshold: DIVERGENCE_THRESHOLD,
            smoothing: SMOOTHING,
        }
    }
}

/// Learning rate used at each iteration and the smoothed loss it produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LrHistory {
    pub lr: Vec<f64>,
    pub loss: Vec<f64>,
}

impl LrHistory {
    /// Learning rate at the steepest descent of the smoothed loss, ignoring
    /// the last `skip_end` points.
    pub fn suggestion(&self, skip_end: usize) -> Option<f64> {
        let n = self.loss.len().min(self.lr.len()).saturating_sub(skip_end);
        (0..n.saturating_sub(1))
            .map(|i| (i, self.loss[i + 1] - self.loss[i]))
            .filter(|(_, slope)| slope.is_finite())
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| self.lr[i])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LrFinderReport {
    pub history: LrHistory,
    /// The search stopped before `num_iterations` because the loss diverged.
    pub diverged: bool,
    pub best_loss: f64,
    pub suggested_lr: Option<f64>,
    pub history_path: PathBuf,
    pub plot_path: PathBuf,
}

impl LrFinderReport {
    pub fn iterations(&self) -> usize {
        self.history.lr.len()
    }
}

pub struct LearningRateFinder {
    trainer: Trainer,
    search: LrSearch,
}

impl LearningRateFinder {
    pub fn new(ctx: RunContext, checkpoint_path: Option<PathBuf>) -> Result<Self> {
        Ok(Self {
            trainer: Trainer::new(ctx, checkpoint_path)?,
            search: LrSearch::default(),
        })
    }

    pub fn with_search(mut self, search: LrSearch) -> Self {
        self.search = search;
        self
    }

    pub fn search(&self) -> &LrSearch {
        &self.search
    }

    pub fn trainer(&self) -> &Trainer {
        &self.trainer
    }

    pub fn run(&mut self, loader: &dyn DataLoader) -> Result<LrFinderReport> {
        if loader.is_empty() {
            return Err(ExecutorError::data("learning-rate search needs at least one batch"));
        }
        let search = self.search;
        let schedule = ExponentialRange::new(search.start_lr, search.end_lr, search.num_iterations);
        self.trainer
            .setup_with(loader.len(), SchedulerStrategy::Override(Box::new(schedule)))?;

        let (parts, executor) = self.trainer.parts_and_executor()?;
        let config = executor.context().config.clone();
        {
            let (network, events) = executor.network_and_events();
            events.dispatch(&mut Payload::BeforeTrainStart {
                network,
                config: &config,
                samples: loader.samples(),
            })?;
        }

        let mut history = LrHistory::default();
        let mut best_loss = f64::INFINITY;
        let mut diverged = false;
        let mut batches = loader.batches();
        let pb = progress::bar(search.num_iterations, config.show_progress, "Loss: ");

        for iteration in 0..search.num_iterations {
            let mut batch = match batches.next() {
                Some(batch) => batch,
                None => {
                    batches = loader.batches();
                    batches
                        .next()
                        .ok_or_else(|| ExecutorError::data("data loader yielded no batches"))?
                }
            };

            executor.move_to_device(&mut batch);
            parts.optimizer.zero_grad(executor.network_mut().parameters_mut());
            let mut logits = executor
                .network_mut()
                .forward(&batch.inputs, &[])?
                .into_logits()?;
            let mut extras = Vec::new();
            executor.events().dispatch(&mut Payload::BeforeCriterion {
                batch: &mut batch,
                logits: &mut logits,
                extras: &mut extras,
                epoch: 0,
                config: &config,
            })?;
            let loss = parts.criterion.compute(&logits, &batch.outputs, &extras)?;
            let value = f64::from(loss.value);
            if !value.is_finite() {
                warn!(iteration, "Loss is no longer finite; stopping the search");
                diverged = true;
                break;
            }
            executor.network_mut().backward(&loss.grad)?;

            let smoothed = match history.loss.last() {
                Some(previous) if iteration > 0 => {
                    search.smoothing * value + (1.0 - search.smoothing) * previous
                }
                _ => value,
            };
            best_loss = best_loss.min(smoothed);

            history.lr.push(parts.optimizer.learning_rate());
            parts.optimizer.step(executor.network_mut().parameters_mut())?;
            parts.scheduler.step(parts.optimizer.as_mut());
            history.loss.push(smoothed);

            pb.set_message(format!(
                "Loss: {smoothed:.5} Lr: {:.3e}",
                parts.optimizer.learning_rate()
            ));
            pb.inc(1);

            if smoothed > search.divergence_threshold * best_loss {
                // Tripping on the final iteration does not cut the run short.
                diverged = iteration + 1 < search.num_iterations;
                break;
            }
        }
        pb.finish_and_clear();

        let suggested_lr = history.suggestion(SKIP_END);
        info!(
            iterations = history.lr.len(),
            diverged,
            best_loss,
            suggested_lr = ?suggested_lr,
            "Learning rate search finished; see the plot in the output directory for analysis"
        );

        let history_path = config.output_path.join(HISTORY_FILE);
        persistence::atomic_write_json(&history_path, &history)?;
        let plot_path = config.output_path.join(PLOT_FILE);
        plot::render_lr_plot(
            &plot_path,
            &history.lr,
            &history.loss,
            &PlotOptions {
                skip_start: 0,
                skip_end: SKIP_END,
                log_lr: true,
                suggested_lr,
            },
        )?;

        Ok(LrFinderReport {
            history,
            diverged,
            best_loss,
            suggested_lr,
            history_path,
            plot_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Batch, InputValue, Inputs};
    use crate::config::{ComponentSpec, Config};
    use crate::data::InMemoryLoader;
    use crate::tensor::Tensor;
    use tempfile::TempDir;

    fn loader() -> InMemoryLoader {
        let batch = |xs: &[f32]| {
            let features: Vec<Vec<f32>> = xs.iter().map(|x| vec![*x]).collect();
            let targets: Vec<Vec<f32>> = xs.iter().map(|x| vec![3.0 * x + 1.0]).collect();
            let inputs = Inputs::from([(
                "features".to_string(),
                InputValue::Tensor(Tensor::from_rows(&features).unwrap()),
            )]);
            Batch::new(inputs, Tensor::from_rows(&targets).unwrap())
        };
        InMemoryLoader::new(vec![batch(&[1.0, 2.0]), batch(&[-1.0, 0.5]), batch(&[3.0])])
    }

    fn config(dir: &TempDir) -> Config {
        Config {
            model: ComponentSpec::new("linear")
                .with_param("in_features", 1)
                .with_param("out_features", 1),
            optimizer: ComponentSpec::new("sgd").with_param("lr", 0.1),
            output_path: dir.path().to_path_buf(),
            show_progress: false,
            ..Config::default()
        }
    }

    #[test]
    fn test_suggestion_is_steepest_descent() {
        let history = LrHistory {
            lr: vec![1e-4, 1e-3, 1e-2, 1e-1, 1.0],
            loss: vec![1.0, 0.9, 0.4, 0.35, 10.0],
        };
        assert_eq!(history.suggestion(0), Some(1e-3));
        assert_eq!(LrHistory::default().suggestion(2), None);
    }

    #[test]
    fn test_full_range_diverges_early() {
        let dir = TempDir::new().unwrap();
        let mut finder = LearningRateFinder::new(RunContext::new(config(&dir)), None).unwrap();
        let report = finder.run(&loader()).unwrap();

        assert!(report.diverged);
        assert!(report.iterations() < NUM_ITERATIONS);
        assert_eq!(report.history.lr[0], START_LR);
        assert!(report.history.lr.windows(2).all(|w| w[1] > w[0]));

        let saved: LrHistory = persistence::load_json(&report.history_path).unwrap().unwrap();
        assert_eq!(saved, report.history);
        assert!(report.plot_path.ends_with(PLOT_FILE));
        let png = std::fs::read(&report.plot_path).unwrap();
        assert!(png.starts_with(b"\x89PNG\r\n\x1a\n"));
    }

    #[test]
    fn test_gentle_range_uses_whole_budget() {
        let dir = TempDir::new().unwrap();
        let search = LrSearch {
            start_lr: 1e-6,
            end_lr: 1e-4,
            num_iterations: 30,
            ..LrSearch::default()
        };
        let mut finder = LearningRateFinder::new(RunContext::new(config(&dir)), None)
            .unwrap()
            .with_search(search);
        let report = finder.run(&loader()).unwrap();

        assert!(!report.diverged);
        assert_eq!(report.iterations(), 30);
        assert_eq!(report.history.loss.len(), 30);
        let last_lr = *report.history.lr.last().unwrap();
        assert!((last_lr - 1e-4).abs() / 1e-4 < 1e-6);
    }

    #[test]
    fn test_divergence_on_the_last_iteration_is_not_early() {
        let dir = TempDir::new().unwrap();
        // Any positive loss exceeds a zero threshold, so the first check trips.
        let search = |num_iterations| LrSearch {
            num_iterations,
            divergence_threshold: 0.0,
            ..LrSearch::default()
        };

        let mut finder = LearningRateFinder::new(RunContext::new(config(&dir)), None)
            .unwrap()
            .with_search(search(1));
        let report = finder.run(&loader()).unwrap();
        assert_eq!(report.iterations(), 1);
        assert!(!report.diverged);

        let mut finder = LearningRateFinder::new(RunContext::new(config(&dir)), None)
            .unwrap()
            .with_search(search(3));
        let report = finder.run(&loader()).unwrap();
        assert_eq!(report.iterations(), 1);
        assert!(report.diverged);
    }

    #[test]
    fn test_empty_loader_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut finder = LearningRateFinder::new(RunContext::new(config(&dir)), None).unwrap();
        let err = finder.run(&InMemoryLoader::new(Vec::new())).unwrap_err();
        assert!(matches!(err, ExecutorError::Data(_)));
    }
}
