//! The epoch/step training loop with validation and best-model selection.

use crate::batch::Batch;
use crate::components::criterion::Criterion;
use crate::components::metrics::{Aggregator, MetricProcessor, Metrics, PredictionProcessor};
use crate::components::network::{LOGITS, LOGITS_VAR, Network, StateDict};
use crate::components::optimizer::Optimizer;
use crate::components::scheduler::{Cadence, ScheduleContext, Scheduler};
use crate::data::DataLoader;
use crate::error::{ExecutorError, Result};
use crate::events::Payload;
use crate::persistence;
use crate::progress;
use crate::tensor::Tensor;
use crate::training::checkpoint::{Checkpoint, CheckpointManager};
use crate::training::executor::{Executor, RunContext};
use crate::training::trackers::ExponentialTracker;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Weight of the newest batch loss in the smoothed training loss.
pub const LOSS_SMOOTHING: f64 = 0.05;
/// Weight of the newest batch value in each smoothed training metric.
pub const METRIC_SMOOTHING: f64 = 0.1;
pub const LOG_FILE: &str = "logs.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Constructed,
    Ready,
    Done,
}

/// How setup obtains its learning-rate scheduler.
pub enum SchedulerStrategy {
    /// Build `config.scheduler` and restore its state from the checkpoint.
    Configured,
    /// Use this schedule as given. It is started after the checkpoint has
    /// been loaded and its state is never restored.
    Override(Box<dyn Scheduler>),
}

pub(crate) struct TrainingParts {
    pub(crate) criterion: Box<dyn Criterion>,
    pub(crate) optimizer: Box<dyn Optimizer>,
    pub(crate) scheduler: Box<dyn Scheduler>,
}

fn ready(parts: &mut Option<TrainingParts>) -> Result<&mut TrainingParts> {
    parts
        .as_mut()
        .ok_or_else(|| ExecutorError::config("trainer used before setup"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub train_loss: f64,
    /// Mean of each validation metric; `None` when no validation ran.
    pub validation: Option<Metrics>,
    pub new_best: bool,
    pub checkpoint: Option<PathBuf>,
    /// The progress line as emitted to the log sink, after observers ran.
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub epochs: Vec<EpochReport>,
    /// Best validation value of the target metric; `-inf` without validation.
    pub best_metric: f64,
}

impl TrainingSummary {
    pub fn saved_checkpoints(&self) -> Vec<&PathBuf> {
        self.epochs.iter().filter_map(|e| e.checkpoint.as_ref()).collect()
    }
}

pub struct Trainer {
    executor: Executor,
    parts: Option<TrainingParts>,
    state: TrainerState,
    loss_tracker: ExponentialTracker,
    metric_trackers: Vec<(String, ExponentialTracker)>,
    train_metrics: PredictionProcessor,
    val_metrics: PredictionProcessor,
    checkpoints: CheckpointManager,
    anchor: Option<StateDict>,
    best_metric: f64,
    started: Instant,
}

impl Trainer {
    pub fn new(ctx: RunContext, checkpoint_path: Option<PathBuf>) -> Result<Self> {
        let config = ctx.config.clone();
        let executor = Executor::new(ctx, checkpoint_path)?;
        let metric_trackers = config
            .train_metrics
            .iter()
            .map(|name| (name.clone(), ExponentialTracker::new(METRIC_SMOOTHING)))
            .collect();
        Ok(Self {
            executor,
            parts: None,
            state: TrainerState::Constructed,
            loss_tracker: ExponentialTracker::new(LOSS_SMOOTHING),
            metric_trackers,
            train_metrics: PredictionProcessor::new(&config.train_metrics, config.threshold)?,
            val_metrics: PredictionProcessor::new(&config.test_metrics, config.threshold)?,
            checkpoints: CheckpointManager::new(&config.output_path),
            anchor: None,
            best_metric: f64::NEG_INFINITY,
            started: Instant::now(),
        })
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn network(&self) -> &dyn Network {
        self.executor.network()
    }

    pub fn into_executor(self) -> Executor {
        self.executor
    }

    pub fn loss_tracker(&self) -> &ExponentialTracker {
        &self.loss_tracker
    }

    pub fn metric_tracker(&self, name: &str) -> Option<&ExponentialTracker> {
        self.metric_trackers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }

    /// Parameter values captured at the end of setup.
    pub fn anchor_parameters(&self) -> Option<&StateDict> {
        self.anchor.as_ref()
    }

    pub fn best_metric(&self) -> f64 {
        self.best_metric
    }

    pub fn optimizer(&self) -> Option<&dyn Optimizer> {
        self.parts.as_ref().map(|p| p.optimizer.as_ref())
    }

    pub fn scheduler(&self) -> Option<&dyn Scheduler> {
        self.parts.as_ref().map(|p| p.scheduler.as_ref())
    }

    pub(crate) fn parts_and_executor(&mut self) -> Result<(&mut TrainingParts, &mut Executor)> {
        let parts = ready(&mut self.parts)?;
        Ok((parts, &mut self.executor))
    }

    /// Build criterion, optimizer and the configured scheduler, then resume
    /// from the bound checkpoint if there is one.
    pub fn setup(&mut self, training_samples: usize) -> Result<()> {
        self.setup_with(training_samples, SchedulerStrategy::Configured)
    }

    pub fn setup_with(&mut self, training_samples: usize, strategy: SchedulerStrategy) -> Result<()> {
        let config = self.executor.context().config.clone();
        let registry = self.executor.context().registry.clone();

        let criterion = registry.build_criterion(&config.criterion)?;
        let mut optimizer = registry.build_optimizer(&config.optimizer)?;
        let (mut scheduler, restore_scheduler) = match strategy {
            SchedulerStrategy::Configured => {
                let schedule = ScheduleContext {
                    base_lr: optimizer.learning_rate(),
                    steps_per_epoch: training_samples.div_ceil(config.batch_size),
                    epochs: config.epochs,
                };
                let mut scheduler = registry.build_scheduler(&config.scheduler, &schedule)?;
                scheduler.start(optimizer.as_mut());
                (scheduler, true)
            }
            SchedulerStrategy::Override(scheduler) => (scheduler, false),
        };

        let loaded = if restore_scheduler {
            self.executor
                .load_checkpoint(true, Some(optimizer.as_mut()), Some(scheduler.as_mut()))
        } else {
            self.executor.load_checkpoint(true, Some(optimizer.as_mut()), None)
        };
        match loaded {
            Ok(()) => info!("Checkpoint loaded successfully"),
            Err(e) if e.is_checkpoint_not_found() => {
                debug!(reason = %e, "Starting from freshly initialised weights");
            }
            Err(e) => return Err(e),
        }
        if !restore_scheduler {
            scheduler.start(optimizer.as_mut());
        }

        self.anchor = Some(self.executor.network().state_dict());
        self.executor.network_mut().set_training(true);
        debug!(network = %self.executor.network().describe(), "Network ready");

        self.parts = Some(TrainingParts {
            criterion,
            optimizer,
            scheduler,
        });
        self.state = TrainerState::Ready;
        Ok(())
    }

    /// Train for the configured number of epochs, resuming after the
    /// checkpoint's epoch when one was loaded.
    pub fn run(
        &mut self,
        loader: &dyn DataLoader,
        val_loader: Option<&dyn DataLoader>,
    ) -> Result<TrainingSummary> {
        if self.state != TrainerState::Ready {
            self.setup(loader.samples())?;
        }
        let config = self.executor.context().config.clone();
        self.started = Instant::now();

        {
            let (network, events) = self.executor.network_and_events();
            events.dispatch(&mut Payload::BeforeTrainStart {
                network,
                config: &config,
                samples: loader.samples(),
            })?;
        }

        let mut reports = Vec::new();
        for epoch in self.executor.start_epoch() + 1..=config.epochs {
            self.train_epoch(loader, epoch)?;
            let validation = self.validate(val_loader)?;
            let (new_best, checkpoint) = self.check_best(epoch, validation.as_ref())?;
            let message = self.log(epoch, validation.as_ref(), new_best)?;
            reports.push(EpochReport {
                epoch,
                train_loss: self.loss_tracker.get(),
                validation,
                new_best,
                checkpoint,
                message,
            });
            self.reset_trackers();
        }

        {
            let (network, events) = self.executor.network_and_events();
            events.dispatch(&mut Payload::AfterTrainEnd {
                network,
                config: &config,
                samples: loader.samples(),
            })?;
        }
        self.state = TrainerState::Done;

        Ok(TrainingSummary {
            epochs: reports,
            best_metric: self.best_metric,
        })
    }

    fn progress_message(&self, epoch: usize) -> String {
        format!("Epoch {epoch} | Train Loss: {:.5}", self.loss_tracker.get())
    }

    fn train_epoch(&mut self, loader: &dyn DataLoader, epoch: usize) -> Result<()> {
        let config = self.executor.context().config.clone();
        self.executor.network_mut().set_training(true);

        let pb = progress::bar(loader.len(), config.show_progress, &self.progress_message(epoch));
        for (i, batch) in loader.batches().enumerate() {
            self.training_step(batch, epoch)?;
            if (i + 1) % config.log_frequency == 0 {
                pb.set_message(self.progress_message(epoch));
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        let parts = ready(&mut self.parts)?;
        if parts.scheduler.cadence() == Cadence::Epoch {
            parts.scheduler.step(parts.optimizer.as_mut());
        }
        Ok(())
    }

    /// One optimisation step. Returns the batch loss.
    pub fn training_step(&mut self, mut batch: Batch, epoch: usize) -> Result<f32> {
        let config = self.executor.context().config.clone();
        let parts = ready(&mut self.parts)?;

        self.executor.move_to_device(&mut batch);
        parts
            .optimizer
            .zero_grad(self.executor.network_mut().parameters_mut());
        let raw = self
            .executor
            .network_mut()
            .forward(&batch.inputs, &[])?
            .into_logits()?;

        let mut logits = raw.clone();
        let mut extras = Vec::new();
        self.executor.events().dispatch(&mut Payload::BeforeCriterion {
            batch: &mut batch,
            logits: &mut logits,
            extras: &mut extras,
            epoch,
            config: &config,
        })?;

        let loss = parts.criterion.compute(&logits, &batch.outputs, &extras)?;
        if !loss.value.is_finite() {
            return Err(ExecutorError::numerical(format!(
                "loss is {} at epoch {epoch}",
                loss.value
            )));
        }
        self.executor.network_mut().backward(&loss.grad)?;
        parts
            .optimizer
            .step(self.executor.network_mut().parameters_mut())?;
        if parts.scheduler.cadence() == Cadence::Step {
            parts.scheduler.step(parts.optimizer.as_mut());
        }

        let mut outputs = raw;
        self.executor
            .events()
            .dispatch(&mut Payload::BeforeTrackerUpdate {
                outputs: &mut outputs,
            })?;
        self.update_trackers(f64::from(loss.value), &batch.outputs, &outputs)?;
        Ok(loss.value)
    }

    fn update_trackers(&mut self, loss: f64, ground_truth: &Tensor, logits: &Tensor) -> Result<()> {
        self.loss_tracker.update(loss);
        if self.metric_trackers.is_empty() {
            return Ok(());
        }
        let metrics = self.train_metrics.compute_metrics(
            std::slice::from_ref(ground_truth),
            std::slice::from_ref(logits),
        )?;
        let averages = self
            .train_metrics
            .compute_statistics(&metrics, &[Aggregator::Mean]);
        for (name, tracker) in &mut self.metric_trackers {
            if let Some(value) = averages.get(name).and_then(|v| v.first()) {
                tracker.update(*value);
            }
        }
        Ok(())
    }

    fn validate(&mut self, val_loader: Option<&dyn DataLoader>) -> Result<Option<Metrics>> {
        let Some(loader) = val_loader else {
            return Ok(None);
        };
        if loader.is_empty() {
            warn!("Validation loader yielded no batches; skipping validation");
            return Ok(None);
        }
        let show = self.executor.config().show_progress;
        self.executor.network_mut().set_training(false);

        let pb = progress::bar(loader.len(), show, "Validating...");
        let mut ground_truth = Vec::with_capacity(loader.len());
        let mut logits = Vec::with_capacity(loader.len());
        for mut batch in loader.batches() {
            self.executor.move_to_device(&mut batch);
            let mut outputs = self
                .executor
                .network_mut()
                .forward(&batch.inputs, &[])?
                .into_named()?;
            let mut batch_logits = outputs
                .remove(LOGITS)
                .ok_or_else(|| ExecutorError::network("missing logits"))?;
            let mut logits_var = outputs.remove(LOGITS_VAR);
            let mut softmax_score = None;
            self.executor
                .events()
                .dispatch(&mut Payload::AfterValInference {
                    logits: &mut batch_logits,
                    logits_var: &mut logits_var,
                    softmax_score: &mut softmax_score,
                })?;
            ground_truth.push(batch.outputs);
            logits.push(batch_logits);
            pb.inc(1);
        }
        pb.finish_and_clear();
        self.executor.network_mut().set_training(true);

        let metrics = self.val_metrics.compute_metrics(&ground_truth, &logits)?;
        Ok(Some(
            self.val_metrics
                .compute_statistics(&metrics, &[Aggregator::Mean]),
        ))
    }

    /// Without validation every epoch counts as a new best. Otherwise the
    /// target metric must strictly exceed the best value seen so far.
    fn check_best(
        &mut self,
        epoch: usize,
        validation: Option<&Metrics>,
    ) -> Result<(bool, Option<PathBuf>)> {
        let new_best = match validation {
            None => true,
            Some(metrics) => {
                let target = &self.executor.config().target_metric;
                let value = metrics
                    .get(target)
                    .and_then(|v| v.first().copied())
                    .ok_or_else(|| {
                        ExecutorError::metric(format!(
                            "validation did not produce target metric '{target}'"
                        ))
                    })?;
                if value > self.best_metric {
                    self.best_metric = value;
                    true
                } else {
                    false
                }
            }
        };
        if !new_best {
            return Ok((false, None));
        }
        Ok((true, Some(self.save(epoch)?)))
    }

    /// Persist the current training state as `checkpoint.<best|epoch>.pt`.
    pub fn save(&mut self, epoch: usize) -> Result<PathBuf> {
        let parts = ready(&mut self.parts)?;
        let mut checkpoint = Checkpoint::new(
            epoch,
            self.executor.network().state_dict(),
            parts.optimizer.state()?,
            parts.scheduler.state()?,
        );
        let suffix = if self.executor.config().overwrite_checkpoint {
            "best".to_string()
        } else {
            epoch.to_string()
        };
        let path = self.checkpoints.path_for(&suffix);

        self.executor
            .events()
            .dispatch(&mut Payload::BeforeCheckpointSave {
                checkpoint: &mut checkpoint,
            })?;
        self.checkpoints.save(&mut checkpoint, &path)?;
        Ok(path)
    }

    fn log(&self, epoch: usize, validation: Option<&Metrics>, new_best: bool) -> Result<String> {
        let config = self.executor.config();
        let mut message = format!(
            "epoch: {epoch} - Train loss: {:.4} - time elapsed: {}",
            self.loss_tracker.get(),
            format_elapsed(self.started.elapsed())
        );
        for (name, tracker) in &self.metric_trackers {
            message.push_str(&format!(" - Train {name}: {:.4}", tracker.get()));
        }
        if let Some(metrics) = validation {
            for name in &config.test_metrics {
                if let Some(value) = metrics.get(name).and_then(|v| v.first()) {
                    message.push_str(&format!(" - Val {name}: {value:.4}"));
                }
            }
        }
        if new_best {
            message.push_str(" (New best)");
        }

        // Observers rewrite what the log sink sees; logs.txt keeps the plain line.
        let mut rewritten = message.clone();
        self.executor
            .events()
            .dispatch(&mut Payload::BeforeTrainProgressLog {
                message: &mut rewritten,
                epoch,
            })?;
        info!("{rewritten}");
        persistence::append_line(&config.output_path.join(LOG_FILE), &message)?;
        Ok(rewritten)
    }

    fn reset_trackers(&mut self) {
        self.loss_tracker.reset();
        for (_, tracker) in &mut self.metric_trackers {
            tracker.reset();
        }
    }
}

/// `H:MM:SS`
fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{InputValue, Inputs};
    use crate::config::{ComponentSpec, Config};
    use crate::data::InMemoryLoader;
    use crate::events::{EventManager, names};
    use tempfile::TempDir;

    fn batch(xs: &[f32]) -> Batch {
        let features: Vec<Vec<f32>> = xs.iter().map(|x| vec![*x]).collect();
        let targets: Vec<Vec<f32>> = xs.iter().map(|x| vec![2.0 * x]).collect();
        let inputs = Inputs::from([(
            "features".to_string(),
            InputValue::Tensor(Tensor::from_rows(&features).unwrap()),
        )]);
        Batch::new(inputs, Tensor::from_rows(&targets).unwrap())
    }

    fn loader() -> InMemoryLoader {
        InMemoryLoader::new(vec![batch(&[1.0, 2.0]), batch(&[3.0, -1.0])])
    }

    fn config(dir: &TempDir) -> Config {
        Config {
            model: ComponentSpec::new("linear")
                .with_param("in_features", 1)
                .with_param("out_features", 1),
            optimizer: ComponentSpec::new("sgd").with_param("lr", 0.01),
            output_path: dir.path().to_path_buf(),
            epochs: 3,
            batch_size: 2,
            test_metrics: vec!["mse".into(), "r2".into()],
            target_metric: "r2".into(),
            show_progress: false,
            ..Config::default()
        }
    }

    #[test]
    fn test_setup_builds_parts_and_anchor() {
        let dir = TempDir::new().unwrap();
        let mut trainer = Trainer::new(RunContext::new(config(&dir)), None).unwrap();
        assert_eq!(trainer.state(), TrainerState::Constructed);
        trainer.setup(4).unwrap();
        assert_eq!(trainer.state(), TrainerState::Ready);
        assert_eq!(trainer.optimizer().unwrap().name(), "sgd");
        assert_eq!(trainer.anchor_parameters().unwrap(), &trainer.network().state_dict());
    }

    #[test]
    fn test_step_before_setup_fails() {
        let dir = TempDir::new().unwrap();
        let mut trainer = Trainer::new(RunContext::new(config(&dir)), None).unwrap();
        assert!(matches!(
            trainer.training_step(batch(&[1.0]), 1),
            Err(ExecutorError::Config(_))
        ));
    }

    #[test]
    fn test_training_reduces_loss() {
        let dir = TempDir::new().unwrap();
        let mut trainer = Trainer::new(RunContext::new(config(&dir)), None).unwrap();
        trainer.setup(4).unwrap();
        let first = trainer.training_step(batch(&[1.0, 2.0, 3.0]), 1).unwrap();
        let mut last = first;
        for _ in 0..50 {
            last = trainer.training_step(batch(&[1.0, 2.0, 3.0]), 1).unwrap();
        }
        assert!(last < first);
        assert_ne!(trainer.anchor_parameters().unwrap(), &trainer.network().state_dict());
    }

    #[test]
    fn test_extras_from_observers_reach_the_loss() {
        let dir = TempDir::new().unwrap();
        let mut events = EventManager::new();
        events.subscribe(names::BEFORE_CRITERION, |payload| {
            if let Payload::BeforeCriterion { extras, .. } = payload {
                extras.push(Tensor::scalar(100.0));
            }
            Ok(())
        });
        let ctx = RunContext::new(config(&dir)).with_events(events);
        let mut trainer = Trainer::new(ctx, None).unwrap();
        trainer.setup(2).unwrap();
        let loss = trainer.training_step(batch(&[0.0]), 1).unwrap();
        assert!(loss >= 100.0);
    }

    #[test]
    fn test_non_finite_loss_is_numerical_error() {
        let dir = TempDir::new().unwrap();
        let mut events = EventManager::new();
        events.subscribe(names::BEFORE_CRITERION, |payload| {
            if let Payload::BeforeCriterion { logits, .. } = payload {
                **logits = logits.map(|_| f32::INFINITY);
            }
            Ok(())
        });
        let ctx = RunContext::new(config(&dir)).with_events(events);
        let mut trainer = Trainer::new(ctx, None).unwrap();
        trainer.setup(2).unwrap();
        let err = trainer.training_step(batch(&[1.0]), 1).unwrap_err();
        assert!(matches!(err, ExecutorError::Numerical(_)));
    }

    #[test]
    fn test_best_requires_strict_improvement() {
        let dir = TempDir::new().unwrap();
        let cfg = Config {
            overwrite_checkpoint: true,
            ..config(&dir)
        };
        let mut trainer = Trainer::new(RunContext::new(cfg), None).unwrap();
        trainer.setup(4).unwrap();

        let metrics = |r2: f64| Metrics::from([("r2".to_string(), vec![r2])]);
        assert!(trainer.check_best(1, Some(&metrics(0.5))).unwrap().0);
        assert!(!trainer.check_best(2, Some(&metrics(0.5))).unwrap().0);
        assert!(!trainer.check_best(3, Some(&metrics(0.1))).unwrap().0);
        let (improved, path) = trainer.check_best(4, Some(&metrics(0.7))).unwrap();
        assert!(improved);
        assert!(path.unwrap().ends_with("checkpoint.best.pt"));
        assert_eq!(trainer.best_metric(), 0.7);

        let saved = CheckpointManager::load(&dir.path().join("checkpoint.best.pt")).unwrap();
        assert_eq!(saved.epoch, Some(4));
    }

    #[test]
    fn test_without_validation_every_epoch_is_best() {
        let dir = TempDir::new().unwrap();
        let mut trainer = Trainer::new(RunContext::new(config(&dir)), None).unwrap();
        let summary = trainer.run(&loader(), None).unwrap();
        assert_eq!(summary.epochs.len(), 3);
        assert!(summary.epochs.iter().all(|e| e.new_best));
        assert_eq!(summary.saved_checkpoints().len(), 3);
        assert_eq!(summary.best_metric, f64::NEG_INFINITY);
        assert_eq!(trainer.state(), TrainerState::Done);
    }

    #[test]
    fn test_log_line_format() {
        let dir = TempDir::new().unwrap();
        let cfg = Config {
            epochs: 1,
            train_metrics: vec!["mae".into()],
            ..config(&dir)
        };
        let mut trainer = Trainer::new(RunContext::new(cfg), None).unwrap();
        let summary = trainer.run(&loader(), Some(&loader())).unwrap();
        let message = &summary.epochs[0].message;
        assert!(message.starts_with("epoch: 1 - Train loss: "));
        assert!(message.contains(" - time elapsed: 0:00:"));
        assert!(message.contains(" - Train mae: "));
        let mse_at = message.find(" - Val mse: ").unwrap();
        let r2_at = message.find(" - Val r2: ").unwrap();
        assert!(mse_at < r2_at);
        assert!(message.ends_with(" (New best)"));

        let logged = std::fs::read_to_string(dir.path().join(LOG_FILE)).unwrap();
        assert_eq!(logged, format!("{message}\n"));
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(0)), "0:00:00");
        assert_eq!(format_elapsed(Duration::from_secs(3725)), "1:02:05");
    }
}
