//! Single-batch and whole-dataset inference.

use crate::batch::Batch;
use crate::components::network::{LOGITS, NamedOutputs, Network, Probe};
use crate::config::InferenceMode;
use crate::data::DataLoader;
use crate::error::{ExecutorError, Result};
use crate::events::Payload;
use crate::progress;
use crate::tensor::Tensor;
use crate::training::executor::{Executor, RunContext};
use std::path::PathBuf;
use tracing::{debug, info};

/// Output key holding the probed layer's activations.
pub const HIDDEN_LAYER: &str = "hidden_layer";

/// Outputs of one batch together with the batch they were computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub batch: Batch,
    pub outputs: NamedOutputs,
}

impl Prediction {
    pub fn logits(&self) -> Result<&Tensor> {
        self.outputs
            .get(LOGITS)
            .ok_or_else(|| ExecutorError::network("prediction has no logits"))
    }
}

/// Runs a network restored from a checkpoint in evaluation mode.
#[derive(Debug)]
pub struct Predictor {
    executor: Executor,
    probe: Option<Probe>,
}

impl Predictor {
    /// Fails with `CheckpointNotFound` when `checkpoint_path` is unset or
    /// missing.
    pub fn new(ctx: RunContext, checkpoint_path: Option<PathBuf>) -> Result<Self> {
        let mut executor = Executor::new(ctx, checkpoint_path)?;
        executor.load_checkpoint(false, None, None)?;
        executor.network_mut().set_training(false);

        // Observers key off the loss type, so the criterion spec must resolve.
        let config = executor.context().config.clone();
        executor.registry().build_criterion(&config.criterion)?;

        info!(network = %executor.network().describe(), "Predictor ready");
        Ok(Self {
            executor,
            probe: None,
        })
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn network(&self) -> &dyn Network {
        self.executor.network()
    }

    fn ensure_probe(&mut self, layer: &str) -> Result<Probe> {
        if let Some(probe) = &self.probe {
            return Ok(probe.clone());
        }
        if self.executor.network().is_ensemble() {
            return Err(ExecutorError::config(
                "probing hidden layers is not defined for ensembles; \
                 unset 'probe_layer' or use a different type of network",
            ));
        }
        let probe = Probe::new();
        self.executor.network_mut().attach_probe(layer, probe.clone())?;
        debug!(layer, "Attached hidden-layer probe");
        self.probe = Some(probe.clone());
        Ok(probe)
    }

    pub fn run(&mut self, mut batch: Batch) -> Result<Prediction> {
        let config = self.executor.context().config.clone();
        self.executor.move_to_device(&mut batch);

        let probe = match &config.probe_layer {
            Some(layer) => Some(self.ensure_probe(layer)?),
            None => None,
        };

        let mut extras = Vec::new();
        self.executor.events().dispatch(&mut Payload::BeforePredict {
            inputs: &mut batch.inputs,
            extras: &mut extras,
            loss_type: &config.criterion.type_name,
        })?;

        let network = self.executor.network_mut();
        let outputs = match config.inference_mode {
            InferenceMode::McDropout => network.mc_dropout(
                &batch.inputs,
                config.mc_dropout_probability,
                config.mc_dropout_iterations,
            )?,
            InferenceMode::Forward => network.forward(&batch.inputs, &extras)?,
        };
        let mut outputs = outputs.into_named()?;

        if let Some(activations) = probe.and_then(|p| p.get()) {
            outputs.insert(HIDDEN_LAYER.to_string(), activations);
        }

        self.executor.events().dispatch(&mut Payload::AfterPredict {
            batch: &batch,
            outputs: &mut outputs,
        })?;

        Ok(Prediction { batch, outputs })
    }

    /// Ground truth and logits for every batch, in loader order.
    pub fn run_all(&mut self, loader: &dyn DataLoader) -> Result<(Vec<Tensor>, Vec<Tensor>)> {
        let show = self.executor.config().show_progress;
        let pb = progress::bar(loader.len(), show, "Evaluating...");
        let mut ground_truth = Vec::with_capacity(loader.len());
        let mut logits = Vec::with_capacity(loader.len());
        for batch in loader.batches() {
            let mut prediction = self.run(batch)?;
            let batch_logits = prediction
                .outputs
                .remove(LOGITS)
                .ok_or_else(|| ExecutorError::network("prediction has no logits"))?;
            ground_truth.push(prediction.batch.outputs);
            logits.push(batch_logits);
            pb.inc(1);
        }
        pb.finish_and_clear();
        Ok((ground_truth, logits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{InputValue, Inputs};
    use crate::components::network::LOGITS_VAR;
    use crate::config::{ComponentSpec, Config};
    use crate::events::{EventManager, names};
    use crate::training::checkpoint::{Checkpoint, CheckpointManager};
    use tempfile::TempDir;

    fn linear(hidden: Option<usize>) -> ComponentSpec {
        let spec = ComponentSpec::new("linear")
            .with_param("in_features", 2)
            .with_param("out_features", 1);
        match hidden {
            Some(h) => spec.with_param("hidden_features", h),
            None => spec,
        }
    }

    fn config(model: ComponentSpec) -> Config {
        Config {
            model,
            show_progress: false,
            ..Config::default()
        }
    }

    /// Save the freshly initialised weights of `cfg`'s network.
    fn checkpoint_for(dir: &TempDir, cfg: &Config) -> PathBuf {
        let executor = Executor::new(RunContext::new(cfg.clone()), None).unwrap();
        let mut checkpoint = Checkpoint::weights_only(executor.network().state_dict());
        let path = dir.path().join("checkpoint.best.pt");
        CheckpointManager::new(dir.path()).save(&mut checkpoint, &path).unwrap();
        path
    }

    fn batch() -> Batch {
        let inputs = Inputs::from([(
            "features".to_string(),
            InputValue::Tensor(Tensor::from_rows(&[vec![1.0, 2.0], vec![0.5, -1.0]]).unwrap()),
        )]);
        Batch::new(inputs, Tensor::from_rows(&[vec![1.0], vec![0.0]]).unwrap())
    }

    #[test]
    fn test_requires_checkpoint() {
        let err = Predictor::new(RunContext::new(config(linear(None))), None).unwrap_err();
        assert!(err.is_checkpoint_not_found());
    }

    #[test]
    fn test_run_returns_named_logits() {
        let dir = TempDir::new().unwrap();
        let cfg = config(linear(None));
        let path = checkpoint_for(&dir, &cfg);
        let mut predictor = Predictor::new(RunContext::new(cfg), Some(path)).unwrap();
        let prediction = predictor.run(batch()).unwrap();
        assert_eq!(prediction.logits().unwrap().shape(), &[2, 1]);
        assert!(!prediction.outputs.contains_key(HIDDEN_LAYER));
        assert!(!predictor.network().is_training());
    }

    #[test]
    fn test_probe_attaches_hidden_layer() {
        let dir = TempDir::new().unwrap();
        let cfg = Config {
            probe_layer: Some("hidden".into()),
            ..config(linear(Some(4)))
        };
        let path = checkpoint_for(&dir, &cfg);
        let mut predictor = Predictor::new(RunContext::new(cfg), Some(path)).unwrap();
        let prediction = predictor.run(batch()).unwrap();
        assert_eq!(prediction.outputs[HIDDEN_LAYER].shape(), &[2, 4]);
    }

    #[test]
    fn test_probe_on_ensemble_is_config_error() {
        let dir = TempDir::new().unwrap();
        let member = serde_json::to_value(linear(None)).unwrap();
        let cfg = Config {
            probe_layer: Some("output".into()),
            ..config(ComponentSpec::new("ensemble").with_param("members", vec![member.clone(), member]))
        };
        let path = checkpoint_for(&dir, &cfg);
        let mut predictor = Predictor::new(RunContext::new(cfg), Some(path)).unwrap();
        assert!(matches!(predictor.run(batch()), Err(ExecutorError::Config(_))));
    }

    #[test]
    fn test_mc_dropout_reports_variance() {
        let dir = TempDir::new().unwrap();
        let cfg = Config {
            inference_mode: InferenceMode::McDropout,
            mc_dropout_iterations: 8,
            mc_dropout_probability: 0.3,
            ..config(linear(Some(16)))
        };
        let path = checkpoint_for(&dir, &cfg);
        let mut predictor = Predictor::new(RunContext::new(cfg), Some(path)).unwrap();
        let prediction = predictor.run(batch()).unwrap();
        assert!(prediction.outputs.contains_key(LOGITS_VAR));
        assert!(!predictor.network().is_training());
    }

    #[test]
    fn test_observers_can_add_outputs() {
        let dir = TempDir::new().unwrap();
        let cfg = config(linear(None));
        let path = checkpoint_for(&dir, &cfg);
        let mut events = EventManager::new();
        events.subscribe(names::AFTER_PREDICT, |payload| {
            if let Payload::AfterPredict { outputs, .. } = payload {
                let score = outputs[LOGITS].map(|v| 1.0 / (1.0 + (-v).exp()));
                outputs.insert("score".to_string(), score);
            }
            Ok(())
        });
        let ctx = RunContext::new(cfg).with_events(events);
        let mut predictor = Predictor::new(ctx, Some(path)).unwrap();
        let prediction = predictor.run(batch()).unwrap();
        assert!(prediction.outputs.contains_key("score"));
    }

    #[test]
    fn test_run_all_keeps_order() {
        let dir = TempDir::new().unwrap();
        let cfg = config(linear(None));
        let path = checkpoint_for(&dir, &cfg);
        let mut predictor = Predictor::new(RunContext::new(cfg), Some(path)).unwrap();
        let loader = crate::data::InMemoryLoader::new(vec![batch(), batch()]);
        let (truth, logits) = predictor.run_all(&loader).unwrap();
        assert_eq!(truth.len(), 2);
        assert_eq!(logits.len(), 2);
        assert_eq!(truth[0], batch().outputs);
    }
}
