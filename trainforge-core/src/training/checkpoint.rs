//! Checkpoint files: persisted model, optimizer and scheduler state.

use crate::components::network::StateDict;
use crate::error::{ExecutorError, Result};
use crate::persistence;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

pub const CHECKPOINT_EXTENSION: &str = "pt";

/// Resumable training state.
///
/// Only `model` is mandatory; the other sections are restored when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub epoch: Option<usize>,
    pub model: StateDict,
    #[serde(default)]
    pub optimizer: Option<serde_json::Value>,
    #[serde(default)]
    pub scheduler: Option<serde_json::Value>,
    /// SHA-256 of the serialized `model` section.
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn new(
        epoch: usize,
        model: StateDict,
        optimizer: serde_json::Value,
        scheduler: serde_json::Value,
    ) -> Self {
        Self {
            epoch: Some(epoch),
            model,
            optimizer: Some(optimizer),
            scheduler: Some(scheduler),
            digest: None,
            saved_at: None,
        }
    }

    /// A checkpoint holding only network weights.
    pub fn weights_only(model: StateDict) -> Self {
        Self {
            epoch: None,
            model,
            optimizer: None,
            scheduler: None,
            digest: None,
            saved_at: None,
        }
    }
}

fn model_digest(model: &StateDict) -> Result<String> {
    let bytes = serde_json::to_vec(model)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// `checkpoint.<suffix>.pt`
pub fn checkpoint_file_name(suffix: &str) -> String {
    format!("checkpoint.{suffix}.{CHECKPOINT_EXTENSION}")
}

/// Reads, writes and discovers checkpoint files under one output directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    output_dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Path for a save with the given suffix (`best` or an epoch number).
    pub fn path_for(&self, suffix: &str) -> PathBuf {
        self.output_dir.join(checkpoint_file_name(suffix))
    }

    /// Stamp the digest and save time, then atomically write to `path`.
    pub fn save(&self, checkpoint: &mut Checkpoint, path: &Path) -> Result<()> {
        checkpoint.digest = Some(model_digest(&checkpoint.model)?);
        checkpoint.saved_at = Some(Utc::now());
        persistence::atomic_write_json(path, checkpoint)?;
        info!(path = %path.display(), epoch = ?checkpoint.epoch, "Saved checkpoint");
        Ok(())
    }

    /// Load and verify a checkpoint.
    pub fn load(path: &Path) -> Result<Checkpoint> {
        let checkpoint: Checkpoint = match persistence::load_json(path) {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return Err(ExecutorError::CheckpointNotFound(Some(path.to_path_buf()))),
            Err(ExecutorError::Serde(e)) => {
                return Err(ExecutorError::CorruptCheckpoint {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        };
        if let Some(expected) = &checkpoint.digest {
            let actual = model_digest(&checkpoint.model)?;
            if &actual != expected {
                return Err(ExecutorError::CorruptCheckpoint {
                    path: path.to_path_buf(),
                    reason: format!("model digest {actual} does not match recorded {expected}"),
                });
            }
        }
        Ok(checkpoint)
    }

    /// Every `*.pt` file below the output directory, shortest path first.
    ///
    /// Paths of equal length are ordered lexicographically so the result is
    /// stable for a given set of files.
    pub fn discover(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = WalkDir::new(&self.output_dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.extension().and_then(|e| e.to_str()) == Some(CHECKPOINT_EXTENSION)
            })
            .collect();
        paths.sort();
        paths.sort_by_key(|p| p.as_os_str().len());
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::network::Parameter;
    use crate::components::optimizer::{Adam, Optimizer, Sgd};
    use crate::components::scheduler::{ExponentialRange, OneCycle, ScheduleContext, Scheduler};
    use crate::tensor::Tensor;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sample() -> Checkpoint {
        let model = StateDict::from([("output.weight".to_string(), Tensor::full(&[2, 1], 0.5))]);
        Checkpoint::new(3, model, serde_json::json!({"lr": 0.1}), serde_json::json!({}))
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let path = manager.path_for("3");
        let mut checkpoint = sample();
        manager.save(&mut checkpoint, &path).unwrap();

        assert!(path.ends_with("checkpoint.3.pt"));
        let loaded = CheckpointManager::load(&path).unwrap();
        assert_eq!(loaded, checkpoint);
        assert!(loaded.digest.is_some());
    }

    #[test]
    fn test_tampered_model_is_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let path = manager.path_for("best");
        let mut checkpoint = sample();
        manager.save(&mut checkpoint, &path).unwrap();

        checkpoint.model.insert("output.weight".into(), Tensor::full(&[2, 1], 9.0));
        persistence::atomic_write_json(&path, &checkpoint).unwrap();
        let err = CheckpointManager::load(&path).unwrap_err();
        assert!(matches!(err, ExecutorError::CorruptCheckpoint { .. }));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let err = CheckpointManager::load(Path::new("/nonexistent/checkpoint.1.pt")).unwrap_err();
        assert!(err.is_checkpoint_not_found());
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.1.pt");
        std::fs::write(&path, b"not json").unwrap();
        let err = CheckpointManager::load(&path).unwrap_err();
        assert!(matches!(err, ExecutorError::CorruptCheckpoint { .. }));
    }

    #[test]
    fn test_discover_orders_by_length_then_name() {
        let dir = TempDir::new().unwrap();
        for name in ["checkpoint.10.pt", "checkpoint.2.pt", "checkpoint.1.pt", "logs.txt"] {
            std::fs::write(dir.path().join(name), b"{}").unwrap();
        }
        std::fs::create_dir(dir.path().join("fold")).unwrap();
        std::fs::write(dir.path().join("fold").join("checkpoint.1.pt"), b"{}").unwrap();

        let manager = CheckpointManager::new(dir.path());
        let names: Vec<String> = manager
            .discover()
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().display().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "checkpoint.1.pt",
                "checkpoint.2.pt",
                "checkpoint.10.pt",
                "fold/checkpoint.1.pt"
            ]
        );
        assert_eq!(manager.discover(), manager.discover());
    }

    /// Saves the optimizer and scheduler after every step and requires the
    /// reloaded state, including every learning rate, to be bit-identical.
    fn assert_state_survives_every_step(
        mut optimizer: Box<dyn Optimizer>,
        mut scheduler: Box<dyn Scheduler>,
        mut fresh: Box<dyn Optimizer>,
        steps: usize,
    ) {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let mut weight = Parameter::new(Tensor::full(&[3], 0.25));
        scheduler.start(optimizer.as_mut());

        for step in 0..steps {
            weight.grad = Some(Tensor::full(&[3], 0.1 + step as f32 * 0.37));
            optimizer.step(vec![("w".into(), &mut weight)]).unwrap();
            scheduler.step(optimizer.as_mut());

            let mut checkpoint = Checkpoint::new(
                step,
                StateDict::from([("w".to_string(), weight.value.clone())]),
                optimizer.state().unwrap(),
                scheduler.state().unwrap(),
            );
            let path = manager.path_for(&step.to_string());
            manager.save(&mut checkpoint, &path).unwrap();
            let loaded = CheckpointManager::load(&path).unwrap();

            assert_eq!(loaded.optimizer, checkpoint.optimizer, "optimizer at step {step}");
            assert_eq!(loaded.scheduler, checkpoint.scheduler, "scheduler at step {step}");
            assert_eq!(loaded.model, checkpoint.model, "model at step {step}");

            fresh.load_state(loaded.optimizer.as_ref().unwrap()).unwrap();
            assert_eq!(
                fresh.learning_rate().to_bits(),
                optimizer.learning_rate().to_bits(),
                "lr at step {step}"
            );
        }
    }

    #[test]
    fn test_exponential_range_with_sgd_restores_exactly() {
        assert_state_survives_every_step(
            Box::new(Sgd::new(1e-5, 0.9, 1e-4)),
            Box::new(ExponentialRange::new(1e-5, 100.0, 100)),
            Box::new(Sgd::new(0.0, 0.0, 0.0)),
            60,
        );
    }

    #[test]
    fn test_one_cycle_with_adam_restores_exactly() {
        let ctx = ScheduleContext {
            base_lr: 0.003,
            steps_per_epoch: 7,
            epochs: 3,
        };
        let params = serde_json::json!({"max_lr": 0.0317, "pct_start": 0.3});
        let scheduler = OneCycle::from_params(params.as_object().unwrap(), &ctx).unwrap();
        assert_state_survives_every_step(
            Box::new(Adam::new(0.003)),
            Box::new(scheduler),
            Box::new(Adam::new(0.0)),
            21,
        );
    }
}
