//! Run configuration.
//!
//! Uses `figment` for layered configuration: defaults -> config file (TOML or
//! JSON) -> environment (`TRAINFORGE_`, nested with `__`) -> explicit
//! overrides. A `Config` is read-only once an executor has been built from it.

use crate::error::{ExecutorError, Result};
use crate::tensor::Device;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized, Toml},
    value::Dict,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Factory key plus constructor parameters for one collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl ComponentSpec {
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            params: serde_json::Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

/// How the predictor produces logits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceMode {
    /// A single deterministic forward pass.
    #[default]
    Forward,
    /// Repeated sampling with dropout active; yields mean and variance.
    McDropout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_model")]
    pub model: ComponentSpec,
    #[serde(default = "default_criterion")]
    pub criterion: ComponentSpec,
    #[serde(default = "default_optimizer")]
    pub optimizer: ComponentSpec,
    #[serde(default = "default_scheduler")]
    pub scheduler: ComponentSpec,

    /// Directory receiving checkpoints, `logs.txt` and LR-finder artifacts.
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
    /// Default checkpoint for executors that are not given one explicitly.
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,

    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_train_metrics")]
    pub train_metrics: Vec<String>,
    #[serde(default = "default_test_metrics")]
    pub test_metrics: Vec<String>,
    /// Validation metric used for best-model selection; higher is better.
    #[serde(default = "default_target_metric")]
    pub target_metric: String,
    /// Decision threshold applied to sigmoid scores by classification metrics.
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// Refresh the progress description every N batches.
    #[serde(default = "default_log_frequency")]
    pub log_frequency: usize,
    /// Keep a single `checkpoint.best.pt` instead of one file per epoch.
    #[serde(default)]
    pub overwrite_checkpoint: bool,
    /// Restore only network weights from a checkpoint when training.
    #[serde(default)]
    pub is_finetuning: bool,

    #[serde(default)]
    pub inference_mode: InferenceMode,
    #[serde(default = "default_mc_iterations")]
    pub mc_dropout_iterations: usize,
    #[serde(default = "default_mc_probability")]
    pub mc_dropout_probability: f32,
    /// Layer whose activations the predictor captures as `hidden_layer`.
    #[serde(default)]
    pub probe_layer: Option<String>,

    #[serde(default)]
    pub use_cuda: bool,
    #[serde(default)]
    pub enabled_gpus: Vec<u32>,

    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: default_model(),
            criterion: default_criterion(),
            optimizer: default_optimizer(),
            scheduler: default_scheduler(),
            output_path: default_output_path(),
            checkpoint_path: None,
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            train_metrics: default_train_metrics(),
            test_metrics: default_test_metrics(),
            target_metric: default_target_metric(),
            threshold: default_threshold(),
            log_frequency: default_log_frequency(),
            overwrite_checkpoint: false,
            is_finetuning: false,
            inference_mode: InferenceMode::default(),
            mc_dropout_iterations: default_mc_iterations(),
            mc_dropout_probability: default_mc_probability(),
            probe_layer: None,
            use_cuda: false,
            enabled_gpus: Vec::new(),
            seed: default_seed(),
            show_progress: true,
        }
    }
}

fn default_model() -> ComponentSpec {
    ComponentSpec::new("linear")
}

fn default_criterion() -> ComponentSpec {
    ComponentSpec::new("mse")
}

fn default_optimizer() -> ComponentSpec {
    ComponentSpec::new("adam").with_param("lr", 0.001)
}

fn default_scheduler() -> ComponentSpec {
    ComponentSpec::new("constant")
}

fn default_output_path() -> PathBuf {
    PathBuf::from("output")
}

fn default_epochs() -> usize {
    10
}

fn default_batch_size() -> usize {
    32
}

fn default_train_metrics() -> Vec<String> {
    Vec::new()
}

fn default_test_metrics() -> Vec<String> {
    vec!["r2".to_string(), "mae".to_string(), "rmse".to_string()]
}

fn default_target_metric() -> String {
    "r2".to_string()
}

fn default_threshold() -> f32 {
    0.5
}

fn default_log_frequency() -> usize {
    20
}

fn default_mc_iterations() -> usize {
    10
}

fn default_mc_probability() -> f32 {
    0.1
}

fn default_seed() -> u64 {
    42
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Device every batch is moved to: the first enabled GPU when CUDA is
    /// requested, otherwise the CPU.
    pub fn device(&self) -> Device {
        match (self.use_cuda, self.enabled_gpus.first()) {
            (true, Some(&id)) => Device::Cuda(id),
            (true, None) => Device::Cuda(0),
            _ => Device::Cpu,
        }
    }

    /// Data-parallel wrapping is used when more than one GPU is enabled.
    pub fn should_parallelize(&self) -> bool {
        self.use_cuda && self.enabled_gpus.len() > 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(ExecutorError::config("epochs must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(ExecutorError::config("batch_size must be at least 1"));
        }
        if self.log_frequency == 0 {
            return Err(ExecutorError::config("log_frequency must be at least 1"));
        }
        if self.test_metrics.is_empty() {
            return Err(ExecutorError::config("test_metrics must not be empty"));
        }
        if !self.test_metrics.contains(&self.target_metric) {
            return Err(ExecutorError::config(format!(
                "target_metric '{}' is not listed in test_metrics {:?}",
                self.target_metric, self.test_metrics
            )));
        }
        if self.inference_mode == InferenceMode::McDropout {
            if self.mc_dropout_iterations == 0 {
                return Err(ExecutorError::config(
                    "mc_dropout_iterations must be at least 1",
                ));
            }
            if !(0.0..1.0).contains(&self.mc_dropout_probability) {
                return Err(ExecutorError::config(
                    "mc_dropout_probability must be in [0, 1)",
                ));
            }
        }
        Ok(())
    }
}

/// Config keys to force over every other source, e.g. `output_path`.
pub type Overrides = Dict;

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides, only the keys present in `overrides`
/// 2. Environment variables (prefixed with `TRAINFORGE_`)
/// 3. The config file, parsed as JSON when it ends in `.json`, TOML otherwise
/// 4. Built-in defaults
pub fn load_config(path: Option<&Path>, overrides: Option<&Overrides>) -> Result<Config> {
    let mut figment = Figment::from(Serialized::defaults(Config::default()));

    if let Some(path) = path {
        if !path.exists() {
            return Err(ExecutorError::config(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        figment = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => figment.merge(Json::file(path)),
            _ => figment.merge(Toml::file(path)),
        };
    }

    // TRAINFORGE_EPOCHS, TRAINFORGE_OPTIMIZER__PARAMS__LR, etc.
    figment = figment.merge(Env::prefixed("TRAINFORGE_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: Config = figment.extract().map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}
