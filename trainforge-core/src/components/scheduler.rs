//! Learning-rate schedulers.
//!
//! Each scheduler declares its own [`Cadence`]; the trainer advances it after
//! every optimizer step or once per epoch accordingly.

use crate::components::optimizer::Optimizer;
use crate::error::{ExecutorError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Epoch,
    Step,
}

/// Values a scheduler may need beyond its own parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleContext {
    pub base_lr: f64,
    pub steps_per_epoch: usize,
    pub epochs: usize,
}

pub trait Scheduler: Send {
    fn cadence(&self) -> Cadence;

    /// Set the optimizer to the schedule's initial learning rate.
    fn start(&mut self, _optimizer: &mut dyn Optimizer) {}

    fn step(&mut self, optimizer: &mut dyn Optimizer);

    fn state(&self) -> Result<serde_json::Value>;

    fn load_state(&mut self, state: &serde_json::Value) -> Result<()>;

    fn name(&self) -> &str;
}

fn parse<T: serde::de::DeserializeOwned>(
    what: &str,
    params: &serde_json::Map<String, serde_json::Value>,
) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(params.clone()))
        .map_err(|e| ExecutorError::component(format!("{what}: {e}")))
}

/// Keeps the learning rate fixed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constant {
    #[serde(default)]
    epochs_seen: usize,
}

impl Scheduler for Constant {
    fn cadence(&self) -> Cadence {
        Cadence::Epoch
    }

    fn step(&mut self, _optimizer: &mut dyn Optimizer) {
        self.epochs_seen += 1;
    }

    fn state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn load_state(&mut self, state: &serde_json::Value) -> Result<()> {
        *self = serde_json::from_value(state.clone())?;
        Ok(())
    }

    fn name(&self) -> &str {
        "constant"
    }
}

/// Multiplies the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLr {
    base_lr: f64,
    step_size: usize,
    gamma: f64,
    last_epoch: usize,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct StepLrParams {
    step_size: usize,
    #[serde(default = "default_gamma")]
    gamma: f64,
}

fn default_gamma() -> f64 {
    0.1
}

impl StepLr {
    pub fn from_params(
        params: &serde_json::Map<String, serde_json::Value>,
        ctx: &ScheduleContext,
    ) -> Result<Self> {
        let p: StepLrParams = parse("step_lr", params)?;
        if p.step_size == 0 {
            return Err(ExecutorError::component("step_lr: step_size must be positive"));
        }
        Ok(Self {
            base_lr: ctx.base_lr,
            step_size: p.step_size,
            gamma: p.gamma,
            last_epoch: 0,
        })
    }
}

impl Scheduler for StepLr {
    fn cadence(&self) -> Cadence {
        Cadence::Epoch
    }

    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.last_epoch += 1;
        let decays = (self.last_epoch / self.step_size) as i32;
        optimizer.set_learning_rate(self.base_lr * self.gamma.powi(decays));
    }

    fn state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn load_state(&mut self, state: &serde_json::Value) -> Result<()> {
        *self = serde_json::from_value(state.clone())?;
        Ok(())
    }

    fn name(&self) -> &str {
        "step_lr"
    }
}

/// Multiplies the learning rate by `gamma` every epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExponentialLr {
    base_lr: f64,
    gamma: f64,
    last_epoch: usize,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ExponentialLrParams {
    gamma: f64,
}

impl ExponentialLr {
    pub fn from_params(
        params: &serde_json::Map<String, serde_json::Value>,
        ctx: &ScheduleContext,
    ) -> Result<Self> {
        let p: ExponentialLrParams = parse("exponential_lr", params)?;
        Ok(Self {
            base_lr: ctx.base_lr,
            gamma: p.gamma,
            last_epoch: 0,
        })
    }
}

impl Scheduler for ExponentialLr {
    fn cadence(&self) -> Cadence {
        Cadence::Epoch
    }

    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.last_epoch += 1;
        optimizer.set_learning_rate(self.base_lr * self.gamma.powi(self.last_epoch as i32));
    }

    fn state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn load_state(&mut self, state: &serde_json::Value) -> Result<()> {
        *self = serde_json::from_value(state.clone())?;
        Ok(())
    }

    fn name(&self) -> &str {
        "exponential_lr"
    }
}

/// One-cycle policy: cosine warm-up to `max_lr`, then cosine annealing down
/// to `max_lr / (div_factor * final_div_factor)`. Advanced every batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneCycle {
    max_lr: f64,
    total_steps: usize,
    pct_start: f64,
    div_factor: f64,
    final_div_factor: f64,
    step: usize,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct OneCycleParams {
    max_lr: f64,
    #[serde(default = "default_pct_start")]
    pct_start: f64,
    #[serde(default = "default_div_factor")]
    div_factor: f64,
    #[serde(default = "default_final_div_factor")]
    final_div_factor: f64,
}

fn default_pct_start() -> f64 {
    0.3
}

fn default_div_factor() -> f64 {
    25.0
}

fn default_final_div_factor() -> f64 {
    1e4
}

fn cosine(start: f64, end: f64, fraction: f64) -> f64 {
    end + (start - end) / 2.0 * (1.0 + (std::f64::consts::PI * fraction).cos())
}

impl OneCycle {
    pub fn from_params(
        params: &serde_json::Map<String, serde_json::Value>,
        ctx: &ScheduleContext,
    ) -> Result<Self> {
        let p: OneCycleParams = parse("one_cycle", params)?;
        if !(0.0..1.0).contains(&p.pct_start) {
            return Err(ExecutorError::component("one_cycle: pct_start must be in [0, 1)"));
        }
        Ok(Self {
            max_lr: p.max_lr,
            total_steps: (ctx.steps_per_epoch * ctx.epochs).max(1),
            pct_start: p.pct_start,
            div_factor: p.div_factor,
            final_div_factor: p.final_div_factor,
            step: 0,
        })
    }

    fn lr_at(&self, step: usize) -> f64 {
        let initial = self.max_lr / self.div_factor;
        let minimum = initial / self.final_div_factor;
        let warmup = ((self.pct_start * self.total_steps as f64) as usize).max(1);
        if step <= warmup {
            cosine(initial, self.max_lr, step as f64 / warmup as f64)
        } else {
            let remaining = (self.total_steps.saturating_sub(warmup)).max(1);
            let fraction = ((step - warmup) as f64 / remaining as f64).min(1.0);
            cosine(self.max_lr, minimum, fraction)
        }
    }
}

impl Scheduler for OneCycle {
    fn cadence(&self) -> Cadence {
        Cadence::Step
    }

    fn start(&mut self, optimizer: &mut dyn Optimizer) {
        optimizer.set_learning_rate(self.lr_at(0));
    }

    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.step += 1;
        optimizer.set_learning_rate(self.lr_at(self.step));
    }

    fn state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn load_state(&mut self, state: &serde_json::Value) -> Result<()> {
        *self = serde_json::from_value(state.clone())?;
        Ok(())
    }

    fn name(&self) -> &str {
        "one_cycle"
    }
}

/// Exponential sweep from `start_lr` to `end_lr` over `num_iter` steps, used
/// by the learning-rate finder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExponentialRange {
    start_lr: f64,
    end_lr: f64,
    num_iter: usize,
    iteration: usize,
}

impl ExponentialRange {
    pub fn new(start_lr: f64, end_lr: f64, num_iter: usize) -> Self {
        Self {
            start_lr,
            end_lr,
            num_iter,
            iteration: 0,
        }
    }

    pub fn lr_at(&self, iteration: usize) -> f64 {
        let span = self.num_iter.saturating_sub(1).max(1) as f64;
        let r = iteration as f64 / span;
        self.start_lr * (self.end_lr / self.start_lr).powf(r)
    }
}

impl Scheduler for ExponentialRange {
    fn cadence(&self) -> Cadence {
        Cadence::Step
    }

    fn start(&mut self, optimizer: &mut dyn Optimizer) {
        self.iteration = 0;
        optimizer.set_learning_rate(self.start_lr);
    }

    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.iteration += 1;
        optimizer.set_learning_rate(self.lr_at(self.iteration));
    }

    fn state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn load_state(&mut self, state: &serde_json::Value) -> Result<()> {
        *self = serde_json::from_value(state.clone())?;
        Ok(())
    }

    fn name(&self) -> &str {
        "exponential_range"
    }
}
