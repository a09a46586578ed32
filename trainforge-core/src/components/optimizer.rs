//! Optimizers with serializable state.

use crate::components::network::Parameter;
use crate::error::{ExecutorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub trait Optimizer: Send {
    /// Clear the accumulated gradients of `params`.
    fn zero_grad(&self, params: Vec<(String, &mut Parameter)>) {
        for (_, param) in params {
            param.grad = None;
        }
    }

    /// Apply one update from the accumulated gradients. Parameters without a
    /// gradient are left untouched.
    fn step(&mut self, params: Vec<(String, &mut Parameter)>) -> Result<()>;

    fn learning_rate(&self) -> f64;

    /// Set the learning rate of every parameter group.
    fn set_learning_rate(&mut self, lr: f64);

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

fn grad_of(name: &str, param: &Parameter) -> Result<Option<Vec<f32>>> {
    match &param.grad {
        None => Ok(None),
        Some(g) if g.len() != param.value.len() => Err(ExecutorError::shape(format!(
            "gradient of '{name}' has {} values, parameter has {}",
            g.len(),
            param.value.len()
        ))),
        Some(g) => Ok(Some(g.data().to_vec())),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Sgd {
    pub lr: f64,
    #[serde(default)]
    pub momentum: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    velocity: BTreeMap<String, Vec<f32>>,
}

impl Sgd {
    pub fn new(lr: f64, momentum: f64, weight_decay: f64) -> Self {
        Self {
            lr,
            momentum,
            weight_decay,
            velocity: BTreeMap::new(),
        }
    }

    pub fn from_params(params: &serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        parse("sgd", params)
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: Vec<(String, &mut Parameter)>) -> Result<()> {
        for (name, param) in params {
            let Some(grad) = grad_of(&name, param)? else {
                continue;
            };
            let velocity = self
                .velocity
                .entry(name)
                .or_insert_with(|| vec![0.0; grad.len()]);
            for (i, w) in param.value.data_mut().iter_mut().enumerate() {
                let g = grad[i] + self.weight_decay as f32 * *w;
                let update = if self.momentum > 0.0 {
                    velocity[i] = self.momentum as f32 * velocity[i] + g;
                    velocity[i]
                } else {
                    g
                };
                *w -= self.lr as f32 * update;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn load_state(&mut self, state: &serde_json::Value) -> Result<()> {
        *self = serde_json::from_value(state.clone())?;
        Ok(())
    }

    fn name(&self) -> &str {
        "sgd"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Adam {
    pub lr: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_eps")]
    pub eps: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    steps: u64,
    #[serde(default)]
    first_moment: BTreeMap<String, Vec<f32>>,
    #[serde(default)]
    second_moment: BTreeMap<String, Vec<f32>>,
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_eps() -> f64 {
    1e-8
}

impl Adam {
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            weight_decay: 0.0,
            steps: 0,
            first_moment: BTreeMap::new(),
            second_moment: BTreeMap::new(),
        }
    }

    pub fn from_params(params: &serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        parse("adam", params)
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: Vec<(String, &mut Parameter)>) -> Result<()> {
        self.steps += 1;
        let t = self.steps as i32;
        let bias1 = 1.0 - self.beta1.powi(t);
        let bias2 = 1.0 - self.beta2.powi(t);
        for (name, param) in params {
            let Some(grad) = grad_of(&name, param)? else {
                continue;
            };
            let m = self
                .first_moment
                .entry(name.clone())
                .or_insert_with(|| vec![0.0; grad.len()]);
            let v = self
                .second_moment
                .entry(name)
                .or_insert_with(|| vec![0.0; grad.len()]);
            for (i, w) in param.value.data_mut().iter_mut().enumerate() {
                let g = (grad[i] + self.weight_decay as f32 * *w) as f64;
                m[i] = (self.beta1 * m[i] as f64 + (1.0 - self.beta1) * g) as f32;
                v[i] = (self.beta2 * v[i] as f64 + (1.0 - self.beta2) * g * g) as f32;
                let m_hat = m[i] as f64 / bias1;
                let v_hat = v[i] as f64 / bias2;
                *w -= (self.lr * m_hat / (v_hat.sqrt() + self.eps)) as f32;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn load_state(&mut self, state: &serde_json::Value) -> Result<()> {
        *self = serde_json::from_value(state.clone())?;
        Ok(())
    }

    fn name(&self) -> &str {
        "adam"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn param(value: f32, grad: f32) -> Parameter {
        Parameter {
            value: Tensor::scalar(value),
            grad: Some(Tensor::scalar(grad)),
        }
    }

    #[test]
    fn test_sgd_plain_step() {
        let mut opt = Sgd::new(0.1, 0.0, 0.0);
        let mut p = param(1.0, 2.0);
        opt.step(vec![("w".into(), &mut p)]).unwrap();
        assert!((p.value.data()[0] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_sgd_skips_parameters_without_grad() {
        let mut opt = Sgd::new(0.1, 0.9, 0.0);
        let mut p = Parameter::new(Tensor::scalar(1.0));
        opt.step(vec![("w".into(), &mut p)]).unwrap();
        assert_eq!(p.value.data(), &[1.0]);
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        let mut opt = Adam::new(0.01);
        let mut p = param(1.0, 5.0);
        opt.step(vec![("w".into(), &mut p)]).unwrap();
        assert!((p.value.data()[0] - 0.99).abs() < 1e-5);
        assert_eq!(opt.steps(), 1);
    }

    #[test]
    fn test_state_roundtrip_restores_buffers() {
        let mut opt = Adam::new(0.01);
        let mut p = param(1.0, 1.0);
        opt.step(vec![("w".into(), &mut p)]).unwrap();
        let state = opt.state().unwrap();

        let mut restored = Adam::new(0.5);
        restored.load_state(&state).unwrap();
        assert_eq!(restored, opt);
    }

    #[test]
    fn test_from_params_rejects_unknown_fields() {
        let params = serde_json::json!({"lr": 0.1, "nesterov": true});
        let map = params.as_object().unwrap();
        assert!(Sgd::from_params(map).is_err());
    }
}
