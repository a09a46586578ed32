//! Network contract and the built-in reference networks.

use crate::batch::{InputValue, Inputs};
use crate::error::{ExecutorError, Result};
use crate::tensor::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Serializable network weights keyed by parameter name.
pub type StateDict = BTreeMap<String, Tensor>;

/// Named outputs of one forward pass. Always carries `logits`.
pub type NamedOutputs = BTreeMap<String, Tensor>;

pub const LOGITS: &str = "logits";
pub const LOGITS_VAR: &str = "logits_var";

/// A trainable tensor and its accumulated gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub value: Tensor,
    pub grad: Option<Tensor>,
}

impl Parameter {
    pub fn new(value: Tensor) -> Self {
        Self { value, grad: None }
    }

    /// Add `grad` to the accumulated gradient.
    pub fn accumulate(&mut self, grad: Tensor) -> Result<()> {
        match &mut self.grad {
            Some(existing) => existing.add_assign(&grad),
            None => {
                self.grad = Some(grad);
                Ok(())
            }
        }
    }
}

/// Ordered parameter storage for networks that own their weights directly.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    params: BTreeMap<String, Parameter>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: Tensor) {
        self.params.insert(name.to_string(), Parameter::new(value));
    }

    pub fn get(&self, name: &str) -> Result<&Parameter> {
        self.params
            .get(name)
            .ok_or_else(|| ExecutorError::network(format!("unknown parameter '{name}'")))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut Parameter> {
        self.params
            .get_mut(name)
            .ok_or_else(|| ExecutorError::network(format!("unknown parameter '{name}'")))
    }

    pub fn named(&self) -> Vec<(String, &Parameter)> {
        self.params.iter().map(|(k, v)| (k.clone(), v)).collect()
    }

    pub fn named_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        self.params.iter_mut().map(|(k, v)| (k.clone(), v)).collect()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Shared slot a network writes a layer's activations into.
#[derive(Debug, Clone, Default)]
pub struct Probe {
    slot: Arc<Mutex<Option<Tensor>>>,
}

impl Probe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the captured activation, recovering a poisoned slot.
    pub fn record(&self, activation: &Tensor) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(activation.clone());
    }

    /// Last captured activation, if the probed layer has run.
    pub fn get(&self) -> Option<Tensor> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// What a forward pass returns before the executor normalises it.
#[derive(Debug, Clone, PartialEq)]
pub enum Outputs {
    Tensor(Tensor),
    Named(NamedOutputs),
}

impl Outputs {
    /// Normalise into a named mapping; a bare tensor becomes `logits`.
    pub fn into_named(self) -> Result<NamedOutputs> {
        match self {
            Outputs::Tensor(t) => Ok(NamedOutputs::from([(LOGITS.to_string(), t)])),
            Outputs::Named(map) if map.contains_key(LOGITS) => Ok(map),
            Outputs::Named(_) => Err(ExecutorError::network(
                "named network outputs must include 'logits'",
            )),
        }
    }

    pub fn into_logits(self) -> Result<Tensor> {
        let mut named = self.into_named()?;
        named
            .remove(LOGITS)
            .ok_or_else(|| ExecutorError::network("missing logits"))
    }
}

/// The model being trained or queried.
///
/// Gradients flow through [`Network::backward`], which receives the loss
/// gradient with respect to the logits of the latest forward pass and
/// accumulates parameter gradients.
pub trait Network: Send {
    fn forward(&mut self, inputs: &Inputs, extras: &[Tensor]) -> Result<Outputs>;

    fn backward(&mut self, grad_logits: &Tensor) -> Result<()>;

    fn parameters(&self) -> Vec<(String, &Parameter)>;

    fn parameters_mut(&mut self) -> Vec<(String, &mut Parameter)>;

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    fn describe(&self) -> String;

    fn zero_grad(&mut self) {
        for (_, param) in self.parameters_mut() {
            param.grad = None;
        }
    }

    fn to_device(&mut self, device: Device) {
        for (_, param) in self.parameters_mut() {
            param.value = param.value.to_device(device);
        }
    }

    fn state_dict(&self) -> StateDict {
        self.parameters()
            .into_iter()
            .map(|(name, p)| (name, p.value.clone()))
            .collect()
    }

    /// Replace all weights. Nothing is written unless every parameter is
    /// present with a matching shape and no unknown names are supplied.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let current = self.parameters();
        if current.len() != state.len() {
            let unknown: Vec<_> = state
                .keys()
                .filter(|k| !current.iter().any(|(n, _)| n == *k))
                .collect();
            return Err(ExecutorError::network(format!(
                "state dict has {} entries, network has {} (unknown: {unknown:?})",
                state.len(),
                current.len()
            )));
        }
        for (name, param) in &current {
            let incoming = state
                .get(name)
                .ok_or_else(|| ExecutorError::network(format!("missing parameter '{name}'")))?;
            if incoming.shape() != param.value.shape() {
                return Err(ExecutorError::shape(format!(
                    "parameter '{name}': expected {:?}, got {:?}",
                    param.value.shape(),
                    incoming.shape()
                )));
            }
        }
        drop(current);
        for (name, param) in self.parameters_mut() {
            if let Some(incoming) = state.get(&name) {
                param.value = incoming.to_device(param.value.device());
                param.grad = None;
            }
        }
        Ok(())
    }

    fn dropout(&self) -> f32 {
        0.0
    }

    fn set_dropout(&mut self, _probability: f32) {}

    /// Monte-Carlo dropout: `n_iter` stochastic forward passes with dropout
    /// active, returning their mean as `logits` and variance as `logits_var`.
    fn mc_dropout(
        &mut self,
        inputs: &Inputs,
        dropout_prob: f32,
        n_iter: usize,
    ) -> Result<Outputs> {
        if n_iter == 0 {
            return Err(ExecutorError::config("mc_dropout needs at least one iteration"));
        }
        let was_training = self.is_training();
        let previous = self.dropout();
        self.set_training(true);
        self.set_dropout(dropout_prob);

        let mut samples = Vec::with_capacity(n_iter);
        let outcome = (0..n_iter).try_for_each(|_| {
            samples.push(self.forward(inputs, &[])?.into_logits()?);
            Ok::<(), ExecutorError>(())
        });

        self.set_dropout(previous);
        self.set_training(was_training);
        outcome?;

        let n = samples.len() as f32;
        let mut mean = Tensor::zeros(samples[0].shape());
        for sample in &samples {
            mean.add_assign(sample)?;
        }
        let mean = mean.map(|v| v / n);
        let mut var = Tensor::zeros(mean.shape());
        for sample in &samples {
            var.add_assign(&sample.zip_map(&mean, |s, m| (s - m) * (s - m))?)?;
        }
        let var = var.map(|v| v / n);

        Ok(Outputs::Named(NamedOutputs::from([
            (LOGITS.to_string(), mean),
            (LOGITS_VAR.to_string(), var),
        ])))
    }

    /// Capture the activations of `layer` into `probe` on every forward pass.
    fn attach_probe(&mut self, layer: &str, _probe: Probe) -> Result<()> {
        Err(ExecutorError::config(format!(
            "network does not expose a probe-able layer named '{layer}'"
        )))
    }

    fn is_ensemble(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LinearParams {
    in_features: usize,
    out_features: usize,
    #[serde(default)]
    hidden_features: Option<usize>,
    #[serde(default)]
    dropout: f32,
    #[serde(default = "default_input_key")]
    input_key: String,
}

fn default_input_key() -> String {
    "features".to_string()
}

#[derive(Debug, Clone)]
struct ForwardCache {
    input: Tensor,
    pre_activation: Option<Tensor>,
    hidden: Option<Tensor>,
    mask: Option<Vec<f32>>,
}

/// A dense regressor/classifier: `features -> [hidden (ReLU, dropout)] -> output`.
///
/// Probe-able layers are `hidden` (post-activation) and `output`.
#[derive(Debug)]
pub struct LinearNetwork {
    params: ParameterSet,
    input_key: String,
    has_hidden: bool,
    dropout: f32,
    training: bool,
    rng: StdRng,
    cache: Option<ForwardCache>,
    probes: BTreeMap<String, Probe>,
}

impl LinearNetwork {
    pub fn new(
        in_features: usize,
        hidden_features: Option<usize>,
        out_features: usize,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut params = ParameterSet::new();
        let mut layer = |name: &str, fan_in: usize, fan_out: usize, rng: &mut StdRng| {
            let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
            let weights: Vec<f32> = (0..fan_in * fan_out)
                .map(|_| rng.gen_range(-bound..=bound))
                .collect();
            params.insert(
                &format!("{name}.weight"),
                Tensor::new(vec![fan_in, fan_out], weights)
                    .unwrap_or_else(|_| Tensor::zeros(&[fan_in, fan_out])),
            );
            params.insert(&format!("{name}.bias"), Tensor::zeros(&[fan_out]));
        };
        match hidden_features {
            Some(hidden) => {
                layer("hidden", in_features, hidden, &mut rng);
                layer("output", hidden, out_features, &mut rng);
            }
            None => layer("output", in_features, out_features, &mut rng),
        }
        Self {
            params,
            input_key: default_input_key(),
            has_hidden: hidden_features.is_some(),
            dropout: 0.0,
            training: true,
            rng,
            cache: None,
            probes: BTreeMap::new(),
        }
    }

    pub fn from_params(
        params: &serde_json::Map<String, serde_json::Value>,
        seed: u64,
    ) -> Result<Self> {
        let p: LinearParams = serde_json::from_value(serde_json::Value::Object(params.clone()))
            .map_err(|e| ExecutorError::component(format!("linear network: {e}")))?;
        if !(0.0..1.0).contains(&p.dropout) {
            return Err(ExecutorError::component("linear network: dropout must be in [0, 1)"));
        }
        let mut network = Self::new(p.in_features, p.hidden_features, p.out_features, seed);
        network.input_key = p.input_key;
        network.dropout = p.dropout;
        Ok(network)
    }

    fn affine(&self, x: &Tensor, layer: &str) -> Result<Tensor> {
        let w = &self.params.get(&format!("{layer}.weight"))?.value;
        let b = &self.params.get(&format!("{layer}.bias"))?.value;
        let mut out = x.matmul(w)?;
        let cols = out.cols();
        for (i, v) in out.data_mut().iter_mut().enumerate() {
            *v += b.data()[i % cols];
        }
        Ok(out)
    }

    fn record(&self, layer: &str, activation: &Tensor) {
        if let Some(probe) = self.probes.get(layer) {
            probe.record(activation);
        }
    }
}

impl Network for LinearNetwork {
    fn forward(&mut self, inputs: &Inputs, _extras: &[Tensor]) -> Result<Outputs> {
        let x = match inputs.get(&self.input_key) {
            Some(InputValue::Tensor(t)) => t.clone(),
            Some(_) => {
                return Err(ExecutorError::network(format!(
                    "input '{}' must be a tensor",
                    self.input_key
                )));
            }
            None => {
                return Err(ExecutorError::network(format!(
                    "missing input '{}'",
                    self.input_key
                )));
            }
        };

        if !self.has_hidden {
            let out = self.affine(&x, "output")?;
            self.record("output", &out);
            self.cache = Some(ForwardCache {
                input: x,
                pre_activation: None,
                hidden: None,
                mask: None,
            });
            return Ok(Outputs::Tensor(out));
        }

        let pre = self.affine(&x, "hidden")?;
        let mut hidden = pre.map(|v| v.max(0.0));
        let mask = if self.training && self.dropout > 0.0 {
            let keep = 1.0 - self.dropout;
            let mask: Vec<f32> = (0..hidden.len())
                .map(|_| {
                    if self.rng.gen_range(0.0f32..1.0) < keep {
                        1.0 / keep
                    } else {
                        0.0
                    }
                })
                .collect();
            for (v, m) in hidden.data_mut().iter_mut().zip(&mask) {
                *v *= m;
            }
            Some(mask)
        } else {
            None
        };
        self.record("hidden", &hidden);

        let out = self.affine(&hidden, "output")?;
        self.record("output", &out);
        self.cache = Some(ForwardCache {
            input: x,
            pre_activation: Some(pre),
            hidden: Some(hidden),
            mask,
        });
        Ok(Outputs::Tensor(out))
    }

    fn backward(&mut self, grad_logits: &Tensor) -> Result<()> {
        let cache = self
            .cache
            .take()
            .ok_or_else(|| ExecutorError::network("backward called before forward"))?;

        let layer_input = cache.hidden.as_ref().unwrap_or(&cache.input);
        let grad_w = layer_input.transpose().matmul(grad_logits)?;
        let grad_b = grad_logits.sum_rows();

        let grad_hidden = if self.has_hidden {
            let w = &self.params.get("output.weight")?.value;
            let mut g = grad_logits.matmul(&w.transpose())?;
            let pre = cache
                .pre_activation
                .as_ref()
                .ok_or_else(|| ExecutorError::network("missing hidden activations"))?;
            for (i, v) in g.data_mut().iter_mut().enumerate() {
                if pre.data()[i] <= 0.0 {
                    *v = 0.0;
                } else if let Some(mask) = &cache.mask {
                    *v *= mask[i];
                }
            }
            Some(g)
        } else {
            None
        };

        self.params.get_mut("output.weight")?.accumulate(grad_w)?;
        self.params.get_mut("output.bias")?.accumulate(grad_b)?;
        if let Some(g) = grad_hidden {
            let grad_w = cache.input.transpose().matmul(&g)?;
            self.params.get_mut("hidden.weight")?.accumulate(grad_w)?;
            self.params.get_mut("hidden.bias")?.accumulate(g.sum_rows())?;
        }
        Ok(())
    }

    fn parameters(&self) -> Vec<(String, &Parameter)> {
        self.params.named()
    }

    fn parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        self.params.named_mut()
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn describe(&self) -> String {
        let shapes: Vec<String> = self
            .params
            .named()
            .into_iter()
            .map(|(name, p)| format!("{name}{:?}", p.value.shape()))
            .collect();
        format!("LinearNetwork(dropout={}, {})", self.dropout, shapes.join(", "))
    }

    fn dropout(&self) -> f32 {
        self.dropout
    }

    fn set_dropout(&mut self, probability: f32) {
        self.dropout = probability;
    }

    fn attach_probe(&mut self, layer: &str, probe: Probe) -> Result<()> {
        let known = layer == "output" || (layer == "hidden" && self.has_hidden);
        if !known {
            return Err(ExecutorError::config(format!(
                "LinearNetwork has no layer named '{layer}'"
            )));
        }
        self.probes.insert(layer.to_string(), probe);
        Ok(())
    }
}

/// Averages the logits of several member networks.
pub struct EnsembleNetwork {
    members: Vec<Box<dyn Network>>,
}

impl EnsembleNetwork {
    pub fn new(members: Vec<Box<dyn Network>>) -> Result<Self> {
        if members.is_empty() {
            return Err(ExecutorError::component("an ensemble needs at least one member"));
        }
        Ok(Self { members })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl Network for EnsembleNetwork {
    fn forward(&mut self, inputs: &Inputs, extras: &[Tensor]) -> Result<Outputs> {
        let n = self.members.len() as f32;
        let mut sum: Option<Tensor> = None;
        for member in &mut self.members {
            let logits = member.forward(inputs, extras)?.into_logits()?;
            match &mut sum {
                Some(acc) => acc.add_assign(&logits)?,
                None => sum = Some(logits),
            }
        }
        let sum = sum.ok_or_else(|| ExecutorError::network("empty ensemble"))?;
        Ok(Outputs::Tensor(sum.map(|v| v / n)))
    }

    fn backward(&mut self, grad_logits: &Tensor) -> Result<()> {
        let share = grad_logits.map(|v| v / self.members.len() as f32);
        self.members.iter_mut().try_for_each(|m| m.backward(&share))
    }

    fn parameters(&self) -> Vec<(String, &Parameter)> {
        self.members
            .iter()
            .enumerate()
            .flat_map(|(i, m)| {
                m.parameters()
                    .into_iter()
                    .map(move |(name, p)| (format!("{i}.{name}"), p))
            })
            .collect()
    }

    fn parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        self.members
            .iter_mut()
            .enumerate()
            .flat_map(|(i, m)| {
                m.parameters_mut()
                    .into_iter()
                    .map(move |(name, p)| (format!("{i}.{name}"), p))
            })
            .collect()
    }

    fn set_training(&mut self, training: bool) {
        self.members.iter_mut().for_each(|m| m.set_training(training));
    }

    fn is_training(&self) -> bool {
        self.members.iter().any(|m| m.is_training())
    }

    fn describe(&self) -> String {
        let members: Vec<String> = self.members.iter().map(|m| m.describe()).collect();
        format!("EnsembleNetwork[{}]", members.join("; "))
    }

    fn dropout(&self) -> f32 {
        self.members.first().map(|m| m.dropout()).unwrap_or(0.0)
    }

    fn set_dropout(&mut self, probability: f32) {
        self.members
            .iter_mut()
            .for_each(|m| m.set_dropout(probability));
    }

    fn is_ensemble(&self) -> bool {
        true
    }
}

/// Multi-device wrapper. The fan-out of a batch across `device_ids` is left
/// to the backend; from the executor's point of view this behaves exactly
/// like the wrapped network and keeps its parameter names.
pub struct DataParallel {
    inner: Box<dyn Network>,
    device_ids: Vec<u32>,
}

impl DataParallel {
    pub fn new(inner: Box<dyn Network>, device_ids: Vec<u32>) -> Self {
        Self { inner, device_ids }
    }

    pub fn device_ids(&self) -> &[u32] {
        &self.device_ids
    }
}

impl Network for DataParallel {
    fn forward(&mut self, inputs: &Inputs, extras: &[Tensor]) -> Result<Outputs> {
        self.inner.forward(inputs, extras)
    }

    fn backward(&mut self, grad_logits: &Tensor) -> Result<()> {
        self.inner.backward(grad_logits)
    }

    fn parameters(&self) -> Vec<(String, &Parameter)> {
        self.inner.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        self.inner.parameters_mut()
    }

    fn set_training(&mut self, training: bool) {
        self.inner.set_training(training);
    }

    fn is_training(&self) -> bool {
        self.inner.is_training()
    }

    fn describe(&self) -> String {
        format!("DataParallel(devices={:?}, {})", self.device_ids, self.inner.describe())
    }

    fn dropout(&self) -> f32 {
        self.inner.dropout()
    }

    fn set_dropout(&mut self, probability: f32) {
        self.inner.set_dropout(probability);
    }

    fn mc_dropout(&mut self, inputs: &Inputs, dropout_prob: f32, n_iter: usize) -> Result<Outputs> {
        self.inner.mc_dropout(inputs, dropout_prob, n_iter)
    }

    fn attach_probe(&mut self, layer: &str, probe: Probe) -> Result<()> {
        self.inner.attach_probe(layer, probe)
    }

    fn is_ensemble(&self) -> bool {
        self.inner.is_ensemble()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(rows: &[Vec<f32>]) -> Inputs {
        Inputs::from([(
            "features".to_string(),
            InputValue::Tensor(Tensor::from_rows(rows).unwrap()),
        )])
    }

    #[test]
    fn test_recording_survives_a_poisoned_slot() {
        let probe = Probe::new();
        probe.record(&Tensor::scalar(1.0));
        let shared = probe.clone();
        let panicked = std::thread::spawn(move || {
            let _guard = shared.slot.lock().unwrap();
            panic!("writer died while holding the slot");
        })
        .join();
        assert!(panicked.is_err());
        assert!(probe.slot.is_poisoned());

        assert_eq!(probe.get(), Some(Tensor::scalar(1.0)));
        probe.record(&Tensor::scalar(2.0));
        assert_eq!(probe.get(), Some(Tensor::scalar(2.0)));
    }

    #[test]
    fn test_linear_forward_shape() {
        let mut net = LinearNetwork::new(3, Some(4), 2, 1);
        let out = net
            .forward(&inputs(&[vec![1.0, 2.0, 3.0]]), &[])
            .unwrap()
            .into_logits()
            .unwrap();
        assert_eq!(out.shape(), &[1, 2]);
    }

    #[test]
    fn test_linear_backward_produces_gradients() {
        let mut net = LinearNetwork::new(2, None, 1, 1);
        net.forward(&inputs(&[vec![1.0, 2.0]]), &[]).unwrap();
        net.backward(&Tensor::from_rows(&[vec![1.0]]).unwrap()).unwrap();
        let grads: Vec<_> = net
            .parameters()
            .into_iter()
            .map(|(_, p)| p.grad.clone().unwrap())
            .collect();
        // bias grad = 1, weight grad = inputs
        assert_eq!(grads[0].data(), &[1.0]);
        assert_eq!(grads[1].data(), &[1.0, 2.0]);
        net.zero_grad();
        assert!(net.parameters().iter().all(|(_, p)| p.grad.is_none()));
    }

    #[test]
    fn test_backward_without_forward_fails() {
        let mut net = LinearNetwork::new(2, None, 1, 1);
        assert!(net.backward(&Tensor::scalar(1.0)).is_err());
    }

    #[test]
    fn test_load_state_dict_is_all_or_nothing() {
        let mut net = LinearNetwork::new(2, None, 1, 1);
        let before = net.state_dict();
        let mut bad = before.clone();
        bad.insert("output.bias".to_string(), Tensor::zeros(&[5]));
        assert!(net.load_state_dict(&bad).is_err());
        assert_eq!(net.state_dict(), before);

        let mut good = before.clone();
        good.insert("output.bias".to_string(), Tensor::full(&[1], 3.0));
        net.load_state_dict(&good).unwrap();
        assert_eq!(net.state_dict()["output.bias"].data(), &[3.0]);
    }

    #[test]
    fn test_probe_records_hidden_layer() {
        let mut net = LinearNetwork::new(2, Some(3), 1, 1);
        let probe = Probe::new();
        net.attach_probe("hidden", probe.clone()).unwrap();
        assert!(net.attach_probe("conv1", Probe::new()).is_err());
        net.forward(&inputs(&[vec![1.0, -1.0]]), &[]).unwrap();
        assert_eq!(probe.get().unwrap().shape(), &[1, 3]);
    }

    #[test]
    fn test_mc_dropout_reports_variance_and_restores_mode() {
        let mut net = LinearNetwork::new(2, Some(8), 1, 3);
        net.set_training(false);
        let out = net
            .mc_dropout(&inputs(&[vec![1.0, 1.0]]), 0.5, 20)
            .unwrap()
            .into_named()
            .unwrap();
        assert!(out.contains_key(LOGITS_VAR));
        assert!(!net.is_training());
        assert_eq!(net.dropout(), 0.0);
    }

    #[test]
    fn test_ensemble_averages_and_prefixes_parameters() {
        let a = LinearNetwork::new(1, None, 1, 1);
        let b = LinearNetwork::new(1, None, 1, 2);
        let mut ensemble = EnsembleNetwork::new(vec![Box::new(a), Box::new(b)]).unwrap();
        assert!(ensemble.is_ensemble());
        let names: Vec<String> = ensemble.parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["0.output.bias", "0.output.weight", "1.output.bias", "1.output.weight"]);

        let state = ensemble.state_dict();
        let w0 = state["0.output.weight"].data()[0];
        let w1 = state["1.output.weight"].data()[0];
        let out = ensemble
            .forward(&inputs(&[vec![1.0]]), &[])
            .unwrap()
            .into_logits()
            .unwrap();
        assert!((out.data()[0] - (w0 + w1) / 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_outputs_normalisation() {
        let named = Outputs::Tensor(Tensor::scalar(1.0)).into_named().unwrap();
        assert!(named.contains_key(LOGITS));
        assert!(Outputs::Named(NamedOutputs::new()).into_named().is_err());
    }
}
