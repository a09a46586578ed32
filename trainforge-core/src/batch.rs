//! Batches: named, possibly nested inputs plus ground-truth outputs.

use crate::tensor::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Graph-structured input: node features plus connectivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphData {
    pub node_features: Tensor,
    pub edge_index: Vec<(usize, usize)>,
    #[serde(default)]
    pub edge_features: Option<Tensor>,
}

impl GraphData {
    pub fn to_device(&self, device: Device) -> GraphData {
        GraphData {
            node_features: self.node_features.to_device(device),
            edge_index: self.edge_index.clone(),
            edge_features: self.edge_features.as_ref().map(|t| t.to_device(device)),
        }
    }

    pub fn device(&self) -> Device {
        self.node_features.device()
    }
}

/// One named batch input. Only tensor-like variants are placed on devices;
/// scalars and text ride along untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum InputValue {
    Tensor(Tensor),
    Graph(GraphData),
    Map(BTreeMap<String, InputValue>),
    List(Vec<InputValue>),
    Scalar(f64),
    Text(String),
}

impl InputValue {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            InputValue::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_tensor_like(&self) -> bool {
        matches!(self, InputValue::Tensor(_) | InputValue::Graph(_))
    }

    /// Visit every tensor reachable from this value.
    pub fn for_each_tensor<'a>(&'a self, f: &mut dyn FnMut(&'a Tensor)) {
        match self {
            InputValue::Tensor(t) => f(t),
            InputValue::Graph(g) => {
                f(&g.node_features);
                if let Some(e) = &g.edge_features {
                    f(e);
                }
            }
            InputValue::Map(map) => map.values().for_each(|v| v.for_each_tensor(f)),
            InputValue::List(items) => items.iter().for_each(|v| v.for_each_tensor(f)),
            InputValue::Scalar(_) | InputValue::Text(_) => {}
        }
    }
}

impl From<Tensor> for InputValue {
    fn from(t: Tensor) -> Self {
        InputValue::Tensor(t)
    }
}

pub type Inputs = BTreeMap<String, InputValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    #[serde(default)]
    pub ids: Vec<String>,
    pub inputs: Inputs,
    pub outputs: Tensor,
}

impl Batch {
    pub fn new(inputs: Inputs, outputs: Tensor) -> Self {
        Self {
            ids: Vec::new(),
            inputs,
            outputs,
        }
    }

    /// Number of samples, taken from the ground-truth rows.
    pub fn len(&self) -> usize {
        self.outputs.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_each_tensor_walks_nested_values() {
        let t = Tensor::scalar(1.0);
        let mut nested = BTreeMap::new();
        nested.insert("a".to_string(), InputValue::Tensor(t.clone()));
        nested.insert("b".to_string(), InputValue::Text("x".into()));
        let value = InputValue::List(vec![
            InputValue::Map(nested),
            InputValue::Graph(GraphData {
                node_features: t.clone(),
                edge_index: vec![(0, 1)],
                edge_features: Some(t),
            }),
        ]);
        let mut count = 0;
        value.for_each_tensor(&mut |_| count += 1);
        assert_eq!(count, 3);
    }

    #[test]
    fn test_batch_len_from_outputs() {
        let outputs = Tensor::zeros(&[4, 2]);
        let batch = Batch::new(Inputs::new(), outputs);
        assert_eq!(batch.len(), 4);
        assert!(!batch.is_empty());
    }
}
