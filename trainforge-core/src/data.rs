//! Data loaders feeding batches to executors.
//!
//! Batching pipelines are owned by the caller; executors only see the
//! [`DataLoader`] trait. Two small loaders are provided for the CLI and tests.

use crate::batch::{Batch, InputValue, Inputs};
use crate::error::{ExecutorError, Result};
use crate::tensor::Tensor;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::path::Path;

/// A re-iterable source of batches.
pub trait DataLoader {
    /// A fresh pass over the dataset.
    fn batches(&self) -> Box<dyn Iterator<Item = Batch> + '_>;

    /// Total number of samples across all batches.
    fn samples(&self) -> usize;

    /// Number of batches per pass.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pre-batched data held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLoader {
    batches: Vec<Batch>,
}

impl InMemoryLoader {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches }
    }
}

impl DataLoader for InMemoryLoader {
    fn batches(&self) -> Box<dyn Iterator<Item = Batch> + '_> {
        Box::new(self.batches.iter().cloned())
    }

    fn samples(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }

    fn len(&self) -> usize {
        self.batches.len()
    }
}

#[derive(Debug, Clone)]
struct Sample {
    id: Option<String>,
    features: Vec<f32>,
    targets: Vec<f32>,
}

/// Tabular samples read from a JSON file of the form
/// `{"samples": [{"id": "a", "features": [..], "targets": [..]}]}`.
///
/// Features are exposed to networks under the `features` input key. Missing
/// targets may be written as `null` and are loaded as NaN.
#[derive(Debug, Clone)]
pub struct JsonDataset {
    batches: Vec<Batch>,
    samples: usize,
}

impl JsonDataset {
    pub fn load(path: &Path, batch_size: usize, shuffle_seed: Option<u64>) -> Result<Self> {
        #[derive(Deserialize)]
        struct RawSample {
            #[serde(default)]
            id: Option<String>,
            features: Vec<f32>,
            targets: Vec<Option<f32>>,
        }
        #[derive(Deserialize)]
        struct RawFile {
            samples: Vec<RawSample>,
        }

        let content = std::fs::read_to_string(path)?;
        let raw: RawFile = serde_json::from_str(&content)?;
        let samples = raw
            .samples
            .into_iter()
            .map(|s| Sample {
                id: s.id,
                features: s.features,
                targets: s
                    .targets
                    .into_iter()
                    .map(|t| t.unwrap_or(f32::NAN))
                    .collect(),
            })
            .collect();
        Self::from_samples(samples, batch_size, shuffle_seed)
    }

    fn from_samples(
        mut samples: Vec<Sample>,
        batch_size: usize,
        shuffle_seed: Option<u64>,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(ExecutorError::config("batch_size must be positive"));
        }
        if let Some(seed) = shuffle_seed {
            samples.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        let total = samples.len();
        let batches = samples
            .chunks(batch_size)
            .enumerate()
            .map(|(i, chunk)| to_batch(i * batch_size, chunk))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            batches,
            samples: total,
        })
    }
}

fn to_batch(offset: usize, chunk: &[Sample]) -> Result<Batch> {
    let features: Vec<Vec<f32>> = chunk.iter().map(|s| s.features.clone()).collect();
    let targets: Vec<Vec<f32>> = chunk.iter().map(|s| s.targets.clone()).collect();
    let features = Tensor::from_rows(&features)
        .map_err(|e| ExecutorError::data(format!("features: {e}")))?;
    let targets =
        Tensor::from_rows(&targets).map_err(|e| ExecutorError::data(format!("targets: {e}")))?;

    let mut inputs = Inputs::new();
    inputs.insert("features".to_string(), InputValue::Tensor(features));
    let mut batch = Batch::new(inputs, targets);
    batch.ids = chunk
        .iter()
        .enumerate()
        .map(|(i, s)| s.id.clone().unwrap_or_else(|| (offset + i).to_string()))
        .collect();
    Ok(batch)
}

impl DataLoader for JsonDataset {
    fn batches(&self) -> Box<dyn Iterator<Item = Batch> + '_> {
        Box::new(self.batches.iter().cloned())
    }

    fn samples(&self) -> usize {
        self.samples
    }

    fn len(&self) -> usize {
        self.batches.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_dataset(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("data.json");
        std::fs::write(
            &path,
            r#"{"samples": [
                {"id": "a", "features": [1.0, 2.0], "targets": [1.0]},
                {"features": [3.0, 4.0], "targets": [null]},
                {"features": [5.0, 6.0], "targets": [0.0]}
            ]}"#,
        )
        .unwrap();
        path
    }

    #[test]
    fn test_json_dataset_batches() {
        let dir = tempfile::tempdir().unwrap();
        let loader = JsonDataset::load(&write_dataset(dir.path()), 2, None).unwrap();
        assert_eq!(loader.samples(), 3);
        assert_eq!(loader.len(), 2);

        let batches: Vec<Batch> = loader.batches().collect();
        assert_eq!(batches[0].ids, vec!["a".to_string(), "1".to_string()]);
        assert!(batches[0].outputs.get(1, 0).is_nan());
        assert_eq!(batches[1].len(), 1);
    }

    #[test]
    fn test_json_dataset_shuffle_is_seeded() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_dataset(dir.path());
        let a = JsonDataset::load(&path, 1, Some(7)).unwrap();
        let b = JsonDataset::load(&path, 1, Some(7)).unwrap();
        let ids = |l: &JsonDataset| l.batches().flat_map(|b| b.ids).collect::<Vec<_>>();
        assert_eq!(ids(&a), ids(&b));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(JsonDataset::load(&write_dataset(dir.path()), 0, None).is_err());
    }

    #[test]
    fn test_in_memory_loader_is_reiterable() {
        let batch = Batch::new(Inputs::new(), Tensor::zeros(&[3, 1]));
        let loader = InMemoryLoader::new(vec![batch.clone(), batch]);
        assert_eq!(loader.samples(), 6);
        assert_eq!(loader.batches().count(), 2);
        assert_eq!(loader.batches().count(), 2);
    }
}
