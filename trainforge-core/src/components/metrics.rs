//! Metric computation over accumulated predictions.

use crate::components::criterion::sigmoid;
use crate::error::{ExecutorError, Result};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metric name -> one value per target column (or per aggregator once
/// reduced by [`MetricProcessor::compute_statistics`]).
pub type Metrics = BTreeMap<String, Vec<f64>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregator {
    Mean,
    Median,
    Std,
    Min,
    Max,
}

impl Aggregator {
    /// Reduce the finite entries of `values`; NaN when there are none.
    pub fn apply(self, values: &[f64]) -> f64 {
        let mut finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return f64::NAN;
        }
        let n = finite.len() as f64;
        match self {
            Aggregator::Mean => finite.iter().sum::<f64>() / n,
            Aggregator::Median => {
                finite.sort_by(f64::total_cmp);
                let mid = finite.len() / 2;
                if finite.len() % 2 == 0 {
                    (finite[mid - 1] + finite[mid]) / 2.0
                } else {
                    finite[mid]
                }
            }
            Aggregator::Std => {
                let mean = finite.iter().sum::<f64>() / n;
                (finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
            }
            Aggregator::Min => finite.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregator::Max => finite.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

pub trait MetricProcessor: Send {
    /// Per-metric, per-target values over all batches.
    fn compute_metrics(&self, ground_truth: &[Tensor], logits: &[Tensor]) -> Result<Metrics>;

    /// Reduce each metric's per-target values with every aggregator, in order.
    fn compute_statistics(&self, metrics: &Metrics, aggregators: &[Aggregator]) -> Metrics {
        metrics
            .iter()
            .map(|(name, values)| {
                (
                    name.clone(),
                    aggregators.iter().map(|a| a.apply(values)).collect(),
                )
            })
            .collect()
    }

    /// Per-target decision threshold on sigmoid scores.
    fn find_best_threshold(&self, ground_truth: &[Tensor], logits: &[Tensor]) -> Result<Vec<f32>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricKind {
    Mae,
    Mse,
    Rmse,
    R2,
    Accuracy,
    Precision,
    Recall,
    F1,
    RocAuc,
}

impl MetricKind {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "mae" => Self::Mae,
            "mse" => Self::Mse,
            "rmse" => Self::Rmse,
            "r2" => Self::R2,
            "accuracy" => Self::Accuracy,
            "precision" => Self::Precision,
            "recall" => Self::Recall,
            "f1" => Self::F1,
            "roc_auc" => Self::RocAuc,
            _ => return None,
        })
    }
}

/// Regression and binary-classification metrics per target column.
///
/// Classification metrics treat `sigmoid(logit) >= threshold` as positive and
/// targets `>= 0.5` as positive labels. NaN targets are skipped.
#[derive(Debug, Clone)]
pub struct PredictionProcessor {
    metrics: Vec<(String, MetricKind)>,
    threshold: f32,
}

impl PredictionProcessor {
    pub fn new(metrics: &[String], threshold: f32) -> Result<Self> {
        let metrics = metrics
            .iter()
            .map(|name| {
                MetricKind::parse(name)
                    .map(|kind| (name.clone(), kind))
                    .ok_or_else(|| ExecutorError::metric(format!("unknown metric '{name}'")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { metrics, threshold })
    }

    pub fn metric_names(&self) -> Vec<&str> {
        self.metrics.iter().map(|(n, _)| n.as_str()).collect()
    }

    fn stack(ground_truth: &[Tensor], logits: &[Tensor]) -> Result<(Tensor, Tensor)> {
        if ground_truth.len() != logits.len() {
            return Err(ExecutorError::metric(format!(
                "{} ground-truth batches vs {} logit batches",
                ground_truth.len(),
                logits.len()
            )));
        }
        let truth = Tensor::concat_rows(ground_truth)?;
        let predicted = Tensor::concat_rows(logits)?;
        if truth.shape() != predicted.shape() {
            return Err(ExecutorError::shape(format!(
                "ground truth {:?} vs logits {:?}",
                truth.shape(),
                predicted.shape()
            )));
        }
        Ok((truth, predicted))
    }

    fn compute_one(&self, kind: MetricKind, truth: &[f64], predicted: &[f64]) -> f64 {
        if truth.is_empty() {
            return f64::NAN;
        }
        let n = truth.len() as f64;
        match kind {
            MetricKind::Mae => truth.iter().zip(predicted).map(|(t, p)| (t - p).abs()).sum::<f64>() / n,
            MetricKind::Mse => mse(truth, predicted),
            MetricKind::Rmse => mse(truth, predicted).sqrt(),
            MetricKind::R2 => {
                let mean = truth.iter().sum::<f64>() / n;
                let ss_tot: f64 = truth.iter().map(|t| (t - mean).powi(2)).sum();
                let ss_res: f64 = truth.iter().zip(predicted).map(|(t, p)| (t - p).powi(2)).sum();
                if ss_tot == 0.0 {
                    if ss_res == 0.0 { 1.0 } else { 0.0 }
                } else {
                    1.0 - ss_res / ss_tot
                }
            }
            MetricKind::RocAuc => roc_auc(truth, predicted),
            MetricKind::Accuracy | MetricKind::Precision | MetricKind::Recall | MetricKind::F1 => {
                let c = Confusion::new(truth, predicted, self.threshold as f64);
                match kind {
                    MetricKind::Accuracy => (c.tp + c.tn) / n,
                    MetricKind::Precision => ratio(c.tp, c.tp + c.fp),
                    MetricKind::Recall => ratio(c.tp, c.tp + c.fn_),
                    _ => ratio(2.0 * c.tp, 2.0 * c.tp + c.fp + c.fn_),
                }
            }
        }
    }
}

fn mse(truth: &[f64], predicted: &[f64]) -> f64 {
    truth.iter().zip(predicted).map(|(t, p)| (t - p).powi(2)).sum::<f64>() / truth.len() as f64
}

fn ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 { 0.0 } else { num / den }
}

struct Confusion {
    tp: f64,
    tn: f64,
    fp: f64,
    fn_: f64,
}

impl Confusion {
    /// `scores` are probabilities.
    fn new(truth: &[f64], scores: &[f64], threshold: f64) -> Self {
        let mut c = Confusion {
            tp: 0.0,
            tn: 0.0,
            fp: 0.0,
            fn_: 0.0,
        };
        for (&t, &s) in truth.iter().zip(scores) {
            match (t >= 0.5, s >= threshold) {
                (true, true) => c.tp += 1.0,
                (false, false) => c.tn += 1.0,
                (false, true) => c.fp += 1.0,
                (true, false) => c.fn_ += 1.0,
            }
        }
        c
    }
}

/// Mann-Whitney formulation with average ranks for ties; NaN when only one
/// class is present.
fn roc_auc(truth: &[f64], scores: &[f64]) -> f64 {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));
    let mut ranks = vec![0.0; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = rank;
        }
        i = j + 1;
    }
    let positives = truth.iter().filter(|&&t| t >= 0.5).count() as f64;
    let negatives = truth.len() as f64 - positives;
    if positives == 0.0 || negatives == 0.0 {
        return f64::NAN;
    }
    let rank_sum: f64 = truth
        .iter()
        .zip(&ranks)
        .filter(|(t, _)| **t >= 0.5)
        .map(|(_, r)| r)
        .sum();
    (rank_sum - positives * (positives + 1.0) / 2.0) / (positives * negatives)
}

/// Labelled (truth, logit) pairs of column `col`.
fn column(truth: &Tensor, predicted: &Tensor, col: usize) -> (Vec<f64>, Vec<f64>) {
    truth
        .column(col)
        .into_iter()
        .zip(predicted.column(col))
        .filter(|(t, _)| !t.is_nan())
        .map(|(t, p)| (t as f64, p as f64))
        .unzip()
}

impl MetricProcessor for PredictionProcessor {
    fn compute_metrics(&self, ground_truth: &[Tensor], logits: &[Tensor]) -> Result<Metrics> {
        let (truth, predicted) = Self::stack(ground_truth, logits)?;
        let targets = truth.cols();
        let columns: Vec<(Vec<f64>, Vec<f64>)> =
            (0..targets).map(|c| column(&truth, &predicted, c)).collect();

        let mut metrics = Metrics::new();
        for (name, kind) in &self.metrics {
            let values = columns
                .iter()
                .map(|(t, p)| match kind {
                    MetricKind::Mae | MetricKind::Mse | MetricKind::Rmse | MetricKind::R2 => {
                        self.compute_one(*kind, t, p)
                    }
                    _ => {
                        let scores: Vec<f64> = p.iter().map(|&x| sigmoid(x as f32) as f64).collect();
                        self.compute_one(*kind, t, &scores)
                    }
                })
                .collect();
            metrics.insert(name.clone(), values);
        }
        Ok(metrics)
    }

    /// Maximises Youden's J (TPR - FPR) over the observed scores; falls back
    /// to the configured threshold for single-class targets.
    fn find_best_threshold(&self, ground_truth: &[Tensor], logits: &[Tensor]) -> Result<Vec<f32>> {
        let (truth, predicted) = Self::stack(ground_truth, logits)?;
        let thresholds = (0..truth.cols())
            .map(|c| {
                let (t, p) = column(&truth, &predicted, c);
                let scores: Vec<f64> = p.iter().map(|&x| sigmoid(x as f32) as f64).collect();
                let positives = t.iter().filter(|&&v| v >= 0.5).count() as f64;
                let negatives = t.len() as f64 - positives;
                if positives == 0.0 || negatives == 0.0 {
                    return self.threshold;
                }
                let mut candidates = scores.clone();
                candidates.sort_by(f64::total_cmp);
                candidates.dedup();
                let mut best = (f64::NEG_INFINITY, self.threshold as f64);
                for candidate in candidates {
                    let c = Confusion::new(&t, &scores, candidate);
                    let j = c.tp / positives - c.fp / negatives;
                    if j > best.0 {
                        best = (j, candidate);
                    }
                }
                best.1 as f32
            })
            .collect();
        Ok(thresholds)
    }
}
