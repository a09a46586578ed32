//! Loss functions.
//!
//! Targets may contain NaN for missing labels; those entries contribute
//! neither to the loss nor to the gradient.

use crate::error::{ExecutorError, Result};
use crate::tensor::Tensor;

/// Scalar loss plus its gradient with respect to the logits.
#[derive(Debug, Clone, PartialEq)]
pub struct LossOutput {
    pub value: f32,
    pub grad: Tensor,
}

pub trait Criterion: Send {
    /// `extras` are additional loss terms supplied by observers; the mean of
    /// each is added to the loss value.
    fn compute(&self, logits: &Tensor, targets: &Tensor, extras: &[Tensor]) -> Result<LossOutput>;

    fn name(&self) -> &str;
}

fn check_shapes(logits: &Tensor, targets: &Tensor) -> Result<()> {
    if logits.shape() != targets.shape() {
        return Err(ExecutorError::shape(format!(
            "logits {:?} vs targets {:?}",
            logits.shape(),
            targets.shape()
        )));
    }
    Ok(())
}

fn extras_total(extras: &[Tensor]) -> f32 {
    extras.iter().map(Tensor::mean).sum()
}

/// Per-element loss/gradient over the labelled entries, averaged.
fn masked_mean(
    logits: &Tensor,
    targets: &Tensor,
    element: impl Fn(f32, f32) -> (f32, f32),
) -> (f32, Tensor) {
    let labelled = targets.data().iter().filter(|t| !t.is_nan()).count();
    let mut grad = Tensor::zeros(logits.shape()).to_device(logits.device());
    if labelled == 0 {
        return (0.0, grad);
    }
    let n = labelled as f32;
    let mut total = 0.0;
    for (i, (&y, &t)) in logits.data().iter().zip(targets.data()).enumerate() {
        if t.is_nan() {
            continue;
        }
        let (loss, dloss) = element(y, t);
        total += loss;
        grad.data_mut()[i] = dloss / n;
    }
    (total / n, grad)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MseLoss;

impl Criterion for MseLoss {
    fn compute(&self, logits: &Tensor, targets: &Tensor, extras: &[Tensor]) -> Result<LossOutput> {
        check_shapes(logits, targets)?;
        let (value, grad) = masked_mean(logits, targets, |y, t| {
            let d = y - t;
            (d * d, 2.0 * d)
        });
        Ok(LossOutput {
            value: value + extras_total(extras),
            grad,
        })
    }

    fn name(&self) -> &str {
        "mse"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BceWithLogitsLoss;

pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl Criterion for BceWithLogitsLoss {
    fn compute(&self, logits: &Tensor, targets: &Tensor, extras: &[Tensor]) -> Result<LossOutput> {
        check_shapes(logits, targets)?;
        let (value, grad) = masked_mean(logits, targets, |x, t| {
            let loss = x.max(0.0) - x * t + (1.0 + (-x.abs()).exp()).ln();
            (loss, sigmoid(x) - t)
        });
        Ok(LossOutput {
            value: value + extras_total(extras),
            grad,
        })
    }

    fn name(&self) -> &str {
        "bce_with_logits"
    }
}
