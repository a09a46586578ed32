//! Exponentially smoothed running averages for loss and metrics.

use serde::{Deserialize, Serialize};

/// `s_t = alpha * x_t + (1 - alpha) * s_{t-1}`, seeded by the first update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExponentialTracker {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialTracker {
    /// `alpha` is the weight of the newest observation, clamped to `[0, 1]`.
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            value: None,
        }
    }

    pub fn update(&mut self, x: f64) {
        self.value = Some(match self.value {
            None => x,
            Some(prev) => self.alpha * x + (1.0 - self.alpha) * prev,
        });
    }

    /// Current smoothed value; `0.0` before the first update.
    pub fn get(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    pub fn reset(&mut self) {
        self.value = None;
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}
