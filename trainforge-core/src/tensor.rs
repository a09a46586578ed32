//! Dense `f32` tensors tagged with the device they live on.
//!
//! This is deliberately small: executors only need placement, a handful of
//! 2-D helpers for the built-in collaborators, and serde support for
//! checkpoints. Heavy numerics belong to the network implementation.

use crate::error::{ExecutorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Compute device a tensor is placed on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(u32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(id) => write!(f, "cuda:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
    #[serde(default)]
    device: Device,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(ExecutorError::shape(format!(
                "shape {shape:?} needs {expected} values, got {}",
                data.len()
            )));
        }
        Ok(Self {
            shape,
            data,
            device: Device::Cpu,
        })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; shape.iter().product()],
            device: Device::Cpu,
        }
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![value; shape.iter().product()],
            device: Device::Cpu,
        }
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            shape: vec![1],
            data: vec![value],
            device: Device::Cpu,
        }
    }

    /// Build a `[rows, cols]` tensor from row vectors.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let cols = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|r| r.len() != cols) {
            return Err(ExecutorError::shape("ragged rows"));
        }
        let data = rows.iter().flatten().copied().collect();
        Self::new(vec![rows.len(), cols], data)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy onto `device`. A no-op clone when already there.
    pub fn to_device(&self, device: Device) -> Tensor {
        let mut moved = self.clone();
        moved.device = device;
        moved
    }

    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Columns of a 2-D tensor; a 1-D tensor is treated as a single column.
    pub fn cols(&self) -> usize {
        match self.shape.len() {
            0 | 1 => 1,
            _ => self.shape[1..].iter().product(),
        }
    }

    pub fn row(&self, index: usize) -> &[f32] {
        let cols = self.cols();
        &self.data[index * cols..(index + 1) * cols]
    }

    pub fn column(&self, index: usize) -> Vec<f32> {
        let cols = self.cols();
        (0..self.rows()).map(|r| self.data[r * cols + index]).collect()
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols() + col]
    }

    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().sum::<f32>() / self.data.len() as f32
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&v| f(v)).collect(),
            device: self.device,
        }
    }

    pub fn zip_map(&self, other: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
        self.ensure_same_shape(other)?;
        Ok(Tensor {
            shape: self.shape.clone(),
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect(),
            device: self.device,
        })
    }

    pub fn add_assign(&mut self, other: &Tensor) -> Result<()> {
        self.ensure_same_shape(other)?;
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
        Ok(())
    }

    /// `[n, k] x [k, m] -> [n, m]`
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        let (n, k) = (self.rows(), self.cols());
        let (k2, m) = (other.rows(), other.cols());
        if k != k2 {
            return Err(ExecutorError::shape(format!(
                "cannot multiply [{n}, {k}] by [{k2}, {m}]"
            )));
        }
        let mut out = vec![0.0; n * m];
        for i in 0..n {
            for p in 0..k {
                let a = self.data[i * k + p];
                if a == 0.0 {
                    continue;
                }
                for j in 0..m {
                    out[i * m + j] += a * other.data[p * m + j];
                }
            }
        }
        Ok(Tensor {
            shape: vec![n, m],
            data: out,
            device: self.device,
        })
    }

    pub fn transpose(&self) -> Tensor {
        let (n, m) = (self.rows(), self.cols());
        let mut out = vec![0.0; n * m];
        for i in 0..n {
            for j in 0..m {
                out[j * n + i] = self.data[i * m + j];
            }
        }
        Tensor {
            shape: vec![m, n],
            data: out,
            device: self.device,
        }
    }

    /// Sum over rows, producing a `[cols]` tensor.
    pub fn sum_rows(&self) -> Tensor {
        let cols = self.cols();
        let mut out = vec![0.0; cols];
        for r in 0..self.rows() {
            for (c, slot) in out.iter_mut().enumerate() {
                *slot += self.data[r * cols + c];
            }
        }
        Tensor {
            shape: vec![cols],
            data: out,
            device: self.device,
        }
    }

    /// Stack tensors with equal column counts along the first axis.
    pub fn concat_rows(parts: &[Tensor]) -> Result<Tensor> {
        let Some(first) = parts.first() else {
            return Ok(Tensor::zeros(&[0, 0]));
        };
        let cols = first.cols();
        let mut data = Vec::new();
        let mut rows = 0;
        for part in parts {
            if part.cols() != cols {
                return Err(ExecutorError::shape(format!(
                    "cannot stack {} columns onto {cols}",
                    part.cols()
                )));
            }
            rows += part.rows();
            data.extend_from_slice(&part.data);
        }
        Ok(Tensor {
            shape: vec![rows, cols],
            data,
            device: first.device,
        })
    }

    fn ensure_same_shape(&self, other: &Tensor) -> Result<()> {
        if self.shape != other.shape {
            return Err(ExecutorError::shape(format!(
                "{:?} vs {:?}",
                self.shape, other.shape
            )));
        }
        Ok(())
    }
}
