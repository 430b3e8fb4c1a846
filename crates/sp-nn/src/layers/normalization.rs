// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::validate_positive;
use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct NormCache {
    normed: Tensor,
    inv_std: Vec<f32>,
    batch_stats: bool,
}

/// Batch normalisation over `(batch, channels * height * width)` feature maps.
///
/// Statistics are computed per channel over the batch and spatial axes. With
/// `affine = false` the layer only normalises, leaving the scale and shift to
/// whatever follows it.
#[derive(Debug)]
pub struct BatchNorm2d {
    name: String,
    channels: usize,
    spatial: usize,
    momentum: f32,
    epsilon: f32,
    affine: Option<(Parameter, Parameter)>,
    running_mean: RefCell<Vec<f32>>,
    running_var: RefCell<Vec<f32>>,
    training: Cell<bool>,
    cache: RefCell<Option<NormCache>>,
}

impl BatchNorm2d {
    pub fn new(
        name: impl Into<String>,
        channels: usize,
        input_hw: (usize, usize),
        momentum: f32,
        epsilon: f32,
        affine: bool,
    ) -> PureResult<Self> {
        validate_positive(channels, "channels")?;
        validate_positive(input_hw.0 * input_hw.1, "spatial")?;
        if !(0.0..=1.0).contains(&momentum) {
            return Err(TensorError::InvalidValue {
                label: "batchnorm_momentum",
            });
        }
        if epsilon <= 0.0 || !epsilon.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "batchnorm_epsilon",
                value: epsilon,
            });
        }
        let name = name.into();
        let affine = if affine {
            Some((
                Parameter::new(format!("{name}::gamma"), Tensor::full(1, channels, 1.0)?),
                Parameter::new(format!("{name}::beta"), Tensor::zeros(1, channels)?),
            ))
        } else {
            None
        };
        Ok(Self {
            name,
            channels,
            spatial: input_hw.0 * input_hw.1,
            momentum,
            epsilon,
            affine,
            running_mean: RefCell::new(vec![0.0; channels]),
            running_var: RefCell::new(vec![1.0; channels]),
            training: Cell::new(true),
            cache: RefCell::new(None),
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn is_training(&self) -> bool {
        self.training.get()
    }

    /// Learned scale and shift, when the layer owns them.
    pub fn affine(&self) -> Option<(&Parameter, &Parameter)> {
        self.affine.as_ref().map(|(g, b)| (g, b))
    }

    pub fn affine_mut(&mut self) -> Option<(&mut Parameter, &mut Parameter)> {
        self.affine.as_mut().map(|(g, b)| (g, b))
    }

    pub fn running_mean(&self) -> Vec<f32> {
        self.running_mean.borrow().clone()
    }

    pub fn running_var(&self) -> Vec<f32> {
        self.running_var.borrow().clone()
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<()> {
        let cols = input.shape().1;
        if cols != self.channels * self.spatial {
            return Err(TensorError::ShapeMismatch {
                left: (1, cols),
                right: (1, self.channels * self.spatial),
            });
        }
        Ok(())
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let (batch, cols) = input.shape();
        let data = input.data();
        let count = (batch * self.spatial) as f32;
        let use_batch = self.training.get() && batch * self.spatial > 1;
        let (mean, var) = if use_batch {
            let mut mean = vec![0.0f32; self.channels];
            let mut var = vec![0.0f32; self.channels];
            for b in 0..batch {
                for (c, slot) in mean.iter_mut().enumerate() {
                    let start = b * cols + c * self.spatial;
                    *slot += data[start..start + self.spatial].iter().sum::<f32>();
                }
            }
            mean.iter_mut().for_each(|m| *m /= count);
            for b in 0..batch {
                for c in 0..self.channels {
                    let start = b * cols + c * self.spatial;
                    var[c] += data[start..start + self.spatial]
                        .iter()
                        .map(|v| (v - mean[c]).powi(2))
                        .sum::<f32>();
                }
            }
            var.iter_mut().for_each(|v| *v /= count);
            let unbiased = count / (count - 1.0);
            let mut running_mean = self.running_mean.borrow_mut();
            let mut running_var = self.running_var.borrow_mut();
            for c in 0..self.channels {
                running_mean[c] = (1.0 - self.momentum) * running_mean[c] + self.momentum * mean[c];
                running_var[c] =
                    (1.0 - self.momentum) * running_var[c] + self.momentum * var[c] * unbiased;
            }
            (mean, var)
        } else {
            (self.running_mean(), self.running_var())
        };
        let inv_std: Vec<f32> = var
            .iter()
            .map(|v| 1.0 / (v + self.epsilon).sqrt())
            .collect();
        let normed = Tensor::from_fn(batch, cols, |b, col| {
            let c = col / self.spatial;
            (data[b * cols + col] - mean[c]) * inv_std[c]
        })?;
        let output = match &self.affine {
            Some((gamma, beta)) => {
                let (g, s) = (gamma.value().data(), beta.value().data());
                Tensor::from_fn(batch, cols, |b, col| {
                    let c = col / self.spatial;
                    normed.data()[b * cols + col] * g[c] + s[c]
                })?
            }
            None => normed.clone(),
        };
        *self.cache.borrow_mut() = Some(NormCache {
            normed,
            inv_std,
            batch_stats: use_batch,
        });
        Ok(output)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let cache = self
            .cache
            .borrow_mut()
            .take()
            .ok_or(TensorError::InvalidValue {
                label: "batchnorm_backward_without_forward",
            })?;
        let (batch, cols) = input.shape();
        let normed = cache.normed.data();
        let grad = grad_output.data();
        let spatial = self.spatial;
        let mut grad_normed = grad.to_vec();
        if let Some((gamma, beta)) = self.affine.as_mut() {
            let mut grad_gamma = vec![0.0f32; self.channels];
            let mut grad_beta = vec![0.0f32; self.channels];
            for (idx, g) in grad.iter().enumerate() {
                let c = (idx % cols) / spatial;
                grad_gamma[c] += g * normed[idx];
                grad_beta[c] += g;
            }
            let scale = gamma.value().data().to_vec();
            for (idx, slot) in grad_normed.iter_mut().enumerate() {
                *slot *= scale[(idx % cols) / spatial];
            }
            gamma.accumulate_euclidean(&Tensor::row_vector(&grad_gamma)?)?;
            beta.accumulate_euclidean(&Tensor::row_vector(&grad_beta)?)?;
        }
        if !cache.batch_stats {
            return Tensor::from_fn(batch, cols, |b, col| {
                grad_normed[b * cols + col] * cache.inv_std[col / spatial]
            });
        }
        let count = (batch * spatial) as f32;
        let mut sum_grad = vec![0.0f32; self.channels];
        let mut sum_grad_normed = vec![0.0f32; self.channels];
        for (idx, g) in grad_normed.iter().enumerate() {
            let c = (idx % cols) / spatial;
            sum_grad[c] += g;
            sum_grad_normed[c] += g * normed[idx];
        }
        Tensor::from_fn(batch, cols, |b, col| {
            let idx = b * cols + col;
            let c = col / spatial;
            cache.inv_std[c] / count
                * (count * grad_normed[idx] - sum_grad[c] - normed[idx] * sum_grad_normed[c])
        })
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        if let Some((gamma, beta)) = &self.affine {
            visitor(gamma)?;
            visitor(beta)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        if let Some((gamma, beta)) = &mut self.affine {
            visitor(gamma)?;
            visitor(beta)?;
        }
        Ok(())
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }

    fn buffers(&self) -> HashMap<String, Tensor> {
        let mut buffers = HashMap::new();
        if let Ok(mean) = Tensor::row_vector(&self.running_mean.borrow()) {
            buffers.insert(format!("{}::running_mean", self.name), mean);
        }
        if let Ok(var) = Tensor::row_vector(&self.running_var.borrow()) {
            buffers.insert(format!("{}::running_var", self.name), var);
        }
        buffers
    }

    fn load_buffers(&mut self, buffers: &HashMap<String, Tensor>) -> PureResult<()> {
        for (suffix, slot) in [
            ("running_mean", &self.running_mean),
            ("running_var", &self.running_var),
        ] {
            if let Some(value) = buffers.get(&format!("{}::{suffix}", self.name)) {
                if value.shape() != (1, self.channels) {
                    return Err(TensorError::ShapeMismatch {
                        left: value.shape(),
                        right: (1, self.channels),
                    });
                }
                slot.borrow_mut().copy_from_slice(value.data());
            }
        }
        Ok(())
    }
}
