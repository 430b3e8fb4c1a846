// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{init_seed, validate_positive};
use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};

/// Fully connected layer storing its weight as `(input_dim, output_dim)`.
#[derive(Debug)]
pub struct Linear {
    weight: Parameter,
    bias: Parameter,
}

impl Linear {
    /// Creates a new linear layer with Kaiming-uniform weights and a zero bias.
    pub fn new(name: impl Into<String>, input_dim: usize, output_dim: usize) -> PureResult<Self> {
        validate_positive(input_dim, "input_dim")?;
        validate_positive(output_dim, "output_dim")?;
        let name = name.into();
        let bound = (6.0 / input_dim as f32).sqrt();
        let weight = Tensor::random_uniform(
            input_dim,
            output_dim,
            -bound,
            bound,
            Some(init_seed(&name)),
        )?;
        let bias = Tensor::zeros(1, output_dim)?;
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Parameter::new(format!("{name}::bias"), bias),
        })
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> &Parameter {
        &self.bias
    }

    pub fn output_dim(&self) -> usize {
        self.weight.value().shape().1
    }

    /// Redraws the weight from the initial distribution and zeroes the bias.
    pub fn reset_parameters(&mut self, seed: u64) -> PureResult<()> {
        let (input_dim, output_dim) = self.weight.value().shape();
        let bound = (6.0 / input_dim as f32).sqrt();
        let weight = Tensor::random_uniform(input_dim, output_dim, -bound, bound, Some(seed))?;
        self.weight.load_value(&weight)?;
        self.bias.load_value(&Tensor::zeros(1, output_dim)?)?;
        self.weight.zero_gradient();
        self.bias.zero_gradient();
        Ok(())
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let mut out = input.matmul(self.weight.value())?;
        out.add_row_inplace(self.bias.value().data())?;
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape().0 != grad_output.shape().0 {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let grad_w = input.transpose().matmul(grad_output)?;
        let grad_b = Tensor::row_vector(&grad_output.sum_axis0())?;
        self.weight.accumulate_euclidean(&grad_w)?;
        self.bias.accumulate_euclidean(&grad_b)?;
        grad_output.matmul(&self.weight.value().transpose())
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_forward_backward_shapes() {
        let mut layer = Linear::new("fc", 3, 2).unwrap();
        let input = Tensor::from_vec(2, 3, vec![1.0, 0.0, -1.0, 0.5, 0.5, 0.5]).unwrap();
        let out = layer.forward(&input).unwrap();
        assert_eq!(out.shape(), (2, 2));
        let grad = layer
            .backward(&input, &Tensor::full(2, 2, 1.0).unwrap())
            .unwrap();
        assert_eq!(grad.shape(), (2, 3));
        assert_eq!(layer.bias().gradient().unwrap().data(), &[2.0, 2.0]);
    }

    #[test]
    fn same_name_initialises_identically() {
        let a = Linear::new("head", 4, 4).unwrap();
        let b = Linear::new("head", 4, 4).unwrap();
        assert_eq!(a.weight().value(), b.weight().value());
    }

    #[test]
    fn reset_redraws_weight_and_clears_bias() {
        let mut layer = Linear::new("head", 4, 3).unwrap();
        let before = layer.weight().value().clone();
        layer.reset_parameters(99).unwrap();
        assert_ne!(layer.weight().value(), &before);
        assert!(layer.bias().value().data().iter().all(|v| *v == 0.0));
    }
}
