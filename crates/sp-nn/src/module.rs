// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Trainable tensor with a Euclidean gradient accumulator.
pub struct Parameter {
    name: String,
    value: Tensor,
    gradient: Option<Tensor>,
    trainable: bool,
}

impl core::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (rows, cols) = self.value.shape();
        write!(
            f,
            "Parameter(name={},shape=({},{}),has_grad={},trainable={})",
            self.name,
            rows,
            cols,
            self.gradient.is_some(),
            self.trainable
        )
    }
}

impl Parameter {
    /// Creates a new trainable parameter with the provided tensor value.
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            gradient: None,
            trainable: true,
        }
    }

    /// Returns the identifier assigned to the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Overrides the parameter name.
    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Provides an immutable view into the underlying tensor value.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Provides a mutable view into the underlying tensor value.
    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    /// Returns the accumulated gradient, if any backward pass touched the parameter.
    pub fn gradient(&self) -> Option<&Tensor> {
        self.gradient.as_ref()
    }

    /// Whether optimisers are allowed to update this parameter.
    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    /// Freezes or unfreezes the parameter. Frozen parameters keep accumulating
    /// gradients (callers may inspect them) but optimisers skip the update.
    pub fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    fn assert_shape(&self, tensor: &Tensor) -> PureResult<()> {
        if self.value.shape() != tensor.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.value.shape(),
                right: tensor.shape(),
            });
        }
        Ok(())
    }

    /// Adds `update` to the gradient buffer.
    pub fn accumulate_euclidean(&mut self, update: &Tensor) -> PureResult<()> {
        self.assert_shape(update)?;
        match self.gradient.as_mut() {
            Some(existing) => existing.add_scaled(update, 1.0)?,
            None => self.gradient = Some(update.clone()),
        }
        Ok(())
    }

    /// Clears the cached gradient.
    pub fn zero_gradient(&mut self) {
        if let Some(grad) = self.gradient.as_mut() {
            grad.data_mut().fill(0.0);
        }
    }

    /// Plain gradient step `value -= lr * grad`, skipped for frozen parameters.
    pub fn apply_step(&mut self, learning_rate: f32) -> PureResult<()> {
        if !self.trainable {
            self.zero_gradient();
            return Ok(());
        }
        if let Some(grad) = self.gradient.as_mut() {
            self.value.add_scaled(grad, -learning_rate)?;
            grad.data_mut().fill(0.0);
        }
        Ok(())
    }

    /// Replaces the parameter value with the provided tensor.
    pub fn load_value(&mut self, value: &Tensor) -> PureResult<()> {
        self.assert_shape(value)?;
        self.value = value.clone();
        Ok(())
    }
}

/// Module trait modelled on `nn.Module`, with an explicit backward pass.
pub trait Module {
    /// Runs a forward pass.
    fn forward(&self, input: &Tensor) -> PureResult<Tensor>;

    /// Propagates a gradient backwards. Implementations populate the relevant
    /// parameter accumulators before returning the gradient with respect to
    /// `input`. Must be called after a `forward` on the same input.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor>;

    /// Visits immutable parameters.
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Visits mutable parameters.
    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Switches between batch statistics (training) and running statistics.
    fn set_training(&self, _training: bool) {}

    /// Non-trainable state (running statistics) keyed by canonical name.
    fn buffers(&self) -> HashMap<String, Tensor> {
        HashMap::new()
    }

    /// Restores buffers captured by [`Module::buffers`]. Unknown names are ignored.
    fn load_buffers(&mut self, _buffers: &HashMap<String, Tensor>) -> PureResult<()> {
        Ok(())
    }

    /// Applies every parameter update with plain SGD.
    fn apply_step(&mut self, learning_rate: f32) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| param.apply_step(learning_rate))
    }

    /// Clears accumulators across every parameter.
    fn zero_accumulators(&mut self) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })
    }

    /// Freezes or unfreezes every parameter.
    fn set_trainable(&mut self, trainable: bool) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.set_trainable(trainable);
            Ok(())
        })
    }

    /// Captures a copy of every parameter tensor keyed by its canonical name.
    fn state_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores parameters from a state dictionary produced by [`Module::state_dict`].
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_parameter_ignores_steps() {
        let mut param = Parameter::new("gate", Tensor::from_vec(1, 2, vec![1.0, 2.0]).unwrap());
        param.set_trainable(false);
        param
            .accumulate_euclidean(&Tensor::from_vec(1, 2, vec![0.5, 0.5]).unwrap())
            .unwrap();
        param.apply_step(1.0).unwrap();
        assert_eq!(param.value().data(), &[1.0, 2.0]);
        assert_eq!(param.gradient().unwrap().data(), &[0.0, 0.0]);
    }

    #[test]
    fn gradients_accumulate_until_step() {
        let mut param = Parameter::new("w", Tensor::zeros(1, 2).unwrap());
        let update = Tensor::from_vec(1, 2, vec![1.0, -1.0]).unwrap();
        param.accumulate_euclidean(&update).unwrap();
        param.accumulate_euclidean(&update).unwrap();
        assert_eq!(param.gradient().unwrap().data(), &[2.0, -2.0]);
        param.apply_step(0.5).unwrap();
        assert_eq!(param.value().data(), &[-1.0, 1.0]);
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let mut param = Parameter::new("w", Tensor::zeros(1, 2).unwrap());
        let err = param.load_value(&Tensor::zeros(2, 1).unwrap()).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));
    }
}
