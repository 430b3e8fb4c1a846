// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::Module;
use crate::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Stochastic gradient descent with heavy-ball momentum and L2 weight decay.
///
/// Velocity buffers are keyed by parameter name. Frozen parameters are never
/// updated and keep no velocity.
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    weight_decay: f32,
    velocity: HashMap<String, Tensor>,
}

impl Sgd {
    pub fn new(learning_rate: f32, momentum: f32, weight_decay: f32) -> PureResult<Self> {
        for (label, value) in [
            ("sgd_learning_rate", learning_rate),
            ("sgd_momentum", momentum),
            ("sgd_weight_decay", weight_decay),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(TensorError::NonFiniteValue { label, value });
            }
        }
        Ok(Self {
            learning_rate,
            momentum,
            weight_decay,
            velocity: HashMap::new(),
        })
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    /// Applies one update to every trainable parameter of `module` that has a
    /// gradient, then clears all accumulators.
    pub fn step<M: Module + ?Sized>(&mut self, module: &mut M) -> PureResult<()> {
        let (lr, momentum, decay) = (self.learning_rate, self.momentum, self.weight_decay);
        let velocity = &mut self.velocity;
        module.visit_parameters_mut(&mut |param| {
            if !param.is_trainable() {
                param.zero_gradient();
                return Ok(());
            }
            let Some(grad) = param.gradient() else {
                return Ok(());
            };
            let mut direction = grad.clone();
            if decay > 0.0 {
                direction.add_scaled(param.value(), decay)?;
            }
            if momentum > 0.0 {
                match velocity.get_mut(param.name()) {
                    Some(buffer) => {
                        *buffer = buffer.scale(momentum)?;
                        buffer.add_scaled(&direction, 1.0)?;
                        direction = buffer.clone();
                    }
                    None => {
                        velocity.insert(param.name().to_string(), direction.clone());
                    }
                }
            }
            param.value_mut().add_scaled(&direction, -lr)?;
            param.zero_gradient();
            Ok(())
        })
    }

    /// Drops velocity buffers, e.g. after parameters were replaced wholesale.
    pub fn reset(&mut self) {
        self.velocity.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::linear::Linear;
    use approx::assert_relative_eq;

    #[test]
    fn momentum_accumulates_across_steps() {
        let mut layer = Linear::new("opt", 1, 1).unwrap();
        let start = layer.bias().value().data()[0];
        let mut sgd = Sgd::new(0.1, 0.9, 0.0).unwrap();
        for _ in 0..2 {
            layer
                .visit_parameters_mut(&mut |p| {
                    let shape = p.value().shape();
                    p.accumulate_euclidean(&Tensor::full(shape.0, shape.1, 1.0)?)
                })
                .unwrap();
            sgd.step(&mut layer).unwrap();
        }
        // 0.1 * 1 + 0.1 * (0.9 + 1)
        assert_relative_eq!(layer.bias().value().data()[0], start - 0.29, epsilon = 1e-6);
    }

    #[test]
    fn frozen_parameters_are_skipped() {
        let mut layer = Linear::new("frozen", 2, 1).unwrap();
        layer.set_trainable(false).unwrap();
        let before = layer.state_dict().unwrap();
        layer
            .visit_parameters_mut(&mut |p| {
                let shape = p.value().shape();
                p.accumulate_euclidean(&Tensor::full(shape.0, shape.1, 1.0)?)
            })
            .unwrap();
        Sgd::new(1.0, 0.0, 0.1).unwrap().step(&mut layer).unwrap();
        assert_eq!(layer.state_dict().unwrap(), before);
    }
}
