// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::{PassportError, PassportResult};
use sp_nn::{Conv2d, PureResult, Tensor};

/// Per-channel scale and bias derived from a key.
#[derive(Clone, Debug, PartialEq)]
pub struct PassportParams {
    pub scale: Vec<f32>,
    pub bias: Vec<f32>,
}

/// Keyed transform bound to the geometry of one convolution.
///
/// The scale of channel `c` is the spatial and batch mean of the convolution
/// of `key_x`, which equals `weight[c] · p_x` where `p_x` is the mean
/// receptive-field patch of the key. The key is fixed, so `p_x` (and `p_y`
/// for the bias) are reduced once at bind time and every later evaluation is
/// a single matrix-vector product. The map is linear in the weight: no
/// division by activations, and the weight gradient is an outer product.
#[derive(Clone, Debug)]
pub struct PassportTransform {
    patch_x: Tensor,
    patch_y: Tensor,
}

fn guard_key(conv: &Conv2d, key: &Tensor, label: &str) -> PassportResult<()> {
    let (rows, cols) = key.shape();
    if rows == 0 || cols != conv.input_features() {
        return Err(PassportError::key(format!(
            "{label} has shape ({rows}, {cols}) but the convolution expects (n, {})",
            conv.input_features()
        )));
    }
    Ok(())
}

impl PassportTransform {
    /// Reduces the keys through the receptive field of `conv`. Without
    /// `key_y` the rows of `key_x` are split in half: the first half drives
    /// the scale, the second the bias.
    pub fn bind(conv: &Conv2d, key_x: &Tensor, key_y: Option<&Tensor>) -> PassportResult<Self> {
        guard_key(conv, key_x, "key_x")?;
        let (patch_x, patch_y) = match key_y {
            Some(key_y) => {
                guard_key(conv, key_y, "key_y")?;
                (conv.mean_patch(key_x)?, conv.mean_patch(key_y)?)
            }
            None => {
                let rows = key_x.shape().0;
                if rows < 2 {
                    return Err(PassportError::key(
                        "a single key needs at least two samples to split into scale and bias halves",
                    ));
                }
                let half = rows / 2;
                (
                    conv.mean_patch(&key_x.slice_rows(0, half)?)?,
                    conv.mean_patch(&key_x.slice_rows(half, rows)?)?,
                )
            }
        };
        Ok(Self { patch_x, patch_y })
    }

    /// Evaluates the transform for the current kernel weight `(C_out, span)`.
    pub fn compute(&self, weight: &Tensor) -> PureResult<PassportParams> {
        let weight_t = weight.transpose();
        Ok(PassportParams {
            scale: self.patch_x.matmul(&weight_t)?.into_vec(),
            bias: self.patch_y.matmul(&weight_t)?.into_vec(),
        })
    }

    /// Gradient with respect to the kernel weight given gradients on the
    /// produced scale and bias.
    pub fn weight_gradient(&self, grad_scale: &[f32], grad_bias: &[f32]) -> PureResult<Tensor> {
        let gs = Tensor::from_vec(grad_scale.len(), 1, grad_scale.to_vec())?;
        let gb = Tensor::from_vec(grad_bias.len(), 1, grad_bias.to_vec())?;
        gs.matmul(&self.patch_x)?.add(&gb.matmul(&self.patch_y)?)
    }
}

/// One-shot evaluation: runs `key_x` (and `key_y`) through `conv` and reduces
/// each output channel to its mean.
pub fn compute(conv: &Conv2d, key_x: &Tensor, key_y: Option<&Tensor>) -> PassportResult<PassportParams> {
    Ok(PassportTransform::bind(conv, key_x, key_y)?.compute(conv.weight().value())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use sp_nn::Module;

    fn conv() -> Conv2d {
        Conv2d::new("pt", 2, 3, (3, 3), (1, 1), (1, 1), (4, 4))
            .unwrap()
            .without_bias()
    }

    #[test]
    fn scale_is_the_channel_mean_of_the_keyed_convolution() {
        let conv = conv();
        let key_x = Tensor::random_normal(4, 32, 0.0, 1.0, Some(5)).unwrap();
        let key_y = Tensor::random_normal(4, 32, 0.0, 1.0, Some(6)).unwrap();
        let params = compute(&conv, &key_x, Some(&key_y)).unwrap();
        let out = conv.forward(&key_x).unwrap();
        for c in 0..3 {
            let mut total = 0.0;
            for b in 0..4 {
                total += out.data()[b * 48 + c * 16..b * 48 + (c + 1) * 16]
                    .iter()
                    .sum::<f32>();
            }
            assert_relative_eq!(params.scale[c], total / 64.0, epsilon = 1e-4);
        }
        assert_eq!(params.bias.len(), 3);
    }

    #[test]
    fn zero_key_gives_zero_params_without_nans() {
        let conv = conv();
        let key = Tensor::zeros(2, 32).unwrap();
        let params = compute(&conv, &key, None).unwrap();
        assert!(params.scale.iter().chain(&params.bias).all(|v| *v == 0.0));
    }

    #[test]
    fn single_sample_key_cannot_be_split() {
        let conv = conv();
        let key = Tensor::zeros(1, 32).unwrap();
        assert!(matches!(
            PassportTransform::bind(&conv, &key, None),
            Err(PassportError::KeyBinding(_))
        ));
        let wrong = Tensor::zeros(2, 31).unwrap();
        assert!(matches!(
            PassportTransform::bind(&conv, &wrong, None),
            Err(PassportError::KeyBinding(_))
        ));
    }

    #[test]
    fn weight_gradient_matches_finite_difference() {
        let conv = conv();
        let key = Tensor::random_normal(4, 32, 0.0, 1.0, Some(8)).unwrap();
        let transform = PassportTransform::bind(&conv, &key, None).unwrap();
        let grad_scale = [1.0, -2.0, 0.5];
        let grad_bias = [0.25, 0.0, 1.0];
        let grad = transform.weight_gradient(&grad_scale, &grad_bias).unwrap();
        let objective = |w: &Tensor| {
            let p = transform.compute(w).unwrap();
            (0..3)
                .map(|c| grad_scale[c] * p.scale[c] + grad_bias[c] * p.bias[c])
                .sum::<f32>()
        };
        let weight = conv.weight().value().clone();
        for idx in [0usize, 7, 20, 40] {
            let mut plus = weight.clone();
            plus.data_mut()[idx] += 1e-2;
            let mut minus = weight.clone();
            minus.data_mut()[idx] -= 1e-2;
            let numeric = (objective(&plus) - objective(&minus)) / 2e-2;
            assert_relative_eq!(grad.data()[idx], numeric, epsilon = 1e-3);
        }
    }
}
