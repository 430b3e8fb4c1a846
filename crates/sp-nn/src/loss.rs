// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, Tensor, TensorError};

pub trait Loss {
    /// Computes the loss value for the given predictions and targets.
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor>;

    /// Returns the gradient of the loss with respect to the predictions.
    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor>;
}

/// Cross entropy over raw logits with one-hot (or soft) targets, averaged
/// over the batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftmaxCrossEntropy;

impl SoftmaxCrossEntropy {
    pub fn new() -> Self {
        Self
    }
}

fn guard_pair(prediction: &Tensor, target: &Tensor) -> PureResult<()> {
    if prediction.shape() != target.shape() {
        return Err(TensorError::ShapeMismatch {
            left: prediction.shape(),
            right: target.shape(),
        });
    }
    Ok(())
}

/// Row-wise softmax with max subtraction.
pub fn softmax(logits: &Tensor) -> PureResult<Tensor> {
    let (rows, cols) = logits.shape();
    let mut out = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        let row = logits.row(r)?;
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = row.iter().map(|v| (v - max).exp()).collect();
        let total: f32 = exps.iter().sum();
        out.extend(exps.into_iter().map(|e| e / total));
    }
    Tensor::from_vec(rows, cols, out)
}

/// One-hot row for `label` among `classes`.
pub fn one_hot(label: usize, classes: usize) -> PureResult<Tensor> {
    if label >= classes {
        return Err(TensorError::InvalidValue {
            label: "one_hot_label_out_of_range",
        });
    }
    Tensor::from_fn(1, classes, |_, c| if c == label { 1.0 } else { 0.0 })
}

/// Number of rows whose argmax agrees between logits and targets.
pub fn correct_predictions(logits: &Tensor, target: &Tensor) -> PureResult<usize> {
    guard_pair(logits, target)?;
    Ok(logits
        .argmax_rows()
        .into_iter()
        .zip(target.argmax_rows())
        .filter(|(p, t)| p == t)
        .count())
}

impl Loss for SoftmaxCrossEntropy {
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        guard_pair(prediction, target)?;
        let rows = prediction.shape().0;
        let mut sum = 0.0f32;
        for r in 0..rows {
            let row = prediction.row(r)?;
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let log_total = row.iter().map(|v| (v - max).exp()).sum::<f32>().ln() + max;
            for (logit, tgt) in row.iter().zip(target.row(r)?) {
                sum += tgt * (log_total - logit);
            }
        }
        Tensor::from_vec(1, 1, vec![sum / rows as f32])
    }

    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        guard_pair(prediction, target)?;
        let inv_batch = 1.0 / prediction.shape().0 as f32;
        softmax(prediction)?.sub(target)?.scale(inv_batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn uniform_logits_give_log_classes() {
        let mut loss = SoftmaxCrossEntropy::new();
        let logits = Tensor::zeros(2, 4).unwrap();
        let target = Tensor::cat_rows(&[one_hot(0, 4).unwrap(), one_hot(3, 4).unwrap()]).unwrap();
        let value = loss.forward(&logits, &target).unwrap();
        assert_relative_eq!(value.data()[0], 4.0f32.ln(), epsilon = 1e-5);
        let grad = loss.backward(&logits, &target).unwrap();
        assert_relative_eq!(grad.data()[0], (0.25 - 1.0) / 2.0, epsilon = 1e-6);
        assert_relative_eq!(grad.data()[1], 0.25 / 2.0, epsilon = 1e-6);
    }

    #[test]
    fn accuracy_counts_argmax_agreement() {
        let logits = Tensor::from_vec(2, 2, vec![2.0, 1.0, 0.0, 1.0]).unwrap();
        let target = Tensor::from_vec(2, 2, vec![1.0, 0.0, 1.0, 0.0]).unwrap();
        assert_eq!(correct_predictions(&logits, &target).unwrap(), 1);
    }
}
