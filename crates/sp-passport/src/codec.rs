// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::{PassportError, PassportResult};
use sp_nn::{PureResult, Tensor, TensorError};

/// Margin of the sign hinge loss.
pub const SIGN_LOSS_MARGIN: f32 = 0.1;

/// Sign bit of a scale entry. Zero counts as positive so every value maps to
/// exactly one bit.
#[inline]
pub fn sign_bit(value: f32) -> i8 {
    if value >= 0.0 || value.is_nan() {
        1
    } else {
        -1
    }
}

/// Ground-truth signature of one passport layer: a `{-1, +1}` bit per output channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureCodec {
    bits: Vec<i8>,
}

impl SignatureCodec {
    /// Records `sign(scale)` as the ground truth.
    pub fn embed(scale: &[f32]) -> Self {
        Self {
            bits: scale.iter().map(|v| sign_bit(*v)).collect(),
        }
    }

    pub fn from_bits(bits: Vec<i8>) -> PassportResult<Self> {
        if let Some(bad) = bits.iter().find(|b| **b != 1 && **b != -1) {
            return Err(PassportError::config(format!(
                "signature bits must be -1 or +1, found {bad}"
            )));
        }
        Ok(Self { bits })
    }

    /// Ground truth spelling an ownership message: the UTF-8 bytes are read
    /// most significant bit first (1 → +1, 0 → -1), repeated or truncated to
    /// `channels` bits.
    pub fn from_message(message: &str, channels: usize) -> PassportResult<Self> {
        if message.is_empty() {
            return Err(PassportError::config("ownership message must not be empty"));
        }
        let bits = message
            .bytes()
            .flat_map(|byte| (0..8).rev().map(move |shift| (byte >> shift) & 1))
            .map(|bit| if bit == 1 { 1 } else { -1 })
            .cycle()
            .take(channels)
            .collect();
        Ok(Self { bits })
    }

    /// Reads a signature stored as a `(1, C)` tensor of ±1 values.
    pub fn from_tensor(tensor: &Tensor) -> PassportResult<Self> {
        Self::from_bits(tensor.data().iter().map(|v| sign_bit(*v)).collect())
    }

    pub fn to_tensor(&self) -> PureResult<Tensor> {
        let values: Vec<f32> = self.bits.iter().map(|b| *b as f32).collect();
        Tensor::row_vector(&values)
    }

    pub fn bits(&self) -> &[i8] {
        &self.bits
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    fn guard(&self, scale: &[f32]) -> PureResult<()> {
        if scale.len() != self.bits.len() {
            return Err(TensorError::ShapeMismatch {
                left: (1, scale.len()),
                right: (1, self.bits.len()),
            });
        }
        Ok(())
    }

    /// Number of channels whose sign agrees with the ground truth.
    pub fn matches(&self, scale: &[f32]) -> PureResult<usize> {
        self.guard(scale)?;
        Ok(scale
            .iter()
            .zip(&self.bits)
            .filter(|(v, b)| sign_bit(**v) == **b)
            .count())
    }

    /// Fraction of channels whose sign agrees with the ground truth, in `[0, 1]`.
    pub fn verify(&self, scale: &[f32]) -> PureResult<f32> {
        if self.bits.is_empty() {
            self.guard(scale)?;
            return Ok(1.0);
        }
        Ok(self.matches(scale)? as f32 / self.bits.len() as f32)
    }

    /// Hinge loss `alpha * Σ relu(margin - scale·b)` and its gradient with
    /// respect to `scale`.
    pub fn sign_loss(&self, scale: &[f32], alpha: f32) -> PureResult<(f32, Vec<f32>)> {
        self.guard(scale)?;
        let mut loss = 0.0;
        let grad = scale
            .iter()
            .zip(&self.bits)
            .map(|(v, b)| {
                let b = *b as f32;
                let slack = SIGN_LOSS_MARGIN - v * b;
                if slack > 0.0 {
                    loss += alpha * slack;
                    -alpha * b
                } else {
                    0.0
                }
            })
            .collect();
        Ok((loss, grad))
    }
}

/// Sign-detection accuracy across passport layers: the mean of the
/// per-layer [`SignatureCodec::verify`] scores. `None` without layers.
pub fn detect_accuracy<'a, I>(layers: I) -> PureResult<Option<f32>>
where
    I: IntoIterator<Item = (&'a SignatureCodec, &'a [f32])>,
{
    let mut total = 0.0;
    let mut count = 0usize;
    for (codec, scale) in layers {
        total += codec.verify(scale)?;
        count += 1;
    }
    Ok((count > 0).then(|| total / count as f32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_treated_as_positive() {
        let codec = SignatureCodec::embed(&[0.0, -0.0, -1.0, 2.0]);
        assert_eq!(codec.bits(), &[1, 1, -1, 1]);
        assert_eq!(codec.verify(&[1e-9, 0.0, -3.0, 0.0]).unwrap(), 1.0);
    }

    #[test]
    fn verify_is_a_pure_read() {
        let codec = SignatureCodec::embed(&[1.0, -1.0, 1.0, -1.0]);
        let live = [0.5, 0.5, -0.5, -0.5];
        let first = codec.verify(&live).unwrap();
        let second = codec.verify(&live).unwrap();
        assert_eq!(first, 0.5);
        assert_eq!(first.to_bits(), second.to_bits());
    }

    #[test]
    fn message_bits_repeat_to_channel_count() {
        // 'A' = 0b0100_0001
        let codec = SignatureCodec::from_message("A", 10).unwrap();
        assert_eq!(codec.bits(), &[-1, 1, -1, -1, -1, -1, -1, 1, -1, 1]);
        assert!(SignatureCodec::from_message("", 4).is_err());
    }

    #[test]
    fn sign_loss_only_penalises_inside_margin() {
        let codec = SignatureCodec::from_bits(vec![1, -1, 1]).unwrap();
        let (loss, grad) = codec.sign_loss(&[1.0, 0.05, -0.2], 2.0).unwrap();
        // second: 0.1 + 0.05 = 0.15, third: 0.1 + 0.2 = 0.3
        assert!((loss - 2.0 * 0.45).abs() < 1e-6);
        assert_eq!(grad, vec![0.0, 2.0, -2.0]);
    }

    #[test]
    fn length_mismatch_is_reported() {
        let codec = SignatureCodec::embed(&[1.0, 1.0]);
        assert!(matches!(
            codec.verify(&[1.0]),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn detect_accuracy_averages_layers() {
        let a = SignatureCodec::embed(&[1.0, 1.0]);
        let b = SignatureCodec::embed(&[1.0, 1.0, 1.0, 1.0]);
        let sa = [1.0, -1.0];
        let sb = [1.0, 1.0, 1.0, 1.0];
        let acc = detect_accuracy([(&a, &sa[..]), (&b, &sb[..])]).unwrap();
        assert_eq!(acc, Some(0.75));
        assert_eq!(detect_accuracy(std::iter::empty::<(&SignatureCodec, &[f32])>()).unwrap(), None);
    }
}
