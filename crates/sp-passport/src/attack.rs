// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Sign-flip attack over the global signature index space.

use crate::codec::SignatureCodec;
use crate::config::validate_fraction;
use crate::error::{PassportError, PassportResult};
use crate::partition::IndexPartition;
use rand::seq::SliceRandom;
use sp_config::determinism::rng_from_optional;
use tracing::{debug, info};

/// Draws `floor(total * fraction)` distinct global indices, as the prefix of
/// a seeded random permutation of `[0, total)`.
pub fn select(total: usize, fraction: f64, seed: Option<u64>) -> PassportResult<Vec<usize>> {
    validate_fraction(fraction)?;
    let count = (total as f64 * fraction).floor() as usize;
    let (mut rng, source) = rng_from_optional(seed, "sp-passport/attack/select");
    let mut permutation: Vec<usize> = (0..total).collect();
    permutation.shuffle(&mut rng);
    permutation.truncate(count);
    debug!(total, count, seed = ?source, "attack indices selected");
    Ok(permutation)
}

/// Mutable view of the affine pair of one attacked layer.
#[derive(Debug)]
pub struct AffineSlot<'a> {
    pub scale: &'a mut [f32],
    pub bias: &'a mut [f32],
}

/// Outcome of one [`apply`] call.
#[derive(Clone, Debug, PartialEq)]
pub struct AttackReport {
    /// Number of flipped bits across all layers.
    pub selected: usize,
    /// Local channels flipped in each layer.
    pub flipped_per_layer: Vec<Vec<usize>>,
    /// Sign pattern of every layer before the flip.
    pub original_signatures: Vec<SignatureCodec>,
    /// Fraction of unchanged sign bits per layer.
    pub similarity_per_layer: Vec<f32>,
    /// Mean of `similarity_per_layer`.
    pub mean_similarity: f32,
}

/// Flips the sign of `scale` at the selected global indices, keeping each
/// magnitude, and zeroes the whole bias of every layer in `layers`.
///
/// The bias is cleared for every attacked layer, whichever channels were
/// selected. A selection that does not split cleanly over the layers is a
/// [`PassportError::PartitionInvariantViolation`] and nothing is modified.
pub fn apply(layers: &mut [AffineSlot<'_>], selection: &[usize]) -> PassportResult<AttackReport> {
    if layers.is_empty() {
        return Err(PassportError::config("no layers to attack"));
    }
    for (idx, slot) in layers.iter().enumerate() {
        if slot.scale.len() != slot.bias.len() {
            return Err(PassportError::config(format!(
                "layer {idx} has {} scale and {} bias entries",
                slot.scale.len(),
                slot.bias.len()
            )));
        }
    }
    let partition = IndexPartition::new(layers.iter().map(|slot| slot.scale.len()));
    let flipped_per_layer = partition.split(selection)?;

    let mut original_signatures = Vec::with_capacity(layers.len());
    let mut similarity_per_layer = Vec::with_capacity(layers.len());
    for (slot, flipped) in layers.iter_mut().zip(&flipped_per_layer) {
        let original = SignatureCodec::embed(slot.scale);
        slot.bias.fill(0.0);
        for &channel in flipped {
            slot.scale[channel] = -slot.scale[channel];
        }
        similarity_per_layer.push(original.verify(slot.scale)?);
        original_signatures.push(original);
    }
    let mean_similarity =
        similarity_per_layer.iter().sum::<f32>() / similarity_per_layer.len() as f32;
    info!(
        flipped = selection.len(),
        total = partition.total(),
        similarity = mean_similarity,
        "signature bits flipped"
    );
    Ok(AttackReport {
        selected: selection.len(),
        flipped_per_layer,
        original_signatures,
        similarity_per_layer,
        mean_similarity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_size_is_floored_and_distinct() {
        let picked = select(10, 0.35, Some(4)).unwrap();
        assert_eq!(picked.len(), 3);
        assert!(picked.iter().all(|idx| *idx < 10));
        assert_eq!(select(10, 0.35, Some(4)).unwrap(), picked);
        assert!(select(10, 0.0, Some(4)).unwrap().is_empty());
        assert_eq!(select(10, 1.0, Some(4)).unwrap().len(), 10);
    }

    #[test]
    fn fraction_outside_unit_interval_is_rejected() {
        assert!(matches!(
            select(10, 1.5, Some(0)),
            Err(PassportError::Configuration(_))
        ));
        assert!(select(10, -0.1, Some(0)).is_err());
    }

    #[test]
    fn flip_keeps_magnitude_and_zeroes_whole_bias() {
        let mut scale = vec![0.5, -2.0, 3.0];
        let mut bias = vec![1.0, 1.0, 1.0];
        let mut other_scale = vec![1.0, 1.0];
        let mut other_bias = vec![4.0, 4.0];
        let mut layers = [
            AffineSlot {
                scale: &mut scale,
                bias: &mut bias,
            },
            AffineSlot {
                scale: &mut other_scale,
                bias: &mut other_bias,
            },
        ];
        let report = apply(&mut layers, &[1, 4]).unwrap();
        assert_eq!(report.flipped_per_layer, vec![vec![1], vec![1]]);
        assert_eq!(scale, vec![0.5, 2.0, 3.0]);
        assert_eq!(other_scale, vec![1.0, -1.0]);
        assert_eq!(bias, vec![0.0; 3]);
        assert_eq!(other_bias, vec![0.0; 2]);
        assert!((report.similarity_per_layer[0] - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(report.similarity_per_layer[1], 0.5);
    }

    #[test]
    fn leftover_indices_abort_without_changes() {
        let mut scale = vec![1.0, 1.0];
        let mut bias = vec![1.0, 1.0];
        let mut layers = [AffineSlot {
            scale: &mut scale,
            bias: &mut bias,
        }];
        assert!(matches!(
            apply(&mut layers, &[0, 2]),
            Err(PassportError::PartitionInvariantViolation(_))
        ));
        assert_eq!(bias, vec![1.0, 1.0]);
    }
}
