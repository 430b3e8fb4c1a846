// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use approx::assert_abs_diff_eq;
use proptest::prelude::*;
use sp_passport::{apply, select, AffineSlot, IndexPartition, SignatureCodec};
use std::collections::BTreeSet;

fn layers_from(sizes: &[usize]) -> (Vec<Vec<f32>>, Vec<Vec<f32>>) {
    let scales = sizes
        .iter()
        .map(|&size| (0..size).map(|c| if c % 3 == 0 { -0.5 - c as f32 } else { 0.25 + c as f32 }).collect())
        .collect();
    let biases = sizes.iter().map(|&size| vec![1.0; size]).collect();
    (scales, biases)
}

fn slots<'a>(scales: &'a mut [Vec<f32>], biases: &'a mut [Vec<f32>]) -> Vec<AffineSlot<'a>> {
    scales
        .iter_mut()
        .zip(biases.iter_mut())
        .map(|(scale, bias)| AffineSlot {
            scale: scale.as_mut_slice(),
            bias: bias.as_mut_slice(),
        })
        .collect()
}

proptest! {
    #[test]
    fn partition_round_trips_every_local_index(sizes in prop::collection::vec(0usize..24, 1..8)) {
        let partition = IndexPartition::new(sizes.iter().copied());
        let mut seen = BTreeSet::new();
        for (layer, &size) in sizes.iter().enumerate() {
            for local in 0..size {
                let global = partition.to_global(layer, local).unwrap();
                prop_assert_eq!(partition.from_global(global).unwrap(), (layer, local));
                prop_assert!(seen.insert(global));
            }
        }
        let total: usize = sizes.iter().sum();
        prop_assert_eq!(seen.len(), total);
        prop_assert_eq!(seen.into_iter().collect::<Vec<_>>(), (0..total).collect::<Vec<_>>());
        prop_assert!(partition.from_global(total).is_err());
    }

    #[test]
    fn attack_consumes_exactly_the_selection(
        sizes in prop::collection::vec(1usize..40, 1..6),
        fraction in 0.0f64..=1.0,
        seed in any::<u64>(),
    ) {
        let total: usize = sizes.iter().sum();
        let selection = select(total, fraction, Some(seed)).unwrap();
        prop_assert_eq!(selection.len(), (total as f64 * fraction).floor() as usize);

        let (mut scales, mut biases) = layers_from(&sizes);
        let mut layers = slots(&mut scales, &mut biases);
        let report = apply(&mut layers, &selection).unwrap();
        let consumed: usize = report.flipped_per_layer.iter().map(Vec::len).sum();
        prop_assert_eq!(consumed, selection.len());
        for (flipped, &size) in report.flipped_per_layer.iter().zip(&sizes) {
            prop_assert!(flipped.iter().all(|&local| local < size));
        }
    }
}

#[test]
fn verify_is_a_pure_read() {
    let truth = SignatureCodec::from_bits(vec![1, -1, 1, 1, -1, -1]).unwrap();
    let scale = [0.3, -0.7, -0.1, 2.0, -4.0, 0.5];
    let first = truth.verify(&scale).unwrap();
    let second = truth.verify(&scale).unwrap();
    assert_eq!(first, second);
    assert_abs_diff_eq!(first, 4.0 / 6.0, epsilon = 1e-6);
}

#[test]
fn flipping_everything_twice_restores_the_signature() {
    let sizes = [5, 9, 2];
    let (mut scales, mut biases) = layers_from(&sizes);
    let before: Vec<SignatureCodec> = scales.iter().map(|s| SignatureCodec::embed(s)).collect();
    let total: usize = sizes.iter().sum();
    let everything = select(total, 1.0, Some(11)).unwrap();

    let first = apply(&mut slots(&mut scales, &mut biases), &everything).unwrap();
    assert!(first.similarity_per_layer.iter().all(|s| *s == 0.0));
    let second = apply(&mut slots(&mut scales, &mut biases), &everything).unwrap();
    assert!(second.similarity_per_layer.iter().all(|s| *s == 0.0));

    let after: Vec<SignatureCodec> = scales.iter().map(|s| SignatureCodec::embed(s)).collect();
    assert_eq!(before, after);
    assert!(biases.iter().flatten().all(|b| *b == 0.0));
}

#[test]
fn mean_similarity_tracks_one_minus_fraction() {
    let sizes = [64, 128, 32];
    let total: usize = sizes.iter().sum();
    for fraction in [0.1, 0.25, 0.5, 0.75, 0.9] {
        let trials = 40;
        let mut sum = 0.0f32;
        for seed in 0..trials {
            let (mut scales, mut biases) = layers_from(&sizes);
            let selection = select(total, fraction, Some(seed)).unwrap();
            let report = apply(&mut slots(&mut scales, &mut biases), &selection).unwrap();
            sum += report.mean_similarity;
        }
        let mean = sum / trials as f32;
        assert_abs_diff_eq!(mean, 1.0 - fraction as f32, epsilon = 0.05);
    }
}

#[test]
fn half_flip_of_an_all_positive_layer_halves_similarity() {
    let mut scale = vec![1.0f32; 64];
    let mut bias = vec![0.5f32; 64];
    let truth = SignatureCodec::embed(&scale);
    assert!(truth.bits().iter().all(|b| *b == 1));

    let selection = select(64, 0.5, Some(0)).unwrap();
    assert_eq!(selection.len(), 32);
    let report = apply(
        &mut [AffineSlot {
            scale: &mut scale,
            bias: &mut bias,
        }],
        &selection,
    )
    .unwrap();
    assert_eq!(report.selected, 32);
    assert_abs_diff_eq!(report.mean_similarity, 0.5);
    assert_abs_diff_eq!(truth.verify(&scale).unwrap(), 0.5);
}
