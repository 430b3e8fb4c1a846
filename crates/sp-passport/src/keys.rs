// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Secret passport keys: sampling from a reference dataset and binding to
//! every passport block of a model.
//!
//! Keys are sampled once per model instance and kept by [`KeyStore`]. Blocks
//! past the first see feature maps rather than images, so binding traces the
//! key samples through a plain reference model and hands each block the
//! activation that reaches it.

use crate::error::{PassportError, PassportResult};
use crate::models::PassportNet;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sp_config::determinism::rng_from_optional;
use sp_nn::{Dataset, Tensor};
use tracing::{debug, info};

/// Number of key samples outside `image` mode.
pub const DEFAULT_KEY_SAMPLES: usize = 20;

/// Samples per layer key generated in `random` mode.
pub const RANDOM_KEY_SAMPLES: usize = 2;

/// How key samples are selected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyMode {
    /// Keys are drawn from a normal distribution per layer; no dataset or
    /// reference model is involved.
    Random,
    /// A single image taken in dataset order.
    Image,
    /// Samples drawn through a seeded permutation of the dataset.
    #[default]
    Shuffle,
}

impl KeyMode {
    pub fn sample_count(self) -> usize {
        match self {
            KeyMode::Image => 1,
            KeyMode::Random | KeyMode::Shuffle => DEFAULT_KEY_SAMPLES,
        }
    }
}

/// Stacked key samples together with the dataset indices they came from.
#[derive(Clone, Debug, PartialEq)]
pub struct Key {
    samples: Tensor,
    indices: Vec<usize>,
}

impl Key {
    fn gather(dataset: &Dataset, indices: Vec<usize>) -> PassportResult<Self> {
        let (samples, _) = dataset.gather(&indices)?;
        Ok(Self { samples, indices })
    }

    pub fn samples(&self) -> &Tensor {
        &self.samples
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

fn guard_count(dataset: &Dataset, n: usize) -> PassportResult<()> {
    if n == 0 {
        return Err(PassportError::key("a key needs at least one sample"));
    }
    if n > dataset.len() {
        return Err(PassportError::key(format!(
            "requested {n} key samples from a dataset of {}",
            dataset.len()
        )));
    }
    Ok(())
}

/// Draws `n` samples from `dataset`: the first `n` in `image` mode, a seeded
/// permutation otherwise.
pub fn get_key(
    dataset: &Dataset,
    n: usize,
    mode: KeyMode,
    seed: Option<u64>,
) -> PassportResult<Key> {
    guard_count(dataset, n)?;
    let indices = match mode {
        KeyMode::Image => (0..n).collect(),
        KeyMode::Random | KeyMode::Shuffle => {
            let (mut rng, _) = rng_from_optional(seed, SAMPLE_LABEL);
            shuffled_prefix(&mut rng, dataset.len(), n)
        }
    };
    Key::gather(dataset, indices)
}

const SAMPLE_LABEL: &str = "sp-passport/keys/sample";

fn shuffled_prefix<R: Rng + ?Sized>(rng: &mut R, len: usize, n: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(rng);
    order.truncate(n);
    order
}

/// Key pair of one model instance. Sampled once and reused for every bind.
#[derive(Clone, Debug)]
pub struct KeyStore {
    mode: KeyMode,
    seed: Option<u64>,
    pair: Option<(Key, Key)>,
}

impl KeyStore {
    /// Samples `key_x` and `key_y` from `dataset`. In `random` mode nothing is
    /// sampled; per-layer keys are generated at bind time instead.
    ///
    /// In `image` mode `key_y` is the image following `key_x` when the
    /// dataset has one, so scale and bias do not collapse onto the same patch.
    pub fn sample(dataset: &Dataset, mode: KeyMode, seed: Option<u64>) -> PassportResult<Self> {
        let pair = match mode {
            KeyMode::Random => None,
            KeyMode::Image => {
                let n = mode.sample_count();
                let key_x = get_key(dataset, n, mode, seed)?;
                let key_y = if dataset.len() >= 2 * n {
                    Key::gather(dataset, (n..2 * n).collect())?
                } else {
                    key_x.clone()
                };
                Some((key_x, key_y))
            }
            KeyMode::Shuffle => {
                let n = mode.sample_count();
                guard_count(dataset, n)?;
                // One stream for both keys; `key_x` matches `get_key` with the same seed.
                let (mut rng, _) = rng_from_optional(seed, SAMPLE_LABEL);
                let key_x = Key::gather(dataset, shuffled_prefix(&mut rng, dataset.len(), n))?;
                let key_y = Key::gather(dataset, shuffled_prefix(&mut rng, dataset.len(), n))?;
                Some((key_x, key_y))
            }
        };
        if let Some((key_x, _)) = &pair {
            info!(mode = ?mode, samples = key_x.len(), "passport keys sampled");
        }
        Ok(Self { mode, seed, pair })
    }

    pub fn mode(&self) -> KeyMode {
        self.mode
    }

    pub fn key_x(&self) -> Option<&Key> {
        self.pair.as_ref().map(|(x, _)| x)
    }

    pub fn key_y(&self) -> Option<&Key> {
        self.pair.as_ref().map(|(_, y)| y)
    }

    /// Binds the stored keys to every passport block of `target`. Sampled
    /// keys are traced through `reference`; `random` mode ignores it.
    pub fn bind(&self, reference: Option<&PassportNet>, target: &mut PassportNet) -> PassportResult<()> {
        match &self.pair {
            None => bind_random_keys(target, self.seed),
            Some((key_x, key_y)) => {
                let reference = reference.ok_or_else(|| {
                    PassportError::key("sampled keys need a reference model to trace through")
                })?;
                set_key(reference, target, key_x.samples(), key_y.samples())
            }
        }
    }
}

/// Runs `key_x` and `key_y` through `reference` and assigns the activation
/// entering each block to the block of the same name in `target`.
///
/// `reference` is only read. Tracing the same reference with the same keys
/// again yields the same per-layer keys, and blocks whose signature is
/// already fixed keep it.
pub fn set_key(
    reference: &PassportNet,
    target: &mut PassportNet,
    key_x: &Tensor,
    key_y: &Tensor,
) -> PassportResult<()> {
    let traced_x = reference.block_inputs(key_x)?;
    let traced_y = reference.block_inputs(key_y)?;
    let mut bound = 0usize;
    for block in target.blocks_mut() {
        if block.state().is_none() {
            continue;
        }
        let name = block.name().to_string();
        let (Some(x), Some(y)) = (traced_x.get(&name), traced_y.get(&name)) else {
            return Err(PassportError::key(format!(
                "reference model has no block `{name}` to trace the key through"
            )));
        };
        block.set_key(x, Some(y))?;
        bound += 1;
    }
    info!(blocks = bound, "passport keys bound from reference model");
    Ok(())
}

/// Gives every passport block its own normally distributed key pair.
pub fn bind_random_keys(target: &mut PassportNet, seed: Option<u64>) -> PassportResult<()> {
    let (mut rng, source) = rng_from_optional(seed, "sp-passport/keys/random");
    let mut bound = 0usize;
    for block in target.blocks_mut() {
        if block.state().is_none() {
            continue;
        }
        let features = block.input_features();
        let key_x = Tensor::random_normal(RANDOM_KEY_SAMPLES, features, 0.0, 1.0, Some(rng.gen()))?;
        let key_y = Tensor::random_normal(RANDOM_KEY_SAMPLES, features, 0.0, 1.0, Some(rng.gen()))?;
        block.set_key(&key_x, Some(&key_y))?;
        bound += 1;
    }
    debug!(blocks = bound, reproducible = source.is_reproducible(), "random passport keys bound");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sp_nn::one_hot;

    fn dataset(len: usize) -> Dataset {
        let mut data = Dataset::new();
        for i in 0..len {
            data.push(
                Tensor::full(1, 4, i as f32).unwrap(),
                one_hot(i % 2, 2).unwrap(),
            );
        }
        data
    }

    #[test]
    fn oversized_key_is_rejected() {
        let err = get_key(&dataset(3), 4, KeyMode::Shuffle, Some(1)).unwrap_err();
        assert!(matches!(err, PassportError::KeyBinding(_)));
    }

    #[test]
    fn image_mode_takes_dataset_order() {
        let key = get_key(&dataset(5), 2, KeyMode::Image, None).unwrap();
        assert_eq!(key.indices(), &[0, 1]);
        assert_eq!(key.samples().data()[4], 1.0);
    }

    #[test]
    fn shuffled_key_replays_with_seed() {
        let data = dataset(30);
        let a = get_key(&data, 20, KeyMode::Shuffle, Some(11)).unwrap();
        let b = get_key(&data, 20, KeyMode::Shuffle, Some(11)).unwrap();
        assert_eq!(a, b);
        let mut sorted = a.indices().to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 20);
    }

    #[test]
    fn store_keeps_independent_pair() {
        let store = KeyStore::sample(&dataset(40), KeyMode::Shuffle, Some(3)).unwrap();
        let x = store.key_x().unwrap();
        let y = store.key_y().unwrap();
        assert_eq!(x.len(), DEFAULT_KEY_SAMPLES);
        assert_ne!(x.indices(), y.indices());

        let image = KeyStore::sample(&dataset(4), KeyMode::Image, None).unwrap();
        assert_eq!(image.key_x().unwrap().indices(), &[0]);
        assert_eq!(image.key_y().unwrap().indices(), &[1]);

        let random = KeyStore::sample(&dataset(4), KeyMode::Random, Some(1)).unwrap();
        assert!(random.key_x().is_none());
    }

    #[test]
    fn shuffle_store_needs_a_full_key() {
        let err = KeyStore::sample(&dataset(5), KeyMode::Shuffle, Some(1)).unwrap_err();
        assert!(matches!(err, PassportError::KeyBinding(_)));
        let exact = KeyStore::sample(&dataset(DEFAULT_KEY_SAMPLES), KeyMode::Shuffle, Some(1)).unwrap();
        assert_eq!(exact.key_x().unwrap().len(), DEFAULT_KEY_SAMPLES);
        assert_eq!(exact.key_y().unwrap().len(), DEFAULT_KEY_SAMPLES);
    }
}
