// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;
use rand::{seq::SliceRandom, SeedableRng};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

/// `(input, target)` pair. Inputs are `(1, C * H * W)` rows, targets one-hot `(1, classes)` rows.
pub type Sample = (Tensor, Tensor);

/// Lightweight in-memory dataset that keeps input/target tensors paired together.
#[derive(Clone, Debug, Default)]
pub struct Dataset {
    samples: Vec<Sample>,
}

impl Dataset {
    /// Creates an empty dataset.
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
        }
    }

    /// Builds a dataset from an owning vector.
    pub fn from_vec(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Appends a new sample to the dataset.
    pub fn push(&mut self, input: Tensor, target: Tensor) {
        self.samples.push((input, target));
    }

    /// Returns the number of samples stored in the dataset.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` when no samples are registered.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Sample> {
        self.samples.get(index)
    }

    /// Iterates over borrowed samples in storage order.
    pub fn iter(&self) -> impl Iterator<Item = &Sample> + '_ {
        self.samples.iter()
    }

    /// Stacks the samples at `indices` into a batch.
    pub fn gather(&self, indices: &[usize]) -> PureResult<(Tensor, Tensor)> {
        let mut batch = Vec::with_capacity(indices.len());
        for &idx in indices {
            let sample = self.samples.get(idx).ok_or(TensorError::InvalidValue {
                label: "dataset_index_out_of_range",
            })?;
            batch.push(sample.clone());
        }
        stack_batch(&batch)
    }

    /// Concatenates two datasets, keeping `self` first.
    pub fn concat(&self, other: &Dataset) -> Dataset {
        let mut samples = self.samples.clone();
        samples.extend(other.samples.iter().cloned());
        Dataset { samples }
    }

    /// Creates a loader that borrows a snapshot of the dataset.
    pub fn loader(&self) -> DataLoader {
        DataLoader::new(Arc::from(self.samples.clone().into_boxed_slice()))
    }

    /// Converts the dataset into a streaming loader without cloning samples.
    pub fn into_loader(self) -> DataLoader {
        DataLoader::new(Arc::from(self.samples.into_boxed_slice()))
    }
}

fn default_order(len: usize) -> Arc<Vec<usize>> {
    Arc::new((0..len).collect())
}

fn stack_batch(batch: &[Sample]) -> PureResult<(Tensor, Tensor)> {
    if batch.is_empty() {
        return Err(TensorError::EmptyInput("batch"));
    }
    let (inputs, targets): (Vec<_>, Vec<_>) = batch.iter().cloned().unzip();
    let input = Tensor::cat_rows(&inputs)?;
    let target = Tensor::cat_rows(&targets)?;
    Ok((input, target))
}

fn collect_batch(samples: &[Sample], indices: &[usize]) -> PureResult<(Tensor, Tensor)> {
    let batch: Vec<Sample> = indices.iter().map(|&idx| samples[idx].clone()).collect();
    stack_batch(&batch)
}

struct ImmediateBatches {
    samples: Arc<[Sample]>,
    order: Arc<Vec<usize>>,
    batch_size: usize,
    position: usize,
}

impl Iterator for ImmediateBatches {
    type Item = PureResult<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let start = self.position;
        let end = (self.position + self.batch_size).min(self.order.len());
        self.position = end;
        Some(collect_batch(&self.samples, &self.order[start..end]))
    }
}

struct PrefetchBatches {
    rx: Receiver<PureResult<(Tensor, Tensor)>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PrefetchBatches {
    fn spawn(
        samples: Arc<[Sample]>,
        order: Arc<Vec<usize>>,
        batch_size: usize,
        depth: usize,
    ) -> Self {
        let (tx, rx) = mpsc::sync_channel(depth.max(1));
        let handle = thread::spawn(move || {
            for indices in order.chunks(batch_size.max(1)) {
                if tx.send(collect_batch(&samples, indices)).is_err() {
                    return;
                }
            }
        });
        Self {
            rx,
            handle: Some(handle),
        }
    }
}

impl Iterator for PrefetchBatches {
    type Item = PureResult<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

impl Drop for PrefetchBatches {
    fn drop(&mut self) {
        // Unblock the producer before joining it.
        let (_, dead) = mpsc::sync_channel(0);
        drop(std::mem::replace(&mut self.rx, dead));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

enum DataLoaderBackend {
    Immediate(ImmediateBatches),
    Prefetch(PrefetchBatches),
}

/// Iterator over mini-batches produced by a [`DataLoader`].
pub struct DataLoaderBatches {
    backend: DataLoaderBackend,
}

impl Iterator for DataLoaderBatches {
    type Item = PureResult<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.backend {
            DataLoaderBackend::Immediate(iter) => iter.next(),
            DataLoaderBackend::Prefetch(iter) => iter.next(),
        }
    }
}

/// Builder-style loader that supports deterministic shuffling, fixed batch
/// sizes, and background prefetch for feeding training loops.
#[derive(Clone)]
pub struct DataLoader {
    samples: Arc<[Sample]>,
    order: Arc<Vec<usize>>,
    batch_size: usize,
    prefetch: usize,
}

impl DataLoader {
    fn new(samples: Arc<[Sample]>) -> Self {
        let len = samples.len();
        Self {
            samples,
            order: default_order(len),
            batch_size: 1,
            prefetch: 0,
        }
    }

    /// Returns the number of individual samples referenced by the loader.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches one pass yields.
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    /// Returns a loader over the same samples visited in a seeded random order.
    pub fn shuffle(mut self, seed: u64) -> Self {
        let mut indices: Vec<usize> = (0..self.samples.len()).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);
        self.order = Arc::new(indices);
        self
    }

    /// Updates the loader to emit batches of `batch_size` samples.
    pub fn batched(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Enables background prefetching with the given channel depth.
    pub fn prefetch(mut self, depth: usize) -> Self {
        self.prefetch = depth;
        self
    }

    /// Creates a new iterator over the configured batches.
    pub fn iter(&self) -> DataLoaderBatches {
        self.clone().into_iter()
    }
}

impl IntoIterator for DataLoader {
    type Item = PureResult<(Tensor, Tensor)>;
    type IntoIter = DataLoaderBatches;

    fn into_iter(self) -> Self::IntoIter {
        let backend = if self.prefetch == 0 {
            DataLoaderBackend::Immediate(ImmediateBatches {
                samples: self.samples,
                order: self.order,
                batch_size: self.batch_size,
                position: 0,
            })
        } else {
            DataLoaderBackend::Prefetch(PrefetchBatches::spawn(
                self.samples,
                self.order,
                self.batch_size,
                self.prefetch,
            ))
        };
        DataLoaderBatches { backend }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy(len: usize) -> Dataset {
        Dataset::from_vec(
            (0..len)
                .map(|i| {
                    (
                        Tensor::from_vec(1, 1, vec![i as f32]).unwrap(),
                        Tensor::from_vec(1, 1, vec![0.0]).unwrap(),
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn batches_cover_every_sample_once() {
        let loader = toy(7).loader().shuffle(3).batched(3);
        assert_eq!(loader.num_batches(), 3);
        let mut seen: Vec<f32> = loader
            .iter()
            .flat_map(|batch| batch.unwrap().0.into_vec())
            .collect();
        seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(seen, (0..7).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn prefetch_matches_immediate_order() {
        let loader = toy(5).loader().shuffle(11).batched(2);
        let immediate: Vec<_> = loader.iter().map(|b| b.unwrap().0).collect();
        let prefetched: Vec<_> = loader.prefetch(2).iter().map(|b| b.unwrap().0).collect();
        assert_eq!(immediate, prefetched);
    }

    #[test]
    fn gather_rejects_out_of_range() {
        assert!(toy(2).gather(&[0, 5]).is_err());
    }
}
