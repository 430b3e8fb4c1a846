// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::{PassportError, PassportResult};

/// Global index space over the output channels of an ordered list of layers.
///
/// Layer `l` owns the contiguous range `[start(l), start(l) + sizes[l])`, so
/// the space is a disjoint cover of `[0, total)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexPartition {
    sizes: Vec<usize>,
    ends: Vec<usize>,
}

impl IndexPartition {
    /// Flattens the per-layer channel counts, in the given order.
    pub fn new<I>(sizes: I) -> Self
    where
        I: IntoIterator<Item = usize>,
    {
        let sizes: Vec<usize> = sizes.into_iter().collect();
        let ends = sizes
            .iter()
            .scan(0usize, |acc, size| {
                *acc += size;
                Some(*acc)
            })
            .collect();
        Self { sizes, ends }
    }

    /// Size of the global index space.
    pub fn total(&self) -> usize {
        self.ends.last().copied().unwrap_or(0)
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    fn start(&self, layer: usize) -> usize {
        self.ends[layer] - self.sizes[layer]
    }

    /// Global range owned by `layer`.
    pub fn layer_range(&self, layer: usize) -> PassportResult<std::ops::Range<usize>> {
        if layer >= self.sizes.len() {
            return Err(PassportError::partition(format!(
                "layer {layer} outside a partition of {} layers",
                self.sizes.len()
            )));
        }
        Ok(self.start(layer)..self.ends[layer])
    }

    pub fn to_global(&self, layer: usize, local: usize) -> PassportResult<usize> {
        let range = self.layer_range(layer)?;
        if local >= self.sizes[layer] {
            return Err(PassportError::partition(format!(
                "channel {local} outside layer {layer} of {} channels",
                self.sizes[layer]
            )));
        }
        Ok(range.start + local)
    }

    /// Inverse of [`IndexPartition::to_global`], by binary search over the
    /// prefix sums. Empty layers own no index and are skipped.
    pub fn from_global(&self, global: usize) -> PassportResult<(usize, usize)> {
        let layer = self.ends.partition_point(|end| *end <= global);
        if layer >= self.sizes.len() {
            return Err(PassportError::partition(format!(
                "global index {global} outside [0, {})",
                self.total()
            )));
        }
        Ok((layer, global - self.start(layer)))
    }

    /// Splits a global selection into local channel indices per layer.
    ///
    /// Layers are walked in order with a running offset; each consumes the
    /// indices with `index - offset < size`. Indices left over once every
    /// layer has been visited, or selected twice, mean the selection was not
    /// drawn from this space and fail the whole split.
    pub fn split(&self, selection: &[usize]) -> PassportResult<Vec<Vec<usize>>> {
        let mut sorted = selection.to_vec();
        sorted.sort_unstable();
        if let Some(pair) = sorted.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(PassportError::partition(format!(
                "global index {} selected twice",
                pair[0]
            )));
        }

        let mut pool = selection.to_vec();
        let mut offset = 0usize;
        let mut per_layer = Vec::with_capacity(self.sizes.len());
        for size in &self.sizes {
            let (mine, rest): (Vec<usize>, Vec<usize>) =
                pool.into_iter().partition(|idx| idx - offset < *size);
            per_layer.push(mine.into_iter().map(|idx| idx - offset).collect());
            pool = rest;
            offset += size;
        }
        if !pool.is_empty() {
            return Err(PassportError::partition(format!(
                "{} selected indices fall outside the {} partitioned channels (first: {})",
                pool.len(),
                self.total(),
                pool[0]
            )));
        }
        Ok(per_layer)
    }
}
