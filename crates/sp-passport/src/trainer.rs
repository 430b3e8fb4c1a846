// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::{PassportError, PassportResult};
use crate::metrics::Metrics;
use crate::models::PassportNet;
use rand::Rng;
use sp_config::determinism::rng_from_optional;
use sp_nn::{correct_predictions, Dataset, Loss, Module, Sgd, SoftmaxCrossEntropy, Tensor};
use tracing::debug;

const PREFETCH_DEPTH: usize = 2;

/// Epoch-level driver: SGD over a dataset, optionally mixing trigger-set
/// batches into every step, and evaluation passes.
#[derive(Debug)]
pub struct Trainer {
    optimizer: Sgd,
    loss: SoftmaxCrossEntropy,
    batch_size: usize,
    seed: Option<u64>,
}

impl Trainer {
    pub fn new(
        lr: f32,
        momentum: f32,
        weight_decay: f32,
        batch_size: usize,
        seed: Option<u64>,
    ) -> PassportResult<Self> {
        if batch_size == 0 {
            return Err(PassportError::config("batch_size must be positive"));
        }
        Ok(Self {
            optimizer: Sgd::new(lr, momentum, weight_decay)?,
            loss: SoftmaxCrossEntropy::new(),
            batch_size,
            seed,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn optimizer_mut(&mut self) -> &mut Sgd {
        &mut self.optimizer
    }

    /// One pass over `data` in a shuffled order. Trigger batches, when
    /// given, are appended to every data batch and cycled.
    ///
    /// Reports `loss` and `acc` over the combined batches, and `sign_loss`
    /// and `sign_acc` when the model carries passports.
    pub fn train_epoch(
        &mut self,
        model: &mut PassportNet,
        data: &Dataset,
        trigger: Option<&Dataset>,
        epoch: usize,
    ) -> PassportResult<Metrics> {
        if data.is_empty() {
            return Err(PassportError::config("training dataset is empty"));
        }
        model.set_training(true);
        let (mut rng, _) = rng_from_optional(
            self.seed.map(|seed| seed.wrapping_add(epoch as u64)),
            "sp-passport/train/shuffle",
        );
        let loader = data
            .loader()
            .shuffle(rng.gen())
            .batched(self.batch_size)
            .prefetch(PREFETCH_DEPTH);
        let trigger_batches = match trigger {
            Some(trigger) if !trigger.is_empty() => trigger
                .loader()
                .shuffle(rng.gen())
                .batched(self.batch_size.min(trigger.len()))
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?,
            _ => Vec::new(),
        };
        let mut trigger_cycle = trigger_batches.iter().cycle();

        let mut loss_sum = 0.0f32;
        let mut correct = 0usize;
        let mut seen = 0usize;
        let mut sign_loss_sum = 0.0f32;
        let mut sign_acc_sum = 0.0f32;
        let mut steps = 0usize;
        let mut sign_steps = 0usize;
        for batch in loader {
            let (mut input, mut target) = batch?;
            if let Some((trigger_input, trigger_target)) = trigger_cycle.next() {
                input = Tensor::cat_rows(&[input, trigger_input.clone()])?;
                target = Tensor::cat_rows(&[target, trigger_target.clone()])?;
            }
            let rows = input.shape().0;
            let logits = model.forward(&input)?;
            let loss = self.loss.forward(&logits, &target)?.data()[0];
            let sign_loss = model.take_sign_loss();
            let grad = self.loss.backward(&logits, &target)?;
            model.backward(&input, &grad)?;
            self.optimizer.step(model)?;

            loss_sum += loss * rows as f32;
            correct += correct_predictions(&logits, &target)?;
            seen += rows;
            sign_loss_sum += sign_loss;
            steps += 1;
            if let Some(acc) = model.signature_accuracy()? {
                sign_acc_sum += acc;
                sign_steps += 1;
            }
        }

        let mut metrics = Metrics::new();
        metrics.insert("loss", loss_sum / seen.max(1) as f32);
        metrics.insert("acc", correct as f32 / seen.max(1) as f32);
        if sign_steps > 0 {
            metrics.insert("sign_loss", sign_loss_sum / steps as f32);
            metrics.insert("sign_acc", sign_acc_sum / sign_steps as f32);
        }
        debug!(epoch, steps, samples = seen, "training epoch finished");
        Ok(metrics)
    }

    /// Mean loss and accuracy of `model` on `data` in evaluation mode.
    pub fn test(&mut self, model: &PassportNet, data: &Dataset) -> PassportResult<Metrics> {
        model.set_training(false);
        let mut loss_sum = 0.0f32;
        let mut correct = 0usize;
        let mut seen = 0usize;
        for batch in data.loader().batched(self.batch_size) {
            let (input, target) = batch?;
            let rows = input.shape().0;
            let logits = model.forward(&input)?;
            loss_sum += self.loss.forward(&logits, &target)?.data()[0] * rows as f32;
            correct += correct_predictions(&logits, &target)?;
            seen += rows;
        }
        let mut metrics = Metrics::new();
        metrics.insert("loss", loss_sum / seen.max(1) as f32);
        metrics.insert("acc", correct as f32 / seen.max(1) as f32);
        Ok(metrics)
    }
}

/// Signature state of every passport block, read without a forward pass:
/// `sign_acc` over all blocks and `sim_<block>` per block.
pub fn test_signature(model: &PassportNet) -> PassportResult<Metrics> {
    let mut metrics = Metrics::new();
    for block in model.passport_blocks() {
        if let Some(similarity) = block.verify()? {
            metrics.insert(format!("sim_{}", block.name()), similarity);
        }
    }
    if let Some(acc) = model.signature_accuracy()? {
        metrics.insert("sign_acc", acc);
    }
    Ok(metrics)
}
