// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Training orchestration: key setup, passport training with watermark
//! checks, and transfer-learning runs that test signature survival.

use crate::config::ExperimentConfig;
use crate::error::{PassportError, PassportResult};
use crate::keys::{KeyMode, KeyStore};
use crate::metrics::{HistoryRecord, Metrics, RunContext};
use crate::models::PassportNet;
use crate::trainer::{test_signature, Trainer};
use crate::transfer::{clone_plain, sync_back};
use sp_nn::Dataset;
use std::fmt;
use tracing::{info, warn};

/// How the plain twin is fine-tuned in [`Experiment::transfer_learning`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferMode {
    /// Re-initialise the classifier head, then train every layer.
    Rtal,
    /// Train every layer from the copied weights.
    Ftal,
}

impl TransferMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferMode::Rtal => "rtal",
            TransferMode::Ftal => "ftal",
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One passport training run.
#[derive(Debug)]
pub struct Experiment {
    config: ExperimentConfig,
    model: PassportNet,
    keys: Option<KeyStore>,
    trainer: Trainer,
    train: Dataset,
    valid: Dataset,
    trigger: Option<Dataset>,
    context: RunContext,
}

impl Experiment {
    pub fn new(
        config: ExperimentConfig,
        train: Dataset,
        valid: Dataset,
        trigger: Option<Dataset>,
    ) -> PassportResult<Self> {
        config.validate()?;
        if (config.train_backdoor || config.use_trigger_as_passport) && trigger.is_none() {
            return Err(PassportError::config(
                "train_backdoor and use_trigger_as_passport need a trigger set",
            ));
        }
        let model = PassportNet::build(
            config.arch,
            config.geometry,
            &config.passport_config,
            config.scheme,
            config.sign_loss_alpha,
        )?;
        let trainer = Trainer::new(
            config.lr,
            config.momentum,
            config.weight_decay,
            config.batch_size,
            config.seed,
        )?;
        let context = RunContext::new(config.logdir.clone())?;
        Ok(Self {
            config,
            model,
            keys: None,
            trainer,
            train,
            valid,
            trigger,
            context,
        })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn model(&self) -> &PassportNet {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut PassportNet {
        &mut self.model
    }

    pub fn keys(&self) -> Option<&KeyStore> {
        self.keys.as_ref()
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    /// Samples the key pair on first use and binds it to every passport
    /// block. Sampled keys are traced through `reference`, a plain model of
    /// the same architecture; without one a freshly initialised plain model
    /// stands in. `random` mode needs no reference.
    pub fn setup_keys(&mut self, reference: Option<&PassportNet>) -> PassportResult<()> {
        if self.keys.is_none() {
            let source = match (&self.trigger, self.config.use_trigger_as_passport) {
                (Some(trigger), true) => trigger,
                _ => &self.train,
            };
            self.keys = Some(KeyStore::sample(source, self.config.key_type, self.config.seed)?);
        }
        let Some(keys) = &self.keys else {
            return Err(PassportError::key("key store missing after sampling"));
        };
        if keys.mode() == KeyMode::Random {
            return keys.bind(None, &mut self.model);
        }
        match reference {
            Some(reference) => keys.bind(Some(reference), &mut self.model),
            None => {
                warn!("no reference model supplied; tracing keys through a freshly initialised plain model");
                let fallback = PassportNet::plain(self.config.arch, self.config.geometry)?;
                keys.bind(Some(&fallback), &mut self.model)
            }
        }
    }

    /// Runs `epochs` of passport training. Every epoch records `train_*`,
    /// `valid_*` (including signature similarity) and, with a backdoor,
    /// `wm_*` metrics, and checkpoints `best`, `last` and every
    /// `save_interval`-th epoch.
    pub fn training(&mut self) -> PassportResult<Vec<HistoryRecord>> {
        if self.model.passport_blocks().iter().any(|block| block.key().is_none()) {
            return Err(PassportError::key(
                "every passport block needs a key before training; call setup_keys first",
            ));
        }
        if self.config.save_interval > 0 {
            self.context.save_checkpoint(&self.model, "epoch-0")?;
        }
        info!(epochs = self.config.epochs, arch = %self.config.arch, "start training");
        for epoch in 1..=self.config.epochs {
            let backdoor = if self.config.train_backdoor {
                self.trigger.as_ref()
            } else {
                None
            };
            let train = self
                .trainer
                .train_epoch(&mut self.model, &self.train, backdoor, epoch)?;
            if let Some(sign_acc) = train.get("sign_acc") {
                info!(epoch, sign_acc = sign_acc * 100.0, "sign detection accuracy");
            }
            let valid = self.trainer.test(&self.model, &self.valid)?;
            let valid_acc = valid.get("acc").unwrap_or(0.0);

            let mut metrics = train.prefixed("train_");
            metrics.extend(valid.prefixed("valid_"));
            metrics.extend(test_signature(&self.model)?.prefixed("valid_"));
            if let Some(trigger) = backdoor {
                metrics.extend(self.trainer.test(&self.model, trigger)?.prefixed("wm_"));
            }
            self.context.record(epoch, metrics)?;

            if self.context.observe_accuracy(valid_acc) {
                self.context.save_checkpoint(&self.model, "best")?;
            }
            if self.config.save_interval > 0 && epoch % self.config.save_interval == 0 {
                self.context
                    .save_checkpoint(&self.model, &format!("epoch-{epoch}"))?;
            }
            self.context.save_checkpoint(&self.model, "last")?;
        }
        Ok(self.context.history().to_vec())
    }

    /// Fine-tunes a plain twin of the trained model on `train` and, after
    /// every epoch, copies its weights back into the passport model to
    /// measure how much of the signature survives (`old_wm_*`).
    pub fn transfer_learning(
        &mut self,
        mode: TransferMode,
        train: &Dataset,
        valid: &Dataset,
        epochs: usize,
    ) -> PassportResult<Vec<HistoryRecord>> {
        let (mut twin, report) = clone_plain(&self.model)?;
        info!(
            mode = %mode,
            copied = report.copied.len(),
            reconstructed = report.reconstructed.len(),
            "transfer-learning twin prepared"
        );
        if mode == TransferMode::Rtal {
            let seed = sp_config::determinism::config()
                .seed_for(("sp-passport/transfer/head", self.config.seed));
            twin.reset_head(seed)?;
        }
        let mut trainer = Trainer::new(
            self.config.lr,
            self.config.momentum,
            self.config.weight_decay,
            self.config.batch_size,
            self.config.seed,
        )?;
        let mut context = RunContext::new(self.context.logdir().join(format!("transfer-{mode}")))?;
        for epoch in 1..=epochs {
            let train_metrics = trainer.train_epoch(&mut twin, train, None, epoch)?;
            let valid_metrics = trainer.test(&twin, valid)?;
            let valid_acc = valid_metrics.get("acc").unwrap_or(0.0);

            sync_back(&twin, &mut self.model)?;
            let mut metrics = train_metrics.prefixed("train_");
            metrics.extend(valid_metrics.prefixed("valid_"));
            let survival: Metrics = test_signature(&self.model)?;
            if let Some(sign_acc) = survival.get("sign_acc") {
                info!(epoch, sign_acc = sign_acc * 100.0, "signature survival after transfer");
            }
            metrics.extend(survival.prefixed("old_wm_"));
            if let (true, Some(trigger)) = (self.config.train_backdoor, &self.trigger) {
                metrics.extend(trainer.test(&twin, trigger)?.prefixed("wm_"));
            }
            context.record(epoch, metrics)?;
            if context.observe_accuracy(valid_acc) {
                context.save_checkpoint(&twin, "best")?;
            }
            context.save_checkpoint(&twin, "last")?;
        }
        Ok(context.history().to_vec())
    }
}
