// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Bit-flip attack against a trained passport model.
//!
//! The attacker works on a plain twin whose `gamma`/`beta` are rebuilt from
//! the passport scale and bias. Everything except the affine parameters of
//! the attacked blocks is frozen; the attacked signs are flipped, biases
//! zeroed and the twin is then fine-tuned from that starting point.

use crate::attack::{apply, select, AffineSlot, AttackReport};
use crate::block::ConvBlock;
use crate::codec::SignatureCodec;
use crate::config::AttackConfig;
use crate::error::{PassportError, PassportResult};
use crate::metrics::{HistoryRecord, RunContext};
use crate::models::PassportNet;
use crate::trainer::Trainer;
use crate::transfer::clone_plain;
use sp_nn::{load_bincode, Dataset, Module};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;

/// Everything a finished attack run produced.
#[derive(Debug)]
pub struct AttackOutcome {
    /// Global indices whose sign was flipped.
    pub selection: Vec<usize>,
    pub report: AttackReport,
    /// Similarity of the attacked twin against the passport model's stored
    /// ground truth, right after the flip.
    pub ground_truth_similarity: Option<f32>,
    /// Epoch 0 is the untrained attacked model.
    pub history: Vec<HistoryRecord>,
    /// Attacked and fine-tuned plain twin.
    pub model: PassportNet,
    pub checkpoint: PathBuf,
}

/// Loads the checkpoint at `config.loadpath` and attacks it.
pub fn run_attack(
    config: &AttackConfig,
    train: &Dataset,
    valid: &Dataset,
) -> PassportResult<AttackOutcome> {
    config.validate()?;
    let mut passport = PassportNet::build(
        config.arch,
        config.geometry,
        &config.passport_config,
        config.scheme,
        0.0,
    )?;
    load_bincode(&mut passport, &config.loadpath)?;
    info!(path = %config.loadpath.display(), "passport checkpoint loaded");
    attack_model(&passport, config, train, valid)
}

/// Attacks an in-memory passport model; `passport` itself is not modified.
pub fn attack_model(
    passport: &PassportNet,
    config: &AttackConfig,
    train: &Dataset,
    valid: &Dataset,
) -> PassportResult<AttackOutcome> {
    config.validate()?;
    let names: Vec<String> = config
        .passport_config
        .passport_paths()
        .map(ToString::to_string)
        .collect();
    let (mut twin, _) = clone_plain(passport)?;
    twin.set_trainable(false)?;

    let (selection, report) = {
        let mut by_name: HashMap<String, &mut ConvBlock> = twin
            .blocks_mut()
            .into_iter()
            .map(|block| (block.name().to_string(), block))
            .collect();
        let mut slots = Vec::with_capacity(names.len());
        for name in &names {
            let (gamma, beta) = by_name
                .remove(name)
                .and_then(|block| block.learned_affine_mut())
                .ok_or_else(|| {
                    PassportError::config(format!("attacked layer `{name}` has no affine parameters"))
                })?;
            gamma.set_trainable(true);
            beta.set_trainable(true);
            slots.push(AffineSlot {
                scale: gamma.value_mut().data_mut(),
                bias: beta.value_mut().data_mut(),
            });
        }
        let total: usize = slots.iter().map(|slot| slot.scale.len()).sum();
        let selection = select(total, config.flip_fraction, config.seed)?;
        info!(
            total,
            selected = selection.len(),
            fraction = config.flip_fraction,
            "attacking signature bits"
        );
        let report = apply(&mut slots, &selection)?;
        (selection, report)
    };

    let ground_truth_similarity = ground_truth_similarity(passport, &twin, &names)?;
    info!(
        similarity = report.mean_similarity,
        ground_truth = ?ground_truth_similarity,
        "signature similarity after flip"
    );

    let logdir = config.logdir.join(format!(
        "{}-{}-flip{}-{}",
        config.arch,
        config.scheme.tag(),
        config.flip_fraction,
        config.tag
    ));
    let mut context = RunContext::new(logdir)?;
    let mut trainer = Trainer::new(
        config.lr,
        config.momentum,
        config.weight_decay,
        config.batch_size,
        config.seed,
    )?;

    let mut metrics = trainer.test(&twin, valid)?.prefixed("valid_");
    metrics.insert("signature_similarity", report.mean_similarity);
    if let Some(similarity) = ground_truth_similarity {
        metrics.insert("ground_truth_similarity", similarity);
    }
    context.record(0, metrics)?;

    for epoch in 1..=config.epochs {
        let mut metrics = trainer
            .train_epoch(&mut twin, train, None, epoch)?
            .prefixed("train_");
        metrics.extend(trainer.test(&twin, valid)?.prefixed("valid_"));
        metrics.insert(
            "signature_similarity",
            similarity_to(&twin, &names, &report.original_signatures)?,
        );
        context.record(epoch, metrics)?;
        context.save_checkpoint(&twin, "last")?;
    }
    let checkpoint = context.save_checkpoint(&twin, "last")?;

    Ok(AttackOutcome {
        selection,
        report,
        ground_truth_similarity,
        history: context.history().to_vec(),
        model: twin,
        checkpoint,
    })
}

fn similarity_to(
    model: &PassportNet,
    names: &[String],
    signatures: &[SignatureCodec],
) -> PassportResult<f32> {
    let mut total = 0.0f32;
    for (name, codec) in names.iter().zip(signatures) {
        let block = model
            .block(name)
            .ok_or_else(|| PassportError::config(format!("unknown layer `{name}`")))?;
        total += codec.verify(&block.get_scale()?)?;
    }
    Ok(total / names.len().max(1) as f32)
}

fn ground_truth_similarity(
    passport: &PassportNet,
    twin: &PassportNet,
    names: &[String],
) -> PassportResult<Option<f32>> {
    let mut truths = Vec::new();
    for name in names {
        let Some(codec) = passport.block(name).and_then(ConvBlock::signature) else {
            return Ok(None);
        };
        truths.push(codec);
    }
    Ok(Some(similarity_to(twin, names, &truths)?))
}
