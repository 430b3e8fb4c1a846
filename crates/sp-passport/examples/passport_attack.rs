// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Trains a small AlexNet with two passport layers on synthetic stripes,
//! then flips a fraction of its signature bits and fine-tunes the attacked
//! plain twin.
//!
//! ```text
//! RUST_LOG=info PASSPORT_LOGDIR=runs/demo PASSPORT_FLIP=0.25 \
//!     cargo run -p sp-passport --example passport_attack
//! ```

use std::error::Error;
use std::path::PathBuf;

use serde_json::json;
use sp_config::tracing::{flush_tracing, init_tracing};
use sp_nn::{one_hot, Dataset, Tensor};
use sp_passport::{
    run_attack, Arch, AttackConfig, Experiment, ExperimentConfig, ModelGeometry, PassportConfig,
};

fn stripes(len: usize, seed: usize) -> Result<Dataset, Box<dyn Error>> {
    let mut data = Dataset::new();
    for i in 0..len {
        let label = (i + seed) % 2;
        let input = Tensor::from_fn(1, 64, |_, c| {
            let (row, col) = (c / 8, c % 8);
            let stripe = if label == 0 { row } else { col };
            if stripe % 2 == 0 {
                1.0
            } else {
                -1.0 + 0.05 * ((i + c) % 7) as f32
            }
        })?;
        data.push(input, one_hot(label, 2)?);
    }
    Ok(data)
}

fn main() -> Result<(), Box<dyn Error>> {
    init_tracing()?;

    let logdir = PathBuf::from(std::env::var("PASSPORT_LOGDIR").unwrap_or_else(|_| "runs/passport-demo".into()));
    let flip_fraction = match std::env::var("PASSPORT_FLIP") {
        Ok(raw) => raw.parse::<f64>()?,
        Err(_) => 0.5,
    };
    let geometry = ModelGeometry {
        in_channels: 1,
        num_classes: 2,
        input_hw: (8, 8),
        base_width: 8,
    };
    let layout = PassportConfig::from_value(&json!({
        "features": {"0": true, "2": "SpiralTorch"}
    }))?;

    let train = stripes(64, 0)?;
    let valid = stripes(16, 1)?;

    let mut config = ExperimentConfig::new(Arch::AlexNet, layout.clone());
    config.geometry = geometry;
    config.epochs = 5;
    config.batch_size = 16;
    config.seed = Some(7);
    config.logdir = logdir.join("train");
    let mut experiment = Experiment::new(config, train.clone(), valid.clone(), None)?;
    experiment.setup_keys(None)?;
    let history = experiment.training()?;
    if let Some(last) = history.last() {
        for (name, value) in last.metrics.iter() {
            println!("train epoch {:>2}  {name:<28} {value:.4}", last.epoch);
        }
    }

    let mut attack = AttackConfig::new(
        experiment.context().checkpoint_path("last"),
        Arch::AlexNet,
        layout,
    );
    attack.geometry = geometry;
    attack.flip_fraction = flip_fraction;
    attack.epochs = 3;
    attack.batch_size = 16;
    attack.seed = Some(0);
    attack.logdir = logdir.join("attack");
    let outcome = run_attack(&attack, &train, &valid)?;
    println!(
        "flipped {} bits, similarity {:.3}, ground truth {:?}",
        outcome.selection.len(),
        outcome.report.mean_similarity,
        outcome.ground_truth_similarity
    );
    for record in &outcome.history {
        if let Some(similarity) = record.metrics.get("signature_similarity") {
            println!("attack epoch {:>2}  signature_similarity {similarity:.4}", record.epoch);
        }
    }

    flush_tracing();
    Ok(())
}
