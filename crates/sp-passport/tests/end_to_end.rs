// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use serde_json::json;
use sp_nn::{load_bincode, one_hot, Dataset, Module, Tensor};
use sp_passport::{
    load_history, run_attack, Arch, AttackConfig, Experiment, ExperimentConfig, KeyMode, KeyStore,
    ModelGeometry, PassportConfig, PassportNet, PassportState, Scheme, TransferMode,
};
use tempfile::tempdir;

fn geometry() -> ModelGeometry {
    ModelGeometry {
        in_channels: 1,
        num_classes: 2,
        input_hw: (8, 8),
        base_width: 4,
    }
}

fn layout() -> PassportConfig {
    PassportConfig::from_value(&json!({"features": {"0": true, "2": true}})).unwrap()
}

fn images(len: usize, offset: usize) -> Dataset {
    let mut data = Dataset::new();
    for i in 0..len {
        let label = (i + offset) % 2;
        let sign = if label == 0 { -1.0 } else { 1.0 };
        let phase = (i + offset) as f32 * 0.37;
        let input = Tensor::from_fn(1, 64, |_, c| sign * 0.5 + ((c as f32) * 0.21 + phase).sin() * 0.3).unwrap();
        data.push(input, one_hot(label, 2).unwrap());
    }
    data
}

fn signatures(model: &PassportNet) -> Vec<(String, Vec<i8>)> {
    model
        .passport_blocks()
        .into_iter()
        .map(|block| {
            let bits = block.signature().map(|codec| codec.bits().to_vec()).unwrap_or_default();
            (block.name().to_string(), bits)
        })
        .collect()
}

#[test]
fn rebinding_the_same_keys_keeps_fixed_signatures() {
    for scheme in [Scheme::Keyed, Scheme::Private] {
        let data = images(24, 0);
        let reference = PassportNet::plain(Arch::AlexNet, geometry()).unwrap();
        let mut model = PassportNet::build(Arch::AlexNet, geometry(), &layout(), scheme, 0.1).unwrap();
        let keys = KeyStore::sample(&data, KeyMode::Shuffle, Some(9)).unwrap();

        keys.bind(Some(&reference), &mut model).unwrap();
        model.set_training(false);
        let (batch, _) = data.gather(&[0, 1, 2]).unwrap();
        model.forward(&batch).unwrap();
        let fixed = signatures(&model);
        assert!(fixed.iter().all(|(_, bits)| !bits.is_empty()));

        keys.bind(Some(&reference), &mut model).unwrap();
        model.forward(&batch).unwrap();
        assert_eq!(signatures(&model), fixed);
        for block in model.passport_blocks() {
            assert_eq!(block.state(), Some(PassportState::Verifying));
        }
    }
}

#[test]
fn train_then_attack_from_checkpoint() {
    let dir = tempdir().unwrap();
    let train = images(24, 0);
    let valid = images(6, 100);

    let mut config = ExperimentConfig::new(Arch::AlexNet, layout());
    config.geometry = geometry();
    config.epochs = 2;
    config.batch_size = 4;
    config.seed = Some(5);
    config.save_interval = 1;
    config.logdir = dir.path().join("train");

    let mut experiment = Experiment::new(config, train.clone(), valid.clone(), None).unwrap();
    assert!(experiment.training().is_err());
    experiment.setup_keys(None).unwrap();
    let history = experiment.training().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].epoch, 2);
    assert!(history[1].metrics.get("train_loss").unwrap().is_finite());
    assert!(history[1].metrics.get("valid_sign_acc").is_some());
    assert!(history[1].metrics.get("valid_sim_features.0").is_some());

    let context = experiment.context();
    for label in ["epoch-0", "epoch-1", "epoch-2", "best", "last"] {
        assert!(context.checkpoint_path(label).exists(), "missing checkpoint {label}");
    }
    let logged = load_history(context.history_path()).unwrap();
    assert_eq!(logged.len(), history.len());
    assert_eq!(logged[0].metrics.len(), history[0].metrics.len());

    let mut restored = PassportNet::build(Arch::AlexNet, geometry(), &layout(), Scheme::Keyed, 0.0).unwrap();
    load_bincode(&mut restored, context.checkpoint_path("last")).unwrap();
    assert_eq!(signatures(&restored), signatures(experiment.model()));
    let checkpoint = context.checkpoint_path("last");

    let mut attack = AttackConfig::new(checkpoint, Arch::AlexNet, layout());
    attack.geometry = geometry();
    attack.flip_fraction = 0.5;
    attack.epochs = 1;
    attack.batch_size = 4;
    attack.seed = Some(3);
    attack.logdir = dir.path().join("attack");
    let outcome = run_attack(&attack, &train, &valid).unwrap();

    // 4 + 12 channels at base width 4.
    assert_eq!(outcome.selection.len(), 8);
    assert_eq!(outcome.report.selected, 8);
    for (flipped, similarity) in outcome
        .report
        .flipped_per_layer
        .iter()
        .zip(&outcome.report.similarity_per_layer)
    {
        assert!(*similarity <= 1.0);
        assert!(flipped.len() <= 12);
    }
    assert!(outcome.ground_truth_similarity.is_some());
    assert_eq!(outcome.history.len(), 2);
    assert_eq!(outcome.history[0].epoch, 0);
    assert!(outcome.history[0].metrics.get("signature_similarity").is_some());
    assert!(outcome.history[1].metrics.get("train_loss").is_some());
    assert!(outcome.checkpoint.exists());
    assert!(outcome.model.passport_blocks().is_empty());
}

#[test]
fn transfer_learning_reports_signature_survival() {
    let dir = tempdir().unwrap();
    let train = images(20, 0);
    let valid = images(4, 50);

    let mut config = ExperimentConfig::new(Arch::AlexNet, layout());
    config.geometry = geometry();
    config.epochs = 1;
    config.batch_size = 4;
    config.seed = Some(21);
    config.logdir = dir.path().to_path_buf();

    let mut experiment = Experiment::new(config, train.clone(), valid.clone(), None).unwrap();
    let reference = PassportNet::plain(Arch::AlexNet, geometry()).unwrap();
    experiment.setup_keys(Some(&reference)).unwrap();
    experiment.training().unwrap();
    let before = signatures(experiment.model());

    let history = experiment
        .transfer_learning(TransferMode::Rtal, &train, &valid, 1)
        .unwrap();
    assert_eq!(history.len(), 1);
    let survival = history[0].metrics.get("old_wm_sign_acc").unwrap();
    assert!((0.0..=1.0).contains(&survival));
    assert_eq!(signatures(experiment.model()), before);
    assert!(dir.path().join("transfer-rtal").join("history.jsonl").exists());
}

#[test]
fn trigger_settings_need_a_trigger_set() {
    let mut config = ExperimentConfig::new(Arch::AlexNet, layout());
    config.geometry = geometry();
    config.train_backdoor = true;
    let dir = tempdir().unwrap();
    config.logdir = dir.path().to_path_buf();
    assert!(Experiment::new(config, images(4, 0), images(2, 0), None).is_err());
}
