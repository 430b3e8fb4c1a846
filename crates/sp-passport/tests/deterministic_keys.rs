// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

// Single test in its own binary: the determinism config is read once per
// process, so the environment must be set before anything touches it.

use sp_nn::{one_hot, Dataset, Tensor};
use sp_passport::{KeyMode, KeyStore};

fn dataset(len: usize) -> Dataset {
    let mut data = Dataset::new();
    for i in 0..len {
        data.push(Tensor::full(1, 4, i as f32).unwrap(), one_hot(i % 2, 2).unwrap());
    }
    data
}

#[test]
fn seedless_deterministic_keys_are_distinct_and_replayable() {
    std::env::set_var("SPIRAL_DETERMINISTIC", "1");
    std::env::set_var("SPIRAL_DETERMINISTIC_SEED", "2024");
    let data = dataset(40);

    let first = KeyStore::sample(&data, KeyMode::Shuffle, None).unwrap();
    let key_x = first.key_x().unwrap();
    let key_y = first.key_y().unwrap();
    assert_ne!(key_x.indices(), key_y.indices());

    let second = KeyStore::sample(&data, KeyMode::Shuffle, None).unwrap();
    assert_eq!(second.key_x().unwrap().indices(), key_x.indices());
    assert_eq!(second.key_y().unwrap().indices(), key_y.indices());
}
