// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

pub mod conv;
pub mod linear;
pub mod normalization;

use crate::{PureResult, TensorError};

/// Deterministic initialisation seed for a named layer. Two layers built with
/// the same name under the same `SPIRAL_DETERMINISTIC_SEED` start identical.
pub(crate) fn init_seed(name: &str) -> u64 {
    sp_config::determinism::config().seed_for(("sp-nn/init", name))
}

pub(crate) fn validate_positive(value: usize, label: &'static str) -> PureResult<()> {
    if value == 0 {
        return Err(TensorError::InvalidValue { label });
    }
    Ok(())
}
