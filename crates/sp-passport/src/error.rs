// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use sp_tensor::TensorError;
use thiserror::Error;

/// Failures raised by the passport stack.
#[derive(Debug, Error)]
pub enum PassportError {
    /// Unknown architecture tag, empty passport configuration, flip fraction
    /// outside `[0, 1]` and similar user input problems.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Key sampling or key assignment failed.
    #[error("key binding error: {0}")]
    KeyBinding(String),
    /// The global index space no longer covers the layers it was built from.
    /// Never recovered from: any similarity computed afterwards is meaningless.
    #[error("partition invariant violated: {0}")]
    PartitionInvariantViolation(String),
    /// Two models disagree on their parameter sets.
    #[error("state dict mismatch: missing {missing:?}, unexpected {unexpected:?}")]
    StateDictMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type PassportResult<T> = Result<T, PassportError>;

impl PassportError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        PassportError::Configuration(message.into())
    }

    pub(crate) fn key(message: impl Into<String>) -> Self {
        PassportError::KeyBinding(message.into())
    }

    pub(crate) fn partition(message: impl Into<String>) -> Self {
        PassportError::PartitionInvariantViolation(message.into())
    }
}
