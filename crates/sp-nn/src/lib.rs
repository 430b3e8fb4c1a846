// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Lightweight `nn.Module` style surface for the passport stack.
//!
//! Modules run an explicit forward pass and accept an explicit backward pass
//! that accumulates into their [`Parameter`]s. Containers cache the
//! activations of their latest forward call, so a `backward` must follow the
//! `forward` it differentiates.

pub mod dataset;
pub mod io;
pub mod layers;
pub mod loss;
pub mod module;
pub mod optim;

pub use dataset::{DataLoader, Dataset, Sample};
pub use io::{
    load_bincode, load_json, load_state_bincode, load_state_json, save_bincode, save_json,
    save_state_bincode, save_state_json, ModuleState,
};
pub use layers::conv::{Conv2d, GlobalAvgPool2d, MaxPool2d};
pub use layers::linear::Linear;
pub use layers::normalization::BatchNorm2d;
pub use loss::{correct_predictions, one_hot, softmax, Loss, SoftmaxCrossEntropy};
pub use module::{Module, Parameter};
pub use optim::Sgd;

pub use sp_tensor::{PureResult, Tensor, TensorError};
