// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Passport ownership signatures for convolutional networks.
//!
//! Selected convolution blocks derive their normalisation scale and bias
//! from a secret key run through their own weights. The sign pattern of the
//! scale is the ownership signature: it is fixed once, verified on every
//! forward pass and attacked by flipping a controlled fraction of its bits.
//!
//! Data flows from [`keys`] through [`transform`] into the passport
//! [`block`]s, whose scales [`codec`] compares against the stored ground
//! truth. [`experiment`] drives training; [`attack_runner`] drives the
//! bit-flip attack built on [`partition`] and [`attack`].

pub mod attack;
pub mod attack_runner;
pub mod block;
pub mod codec;
pub mod config;
pub mod error;
pub mod experiment;
pub mod keys;
pub mod metrics;
pub mod models;
pub mod partition;
pub mod trainer;
pub mod transfer;
pub mod transform;

pub use attack::{apply, select, AffineSlot, AttackReport};
pub use attack_runner::{attack_model, run_attack, AttackOutcome};
pub use block::{AffineKind, Capabilities, ConvBlock, ConvSpec, PassportState};
pub use codec::{detect_accuracy, sign_bit, SignatureCodec, SIGN_LOSS_MARGIN};
pub use config::{
    Arch, AttackConfig, ExperimentConfig, LayerPath, LayerSetting, ModelGeometry, PassportConfig,
    PathSegment, Scheme,
};
pub use error::{PassportError, PassportResult};
pub use experiment::{Experiment, TransferMode};
pub use keys::{bind_random_keys, get_key, set_key, Key, KeyMode, KeyStore, DEFAULT_KEY_SAMPLES};
pub use metrics::{load_history, HistoryRecord, Metrics, RunContext};
pub use models::{BasicBlock, PassportNet};
pub use partition::IndexPartition;
pub use trainer::{test_signature, Trainer};
pub use transfer::{
    clone_plain, copy_compatible, copy_strict, sync_back, AffineReconstruction, TransferReport,
};
pub use transform::{PassportParams, PassportTransform};
