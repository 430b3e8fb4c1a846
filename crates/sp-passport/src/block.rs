// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Convolution → normalisation → affine → ReLU block in its three flavours.
//!
//! A plain block learns its affine pair like an ordinary batch norm. A keyed
//! block derives it from a secret key through [`PassportTransform`], and a
//! private block additionally fuses a learned pair on top of the keyed one
//! (`scale = keyed_scale * scale_p`, `bias = keyed_bias + bias_p`).
//!
//! Passport blocks move through
//! `Uninitialized → KeyBound → SignatureFixed → Verifying`: binding a key
//! moves to `KeyBound`, the first forward pass records `sign(scale)` as
//! ground truth (unless a message signature was fixed beforehand) and every
//! later pass re-derives the scale from the current weights and verifies it.

use crate::codec::SignatureCodec;
use crate::error::{PassportError, PassportResult};
use crate::transform::{PassportParams, PassportTransform};
use sp_nn::{BatchNorm2d, Conv2d, Module, Parameter, PureResult, Tensor, TensorError};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use tracing::{debug, warn};

const BN_MOMENTUM: f32 = 0.1;
const BN_EPSILON: f32 = 1e-5;

/// Lifecycle of a passport layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassportState {
    Uninitialized,
    KeyBound,
    SignatureFixed,
    Verifying,
}

/// What a block variant brings to the affine step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// Scale and bias are derived from a key and carry a signature.
    pub provides_affine_params: bool,
    /// Some affine component is a trained parameter.
    pub has_learned_component: bool,
}

/// Block variant selected by configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AffineKind {
    #[default]
    Learned,
    Keyed,
    Private,
}

impl AffineKind {
    pub fn capabilities(self) -> Capabilities {
        match self {
            AffineKind::Learned => Capabilities {
                provides_affine_params: false,
                has_learned_component: true,
            },
            AffineKind::Keyed => Capabilities {
                provides_affine_params: true,
                has_learned_component: false,
            },
            AffineKind::Private => Capabilities {
                provides_affine_params: true,
                has_learned_component: true,
            },
        }
    }
}

/// Convolution geometry of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConvSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    pub input_hw: (usize, usize),
    pub relu: bool,
}

impl ConvSpec {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        input_hw: (usize, usize),
    ) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            input_hw,
            relu: true,
        }
    }

    pub fn without_relu(mut self) -> Self {
        self.relu = false;
        self
    }
}

#[derive(Debug)]
struct BoundKey {
    key_x: Tensor,
    key_y: Option<Tensor>,
    transform: PassportTransform,
}

#[derive(Debug)]
struct Passport {
    key: Option<BoundKey>,
    codec: RefCell<Option<SignatureCodec>>,
    state: Cell<PassportState>,
    last_similarity: Cell<Option<f32>>,
}

impl Passport {
    fn new() -> Self {
        Self {
            key: None,
            codec: RefCell::new(None),
            state: Cell::new(PassportState::Uninitialized),
            last_similarity: Cell::new(None),
        }
    }

    fn keyed_params(&self, weight: &Tensor) -> PureResult<PassportParams> {
        let Some(bound) = &self.key else {
            return Err(TensorError::InvalidValue {
                label: "passport_forward_without_key",
            });
        };
        bound.transform.compute(weight)
    }

    /// Runs the forward-pass state transition for a freshly derived scale.
    fn observe(&self, name: &str, scale: &[f32]) -> PureResult<()> {
        let mut codec = self.codec.borrow_mut();
        let state = self.state.get();
        if state == PassportState::KeyBound && codec.is_none() {
            *codec = Some(SignatureCodec::embed(scale));
        }
        let Some(codec) = codec.as_ref() else {
            return Err(TensorError::InvalidValue {
                label: "passport_signature_missing",
            });
        };
        let similarity = codec.verify(scale)?;
        self.last_similarity.set(Some(similarity));
        match state {
            PassportState::KeyBound => {
                debug!(block = name, channels = codec.len(), "passport signature fixed");
                self.state.set(PassportState::SignatureFixed);
            }
            PassportState::SignatureFixed => self.state.set(PassportState::Verifying),
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug)]
enum Affine {
    Learned {
        gamma: Parameter,
        beta: Parameter,
    },
    Keyed(Passport),
    Private {
        passport: Passport,
        scale: Parameter,
        bias: Parameter,
    },
}

#[derive(Debug)]
struct ForwardCache {
    conv_out: Tensor,
    normed: Tensor,
    pre_activation: Tensor,
    keyed: Option<PassportParams>,
    scale: Vec<f32>,
    sign_grad: Option<Vec<f32>>,
}

/// Convolution block whose affine normalisation is plain, keyed or private.
#[derive(Debug)]
pub struct ConvBlock {
    name: String,
    kind: AffineKind,
    conv: Conv2d,
    bn: BatchNorm2d,
    affine: Affine,
    relu: bool,
    sign_loss_alpha: f32,
    training: Cell<bool>,
    sign_loss: Cell<f32>,
    cache: RefCell<Option<ForwardCache>>,
}

impl ConvBlock {
    pub fn new(
        name: impl Into<String>,
        spec: ConvSpec,
        kind: AffineKind,
        sign_loss_alpha: f32,
    ) -> PassportResult<Self> {
        let name = name.into();
        let conv = Conv2d::new(
            format!("{name}.conv"),
            spec.in_channels,
            spec.out_channels,
            (spec.kernel, spec.kernel),
            (spec.stride, spec.stride),
            (spec.padding, spec.padding),
            spec.input_hw,
        )?
        .without_bias();
        let out_hw = conv.output_hw()?;
        let bn = BatchNorm2d::new(
            format!("{name}.bn"),
            spec.out_channels,
            out_hw,
            BN_MOMENTUM,
            BN_EPSILON,
            false,
        )?;
        let channels = spec.out_channels;
        let affine = match kind {
            AffineKind::Learned => Affine::Learned {
                gamma: Parameter::new(format!("{name}.bn::gamma"), Tensor::full(1, channels, 1.0)?),
                beta: Parameter::new(format!("{name}.bn::beta"), Tensor::zeros(1, channels)?),
            },
            AffineKind::Keyed => Affine::Keyed(Passport::new()),
            AffineKind::Private => Affine::Private {
                passport: Passport::new(),
                scale: Parameter::new(
                    format!("{name}::scale_private"),
                    Tensor::full(1, channels, 1.0)?,
                ),
                bias: Parameter::new(format!("{name}::bias_private"), Tensor::zeros(1, channels)?),
            },
        };
        Ok(Self {
            name,
            kind,
            conv,
            bn,
            affine,
            relu: spec.relu,
            sign_loss_alpha,
            training: Cell::new(true),
            sign_loss: Cell::new(0.0),
            cache: RefCell::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AffineKind {
        self.kind
    }

    pub fn capabilities(&self) -> Capabilities {
        self.kind.capabilities()
    }

    pub fn conv(&self) -> &Conv2d {
        &self.conv
    }

    pub fn out_channels(&self) -> usize {
        self.conv.out_channels()
    }

    /// Number of columns one input sample must have.
    pub fn input_features(&self) -> usize {
        self.conv.input_features()
    }

    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        self.conv.output_hw()
    }

    fn passport(&self) -> Option<&Passport> {
        match &self.affine {
            Affine::Learned { .. } => None,
            Affine::Keyed(passport) | Affine::Private { passport, .. } => Some(passport),
        }
    }

    fn passport_mut(&mut self) -> Option<&mut Passport> {
        match &mut self.affine {
            Affine::Learned { .. } => None,
            Affine::Keyed(passport) | Affine::Private { passport, .. } => Some(passport),
        }
    }

    /// Lifecycle state, `None` for plain blocks.
    pub fn state(&self) -> Option<PassportState> {
        self.passport().map(|p| p.state.get())
    }

    /// Ground-truth signature once fixed.
    pub fn signature(&self) -> Option<SignatureCodec> {
        self.passport().and_then(|p| p.codec.borrow().clone())
    }

    /// Similarity observed by the latest forward pass.
    pub fn last_similarity(&self) -> Option<f32> {
        self.passport().and_then(|p| p.last_similarity.get())
    }

    /// Currently bound key pair.
    pub fn key(&self) -> Option<(&Tensor, Option<&Tensor>)> {
        self.passport()
            .and_then(|p| p.key.as_ref())
            .map(|bound| (&bound.key_x, bound.key_y.as_ref()))
    }

    /// Binds the key pair the scale and bias are derived from.
    ///
    /// A block whose signature is already fixed keeps it; only the key is
    /// replaced. While verifying, the replacement must have the shape of the
    /// current key.
    pub fn set_key(&mut self, key_x: &Tensor, key_y: Option<&Tensor>) -> PassportResult<()> {
        let Some(passport) = self.passport() else {
            return Err(PassportError::key(format!(
                "block `{}` carries no passport",
                self.name
            )));
        };
        if passport.state.get() == PassportState::Verifying {
            if let Some(bound) = &passport.key {
                let same_shape = bound.key_x.shape() == key_x.shape()
                    && bound.key_y.as_ref().map(Tensor::shape) == key_y.map(Tensor::shape);
                if !same_shape {
                    return Err(PassportError::key(format!(
                        "block `{}` is verifying with key {:?} and cannot take key {:?}",
                        self.name,
                        bound.key_x.shape(),
                        key_x.shape()
                    )));
                }
            }
        }
        let transform = PassportTransform::bind(&self.conv, key_x, key_y)?;
        let name = self.name.clone();
        if let Some(passport) = self.passport_mut() {
            passport.key = Some(BoundKey {
                key_x: key_x.clone(),
                key_y: key_y.cloned(),
                transform,
            });
            if passport.state.get() == PassportState::Uninitialized {
                passport.state.set(PassportState::KeyBound);
            }
            debug!(block = %name, state = ?passport.state.get(), "passport key bound");
        }
        Ok(())
    }

    /// Fixes the ground truth explicitly instead of on the first forward pass.
    pub fn fix_signature(&mut self, codec: SignatureCodec) -> PassportResult<()> {
        let channels = self.out_channels();
        let name = self.name.clone();
        let Some(passport) = self.passport_mut() else {
            return Err(PassportError::config(format!("block `{name}` carries no passport")));
        };
        if codec.len() != channels {
            return Err(PassportError::config(format!(
                "signature of {} bits does not fit block `{name}` with {channels} channels",
                codec.len()
            )));
        }
        match passport.state.get() {
            PassportState::SignatureFixed | PassportState::Verifying => {
                Err(PassportError::config(format!(
                    "block `{name}` already has a fixed signature"
                )))
            }
            state => {
                *passport.codec.borrow_mut() = Some(codec);
                if state == PassportState::KeyBound {
                    passport.state.set(PassportState::SignatureFixed);
                }
                Ok(())
            }
        }
    }

    /// Affine pair the block currently applies.
    pub fn affine_params(&self) -> PureResult<PassportParams> {
        Ok(self.affine_with_keyed()?.0)
    }

    fn affine_with_keyed(&self) -> PureResult<(PassportParams, Option<PassportParams>)> {
        let weight = self.conv.weight().value();
        match &self.affine {
            Affine::Learned { gamma, beta } => Ok((
                PassportParams {
                    scale: gamma.value().data().to_vec(),
                    bias: beta.value().data().to_vec(),
                },
                None,
            )),
            Affine::Keyed(passport) => {
                let keyed = passport.keyed_params(weight)?;
                Ok((keyed.clone(), Some(keyed)))
            }
            Affine::Private {
                passport,
                scale,
                bias,
            } => {
                let keyed = passport.keyed_params(weight)?;
                let fused = PassportParams {
                    scale: keyed
                        .scale
                        .iter()
                        .zip(scale.value().data())
                        .map(|(k, p)| k * p)
                        .collect(),
                    bias: keyed
                        .bias
                        .iter()
                        .zip(bias.value().data())
                        .map(|(k, p)| k + p)
                        .collect(),
                };
                Ok((fused, Some(keyed)))
            }
        }
    }

    pub fn get_scale(&self) -> PureResult<Vec<f32>> {
        Ok(self.affine_params()?.scale)
    }

    pub fn get_bias(&self) -> PureResult<Vec<f32>> {
        Ok(self.affine_params()?.bias)
    }

    /// Similarity of the current scale against the ground truth, without
    /// touching any state. `None` when no signature is fixed.
    pub fn verify(&self) -> PureResult<Option<f32>> {
        let Some(codec) = self.signature() else {
            return Ok(None);
        };
        Ok(Some(codec.verify(&self.get_scale()?)?))
    }

    /// Sign loss accumulated by training forward passes since the last call.
    pub fn take_sign_loss(&self) -> f32 {
        self.sign_loss.replace(0.0)
    }

    /// Learned affine parameters: `gamma`/`beta` of a plain block or the
    /// private pair of a private block.
    pub fn learned_affine_mut(&mut self) -> Option<(&mut Parameter, &mut Parameter)> {
        match &mut self.affine {
            Affine::Learned { gamma, beta } => Some((gamma, beta)),
            Affine::Private { scale, bias, .. } => Some((scale, bias)),
            Affine::Keyed(_) => None,
        }
    }

    /// Overwrites the learned `gamma`/`beta` of a plain block, e.g. with the
    /// scale and bias a passport block derives.
    pub fn load_affine(&mut self, scale: &[f32], bias: &[f32]) -> PassportResult<()> {
        let name = self.name.clone();
        let Affine::Learned { gamma, beta } = &mut self.affine else {
            return Err(PassportError::config(format!(
                "block `{name}` derives its affine parameters and cannot load them"
            )));
        };
        gamma.load_value(&Tensor::row_vector(scale)?)?;
        beta.load_value(&Tensor::row_vector(bias)?)?;
        Ok(())
    }
}

impl Module for ConvBlock {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let conv_out = self.conv.forward(input)?;
        let normed = self.bn.forward(&conv_out)?;
        let (params, keyed) = self.affine_with_keyed()?;
        let mut sign_grad = None;
        if let Some(passport) = self.passport() {
            passport.observe(&self.name, &params.scale)?;
            if self.training.get() && self.sign_loss_alpha > 0.0 {
                if let Some(codec) = passport.codec.borrow().as_ref() {
                    let (loss, grad) = codec.sign_loss(&params.scale, self.sign_loss_alpha)?;
                    self.sign_loss.set(self.sign_loss.get() + loss);
                    sign_grad = Some(grad);
                }
            }
        }
        let (batch, cols) = normed.shape();
        let spatial = cols / self.out_channels();
        let pre_activation = Tensor::from_fn(batch, cols, |b, col| {
            let c = col / spatial;
            normed.data()[b * cols + col] * params.scale[c] + params.bias[c]
        })?;
        let output = if self.relu {
            pre_activation.map(|v| v.max(0.0))?
        } else {
            pre_activation.clone()
        };
        *self.cache.borrow_mut() = Some(ForwardCache {
            conv_out,
            normed,
            pre_activation,
            keyed,
            scale: params.scale,
            sign_grad,
        });
        Ok(output)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let cache = self
            .cache
            .borrow_mut()
            .take()
            .ok_or(TensorError::InvalidValue {
                label: "convblock_backward_without_forward",
            })?;
        if grad_output.shape() != cache.pre_activation.shape() {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: cache.pre_activation.shape(),
            });
        }
        let channels = self.out_channels();
        let (batch, cols) = grad_output.shape();
        let spatial = cols / channels;
        let mut grad = grad_output.data().to_vec();
        if self.relu {
            for (g, pre) in grad.iter_mut().zip(cache.pre_activation.data()) {
                if *pre <= 0.0 {
                    *g = 0.0;
                }
            }
        }
        let mut grad_scale = vec![0.0f32; channels];
        let mut grad_bias = vec![0.0f32; channels];
        for (idx, g) in grad.iter().enumerate() {
            let c = (idx % cols) / spatial;
            grad_scale[c] += g * cache.normed.data()[idx];
            grad_bias[c] += g;
        }
        if let Some(sign_grad) = &cache.sign_grad {
            for (gs, extra) in grad_scale.iter_mut().zip(sign_grad) {
                *gs += extra;
            }
        }
        let grad_normed = Tensor::from_fn(batch, cols, |b, col| {
            grad[b * cols + col] * cache.scale[col / spatial]
        })?;

        match &mut self.affine {
            Affine::Learned { gamma, beta } => {
                gamma.accumulate_euclidean(&Tensor::row_vector(&grad_scale)?)?;
                beta.accumulate_euclidean(&Tensor::row_vector(&grad_bias)?)?;
            }
            Affine::Keyed(passport) => {
                if let Some(bound) = &passport.key {
                    let grad_weight = bound.transform.weight_gradient(&grad_scale, &grad_bias)?;
                    self.conv.weight_mut().accumulate_euclidean(&grad_weight)?;
                }
            }
            Affine::Private {
                passport,
                scale,
                bias,
            } => {
                let keyed = cache.keyed.as_ref().ok_or(TensorError::InvalidValue {
                    label: "private_backward_without_keyed_params",
                })?;
                let private_scale = scale.value().data().to_vec();
                let grad_private: Vec<f32> = grad_scale
                    .iter()
                    .zip(&keyed.scale)
                    .map(|(g, k)| g * k)
                    .collect();
                let grad_keyed: Vec<f32> = grad_scale
                    .iter()
                    .zip(&private_scale)
                    .map(|(g, p)| g * p)
                    .collect();
                scale.accumulate_euclidean(&Tensor::row_vector(&grad_private)?)?;
                bias.accumulate_euclidean(&Tensor::row_vector(&grad_bias)?)?;
                if let Some(bound) = &passport.key {
                    let grad_weight = bound.transform.weight_gradient(&grad_keyed, &grad_bias)?;
                    self.conv.weight_mut().accumulate_euclidean(&grad_weight)?;
                }
            }
        }

        let grad_conv = self.bn.backward(&cache.conv_out, &grad_normed)?;
        self.conv.backward(input, &grad_conv)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv.visit_parameters(visitor)?;
        match &self.affine {
            Affine::Learned { gamma, beta } => {
                visitor(gamma)?;
                visitor(beta)
            }
            Affine::Private { scale, bias, .. } => {
                visitor(scale)?;
                visitor(bias)
            }
            Affine::Keyed(_) => Ok(()),
        }
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv.visit_parameters_mut(visitor)?;
        match &mut self.affine {
            Affine::Learned { gamma, beta } => {
                visitor(gamma)?;
                visitor(beta)
            }
            Affine::Private { scale, bias, .. } => {
                visitor(scale)?;
                visitor(bias)
            }
            Affine::Keyed(_) => Ok(()),
        }
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
        self.bn.set_training(training);
    }

    fn buffers(&self) -> HashMap<String, Tensor> {
        let mut buffers = self.bn.buffers();
        if let Some(passport) = self.passport() {
            if let Some(codec) = passport.codec.borrow().as_ref() {
                if let Ok(bits) = codec.to_tensor() {
                    buffers.insert(format!("{}::signature", self.name), bits);
                }
            }
            if let Some(bound) = &passport.key {
                buffers.insert(format!("{}::key_x", self.name), bound.key_x.clone());
                if let Some(key_y) = &bound.key_y {
                    buffers.insert(format!("{}::key_y", self.name), key_y.clone());
                }
            }
        }
        buffers
    }

    /// Restores running statistics and, for passport blocks, the key and
    /// ground-truth signature stored in a checkpoint.
    fn load_buffers(&mut self, buffers: &HashMap<String, Tensor>) -> PureResult<()> {
        self.bn.load_buffers(buffers)?;
        if self.passport().is_none() {
            return Ok(());
        }
        let key_x = buffers.get(&format!("{}::key_x", self.name));
        let key_y = buffers.get(&format!("{}::key_y", self.name));
        let signature = buffers.get(&format!("{}::signature", self.name));
        if key_x.is_none() && signature.is_none() {
            return Ok(());
        }
        let transform = match key_x {
            Some(key_x) => Some(
                PassportTransform::bind(&self.conv, key_x, key_y).map_err(|err| {
                    warn!(block = %self.name, error = %err, "stored passport key does not fit");
                    TensorError::InvalidValue {
                        label: "passport_key_buffer",
                    }
                })?,
            ),
            None => None,
        };
        let codec = match signature {
            Some(bits) => {
                let codec = SignatureCodec::from_tensor(bits).map_err(|_| {
                    TensorError::InvalidValue {
                        label: "passport_signature_buffer",
                    }
                })?;
                if codec.len() != self.out_channels() {
                    return Err(TensorError::ShapeMismatch {
                        left: bits.shape(),
                        right: (1, self.out_channels()),
                    });
                }
                Some(codec)
            }
            None => None,
        };
        if let Some(passport) = self.passport_mut() {
            if let (Some(transform), Some(key_x)) = (transform, key_x) {
                passport.key = Some(BoundKey {
                    key_x: key_x.clone(),
                    key_y: key_y.cloned(),
                    transform,
                });
            }
            if codec.is_some() {
                *passport.codec.borrow_mut() = codec;
            }
            let state = match (passport.key.is_some(), passport.codec.borrow().is_some()) {
                (true, true) => PassportState::SignatureFixed,
                (true, false) => PassportState::KeyBound,
                (false, _) => PassportState::Uninitialized,
            };
            passport.state.set(state);
            passport.last_similarity.set(None);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn spec() -> ConvSpec {
        ConvSpec::new(2, 4, 3, 1, 1, (4, 4))
    }

    fn key(seed: u64) -> Tensor {
        Tensor::random_normal(3, 32, 0.0, 1.0, Some(seed)).unwrap()
    }

    #[test]
    fn capability_sets_follow_the_variant() {
        assert_eq!(
            AffineKind::Keyed.capabilities(),
            Capabilities {
                provides_affine_params: true,
                has_learned_component: false
            }
        );
        assert!(AffineKind::Private.capabilities().has_learned_component);
        assert!(!AffineKind::Learned.capabilities().provides_affine_params);
    }

    #[test]
    fn lifecycle_moves_through_every_state() {
        let mut block = ConvBlock::new("b", spec(), AffineKind::Keyed, 0.0).unwrap();
        let input = Tensor::random_normal(2, 32, 0.0, 1.0, Some(1)).unwrap();
        assert_eq!(block.state(), Some(PassportState::Uninitialized));
        assert!(block.forward(&input).is_err());

        block.set_key(&key(1), Some(&key(2))).unwrap();
        assert_eq!(block.state(), Some(PassportState::KeyBound));
        assert!(block.signature().is_none());

        block.forward(&input).unwrap();
        assert_eq!(block.state(), Some(PassportState::SignatureFixed));
        let fixed = block.signature().unwrap();
        assert_eq!(fixed, SignatureCodec::embed(&block.get_scale().unwrap()));
        assert_eq!(block.last_similarity(), Some(1.0));

        block.forward(&input).unwrap();
        assert_eq!(block.state(), Some(PassportState::Verifying));
        assert_eq!(block.signature().unwrap(), fixed);
    }

    #[test]
    fn verifying_block_rejects_incompatible_key_shape() {
        let mut block = ConvBlock::new("b", spec(), AffineKind::Keyed, 0.0).unwrap();
        block.set_key(&key(1), Some(&key(2))).unwrap();
        let input = Tensor::random_normal(1, 32, 0.0, 1.0, Some(4)).unwrap();
        block.forward(&input).unwrap();
        block.forward(&input).unwrap();
        let other = Tensor::random_normal(5, 32, 0.0, 1.0, Some(3)).unwrap();
        assert!(matches!(
            block.set_key(&other, Some(&other)),
            Err(PassportError::KeyBinding(_))
        ));
        block.set_key(&key(7), Some(&key(8))).unwrap();
        assert_eq!(block.state(), Some(PassportState::Verifying));
    }

    #[test]
    fn private_scale_fuses_keyed_and_learned_parts() {
        let mut keyed = ConvBlock::new("b", spec(), AffineKind::Keyed, 0.0).unwrap();
        let mut private = ConvBlock::new("b", spec(), AffineKind::Private, 0.0).unwrap();
        keyed.set_key(&key(1), None).unwrap();
        private.set_key(&key(1), None).unwrap();
        let (scale_p, bias_p) = private.learned_affine_mut().unwrap();
        scale_p.value_mut().data_mut().fill(-2.0);
        bias_p.value_mut().data_mut().fill(0.5);
        let base = keyed.affine_params().unwrap();
        let fused = private.affine_params().unwrap();
        for c in 0..4 {
            assert_relative_eq!(fused.scale[c], -2.0 * base.scale[c]);
            assert_relative_eq!(fused.bias[c], base.bias[c] + 0.5);
        }
    }

    #[test]
    fn message_signature_survives_first_forward() {
        let mut block = ConvBlock::new("b", spec(), AffineKind::Keyed, 0.0).unwrap();
        let codec = SignatureCodec::from_message("Z", 4).unwrap();
        block.fix_signature(codec.clone()).unwrap();
        block.set_key(&key(1), Some(&key(2))).unwrap();
        block
            .forward(&Tensor::random_normal(1, 32, 0.0, 1.0, Some(9)).unwrap())
            .unwrap();
        assert_eq!(block.signature().unwrap(), codec);
        assert!(block.fix_signature(codec).is_err());
    }

    #[test]
    fn sign_loss_pushes_keyed_scale_toward_ground_truth() {
        let mut block = ConvBlock::new("b", spec(), AffineKind::Keyed, 1.0).unwrap();
        let flipped: Vec<i8> = vec![1, -1, 1, -1];
        block.fix_signature(SignatureCodec::from_bits(flipped).unwrap()).unwrap();
        block.set_key(&key(1), Some(&key(2))).unwrap();
        let before = block.verify().unwrap().unwrap();
        let input = Tensor::random_normal(2, 32, 0.0, 1.0, Some(3)).unwrap();
        for _ in 0..200 {
            let out = block.forward(&input).unwrap();
            block.take_sign_loss();
            let zeros = Tensor::zeros(out.shape().0, out.shape().1).unwrap();
            block.backward(&input, &zeros).unwrap();
            block.apply_step(0.05).unwrap();
        }
        let after = block.verify().unwrap().unwrap();
        assert!(after >= before);
        assert_eq!(after, 1.0);
    }

    #[test]
    fn buffers_restore_key_and_signature() {
        let mut block = ConvBlock::new("b", spec(), AffineKind::Keyed, 0.0).unwrap();
        block.set_key(&key(1), Some(&key(2))).unwrap();
        block
            .forward(&Tensor::random_normal(1, 32, 0.0, 1.0, Some(1)).unwrap())
            .unwrap();
        let state = block.state_dict().unwrap();
        let buffers = block.buffers();
        assert!(buffers.contains_key("b::signature"));

        let mut restored = ConvBlock::new("b", spec(), AffineKind::Keyed, 0.0).unwrap();
        restored.load_state_dict(&state).unwrap();
        restored.load_buffers(&buffers).unwrap();
        assert_eq!(restored.state(), Some(PassportState::SignatureFixed));
        assert_eq!(restored.signature(), block.signature());
        assert_eq!(restored.get_scale().unwrap(), block.get_scale().unwrap());
    }

    #[test]
    fn plain_block_learns_gamma_and_beta() {
        let mut block = ConvBlock::new("p", spec(), AffineKind::Learned, 0.0).unwrap();
        assert_eq!(block.state(), None);
        let input = Tensor::random_normal(2, 32, 0.0, 1.0, Some(2)).unwrap();
        let out = block.forward(&input).unwrap();
        block
            .backward(&input, &Tensor::full(out.shape().0, out.shape().1, 1.0).unwrap())
            .unwrap();
        let mut names = Vec::new();
        block
            .visit_parameters(&mut |p| {
                assert!(p.gradient().is_some());
                names.push(p.name().to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(names, vec!["p.conv::weight", "p.bn::gamma", "p.bn::beta"]);
        block.load_affine(&[1.0, -1.0, 2.0, 0.0], &[0.0; 4]).unwrap();
        assert_eq!(block.get_scale().unwrap(), vec![1.0, -1.0, 2.0, 0.0]);
    }
}
