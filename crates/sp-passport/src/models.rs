// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! AlexNet and ResNet backbones built from [`ConvBlock`]s.
//!
//! Block names double as configuration paths: `features.4` for AlexNet,
//! `convbnrelu_1` and `layer2.0.shortcut` style names for the ResNets. The
//! passport configuration is resolved against these names once, at build
//! time; a path that names no block is a configuration error.

use crate::block::{AffineKind, ConvBlock, ConvSpec};
use crate::codec::{detect_accuracy, SignatureCodec};
use crate::config::{Arch, LayerPath, LayerSetting, ModelGeometry, PassportConfig, Scheme};
use crate::error::{PassportError, PassportResult};
use sp_nn::{GlobalAvgPool2d, Linear, MaxPool2d, Module, Parameter, PureResult, Tensor, TensorError};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use tracing::info;

/// Residual unit: two 3x3 blocks plus an optional 1x1 projection shortcut.
#[derive(Debug)]
pub struct BasicBlock {
    conv1: ConvBlock,
    conv2: ConvBlock,
    shortcut: Option<ConvBlock>,
    cache: RefCell<Option<(Tensor, Tensor)>>,
}

impl BasicBlock {
    fn forward_parts(&self, input: &Tensor) -> PureResult<(Tensor, Tensor)> {
        let hidden = self.conv1.forward(input)?;
        let residual = self.conv2.forward(&hidden)?;
        let skip = match &self.shortcut {
            Some(shortcut) => shortcut.forward(input)?,
            None => input.clone(),
        };
        Ok((hidden, residual.add(&skip)?))
    }
}

impl Module for BasicBlock {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (hidden, summed) = self.forward_parts(input)?;
        let output = summed.map(|v| v.max(0.0))?;
        *self.cache.borrow_mut() = Some((hidden, summed));
        Ok(output)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (hidden, summed) = self
            .cache
            .borrow_mut()
            .take()
            .ok_or(TensorError::InvalidValue {
                label: "residual_backward_without_forward",
            })?;
        let mut grad_sum = grad_output.clone();
        for (g, v) in grad_sum.data_mut().iter_mut().zip(summed.data()) {
            if *v <= 0.0 {
                *g = 0.0;
            }
        }
        let grad_hidden = self.conv2.backward(&hidden, &grad_sum)?;
        let grad_main = self.conv1.backward(input, &grad_hidden)?;
        let grad_skip = match &mut self.shortcut {
            Some(shortcut) => shortcut.backward(input, &grad_sum)?,
            None => grad_sum,
        };
        grad_main.add(&grad_skip)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv1.visit_parameters(visitor)?;
        self.conv2.visit_parameters(visitor)?;
        if let Some(shortcut) = &self.shortcut {
            shortcut.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv1.visit_parameters_mut(visitor)?;
        self.conv2.visit_parameters_mut(visitor)?;
        if let Some(shortcut) = &mut self.shortcut {
            shortcut.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }

    fn set_training(&self, training: bool) {
        self.conv1.set_training(training);
        self.conv2.set_training(training);
        if let Some(shortcut) = &self.shortcut {
            shortcut.set_training(training);
        }
    }

    fn buffers(&self) -> HashMap<String, Tensor> {
        let mut buffers = self.conv1.buffers();
        buffers.extend(self.conv2.buffers());
        if let Some(shortcut) = &self.shortcut {
            buffers.extend(shortcut.buffers());
        }
        buffers
    }

    fn load_buffers(&mut self, buffers: &HashMap<String, Tensor>) -> PureResult<()> {
        self.conv1.load_buffers(buffers)?;
        self.conv2.load_buffers(buffers)?;
        if let Some(shortcut) = &mut self.shortcut {
            shortcut.load_buffers(buffers)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
enum Stage {
    Block(ConvBlock),
    Pool(MaxPool2d),
    Residual(BasicBlock),
}

impl Stage {
    fn blocks(&self) -> Vec<&ConvBlock> {
        match self {
            Stage::Block(block) => vec![block],
            Stage::Pool(_) => Vec::new(),
            Stage::Residual(unit) => {
                let mut blocks = vec![&unit.conv1, &unit.conv2];
                blocks.extend(unit.shortcut.as_ref());
                blocks
            }
        }
    }

    fn blocks_mut(&mut self) -> Vec<&mut ConvBlock> {
        match self {
            Stage::Block(block) => vec![block],
            Stage::Pool(_) => Vec::new(),
            Stage::Residual(unit) => {
                let mut blocks = vec![&mut unit.conv1, &mut unit.conv2];
                blocks.extend(unit.shortcut.as_mut());
                blocks
            }
        }
    }

    /// Forward pass that records the input of every block it contains.
    fn trace(&self, input: &Tensor, seen: &mut HashMap<String, Tensor>) -> PureResult<Tensor> {
        match self {
            Stage::Block(block) => {
                seen.insert(block.name().to_string(), input.clone());
                block.forward(input)
            }
            Stage::Pool(pool) => pool.forward(input),
            Stage::Residual(unit) => {
                seen.insert(unit.conv1.name().to_string(), input.clone());
                if let Some(shortcut) = &unit.shortcut {
                    seen.insert(shortcut.name().to_string(), input.clone());
                }
                let hidden = unit.conv1.forward(input)?;
                seen.insert(unit.conv2.name().to_string(), hidden);
                unit.forward(input)
            }
        }
    }

    fn module(&self) -> &dyn Module {
        match self {
            Stage::Block(block) => block,
            Stage::Pool(pool) => pool,
            Stage::Residual(unit) => unit,
        }
    }

    fn module_mut(&mut self) -> &mut dyn Module {
        match self {
            Stage::Block(block) => block,
            Stage::Pool(pool) => pool,
            Stage::Residual(unit) => unit,
        }
    }
}

struct Builder<'a> {
    config: &'a PassportConfig,
    scheme: Scheme,
    sign_loss_alpha: f32,
    claimed: BTreeSet<LayerPath>,
}

impl Builder<'_> {
    fn block(&mut self, name: String, spec: ConvSpec) -> PassportResult<ConvBlock> {
        let path: LayerPath = name.parse()?;
        let setting = self.config.setting(&path).cloned();
        self.claimed.insert(path);
        let kind = match &setting {
            Some(setting) if setting.carries_passport() => match self.scheme {
                Scheme::Keyed => AffineKind::Keyed,
                Scheme::Private => AffineKind::Private,
            },
            _ => AffineKind::Learned,
        };
        let mut block = ConvBlock::new(name, spec, kind, self.sign_loss_alpha)?;
        if let Some(LayerSetting::Message(message)) = setting {
            block.fix_signature(SignatureCodec::from_message(&message, spec.out_channels)?)?;
        }
        Ok(block)
    }

    fn finish(&self) -> PassportResult<()> {
        let unknown: Vec<String> = self
            .config
            .entries()
            .iter()
            .filter(|(path, _)| !self.claimed.contains(path))
            .map(|(path, _)| path.to_string())
            .collect();
        if !unknown.is_empty() {
            return Err(PassportError::config(format!(
                "passport configuration names unknown layers: {}",
                unknown.join(", ")
            )));
        }
        Ok(())
    }
}

fn scaled(width: usize, base_width: usize) -> usize {
    (width * base_width / 64).max(1)
}

/// Convolutional classifier whose blocks may carry passports.
#[derive(Debug)]
pub struct PassportNet {
    arch: Arch,
    geometry: ModelGeometry,
    stages: Vec<Stage>,
    pool: Option<GlobalAvgPool2d>,
    head: Linear,
    training: Cell<bool>,
    activations: RefCell<Option<Vec<Tensor>>>,
}

impl PassportNet {
    /// Builds `arch`, giving every block named in `config` a passport of the
    /// given `scheme`.
    pub fn build(
        arch: Arch,
        geometry: ModelGeometry,
        config: &PassportConfig,
        scheme: Scheme,
        sign_loss_alpha: f32,
    ) -> PassportResult<Self> {
        geometry.validate(arch)?;
        let mut builder = Builder {
            config,
            scheme,
            sign_loss_alpha,
            claimed: BTreeSet::new(),
        };
        let (stages, pool, head) = match arch {
            Arch::AlexNet => alexnet(&mut builder, &geometry)?,
            Arch::ResNet18 => resnet(&mut builder, &geometry, [2, 2, 2, 2])?,
            Arch::ResNet9 => resnet(&mut builder, &geometry, [1, 1, 1, 1])?,
        };
        builder.finish()?;
        let net = Self {
            arch,
            geometry,
            stages,
            pool,
            head,
            training: Cell::new(true),
            activations: RefCell::new(None),
        };
        info!(
            arch = %arch,
            blocks = net.blocks().len(),
            passports = net.passport_blocks().len(),
            scheme = ?scheme,
            "passport network built"
        );
        Ok(net)
    }

    /// Same backbone with ordinary learned normalisation everywhere.
    pub fn plain(arch: Arch, geometry: ModelGeometry) -> PassportResult<Self> {
        Self::build(arch, geometry, &PassportConfig::plain(), Scheme::Keyed, 0.0)
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn geometry(&self) -> ModelGeometry {
        self.geometry
    }

    pub fn is_training(&self) -> bool {
        self.training.get()
    }

    /// Every convolution block in forward order.
    pub fn blocks(&self) -> Vec<&ConvBlock> {
        self.stages.iter().flat_map(Stage::blocks).collect()
    }

    pub fn blocks_mut(&mut self) -> Vec<&mut ConvBlock> {
        self.stages.iter_mut().flat_map(Stage::blocks_mut).collect()
    }

    /// Passport-bearing blocks in forward order.
    pub fn passport_blocks(&self) -> Vec<&ConvBlock> {
        self.blocks()
            .into_iter()
            .filter(|block| block.state().is_some())
            .collect()
    }

    pub fn block(&self, name: &str) -> Option<&ConvBlock> {
        self.blocks().into_iter().find(|block| block.name() == name)
    }

    pub fn block_mut(&mut self, name: &str) -> Option<&mut ConvBlock> {
        self.blocks_mut()
            .into_iter()
            .find(|block| block.name() == name)
    }

    pub fn head(&self) -> &Linear {
        &self.head
    }

    /// Re-initialises the classifier head.
    pub fn reset_head(&mut self, seed: u64) -> PassportResult<()> {
        self.head.reset_parameters(seed)?;
        Ok(())
    }

    /// Activation entering each block when `input` is run in evaluation
    /// mode. Running statistics are left untouched.
    pub fn block_inputs(&self, input: &Tensor) -> PassportResult<HashMap<String, Tensor>> {
        let was_training = self.training.get();
        self.set_training(false);
        let mut seen = HashMap::new();
        let mut current = input.clone();
        let traced = self.stages.iter().try_for_each(|stage| {
            current = stage.trace(&current, &mut seen)?;
            Ok::<(), TensorError>(())
        });
        self.set_training(was_training);
        traced?;
        Ok(seen)
    }

    /// Sum of the sign losses accumulated since the last call.
    pub fn take_sign_loss(&self) -> f32 {
        self.blocks().iter().map(|block| block.take_sign_loss()).sum()
    }

    /// Mean sign-detection accuracy over passport blocks with a fixed
    /// signature, read from the current weights.
    pub fn signature_accuracy(&self) -> PassportResult<Option<f32>> {
        let mut layers = Vec::new();
        for block in self.passport_blocks() {
            if let Some(codec) = block.signature() {
                layers.push((codec, block.get_scale()?));
            }
        }
        Ok(detect_accuracy(
            layers.iter().map(|(codec, scale)| (codec, scale.as_slice())),
        )?)
    }

    /// Similarity each passport block observed on its latest forward pass.
    pub fn similarities(&self) -> Vec<(String, Option<f32>)> {
        self.passport_blocks()
            .into_iter()
            .map(|block| (block.name().to_string(), block.last_similarity()))
            .collect()
    }

    fn run(&self, input: &Tensor) -> PureResult<Vec<Tensor>> {
        let mut activations = vec![input.clone()];
        for stage in &self.stages {
            let next = stage.module().forward(&activations[activations.len() - 1])?;
            activations.push(next);
        }
        if let Some(pool) = &self.pool {
            let next = pool.forward(&activations[activations.len() - 1])?;
            activations.push(next);
        }
        Ok(activations)
    }
}

fn alexnet(
    builder: &mut Builder<'_>,
    geometry: &ModelGeometry,
) -> PassportResult<(Vec<Stage>, Option<GlobalAvgPool2d>, Linear)> {
    let w = |width| scaled(width, geometry.base_width);
    let mut hw = geometry.input_hw;
    let mut channels = geometry.in_channels;
    let mut stages = Vec::new();
    let layout: [(usize, Option<(usize, usize, usize)>); 8] = [
        (0, Some((w(64), 5, 2))),
        (1, None),
        (2, Some((w(192), 5, 2))),
        (3, None),
        (4, Some((w(384), 3, 1))),
        (5, Some((w(256), 3, 1))),
        (6, Some((w(256), 3, 1))),
        (7, None),
    ];
    for (index, conv) in layout {
        match conv {
            Some((out, kernel, padding)) => {
                let spec = ConvSpec::new(channels, out, kernel, 1, padding, hw);
                let block = builder.block(format!("features.{index}"), spec)?;
                hw = block.output_hw()?;
                channels = out;
                stages.push(Stage::Block(block));
            }
            None => {
                let pool = MaxPool2d::new(channels, (2, 2), (2, 2), hw)?;
                hw = pool.output_hw()?;
                stages.push(Stage::Pool(pool));
            }
        }
    }
    let head = Linear::new("classifier", channels * hw.0 * hw.1, geometry.num_classes)?;
    Ok((stages, None, head))
}

fn resnet(
    builder: &mut Builder<'_>,
    geometry: &ModelGeometry,
    depths: [usize; 4],
) -> PassportResult<(Vec<Stage>, Option<GlobalAvgPool2d>, Linear)> {
    let base = geometry.base_width;
    let stem = builder.block(
        "convbnrelu_1".to_string(),
        ConvSpec::new(geometry.in_channels, base, 3, 1, 1, geometry.input_hw),
    )?;
    let mut hw = stem.output_hw()?;
    let mut in_planes = base;
    let mut stages = vec![Stage::Block(stem)];
    for (layer, (depth, (mult, first_stride))) in depths
        .into_iter()
        .zip([(1, 1), (2, 2), (4, 2), (8, 2)])
        .enumerate()
    {
        let planes = base * mult;
        for index in 0..depth {
            let stride = if index == 0 { first_stride } else { 1 };
            let prefix = format!("layer{}.{index}", layer + 1);
            let conv1 = builder.block(
                format!("{prefix}.convbnrelu_1"),
                ConvSpec::new(in_planes, planes, 3, stride, 1, hw),
            )?;
            let out_hw = conv1.output_hw()?;
            let conv2 = builder.block(
                format!("{prefix}.convbnrelu_2"),
                ConvSpec::new(planes, planes, 3, 1, 1, out_hw).without_relu(),
            )?;
            let shortcut = if stride != 1 || in_planes != planes {
                Some(builder.block(
                    format!("{prefix}.shortcut"),
                    ConvSpec::new(in_planes, planes, 1, stride, 0, hw).without_relu(),
                )?)
            } else {
                None
            };
            stages.push(Stage::Residual(BasicBlock {
                conv1,
                conv2,
                shortcut,
                cache: RefCell::new(None),
            }));
            hw = out_hw;
            in_planes = planes;
        }
    }
    let pool = GlobalAvgPool2d::new(in_planes, hw)?;
    let head = Linear::new("linear", in_planes, geometry.num_classes)?;
    Ok((stages, Some(pool), head))
}

impl Module for PassportNet {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let activations = self.run(input)?;
        let logits = self.head.forward(&activations[activations.len() - 1])?;
        *self.activations.borrow_mut() = Some(activations);
        Ok(logits)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let activations = match self.activations.borrow_mut().take() {
            Some(cached) if cached.first() == Some(input) => cached,
            _ => {
                return Err(TensorError::InvalidValue {
                    label: "passport_net_backward_without_matching_forward",
                })
            }
        };
        let mut position = activations.len() - 1;
        let mut grad = self.head.backward(&activations[position], grad_output)?;
        if let Some(pool) = &mut self.pool {
            position -= 1;
            grad = pool.backward(&activations[position], &grad)?;
        }
        for stage in self.stages.iter_mut().rev() {
            position -= 1;
            grad = stage.module_mut().backward(&activations[position], &grad)?;
        }
        Ok(grad)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for stage in &self.stages {
            stage.module().visit_parameters(visitor)?;
        }
        self.head.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for stage in &mut self.stages {
            stage.module_mut().visit_parameters_mut(visitor)?;
        }
        self.head.visit_parameters_mut(visitor)
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
        for stage in &self.stages {
            stage.module().set_training(training);
        }
    }

    fn buffers(&self) -> HashMap<String, Tensor> {
        let mut buffers = HashMap::new();
        for stage in &self.stages {
            buffers.extend(stage.module().buffers());
        }
        buffers
    }

    fn load_buffers(&mut self, buffers: &HashMap<String, Tensor>) -> PureResult<()> {
        for stage in &mut self.stages {
            stage.module_mut().load_buffers(buffers)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::PassportState;
    use serde_json::json;

    fn small() -> ModelGeometry {
        ModelGeometry {
            in_channels: 1,
            num_classes: 3,
            input_hw: (8, 8),
            base_width: 4,
        }
    }

    #[test]
    fn alexnet_resolves_feature_paths() {
        let config = PassportConfig::from_value(&json!({
            "features": {"0": true, "2": false, "4": "owner"}
        }))
        .unwrap();
        let net = PassportNet::build(Arch::AlexNet, small(), &config, Scheme::Keyed, 0.0).unwrap();
        let names: Vec<&str> = net.passport_blocks().iter().map(|b| b.name()).collect();
        assert_eq!(names, vec!["features.0", "features.4"]);
        assert_eq!(net.blocks().len(), 5);
        assert_eq!(
            net.block("features.4").unwrap().state(),
            Some(PassportState::Uninitialized)
        );
        assert!(net.block("features.4").unwrap().signature().is_some());
    }

    #[test]
    fn unknown_path_is_a_configuration_error() {
        let config = PassportConfig::from_value(&json!({"features": {"1": true}})).unwrap();
        let err = PassportNet::build(Arch::AlexNet, small(), &config, Scheme::Keyed, 0.0)
            .unwrap_err();
        assert!(matches!(err, PassportError::Configuration(_)));
    }

    #[test]
    fn resnet_names_follow_layer_paths() {
        let config = PassportConfig::from_value(&json!({
            "layer2": {"0": {"convbnrelu_1": true, "shortcut": true}}
        }))
        .unwrap();
        let net = PassportNet::build(Arch::ResNet9, small(), &config, Scheme::Private, 0.1).unwrap();
        let names: Vec<&str> = net.passport_blocks().iter().map(|b| b.name()).collect();
        assert_eq!(names, vec!["layer2.0.convbnrelu_1", "layer2.0.shortcut"]);
        assert!(net.block("layer1.0.shortcut").is_none());
        assert_eq!(net.head().output_dim(), 3);
    }

    #[test]
    fn backward_reaches_every_parameter() {
        let mut net = PassportNet::plain(Arch::ResNet9, small()).unwrap();
        let input = Tensor::random_normal(2, 64, 0.0, 1.0, Some(1)).unwrap();
        let logits = net.forward(&input).unwrap();
        assert_eq!(logits.shape(), (2, 3));
        let grad = net
            .backward(&input, &Tensor::full(2, 3, 0.5).unwrap())
            .unwrap();
        assert_eq!(grad.shape(), input.shape());
        net.visit_parameters(&mut |param| {
            assert!(param.gradient().is_some(), "{} has no gradient", param.name());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn backward_needs_the_matching_forward() {
        let mut net = PassportNet::plain(Arch::AlexNet, small()).unwrap();
        let input = Tensor::random_normal(2, 64, 0.0, 1.0, Some(3)).unwrap();
        let grad = Tensor::full(2, 3, 0.5).unwrap();
        assert!(matches!(
            net.backward(&input, &grad),
            Err(TensorError::InvalidValue { .. })
        ));

        let other = Tensor::random_normal(2, 64, 0.0, 1.0, Some(4)).unwrap();
        net.forward(&other).unwrap();
        assert!(net.backward(&input, &grad).is_err());
        net.forward(&input).unwrap();
        assert!(net.backward(&input, &grad).is_ok());
    }

    #[test]
    fn block_inputs_match_block_geometry() {
        let net = PassportNet::plain(Arch::AlexNet, small()).unwrap();
        let input = Tensor::random_normal(3, 64, 0.0, 1.0, Some(2)).unwrap();
        let traced = net.block_inputs(&input).unwrap();
        assert!(net.is_training());
        for block in net.blocks() {
            let seen = &traced[block.name()];
            assert_eq!(seen.shape(), (3, block.input_features()));
        }
    }
}
