// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Experiment, attack and passport-layout configuration.
//!
//! The passport layout is a nested JSON mapping such as
//! `{"layer1": {"0": {"convbnrelu_1": true}}}`. It is parsed once into typed
//! [`LayerPath`]s; the model builder resolves every path against its own
//! block names and rejects the unknown ones, so nothing downstream walks the
//! network by string lookup.

use crate::error::{PassportError, PassportResult};
use crate::keys::KeyMode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Backbone families a passport network can be built from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Arch {
    AlexNet,
    ResNet18,
    ResNet9,
}

impl Arch {
    pub fn as_str(self) -> &'static str {
        match self {
            Arch::AlexNet => "alexnet",
            Arch::ResNet18 => "resnet18",
            Arch::ResNet9 => "resnet9",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = PassportError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "alexnet" => Ok(Arch::AlexNet),
            "resnet18" => Ok(Arch::ResNet18),
            "resnet9" => Ok(Arch::ResNet9),
            other => Err(PassportError::config(format!(
                "unknown architecture tag `{other}` (expected alexnet, resnet18 or resnet9)"
            ))),
        }
    }
}

impl TryFrom<String> for Arch {
    type Error = PassportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Arch> for String {
    fn from(arch: Arch) -> Self {
        arch.as_str().to_string()
    }
}

/// Which passport variant configured layers receive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Scale and bias come from the key alone.
    #[default]
    Keyed,
    /// The keyed pair is fused with a learned private pair.
    Private,
}

impl Scheme {
    /// Numeric tag used in checkpoint file names.
    pub fn tag(self) -> u8 {
        match self {
            Scheme::Keyed => 1,
            Scheme::Private => 2,
        }
    }
}

/// Input and width geometry shared by the passport network and its plain twin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelGeometry {
    pub in_channels: usize,
    pub num_classes: usize,
    pub input_hw: (usize, usize),
    /// Width of the first stage. Every other width scales with it, 64 gives
    /// the reference AlexNet/ResNet sizes.
    pub base_width: usize,
}

impl Default for ModelGeometry {
    fn default() -> Self {
        Self {
            in_channels: 3,
            num_classes: 10,
            input_hw: (32, 32),
            base_width: 64,
        }
    }
}

impl ModelGeometry {
    /// Columns of one flattened input sample.
    pub fn input_features(&self) -> usize {
        self.in_channels * self.input_hw.0 * self.input_hw.1
    }

    pub fn validate(&self, arch: Arch) -> PassportResult<()> {
        for (label, value) in [
            ("in_channels", self.in_channels),
            ("num_classes", self.num_classes),
            ("input height", self.input_hw.0),
            ("input width", self.input_hw.1),
            ("base_width", self.base_width),
        ] {
            if value == 0 {
                return Err(PassportError::config(format!("{label} must be positive")));
            }
        }
        if arch == Arch::AlexNet && (self.input_hw.0 < 8 || self.input_hw.1 < 8) {
            return Err(PassportError::config(format!(
                "alexnet needs inputs of at least 8x8, got {}x{}",
                self.input_hw.0, self.input_hw.1
            )));
        }
        Ok(())
    }
}

/// One step of a [`LayerPath`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathSegment {
    /// A named child such as `layer1` or `convbnrelu_2`.
    Named(String),
    /// A position inside a sequential container.
    Sequential(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Named(name) => f.write_str(name),
            PathSegment::Sequential(index) => write!(f, "{index}"),
        }
    }
}

impl FromStr for PathSegment {
    type Err = PassportError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.is_empty() {
            return Err(PassportError::config("empty layer path segment"));
        }
        if let Ok(index) = raw.parse::<usize>() {
            return Ok(PathSegment::Sequential(index));
        }
        if raw.contains('.') {
            return Err(PassportError::config(format!(
                "layer path segment `{raw}` must not contain '.'"
            )));
        }
        Ok(PathSegment::Named(raw.to_string()))
    }
}

/// Typed address of a convolution block, e.g. `layer1.0.convbnrelu_1`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerPath(Vec<PathSegment>);

impl LayerPath {
    pub fn new(segments: Vec<PathSegment>) -> PassportResult<Self> {
        if segments.is_empty() {
            return Err(PassportError::config("layer path must not be empty"));
        }
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }
}

impl fmt::Display for LayerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, segment) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(".")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for LayerPath {
    type Err = PassportError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let segments = raw
            .split('.')
            .map(PathSegment::from_str)
            .collect::<PassportResult<Vec<_>>>()?;
        LayerPath::new(segments)
    }
}

/// Leaf value of the passport layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LayerSetting {
    /// Ordinary learned affine normalisation.
    Plain,
    /// Passport layer whose ground-truth signature is fixed on the first
    /// forward pass after its key is bound.
    Passport,
    /// Passport layer whose ground truth is the bit pattern of an ownership message.
    Message(String),
}

impl LayerSetting {
    pub fn carries_passport(&self) -> bool {
        !matches!(self, LayerSetting::Plain)
    }
}

/// Parsed passport layout: which blocks carry a passport, in the order the
/// JSON document lists them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct PassportConfig {
    entries: Vec<(LayerPath, LayerSetting)>,
}

impl PassportConfig {
    /// Layout without any passport layer, used for plain twins.
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn from_value(value: &Value) -> PassportResult<Self> {
        let Value::Object(map) = value else {
            return Err(PassportError::config(
                "passport configuration must be a JSON object",
            ));
        };
        if map.is_empty() {
            return Err(PassportError::config("empty passport configuration"));
        }
        let mut entries = Vec::new();
        walk(&mut Vec::new(), map, &mut entries)?;
        Ok(Self { entries })
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> PassportResult<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_value(&serde_json::from_str(&raw)?)
    }

    /// Adds or replaces the setting of one block.
    pub fn with(mut self, path: LayerPath, setting: LayerSetting) -> Self {
        match self.entries.iter_mut().find(|(p, _)| *p == path) {
            Some(entry) => entry.1 = setting,
            None => self.entries.push((path, setting)),
        }
        self
    }

    pub fn entries(&self) -> &[(LayerPath, LayerSetting)] {
        &self.entries
    }

    pub fn setting(&self, path: &LayerPath) -> Option<&LayerSetting> {
        self.entries
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, setting)| setting)
    }

    /// Paths of passport-bearing blocks, in layout order.
    pub fn passport_paths(&self) -> impl Iterator<Item = &LayerPath> + '_ {
        self.entries
            .iter()
            .filter(|(_, setting)| setting.carries_passport())
            .map(|(path, _)| path)
    }

    pub fn has_passports(&self) -> bool {
        self.passport_paths().next().is_some()
    }

    pub fn to_value(&self) -> Value {
        let mut root = Map::new();
        for (path, setting) in &self.entries {
            let leaf = match setting {
                LayerSetting::Plain => Value::Bool(false),
                LayerSetting::Passport => Value::Bool(true),
                LayerSetting::Message(message) => Value::String(message.clone()),
            };
            insert_nested(&mut root, path.segments(), leaf);
        }
        Value::Object(root)
    }
}

fn walk(
    prefix: &mut Vec<PathSegment>,
    map: &Map<String, Value>,
    out: &mut Vec<(LayerPath, LayerSetting)>,
) -> PassportResult<()> {
    for (key, value) in map {
        prefix.push(key.parse()?);
        match value {
            Value::Object(children) if !children.is_empty() => walk(prefix, children, out)?,
            Value::Bool(flag) => {
                let setting = if *flag {
                    LayerSetting::Passport
                } else {
                    LayerSetting::Plain
                };
                out.push((LayerPath::new(prefix.clone())?, setting));
            }
            Value::String(message) if !message.is_empty() => {
                out.push((
                    LayerPath::new(prefix.clone())?,
                    LayerSetting::Message(message.clone()),
                ));
            }
            other => {
                return Err(PassportError::config(format!(
                    "unsupported passport setting at `{}`: {other}",
                    LayerPath(prefix.clone())
                )))
            }
        }
        prefix.pop();
    }
    Ok(())
}

fn insert_nested(node: &mut Map<String, Value>, segments: &[PathSegment], leaf: Value) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    let key = head.to_string();
    if rest.is_empty() {
        node.insert(key, leaf);
        return;
    }
    let child = node
        .entry(key)
        .or_insert_with(|| Value::Object(Map::new()));
    if !child.is_object() {
        *child = Value::Object(Map::new());
    }
    if let Value::Object(child) = child {
        insert_nested(child, rest, leaf);
    }
}

impl TryFrom<Value> for PassportConfig {
    type Error = PassportError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        PassportConfig::from_value(&value)
    }
}

impl From<PassportConfig> for Value {
    fn from(config: PassportConfig) -> Self {
        config.to_value()
    }
}

fn default_epochs() -> usize {
    100
}

fn default_batch_size() -> usize {
    64
}

fn default_lr() -> f32 {
    0.01
}

fn default_momentum() -> f32 {
    0.9
}

fn default_train_decay() -> f32 {
    1e-4
}

fn default_attack_decay() -> f32 {
    5e-4
}

fn default_sign_loss_alpha() -> f32 {
    0.1
}

fn default_flip_fraction() -> f64 {
    0.5
}

fn default_experiment_logdir() -> PathBuf {
    PathBuf::from("logs/passport")
}

fn default_attack_logdir() -> PathBuf {
    PathBuf::from("logs/passport_attack_2")
}

fn default_tag() -> String {
    "1".to_string()
}

fn validate_optimiser(lr: f32, momentum: f32, weight_decay: f32, batch: usize) -> PassportResult<()> {
    if batch == 0 {
        return Err(PassportError::config("batch_size must be positive"));
    }
    for (label, value) in [("lr", lr), ("momentum", momentum), ("weight_decay", weight_decay)] {
        if !value.is_finite() || value < 0.0 {
            return Err(PassportError::config(format!(
                "{label} must be finite and non-negative, got {value}"
            )));
        }
    }
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> PassportResult<T> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Settings of one passport training run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub arch: Arch,
    #[serde(flatten)]
    pub geometry: ModelGeometry,
    #[serde(default)]
    pub scheme: Scheme,
    #[serde(default)]
    pub key_type: KeyMode,
    pub passport_config: PassportConfig,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_lr")]
    pub lr: f32,
    #[serde(default = "default_momentum")]
    pub momentum: f32,
    #[serde(default = "default_train_decay")]
    pub weight_decay: f32,
    /// Weight of the sign hinge loss pulling scales toward their ground truth.
    #[serde(default = "default_sign_loss_alpha")]
    pub sign_loss_alpha: f32,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_experiment_logdir")]
    pub logdir: PathBuf,
    /// Write an `epoch-N` checkpoint every `save_interval` epochs; 0 disables it.
    #[serde(default)]
    pub save_interval: usize,
    #[serde(default)]
    pub train_backdoor: bool,
    #[serde(default)]
    pub use_trigger_as_passport: bool,
}

impl ExperimentConfig {
    /// Minimal configuration with defaults for everything but the layout.
    pub fn new(arch: Arch, passport_config: PassportConfig) -> Self {
        Self {
            arch,
            geometry: ModelGeometry::default(),
            scheme: Scheme::default(),
            key_type: KeyMode::default(),
            passport_config,
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            lr: default_lr(),
            momentum: default_momentum(),
            weight_decay: default_train_decay(),
            sign_loss_alpha: default_sign_loss_alpha(),
            seed: None,
            logdir: default_experiment_logdir(),
            save_interval: 0,
            train_backdoor: false,
            use_trigger_as_passport: false,
        }
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> PassportResult<Self> {
        let config: Self = read_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PassportResult<()> {
        self.geometry.validate(self.arch)?;
        if !self.passport_config.has_passports() {
            return Err(PassportError::config(
                "empty passport configuration: no layer carries a passport",
            ));
        }
        validate_optimiser(self.lr, self.momentum, self.weight_decay, self.batch_size)?;
        if !self.sign_loss_alpha.is_finite() || self.sign_loss_alpha < 0.0 {
            return Err(PassportError::config("sign_loss_alpha must be non-negative"));
        }
        Ok(())
    }
}

/// Settings of one bit-flip attack run against a trained passport checkpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttackConfig {
    /// Checkpoint of the passport model under attack.
    pub loadpath: PathBuf,
    pub arch: Arch,
    #[serde(flatten)]
    pub geometry: ModelGeometry,
    #[serde(default)]
    pub scheme: Scheme,
    pub passport_config: PassportConfig,
    /// Fraction of the global signature bits whose sign gets flipped.
    #[serde(default = "default_flip_fraction")]
    pub flip_fraction: f64,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_lr")]
    pub lr: f32,
    #[serde(default = "default_momentum")]
    pub momentum: f32,
    #[serde(default = "default_attack_decay")]
    pub weight_decay: f32,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_attack_logdir")]
    pub logdir: PathBuf,
    #[serde(default = "default_tag")]
    pub tag: String,
}

impl AttackConfig {
    pub fn new(loadpath: impl Into<PathBuf>, arch: Arch, passport_config: PassportConfig) -> Self {
        Self {
            loadpath: loadpath.into(),
            arch,
            geometry: ModelGeometry::default(),
            scheme: Scheme::default(),
            passport_config,
            flip_fraction: default_flip_fraction(),
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            lr: default_lr(),
            momentum: default_momentum(),
            weight_decay: default_attack_decay(),
            seed: None,
            logdir: default_attack_logdir(),
            tag: default_tag(),
        }
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> PassportResult<Self> {
        let config: Self = read_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PassportResult<()> {
        self.geometry.validate(self.arch)?;
        if !self.passport_config.has_passports() {
            return Err(PassportError::config(
                "empty passport configuration: nothing to attack",
            ));
        }
        validate_fraction(self.flip_fraction)?;
        validate_optimiser(self.lr, self.momentum, self.weight_decay, self.batch_size)
    }
}

pub(crate) fn validate_fraction(fraction: f64) -> PassportResult<()> {
    if !(0.0..=1.0).contains(&fraction) {
        return Err(PassportError::config(format!(
            "flip fraction must lie in [0, 1], got {fraction}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_layout_parses_into_typed_paths() {
        let value = json!({
            "convbnrelu_1": true,
            "layer1": {"0": {"convbnrelu_1": "owner", "convbnrelu_2": false}},
        });
        let config = PassportConfig::from_value(&value).unwrap();
        let passports: Vec<String> = config.passport_paths().map(|p| p.to_string()).collect();
        assert_eq!(passports, vec!["convbnrelu_1", "layer1.0.convbnrelu_1"]);
        let path: LayerPath = "layer1.0.convbnrelu_1".parse().unwrap();
        assert_eq!(
            path.segments(),
            &[
                PathSegment::Named("layer1".into()),
                PathSegment::Sequential(0),
                PathSegment::Named("convbnrelu_1".into()),
            ]
        );
        assert_eq!(
            config.setting(&path),
            Some(&LayerSetting::Message("owner".into()))
        );
        assert_eq!(PassportConfig::from_value(&config.to_value()).unwrap(), config);
    }

    #[test]
    fn layout_keeps_document_order() {
        let value: Value =
            serde_json::from_str(r#"{"features": {"10": true, "2": true, "0": "owner"}}"#).unwrap();
        let config = PassportConfig::from_value(&value).unwrap();
        let passports: Vec<String> = config.passport_paths().map(|p| p.to_string()).collect();
        assert_eq!(passports, vec!["features.10", "features.2", "features.0"]);
        assert_eq!(PassportConfig::from_value(&config.to_value()).unwrap(), config);
    }

    #[test]
    fn empty_or_malformed_layouts_are_rejected() {
        assert!(matches!(
            PassportConfig::from_value(&json!({})),
            Err(PassportError::Configuration(_))
        ));
        assert!(matches!(
            PassportConfig::from_value(&json!({"0": 3})),
            Err(PassportError::Configuration(_))
        ));
    }

    #[test]
    fn unknown_arch_is_a_configuration_error() {
        assert!(matches!(
            "vgg16".parse::<Arch>(),
            Err(PassportError::Configuration(_))
        ));
        assert_eq!("resnet9".parse::<Arch>().unwrap(), Arch::ResNet9);
    }

    #[test]
    fn attack_fraction_is_bounded() {
        let layout = PassportConfig::plain().with("0".parse().unwrap(), LayerSetting::Passport);
        let mut config = AttackConfig::new("model.bin", Arch::AlexNet, layout);
        config.validate().unwrap();
        config.flip_fraction = 1.5;
        assert!(matches!(config.validate(), Err(PassportError::Configuration(_))));
    }

    #[test]
    fn experiment_config_reads_flattened_geometry() {
        let raw = json!({
            "arch": "resnet9",
            "in_channels": 1,
            "num_classes": 4,
            "input_hw": [8, 8],
            "base_width": 4,
            "scheme": "private",
            "key_type": "shuffle",
            "passport_config": {"layer1": {"0": {"convbnrelu_2": true}}},
            "epochs": 2,
        });
        let config: ExperimentConfig = serde_json::from_value(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.geometry.input_hw, (8, 8));
        assert_eq!(config.scheme, Scheme::Private);
        assert_eq!(config.key_type, KeyMode::Shuffle);
        assert_eq!(config.batch_size, 64);

        let empty = ExperimentConfig::new(Arch::AlexNet, PassportConfig::plain());
        assert!(matches!(empty.validate(), Err(PassportError::Configuration(_))));
    }
}
