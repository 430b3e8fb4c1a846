// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::Module;
use crate::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredTensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl StoredTensor {
    fn from_tensor(tensor: &Tensor) -> StoredTensor {
        StoredTensor {
            rows: tensor.shape().0,
            cols: tensor.shape().1,
            data: tensor.data().to_vec(),
        }
    }

    fn into_tensor(self) -> PureResult<Tensor> {
        Tensor::from_vec(self.rows, self.cols, self.data)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ModuleSnapshot {
    parameters: HashMap<String, StoredTensor>,
    #[serde(default)]
    buffers: HashMap<String, StoredTensor>,
}

/// Trainable parameters and non-trainable buffers of a module, keyed by
/// canonical name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModuleState {
    pub parameters: HashMap<String, Tensor>,
    pub buffers: HashMap<String, Tensor>,
}

impl ModuleState {
    /// Copies the current parameters and buffers of `module`.
    pub fn capture<M: Module + ?Sized>(module: &M) -> PureResult<Self> {
        Ok(Self {
            parameters: module.state_dict()?,
            buffers: module.buffers(),
        })
    }

    /// Restores the state into `module`. Every parameter must be present.
    pub fn apply<M: Module + ?Sized>(&self, module: &mut M) -> PureResult<()> {
        module.load_state_dict(&self.parameters)?;
        module.load_buffers(&self.buffers)
    }

    fn to_snapshot(&self) -> ModuleSnapshot {
        let store = |map: &HashMap<String, Tensor>| {
            map.iter()
                .map(|(name, tensor)| (name.clone(), StoredTensor::from_tensor(tensor)))
                .collect()
        };
        ModuleSnapshot {
            parameters: store(&self.parameters),
            buffers: store(&self.buffers),
        }
    }

    fn from_snapshot(snapshot: ModuleSnapshot) -> PureResult<Self> {
        let load = |map: HashMap<String, StoredTensor>| -> PureResult<HashMap<String, Tensor>> {
            map.into_iter()
                .map(|(name, stored)| Ok((name, stored.into_tensor()?)))
                .collect()
        };
        Ok(Self {
            parameters: load(snapshot.parameters)?,
            buffers: load(snapshot.buffers)?,
        })
    }
}

fn io_error(err: std::io::Error) -> TensorError {
    TensorError::IoError {
        message: err.to_string(),
    }
}

fn serde_error(err: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: err.to_string(),
    }
}

/// Writes through a sibling temporary file and renames it into place, so a
/// crash never leaves a truncated checkpoint behind.
fn write_atomic<P, F>(path: P, write: F) -> PureResult<()>
where
    P: AsRef<Path>,
    F: FnOnce(&mut BufWriter<&mut File>) -> PureResult<()>,
{
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(io_error)?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_error)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        write(&mut writer)?;
        writer.flush().map_err(io_error)?;
    }
    tmp.persist(path).map_err(|err| io_error(err.error))?;
    Ok(())
}

pub fn save_state_json<P: AsRef<Path>>(state: &ModuleState, path: P) -> PureResult<()> {
    let snapshot = state.to_snapshot();
    write_atomic(path, |writer| {
        serde_json::to_writer_pretty(writer, &snapshot).map_err(serde_error)
    })
}

pub fn load_state_json<P: AsRef<Path>>(path: P) -> PureResult<ModuleState> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let snapshot: ModuleSnapshot =
        serde_json::from_reader(BufReader::new(file)).map_err(serde_error)?;
    ModuleState::from_snapshot(snapshot)
}

pub fn save_state_bincode<P: AsRef<Path>>(state: &ModuleState, path: P) -> PureResult<()> {
    let snapshot = state.to_snapshot();
    write_atomic(path, |writer| {
        bincode::serialize_into(writer, &snapshot).map_err(serde_error)
    })
}

pub fn load_state_bincode<P: AsRef<Path>>(path: P) -> PureResult<ModuleState> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let snapshot: ModuleSnapshot =
        bincode::deserialize_from(BufReader::new(file)).map_err(serde_error)?;
    ModuleState::from_snapshot(snapshot)
}

pub fn save_json<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    save_state_json(&ModuleState::capture(module)?, path)
}

pub fn load_json<M: Module + ?Sized, P: AsRef<Path>>(module: &mut M, path: P) -> PureResult<()> {
    load_state_json(path)?.apply(module)
}

pub fn save_bincode<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    save_state_bincode(&ModuleState::capture(module)?, path)
}

pub fn load_bincode<M: Module + ?Sized, P: AsRef<Path>>(
    module: &mut M,
    path: P,
) -> PureResult<()> {
    load_state_bincode(path)?.apply(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::linear::Linear;
    use crate::layers::normalization::BatchNorm2d;
    use tempfile::tempdir;

    fn model(name: &str) -> BatchNorm2d {
        BatchNorm2d::new(format!("{name}.bn"), 2, (1, 1), 0.5, 1e-5, true).unwrap()
    }

    #[test]
    fn save_and_load_roundtrip_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.json");
        let source = model("net");
        source
            .forward(&Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 5.0]).unwrap())
            .unwrap();
        save_json(&source, &path).unwrap();
        let mut restored = model("net");
        restored.set_trainable(false).unwrap();
        load_json(&mut restored, &path).unwrap();
        assert_eq!(
            ModuleState::capture(&restored).unwrap(),
            ModuleState::capture(&source).unwrap()
        );
    }

    #[test]
    fn bincode_roundtrip_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/ckpt/last.bin");
        let source = Linear::new("fc", 3, 2).unwrap();
        save_bincode(&source, &path).unwrap();
        let state = load_state_bincode(&path).unwrap();
        assert_eq!(state.parameters, source.state_dict().unwrap());
        assert!(state.buffers.is_empty());
    }

    #[test]
    fn missing_parameter_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fc.json");
        save_json(&Linear::new("fc", 2, 2).unwrap(), &path).unwrap();
        let mut other = Linear::new("other", 2, 2).unwrap();
        let err = load_json(&mut other, &path).unwrap_err();
        assert!(matches!(err, TensorError::MissingParameter { .. }));
    }
}
