// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Weight transplants between passport networks and their plain twins.
//!
//! [`copy_strict`] demands identical parameter sets. [`copy_compatible`]
//! copies the subset both sides share (convolution weights, head, running
//! statistics) and rebuilds learned affine parameters from the derived
//! scale and bias only when the caller asks for it.

use crate::error::{PassportError, PassportResult};
use crate::models::PassportNet;
use sp_nn::{Module, Tensor};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// Whether [`copy_compatible`] rebuilds the `gamma`/`beta` of plain target
/// blocks from the scale and bias their source block derives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AffineReconstruction {
    Reconstruct,
    Skip,
}

/// What a transplant touched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// Parameters copied by name.
    pub copied: Vec<String>,
    /// Blocks whose affine parameters were rebuilt from derived values.
    pub reconstructed: Vec<String>,
    /// Target parameters left at their current value.
    pub skipped: Vec<String>,
}

/// Copies every parameter and buffer of `source` into `target`, which must
/// hold exactly the same parameter names.
pub fn copy_strict<S, T>(source: &S, target: &mut T) -> PassportResult<TransferReport>
where
    S: Module + ?Sized,
    T: Module + ?Sized,
{
    let state = source.state_dict()?;
    let expected = target.state_dict()?;
    let source_names: BTreeSet<&String> = state.keys().collect();
    let target_names: BTreeSet<&String> = expected.keys().collect();
    if source_names != target_names {
        return Err(PassportError::StateDictMismatch {
            missing: target_names
                .difference(&source_names)
                .map(|name| name.to_string())
                .collect(),
            unexpected: source_names
                .difference(&target_names)
                .map(|name| name.to_string())
                .collect(),
        });
    }
    target.load_state_dict(&state)?;
    target.load_buffers(&source.buffers())?;
    Ok(TransferReport {
        copied: source_names.into_iter().cloned().collect(),
        ..TransferReport::default()
    })
}

/// Copies the parameters `source` and `target` share by name and shape,
/// plus the running statistics, leaving everything else in place.
pub fn copy_compatible(
    source: &PassportNet,
    target: &mut PassportNet,
    affine: AffineReconstruction,
) -> PassportResult<TransferReport> {
    let state: HashMap<String, Tensor> = source.state_dict()?;
    let mut report = TransferReport::default();
    target.visit_parameters_mut(&mut |param| {
        match state.get(param.name()) {
            Some(value) if value.shape() == param.value().shape() => {
                param.load_value(value)?;
                report.copied.push(param.name().to_string());
            }
            _ => report.skipped.push(param.name().to_string()),
        }
        Ok(())
    })?;
    target.load_buffers(&running_statistics(source))?;

    if affine == AffineReconstruction::Reconstruct {
        for block in target.blocks_mut() {
            if block.capabilities().provides_affine_params {
                continue;
            }
            let Some(origin) = source.block(block.name()) else {
                continue;
            };
            if !origin.capabilities().provides_affine_params {
                continue;
            }
            let params = origin.affine_params()?;
            block.load_affine(&params.scale, &params.bias)?;
            report.reconstructed.push(block.name().to_string());
        }
        let rebuilt: BTreeSet<&str> = report.reconstructed.iter().map(String::as_str).collect();
        report.skipped.retain(|name| {
            name.rsplit_once(".bn::")
                .map_or(true, |(block, _)| !rebuilt.contains(block))
        });
    }
    debug!(
        copied = report.copied.len(),
        reconstructed = report.reconstructed.len(),
        skipped = report.skipped.len(),
        "compatible transfer finished"
    );
    Ok(report)
}

fn running_statistics(source: &PassportNet) -> HashMap<String, Tensor> {
    source
        .buffers()
        .into_iter()
        .filter(|(name, _)| name.ends_with("::running_mean") || name.ends_with("::running_var"))
        .collect()
}

/// Plain twin of `source`. An exact copy is tried first; when the parameter
/// sets differ (any passport block) the compatible subset is copied and the
/// twin's `gamma`/`beta` are rebuilt from `get_scale`/`get_bias`.
pub fn clone_plain(source: &PassportNet) -> PassportResult<(PassportNet, TransferReport)> {
    let mut plain = PassportNet::plain(source.arch(), source.geometry())?;
    match copy_strict(source, &mut plain) {
        Ok(report) => Ok((plain, report)),
        Err(PassportError::StateDictMismatch {
            missing,
            unexpected,
        }) => {
            warn!(
                missing = missing.len(),
                unexpected = unexpected.len(),
                "parameter sets differ; copying the compatible subset and rebuilding affine parameters"
            );
            let report = copy_compatible(source, &mut plain, AffineReconstruction::Reconstruct)?;
            Ok((plain, report))
        }
        Err(err) => Err(err),
    }
}

/// Copies weights fine-tuned on a plain twin back into the passport network.
/// Keys and signatures of the passport network are untouched.
pub fn sync_back(plain: &PassportNet, passport: &mut PassportNet) -> PassportResult<TransferReport> {
    copy_compatible(plain, passport, AffineReconstruction::Skip)
}
