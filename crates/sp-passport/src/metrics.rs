// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::PassportResult;
use serde::{Deserialize, Serialize};
use sp_nn::{save_bincode, Module};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

const HISTORY_FILE: &str = "history.jsonl";

/// Named scalar metrics of one step, ordered by name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metrics(BTreeMap<String, f32>);

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f32) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        self.0.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> + '_ {
        self.0.iter().map(|(name, value)| (name.as_str(), *value))
    }

    /// Same values under `prefix` + name, e.g. `valid_acc`.
    pub fn prefixed(&self, prefix: &str) -> Metrics {
        Metrics(
            self.0
                .iter()
                .map(|(name, value)| (format!("{prefix}{name}"), *value))
                .collect(),
        )
    }

    pub fn extend(&mut self, other: Metrics) {
        self.0.extend(other.0);
    }
}

/// One line of the run history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub epoch: usize,
    #[serde(flatten)]
    pub metrics: Metrics,
}

/// Mutable state of a training or attack run: current epoch, best
/// validation accuracy and the history written so far.
///
/// History goes to `history.jsonl`, one record per line, and checkpoints to
/// `models/<label>.bin`. Checkpoints are written to a temporary sibling and
/// renamed, so an interrupted run keeps its previous checkpoint intact.
#[derive(Debug)]
pub struct RunContext {
    logdir: PathBuf,
    epoch: usize,
    best_acc: f32,
    history: Vec<HistoryRecord>,
}

impl RunContext {
    /// Opens a fresh run under `logdir`. A history left by an earlier run in
    /// the same directory is truncated; its checkpoints are kept until
    /// overwritten.
    pub fn new(logdir: impl Into<PathBuf>) -> PassportResult<Self> {
        let logdir = logdir.into();
        fs::create_dir_all(logdir.join("models"))?;
        File::create(logdir.join(HISTORY_FILE))?;
        Ok(Self {
            logdir,
            epoch: 0,
            best_acc: f32::NEG_INFINITY,
            history: Vec::new(),
        })
    }

    pub fn logdir(&self) -> &Path {
        &self.logdir
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn best_acc(&self) -> f32 {
        self.best_acc
    }

    pub fn history(&self) -> &[HistoryRecord] {
        &self.history
    }

    pub fn history_path(&self) -> PathBuf {
        self.logdir.join(HISTORY_FILE)
    }

    pub fn checkpoint_path(&self, label: &str) -> PathBuf {
        self.logdir.join("models").join(format!("{label}.bin"))
    }

    /// Appends `metrics` for `epoch` to the in-memory and on-disk history.
    pub fn record(&mut self, epoch: usize, metrics: Metrics) -> PassportResult<()> {
        let record = HistoryRecord { epoch, metrics };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path())?;
        file.write_all(line.as_bytes())?;
        self.epoch = epoch;
        self.history.push(record);
        Ok(())
    }

    /// Tracks the best accuracy; `true` when `acc` improves on it.
    pub fn observe_accuracy(&mut self, acc: f32) -> bool {
        if acc > self.best_acc {
            info!(epoch = self.epoch, acc, previous = self.best_acc, "new best accuracy");
            self.best_acc = acc;
            return true;
        }
        false
    }

    pub fn save_checkpoint<M: Module + ?Sized>(&self, model: &M, label: &str) -> PassportResult<PathBuf> {
        let path = self.checkpoint_path(label);
        save_bincode(model, &path)?;
        Ok(path)
    }
}

/// Reads a history file written by [`RunContext::record`].
pub fn load_history(path: impl AsRef<Path>) -> PassportResult<Vec<HistoryRecord>> {
    let raw = fs::read_to_string(path)?;
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| Ok(serde_json::from_str(line)?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn prefixes_compose_split_names() {
        let mut metrics = Metrics::new();
        metrics.insert("acc", 0.5);
        metrics.insert("loss", 1.25);
        let valid = metrics.prefixed("valid_");
        assert_eq!(valid.get("valid_acc"), Some(0.5));
        assert_eq!(valid.get("acc"), None);
        let mut merged = metrics.prefixed("train_");
        merged.extend(valid);
        assert_eq!(merged.len(), 4);
    }

    #[test]
    fn history_lines_round_trip() {
        let dir = tempdir().unwrap();
        let mut context = RunContext::new(dir.path().join("run")).unwrap();
        for epoch in 1..=3 {
            let mut metrics = Metrics::new();
            metrics.insert("valid_acc", epoch as f32 / 10.0);
            context.record(epoch, metrics).unwrap();
        }
        let loaded = load_history(context.history_path()).unwrap();
        assert_eq!(loaded, context.history());
        assert_eq!(loaded[2].metrics.get("valid_acc"), Some(0.3));
        assert_eq!(context.epoch(), 3);
    }

    #[test]
    fn new_run_replaces_previous_history() {
        let dir = tempdir().unwrap();
        for run in 0..2 {
            let mut context = RunContext::new(dir.path()).unwrap();
            let mut metrics = Metrics::new();
            metrics.insert("run", run as f32);
            context.record(1, metrics).unwrap();
            let loaded = load_history(context.history_path()).unwrap();
            assert_eq!(loaded.len(), 1);
            assert_eq!(loaded[0].metrics.get("run"), Some(run as f32));
        }
    }

    #[test]
    fn best_accuracy_only_moves_up() {
        let dir = tempdir().unwrap();
        let mut context = RunContext::new(dir.path()).unwrap();
        assert!(context.observe_accuracy(0.4));
        assert!(!context.observe_accuracy(0.4));
        assert!(context.observe_accuracy(0.6));
        assert_eq!(context.best_acc(), 0.6);
    }
}
