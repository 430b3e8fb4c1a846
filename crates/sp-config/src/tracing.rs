// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Directive used when `RUST_LOG` is unset. Layer internals stay quiet so
/// training and attack progress is readable.
pub const DEFAULT_FILTER: &str = "info,sp_nn=warn,sp_tensor=warn";

static INITIALISED: OnceLock<()> = OnceLock::new();
static CHROME_GUARD: OnceLock<Mutex<Option<tracing_chrome::FlushGuard>>> = OnceLock::new();

/// How the global subscriber is assembled.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TracingOptions {
    /// Filter directive; `None` defers to `RUST_LOG`, then [`DEFAULT_FILTER`].
    pub filter: Option<String>,
    /// Chrome trace output, usually inside the run's log directory.
    pub chrome_trace: Option<PathBuf>,
}

impl TracingOptions {
    /// Reads `SPIRAL_TRACE_CHROME`.
    pub fn from_env() -> Result<Self, InitError> {
        let chrome_trace = match std::env::var("SPIRAL_TRACE_CHROME") {
            Ok(raw) if !raw.trim().is_empty() => Some(PathBuf::from(raw)),
            Ok(_) | Err(std::env::VarError::NotPresent) => None,
            Err(err) => return Err(InitError::Env(err)),
        };
        Ok(Self {
            filter: None,
            chrome_trace,
        })
    }

    fn env_filter(&self) -> Result<EnvFilter, InitError> {
        match &self.filter {
            Some(directive) => EnvFilter::try_new(directive)
                .map_err(|err| InitError::Filter(err.to_string())),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
        }
    }
}

/// Installs the global subscriber from the environment.
///
/// Honours `RUST_LOG`. When `SPIRAL_TRACE_CHROME` names a file, spans are
/// additionally written there in Chrome trace format.
pub fn init_tracing() -> Result<(), InitError> {
    init_tracing_with(TracingOptions::from_env()?)
}

/// Installs the global subscriber. Only the first call in a process succeeds.
pub fn init_tracing_with(options: TracingOptions) -> Result<(), InitError> {
    INITIALISED
        .set(())
        .map_err(|_| InitError::AlreadyInitialised)?;

    let filter = options.env_filter()?;
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(std::io::stdout().is_terminal());
    let chrome_layer = options.chrome_trace.map(|path| {
        let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
            .file(path)
            .include_args(true)
            .build();
        let cell = CHROME_GUARD.get_or_init(|| Mutex::new(None));
        if let Ok(mut slot) = cell.lock() {
            *slot = Some(guard);
        }
        layer
    });

    Registry::default()
        .with(filter)
        .with(fmt_layer)
        .with(chrome_layer)
        .try_init()
        .map_err(|err| InitError::Subscriber(err.to_string()))
}

/// Flushes and closes the Chrome trace file, if one is being written.
pub fn flush_tracing() {
    if let Some(cell) = CHROME_GUARD.get() {
        if let Ok(mut slot) = cell.lock() {
            slot.take();
        }
    }
}

/// Errors emitted when configuring the tracing subscriber.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
    #[error("failed to read SPIRAL_TRACE_CHROME: {0}")]
    Env(std::env::VarError),
    #[error("invalid log filter: {0}")]
    Filter(String),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_filter_is_validated() {
        let options = TracingOptions {
            filter: Some("sp_passport=debug".into()),
            chrome_trace: None,
        };
        assert!(options.env_filter().is_ok());
        let bad = TracingOptions {
            filter: Some("sp_passport=loud".into()),
            chrome_trace: None,
        };
        assert!(matches!(bad.env_filter(), Err(InitError::Filter(_))));
    }
}
