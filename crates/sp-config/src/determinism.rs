// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use rand::{rngs::StdRng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

/// Deterministic runtime configuration read from `SPIRAL_DETERMINISTIC*`.
#[derive(Clone, Debug)]
pub struct DeterminismConfig {
    /// Whether deterministic execution is enabled globally.
    pub enabled: bool,
    /// Base seed used to derive per-component seeds.
    pub base_seed: u64,
    /// If true reductions should run sequentially to ensure stable ordering.
    pub fix_reduction: bool,
}

fn parse_flag(raw: Option<String>, default: bool) -> bool {
    match raw.as_deref() {
        None => default,
        Some("0" | "false" | "False" | "off" | "OFF") => false,
        Some(_) => true,
    }
}

impl DeterminismConfig {
    fn from_env() -> Self {
        let enabled = parse_flag(std::env::var("SPIRAL_DETERMINISTIC").ok(), false);
        let base_seed = std::env::var("SPIRAL_DETERMINISTIC_SEED")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(42);
        let fix_reduction = parse_flag(
            std::env::var("SPIRAL_DETERMINISTIC_REDUCTION").ok(),
            enabled,
        );
        Self {
            enabled,
            base_seed,
            fix_reduction,
        }
    }

    /// Derives a deterministic seed for a given component label.
    pub fn seed_for<L: Hash>(&self, label: L) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.base_seed.hash(&mut hasher);
        label.hash(&mut hasher);
        hasher.finish()
    }
}

static CONFIG: OnceLock<DeterminismConfig> = OnceLock::new();

/// Returns the lazily initialised deterministic configuration.
pub fn config() -> &'static DeterminismConfig {
    CONFIG.get_or_init(|| {
        let cfg = DeterminismConfig::from_env();
        if cfg.enabled && cfg.fix_reduction {
            // Must happen before rayon builds its global pool.
            std::env::set_var("RAYON_NUM_THREADS", "1");
        }
        cfg
    })
}

/// Where the randomness of an operation came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeedSource {
    /// Caller supplied an explicit seed.
    Explicit(u64),
    /// Seed derived from `SPIRAL_DETERMINISTIC_SEED` and the component label.
    Derived(u64),
    /// Operating system entropy; runs cannot be replayed.
    Entropy,
}

impl SeedSource {
    /// Returns `true` when the same call can be replayed bit-for-bit.
    pub fn is_reproducible(&self) -> bool {
        !matches!(self, SeedSource::Entropy)
    }
}

/// Returns a RNG seeded from an optional explicit seed. Without a seed the
/// global deterministic config is consulted; when that is disabled too the
/// RNG falls back to entropy and a warning is emitted, since failures of the
/// calling operation can no longer be reproduced.
pub fn rng_from_optional(seed: Option<u64>, label: &str) -> (StdRng, SeedSource) {
    if let Some(value) = seed {
        return (StdRng::seed_from_u64(value), SeedSource::Explicit(value));
    }
    let cfg = config();
    if cfg.enabled {
        let derived = cfg.seed_for(label);
        return (StdRng::seed_from_u64(derived), SeedSource::Derived(derived));
    }
    ::tracing::warn!(
        component = label,
        "no seed supplied; falling back to entropy, results are not reproducible"
    );
    (StdRng::from_entropy(), SeedSource::Entropy)
}

/// Returns whether reductions should be forced to run sequentially.
pub fn lock_reduction_order() -> bool {
    config().enabled && config().fix_reduction
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
    use std::sync::Mutex;

    fn with_env(vars: &[(&str, Option<&str>)], test: impl FnOnce()) {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        let _lock = GUARD.get_or_init(|| Mutex::new(())).lock().unwrap();

        let snapshot: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, value)| {
                let previous = std::env::var(key).ok();
                match value {
                    Some(val) => std::env::set_var(key, val),
                    None => std::env::remove_var(key),
                }
                ((*key).to_string(), previous)
            })
            .collect();

        let result = catch_unwind(AssertUnwindSafe(test));

        for (key, value) in snapshot {
            match value {
                Some(val) => std::env::set_var(&key, val),
                None => std::env::remove_var(&key),
            }
        }

        if let Err(err) = result {
            resume_unwind(err);
        }
    }

    #[test]
    fn defaults_disable_determinism() {
        with_env(
            &[
                ("SPIRAL_DETERMINISTIC", None),
                ("SPIRAL_DETERMINISTIC_SEED", None),
                ("SPIRAL_DETERMINISTIC_REDUCTION", None),
            ],
            || {
                let cfg = DeterminismConfig::from_env();
                assert!(!cfg.enabled);
                assert_eq!(cfg.base_seed, 42);
                assert!(!cfg.fix_reduction);
            },
        );
    }

    #[test]
    fn reduction_follows_enabled_flag_unless_overridden() {
        with_env(
            &[
                ("SPIRAL_DETERMINISTIC", Some("1")),
                ("SPIRAL_DETERMINISTIC_SEED", Some("1337")),
                ("SPIRAL_DETERMINISTIC_REDUCTION", Some("off")),
            ],
            || {
                let cfg = DeterminismConfig::from_env();
                assert!(cfg.enabled);
                assert_eq!(cfg.base_seed, 1337);
                assert!(!cfg.fix_reduction);
            },
        );
    }

    #[test]
    fn derived_seeds_are_stable_per_label() {
        let cfg = DeterminismConfig {
            enabled: true,
            base_seed: 99,
            fix_reduction: false,
        };
        assert_eq!(cfg.seed_for("keys"), cfg.seed_for("keys"));
        assert_ne!(cfg.seed_for("keys"), cfg.seed_for("attack"));
    }

    #[test]
    fn explicit_seed_replays() {
        let (mut first, source) = rng_from_optional(Some(7), "test");
        let (mut second, _) = rng_from_optional(Some(7), "test");
        assert_eq!(source, SeedSource::Explicit(7));
        assert!(source.is_reproducible());
        let a: u64 = first.gen();
        let b: u64 = second.gen();
        assert_eq!(a, b);
    }
}
