//! Cost Model Configuration
//!
//! Settings are plain structs with defaults. [`CostModelConfig::from_env`]
//! reads the environment surface used by the autoscheduler:
//!
//! - `SCHEDCOST_WEIGHTS_DIR`: weights to load and save. A path ending in
//!   `.weights` is a binary file; anything else is a legacy directory.
//! - `SCHEDCOST_RANDOMIZE_WEIGHTS=1`: start from random weights even if a
//!   load would succeed.
//! - `SCHEDCOST_SEED`: seed for random weights.

use std::env;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};

use crate::weights::{self, Weights};

pub const ENV_WEIGHTS_DIR: &str = "SCHEDCOST_WEIGHTS_DIR";
pub const ENV_RANDOMIZE_WEIGHTS: &str = "SCHEDCOST_RANDOMIZE_WEIGHTS";
pub const ENV_SEED: &str = "SCHEDCOST_SEED";

/// Configuration for a [`crate::LearnedCostModel`]
#[derive(Clone, Debug, PartialEq)]
pub struct CostModelConfig {
    /// Weights to start from; `None` uses the embedded baseline
    pub weights_in: Option<PathBuf>,

    /// Where `save_weights` writes; `None` makes saving a no-op
    pub weights_out: Option<PathBuf>,

    /// Replace whatever was loaded with random weights
    pub randomize_weights: bool,

    /// Seed for random weights; `None` derives one from the clock
    pub seed: Option<u64>,
}

impl Default for CostModelConfig {
    fn default() -> Self {
        CostModelConfig {
            weights_in: None,
            weights_out: None,
            randomize_weights: false,
            seed: None,
        }
    }
}

impl CostModelConfig {
    /// Read settings from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`CostModelConfig::from_env`] with an injectable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let path = lookup(ENV_WEIGHTS_DIR)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let seed = lookup(ENV_SEED).and_then(|s| match s.trim().parse::<u64>() {
            Ok(seed) => Some(seed),
            Err(_) => {
                warn!("Ignoring unparsable {}={:?}", ENV_SEED, s);
                None
            }
        });
        CostModelConfig {
            weights_in: path.clone(),
            weights_out: path,
            randomize_weights: lookup(ENV_RANDOMIZE_WEIGHTS).as_deref() == Some("1"),
            seed,
        }
    }

    /// The configured seed, or one derived from the current time
    pub fn seed_or_clock(&self) -> u64 {
        self.seed.unwrap_or_else(clock_seed)
    }

    /// Produce the initial weights this configuration asks for
    ///
    /// Falls back to random weights, with a warning, when the configured
    /// weights cannot be loaded. The seed used is always logged so a run can
    /// be reproduced.
    pub fn initial_weights(&self) -> Weights {
        let mut weights = Weights::baseline();
        let loaded = match &self.weights_in {
            None => true,
            Some(path) => load_or_warn(&mut weights, path),
        };
        if !loaded || self.randomize_weights {
            let seed = self.seed_or_clock();
            info!("Randomizing weights with seed {}", seed);
            weights.randomize(seed);
        }
        weights
    }
}

fn load_or_warn(weights: &mut Weights, path: &Path) -> bool {
    let ok = weights::load_path(weights, path);
    if !ok {
        warn!(
            "Unable to load weights from {}, falling back to random weights",
            path.display()
        );
    }
    ok
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() ^ u64::from(d.subsec_nanos()))
        .unwrap_or(0)
}
