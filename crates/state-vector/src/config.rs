//! Configuration for ensemble builds.

use serde::{Deserialize, Serialize};
use virtual_grid::config::parse_flag;

/// Options for [`StateVector::build`](crate::StateVector::build).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Take members in reference order instead of drawing at random.
    pub sequential: bool,

    /// Seed for random draws; unseeded draws use OS entropy.
    pub seed: Option<u64>,

    /// Load ensemble members in parallel.
    #[serde(default = "default_parallel")]
    pub parallel: bool,
}

fn default_parallel() -> bool {
    true
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            sequential: false,
            seed: None,
            parallel: true,
        }
    }
}

impl BuildConfig {
    pub fn sequential(mut self) -> Self {
        self.sequential = true;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("ENSEMBLE_SEQUENTIAL") {
            config.sequential = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("ENSEMBLE_SEED") {
            if let Ok(seed) = val.parse() {
                config.seed = Some(seed);
            }
        }

        if let Ok(val) = std::env::var("ENSEMBLE_PARALLEL") {
            config.parallel = parse_flag(&val);
        }

        config
    }
}
