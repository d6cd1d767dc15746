//! Configuration for grid loading.

use serde::{Deserialize, Serialize};

/// Configuration for a [`GridFile`](crate::GridFile).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Read candidate sources of one load in parallel.
    pub parallel_reads: bool,

    /// Open each source once when it is cataloged to check its shape.
    pub verify_sources: bool,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            parallel_reads: true,
            verify_sources: true,
        }
    }
}

impl GridConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("GRID_PARALLEL_READS") {
            config.parallel_reads = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("GRID_VERIFY_SOURCES") {
            config.verify_sources = parse_flag(&val);
        }

        config
    }
}

/// Parse a boolean environment flag.
pub fn parse_flag(val: &str) -> bool {
    val.to_lowercase() == "true" || val == "1"
}
