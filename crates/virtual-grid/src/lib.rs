//! Virtual N-dimensional Grid over Many Source Files
//!
//! This crate presents a single logical grid backed by any number of
//! physical data sources whose index ranges may partially overlap. It enables:
//!
//! - **A catalog**: dimensions with coordinate metadata plus the block of
//!   grid indices each source covers (`dim_limit`)
//! - **Partial loads**: only sources intersecting a request are opened and read
//! - **Handle reuse**: a [`SourceCache`] amortises source-open cost across loads
//!
//! # Architecture
//!
//! ```text
//! Caller (state vector build, CLI)
//!      │
//!      ▼
//! GridFile::repeated_load(request, cache)
//!      │
//!      ├─► Resolve candidate sources from dim_limit
//!      │
//!      ├─► SourceCache::get_or_build for each source
//!      │         │
//!      │         ├─► Built: reuse handle
//!      │         │
//!      │         └─► Empty: SourceSpec::open (zarr | raw)
//!      │
//!      └─► Scatter source blocks into one GridRegion
//! ```
//!
//! # Example
//!
//! ```ignore
//! use virtual_grid::{GridFile, LoadRequest};
//!
//! let grid = GridFile::open("tas.grid.json")?;
//! let cache = grid.source_cache();
//!
//! let request = LoadRequest::new(&["time", "lat", "lon"])
//!     .with_indices("time", vec![0, 60, 119]);
//! let region = grid.repeated_load(&request, &cache)?;
//! assert_eq!(region.data.shape()[0], 3);
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod grid;
pub mod load;
pub mod source;
pub mod testdata;
pub mod types;

// Re-export commonly used types at crate root
pub use cache::SourceCache;
pub use config::GridConfig;
pub use error::{GridError, Result};
pub use grid::{GridFile, SourceEntry};
pub use load::LoadRequest;
pub use source::{DataSource, RawSource, SourceFormat, SourceSpec, ZarrSource};
pub use types::{CacheStats, Coordinates, Dimension, GridRegion, MetaValue};
