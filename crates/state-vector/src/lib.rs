//! State Vector Design and Ensemble Construction
//!
//! This crate turns declarative per-dimension designs into ensembles drawn
//! from virtual grids. It provides:
//!
//! - **Variables**: each dimension is a state dimension (fixed indices) or an
//!   ensemble dimension (reference indices, optional sequence and mean)
//! - **Coupling**: variables in one coupled set share every member draw
//! - **Build**: draw members, load them through [`virtual_grid`], average,
//!   flag missing rows and stack everything into one matrix
//!
//! # Architecture
//!
//! ```text
//! StateVector (design phase)
//!      │  add / set_role / set_indices / set_sequence / set_mean / couple
//!      ▼
//! StateVector::build(members, config)
//!      │
//!      ├─► Coupled set: intersect reference domains, draw members
//!      │
//!      ├─► Variable: GridFile::repeated_load per member (shared SourceCache)
//!      │
//!      └─► Ensemble { data: rows × members, metadata }
//!                │
//!                └─► save / load (Zarr V3 + JSON attribute)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use state_vector::{BuildConfig, IndexSelection, Role, StateVector};
//! use virtual_grid::GridFile;
//!
//! let tas = Arc::new(GridFile::open("tas.grid.json")?);
//! let mut sv = StateVector::new();
//! sv.add("tas", tas)?;
//! sv.set_role(&["tas"], "time", Role::Ensemble)?;
//!
//! let ensemble = sv.build(50, &BuildConfig::default().with_seed(1))?;
//! ensemble.save("prior.ens.zarr")?;
//! ```

mod build;
pub mod config;
pub mod coupling;
pub mod design;
pub mod ensemble;
pub mod error;
pub mod state_vector;
pub mod variable;

// Re-export commonly used types at crate root
pub use config::BuildConfig;
pub use coupling::Coupling;
pub use design::{DimensionDesign, IndexSelection, Mean, NanPolicy, Role, Sequence};
pub use ensemble::{Ensemble, EnsembleMetadata, RowLocation, VariableMetadata};
pub use error::{Result, StateVectorError};
pub use state_vector::StateVector;
pub use variable::{StateVectorVariable, VariableDesign};
