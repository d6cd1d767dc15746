//! YAML inputs of the ensemble builder.
//!
//! A grid description lists dimensions and the source files that fill them:
//!
//! ```yaml
//! attributes:
//!   units: K
//! dimensions:
//!   - name: lat
//!     coordinates: { type: numeric, values: [-45.0, 0.0, 45.0] }
//!   - name: time
//!     coordinates: { type: time, values: ["1900-01-01T00:00:00Z", ...] }
//! sources:
//!   - path: tas_1900s.zarr
//!     variable: /
//!     format: zarr
//!     dims: [lat, time]
//!     limits: { time: [0, 119] }
//! ```
//!
//! An ensemble design names grid catalogs and how to use each dimension:
//!
//! ```yaml
//! members: 50
//! seed: 42
//! variables:
//!   - name: tas
//!     grid: tas.grid.json
//!     dims:
//!       lat: { indices: { linear: [0, 1] } }
//!       time:
//!         role: ensemble
//!         sequence: { offsets: [0, 1, 2] }
//! couple:
//!   - [tas, pr]
//! ```
//!
//! Relative paths resolve against the directory of the YAML file.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use state_vector::{BuildConfig, IndexSelection, Mean, Role, Sequence, StateVector};
use virtual_grid::{Dimension, GridConfig, GridFile, SourceSpec};

// ============================================================================
// Grid description
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridDescription {
    pub dimensions: Vec<Dimension>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub sources: Vec<SourceDescription>,
}

/// A source file plus the grid indices it covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDescription {
    #[serde(flatten)]
    pub spec: SourceSpec,
    /// Inclusive `[first, last]` per declared dimension; omitted dimensions
    /// span the whole grid.
    #[serde(default)]
    pub limits: BTreeMap<String, [usize; 2]>,
}

impl GridDescription {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read grid description {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse grid description {}", path.display()))
    }

    /// Build the catalog, resolving relative source paths against `base`.
    pub fn into_grid(self, base: &Path, config: GridConfig) -> Result<GridFile> {
        let mut grid = GridFile::new(self.dimensions)?.with_config(config);
        for (key, value) in self.attributes {
            grid = grid.with_attribute(key, value);
        }

        for source in self.sources {
            let mut spec = source.spec;
            if spec.path.is_relative() {
                spec.path = base.join(&spec.path);
            }
            let limits: Vec<(&str, [usize; 2])> = source
                .limits
                .iter()
                .map(|(dim, limit)| (dim.as_str(), *limit))
                .collect();
            let id = spec.id();
            grid.add_source(spec, &limits)
                .with_context(|| format!("Failed to add source {}", id))?;
        }
        Ok(grid)
    }
}

// ============================================================================
// Ensemble design
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleDesign {
    pub members: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub sequential: bool,
    pub variables: Vec<VariableSpec>,
    /// Sets of variable names that share ensemble members.
    #[serde(default)]
    pub couple: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    /// Grid catalog (JSON) the variable reads from.
    pub grid: PathBuf,
    /// Design per dimension; unlisted dimensions keep every index as state.
    #[serde(default)]
    pub dims: BTreeMap<String, DimensionSpec>,
    #[serde(default)]
    pub overlap: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DimensionSpec {
    #[serde(default)]
    pub role: Option<Role>,
    /// `all`, `{ linear: [...] }` or `{ mask: [...] }`.
    #[serde(
        default,
        deserialize_with = "deserialize_indices",
        serialize_with = "serialize_indices",
        skip_serializing_if = "Option::is_none"
    )]
    pub indices: Option<IndexSelection>,
    #[serde(default)]
    pub sequence: Option<Sequence>,
    #[serde(default)]
    pub mean: Option<Mean>,
}

fn deserialize_indices<'de, D>(deserializer: D) -> std::result::Result<Option<IndexSelection>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_yaml::with::singleton_map::deserialize(deserializer).map(Some)
}

fn serialize_indices<S>(indices: &Option<IndexSelection>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match indices {
        Some(selection) => serde_yaml::with::singleton_map::serialize(selection, serializer),
        None => serializer.serialize_none(),
    }
}

impl EnsembleDesign {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read ensemble design {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse ensemble design {}", path.display()))
    }

    /// Build options from the design file, overridden by the environment
    /// only where the design is silent.
    pub fn build_config(&self) -> BuildConfig {
        let mut config = BuildConfig::from_env();
        config.sequential |= self.sequential;
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        config
    }

    /// Open every grid and apply the design to a new state vector.
    ///
    /// Coupling is applied before dimension settings so that role changes
    /// reach every coupled partner.
    pub fn state_vector(&self, base: &Path) -> Result<StateVector> {
        let mut sv = StateVector::new();
        let config = GridConfig::from_env();
        // one grid per catalog path
        let mut grids: BTreeMap<PathBuf, Arc<GridFile>> = BTreeMap::new();

        for var in &self.variables {
            let path = if var.grid.is_relative() {
                base.join(&var.grid)
            } else {
                var.grid.clone()
            };
            let grid = match grids.get(&path) {
                Some(grid) => grid.clone(),
                None => {
                    let grid = GridFile::open_with_config(&path, config.clone())
                        .with_context(|| format!("Failed to open grid catalog {}", path.display()))?;
                    let grid = Arc::new(grid);
                    grids.insert(path, grid.clone());
                    grid
                }
            };
            sv.add(&var.name, grid)?;
        }

        for set in &self.couple {
            let names: Vec<&str> = set.iter().map(String::as_str).collect();
            sv.couple(&names)?;
        }

        for var in &self.variables {
            let names = [var.name.as_str()];
            for (dim, spec) in &var.dims {
                if let Some(role) = spec.role {
                    sv.set_role(&names, dim, role)?;
                }
                if let Some(indices) = &spec.indices {
                    sv.set_indices(&names, dim, indices)?;
                }
                if let Some(sequence) = &spec.sequence {
                    sv.set_sequence(&names, dim, sequence)?;
                }
                if let Some(mean) = &spec.mean {
                    sv.set_mean(&names, dim, Some(mean))?;
                }
            }
            if var.overlap {
                sv.allow_overlap(&names, true)?;
            }
        }

        Ok(sv)
    }
}
