//! The grid catalog: dimensions, coordinates and the sources that cover them.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::cache::SourceCache;
use crate::config::GridConfig;
use crate::error::{GridError, Result};
use crate::source::{DataSource, SourceSpec};
use crate::types::{Coordinates, Dimension};

/// A cataloged source and the grid index range it covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    #[serde(flatten)]
    pub spec: SourceSpec,
    /// Inclusive `[first, last]` grid index covered along each grid dimension,
    /// in grid dimension order.
    pub dim_limit: Vec<[usize; 2]>,
}

impl SourceEntry {
    /// Whether the source's coverage intersects `[min, max]` on every dimension.
    pub fn intersects(&self, load_limits: &[[usize; 2]]) -> bool {
        self.dim_limit
            .iter()
            .zip(load_limits)
            .all(|(&[lo, hi], &[min, max])| !(hi < min || lo > max))
    }

    /// Whether grid index `index` along grid dimension `dim` is covered.
    pub fn covers(&self, dim: usize, index: usize) -> bool {
        let [lo, hi] = self.dim_limit[dim];
        index >= lo && index <= hi
    }

    /// Native shape implied by the coverage of the declared dimensions.
    pub fn native_shape(&self, grid_dims: &[Dimension]) -> Vec<usize> {
        self.spec
            .dims
            .iter()
            .filter_map(|name| grid_dims.iter().position(|d| &d.name == name))
            .map(|d| self.dim_limit[d][1] - self.dim_limit[d][0] + 1)
            .collect()
    }
}

/// A virtual N-dimensional array backed by many source files.
///
/// Each source covers a rectangular block of grid indices (`dim_limit`);
/// sources may overlap. The catalog is read-only during loads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridFile {
    dims: Vec<Dimension>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    attributes: BTreeMap<String, String>,
    #[serde(default)]
    sources: Vec<SourceEntry>,
    /// Catalog file this grid was opened from or saved to.
    #[serde(skip)]
    path: Option<PathBuf>,
    #[serde(skip)]
    config: GridConfig,
}

impl GridFile {
    /// Create an empty catalog over the given dimensions.
    pub fn new(dims: Vec<Dimension>) -> Result<Self> {
        validate_dims(&dims)?;
        Ok(Self {
            dims,
            attributes: BTreeMap::new(),
            sources: Vec::new(),
            path: None,
            config: GridConfig::default(),
        })
    }

    pub fn with_config(mut self, config: GridConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dims
    }

    /// Dimension names in grid order.
    pub fn dim_names(&self) -> Vec<String> {
        self.dims.iter().map(|d| d.name.clone()).collect()
    }

    /// Names of the defined (non-placeholder) dimensions.
    pub fn defined_dims(&self) -> Vec<String> {
        self.dims
            .iter()
            .filter(|d| d.is_defined())
            .map(|d| d.name.clone())
            .collect()
    }

    /// Position of a dimension in grid order.
    pub fn dim_index(&self, name: &str) -> Option<usize> {
        self.dims.iter().position(|d| d.name == name)
    }

    /// Look up a dimension, failing with a validation error if unknown.
    pub fn dimension(&self, name: &str) -> Result<&Dimension> {
        self.dims.iter().find(|d| d.name == name).ok_or_else(|| {
            GridError::validation(format!(
                "'{}' is not a dimension of this grid (dimensions: {})",
                name,
                self.dim_names().join(", ")
            ))
        })
    }

    /// Length of every dimension, in grid order.
    pub fn size(&self) -> Vec<usize> {
        self.dims.iter().map(|d| d.len()).collect()
    }

    pub fn coordinates(&self, name: &str) -> Result<&Coordinates> {
        self.dimension(name).map(|d| &d.coordinates)
    }

    pub fn sources(&self) -> &[SourceEntry] {
        &self.sources
    }

    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    /// Catalog file path, if the grid was opened from or saved to disk.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Directory relative source paths resolve against.
    pub fn root(&self) -> Option<&Path> {
        self.path.as_deref().and_then(Path::parent)
    }

    /// A fresh cache with one slot per cataloged source.
    pub fn source_cache(&self) -> SourceCache {
        SourceCache::new(self.sources.len())
    }

    /// Add a source covering the given grid index ranges.
    ///
    /// `limits` maps dimension names to inclusive `[first, last]` grid indices.
    /// Dimensions without an entry default to their full range; for dimensions
    /// the source does not store, this means the source's values apply across
    /// the whole range.
    pub fn add_source(&mut self, spec: SourceSpec, limits: &[(&str, [usize; 2])]) -> Result<usize> {
        let entry = self.catalog_entry(spec, limits)?;

        if self.config.verify_sources {
            let shape = entry.native_shape(&self.dims);
            entry.spec.open(self.root(), &shape)?;
        }

        tracing::debug!(
            source = %entry.spec.id(),
            dim_limit = ?entry.dim_limit,
            "Cataloged source"
        );
        self.sources.push(entry);
        Ok(self.sources.len() - 1)
    }

    /// Declared dimensions must be known and distinct, and the array named.
    fn check_source(&self, spec: &SourceSpec) -> Result<()> {
        let mut seen = HashSet::new();
        for name in &spec.dims {
            self.dimension(name)?;
            if !seen.insert(name.as_str()) {
                return Err(GridError::validation(format!(
                    "source {} declares dimension '{}' twice",
                    spec.id(),
                    name
                )));
            }
        }
        if spec.variable.trim().is_empty() {
            return Err(GridError::validation(format!(
                "source {} has no variable name",
                spec.path.display()
            )));
        }
        Ok(())
    }

    fn catalog_entry(&self, spec: SourceSpec, limits: &[(&str, [usize; 2])]) -> Result<SourceEntry> {
        self.check_source(&spec)?;

        let mut dim_limit: Vec<[usize; 2]> =
            self.dims.iter().map(|d| [0, d.len().saturating_sub(1)]).collect();
        for &(name, [first, last]) in limits {
            let d = self.dim_index(name).ok_or_else(|| {
                GridError::validation(format!("limit given for unknown dimension '{}'", name))
            })?;
            if first > last || last >= self.dims[d].len() {
                return Err(GridError::validation(format!(
                    "limit [{}, {}] for dimension '{}' is outside 0..{}",
                    first,
                    last,
                    name,
                    self.dims[d].len()
                )));
            }
            dim_limit[d] = [first, last];
        }

        Ok(SourceEntry { spec, dim_limit })
    }

    /// Remove a source from the catalog.
    pub fn remove_source(&mut self, index: usize) -> Result<SourceEntry> {
        if index >= self.sources.len() {
            return Err(GridError::validation(format!(
                "source {} does not exist (catalog has {})",
                index,
                self.sources.len()
            )));
        }
        Ok(self.sources.remove(index))
    }

    /// Append coordinate rows to a dimension.
    ///
    /// Existing source limits stay valid because rows are only appended.
    pub fn expand(&mut self, dim: &str, rows: Coordinates) -> Result<()> {
        let d = self
            .dim_index(dim)
            .ok_or_else(|| GridError::validation(format!("'{}' is not a dimension", dim)))?;
        if !self.dims[d].is_defined() {
            return Err(GridError::validation(format!(
                "cannot expand undefined dimension '{}'",
                dim
            )));
        }

        let mut coordinates = self.dims[d].coordinates.clone();
        coordinates.extend(rows)?;
        coordinates.validate(dim)?;
        self.dims[d].coordinates = coordinates;
        Ok(())
    }

    /// Coverage of every source as a `sources × dimensions × 2` tensor.
    pub fn dim_limits(&self) -> Array3<usize> {
        let mut limits = Array3::zeros((self.sources.len(), self.dims.len(), 2));
        for (s, entry) in self.sources.iter().enumerate() {
            for (d, &[lo, hi]) in entry.dim_limit.iter().enumerate() {
                limits[[s, d, 0]] = lo;
                limits[[s, d, 1]] = hi;
            }
        }
        limits
    }

    /// Grid indices, per dimension, that no source covers.
    pub fn coverage_gaps(&self) -> Vec<(String, Vec<usize>)> {
        self.dims
            .iter()
            .enumerate()
            .filter_map(|(d, dim)| {
                let gaps: Vec<usize> = (0..dim.len())
                    .filter(|&i| !self.sources.iter().any(|s| s.covers(d, i)))
                    .collect();
                (!gaps.is_empty()).then(|| (dim.name.clone(), gaps))
            })
            .collect()
    }

    /// Fail if any grid index is not covered by at least one source.
    pub fn check_coverage(&self) -> Result<()> {
        let gaps = self.coverage_gaps();
        if gaps.is_empty() {
            return Ok(());
        }
        let detail: Vec<String> = gaps
            .iter()
            .map(|(dim, idx)| format!("{} {:?}", dim, idx))
            .collect();
        Err(GridError::validation(format!(
            "grid indices not covered by any source: {}",
            detail.join("; ")
        )))
    }

    /// Open the data source at catalog position `index`.
    pub fn open_source(&self, index: usize) -> Result<Arc<dyn DataSource>> {
        let entry = self.sources.get(index).ok_or_else(|| {
            GridError::validation(format!("source {} does not exist", index))
        })?;
        entry.spec.open(self.root(), &entry.native_shape(&self.dims))
    }

    /// Write the catalog as JSON.
    pub fn save(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        self.path = Some(path.to_path_buf());
        tracing::info!(
            catalog = %path.display(),
            sources = self.sources.len(),
            "Saved grid catalog"
        );
        Ok(())
    }

    /// Read a JSON catalog.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, GridConfig::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: GridConfig) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let mut grid: GridFile = serde_json::from_str(&json)?;
        validate_dims(&grid.dims)?;
        for entry in &grid.sources {
            grid.check_source(&entry.spec)?;
            if entry.dim_limit.len() != grid.dims.len() {
                return Err(GridError::invalid_metadata(format!(
                    "source {} has limits for {} dimensions, grid has {}",
                    entry.spec.id(),
                    entry.dim_limit.len(),
                    grid.dims.len()
                )));
            }
            let out_of_range = entry
                .dim_limit
                .iter()
                .zip(&grid.dims)
                .any(|(&[lo, hi], dim)| lo > hi || hi >= dim.len());
            if out_of_range {
                return Err(GridError::invalid_metadata(format!(
                    "source {} has limits outside the grid",
                    entry.spec.id()
                )));
            }
        }
        grid.path = Some(path.to_path_buf());
        grid.config = config;
        Ok(grid)
    }
}

fn validate_dims(dims: &[Dimension]) -> Result<()> {
    if dims.is_empty() {
        return Err(GridError::validation("a grid needs at least one dimension"));
    }
    let mut names = HashSet::new();
    for dim in dims {
        if dim.name.trim().is_empty() {
            return Err(GridError::validation("dimension names cannot be empty"));
        }
        if !names.insert(dim.name.as_str()) {
            return Err(GridError::validation(format!(
                "duplicate dimension '{}'",
                dim.name
            )));
        }
        dim.coordinates.validate(&dim.name)?;
    }
    Ok(())
}
