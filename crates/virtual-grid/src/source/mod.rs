//! Data source trait and the catalog records that describe sources.
//!
//! A data source is one physical array-bearing file. Opening it is treated as
//! expensive, so handles are built lazily and shared through a
//! [`SourceCache`](crate::SourceCache).

mod raw;
mod zarr;

pub use raw::{write_raw, RawSource};
pub use zarr::ZarrSource;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{ArrayD, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};

/// Read access to one physical source.
///
/// Implementations return values in the source's own dimension order.
pub trait DataSource: Send + Sync {
    /// Native dimension names, in storage order.
    fn dims(&self) -> &[String];

    /// Native extent of each dimension.
    fn shape(&self) -> &[usize];

    /// Read the elements at the given local indices (one list per native
    /// dimension). The result has shape `[indices[0].len(), indices[1].len(), ...]`.
    fn read(&self, indices: &[Vec<usize>]) -> Result<ArrayD<f64>>;
}

/// On-disk format of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// Zarr V3 array (float32 or float64) in a filesystem store.
    Zarr,
    /// Headerless little-endian float32, row-major in native order.
    Raw,
}

impl std::fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Zarr => write!(f, "zarr"),
            Self::Raw => write!(f, "raw"),
        }
    }
}

/// Description of a source file: identity, native layout and value conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// File (or store directory) path. Relative paths resolve against the catalog.
    pub path: PathBuf,
    /// Name of the array inside the file.
    pub variable: String,
    pub format: SourceFormat,
    /// Grid dimensions the source stores, in native order.
    pub dims: Vec<String>,
    /// Raw value that marks missing data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_value: Option<f64>,
    /// Raw values outside `[min, max]` are treated as missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_range: Option<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_offset: Option<f64>,
}

impl SourceSpec {
    /// Create a source description with no value conversion.
    pub fn new(
        path: impl Into<PathBuf>,
        variable: impl Into<String>,
        format: SourceFormat,
        dims: &[&str],
    ) -> Self {
        Self {
            path: path.into(),
            variable: variable.into(),
            format,
            dims: dims.iter().map(|d| d.to_string()).collect(),
            fill_value: None,
            valid_range: None,
            scale_factor: None,
            add_offset: None,
        }
    }

    pub fn with_fill_value(mut self, fill_value: f64) -> Self {
        self.fill_value = Some(fill_value);
        self
    }

    pub fn with_valid_range(mut self, min: f64, max: f64) -> Self {
        self.valid_range = Some([min, max]);
        self
    }

    pub fn with_transform(mut self, scale_factor: f64, add_offset: f64) -> Self {
        self.scale_factor = Some(scale_factor);
        self.add_offset = Some(add_offset);
        self
    }

    /// Identity of the source: file path plus internal array name.
    pub fn id(&self) -> String {
        format!("{}:{}", self.path.display(), self.variable)
    }

    /// Resolve the file path against a catalog directory.
    pub fn resolve_path(&self, root: Option<&Path>) -> PathBuf {
        match root {
            Some(root) if self.path.is_relative() => root.join(&self.path),
            _ => self.path.clone(),
        }
    }

    /// Open the source, checking that its native shape matches `expected_shape`.
    pub fn open(&self, root: Option<&Path>, expected_shape: &[usize]) -> Result<Arc<dyn DataSource>> {
        let path = self.resolve_path(root);
        let source: Arc<dyn DataSource> = match self.format {
            SourceFormat::Zarr => Arc::new(ZarrSource::open(&path, &self.variable, &self.dims)?),
            SourceFormat::Raw => Arc::new(RawSource::open(&path, &self.dims, expected_shape)?),
        };

        if source.shape() != expected_shape {
            return Err(GridError::source_unreadable(
                self.id(),
                format!("{:?}", expected_shape),
                format!(
                    "stored shape {:?} does not match cataloged shape {:?}",
                    source.shape(),
                    expected_shape
                ),
            ));
        }

        tracing::debug!(source = %self.id(), shape = ?expected_shape, "Opened data source");
        Ok(source)
    }

    /// Apply fill value, valid range and linear transform in place.
    pub fn convert(&self, data: &mut ArrayD<f64>) {
        let scale = self.scale_factor.unwrap_or(1.0);
        let offset = self.add_offset.unwrap_or(0.0);
        let transform = self.scale_factor.is_some() || self.add_offset.is_some();

        if self.fill_value.is_none() && self.valid_range.is_none() && !transform {
            return;
        }

        data.mapv_inplace(|v| {
            if self.fill_value == Some(v) {
                return f64::NAN;
            }
            if let Some([min, max]) = self.valid_range {
                if v < min || v > max {
                    return f64::NAN;
                }
            }
            if transform {
                v * scale + offset
            } else {
                v
            }
        });
    }
}

/// Check that read indices fit the native shape.
pub(crate) fn check_indices(id: &str, shape: &[usize], indices: &[Vec<usize>]) -> Result<()> {
    let range = || format!("{:?}", indices);
    if indices.len() != shape.len() {
        return Err(GridError::source_unreadable(
            id,
            range(),
            format!(
                "expected indices for {} dimensions, got {}",
                shape.len(),
                indices.len()
            ),
        ));
    }
    for (axis, (list, &len)) in indices.iter().zip(shape).enumerate() {
        if list.is_empty() {
            return Err(GridError::source_unreadable(
                id,
                range(),
                format!("no indices requested along axis {}", axis),
            ));
        }
        if let Some(bad) = list.iter().find(|&&i| i >= len) {
            return Err(GridError::source_unreadable(
                id,
                range(),
                format!("index {} exceeds extent {} of axis {}", bad, len, axis),
            ));
        }
    }
    Ok(())
}

/// Bounding `[min, max]` of each index list. Lists must be non-empty.
pub(crate) fn bounds(indices: &[Vec<usize>]) -> Vec<(usize, usize)> {
    indices
        .iter()
        .map(|list| {
            let min = list.iter().copied().min().unwrap_or(0);
            let max = list.iter().copied().max().unwrap_or(0);
            (min, max)
        })
        .collect()
}

/// Pick `indices` (relative to `bounds`) out of a block covering the bounding box.
pub(crate) fn select_from_block<T: Clone>(
    mut block: ArrayD<T>,
    bounds: &[(usize, usize)],
    indices: &[Vec<usize>],
) -> ArrayD<T> {
    for (axis, (list, &(min, max))) in indices.iter().zip(bounds).enumerate() {
        let contiguous = list.len() == max - min + 1 && list.iter().enumerate().all(|(k, &i)| i == min + k);
        if contiguous {
            continue;
        }
        let relative: Vec<usize> = list.iter().map(|&i| i - min).collect();
        block = block.select(Axis(axis), &relative);
    }
    block
}
