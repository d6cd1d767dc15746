//! Zarr V3 data source.

use std::path::Path;
use std::sync::Arc;

use ndarray::{ArrayD, IxDyn};
use zarrs::array::{Array, DataType};
use zarrs::array_subset::ArraySubset;
use zarrs_filesystem::FilesystemStore;

use crate::error::{GridError, Result};

use super::{bounds, check_indices, select_from_block, DataSource};

/// A Zarr array in a filesystem store.
///
/// Reads fetch the bounding box of the requested indices and pick the
/// requested elements out of it, so scattered requests cost one retrieval.
pub struct ZarrSource {
    array: Array<FilesystemStore>,
    /// Identity used in error messages.
    id: String,
    dims: Vec<String>,
    shape: Vec<usize>,
}

impl ZarrSource {
    /// Open the array `variable` inside the store at `path`.
    pub fn open(path: &Path, variable: &str, dims: &[String]) -> Result<Self> {
        let node = if variable.starts_with('/') {
            variable.to_string()
        } else {
            format!("/{}", variable)
        };
        let id = format!("{}:{}", path.display(), node);

        let store = FilesystemStore::new(path)
            .map_err(|e| GridError::source_unreadable(&id, "open", e.to_string()))?;
        let array = Array::open(Arc::new(store), &node)
            .map_err(|e| GridError::source_unreadable(&id, "open", e.to_string()))?;

        match array.data_type() {
            DataType::Float32 | DataType::Float64 => {}
            other => {
                return Err(GridError::source_unreadable(
                    &id,
                    "open",
                    format!("unsupported data type {:?}", other),
                ))
            }
        }

        let shape: Vec<usize> = array.shape().iter().map(|&n| n as usize).collect();
        if shape.len() != dims.len() {
            return Err(GridError::source_unreadable(
                &id,
                "open",
                format!(
                    "array has {} dimensions but {} are declared",
                    shape.len(),
                    dims.len()
                ),
            ));
        }

        Ok(Self {
            array,
            id,
            dims: dims.to_vec(),
            shape,
        })
    }

    fn retrieve(&self, subset: &ArraySubset) -> Result<Vec<f64>> {
        let failed = |e: String| GridError::source_unreadable(&self.id, format!("{:?}", subset), e);
        match self.array.data_type() {
            DataType::Float64 => self
                .array
                .retrieve_array_subset_elements::<f64>(subset)
                .map_err(|e| failed(e.to_string())),
            _ => self
                .array
                .retrieve_array_subset_elements::<f32>(subset)
                .map(|values| values.into_iter().map(f64::from).collect())
                .map_err(|e| failed(e.to_string())),
        }
    }
}

impl DataSource for ZarrSource {
    fn dims(&self) -> &[String] {
        &self.dims
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn read(&self, indices: &[Vec<usize>]) -> Result<ArrayD<f64>> {
        check_indices(&self.id, &self.shape, indices)?;

        let bounds = bounds(indices);
        let start: Vec<u64> = bounds.iter().map(|&(min, _)| min as u64).collect();
        let extent: Vec<usize> = bounds.iter().map(|&(min, max)| max - min + 1).collect();

        let subset = ArraySubset::new_with_start_shape(
            start,
            extent.iter().map(|&n| n as u64).collect(),
        )
        .map_err(|e| GridError::source_unreadable(&self.id, format!("{:?}", indices), e.to_string()))?;

        let values = self.retrieve(&subset)?;
        let block = ArrayD::from_shape_vec(IxDyn(&extent), values).map_err(|e| {
            GridError::source_unreadable(&self.id, format!("{:?}", indices), e.to_string())
        })?;

        Ok(select_from_block(block, &bounds, indices))
    }
}
