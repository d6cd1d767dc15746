//! The built ensemble: a state × member matrix plus the metadata to read it.

use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use virtual_grid::{Coordinates, MetaValue};
use zarrs::array::{Array, ArrayBuilder, ChunkGrid, DataType, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs_filesystem::FilesystemStore;

use crate::design::DimensionDesign;
use crate::error::{Result, StateVectorError};
use crate::variable::{StateVectorVariable, VariableDesign};

/// Attribute holding [`EnsembleMetadata`] in a saved ensemble.
const METADATA_ATTRIBUTE: &str = "ensemble";

/// Where one variable sits in the ensemble and what its rows mean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableMetadata {
    /// Frozen design the variable was built from.
    pub design: VariableDesign,
    /// First row and one past the last row.
    pub rows: [usize; 2],
    /// Rows along each dimension; rows are row-major over this shape.
    pub state_shape: Vec<usize>,
    /// Coordinates along each dimension. Averaged state dimensions list every
    /// averaged index; ensemble dimensions list sequence metadata, or the
    /// sequence offsets when none was given.
    pub state_coordinates: Vec<Coordinates>,
    /// Drawn reference indices per member, one per ensemble dimension.
    pub references: Vec<Vec<usize>>,
    /// Metadata of the drawn references per member.
    pub members: Vec<Vec<MetaValue>>,
}

impl VariableMetadata {
    pub(crate) fn new(
        var: &StateVectorVariable,
        start: usize,
        references: Vec<Vec<usize>>,
    ) -> Result<Self> {
        let design = var.design().clone();

        let state_coordinates = design
            .design
            .iter()
            .enumerate()
            .map(|(d, dim)| match dim {
                DimensionDesign::State { indices, .. } => Ok(var.coordinates(d)?.select(indices)),
                DimensionDesign::Ensemble { sequence, .. } => Ok(sequence.metadata.clone().unwrap_or_else(|| {
                    Coordinates::Numeric(sequence.offsets.iter().map(|&o| o as f64).collect())
                })),
            })
            .collect::<Result<Vec<_>>>()?;

        let ensemble_dims = var.ensemble_dims();
        let members = references
            .iter()
            .map(|refs| {
                ensemble_dims
                    .iter()
                    .zip(refs)
                    .map(|(&d, &r)| Ok(var.coordinates(d)?.get(r).unwrap_or(MetaValue::Undefined)))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            design,
            rows: [start, start + var.length()],
            state_shape: var.state_sizes(),
            state_coordinates,
            references,
            members,
        })
    }

    pub fn name(&self) -> &str {
        &self.design.name
    }

    pub fn row_range(&self) -> Range<usize> {
        self.rows[0]..self.rows[1]
    }

    pub fn len(&self) -> usize {
        self.rows[1] - self.rows[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Location of a state vector row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowLocation {
    pub variable: String,
    /// Position along each dimension of the variable's state shape.
    pub position: Vec<usize>,
}

/// Everything needed to interpret an ensemble matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleMetadata {
    pub variables: Vec<VariableMetadata>,
    /// Coupled sets by variable name.
    pub coupling: Vec<Vec<String>>,
    /// Per row: whether any raw value loaded for it was missing.
    pub has_nan: Vec<bool>,
}

impl EnsembleMetadata {
    pub fn variable(&self, name: &str) -> Option<&VariableMetadata> {
        self.variables.iter().find(|v| v.name() == name)
    }

    /// Total number of rows.
    pub fn rows(&self) -> usize {
        self.variables.last().map_or(0, |v| v.rows[1])
    }

    /// Which variable a row belongs to, and where in its state shape.
    pub fn locate(&self, row: usize) -> Option<RowLocation> {
        let var = self.variables.iter().find(|v| v.row_range().contains(&row))?;
        let mut rem = row - var.rows[0];
        let mut position = vec![0; var.state_shape.len()];
        for (p, &n) in position.iter_mut().zip(&var.state_shape).rev() {
            *p = rem % n;
            rem /= n;
        }
        Some(RowLocation {
            variable: var.name().to_string(),
            position,
        })
    }
}

/// A built ensemble.
#[derive(Debug, Clone, PartialEq)]
pub struct Ensemble {
    /// State rows × ensemble members. Missing values are NaN.
    pub data: Array2<f64>,
    pub metadata: EnsembleMetadata,
}

impl Ensemble {
    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn members(&self) -> usize {
        self.data.ncols()
    }

    /// Rows of one variable.
    pub fn variable(&self, name: &str) -> Option<ArrayView2<'_, f64>> {
        let meta = self.metadata.variable(name)?;
        Some(self.data.slice(s![meta.row_range(), ..]))
    }

    pub fn locate(&self, row: usize) -> Option<RowLocation> {
        self.metadata.locate(row)
    }

    /// Save as a 2-D float64 Zarr V3 array with the metadata as an attribute.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let store = Arc::new(FilesystemStore::new(path).map_err(storage)?);

        let (rows, members) = self.data.dim();
        let shape = vec![rows as u64, members as u64];
        let chunk_grid: ChunkGrid = vec![rows.max(1) as u64, members.max(1) as u64]
            .try_into()
            .map_err(|e| StateVectorError::storage(format!("{:?}", e)))?;

        let mut attrs = serde_json::Map::new();
        attrs.insert(METADATA_ATTRIBUTE.to_string(), serde_json::to_value(&self.metadata)?);

        let mut builder = ArrayBuilder::new(
            shape.clone(),
            DataType::Float64,
            chunk_grid,
            FillValue::from(f64::NAN),
        );
        builder.attributes(attrs);
        let array = builder.build(store, "/").map_err(storage)?;
        array.store_metadata().map_err(storage)?;

        let data = self.data.as_standard_layout();
        let values = data
            .as_slice()
            .ok_or_else(|| StateVectorError::storage("ensemble matrix is not contiguous"))?;
        let subset = ArraySubset::new_with_start_shape(vec![0, 0], shape).map_err(storage)?;
        array
            .store_array_subset_elements(&subset, values)
            .map_err(storage)?;

        tracing::info!(
            path = %path.display(),
            rows,
            members,
            "Saved ensemble"
        );
        Ok(())
    }

    /// Load an ensemble written by [`Ensemble::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let store = Arc::new(FilesystemStore::new(path).map_err(storage)?);
        let array = Array::open(store, "/").map_err(storage)?;

        let metadata = array
            .attributes()
            .get(METADATA_ATTRIBUTE)
            .cloned()
            .ok_or_else(|| {
                StateVectorError::storage(format!(
                    "{} has no '{}' attribute",
                    path.display(),
                    METADATA_ATTRIBUTE
                ))
            })?;
        let metadata: EnsembleMetadata = serde_json::from_value(metadata)?;

        let shape = array.shape().to_vec();
        if shape.len() != 2 {
            return Err(StateVectorError::storage(format!(
                "ensemble array must be 2-D, found {} dimensions",
                shape.len()
            )));
        }
        let (rows, members) = (shape[0] as usize, shape[1] as usize);
        if metadata.has_nan.len() != rows || metadata.rows() != rows {
            return Err(StateVectorError::storage(format!(
                "ensemble metadata describes {} rows, array has {}",
                metadata.rows(),
                rows
            )));
        }

        let subset = ArraySubset::new_with_start_shape(vec![0, 0], shape).map_err(storage)?;
        let values = array
            .retrieve_array_subset_elements::<f64>(&subset)
            .map_err(storage)?;
        let data = Array2::from_shape_vec((rows, members), values).map_err(storage)?;

        Ok(Self { data, metadata })
    }
}

fn storage(err: impl std::fmt::Display) -> StateVectorError {
    StateVectorError::storage(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> EnsembleMetadata {
        let variable = |name: &str, rows: [usize; 2], state_shape: Vec<usize>| VariableMetadata {
            design: VariableDesign {
                name: name.to_string(),
                grid: None,
                dims: vec![],
                design: vec![],
                overlap: false,
            },
            rows,
            state_shape,
            state_coordinates: vec![],
            references: vec![],
            members: vec![],
        };
        EnsembleMetadata {
            variables: vec![variable("tas", [0, 6], vec![2, 3]), variable("pr", [6, 8], vec![2])],
            coupling: vec![vec!["tas".into(), "pr".into()]],
            has_nan: vec![false; 8],
        }
    }

    #[test]
    fn test_locate_row_major() {
        let meta = metadata();
        assert_eq!(meta.rows(), 8);
        assert_eq!(
            meta.locate(4),
            Some(RowLocation {
                variable: "tas".into(),
                position: vec![1, 1]
            })
        );
        assert_eq!(meta.locate(7).unwrap().variable, "pr");
        assert_eq!(meta.locate(7).unwrap().position, vec![1]);
        assert!(meta.locate(8).is_none());
    }

    #[test]
    fn test_variable_view() {
        let ensemble = Ensemble {
            data: Array2::from_shape_fn((8, 2), |(r, m)| (r * 10 + m) as f64),
            metadata: metadata(),
        };
        let pr = ensemble.variable("pr").unwrap();
        assert_eq!(pr.shape(), &[2, 2]);
        assert_eq!(pr[[1, 1]], 71.0);
        assert!(ensemble.variable("psl").is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ens.zarr");
        let mut data = Array2::from_shape_fn((8, 3), |(r, m)| r as f64 + m as f64 / 10.0);
        data[[2, 1]] = f64::NAN;
        let mut metadata = metadata();
        metadata.has_nan[2] = true;
        let ensemble = Ensemble { data, metadata };

        ensemble.save(&path).unwrap();
        let loaded = Ensemble::load(&path).unwrap();

        assert_eq!(loaded.metadata, ensemble.metadata);
        assert_eq!(loaded.data.dim(), (8, 3));
        assert!(loaded.data[[2, 1]].is_nan());
        assert_eq!(loaded.data[[7, 2]], ensemble.data[[7, 2]]);
    }

    #[test]
    fn test_load_missing_store() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Ensemble::load(dir.path().join("absent.zarr")).is_err());
    }
}
