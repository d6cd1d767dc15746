//! A state vector variable: one virtual grid plus a design per dimension.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use virtual_grid::{Coordinates, GridFile, LoadRequest, MetaValue};

use crate::design::{DimensionDesign, IndexSelection, Mean, Role, Sequence};
use crate::error::{Result, StateVectorError};

/// Serializable part of a variable: everything except the grid itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDesign {
    pub name: String,
    /// Catalog the variable reads from, when it has been saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid: Option<PathBuf>,
    /// Defined grid dimensions, in grid order.
    pub dims: Vec<String>,
    /// One design per entry of `dims`.
    pub design: Vec<DimensionDesign>,
    /// Whether members may load the same ensemble indices.
    #[serde(default)]
    pub overlap: bool,
}

/// A variable of a state vector.
///
/// New variables treat every dimension as a state dimension over all of its
/// indices.
#[derive(Debug, Clone)]
pub struct StateVectorVariable {
    design: VariableDesign,
    grid: Arc<GridFile>,
}

impl StateVectorVariable {
    pub fn new(name: impl Into<String>, grid: Arc<GridFile>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;

        let dims = grid.defined_dims();
        let design = dims
            .iter()
            .map(|d| grid.dimension(d).map(|dim| DimensionDesign::state((0..dim.len()).collect())))
            .collect::<virtual_grid::Result<Vec<_>>>()?;

        Ok(Self {
            design: VariableDesign {
                name,
                grid: grid.path().map(|p| p.to_path_buf()),
                dims,
                design,
                overlap: false,
            },
            grid,
        })
    }

    pub fn name(&self) -> &str {
        &self.design.name
    }

    pub fn dims(&self) -> &[String] {
        &self.design.dims
    }

    pub fn grid(&self) -> &Arc<GridFile> {
        &self.grid
    }

    pub fn design(&self) -> &VariableDesign {
        &self.design
    }

    pub fn overlap(&self) -> bool {
        self.design.overlap
    }

    /// Position of `dim` among this variable's dimensions.
    pub fn dim_position(&self, dim: &str) -> Result<usize> {
        self.design.dims.iter().position(|d| d == dim).ok_or_else(|| {
            StateVectorError::validation(format!(
                "variable '{}' has no dimension '{}'",
                self.design.name, dim
            ))
        })
    }

    pub fn has_dim(&self, dim: &str) -> bool {
        self.design.dims.iter().any(|d| d == dim)
    }

    pub fn dimension_design(&self, dim: &str) -> Result<&DimensionDesign> {
        Ok(&self.design.design[self.dim_position(dim)?])
    }

    /// Grid coordinates of the variable's `d`-th dimension.
    pub fn coordinates(&self, d: usize) -> Result<&Coordinates> {
        Ok(self.grid.coordinates(&self.design.dims[d])?)
    }

    fn dim_len(&self, d: usize) -> Result<usize> {
        Ok(self.coordinates(d)?.len())
    }

    /// Positions of the ensemble dimensions, in dimension order.
    pub fn ensemble_dims(&self) -> Vec<usize> {
        self.design
            .design
            .iter()
            .enumerate()
            .filter(|(_, d)| d.role() == Role::Ensemble)
            .map(|(i, _)| i)
            .collect()
    }

    /// Rows contributed along each dimension.
    pub fn state_sizes(&self) -> Vec<usize> {
        self.design.design.iter().map(DimensionDesign::state_size).collect()
    }

    /// Number of state vector rows for this variable.
    pub fn length(&self) -> usize {
        self.state_sizes().iter().product()
    }

    pub(crate) fn rename(&mut self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.design.name = name.to_string();
        Ok(())
    }

    /// Change the role of a dimension.
    ///
    /// The index list carries over; switching role discards any sequence or
    /// mean on the dimension. Setting the current role is a no-op.
    pub fn set_role(&mut self, dim: &str, role: Role) -> Result<()> {
        let d = self.dim_position(dim)?;
        let current = &self.design.design[d];
        if current.role() != role {
            self.design.design[d] = current.clone().into_role(role);
        }
        Ok(())
    }

    /// Set state indices, or reference indices of an ensemble dimension.
    pub fn set_indices(&mut self, dim: &str, selection: &IndexSelection) -> Result<()> {
        let d = self.dim_position(dim)?;
        let resolved = selection.resolve(dim, self.dim_len(d)?)?;
        match &mut self.design.design[d] {
            DimensionDesign::State { indices, mean } => {
                if let Some(mean) = mean {
                    let trial = DimensionDesign::state(resolved.clone());
                    trial.check_mean(dim, mean)?;
                }
                *indices = resolved;
            }
            DimensionDesign::Ensemble { reference, .. } => *reference = resolved,
        }
        Ok(())
    }

    /// Set the sequence of an ensemble dimension.
    pub fn set_sequence(&mut self, dim: &str, new_sequence: Sequence) -> Result<()> {
        let d = self.dim_position(dim)?;
        new_sequence.validate(dim)?;
        match &mut self.design.design[d] {
            DimensionDesign::Ensemble { sequence, .. } => {
                *sequence = new_sequence;
                Ok(())
            }
            DimensionDesign::State { .. } => Err(StateVectorError::validation(format!(
                "'{}' is a state dimension of '{}'; sequences need an ensemble dimension",
                dim, self.design.name
            ))),
        }
    }

    /// Set or clear the mean of a dimension.
    pub fn set_mean(&mut self, dim: &str, new_mean: Option<Mean>) -> Result<()> {
        let d = self.dim_position(dim)?;
        if let Some(m) = &new_mean {
            self.design.design[d].check_mean(dim, m)?;
        }
        match &mut self.design.design[d] {
            DimensionDesign::State { mean, .. } | DimensionDesign::Ensemble { mean, .. } => {
                *mean = new_mean;
            }
        }
        Ok(())
    }

    pub fn set_overlap(&mut self, overlap: bool) {
        self.design.overlap = overlap;
    }

    /// Metadata of the reference indices of dimension `d`.
    pub fn reference_metadata(&self, d: usize) -> Result<Vec<MetaValue>> {
        let coords = self.coordinates(d)?;
        Ok(self.design.design[d]
            .indices()
            .iter()
            .filter_map(|&i| coords.get(i))
            .collect())
    }

    /// Own indices along `d` whose metadata appears in `values`, in `values` order.
    pub fn match_metadata(&self, d: usize, values: &[MetaValue]) -> Result<Vec<usize>> {
        let coords = self.coordinates(d)?;
        Ok(values.iter().filter_map(|v| coords.position(v)).collect())
    }

    /// Valid reference indices along `d` given its sequence and mean offsets.
    pub fn valid_references(&self, d: usize) -> Result<Vec<usize>> {
        Ok(self.design.design[d].valid_references(self.dim_len(d)?))
    }

    /// Grid indices loaded along ensemble dimension `d` for reference `r`.
    pub fn load_indices(&self, d: usize, r: usize) -> Result<Vec<usize>> {
        Ok(self.design.design[d].load_indices(r, self.dim_len(d)?))
    }

    /// Load request for one member.
    ///
    /// `references` holds one reference index per ensemble dimension, in
    /// dimension order.
    pub fn load_request(&self, references: &[usize]) -> Result<LoadRequest> {
        let mut request = LoadRequest::new(&self.design.dims);
        let mut refs = references.iter();
        for (d, (name, design)) in self.design.dims.iter().zip(&self.design.design).enumerate() {
            let indices = match design {
                DimensionDesign::State { indices, .. } => indices.clone(),
                DimensionDesign::Ensemble { .. } => {
                    let &r = refs.next().ok_or_else(|| {
                        StateVectorError::validation(format!(
                            "no reference index given for ensemble dimension '{}'",
                            name
                        ))
                    })?;
                    self.load_indices(d, r)?
                }
            };
            request = request.with_indices(name.clone(), indices);
        }
        Ok(request)
    }
}

/// Names must be identifiers: a letter or underscore, then letters, digits
/// or underscores.
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StateVectorError::validation(format!(
            "'{}' is not a valid variable name",
            name
        )))
    }
}
