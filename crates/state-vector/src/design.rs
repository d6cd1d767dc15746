//! Per-dimension design: role, indices, sequences and means.
//!
//! A dimension is either a state dimension (fixed indices, one row block per
//! index) or an ensemble dimension (reference indices from which members are
//! drawn). Sequences only exist on ensemble dimensions, so the combination
//! "sequence on a state dimension" cannot be expressed.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use virtual_grid::Coordinates;

use crate::error::{Result, StateVectorError};

/// Role of a dimension in a state vector variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    State,
    Ensemble,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::State => write!(f, "state"),
            Self::Ensemble => write!(f, "ensemble"),
        }
    }
}

/// Indices along a dimension, as a list or as a mask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexSelection {
    /// Every index of the dimension.
    All,
    /// 0-based linear indices, in the order given.
    Linear(Vec<usize>),
    /// One flag per index of the dimension.
    Mask(Vec<bool>),
}

impl IndexSelection {
    /// Normalise to linear indices for a dimension of length `len`.
    pub fn resolve(&self, dim: &str, len: usize) -> Result<Vec<usize>> {
        let indices: Vec<usize> = match self {
            Self::All => (0..len).collect(),
            Self::Linear(list) => {
                if let Some(bad) = list.iter().find(|&&i| i >= len) {
                    return Err(StateVectorError::validation(format!(
                        "index {} is out of range for dimension '{}' of length {}",
                        bad, dim, len
                    )));
                }
                let mut seen = HashSet::new();
                if let Some(dup) = list.iter().find(|&&i| !seen.insert(i)) {
                    return Err(StateVectorError::validation(format!(
                        "index {} is listed twice for dimension '{}'",
                        dup, dim
                    )));
                }
                list.clone()
            }
            Self::Mask(mask) => {
                if mask.len() != len {
                    return Err(StateVectorError::validation(format!(
                        "mask for dimension '{}' has {} elements, dimension has {}",
                        dim,
                        mask.len(),
                        len
                    )));
                }
                mask.iter()
                    .enumerate()
                    .filter_map(|(i, &keep)| keep.then_some(i))
                    .collect()
            }
        };

        if indices.is_empty() {
            return Err(StateVectorError::validation(format!(
                "no indices selected for dimension '{}'",
                dim
            )));
        }
        Ok(indices)
    }
}

impl From<Vec<usize>> for IndexSelection {
    fn from(indices: Vec<usize>) -> Self {
        Self::Linear(indices)
    }
}

impl From<Vec<bool>> for IndexSelection {
    fn from(mask: Vec<bool>) -> Self {
        Self::Mask(mask)
    }
}

/// Treatment of missing values inside a mean.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NanPolicy {
    /// Any missing value makes the mean missing.
    #[default]
    Include,
    /// Missing values are dropped from the mean.
    Omit,
}

/// Offsets from a reference index that become separate row blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub offsets: Vec<i64>,
    /// One row per offset, unique and defined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Coordinates>,
}

impl Default for Sequence {
    fn default() -> Self {
        Self {
            offsets: vec![0],
            metadata: None,
        }
    }
}

impl Sequence {
    pub fn new(offsets: Vec<i64>, metadata: Option<Coordinates>) -> Self {
        Self { offsets, metadata }
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Check offsets and metadata rows.
    pub fn validate(&self, dim: &str) -> Result<()> {
        check_offsets(dim, "sequence", &self.offsets)?;
        if let Some(metadata) = &self.metadata {
            if metadata.len() != self.offsets.len() {
                return Err(StateVectorError::validation(format!(
                    "sequence for dimension '{}' has {} offsets but {} metadata rows",
                    dim,
                    self.offsets.len(),
                    metadata.len()
                )));
            }
            if metadata.is_undefined() {
                return Err(StateVectorError::validation(format!(
                    "sequence metadata for dimension '{}' is undefined",
                    dim
                )));
            }
            metadata
                .validate(dim)
                .map_err(|e| StateVectorError::validation(e.to_string()))?;
        }
        Ok(())
    }
}

/// Values averaged into a single row.
///
/// On a state dimension the mean runs over the selected state indices and
/// `offsets` must be empty. On an ensemble dimension it runs over `offsets`
/// from each sequence element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mean {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offsets: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<Vec<f64>>,
    #[serde(default)]
    pub nan: NanPolicy,
}

impl Mean {
    /// Mean over the state indices of a state dimension.
    pub fn state() -> Self {
        Self {
            offsets: Vec::new(),
            weights: None,
            nan: NanPolicy::Include,
        }
    }

    /// Mean over offsets from the reference of an ensemble dimension.
    pub fn offsets(offsets: Vec<i64>) -> Self {
        Self {
            offsets,
            ..Self::state()
        }
    }

    pub fn with_weights(mut self, weights: Vec<f64>) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn omit_nan(mut self) -> Self {
        self.nan = NanPolicy::Omit;
        self
    }

    fn check_weights(&self, dim: &str, expected: usize) -> Result<()> {
        let Some(weights) = &self.weights else {
            return Ok(());
        };
        if weights.len() != expected {
            return Err(StateVectorError::validation(format!(
                "mean for dimension '{}' has {} weights for {} averaged values",
                dim,
                weights.len(),
                expected
            )));
        }
        if weights.iter().any(|w| !w.is_finite()) || weights.iter().sum::<f64>() == 0.0 {
            return Err(StateVectorError::validation(format!(
                "mean weights for dimension '{}' must be finite with a non-zero sum",
                dim
            )));
        }
        Ok(())
    }
}

/// Design of one dimension of a variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum DimensionDesign {
    State {
        indices: Vec<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mean: Option<Mean>,
    },
    Ensemble {
        reference: Vec<usize>,
        #[serde(default)]
        sequence: Sequence,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mean: Option<Mean>,
    },
}

impl DimensionDesign {
    pub fn state(indices: Vec<usize>) -> Self {
        Self::State {
            indices,
            mean: None,
        }
    }

    pub fn ensemble(reference: Vec<usize>) -> Self {
        Self::Ensemble {
            reference,
            sequence: Sequence::default(),
            mean: None,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::State { .. } => Role::State,
            Self::Ensemble { .. } => Role::Ensemble,
        }
    }

    /// State indices, or reference indices of an ensemble dimension.
    pub fn indices(&self) -> &[usize] {
        match self {
            Self::State { indices, .. } => indices,
            Self::Ensemble { reference, .. } => reference,
        }
    }

    pub fn mean(&self) -> Option<&Mean> {
        match self {
            Self::State { mean, .. } | Self::Ensemble { mean, .. } => mean.as_ref(),
        }
    }

    pub fn sequence(&self) -> Option<&Sequence> {
        match self {
            Self::State { .. } => None,
            Self::Ensemble { sequence, .. } => Some(sequence),
        }
    }

    /// Switch role, keeping the index list and dropping sequence and mean.
    pub fn into_role(self, role: Role) -> Self {
        match (self, role) {
            (Self::State { indices, .. }, Role::Ensemble) => Self::ensemble(indices),
            (Self::Ensemble { reference, .. }, Role::State) => Self::state(reference),
            (this, _) => this,
        }
    }

    /// Rows this dimension contributes to the state vector.
    pub fn state_size(&self) -> usize {
        match self {
            Self::State { mean: Some(_), .. } => 1,
            Self::State { indices, .. } => indices.len(),
            Self::Ensemble { sequence, .. } => sequence.len(),
        }
    }

    /// Number of loaded values averaged into each row along this dimension.
    pub fn mean_width(&self) -> usize {
        match self {
            Self::State { indices, mean: Some(_) } => indices.len(),
            Self::Ensemble { mean: Some(mean), .. } => mean.offsets.len(),
            _ => 1,
        }
    }

    /// Offsets from a reference index loaded for each member, sequence-major.
    ///
    /// Empty for state dimensions.
    pub fn offsets(&self) -> Vec<i64> {
        match self {
            Self::State { .. } => Vec::new(),
            Self::Ensemble { sequence, mean, .. } => {
                let mean_offsets: &[i64] = match mean {
                    Some(mean) => &mean.offsets,
                    None => &[0],
                };
                sequence
                    .offsets
                    .iter()
                    .flat_map(|s| mean_offsets.iter().map(move |m| s + m))
                    .collect()
            }
        }
    }

    /// Reference indices for which every offset stays inside `0..len`.
    pub fn valid_references(&self, len: usize) -> Vec<usize> {
        let offsets = self.offsets();
        self.indices()
            .iter()
            .copied()
            .filter(|&r| offsets.iter().all(|&o| shift(r, o, len).is_some()))
            .collect()
    }

    /// Grid indices loaded for reference `r`, in row order.
    ///
    /// `r` must be a valid reference; offsets falling outside `0..len` are skipped.
    pub fn load_indices(&self, r: usize, len: usize) -> Vec<usize> {
        self.offsets()
            .into_iter()
            .filter_map(|o| shift(r, o, len))
            .collect()
    }

    /// Check a mean against this dimension's role and indices.
    pub fn check_mean(&self, dim: &str, mean: &Mean) -> Result<()> {
        match self {
            Self::State { indices, .. } => {
                if !mean.offsets.is_empty() {
                    return Err(StateVectorError::validation(format!(
                        "state dimension '{}' averages its state indices; mean offsets are not allowed",
                        dim
                    )));
                }
                mean.check_weights(dim, indices.len())
            }
            Self::Ensemble { .. } => {
                check_offsets(dim, "mean", &mean.offsets)?;
                mean.check_weights(dim, mean.offsets.len())
            }
        }
    }
}

fn shift(r: usize, offset: i64, len: usize) -> Option<usize> {
    let i = r as i64 + offset;
    (i >= 0 && (i as usize) < len).then_some(i as usize)
}

fn check_offsets(dim: &str, what: &str, offsets: &[i64]) -> Result<()> {
    if offsets.is_empty() {
        return Err(StateVectorError::validation(format!(
            "{} for dimension '{}' needs at least one offset",
            what, dim
        )));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = offsets.iter().find(|&&o| !seen.insert(o)) {
        return Err(StateVectorError::validation(format!(
            "{} offset {} is repeated for dimension '{}'",
            what, dup, dim
        )));
    }
    Ok(())
}
