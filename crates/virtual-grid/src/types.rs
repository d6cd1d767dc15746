//! Core types for the virtual grid: coordinate columns, dimensions and load results.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};

/// One coordinate value along a dimension.
///
/// Numbers compare by bit pattern so values can be used as hash keys;
/// NaN never appears in a validated column.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MetaValue {
    Number(f64),
    Time(DateTime<Utc>),
    Text(String),
    Undefined,
}

impl PartialEq for MetaValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.to_bits() == b.to_bits(),
            (Self::Time(a), Self::Time(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Undefined, Self::Undefined) => true,
            _ => false,
        }
    }
}

impl Eq for MetaValue {}

impl Hash for MetaValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Number(v) => v.to_bits().hash(state),
            Self::Time(t) => t.hash(state),
            Self::Text(s) => s.hash(state),
            Self::Undefined => {}
        }
    }
}

impl std::fmt::Display for MetaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(v) => write!(f, "{}", v),
            Self::Time(t) => write!(f, "{}", t.to_rfc3339()),
            Self::Text(s) => write!(f, "{}", s),
            Self::Undefined => write!(f, "undefined"),
        }
    }
}

/// Coordinate metadata for one dimension: one row per index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum Coordinates {
    Numeric(Vec<f64>),
    Text(Vec<String>),
    Time(Vec<DateTime<Utc>>),
    /// Placeholder rows for a dimension the data does not really have.
    Undefined(usize),
}

impl Coordinates {
    /// Number of rows.
    pub fn len(&self) -> usize {
        match self {
            Self::Numeric(v) => v.len(),
            Self::Text(v) => v.len(),
            Self::Time(v) => v.len(),
            Self::Undefined(n) => *n,
        }
    }

    /// Check if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether these are placeholder rows.
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined(_))
    }

    /// Get row `i`.
    pub fn get(&self, i: usize) -> Option<MetaValue> {
        match self {
            Self::Numeric(v) => v.get(i).map(|x| MetaValue::Number(*x)),
            Self::Text(v) => v.get(i).map(|x| MetaValue::Text(x.clone())),
            Self::Time(v) => v.get(i).map(|x| MetaValue::Time(*x)),
            Self::Undefined(n) => (i < *n).then_some(MetaValue::Undefined),
        }
    }

    /// Rows at the given indices, in the given order. Indices must be in range.
    pub fn select(&self, indices: &[usize]) -> Coordinates {
        match self {
            Self::Numeric(v) => Self::Numeric(indices.iter().map(|&i| v[i]).collect()),
            Self::Text(v) => Self::Text(indices.iter().map(|&i| v[i].clone()).collect()),
            Self::Time(v) => Self::Time(indices.iter().map(|&i| v[i]).collect()),
            Self::Undefined(_) => Self::Undefined(indices.len()),
        }
    }

    /// Position of the first row equal to `value`.
    pub fn position(&self, value: &MetaValue) -> Option<usize> {
        match (self, value) {
            (Self::Numeric(v), MetaValue::Number(x)) => {
                v.iter().position(|y| y.to_bits() == x.to_bits())
            }
            (Self::Text(v), MetaValue::Text(x)) => v.iter().position(|y| y == x),
            (Self::Time(v), MetaValue::Time(x)) => v.iter().position(|y| y == x),
            (Self::Undefined(n), MetaValue::Undefined) if *n > 0 => Some(0),
            _ => None,
        }
    }

    /// Append rows of the same kind.
    pub fn extend(&mut self, other: Coordinates) -> Result<()> {
        match (self, other) {
            (Self::Numeric(a), Self::Numeric(b)) => a.extend(b),
            (Self::Text(a), Self::Text(b)) => a.extend(b),
            (Self::Time(a), Self::Time(b)) => a.extend(b),
            (Self::Undefined(a), Self::Undefined(b)) => *a += b,
            (this, other) => {
                return Err(GridError::validation(format!(
                    "cannot append {} coordinates to {} coordinates",
                    other.kind(),
                    this.kind()
                )))
            }
        }
        Ok(())
    }

    /// Name of the column kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Numeric(_) => "numeric",
            Self::Text(_) => "text",
            Self::Time(_) => "time",
            Self::Undefined(_) => "undefined",
        }
    }

    /// Check that the column has no duplicate and no undefined rows.
    pub fn validate(&self, dim: &str) -> Result<()> {
        if self.is_empty() {
            return Err(GridError::validation(format!(
                "dimension '{}' has no coordinate rows",
                dim
            )));
        }
        match self {
            Self::Numeric(v) => {
                if let Some(i) = v.iter().position(|x| !x.is_finite()) {
                    return Err(GridError::validation(format!(
                        "dimension '{}' has an undefined coordinate at row {}",
                        dim, i
                    )));
                }
                check_unique(dim, v.iter().map(|x| x.to_bits()))
            }
            Self::Text(v) => {
                if let Some(i) = v.iter().position(|s| s.trim().is_empty()) {
                    return Err(GridError::validation(format!(
                        "dimension '{}' has an empty coordinate at row {}",
                        dim, i
                    )));
                }
                check_unique(dim, v.iter())
            }
            Self::Time(v) => check_unique(dim, v.iter()),
            Self::Undefined(n) if *n == 1 => Ok(()),
            Self::Undefined(n) => Err(GridError::validation(format!(
                "undefined dimension '{}' must be a singleton, found {} rows",
                dim, n
            ))),
        }
    }
}

fn check_unique<T: Hash + Eq>(dim: &str, values: impl Iterator<Item = T>) -> Result<()> {
    let mut seen = HashSet::new();
    for (row, value) in values.enumerate() {
        if !seen.insert(value) {
            return Err(GridError::validation(format!(
                "dimension '{}' has a duplicate coordinate at row {}",
                dim, row
            )));
        }
    }
    Ok(())
}

/// A named grid dimension with its coordinate axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub coordinates: Coordinates,
}

impl Dimension {
    pub fn new(name: impl Into<String>, coordinates: Coordinates) -> Self {
        Self {
            name: name.into(),
            coordinates,
        }
    }

    /// A singleton placeholder dimension.
    pub fn undefined(name: impl Into<String>) -> Self {
        Self::new(name, Coordinates::Undefined(1))
    }

    pub fn len(&self) -> usize {
        self.coordinates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinates.is_empty()
    }

    /// Whether the dimension is part of the data's native dimensionality.
    pub fn is_defined(&self) -> bool {
        !self.coordinates.is_undefined()
    }
}

/// Data loaded from a grid, with coordinates sliced to the loaded indices.
#[derive(Debug, Clone)]
pub struct GridRegion {
    /// Values in `dims` order. Missing elements are NaN.
    pub data: ArrayD<f64>,
    /// Dimension names of each axis of `data`.
    pub dims: Vec<String>,
    /// Coordinates of each axis of `data`.
    pub coordinates: Vec<Coordinates>,
}

impl GridRegion {
    /// Axis position of a named dimension.
    pub fn axis(&self, dim: &str) -> Option<usize> {
        self.dims.iter().position(|d| d == dim)
    }

    /// Coordinates of a named dimension.
    pub fn coordinates_of(&self, dim: &str) -> Option<&Coordinates> {
        self.axis(dim).map(|a| &self.coordinates[a])
    }

    /// Number of missing (NaN) elements.
    pub fn missing_count(&self) -> usize {
        self.data.iter().filter(|v| v.is_nan()).count()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Statistics about a source cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Handles built (source opens).
    pub builds: u64,
    /// Requests served by an already-built handle.
    pub hits: u64,
    /// Slots currently populated.
    pub entries: usize,
    /// Total slots.
    pub slots: usize,
}

impl CacheStats {
    /// Fraction of requests served without opening a source (0.0 - 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.builds;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_select_keeps_request_order() {
        let coords = Coordinates::Numeric(vec![10.0, 20.0, 30.0, 40.0]);
        assert_eq!(
            coords.select(&[3, 0, 2]),
            Coordinates::Numeric(vec![40.0, 10.0, 30.0])
        );
    }

    #[test]
    fn test_validate_rejects_duplicates_and_nan() {
        assert!(Coordinates::Numeric(vec![1.0, 2.0]).validate("x").is_ok());
        assert!(Coordinates::Numeric(vec![1.0, 1.0]).validate("x").is_err());
        assert!(Coordinates::Numeric(vec![1.0, f64::NAN]).validate("x").is_err());
        assert!(Coordinates::Text(vec!["a".into(), "a".into()]).validate("x").is_err());
        assert!(Coordinates::Text(vec!["a".into(), " ".into()]).validate("x").is_err());
        assert!(Coordinates::Numeric(vec![]).validate("x").is_err());
        assert!(Coordinates::Undefined(1).validate("x").is_ok());
        assert!(Coordinates::Undefined(2).validate("x").is_err());
    }

    #[test]
    fn test_position_and_get() {
        let t0 = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2000, 2, 1, 0, 0, 0).unwrap();
        let coords = Coordinates::Time(vec![t0, t1]);

        assert_eq!(coords.get(1), Some(MetaValue::Time(t1)));
        assert_eq!(coords.position(&MetaValue::Time(t1)), Some(1));
        assert_eq!(coords.position(&MetaValue::Number(1.0)), None);
        assert_eq!(coords.get(2), None);
    }

    #[test]
    fn test_extend_requires_same_kind() {
        let mut coords = Coordinates::Numeric(vec![1.0]);
        coords.extend(Coordinates::Numeric(vec![2.0])).unwrap();
        assert_eq!(coords.len(), 2);
        assert!(coords.extend(Coordinates::Text(vec!["a".into()])).is_err());
    }

    #[test]
    fn test_meta_value_hash_eq() {
        let mut set = HashSet::new();
        set.insert(MetaValue::Number(1.5));
        assert!(set.contains(&MetaValue::Number(1.5)));
        assert!(!set.contains(&MetaValue::Text("1.5".into())));
    }

    #[test]
    fn test_meta_value_serde_keeps_kind() {
        let values = vec![
            MetaValue::Text("2000-01-01T00:00:00Z".into()),
            MetaValue::Time(Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap()),
            MetaValue::Number(3.0),
            MetaValue::Text("3".into()),
            MetaValue::Undefined,
        ];
        let json = serde_json::to_string(&values).unwrap();
        let back: Vec<MetaValue> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, values);
    }

    #[test]
    fn test_cache_stats_hit_rate() {
        let mut stats = CacheStats::default();
        assert!((stats.hit_rate() - 0.0).abs() < f64::EPSILON);

        stats.hits = 3;
        stats.builds = 1;
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
