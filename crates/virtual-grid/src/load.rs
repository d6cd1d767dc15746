//! Loading data through the virtual grid.
//!
//! # Algorithm
//!
//! ```text
//! LoadRequest (order + indices)
//!      │
//!      ├─► Normalise indices (unrequested dims -> full range)
//!      │
//!      ├─► Load limits: [min, max] of the requested indices per dimension
//!      │
//!      ├─► Candidate sources: dim_limit intersects the load limits everywhere
//!      │
//!      ├─► Per candidate: SourceCache::get_or_build
//!      │         │
//!      │         ├─► requested indices inside its coverage
//!      │         └─► grid index -> local index, output position, read
//!      │
//!      ├─► Scatter blocks into the output (first covering source wins)
//!      │
//!      └─► Permute to the requested order, drop undefined singletons
//! ```
//!
//! The candidate filter is coarse: a source whose range brackets scattered
//! indices without containing any of them is admitted and opened, then
//! contributes nothing. Elements no source covers stay NaN.

use std::collections::{HashMap, HashSet};

use ndarray::{ArrayD, Axis, IxDyn};
use rayon::prelude::*;

use crate::cache::SourceCache;
use crate::error::{GridError, Result};
use crate::grid::{GridFile, SourceEntry};
use crate::source::DataSource;
use crate::types::GridRegion;

/// Which part of a grid to load, and in which dimension order.
#[derive(Debug, Clone, Default)]
pub struct LoadRequest {
    order: Vec<String>,
    indices: HashMap<String, Vec<usize>>,
}

impl LoadRequest {
    /// Request the given leading output dimensions; remaining grid dimensions
    /// follow in grid order.
    pub fn new<S: AsRef<str>>(order: &[S]) -> Self {
        Self {
            order: order.iter().map(|s| s.as_ref().to_string()).collect(),
            indices: HashMap::new(),
        }
    }

    /// Load the whole grid in grid order.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict a dimension to the given grid indices, in output order.
    pub fn with_indices(mut self, dim: impl Into<String>, indices: Vec<usize>) -> Self {
        self.indices.insert(dim.into(), indices);
        self
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn indices(&self, dim: &str) -> Option<&[usize]> {
        self.indices.get(dim).map(Vec::as_slice)
    }
}

/// Per-source read plan: which requested elements a source supplies.
struct SourcePlan {
    source: usize,
    /// Output positions covered, per grid dimension.
    positions: Vec<Vec<usize>>,
    /// Local read indices, per native dimension.
    local: Vec<Vec<usize>>,
    /// Grid dimension of each native axis.
    native_axes: Vec<usize>,
}

impl GridFile {
    /// Load with a fresh source cache.
    pub fn load(&self, request: &LoadRequest) -> Result<GridRegion> {
        let cache = self.source_cache();
        self.repeated_load(request, &cache)
    }

    /// Load part of the grid, reusing source handles held in `cache`.
    ///
    /// `cache` must come from [`GridFile::source_cache`] on this catalog; it is
    /// populated with any sources this load opens, so later loads skip the
    /// open cost.
    pub fn repeated_load(&self, request: &LoadRequest, cache: &SourceCache) -> Result<GridRegion> {
        if cache.len() != self.num_sources() {
            return Err(GridError::validation(format!(
                "source cache has {} slots but the grid has {} sources",
                cache.len(),
                self.num_sources()
            )));
        }

        let order = self.output_order(request)?;
        let indices = self.normalize_indices(request)?;

        let shape: Vec<usize> = indices.iter().map(Vec::len).collect();
        let load_limits: Vec<[usize; 2]> = indices
            .iter()
            .map(|list| {
                let min = list.iter().copied().min().unwrap_or(0);
                let max = list.iter().copied().max().unwrap_or(0);
                [min, max]
            })
            .collect();

        let candidates: Vec<usize> = self
            .sources()
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.intersects(&load_limits))
            .map(|(s, _)| s)
            .collect();

        // Every candidate is opened; only those holding requested elements are read.
        let plans: Vec<(usize, Option<SourcePlan>)> = candidates
            .iter()
            .map(|&s| (s, self.plan_source(s, &indices)))
            .collect();

        let contributing = plans.iter().filter(|(_, plan)| plan.is_some()).count();
        if contributing < candidates.len() {
            tracing::debug!(
                admitted = candidates.len(),
                contributing,
                "Candidate sources hold none of the scattered indices"
            );
        }

        tracing::debug!(
            grid = ?self.path(),
            shape = ?shape,
            sources = candidates.len(),
            "Loading from {} sources",
            candidates.len()
        );

        let read_one = |(s, plan): &(usize, Option<SourcePlan>)| -> Result<Option<ArrayD<f64>>> {
            let entry = &self.sources()[*s];
            let handle = cache.get_or_build(*s, || {
                entry
                    .spec
                    .open(self.root(), &entry.native_shape(self.dimensions()))
                    .map_err(|e| with_range(e, &load_limits))
            })?;
            plan.as_ref()
                .map(|plan| read_block(entry, handle.as_ref(), plan))
                .transpose()
        };

        let blocks: Vec<Option<ArrayD<f64>>> = if self.config().parallel_reads && plans.len() > 1 {
            plans.par_iter().map(read_one).collect::<Result<_>>()?
        } else {
            plans.iter().map(read_one).collect::<Result<_>>()?
        };

        let mut output = ArrayD::from_elem(IxDyn(&shape), f64::NAN);
        let mut filled = ArrayD::from_elem(IxDyn(&shape), false);
        for ((_, plan), block) in plans.iter().zip(&blocks) {
            if let (Some(plan), Some(block)) = (plan, block) {
                scatter(&mut output, &mut filled, block, plan);
            }
        }

        let missing_coverage = filled.iter().filter(|f| !**f).count();
        if missing_coverage > 0 {
            tracing::debug!(
                elements = missing_coverage,
                "Requested elements not covered by any source"
            );
        }

        Ok(self.arrange(output, &indices, &order, request.order().len()))
    }

    /// Output dimension order: requested dims, then the rest in grid order.
    fn output_order(&self, request: &LoadRequest) -> Result<Vec<usize>> {
        let mut order = Vec::with_capacity(self.dimensions().len());
        let mut seen = HashSet::new();
        for name in request.order() {
            let d = self.dim_index(name).ok_or_else(|| {
                GridError::validation(format!("'{}' is not a dimension of this grid", name))
            })?;
            if !seen.insert(d) {
                return Err(GridError::validation(format!(
                    "dimension '{}' is listed twice in the load order",
                    name
                )));
            }
            order.push(d);
        }
        order.extend((0..self.dimensions().len()).filter(|d| !seen.contains(d)));
        Ok(order)
    }

    /// Requested grid indices per dimension, in grid order.
    fn normalize_indices(&self, request: &LoadRequest) -> Result<Vec<Vec<usize>>> {
        for name in request.indices.keys() {
            if self.dim_index(name).is_none() {
                return Err(GridError::validation(format!(
                    "indices given for unknown dimension '{}'",
                    name
                )));
            }
        }

        self.dimensions()
            .iter()
            .map(|dim| match request.indices(&dim.name) {
                None => Ok((0..dim.len()).collect()),
                Some([]) => Err(GridError::validation(format!(
                    "no indices requested for dimension '{}'",
                    dim.name
                ))),
                Some(list) => match list.iter().find(|&&i| i >= dim.len()) {
                    Some(bad) => Err(GridError::validation(format!(
                        "index {} is out of range for dimension '{}' of length {}",
                        bad,
                        dim.name,
                        dim.len()
                    ))),
                    None => Ok(list.to_vec()),
                },
            })
            .collect()
    }

    /// Work out which requested elements source `s` holds.
    fn plan_source(&self, s: usize, indices: &[Vec<usize>]) -> Option<SourcePlan> {
        let entry = &self.sources()[s];
        let mut positions = Vec::with_capacity(indices.len());
        let mut local_by_dim = Vec::with_capacity(indices.len());

        for (d, list) in indices.iter().enumerate() {
            let [lo, _] = entry.dim_limit[d];
            let (pos, local): (Vec<usize>, Vec<usize>) = list
                .iter()
                .enumerate()
                .filter(|&(_, &i)| entry.covers(d, i))
                .map(|(p, &i)| (p, i - lo))
                .unzip();
            if pos.is_empty() {
                return None;
            }
            positions.push(pos);
            local_by_dim.push(local);
        }

        let native_axes: Vec<usize> = entry
            .spec
            .dims
            .iter()
            .filter_map(|name| self.dim_index(name))
            .collect();
        let local = native_axes.iter().map(|&d| local_by_dim[d].clone()).collect();

        Some(SourcePlan {
            source: s,
            positions,
            local,
            native_axes,
        })
    }

    /// Permute to the output order, slice coordinates, drop undefined singletons
    /// the caller did not ask for.
    fn arrange(
        &self,
        output: ArrayD<f64>,
        indices: &[Vec<usize>],
        order: &[usize],
        requested: usize,
    ) -> GridRegion {
        let data = output.permuted_axes(IxDyn(order)).as_standard_layout().into_owned();

        let mut region = GridRegion {
            data,
            dims: order.iter().map(|&d| self.dimensions()[d].name.clone()).collect(),
            coordinates: order
                .iter()
                .map(|&d| self.dimensions()[d].coordinates.select(&indices[d]))
                .collect(),
        };

        for axis in (0..order.len()).rev() {
            let dim = &self.dimensions()[order[axis]];
            let explicit = axis < requested;
            if !dim.is_defined() && region.data.len_of(Axis(axis)) == 1 && !explicit {
                region.data = region.data.index_axis_move(Axis(axis), 0);
                region.dims.remove(axis);
                region.coordinates.remove(axis);
            }
        }
        region
    }
}

/// Report an open failure against the grid range the load asked for.
fn with_range(err: GridError, load_limits: &[[usize; 2]]) -> GridError {
    match err {
        GridError::SourceUnreadable {
            source_id, reason, ..
        } => GridError::SourceUnreadable {
            source_id,
            range: format!("{:?}", load_limits),
            reason,
        },
        other => other,
    }
}

/// Read one source's block and apply its value conversion.
fn read_block(entry: &SourceEntry, handle: &dyn DataSource, plan: &SourcePlan) -> Result<ArrayD<f64>> {
    let mut block = handle.read(&plan.local)?;
    let expected: Vec<usize> = plan.local.iter().map(Vec::len).collect();
    if block.shape() != expected.as_slice() {
        return Err(GridError::source_unreadable(
            entry.spec.id(),
            format!("{:?}", plan.local),
            format!("read returned shape {:?}, expected {:?}", block.shape(), expected),
        ));
    }
    entry.spec.convert(&mut block);
    Ok(block)
}

/// Write a native-order block into the grid-order output.
///
/// Grid dimensions the source does not store are broadcast from its single
/// value along them. Elements already written by an earlier source are kept.
fn scatter(output: &mut ArrayD<f64>, filled: &mut ArrayD<bool>, block: &ArrayD<f64>, plan: &SourcePlan) {
    let counts: Vec<usize> = plan.positions.iter().map(Vec::len).collect();
    let mut native = vec![0usize; plan.native_axes.len()];
    let mut target = vec![0usize; counts.len()];

    for_each_index(&counts, |idx| {
        for (k, &d) in plan.native_axes.iter().enumerate() {
            native[k] = idx[d];
        }
        for (d, &i) in idx.iter().enumerate() {
            target[d] = plan.positions[d][i];
        }
        if !filled[target.as_slice()] {
            output[target.as_slice()] = block[native.as_slice()];
            filled[target.as_slice()] = true;
        }
    });
}

/// Visit every multi-index of `shape` in row-major order.
pub(crate) fn for_each_index(shape: &[usize], mut visit: impl FnMut(&[usize])) {
    if shape.iter().any(|&n| n == 0) {
        return;
    }
    let mut idx = vec![0usize; shape.len()];
    loop {
        visit(&idx);
        let mut axis = shape.len();
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            idx[axis] += 1;
            if idx[axis] < shape[axis] {
                break;
            }
            idx[axis] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_each_index_row_major() {
        let mut seen = Vec::new();
        for_each_index(&[2, 3], |idx| seen.push(idx.to_vec()));
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[0], vec![0, 0]);
        assert_eq!(seen[1], vec![0, 1]);
        assert_eq!(seen[5], vec![1, 2]);
    }

    #[test]
    fn test_for_each_index_scalar_and_empty() {
        let mut count = 0;
        for_each_index(&[], |_| count += 1);
        assert_eq!(count, 1);

        count = 0;
        for_each_index(&[3, 0], |_| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_load_request_builder() {
        let request = LoadRequest::new(&["time", "lat"]).with_indices("time", vec![3, 1]);
        assert_eq!(request.order(), &["time".to_string(), "lat".to_string()]);
        assert_eq!(request.indices("time"), Some(&[3usize, 1][..]));
        assert_eq!(request.indices("lat"), None);
    }
}
