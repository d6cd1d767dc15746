//! Ensemble construction.
//!
//! # Algorithm
//!
//! ```text
//! StateVector::build(members, config)
//!      │
//!      ├─► Per coupled set
//!      │         │
//!      │         ├─► Valid references per variable (offsets stay in range)
//!      │         ├─► Intersect by metadata across the set
//!      │         └─► Draw members: shuffled or sequential, honouring overlap
//!      │
//!      ├─► Per variable: load every member through the virtual grid
//!      │         │   (shared source cache, members in parallel)
//!      │         └─► Average mean axes, flag rows with missing raw values
//!      │
//!      └─► Stack variables along rows, members along columns
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ndarray::{Array2, ArrayD, ArrayView1, Axis, Slice};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use virtual_grid::{GridFile, MetaValue, SourceCache};

use crate::config::BuildConfig;
use crate::design::NanPolicy;
use crate::ensemble::{Ensemble, EnsembleMetadata, VariableMetadata};
use crate::error::{Result, StateVectorError};
use crate::state_vector::StateVector;
use crate::variable::StateVectorVariable;

/// Reference indices per member, one per ensemble dimension in dimension order.
type MemberReferences = Vec<Vec<usize>>;

impl StateVector {
    /// Draw `members` ensemble members and load them into an ensemble matrix.
    ///
    /// On success the state vector is frozen. A failed build leaves it in the
    /// design phase.
    pub fn build(&mut self, members: usize, config: &BuildConfig) -> Result<Ensemble> {
        self.ensure_design()?;
        if members == 0 {
            return Err(StateVectorError::validation("an ensemble needs at least one member"));
        }
        if self.is_empty() {
            return Err(StateVectorError::validation("the state vector has no variables"));
        }

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let variables = self.variables();
        let mut draws: Vec<Option<MemberReferences>> = vec![None; variables.len()];
        for set in self.coupling().sets() {
            let set_draws = draw_members(variables, &set, members, config.sequential, &mut rng)?;
            for (&v, references) in set.iter().zip(set_draws) {
                draws[v] = Some(references);
            }
        }

        let draws = draws
            .into_iter()
            .zip(variables)
            .map(|(references, var)| {
                references.ok_or_else(|| {
                    StateVectorError::conflict(format!("variable '{}' belongs to no coupled set", var.name()))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let caches = GridCaches::new(variables);
        let (data, has_nan, metadata) = assemble(variables, draws, members, config, &caches)?;
        let rows = data.nrows();

        let ensemble = Ensemble {
            data,
            metadata: EnsembleMetadata {
                variables: metadata,
                coupling: self.coupled_sets(),
                has_nan,
            },
        };

        tracing::info!(
            variables = self.len(),
            rows,
            members,
            missing_rows = ensemble.metadata.has_nan.iter().filter(|f| **f).count(),
            sources_opened = caches.builds(),
            "Built ensemble"
        );

        self.mark_built();
        Ok(ensemble)
    }
}

/// One source cache per distinct grid, shared by every variable that reads it.
struct GridCaches {
    caches: Vec<(Arc<GridFile>, SourceCache)>,
}

impl GridCaches {
    fn new(variables: &[StateVectorVariable]) -> Self {
        let mut caches: Vec<(Arc<GridFile>, SourceCache)> = Vec::new();
        for var in variables {
            if !caches.iter().any(|(grid, _)| Arc::ptr_eq(grid, var.grid())) {
                caches.push((var.grid().clone(), var.grid().source_cache()));
            }
        }
        Self { caches }
    }

    fn get(&self, grid: &Arc<GridFile>) -> Result<&SourceCache> {
        self.caches
            .iter()
            .find(|(g, _)| Arc::ptr_eq(g, grid))
            .map(|(_, cache)| cache)
            .ok_or_else(|| StateVectorError::conflict("no source cache for the grid of a variable"))
    }

    /// Sources opened across every grid.
    fn builds(&self) -> u64 {
        self.caches.iter().map(|(_, cache)| cache.stats().builds).sum()
    }
}

/// Load every variable's members and stack them into the ensemble matrix.
fn assemble(
    variables: &[StateVectorVariable],
    draws: Vec<MemberReferences>,
    members: usize,
    config: &BuildConfig,
    caches: &GridCaches,
) -> Result<(Array2<f64>, Vec<bool>, Vec<VariableMetadata>)> {
    let rows: usize = variables.iter().map(|v| v.length()).sum();
    let mut data = Array2::from_elem((rows, members), f64::NAN);
    let mut has_nan = vec![false; rows];
    let mut metadata = Vec::with_capacity(variables.len());
    let mut start = 0;

    for (var, references) in variables.iter().zip(draws) {
        let cache = caches.get(var.grid())?;
        let columns = load_members(var, &references, cache, config.parallel)?;

        let length = var.length();
        for (m, (values, missing)) in columns.iter().enumerate() {
            data.slice_mut(ndarray::s![start..start + length, m])
                .assign(&ArrayView1::from(values.as_slice()));
            for (flag, &miss) in has_nan[start..start + length].iter_mut().zip(missing) {
                *flag |= miss;
            }
        }

        let stats = cache.stats();
        tracing::debug!(
            variable = var.name(),
            rows = length,
            members,
            sources_opened = stats.builds,
            cache_hits = stats.hits,
            "Loaded variable"
        );

        metadata.push(VariableMetadata::new(var, start, references)?);
        start += length;
    }
    Ok((data, has_nan, metadata))
}

/// Reference domain of one variable, keyed by metadata.
struct ReferenceDomain {
    /// Variable dimension of each shared ensemble dimension, in template order.
    dims: Vec<usize>,
    /// Metadata tuples in reference order.
    order: Vec<Vec<MetaValue>>,
    /// Reference indices of each metadata tuple, in template order.
    references: HashMap<Vec<MetaValue>, Vec<usize>>,
}

impl ReferenceDomain {
    fn new(var: &StateVectorVariable, names: &[String]) -> Result<Self> {
        let own = var.ensemble_dims();
        if own.len() != names.len() || own.iter().any(|&d| !names.contains(&var.dims()[d])) {
            return Err(StateVectorError::conflict(format!(
                "variable '{}' does not share the ensemble dimensions {:?} of its coupled set",
                var.name(),
                names
            )));
        }
        let dims = names
            .iter()
            .map(|name| var.dim_position(name))
            .collect::<Result<Vec<_>>>()?;

        let valid = dims
            .iter()
            .map(|&d| var.valid_references(d))
            .collect::<Result<Vec<_>>>()?;

        let mut order = Vec::new();
        let mut references = HashMap::new();
        for tuple in cartesian(&valid) {
            let key = tuple
                .iter()
                .zip(&dims)
                .map(|(&r, &d)| Ok(var.coordinates(d)?.get(r).unwrap_or(MetaValue::Undefined)))
                .collect::<Result<Vec<_>>>()?;
            if references.insert(key.clone(), tuple).is_none() {
                order.push(key);
            }
        }

        Ok(Self {
            dims,
            order,
            references,
        })
    }

    /// Grid index tuples along the shared dimensions loaded for `key`.
    fn touched(&self, var: &StateVectorVariable, key: &[MetaValue]) -> Result<Vec<Vec<usize>>> {
        let Some(references) = self.references.get(key) else {
            return Ok(Vec::new());
        };
        let per_dim = self
            .dims
            .iter()
            .zip(references)
            .map(|(&d, &r)| var.load_indices(d, r))
            .collect::<Result<Vec<_>>>()?;
        Ok(cartesian(&per_dim))
    }

    /// References for `key` in the variable's own dimension order.
    fn member_references(&self, key: &[MetaValue]) -> Vec<usize> {
        let Some(references) = self.references.get(key) else {
            return Vec::new();
        };
        let mut pairs: Vec<(usize, usize)> = self.dims.iter().copied().zip(references.iter().copied()).collect();
        pairs.sort_unstable();
        pairs.into_iter().map(|(_, r)| r).collect()
    }
}

/// Draw one shared set of member coordinates for a coupled set.
///
/// Returns references per variable of the set, in set order.
fn draw_members(
    variables: &[StateVectorVariable],
    set: &[usize],
    members: usize,
    sequential: bool,
    rng: &mut StdRng,
) -> Result<Vec<MemberReferences>> {
    let template = &variables[set[0]];
    let names: Vec<String> = template
        .ensemble_dims()
        .into_iter()
        .map(|d| template.dims()[d].clone())
        .collect();

    let domains = set
        .iter()
        .map(|&v| ReferenceDomain::new(&variables[v], &names))
        .collect::<Result<Vec<_>>>()?;

    let mut candidates: Vec<&Vec<MetaValue>> = domains[0]
        .order
        .iter()
        .filter(|key| domains[1..].iter().all(|d| d.references.contains_key(*key)))
        .collect();
    if sequential {
        let template = &domains[0].references;
        candidates.sort_by(|a, b| template[*a].cmp(&template[*b]));
    } else {
        candidates.shuffle(rng);
    }

    let mut used: Vec<HashSet<Vec<usize>>> = vec![HashSet::new(); set.len()];
    let mut selected: Vec<&Vec<MetaValue>> = Vec::with_capacity(members);
    for key in candidates.iter().copied() {
        if selected.len() == members {
            break;
        }
        let touched = set
            .iter()
            .zip(&domains)
            .map(|(&v, domain)| domain.touched(&variables[v], key))
            .collect::<Result<Vec<_>>>()?;

        let clash = set.iter().enumerate().any(|(k, &v)| {
            !variables[v].overlap() && touched[k].iter().any(|t| used[k].contains(t))
        });
        if clash {
            continue;
        }
        for (k, tuples) in touched.into_iter().enumerate() {
            if !variables[set[k]].overlap() {
                used[k].extend(tuples);
            }
        }
        selected.push(key);
    }

    let set_names: Vec<&str> = set.iter().map(|&v| variables[v].name()).collect();
    if selected.len() < members {
        tracing::warn!(
            variables = ?set_names,
            requested = members,
            found = selected.len(),
            "Not enough ensemble members"
        );
        return Err(StateVectorError::InsufficientMembers {
            requested: members,
            found: selected.len(),
        });
    }

    tracing::info!(
        variables = ?set_names,
        ensemble_dims = ?names,
        domain = candidates.len(),
        members,
        sequential,
        "Drew ensemble members"
    );

    Ok(domains
        .iter()
        .map(|domain| selected.iter().map(|key| domain.member_references(key)).collect())
        .collect())
}

/// Load and collapse every member of one variable.
fn load_members(
    var: &StateVectorVariable,
    references: &[Vec<usize>],
    cache: &SourceCache,
    parallel: bool,
) -> Result<Vec<(Vec<f64>, Vec<bool>)>> {
    let load_one = |member: &Vec<usize>| -> Result<(Vec<f64>, Vec<bool>)> {
        let request = var.load_request(member)?;
        let region = var.grid().repeated_load(&request, cache)?;
        let (values, missing) = collapse(var, region.data)?;
        Ok((values.iter().copied().collect(), missing.iter().copied().collect()))
    };

    if parallel {
        references.par_iter().map(load_one).collect()
    } else {
        references.iter().map(load_one).collect()
    }
}

/// Average the mean axes of a loaded member.
///
/// Returns values and missing flags shaped like the variable's state sizes.
/// A flag is set when any raw value contributing to the element was missing,
/// even if the mean omitted it.
fn collapse(var: &StateVectorVariable, data: ArrayD<f64>) -> Result<(ArrayD<f64>, ArrayD<bool>)> {
    let designs = &var.design().design;
    if data.ndim() != designs.len() {
        return Err(StateVectorError::validation(format!(
            "loaded {} dimensions for variable '{}', expected {}",
            data.ndim(),
            var.name(),
            designs.len()
        )));
    }

    let mut missing = data.mapv(f64::is_nan);
    let mut values = data;
    for (axis, design) in designs.iter().enumerate() {
        let Some(mean) = design.mean() else {
            continue;
        };
        let width = design.mean_width();
        let groups = design.state_size();
        if values.len_of(Axis(axis)) != groups * width {
            return Err(StateVectorError::validation(format!(
                "loaded {} values along '{}' of '{}', expected {}",
                values.len_of(Axis(axis)),
                var.dims()[axis],
                var.name(),
                groups * width
            )));
        }
        (values, missing) = reduce_axis(
            &values,
            &missing,
            Axis(axis),
            groups,
            width,
            mean.weights.as_deref(),
            mean.nan,
        );
    }
    Ok((values, missing))
}

/// Collapse `axis` from `groups * width` to `groups` by weighted mean.
fn reduce_axis(
    values: &ArrayD<f64>,
    missing: &ArrayD<bool>,
    axis: Axis,
    groups: usize,
    width: usize,
    weights: Option<&[f64]>,
    nan: NanPolicy,
) -> (ArrayD<f64>, ArrayD<bool>) {
    let mut shape = values.shape().to_vec();
    shape[axis.index()] = groups;
    let mut reduced = ArrayD::zeros(shape.clone());
    let mut reduced_missing = ArrayD::from_elem(shape, false);

    for g in 0..groups {
        let slice = Slice::from(g * width..(g + 1) * width);
        let block = values.slice_axis(axis, slice);
        reduced
            .index_axis_mut(axis, g)
            .assign(&block.map_axis(axis, |lane| weighted_mean(lane, weights, nan)));

        let flags = missing.slice_axis(axis, slice);
        reduced_missing
            .index_axis_mut(axis, g)
            .assign(&flags.map_axis(axis, |lane| lane.iter().any(|&m| m)));
    }
    (reduced, reduced_missing)
}

/// Σ(w·v) / Σ(w) over the lane; missing values follow `nan`.
fn weighted_mean(lane: ArrayView1<f64>, weights: Option<&[f64]>, nan: NanPolicy) -> f64 {
    let mut sum = 0.0;
    let mut total = 0.0;
    for (k, &v) in lane.iter().enumerate() {
        if v.is_nan() {
            match nan {
                NanPolicy::Include => return f64::NAN,
                NanPolicy::Omit => continue,
            }
        }
        let w = weights.map_or(1.0, |w| w[k]);
        sum += w * v;
        total += w;
    }
    if total == 0.0 {
        f64::NAN
    } else {
        sum / total
    }
}

/// Every combination of one element from each list, first list slowest.
fn cartesian(lists: &[Vec<usize>]) -> Vec<Vec<usize>> {
    lists.iter().fold(vec![Vec::new()], |acc, list| {
        acc.iter()
            .flat_map(|prefix| {
                list.iter().map(move |&x| {
                    let mut tuple = prefix.clone();
                    tuple.push(x);
                    tuple
                })
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::Role;
    use ndarray::{arr1, ArrayD, IxDyn};
    use virtual_grid::testdata::write_zarr_source;
    use virtual_grid::{Coordinates, Dimension, SourceFormat, SourceSpec};

    /// time(4) split over two stores holding the time index.
    fn split_grid(dir: &std::path::Path) -> Arc<GridFile> {
        let mut grid = GridFile::new(vec![Dimension::new(
            "time",
            Coordinates::Numeric(vec![0.0, 1.0, 2.0, 3.0]),
        )])
        .unwrap();
        for (part, first) in [(0usize, 0usize), (1, 2)] {
            let path = dir.join(format!("part{}.zarr", part));
            write_zarr_source(&path, &[2], &[first as f64, first as f64 + 1.0]).unwrap();
            grid.add_source(
                SourceSpec::new(path, "/", SourceFormat::Zarr, &["time"]),
                &[("time", [first, first + 1])],
            )
            .unwrap();
        }
        Arc::new(grid)
    }

    #[test]
    fn test_variables_on_one_grid_share_source_opens() {
        let dir = tempfile::tempdir().unwrap();
        let grid = split_grid(dir.path());

        let mut sv = StateVector::new();
        sv.add("a", grid.clone()).unwrap();
        sv.add("b", grid).unwrap();
        sv.set_role(&["a", "b"], "time", Role::Ensemble).unwrap();
        sv.couple(&["a", "b"]).unwrap();

        let set = sv.coupling().sets().remove(0);
        let mut rng = StdRng::seed_from_u64(0);
        let draws = draw_members(sv.variables(), &set, 4, true, &mut rng).unwrap();

        let caches = GridCaches::new(sv.variables());
        let config = BuildConfig {
            parallel: false,
            ..BuildConfig::default()
        };
        let (data, has_nan, _) = assemble(sv.variables(), draws, 4, &config, &caches).unwrap();

        assert_eq!(caches.caches.len(), 1);
        assert_eq!(caches.builds(), 2, "each source opened once across both variables");
        assert_eq!(data.row(0).to_vec(), vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(data.row(1).to_vec(), vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(has_nan, vec![false, false]);
    }

    #[test]
    fn test_cartesian() {
        assert_eq!(cartesian(&[]), vec![Vec::<usize>::new()]);
        assert_eq!(
            cartesian(&[vec![1, 2], vec![7, 8]]),
            vec![vec![1, 7], vec![1, 8], vec![2, 7], vec![2, 8]]
        );
        assert!(cartesian(&[vec![1], vec![]]).is_empty());
    }

    #[test]
    fn test_weighted_mean() {
        let lane = arr1(&[1.0, 2.0, f64::NAN, 4.0]);
        assert!(weighted_mean(lane.view(), None, NanPolicy::Include).is_nan());
        assert_eq!(weighted_mean(lane.view(), None, NanPolicy::Omit), 7.0 / 3.0);

        let weights = [1.0, 3.0, 1.0, 0.0];
        assert_eq!(weighted_mean(lane.view(), Some(&weights), NanPolicy::Omit), 7.0 / 4.0);

        let all_missing = arr1(&[f64::NAN, f64::NAN]);
        assert!(weighted_mean(all_missing.view(), None, NanPolicy::Omit).is_nan());
    }

    #[test]
    fn test_reduce_axis_groups() {
        // 2 x 4, reduce axis 1 into 2 groups of width 2
        let values = ArrayD::from_shape_vec(IxDyn(&[2, 4]), vec![1.0, 3.0, 5.0, f64::NAN, 2.0, 4.0, 6.0, 8.0]).unwrap();
        let missing = values.mapv(f64::is_nan);
        let (reduced, flags) = reduce_axis(&values, &missing, Axis(1), 2, 2, None, NanPolicy::Omit);

        assert_eq!(reduced.shape(), &[2, 2]);
        assert_eq!(reduced[[0, 0]], 2.0);
        assert_eq!(reduced[[0, 1]], 5.0);
        assert_eq!(reduced[[1, 1]], 7.0);
        assert!(flags[[0, 1]]);
        assert!(!flags[[1, 1]]);
    }
}
