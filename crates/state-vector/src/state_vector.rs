//! The state vector: ordered variables, their coupling and the design phase.
//!
//! Every mutating call works on a copy of the variables and commits only when
//! all changes, including those propagated to coupled variables, succeed.

use std::collections::HashSet;
use std::sync::Arc;

use ndarray::Array2;
use virtual_grid::GridFile;

use crate::coupling::Coupling;
use crate::design::{IndexSelection, Mean, Role, Sequence};
use crate::error::{Result, StateVectorError};
use crate::variable::{validate_name, StateVectorVariable};

/// An ordered set of variables with coupled ensemble draws.
///
/// A state vector starts in the design phase. [`StateVector::build`] freezes
/// it; after a successful build every mutating call fails with
/// [`StateVectorError::StructuralConflict`].
#[derive(Debug, Clone, Default)]
pub struct StateVector {
    variables: Vec<StateVectorVariable>,
    coupling: Coupling,
    built: bool,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn variables(&self) -> &[StateVectorVariable] {
        &self.variables
    }

    pub fn variable_names(&self) -> Vec<String> {
        self.variables.iter().map(|v| v.name().to_string()).collect()
    }

    pub fn variable(&self, name: &str) -> Result<&StateVectorVariable> {
        Ok(&self.variables[self.position(name)?])
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Total number of state vector rows.
    pub fn length(&self) -> usize {
        self.variables.iter().map(StateVectorVariable::length).sum()
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    pub(crate) fn coupling(&self) -> &Coupling {
        &self.coupling
    }

    pub(crate) fn mark_built(&mut self) {
        self.built = true;
    }

    /// Add a variable reading from `grid`, uncoupled from the others.
    pub fn add(&mut self, name: &str, grid: Arc<GridFile>) -> Result<()> {
        self.ensure_design()?;
        if self.variables.iter().any(|v| v.name() == name) {
            return Err(StateVectorError::validation(format!(
                "the state vector already has a variable named '{}'",
                name
            )));
        }
        let variable = StateVectorVariable::new(name, grid)?;
        tracing::debug!(
            variable = name,
            dims = ?variable.dims(),
            rows = variable.length(),
            "Added variable"
        );
        self.variables.push(variable);
        self.coupling.push();
        Ok(())
    }

    /// Remove variables; their coupled partners stay coupled to each other.
    pub fn remove(&mut self, names: &[&str]) -> Result<()> {
        self.ensure_design()?;
        let mut positions = self.positions(names)?;
        positions.sort_unstable();
        for &v in positions.iter().rev() {
            self.variables.remove(v);
            self.coupling.remove(v);
        }
        Ok(())
    }

    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        self.ensure_design()?;
        let v = self.position(old)?;
        if old != new && self.variables.iter().any(|var| var.name() == new) {
            return Err(StateVectorError::validation(format!(
                "the state vector already has a variable named '{}'",
                new
            )));
        }
        validate_name(new)?;
        self.variables[v].rename(new)
    }

    /// Move the variables of `other` to the end of this state vector.
    pub fn append(&mut self, other: StateVector) -> Result<()> {
        self.ensure_design()?;
        other.ensure_design()?;
        let names: HashSet<&str> = self.variables.iter().map(|v| v.name()).collect();
        if let Some(clash) = other.variables.iter().find(|v| names.contains(v.name())) {
            return Err(StateVectorError::validation(format!(
                "both state vectors have a variable named '{}'",
                clash.name()
            )));
        }
        self.coupling.append(&other.coupling);
        self.variables.extend(other.variables);
        Ok(())
    }

    /// Set the role of `dim` on the listed variables and their coupled partners.
    pub fn set_role(&mut self, names: &[&str], dim: &str, role: Role) -> Result<()> {
        self.mutate(names, |variables, coupling, v| {
            variables[v].set_role(dim, role)?;
            propagate(variables, coupling, v, dim)
        })
    }

    /// Set state or reference indices of `dim` on the listed variables.
    ///
    /// Reference indices propagate to coupled partners by metadata.
    pub fn set_indices(&mut self, names: &[&str], dim: &str, selection: &IndexSelection) -> Result<()> {
        self.mutate(names, |variables, coupling, v| {
            variables[v].set_indices(dim, selection)?;
            if variables[v].dimension_design(dim)?.role() == Role::Ensemble {
                propagate(variables, coupling, v, dim)?;
            }
            Ok(())
        })
    }

    pub fn set_sequence(&mut self, names: &[&str], dim: &str, sequence: &Sequence) -> Result<()> {
        self.mutate(names, |variables, _, v| variables[v].set_sequence(dim, sequence.clone()))
    }

    pub fn set_mean(&mut self, names: &[&str], dim: &str, mean: Option<&Mean>) -> Result<()> {
        self.mutate(names, |variables, _, v| variables[v].set_mean(dim, mean.cloned()))
    }

    /// Allow or forbid members of the listed variables to reuse ensemble indices.
    pub fn allow_overlap(&mut self, names: &[&str], overlap: bool) -> Result<()> {
        self.mutate(names, |variables, _, v| {
            variables[v].set_overlap(overlap);
            Ok(())
        })
    }

    /// Couple the listed variables, merging their coupled sets.
    ///
    /// The first listed variable is the template: every other variable joining
    /// its set takes the template's ensemble dimensions, with reference indices
    /// matched by metadata. A joining variable that lacks one of those
    /// dimensions, or has an ensemble dimension the template does not, cannot
    /// follow and the call fails.
    pub fn couple(&mut self, names: &[&str]) -> Result<()> {
        self.ensure_design()?;
        let positions = self.positions(names)?;
        let Some(&template) = positions.first() else {
            return Ok(());
        };

        let mut variables = self.variables.clone();
        let template_set: HashSet<usize> = self.coupling.set_of(template).into_iter().collect();
        let joining: Vec<usize> = positions
            .iter()
            .flat_map(|&v| self.coupling.set_of(v))
            .filter(|v| !template_set.contains(v))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        for &v in &joining {
            conform(&mut variables, template, v)?;
        }

        self.variables = variables;
        self.coupling.merge(&positions);
        tracing::debug!(variables = ?names, "Coupled variables");
        Ok(())
    }

    /// Dissolve every coupled set containing two or more listed variables.
    pub fn uncouple(&mut self, names: &[&str]) -> Result<()> {
        self.ensure_design()?;
        let positions = self.positions(names)?;
        self.coupling.dissolve(&positions);
        Ok(())
    }

    pub fn uncouple_all(&mut self) -> Result<()> {
        self.ensure_design()?;
        self.coupling.dissolve_all();
        Ok(())
    }

    /// Coupled sets by variable name, ordered by first member.
    pub fn coupled_sets(&self) -> Vec<Vec<String>> {
        self.coupling
            .sets()
            .into_iter()
            .map(|set| set.into_iter().map(|v| self.variables[v].name().to_string()).collect())
            .collect()
    }

    /// Coupling as a symmetric boolean matrix over variables.
    pub fn coupling_matrix(&self) -> Array2<bool> {
        self.coupling.matrix()
    }

    pub fn is_coupled(&self, a: &str, b: &str) -> Result<bool> {
        Ok(self.coupling.is_coupled(self.position(a)?, self.position(b)?))
    }

    pub(crate) fn ensure_design(&self) -> Result<()> {
        if self.built {
            return Err(StateVectorError::conflict(
                "the state vector has been built; its design is frozen",
            ));
        }
        Ok(())
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.variables
            .iter()
            .position(|v| v.name() == name)
            .ok_or_else(|| StateVectorError::validation(format!("no variable named '{}'", name)))
    }

    fn positions(&self, names: &[&str]) -> Result<Vec<usize>> {
        let mut seen = HashSet::new();
        let mut positions = Vec::with_capacity(names.len());
        for name in names {
            let v = self.position(name)?;
            if seen.insert(v) {
                positions.push(v);
            }
        }
        Ok(positions)
    }

    /// Apply `change` to each listed variable on a copy, then commit.
    fn mutate<F>(&mut self, names: &[&str], mut change: F) -> Result<()>
    where
        F: FnMut(&mut [StateVectorVariable], &Coupling, usize) -> Result<()>,
    {
        self.ensure_design()?;
        let positions = self.positions(names)?;
        let mut variables = self.variables.clone();
        for v in positions {
            change(&mut variables, &self.coupling, v)?;
        }
        self.variables = variables;
        Ok(())
    }
}

/// Make the coupled partners of `source` follow its design of `dim`.
fn propagate(
    variables: &mut [StateVectorVariable],
    coupling: &Coupling,
    source: usize,
    dim: &str,
) -> Result<()> {
    let d = variables[source].dim_position(dim)?;
    let role = variables[source].design().design[d].role();
    let values = match role {
        Role::Ensemble => Some(variables[source].reference_metadata(d)?),
        Role::State => None,
    };

    for partner in coupling.set_of(source) {
        if partner == source {
            continue;
        }
        if !variables[partner].has_dim(dim) {
            return Err(StateVectorError::conflict(format!(
                "'{}' is coupled to '{}' but has no dimension '{}'",
                variables[partner].name(),
                variables[source].name(),
                dim
            )));
        }
        variables[partner].set_role(dim, role)?;
        if let Some(values) = &values {
            follow_references(variables, source, partner, dim, values)?;
        }
    }
    Ok(())
}

/// Give `partner` the ensemble dimensions of `template`.
fn conform(variables: &mut [StateVectorVariable], template: usize, partner: usize) -> Result<()> {
    let template_dims: Vec<String> = variables[template]
        .ensemble_dims()
        .into_iter()
        .map(|d| variables[template].dims()[d].clone())
        .collect();

    for d in variables[partner].ensemble_dims() {
        let dim = &variables[partner].dims()[d];
        if !template_dims.contains(dim) {
            return Err(StateVectorError::conflict(format!(
                "'{}' has ensemble dimension '{}' which '{}' does not",
                variables[partner].name(),
                dim,
                variables[template].name()
            )));
        }
    }

    for dim in &template_dims {
        if !variables[partner].has_dim(dim) {
            return Err(StateVectorError::conflict(format!(
                "cannot couple '{}' to '{}': it has no dimension '{}'",
                variables[partner].name(),
                variables[template].name(),
                dim
            )));
        }
        let values = variables[template].reference_metadata(variables[template].dim_position(dim)?)?;
        variables[partner].set_role(dim, Role::Ensemble)?;
        follow_references(variables, template, partner, dim, &values)?;
    }
    Ok(())
}

/// Set `partner`'s reference indices along `dim` to those matching `values`.
fn follow_references(
    variables: &mut [StateVectorVariable],
    source: usize,
    partner: usize,
    dim: &str,
    values: &[virtual_grid::MetaValue],
) -> Result<()> {
    let d = variables[partner].dim_position(dim)?;
    let matched = variables[partner].match_metadata(d, values)?;
    if matched.is_empty() {
        return Err(StateVectorError::conflict(format!(
            "no reference of '{}' along '{}' matches the metadata of '{}'",
            variables[partner].name(),
            dim,
            variables[source].name()
        )));
    }
    variables[partner].set_indices(dim, &IndexSelection::Linear(matched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtual_grid::{Coordinates, Dimension, GridConfig};

    fn grid(times: usize) -> Arc<GridFile> {
        let grid = GridFile::new(vec![
            Dimension::new("lat", Coordinates::Numeric(vec![0.0, 1.0])),
            Dimension::new("time", Coordinates::Numeric((0..times).map(|t| t as f64).collect())),
        ])
        .unwrap()
        .with_config(GridConfig {
            verify_sources: false,
            ..GridConfig::default()
        });
        Arc::new(grid)
    }

    fn surface_grid() -> Arc<GridFile> {
        Arc::new(
            GridFile::new(vec![Dimension::new(
                "site",
                Coordinates::Text(vec!["a".into(), "b".into()]),
            )])
            .unwrap(),
        )
    }

    fn state_vector(names: &[&str]) -> StateVector {
        let mut sv = StateVector::new();
        for name in names {
            sv.add(name, grid(12)).unwrap();
        }
        sv
    }

    #[test]
    fn test_add_rejects_duplicates_and_bad_names() {
        let mut sv = state_vector(&["tas"]);
        assert!(sv.add("tas", grid(12)).is_err());
        assert!(sv.add("2tas", grid(12)).is_err());
        assert_eq!(sv.variable_names(), vec!["tas"]);
        assert_eq!(sv.length(), 24);
    }

    #[test]
    fn test_couple_closure_and_uncouple() {
        let mut sv = state_vector(&["a", "b", "c", "d"]);
        sv.couple(&["a", "b"]).unwrap();
        sv.couple(&["b", "c"]).unwrap();
        assert_eq!(sv.coupled_sets()[0], vec!["a", "b", "c"]);
        assert!(sv.is_coupled("a", "c").unwrap());

        sv.uncouple(&["a", "c"]).unwrap();
        assert_eq!(sv.coupled_sets().len(), 4);
        assert!(!sv.is_coupled("a", "b").unwrap());
    }

    #[test]
    fn test_couple_copies_template_ensemble_dims() {
        let mut sv = state_vector(&["a", "b"]);
        sv.set_role(&["a"], "time", Role::Ensemble).unwrap();
        sv.set_indices(&["a"], "time", &IndexSelection::Linear(vec![0, 6])).unwrap();

        sv.couple(&["a", "b"]).unwrap();
        let b = sv.variable("b").unwrap();
        assert_eq!(b.dimension_design("time").unwrap().role(), Role::Ensemble);
        assert_eq!(b.dimension_design("time").unwrap().indices(), &[0, 6]);
    }

    #[test]
    fn test_couple_matches_references_by_metadata() {
        let mut sv = StateVector::new();
        sv.add("long", grid(12)).unwrap();
        // a shorter record: time metadata 0..6
        sv.add("short", grid(6)).unwrap();
        sv.set_role(&["long"], "time", Role::Ensemble).unwrap();
        sv.couple(&["long", "short"]).unwrap();
        assert_eq!(
            sv.variable("short").unwrap().dimension_design("time").unwrap().indices(),
            &[0, 1, 2, 3, 4, 5]
        );

        // reference change propagates by metadata, unmatched values dropped
        sv.set_indices(&["long"], "time", &IndexSelection::Linear(vec![4, 9])).unwrap();
        assert_eq!(
            sv.variable("short").unwrap().dimension_design("time").unwrap().indices(),
            &[4]
        );

        // nothing in 'short' matches month 10
        let err = sv.set_indices(&["long"], "time", &IndexSelection::Linear(vec![10]));
        assert!(matches!(err, Err(StateVectorError::StructuralConflict(_))));
        assert_eq!(
            sv.variable("long").unwrap().dimension_design("time").unwrap().indices(),
            &[4, 9]
        );
    }

    #[test]
    fn test_couple_conflicts_leave_state_unchanged() {
        let mut sv = state_vector(&["a"]);
        sv.add("sites", surface_grid()).unwrap();
        sv.set_role(&["a"], "time", Role::Ensemble).unwrap();

        let err = sv.couple(&["a", "sites"]);
        assert!(matches!(err, Err(StateVectorError::StructuralConflict(_))));
        assert!(!sv.is_coupled("a", "sites").unwrap());

        // partner with an extra ensemble dimension
        sv.add("b", grid(12)).unwrap();
        sv.set_role(&["b"], "lat", Role::Ensemble).unwrap();
        let err = sv.couple(&["a", "b"]);
        assert!(matches!(err, Err(StateVectorError::StructuralConflict(_))));
        assert_eq!(
            sv.variable("b").unwrap().dimension_design("time").unwrap().role(),
            Role::State
        );
    }

    #[test]
    fn test_role_change_propagates() {
        let mut sv = state_vector(&["a", "b", "c"]);
        sv.couple(&["a", "b"]).unwrap();
        sv.set_role(&["b"], "time", Role::Ensemble).unwrap();

        for name in ["a", "b"] {
            let design = sv.variable(name).unwrap().dimension_design("time").unwrap();
            assert_eq!(design.role(), Role::Ensemble);
        }
        let c = sv.variable("c").unwrap().dimension_design("time").unwrap();
        assert_eq!(c.role(), Role::State);

        sv.set_sequence(&["a"], "time", &Sequence::new(vec![0, 1], None)).unwrap();
        sv.set_role(&["b"], "time", Role::State).unwrap();
        let a = sv.variable("a").unwrap().dimension_design("time").unwrap();
        assert_eq!(a.role(), Role::State);
        assert!(a.sequence().is_none());
    }

    #[test]
    fn test_failed_multi_variable_call_is_atomic() {
        let mut sv = state_vector(&["a"]);
        sv.add("sites", surface_grid()).unwrap();
        let err = sv.set_role(&["a", "sites"], "time", Role::Ensemble);
        assert!(err.is_err());
        assert!(sv.variable("a").unwrap().ensemble_dims().is_empty());
    }

    #[test]
    fn test_remove_rename_append() {
        let mut sv = state_vector(&["a", "b", "c"]);
        sv.couple(&["a", "c"]).unwrap();
        sv.remove(&["b"]).unwrap();
        assert_eq!(sv.coupled_sets(), vec![vec!["a", "c"]]);

        sv.rename("c", "d").unwrap();
        assert!(sv.rename("a", "d").is_err());
        assert!(sv.rename("a", "no good").is_err());

        let other = state_vector(&["e", "f"]);
        sv.append(other).unwrap();
        assert_eq!(sv.variable_names(), vec!["a", "d", "e", "f"]);
        assert!(sv.append(state_vector(&["a"])).is_err());
    }

    #[test]
    fn test_coupling_matrix_equivalent_to_sets() {
        let mut sv = state_vector(&["a", "b", "c"]);
        sv.couple(&["c", "a"]).unwrap();
        let matrix = sv.coupling_matrix();
        assert!(matrix[[0, 2]] && matrix[[2, 0]]);
        assert!(!matrix[[0, 1]]);
        assert!((0..3).all(|i| matrix[[i, i]]));
    }

    #[test]
    fn test_frozen_after_build_flag() {
        let mut sv = state_vector(&["a"]);
        sv.mark_built();
        assert!(matches!(
            sv.add("b", grid(12)),
            Err(StateVectorError::StructuralConflict(_))
        ));
        assert!(matches!(
            sv.couple(&["a"]),
            Err(StateVectorError::StructuralConflict(_))
        ));
        assert!(matches!(
            sv.allow_overlap(&["a"], true),
            Err(StateVectorError::StructuralConflict(_))
        ));
    }
}
