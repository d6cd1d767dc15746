//! Coupling between state vector variables.
//!
//! Coupling is an equivalence relation, stored as a partition: every variable
//! carries the label of its coupled set. `merge` joins sets; `dissolve` splits
//! every set that contains two or more of the listed variables back into
//! singletons. The boolean matrix view is derived from the labels and is
//! exactly equivalent to the partition.

use std::collections::{HashMap, HashSet};

use ndarray::Array2;

/// Partition of variables (by position) into coupled sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coupling {
    labels: Vec<usize>,
    next: usize,
}

impl Coupling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable in its own set.
    pub fn push(&mut self) {
        let label = self.fresh();
        self.labels.push(label);
    }

    /// Remove the variable at `index`; later variables shift down.
    pub fn remove(&mut self, index: usize) {
        self.labels.remove(index);
    }

    /// Add the variables of `other` after the existing ones, keeping its sets.
    pub fn append(&mut self, other: &Coupling) {
        let offset = self.next;
        self.labels.extend(other.labels.iter().map(|l| l + offset));
        self.next += other.next;
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Join the sets of all listed variables.
    pub fn merge(&mut self, members: &[usize]) {
        let merging: HashSet<usize> = members.iter().map(|&i| self.labels[i]).collect();
        let Some(&target) = merging.iter().min() else {
            return;
        };
        for label in &mut self.labels {
            if merging.contains(label) {
                *label = target;
            }
        }
    }

    /// Split every set that holds two or more of the listed variables.
    pub fn dissolve(&mut self, members: &[usize]) {
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for &i in members.iter().collect::<HashSet<_>>() {
            *counts.entry(self.labels[i]).or_default() += 1;
        }
        let dissolved: HashSet<usize> = counts
            .into_iter()
            .filter(|&(_, n)| n >= 2)
            .map(|(label, _)| label)
            .collect();

        for i in 0..self.labels.len() {
            if dissolved.contains(&self.labels[i]) {
                self.labels[i] = self.fresh();
            }
        }
    }

    /// Every variable back in its own set.
    pub fn dissolve_all(&mut self) {
        for i in 0..self.labels.len() {
            self.labels[i] = self.fresh();
        }
    }

    pub fn is_coupled(&self, a: usize, b: usize) -> bool {
        self.labels[a] == self.labels[b]
    }

    /// Members of the set containing `index`, in variable order.
    pub fn set_of(&self, index: usize) -> Vec<usize> {
        let label = self.labels[index];
        (0..self.labels.len())
            .filter(|&i| self.labels[i] == label)
            .collect()
    }

    /// All coupled sets, ordered by their first member.
    pub fn sets(&self) -> Vec<Vec<usize>> {
        let mut seen = HashSet::new();
        (0..self.labels.len())
            .filter(|&i| seen.insert(self.labels[i]))
            .map(|i| self.set_of(i))
            .collect()
    }

    /// Symmetric coupling matrix with a true diagonal.
    pub fn matrix(&self) -> Array2<bool> {
        let n = self.labels.len();
        Array2::from_shape_fn((n, n), |(a, b)| self.is_coupled(a, b))
    }

    fn fresh(&mut self) -> usize {
        let label = self.next;
        self.next += 1;
        label
    }
}
