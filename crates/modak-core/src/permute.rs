use std::collections::BTreeMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// A reordering of the final-state particle indices.
///
/// `order[slot]` gives the index of the particle which should be used in place of `slot` when a
/// term is evaluated under this permutation. The identity permutation maps every slot to
/// itself.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permutation(Vec<usize>);

impl Permutation {
    pub fn new(order: Vec<usize>) -> Self {
        Self(order)
    }

    pub fn identity(n: usize) -> Self {
        Self((0..n).collect())
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// The particle index occupying `slot` under this permutation.
    #[inline]
    pub fn map(&self, slot: usize) -> usize {
        self.0[slot]
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    pub fn is_identity(&self) -> bool {
        self.0.iter().enumerate().all(|(slot, &p)| slot == p)
    }

    fn swapped(&self, a: usize, b: usize) -> Self {
        let mut order = self.0.clone();
        order.swap(a, b);
        Self(order)
    }
}

impl Display for Permutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, p) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, ")")
    }
}

impl From<Vec<usize>> for Permutation {
    fn from(order: Vec<usize>) -> Self {
        Self::new(order)
    }
}

/// Enumerate the orderings of the final-state particles which leave the reaction
/// indistinguishable.
///
/// Particles are grouped by label. A group of `g` identical particles contributes the choice
/// set of transpositions `{(i₁,i₁), (i₁,i₂), …, (i₁,i_g)}`, where `(i₁,i₁)` leaves the group
/// untouched. The full list is the product across groups, composed onto the default ordering,
/// so the identity is always present and a reaction with no repeated labels yields exactly one
/// permutation.
pub fn symmetric_combinations<S: AsRef<str>>(labels: &[S]) -> Vec<Permutation> {
    // group by label, preserving a stable order for reproducible output
    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, label) in labels.iter().enumerate() {
        groups.entry(label.as_ref()).or_default().push(i);
    }
    let swap_sets: Vec<Vec<(usize, usize)>> = groups
        .values()
        .filter(|indices| indices.len() > 1)
        .map(|indices| {
            let first = indices[0];
            indices.iter().map(|&other| (first, other)).collect()
        })
        .collect();
    let mut combos = Vec::new();
    generate_combos(
        &Permutation::identity(labels.len()),
        &swap_sets,
        &mut combos,
    );
    combos
}

fn generate_combos(
    current: &Permutation,
    remaining: &[Vec<(usize, usize)>],
    out: &mut Vec<Permutation>,
) {
    match remaining.split_first() {
        None => out.push(current.clone()),
        Some((swaps, rest)) => {
            for &(a, b) in swaps {
                generate_combos(&current.swapped(a, b), rest, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_identical_particles() {
        let combos = symmetric_combinations(&["beam", "proton", "kaon"]);
        assert_eq!(combos, vec![Permutation::identity(3)]);
    }

    #[test]
    fn test_identical_pair() {
        let combos = symmetric_combinations(&["pi+", "pi+", "p"]);
        assert_eq!(combos.len(), 2);
        assert!(combos.contains(&Permutation::new(vec![0, 1, 2])));
        assert!(combos.contains(&Permutation::new(vec![1, 0, 2])));
    }

    #[test]
    fn test_two_identical_groups() {
        let combos = symmetric_combinations(&["k+", "k-", "k+", "k-"]);
        assert_eq!(combos.len(), 4);
        assert!(combos.contains(&Permutation::identity(4)));
        assert!(combos.contains(&Permutation::new(vec![2, 1, 0, 3])));
        assert!(combos.contains(&Permutation::new(vec![0, 3, 2, 1])));
        assert!(combos.contains(&Permutation::new(vec![2, 3, 0, 1])));
    }

    #[test]
    fn test_identity_always_present() {
        let combos = symmetric_combinations(&["pi0", "pi0", "pi0"]);
        assert_eq!(combos.len(), 3);
        assert!(combos.iter().any(|p| p.is_identity()));
    }

    #[test]
    fn test_permutation_display() {
        let p = Permutation::new(vec![1, 0, 2]);
        assert_eq!(p.to_string(), "(1, 0, 2)");
        assert!(!p.is_identity());
        assert_eq!(p.map(0), 1);
        assert_eq!(p.map(2), 2);
    }
}
