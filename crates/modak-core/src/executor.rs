use accurate::{sum::Klein, traits::*};
use num::complex::Complex64;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::manager::CoherenceMatrix;

/// Back-end contract for the data-parallel stages of the evaluation pipeline.
///
/// All kernels consume the buffer blocks in the layouts fixed by
/// [`EventBuffer`](crate::data::EventBuffer): factor scratch is factor-major with interleaved
/// `(re, im)` values per permutation per padded event, term blocks are `2·n_padded` doubles
/// per term, and pair tables are upper-triangular with index `i·(i+1)/2 + j`.
///
/// [`HostExecutor`] is the reference implementation; its results are bit-reproducible. An
/// off-host back-end implements the same trait, is free to reassociate its reductions, and
/// reports `user_vars_event_major() == true` so that the user-variable pass transposes each
/// region to stride-1 access over events.
pub trait Executor: Send + Sync {
    /// A short label for diagnostics.
    fn name(&self) -> &'static str;

    /// Whether user-variable regions should be transposed to event-major order after
    /// computation.
    fn user_vars_event_major(&self) -> bool {
        false
    }

    /// Assemble one term from its factor scratch block: for each true event, sum the factor
    /// product over permutations and apply the `1/√P` symmetrization normalization.
    fn assemble_term(
        &self,
        scratch: &[f64],
        out: &mut [f64],
        n_true: usize,
        n_padded: usize,
        n_factors: usize,
        n_perms: usize,
    );

    /// Compute the weighted intensity for every true event from the assembled term block and
    /// the precomputed production pair table, masking non-coherent pairs. Returns the maximum
    /// intensity, which accept/reject generators need.
    #[allow(clippy::too_many_arguments)]
    fn calc_intensities(
        &self,
        terms: &[f64],
        weights: &[f64],
        out: &mut [f64],
        pair_table: &[Complex64],
        coherence: &CoherenceMatrix,
        n_true: usize,
        n_padded: usize,
    ) -> f64;

    /// Reduce `Σ_e w(e) · ln(I(e)/w(e))` over the true events.
    fn sum_log_intensity(&self, intensities: &[f64], weights: &[f64], n_true: usize) -> f64;

    /// Accumulate the unnormalized integral `Σ_e w(e) · A_i(e) · A_j*(e)` for one term pair.
    fn integral_pair(
        &self,
        terms: &[f64],
        weights: &[f64],
        i: usize,
        j: usize,
        n_true: usize,
        n_padded: usize,
    ) -> Complex64;
}

#[inline]
fn term_value(terms: &[f64], n_padded: usize, term: usize, event: usize) -> Complex64 {
    let base = 2 * n_padded * term + 2 * event;
    Complex64::new(terms[base], terms[base + 1])
}

/// The sequential reference back-end.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostExecutor;

impl HostExecutor {
    fn event_intensity(
        terms: &[f64],
        weights: &[f64],
        pair_table: &[Complex64],
        coherence: &CoherenceMatrix,
        n_padded: usize,
        event: usize,
    ) -> f64 {
        let n_terms = coherence.len();
        let mut intensity = 0.0;
        for i in 0..n_terms {
            let a_i = term_value(terms, n_padded, i, event);
            for j in 0..=i {
                if !coherence.is_coherent(i, j) {
                    continue;
                }
                let a_j = term_value(terms, n_padded, j, event);
                intensity += (pair_table[i * (i + 1) / 2 + j] * (a_i * a_j.conj())).re;
            }
        }
        intensity * weights[event]
    }
}

impl Executor for HostExecutor {
    fn name(&self) -> &'static str {
        "host"
    }

    fn assemble_term(
        &self,
        scratch: &[f64],
        out: &mut [f64],
        n_true: usize,
        n_padded: usize,
        n_factors: usize,
        n_perms: usize,
    ) {
        out.fill(0.0);
        let symm = 1.0 / f64::sqrt(n_perms as f64);
        for event in 0..n_true {
            let mut acc = Complex64::ZERO;
            for perm in 0..n_perms {
                let mut product = Complex64::ONE;
                for factor in 0..n_factors {
                    let base = 2 * (factor * n_perms * n_padded + perm * n_padded + event);
                    product *= Complex64::new(scratch[base], scratch[base + 1]);
                }
                acc += product;
            }
            out[2 * event] = acc.re * symm;
            out[2 * event + 1] = acc.im * symm;
        }
    }

    #[cfg(feature = "rayon")]
    fn calc_intensities(
        &self,
        terms: &[f64],
        weights: &[f64],
        out: &mut [f64],
        pair_table: &[Complex64],
        coherence: &CoherenceMatrix,
        n_true: usize,
        n_padded: usize,
    ) -> f64 {
        out[..n_true]
            .par_iter_mut()
            .enumerate()
            .map(|(event, slot)| {
                *slot =
                    Self::event_intensity(terms, weights, pair_table, coherence, n_padded, event);
                *slot
            })
            .reduce(|| 0.0, f64::max)
    }

    #[cfg(not(feature = "rayon"))]
    fn calc_intensities(
        &self,
        terms: &[f64],
        weights: &[f64],
        out: &mut [f64],
        pair_table: &[Complex64],
        coherence: &CoherenceMatrix,
        n_true: usize,
        n_padded: usize,
    ) -> f64 {
        let mut max_intensity = 0.0;
        for (event, slot) in out[..n_true].iter_mut().enumerate() {
            *slot = Self::event_intensity(terms, weights, pair_table, coherence, n_padded, event);
            if *slot > max_intensity {
                max_intensity = *slot;
            }
        }
        max_intensity
    }

    #[cfg(feature = "rayon")]
    fn sum_log_intensity(&self, intensities: &[f64], weights: &[f64], n_true: usize) -> f64 {
        // the weight is divided back out of the log argument; this only shifts the result by
        // the constant Σ w·ln(w) but keeps negative background-subtraction weights stable
        intensities[..n_true]
            .par_iter()
            .zip(weights[..n_true].par_iter())
            .map(|(&intensity, &weight)| weight * f64::ln(intensity / weight))
            .parallel_sum_with_accumulator::<Klein<f64>>()
    }

    #[cfg(not(feature = "rayon"))]
    fn sum_log_intensity(&self, intensities: &[f64], weights: &[f64], n_true: usize) -> f64 {
        intensities[..n_true]
            .iter()
            .zip(weights[..n_true].iter())
            .map(|(&intensity, &weight)| weight * f64::ln(intensity / weight))
            .sum_with_accumulator::<Klein<f64>>()
    }

    fn integral_pair(
        &self,
        terms: &[f64],
        weights: &[f64],
        i: usize,
        j: usize,
        n_true: usize,
        n_padded: usize,
    ) -> Complex64 {
        let re = (0..n_true)
            .map(|event| {
                weights[event]
                    * (term_value(terms, n_padded, i, event)
                        * term_value(terms, n_padded, j, event).conj())
                    .re
            })
            .sum_with_accumulator::<Klein<f64>>();
        // diagonal elements are real
        let im = if i == j {
            0.0
        } else {
            (0..n_true)
                .map(|event| {
                    weights[event]
                        * (term_value(terms, n_padded, i, event)
                            * term_value(terms, n_padded, j, event).conj())
                        .im
                })
                .sum_with_accumulator::<Klein<f64>>()
        };
        Complex64::new(re, im)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pack(values: &[Complex64]) -> Vec<f64> {
        values.iter().flat_map(|z| [z.re, z.im]).collect()
    }

    #[test]
    fn test_assemble_single_factor_two_perms() {
        // one factor, two permutations, one event: A = (f(p0) + f(p1)) / √2
        let scratch = pack(&[Complex64::new(1.0, 0.0), Complex64::new(0.0, 1.0)]);
        let mut out = vec![0.0; 2];
        HostExecutor.assemble_term(&scratch, &mut out, 1, 1, 1, 2);
        let expected = Complex64::new(1.0, 1.0) / f64::sqrt(2.0);
        assert_relative_eq!(out[0], expected.re, epsilon = 1e-15);
        assert_relative_eq!(out[1], expected.im, epsilon = 1e-15);
    }

    #[test]
    fn test_assemble_factor_product() {
        // two factors, one permutation: the factor values multiply
        let scratch = pack(&[Complex64::new(2.0, 0.0), Complex64::new(0.0, 3.0)]);
        let mut out = vec![0.0; 2];
        HostExecutor.assemble_term(&scratch, &mut out, 1, 1, 2, 1);
        assert_relative_eq!(out[0], 0.0, epsilon = 1e-15);
        assert_relative_eq!(out[1], 6.0, epsilon = 1e-15);
    }

    #[test]
    fn test_assemble_skips_padding() {
        let scratch = pack(&[Complex64::ONE, Complex64::ONE]);
        let mut out = vec![9.0; 4];
        HostExecutor.assemble_term(&scratch, &mut out, 1, 2, 1, 1);
        assert_eq!(&out[2..], &[0.0, 0.0]);
    }

    #[test]
    fn test_intensity_coherent_pair() {
        // two terms with A₀ = 1, A₁ = i sharing one sum: I = |1 + i|² = 2
        let coherence = CoherenceMatrix::from_sums(&["S".into(), "S".into()]);
        let terms = pack(&[Complex64::ONE, Complex64::I]);
        let weights = [1.0];
        // V_i V_j* table for V ≡ 1 with the off-diagonal doubling
        let pair_table = vec![
            Complex64::ONE,
            Complex64::new(2.0, 0.0),
            Complex64::ONE,
        ];
        let mut out = vec![0.0; 1];
        let max = HostExecutor.calc_intensities(
            &terms, &weights, &mut out, &pair_table, &coherence, 1, 1,
        );
        assert_relative_eq!(out[0], 2.0, epsilon = 1e-15);
        assert_relative_eq!(max, 2.0, epsilon = 1e-15);
    }

    #[test]
    fn test_intensity_incoherent_pair() {
        let coherence = CoherenceMatrix::from_sums(&["S1".into(), "S2".into()]);
        let terms = pack(&[Complex64::ONE, Complex64::I]);
        let weights = [1.0];
        let pair_table = vec![
            Complex64::ONE,
            Complex64::new(2.0, 0.0),
            Complex64::ONE,
        ];
        let mut out = vec![0.0; 1];
        HostExecutor.calc_intensities(&terms, &weights, &mut out, &pair_table, &coherence, 1, 1);
        assert_relative_eq!(out[0], 2.0, epsilon = 1e-15); // |1|² + |i|², no cross term
    }

    #[test]
    fn test_sum_log_intensity_weighted() {
        let intensities = [2.0, 6.0];
        let weights = [1.0, 2.0];
        let expected = f64::ln(2.0) + 2.0 * f64::ln(3.0);
        assert_relative_eq!(
            HostExecutor.sum_log_intensity(&intensities, &weights, 2),
            expected,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_integral_pair() {
        let terms = pack(&[
            Complex64::ONE,
            Complex64::new(2.0, 0.0),
            Complex64::I,
            Complex64::new(0.0, -1.0),
        ]);
        let weights = [1.0, 0.5];
        // Σ w A₀ A₁* over the two events
        let expected = Complex64::ONE * Complex64::I.conj()
            + 0.5 * Complex64::new(2.0, 0.0) * Complex64::new(0.0, -1.0).conj();
        let result = HostExecutor.integral_pair(&terms, &weights, 0, 1, 2, 2);
        assert_relative_eq!(result.re, expected.re, epsilon = 1e-15);
        assert_relative_eq!(result.im, expected.im, epsilon = 1e-15);
    }

    #[test]
    fn test_integral_diagonal_is_real() {
        let terms = pack(&[Complex64::new(1.0, 2.0)]);
        let weights = [2.0];
        let result = HostExecutor.integral_pair(&terms, &weights, 0, 0, 1, 1);
        assert_relative_eq!(result.re, 10.0, epsilon = 1e-15);
        assert_eq!(result.im, 0.0);
    }
}
