use num::complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::ModakResult;

/// The normalization-integral matrix `NI[i][j] = (1/N_gen) Σ_e w(e) A_i(e) A_j*(e)`.
///
/// Stored row-major as interleaved `(re, im)` doubles of length `2·N·N`, with the ordered term
/// names as axis labels. The matrix is Hermitian by construction: the compute loop writes both
/// conjugate halves at once, so consumers may read any element without checking which half was
/// computed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NormIntegrals {
    term_names: Vec<String>,
    values: Vec<f64>,
}

impl NormIntegrals {
    /// A zeroed matrix with the given axis labels.
    pub fn zeros(term_names: Vec<String>) -> Self {
        let n = term_names.len();
        Self {
            term_names,
            values: vec![0.0; 2 * n * n],
        }
    }

    /// The number of terms along each axis.
    pub fn n_terms(&self) -> usize {
        self.term_names.len()
    }

    /// The ordered term names labelling the axes.
    pub fn term_names(&self) -> &[String] {
        &self.term_names
    }

    #[inline]
    fn base(&self, i: usize, j: usize) -> usize {
        2 * (i * self.n_terms() + j)
    }

    /// Read element `(i, j)`.
    pub fn get(&self, i: usize, j: usize) -> Complex64 {
        let base = self.base(i, j);
        Complex64::new(self.values[base], self.values[base + 1])
    }

    /// Write element `(i, j)` and its Hermitian conjugate `(j, i)` simultaneously.
    pub fn set_pair(&mut self, i: usize, j: usize, value: Complex64) {
        let base = self.base(i, j);
        self.values[base] = value.re;
        self.values[base + 1] = value.im;
        if i != j {
            let conj_base = self.base(j, i);
            self.values[conj_base] = value.re;
            self.values[conj_base + 1] = -value.im;
        }
    }

    /// Zero element `(i, j)` and its transpose partner.
    pub fn zero_pair(&mut self, i: usize, j: usize) {
        self.set_pair(i, j, Complex64::ZERO);
    }

    /// The raw interleaved `(re, im)` storage, row-major.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Accumulate another matrix element-wise. Used when reducing partial integrals from
    /// partitioned acceptance samples.
    pub fn accumulate(&mut self, other: &NormIntegrals) {
        assert_eq!(
            self.term_names, other.term_names,
            "integral matrices with different term axes cannot be reduced"
        );
        for (v, o) in self.values.iter_mut().zip(other.values.iter()) {
            *v += o;
        }
    }

    /// Scale every element, e.g. by `1/N_gen` after a reduction.
    pub fn scale(&mut self, factor: f64) {
        for v in self.values.iter_mut() {
            *v *= factor;
        }
    }

    /// Serialize to bytes: the term count and axis labels precede the matrix payload.
    pub fn encode(&self) -> ModakResult<Vec<u8>> {
        let config = bincode::config::standard();
        Ok(bincode::serde::encode_to_vec(self, config)?)
    }

    /// Deserialize from bytes produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> ModakResult<Self> {
        let config = bincode::config::standard();
        let (matrix, _) = bincode::serde::decode_from_slice(bytes, config)?;
        Ok(matrix)
    }
}
