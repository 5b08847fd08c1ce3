use std::collections::HashMap;

use accurate::{sum::Klein, traits::*};
use num::complex::Complex64;
use serde::{Deserialize, Serialize};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::integrals::NormIntegrals;
use crate::manager::AmplitudeManager;
use crate::utils::vectors::{Vec3, Vec4};

/// An event that can be used to test the implementation of a [`Factor`](crate::factors::Factor).
/// This particular event contains the reaction $`\gamma p \to K_S^0 K_S^0 p`$.
pub fn test_event() -> Event {
    Event {
        p4s: vec![
            Vec3::new(0.0, 0.0, 8.747).with_mass(0.0),         // beam
            Vec3::new(0.119, 0.374, 0.222).with_mass(1.007),   // "proton"
            Vec3::new(-0.112, 0.293, 3.081).with_mass(0.498),  // "kaon"
            Vec3::new(-0.007, -0.667, 5.446).with_mass(0.498), // "kaon"
        ],
        weight: 0.48,
    }
}

/// Particle labels matching [`test_event`].
pub const TEST_PARTICLES: &[&str] = &["beam", "proton", "kshort", "kshort"];

/// One measured kinematic record: a list of four-momenta and a weight.
///
/// Weights may be negative when background subtraction is performed via weighted sideband
/// events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Event {
    /// A list of four-momenta for each final-state particle.
    pub p4s: Vec<Vec4>,
    /// The weight given to the event.
    pub weight: f64,
}

impl Event {
    /// Return a four-momentum from the sum of four-momenta at the given indices.
    pub fn p4_sum<T: AsRef<[usize]>>(&self, indices: T) -> Vec4 {
        indices.as_ref().iter().map(|i| self.p4s[*i]).sum::<Vec4>()
    }
}

/// A borrowed view of the flattened four-vector block of an [`EventBuffer`].
///
/// Storage is event-major: all particles of event 0, then all particles of event 1, with each
/// particle stored as `(px, py, pz, e)`.
#[derive(Copy, Clone)]
pub struct Kinematics<'a> {
    pub(crate) p4s: &'a [f64],
    pub(crate) n_events: usize,
    pub(crate) n_particles: usize,
}

impl<'a> Kinematics<'a> {
    /// The number of (padded) events in the block.
    pub fn n_events(&self) -> usize {
        self.n_events
    }

    /// The number of particles per event.
    pub fn n_particles(&self) -> usize {
        self.n_particles
    }

    /// The four-momentum of `particle` in `event`.
    #[inline]
    pub fn p4(&self, event: usize, particle: usize) -> Vec4 {
        debug_assert!(event < self.n_events && particle < self.n_particles);
        let base = (event * self.n_particles + particle) * 4;
        Vec4::from_slice(&self.p4s[base..base + 4])
    }
}

/// Contiguous per-dataset working memory.
///
/// An [`EventBuffer`] holds everything an [`AmplitudeManager`] needs to evaluate a model over
/// one dataset: the flattened four-vectors and weights, the user-variable arena, the factor
/// scratch block, the assembled term amplitudes, the per-event intensities, and the
/// normalization-integral matrix. The buffer persists across fit iterations and carries the
/// per-factor parameter epochs used for change detection, so the same buffer must be handed
/// back to the manager on every call.
///
/// Events past `n_true` are padding: they carry zero weight and never contribute to any sum.
#[derive(Debug, Clone, Default)]
pub struct EventBuffer {
    pub(crate) n_true: usize,
    pub(crate) n_padded: usize,
    pub(crate) n_particles: usize,
    pub(crate) n_terms: usize,
    pub(crate) p4s: Vec<f64>,
    pub(crate) weights: Vec<f64>,
    pub(crate) user_vars: Vec<f64>,
    pub(crate) user_var_offsets: HashMap<String, usize>,
    pub(crate) factor_scratch: Vec<f64>,
    pub(crate) terms: Vec<f64>,
    pub(crate) intensities: Vec<f64>,
    pub(crate) integrals: Option<NormIntegrals>,
    pub(crate) terms_valid: bool,
    pub(crate) integrals_valid: bool,
    pub(crate) last_iteration: HashMap<u64, u64>,
}

impl EventBuffer {
    /// Load events into a fresh buffer with no padding.
    pub fn from_events(events: &[Event]) -> Self {
        Self::from_events_padded(events, 1)
    }

    /// Load events into a fresh buffer, padding the event count up to a multiple of `block`.
    ///
    /// Device back-ends require the event count to be a multiple of their launch block size;
    /// padded slots carry zero weight.
    pub fn from_events_padded(events: &[Event], block: usize) -> Self {
        assert!(block > 0, "padding block must be nonzero");
        let n_true = events.len();
        let n_padded = n_true.div_ceil(block) * block;
        let n_particles = events.first().map(|e| e.p4s.len()).unwrap_or(0);
        let mut p4s = vec![0.0; n_padded * n_particles * 4];
        let mut weights = vec![0.0; n_padded];
        for (i, event) in events.iter().enumerate() {
            assert_eq!(
                event.p4s.len(),
                n_particles,
                "every event must have the same number of particles"
            );
            for (j, p4) in event.p4s.iter().enumerate() {
                let base = (i * n_particles + j) * 4;
                p4s[base..base + 4].copy_from_slice(&p4.to_array());
            }
            weights[i] = event.weight;
        }
        Self {
            n_true,
            n_padded,
            n_particles,
            p4s,
            weights,
            ..Default::default()
        }
    }

    /// Build a buffer holding a single event. Used by the one-event diagnostic path.
    pub fn single(event: &Event) -> Self {
        Self::from_events(std::slice::from_ref(event))
    }

    /// Size the working blocks for the given manager's model.
    ///
    /// Must be called once before the buffer is first evaluated; the sizes depend only on the
    /// model shape, which is frozen before fitting begins.
    pub fn allocate(&mut self, manager: &AmplitudeManager) {
        self.n_terms = manager.n_terms();
        self.factor_scratch = vec![0.0; manager.max_factor_storage_per_event() * self.n_padded];
        self.terms = vec![0.0; manager.term_storage_per_event() * self.n_padded];
        self.intensities = vec![0.0; self.n_padded];
        self.user_vars
            .reserve(manager.user_vars_per_event() * self.n_padded);
        self.integrals = Some(NormIntegrals::zeros(manager.term_names()));
    }

    pub fn n_true(&self) -> usize {
        self.n_true
    }

    pub fn n_padded(&self) -> usize {
        self.n_padded
    }

    pub fn n_particles(&self) -> usize {
        self.n_particles
    }

    pub fn n_terms(&self) -> usize {
        self.n_terms
    }

    /// The per-event weights (true events only).
    pub fn weights(&self) -> &[f64] {
        &self.weights[..self.n_true]
    }

    /// The sum of weights over the true events.
    #[cfg(feature = "rayon")]
    pub fn weighted_len(&self) -> f64 {
        self.weights[..self.n_true]
            .par_iter()
            .copied()
            .parallel_sum_with_accumulator::<Klein<f64>>()
    }

    /// The sum of weights over the true events.
    #[cfg(not(feature = "rayon"))]
    pub fn weighted_len(&self) -> f64 {
        self.weights[..self.n_true]
            .iter()
            .copied()
            .sum_with_accumulator::<Klein<f64>>()
    }

    /// A view of the four-vector block.
    pub fn kinematics(&self) -> Kinematics<'_> {
        Kinematics {
            p4s: &self.p4s,
            n_events: self.n_padded,
            n_particles: self.n_particles,
        }
    }

    /// Drop the four-vector block.
    ///
    /// Only valid once every factor in the model can be evaluated from user variables alone;
    /// the manager calls this when its flush optimization is enabled.
    pub fn clear_four_vecs(&mut self) {
        self.p4s = Vec::new();
        self.p4s.shrink_to_fit();
    }

    /// Whether the four-vector block is still resident.
    pub fn has_four_vecs(&self) -> bool {
        !self.p4s.is_empty()
    }

    /// The per-event intensities computed by the last
    /// [`calc_intensities`](AmplitudeManager::calc_intensities) call (true events only).
    pub fn intensities(&self) -> &[f64] {
        assert!(
            !self.intensities.is_empty(),
            "intensity storage has not been allocated for this buffer"
        );
        &self.intensities[..self.n_true]
    }

    /// The assembled amplitude of `term` for `event`.
    pub fn term_amplitude(&self, term: usize, event: usize) -> Complex64 {
        assert!(
            term < self.n_terms && event < self.n_true,
            "term amplitude index out of range"
        );
        let base = 2 * self.n_padded * term + 2 * event;
        Complex64::new(self.terms[base], self.terms[base + 1])
    }

    /// The interleaved `(re, im)` amplitude block of `term` over all padded events.
    pub fn term_slice(&self, term: usize) -> &[f64] {
        let base = 2 * self.n_padded * term;
        &self.terms[base..base + 2 * self.n_padded]
    }

    /// The normalization-integral matrix computed by the last
    /// [`calc_integrals`](AmplitudeManager::calc_integrals) call.
    pub fn integrals(&self) -> &NormIntegrals {
        self.integrals
            .as_ref()
            .expect("integral storage has not been allocated for this buffer")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_buffer_padding() {
        let events = vec![test_event(); 5];
        let buffer = EventBuffer::from_events_padded(&events, 4);
        assert_eq!(buffer.n_true(), 5);
        assert_eq!(buffer.n_padded(), 8);
        assert_eq!(buffer.n_particles(), 4);
        // padded slots never contribute
        assert!(buffer.weights[5..].iter().all(|&w| w == 0.0));
        assert_relative_eq!(buffer.weighted_len(), 5.0 * 0.48, epsilon = 1e-12);
    }

    #[test]
    fn test_kinematics_view() {
        let event = test_event();
        let buffer = EventBuffer::single(&event);
        let kin = buffer.kinematics();
        assert_eq!(kin.n_events(), 1);
        assert_eq!(kin.p4(0, 2), event.p4s[2]);
    }

    #[test]
    fn test_clear_four_vecs() {
        let mut buffer = EventBuffer::from_events(&[test_event()]);
        assert!(buffer.has_four_vecs());
        buffer.clear_four_vecs();
        assert!(!buffer.has_four_vecs());
        assert_eq!(buffer.n_true(), 1);
    }

    #[test]
    fn test_p4_sum() {
        let event = test_event();
        let pair = event.p4_sum([2, 3]);
        assert_relative_eq!(pair.e, event.p4s[2].e + event.p4s[3].e, epsilon = 1e-12);
    }
}
