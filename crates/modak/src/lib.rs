//! # modak
//!
//! `modak` is an intensity evaluation engine for unbinned maximum-likelihood amplitude
//! analyses in particle physics. A model is a coherent + incoherent sum of complex terms;
//! each term is a product of pluggable [`Factor`](factors::Factor)s evaluated over the
//! orderings of identical final-state particles. The engine turns four-vectors plus such a
//! model into per-event intensities, the sum of log-intensities over a data sample, and the
//! normalization-integral matrix over an acceptance Monte-Carlo sample — the three pieces an
//! external minimizer needs to form `−2·lnL`.
//!
//! Evaluations are incremental: every factor carries a parameter epoch, and buffers remember
//! the epochs they were computed at, so a fit iteration recomputes only what a parameter
//! change actually touched.
//!
//! # Quick Start
//! ```
//! use modak::{AmplitudeManager, Event, LikelihoodCalculator, Vec3};
//!
//! modak::amplitudes::register_all();
//!
//! // two identical kaons: their orderings are symmetrized automatically
//! let mut manager = AmplitudeManager::new("gp_to_kkp", &["kshort", "kshort", "proton"]);
//! manager
//!     .add_factor("S::flat", "Unit", &[], "S", None)
//!     .unwrap();
//!
//! let events = vec![Event {
//!     p4s: vec![
//!         Vec3::new(-0.112, 0.293, 3.081).with_mass(0.498),
//!         Vec3::new(-0.007, -0.667, 5.446).with_mass(0.498),
//!         Vec3::new(0.119, 0.374, 0.222).with_mass(1.007),
//!     ],
//!     weight: 1.0,
//! }];
//!
//! let mut calculator = LikelihoodCalculator::new(manager, &events, &events, 1);
//! let nll = calculator.evaluate();
//! assert!(nll.is_finite());
//! ```
//!
//! # MPI Support
//!
//! With the `mpi` feature, [`DistributedCalculator`] runs the same evaluation as a
//! leader/follower reduction: followers own disjoint partitions of the data and acceptance
//! samples, the leader holds only the model and production factors, and each evaluation is a
//! fixed blocking command sequence reduced to a single `−2·lnL` on the leader. Wrap your
//! program in [`mpi::use_mpi`] / [`mpi::finalize_mpi`] and run it under `mpirun`.

/// Bundled amplitude factors.
pub use modak_amplitudes as amplitudes;
/// The evaluation engine.
pub use modak_core::{data, executor, factors, integrals, manager, mpi, permute, traits, utils};
/// Likelihood evaluation and the distributed coordinator.
pub use modak_extensions as extensions;

pub use modak_core::{
    AmplitudeManager, Event, EventBuffer, Factor, FactorDescriptor, FactorParameter, ModakError,
    ModakResult, NormIntegrals, Permutation, Scaling, TermDescriptor, Vec3, Vec4,
};
pub use modak_extensions::{norm_int_term, DistributedCalculator, LikelihoodCalculator};
