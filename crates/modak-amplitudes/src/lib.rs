//! Factors bundled with `modak`.
//!
//! Every factor here implements the [`Factor`](modak_core::factors::Factor) trait and can be
//! made available to model descriptors through [`register_all`].

/// A relativistic Breit-Wigner factor.
pub mod breit_wigner;
/// Common factors (constants, scalar coefficients, single-particle quantities).
pub mod common;

use modak_core::factors::register_factor_prototype;

/// Register prototypes for every bundled factor in the process-wide registry.
pub fn register_all() {
    register_factor_prototype(Box::new(common::Unit));
    register_factor_prototype(Box::new(common::Scalar::default()));
    register_factor_prototype(Box::new(common::ComplexScalar::default()));
    register_factor_prototype(Box::new(common::ParticleEnergy::default()));
    register_factor_prototype(Box::new(breit_wigner::BreitWigner::default()));
}
