//! Likelihood evaluation on top of `modak-core`.
//!
//! [`likelihoods`] turns the intensity engine into the extended negative log-likelihood an
//! external minimizer optimizes; [`coordinator`] runs the same evaluation as a leader/follower
//! reduction over partitioned datasets.

/// The leader/follower distributed reduction protocol.
pub mod coordinator;
/// The extended unbinned negative log-likelihood.
pub mod likelihoods;

pub use coordinator::DistributedCalculator;
pub use likelihoods::{norm_int_term, LikelihoodCalculator, LikelihoodParts};
