//! # modak-core
//!
//! This is an internal crate used by `modak`.
#![warn(clippy::perf, clippy::style)]

use thiserror::Error;

/// MPI backend for `modak`
///
/// Message Passing Interface (MPI) is a protocol which enables communication between multiple
/// CPUs in a high-performance computing environment. While [`rayon`] can parallelize tasks on a
/// single CPU, MPI can also parallelize tasks on multiple CPUs by running independent
/// processes on all CPUs at once (tasks) which are assigned ids (ranks) which tell each
/// process what to do and where to send results. This backend coordinates processes which would
/// typically be parallelized over the events in an
/// [`EventBuffer`](`crate::data::EventBuffer`).
///
/// To use this backend, the library must be built with the `mpi` feature, which requires an
/// existing implementation of MPI like OpenMPI or MPICH. All processing code should be
/// sandwiched between calls to [`use_mpi`] and [`finalize_mpi`]:
/// ```ignore
/// fn main() {
///     modak_core::mpi::use_mpi(true);
///     // modak analysis code here
///     modak_core::mpi::finalize_mpi();
/// }
/// ```
pub mod mpi {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::OnceLock;

    use lazy_static::lazy_static;
    #[cfg(feature = "mpi")]
    use mpi::{
        environment::Universe,
        topology::SimpleCommunicator,
        traits::Communicator,
    };
    use parking_lot::RwLock;

    lazy_static! {
        static ref USE_MPI: AtomicBool = AtomicBool::new(false);
    }

    pub struct MPIState {
        pub size: usize,
        pub rank: usize,
        #[cfg(feature = "mpi")]
        pub universe: Universe,
    }

    static MPI_STATE: OnceLock<RwLock<Option<MPIState>>> = OnceLock::new();

    /// The leader rank in the distributed reduction protocol
    pub const LEADER_RANK: usize = 0;

    /// Check if the current process is the leader process
    pub fn is_leader() -> bool {
        crate::mpi::rank() == LEADER_RANK
    }

    /// Shortcut method to just get the global MPI communicator without accessing `size` and
    /// `rank` directly
    #[cfg(feature = "mpi")]
    pub fn world() -> Option<SimpleCommunicator> {
        if let Some(mpi_state_lock) = MPI_STATE.get() {
            if let Some(mpi_state) = &*mpi_state_lock.read() {
                return Some(mpi_state.universe.world());
            }
        }
        None
    }

    /// Get the rank of the current process
    pub fn rank() -> usize {
        if let Some(mpi_state_lock) = MPI_STATE.get() {
            if let Some(mpi_state) = &*mpi_state_lock.read() {
                return mpi_state.rank;
            }
        }
        LEADER_RANK
    }

    /// Get number of available processes/ranks
    pub fn size() -> usize {
        if let Some(mpi_state_lock) = MPI_STATE.get() {
            if let Some(mpi_state) = &*mpi_state_lock.read() {
                return mpi_state.size;
            }
        }
        1
    }

    /// Use the MPI backend
    ///
    /// # Notes
    ///
    /// You must have MPI installed for this to work, and you must call the program with
    /// `mpirun <executable>`, or bad things will happen.
    ///
    /// Only the results of methods on the leader process (rank 0) should be considered valid,
    /// as follower processes only hold partitions of each dataset. Use [`is_leader()`] to
    /// guard output.
    ///
    /// If [`use_mpi()`] is called multiple times, the subsequent calls will have no effect.
    ///
    /// <div class="warning">
    ///
    /// You **must** call [`finalize_mpi()`] before your program exits for MPI to terminate
    /// smoothly.
    ///
    /// </div>
    pub fn use_mpi(trigger: bool) {
        if trigger {
            USE_MPI.store(true, Ordering::SeqCst);
            MPI_STATE.get_or_init(|| {
                #[cfg(feature = "mpi")]
                {
                    #[cfg(feature = "rayon")]
                    let threading = mpi::Threading::Funneled;
                    #[cfg(not(feature = "rayon"))]
                    let threading = mpi::Threading::Single;
                    let (universe, _threading) =
                        mpi::initialize_with_threading(threading).unwrap();
                    let world = universe.world();
                    RwLock::new(Some(MPIState {
                        size: world.size() as usize,
                        rank: world.rank() as usize,
                        universe,
                    }))
                }
                #[cfg(not(feature = "mpi"))]
                {
                    RwLock::new(Some(MPIState {
                        size: 1,
                        rank: LEADER_RANK,
                    }))
                }
            });
        }
    }

    /// Drop the MPI universe and finalize MPI at the end of a program
    ///
    /// This function will do nothing if MPI is not initialized.
    pub fn finalize_mpi() {
        if using_mpi() {
            let mut mpi_state = MPI_STATE.get().unwrap().write();
            *mpi_state = None;
        }
    }

    /// Check if MPI backend is enabled
    pub fn using_mpi() -> bool {
        USE_MPI.load(Ordering::SeqCst)
    }
}

/// Per-dataset working memory ([`EventBuffer`](data::EventBuffer)) and kinematic records.
pub mod data;
/// Back-end contract for the data-parallel kernels and the host reference implementation.
pub mod executor;
/// The [`Factor`](factors::Factor) trait, factor parameters, and the prototype registry.
pub mod factors;
/// The normalization-integral matrix container.
pub mod integrals;
/// The [`AmplitudeManager`](manager::AmplitudeManager) and its evaluation pipeline.
pub mod manager;
/// Identical-particle symmetrization.
pub mod permute;
/// Utility functions and types
pub mod utils;
/// Useful traits for all crate structs
pub mod traits {
    pub use crate::executor::Executor;
    pub use crate::factors::Factor;
}

pub use crate::data::{Event, EventBuffer};
pub use crate::factors::{
    factor_prototype, register_factor_prototype, Factor, FactorDescriptor, FactorParameter,
    TermDescriptor,
};
pub use crate::integrals::NormIntegrals;
pub use crate::manager::{AmplitudeManager, Scaling};
pub use crate::permute::Permutation;
pub use crate::utils::vectors::{Vec3, Vec4};

pub type ModakResult<T> = Result<T, ModakError>;

/// The error type used by all `modak` internal methods
#[derive(Error, Debug)]
pub enum ModakError {
    /// An error which occurs when the user tries to register two factor prototypes by the same
    /// name.
    #[error("A factor by the name \"{name}\" is already registered!")]
    RegistrationError {
        /// Name of the factor which is already registered
        name: String,
    },
    /// An error which occurs when the user references an unregistered factor prototype.
    #[error("No registered factor with name \"{name}\"!")]
    FactorNotFoundError {
        /// Name of the factor which failed lookup
        name: String,
    },
    /// An error which occurs when the user references a term which was never added.
    #[error("No term with name \"{name}\" in this manager!")]
    TermNotFoundError {
        /// Name of the term which failed lookup
        name: String,
    },
    /// An error which occurs when a factor prototype is handed an argument list it cannot
    /// parse.
    #[error("Factor \"{name}\" cannot be built from arguments {args:?}: {reason}")]
    FactorArgumentError {
        /// Name of the factor prototype
        name: String,
        /// The offending argument list
        args: Vec<String>,
        /// What went wrong during parsing
        reason: String,
    },
    /// An error which occurs when a permutation does not match the reaction's particle count.
    #[error(
        "Permutation {permutation:?} has length {len} but the reaction has {expected} particles"
    )]
    PermutationLengthError {
        /// The offending permutation
        permutation: Vec<usize>,
        /// Its length
        len: usize,
        /// The reaction's particle count
        expected: usize,
    },
    /// An error returned by the Rust encoder
    #[error("Encoder error: {0}")]
    EncodeError(#[from] bincode::error::EncodeError),
    /// An error returned by the Rust decoder
    #[error("Decoder error: {0}")]
    DecodeError(#[from] bincode::error::DecodeError),
    /// A custom fallback error for errors too complex or too infrequent to warrant their own
    /// error category.
    #[error("{0}")]
    Custom(String),
}

impl Clone for ModakError {
    // error types are rarely cloneable, but cloneable results are convenient for callers that
    // box them up for minimizers
    fn clone(&self) -> Self {
        let err_string = self.to_string();
        ModakError::Custom(err_string)
    }
}
