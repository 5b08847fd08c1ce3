use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use modak_core::data::Event;
use modak_core::integrals::NormIntegrals;
use modak_core::manager::AmplitudeManager;
use modak_core::mpi;
use modak_core::{ModakError, ModakResult};
use num::complex::Complex64;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::likelihoods::{norm_int_term, LikelihoodCalculator, LikelihoodParts};

#[cfg(feature = "mpi")]
use ::mpi::{topology::Communicator, traits::*};

static CALCULATOR_ID_COUNTER: AtomicU64 = AtomicU64::new(FIRST_ID);

const FIRST_ID: u64 = 0;

/// The fixed command set of the leader/follower protocol. Followers never speak unsolicited;
/// every exchange is initiated by one of these, sent point-to-point in rank order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Broadcast the current parameter state; followers apply it before any computation.
    UpdateParameters = 0,
    /// Followers reply with their partial `(lnL, Σw_bkg, N_bkg, N_data)` tuples.
    ComputeLikelihood = 1,
    /// Followers reply with their unnormalized integral partials.
    ComputeIntegrals = 2,
    /// Drain followers at the end of a fit; sent at most once.
    Finalize = 3,
    /// Break followers out of their serve loops at shutdown; sent at most once.
    Exit = 4,
}

impl Command {
    /// Decode a command from its wire tag.
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(Self::UpdateParameters),
            1 => Some(Self::ComputeLikelihood),
            2 => Some(Self::ComputeIntegrals),
            3 => Some(Self::Finalize),
            4 => Some(Self::Exit),
            _ => None,
        }
    }
}

/// The parameter state broadcast by the leader on every evaluation: production factors in
/// term order and free-parameter values in declaration order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ParameterUpdate {
    productions: Vec<Complex64>,
    values: Vec<f64>,
}

/// A free parameter declared for the fit, bound into the model through a shared cell on every
/// rank.
struct FreeParameter {
    term: String,
    name: String,
    cell: Arc<RwLock<f64>>,
}

#[cfg_attr(not(feature = "mpi"), allow(dead_code))]
enum Role {
    /// Single-process evaluation; the reduction degenerates to one partition.
    Local(Box<LikelihoodCalculator>),
    /// Rank 0: holds only the model, the production factors, and the reduced sums.
    Leader {
        manager: AmplitudeManager,
        integrals: Option<NormIntegrals>,
    },
    /// Ranks 1..W: own disjoint partitions of the data and acceptance samples.
    Follower(Box<LikelihoodCalculator>),
}

/// Partition `total` items among the `size - 1` follower ranks; the leader owns none.
fn follower_range(total: usize, rank: usize, size: usize) -> (usize, usize) {
    let followers = size - 1;
    let index = rank - 1;
    let base = total / followers;
    let rem = total % followers;
    if index < rem {
        (index * (base + 1), base + 1)
    } else {
        (rem * (base + 1) + (index - rem) * base, base)
    }
}

/// A likelihood evaluation driven by a leader over partitioned followers.
///
/// Every rank constructs the calculator with the identical model and full event slices; the
/// constructor assigns roles from the MPI state and keeps only each rank's partition. The
/// leader drives each evaluation as a fixed command sequence; all calls are blocking and the
/// command order is a strict total order over a single point-to-point channel.
///
/// Without MPI (or with one process) the same evaluation runs locally through an identical
/// reduction over a single partition.
pub struct DistributedCalculator {
    role: Role,
    free_parameters: Vec<FreeParameter>,
    #[cfg_attr(not(feature = "mpi"), allow(dead_code))]
    n_gen: usize,
    #[cfg_attr(not(feature = "mpi"), allow(dead_code))]
    first_pass: bool,
    id: u64,
}

impl DistributedCalculator {
    /// Build the calculator for this rank.
    ///
    /// `free_parameters` declares `(term, parameter, initial value)` bindings; each is bound
    /// to a shared cell so that leader-side updates ship by value and follower factors stay
    /// marked free.
    pub fn new(
        mut manager: AmplitudeManager,
        free_parameters: &[(String, String, f64)],
        data: &[Event],
        background: Option<&[Event]>,
        accmc: &[Event],
        n_gen: usize,
    ) -> ModakResult<Self> {
        let bound = free_parameters
            .iter()
            .map(|(term, name, initial)| {
                let cell = Arc::new(RwLock::new(*initial));
                manager.set_par_ptr(term, name, &cell)?;
                Ok(FreeParameter {
                    term: term.clone(),
                    name: name.clone(),
                    cell,
                })
            })
            .collect::<ModakResult<Vec<_>>>()?;
        let size = mpi::size();
        let rank = mpi::rank();
        let id = CALCULATOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst);
        let role = if size == 1 {
            let calculator = LikelihoodCalculator::new(manager, data, accmc, n_gen);
            let calculator = match background {
                Some(background) => calculator.with_background(background),
                None => calculator,
            };
            Role::Local(Box::new(calculator))
        } else if rank == mpi::LEADER_RANK {
            Role::Leader {
                manager,
                integrals: None,
            }
        } else {
            manager.set_norm_count(Some(data.len() as f64));
            let (start, count) = follower_range(data.len(), rank, size);
            let (mc_start, mc_count) = follower_range(accmc.len(), rank, size);
            log::info!(
                "rank {rank} owns data[{start}..{}] and accmc[{mc_start}..{}]",
                start + count,
                mc_start + mc_count
            );
            let calculator = LikelihoodCalculator::new(
                manager,
                &data[start..start + count],
                &accmc[mc_start..mc_start + mc_count],
                1,
            );
            let calculator = match background {
                Some(background) => {
                    let (b_start, b_count) = follower_range(background.len(), rank, size);
                    calculator.with_background(&background[b_start..b_start + b_count])
                }
                None => calculator,
            };
            Role::Follower(Box::new(calculator))
        };
        Ok(Self {
            role,
            free_parameters: bound,
            n_gen,
            first_pass: true,
            id,
        })
    }

    /// Whether this rank drives the evaluation.
    pub fn is_leader(&self) -> bool {
        !matches!(self.role, Role::Follower(_))
    }

    /// Set a term's production factor. Leader (or local) only; the value ships to followers
    /// on the next evaluation.
    pub fn set_production(&mut self, term: &str, value: Complex64) -> ModakResult<()> {
        self.manager_mut()?.set_default_production(term, value)
    }

    /// Set a declared free parameter by name. Leader (or local) only.
    pub fn set_parameter(&mut self, name: &str, value: f64) -> ModakResult<()> {
        let mut found = false;
        for parameter in self
            .free_parameters
            .iter()
            .filter(|p| p.name == name)
        {
            log::debug!("updating {} in term {}", parameter.name, parameter.term);
            *parameter.cell.write() = value;
            found = true;
        }
        if !found {
            return Err(ModakError::Custom(format!(
                "no free parameter named \"{name}\" was declared"
            )));
        }
        self.manager_mut()?.update_par(name);
        Ok(())
    }

    fn manager_mut(&mut self) -> ModakResult<&mut AmplitudeManager> {
        match &mut self.role {
            Role::Local(calculator) => Ok(calculator.manager_mut()),
            Role::Leader { manager, .. } => Ok(manager),
            Role::Follower(_) => Err(ModakError::Custom(
                "followers receive parameters from the leader".to_string(),
            )),
        }
    }

    /// Snapshot the leader's parameter state for broadcast.
    pub fn parameter_update(&self) -> ParameterUpdate {
        let manager = match &self.role {
            Role::Local(calculator) => calculator.manager(),
            Role::Leader { manager, .. } => manager,
            Role::Follower(calculator) => calculator.manager(),
        };
        ParameterUpdate {
            // raw values: followers fold in their own scale parameters, which ship as free
            // parameters alongside
            productions: (0..manager.n_terms())
                .map(|i| manager.production_value(i))
                .collect(),
            values: self
                .free_parameters
                .iter()
                .map(|p| *p.cell.read())
                .collect(),
        }
    }

    /// Apply a broadcast parameter state on a follower.
    pub fn apply_parameter_update(&mut self, update: &ParameterUpdate) {
        let Role::Follower(calculator) = &mut self.role else {
            unreachable!("parameter updates are only applied on followers")
        };
        let names = calculator.manager().term_names();
        let manager = calculator.manager_mut();
        for (name, value) in names.iter().zip(update.productions.iter()) {
            manager
                .set_default_production(name, *value)
                .expect("leader and follower models must match");
        }
        for (parameter, value) in self.free_parameters.iter().zip(update.values.iter()) {
            *parameter.cell.write() = *value;
        }
        for parameter in &self.free_parameters {
            manager.update_par(&parameter.name);
        }
    }

    /// Evaluate `−2·lnL`, reducing partial sums from every follower. Must be called on the
    /// leader; followers sit in [`serve`](Self::serve).
    pub fn evaluate(&mut self) -> f64 {
        assert!(
            self.is_leader(),
            "evaluate() may only be called on the leader"
        );
        if let Role::Local(calculator) = &mut self.role {
            return calculator.evaluate();
        }
        #[cfg(feature = "mpi")]
        {
            let update = self.parameter_update();
            let recompute_integrals = {
                let Role::Leader { manager, integrals } = &self.role else {
                    unreachable!()
                };
                manager.has_free_parameters() || self.first_pass || integrals.is_none()
            };
            let world = mpi::world().expect("MPI must be initialized on the leader");
            let size = world.size() as usize;
            let payload = bincode::serde::encode_to_vec(&update, bincode::config::standard())
                .expect("parameter updates must encode");
            for rank in 1..size {
                let process = world.process_at_rank(rank as i32);
                process.send(&[self.id as i32, Command::UpdateParameters as i32][..]);
                process.send(&payload[..]);
            }
            for rank in 1..size {
                world
                    .process_at_rank(rank as i32)
                    .send(&[self.id as i32, Command::ComputeLikelihood as i32][..]);
            }
            let mut parts = Vec::with_capacity(size - 1);
            for rank in 1..size {
                let (tuple, _status) = world.process_at_rank(rank as i32).receive_vec::<f64>();
                parts.push(LikelihoodParts::from_slice(&tuple));
            }
            let reduced = LikelihoodParts::reduce(parts);
            if recompute_integrals {
                for rank in 1..size {
                    world
                        .process_at_rank(rank as i32)
                        .send(&[self.id as i32, Command::ComputeIntegrals as i32][..]);
                }
                let Role::Leader { manager, integrals } = &mut self.role else {
                    unreachable!()
                };
                let mut reduced_integrals = NormIntegrals::zeros(manager.term_names());
                for rank in 1..size {
                    let (bytes, _status) = world.process_at_rank(rank as i32).receive_vec::<u8>();
                    let (partial, _): (NormIntegrals, usize) =
                        bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                            .expect("integral partials must decode");
                    reduced_integrals.accumulate(&partial);
                }
                reduced_integrals.scale(1.0 / self.n_gen as f64);
                *integrals = Some(reduced_integrals);
            }
            let Role::Leader { manager, integrals } = &self.role else {
                unreachable!()
            };
            let norm = norm_int_term(
                manager,
                integrals
                    .as_ref()
                    .expect("integrals must be reduced before the normalization term"),
            );
            self.first_pass = false;
            -2.0 * (reduced.ln_l - norm)
        }
        #[cfg(not(feature = "mpi"))]
        {
            unreachable!("multi-rank roles require the mpi feature")
        }
    }

    /// The follower loop: block on leader commands until [`Command::Finalize`] or
    /// [`Command::Exit`] arrives.
    pub fn serve(&mut self) {
        assert!(
            matches!(self.role, Role::Follower(_)),
            "serve() may only be called on followers"
        );
        #[cfg(feature = "mpi")]
        {
            let world = mpi::world().expect("MPI must be initialized on followers");
            let leader = world.process_at_rank(mpi::LEADER_RANK as i32);
            loop {
                let (command, _status) = leader.receive_vec::<i32>();
                debug_assert_eq!(command[0], self.id as i32);
                match Command::from_tag(command[1]) {
                    Some(Command::UpdateParameters) => {
                        let (bytes, _status) = leader.receive_vec::<u8>();
                        let (update, _): (ParameterUpdate, usize) = bincode::serde::decode_from_slice(
                            &bytes,
                            bincode::config::standard(),
                        )
                        .expect("parameter updates must decode");
                        self.apply_parameter_update(&update);
                    }
                    Some(Command::ComputeLikelihood) => {
                        let Role::Follower(calculator) = &mut self.role else {
                            unreachable!()
                        };
                        let parts = calculator.data_term();
                        leader.send(&parts.to_array()[..]);
                    }
                    Some(Command::ComputeIntegrals) => {
                        let Role::Follower(calculator) = &mut self.role else {
                            unreachable!()
                        };
                        let partial = calculator.integral_partials();
                        let bytes =
                            bincode::serde::encode_to_vec(&partial, bincode::config::standard())
                                .expect("integral partials must encode");
                        leader.send(&bytes[..]);
                    }
                    Some(Command::Finalize) | Some(Command::Exit) => break,
                    None => panic!("unknown command tag {}", command[1]),
                }
            }
        }
    }

    /// Drain the followers at the end of a fit. Sent at most once, by the first calculator
    /// instance on the leader.
    pub fn finalize(&mut self) {
        self.shutdown(Command::Finalize);
    }

    fn shutdown(&mut self, command: Command) {
        if !self.is_leader() || self.id != FIRST_ID {
            return;
        }
        #[cfg(feature = "mpi")]
        if let Some(world) = mpi::world() {
            for rank in 1..world.size() {
                world
                    .process_at_rank(rank)
                    .send(&[self.id as i32, command as i32][..]);
            }
        }
        #[cfg(not(feature = "mpi"))]
        let _ = command;
    }
}

impl Drop for DistributedCalculator {
    fn drop(&mut self) {
        if matches!(self.role, Role::Leader { .. }) {
            self.shutdown(Command::Exit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use modak_core::factors::{FactorDescriptor, TermDescriptor};
    use modak_core::utils::vectors::Vec3;

    fn make_manager() -> AmplitudeManager {
        modak_amplitudes::register_all();
        let mut manager = AmplitudeManager::new("ab", &["a", "b"]);
        manager
            .configure(&[TermDescriptor {
                full_name: "S::coeff".to_string(),
                sum: "S".to_string(),
                scale: None,
                factors: vec![FactorDescriptor {
                    name: "ComplexScalar".to_string(),
                    args: vec!["c_re".to_string(), "c_im".to_string()],
                }],
                permutations: vec![],
                production: Complex64::ONE,
                parameters: vec![],
            }])
            .unwrap();
        manager
    }

    fn events(n: usize) -> Vec<Event> {
        (0..n)
            .map(|i| Event {
                p4s: vec![
                    Vec3::new(0.0, 0.0, 0.1 * (i + 1) as f64).with_mass(0.14),
                    Vec3::new(0.1, 0.0, 0.0).with_mass(0.14),
                ],
                weight: 1.0,
            })
            .collect()
    }

    fn free_parameters() -> Vec<(String, String, f64)> {
        vec![
            ("S::coeff".to_string(), "c_re".to_string(), 1.0),
            ("S::coeff".to_string(), "c_im".to_string(), 0.0),
        ]
    }

    #[test]
    fn test_follower_range_covers_partition() {
        // 10 events over 3 followers (size 4): 4 + 3 + 3
        assert_eq!(follower_range(10, 1, 4), (0, 4));
        assert_eq!(follower_range(10, 2, 4), (4, 3));
        assert_eq!(follower_range(10, 3, 4), (7, 3));
        let total: usize = (1..4).map(|rank| follower_range(10, rank, 4).1).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_command_tags_round_trip() {
        for command in [
            Command::UpdateParameters,
            Command::ComputeLikelihood,
            Command::ComputeIntegrals,
            Command::Finalize,
            Command::Exit,
        ] {
            assert_eq!(Command::from_tag(command as i32), Some(command));
        }
        assert_eq!(Command::from_tag(99), None);
    }

    #[test]
    fn test_local_evaluation_tracks_free_parameters() {
        let sample = events(20);
        let mut calculator = DistributedCalculator::new(
            make_manager(),
            &free_parameters(),
            &sample,
            None,
            &sample,
            20,
        )
        .unwrap();
        assert!(calculator.is_leader());
        let first = calculator.evaluate();

        // moving a free parameter must change the likelihood; moving it back must restore it
        calculator.set_parameter("c_re", 2.0).unwrap();
        let moved = calculator.evaluate();
        assert!((moved - first).abs() > 1e-6);
        calculator.set_parameter("c_re", 1.0).unwrap();
        let restored = calculator.evaluate();
        assert_relative_eq!(restored, first, epsilon = 1e-10);
    }

    #[test]
    fn test_undeclared_parameter_rejected() {
        let sample = events(5);
        let mut calculator = DistributedCalculator::new(
            make_manager(),
            &free_parameters(),
            &sample,
            None,
            &sample,
            5,
        )
        .unwrap();
        assert!(calculator.set_parameter("nope", 1.0).is_err());
    }

    #[test]
    fn test_parameter_update_snapshot() {
        let sample = events(5);
        let mut calculator = DistributedCalculator::new(
            make_manager(),
            &free_parameters(),
            &sample,
            None,
            &sample,
            5,
        )
        .unwrap();
        calculator.set_parameter("c_re", 0.5).unwrap();
        calculator
            .set_production("S::coeff", Complex64::new(0.0, 2.0))
            .unwrap();
        let update = calculator.parameter_update();
        assert_eq!(update.values, vec![0.5, 0.0]);
        assert_eq!(update.productions, vec![Complex64::new(0.0, 2.0)]);
    }
}
