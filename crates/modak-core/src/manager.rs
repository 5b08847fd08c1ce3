use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use num::complex::Complex64;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::data::{Event, EventBuffer, Kinematics};
use crate::executor::{Executor, HostExecutor};
use crate::factors::{
    factor_prototype, user_var_key, FactorInstance, FactorParameter, TermDescriptor,
};
use crate::permute::{symmetric_combinations, Permutation};
use crate::{ModakError, ModakResult};

/// The intensity-scaling convention used when building the `V_i·V_j*` pair table.
///
/// The two conventions differ by an additive constant in the log-likelihood
/// (`Σ_e w(e)·ln N`), so fit minima are shifted between them but parameter estimates are not.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scaling {
    /// Divide each `V_i·V_j*` by the number of true events so the data term of `−lnL` grows
    /// like `N` rather than `N·ln N`, consistent with the normalization-integral term.
    #[default]
    Normalized,
    /// The historical convention without the `1/N` pre-scaling.
    Legacy,
}

/// A symmetric boolean matrix over terms: `C[i][j]` is true iff terms `i` and `j` belong to
/// the same coherent sum. The diagonal is always true.
#[derive(Clone, Debug, Default)]
pub struct CoherenceMatrix {
    rows: Vec<Vec<bool>>,
}

impl CoherenceMatrix {
    /// Build the full matrix from the ordered list of sum memberships.
    pub fn from_sums(sums: &[String]) -> Self {
        let mut matrix = Self::default();
        for i in 0..sums.len() {
            matrix.push_term(&sums[..=i]);
        }
        matrix
    }

    /// Grow the matrix by one term; `sums` holds every term's sum membership with the new
    /// term's last. The last row and column are built simultaneously since the matrix is
    /// symmetric.
    pub(crate) fn push_term(&mut self, sums: &[String]) {
        let n = sums.len();
        assert_eq!(
            self.rows.len(),
            n - 1,
            "coherence matrix size does not match the term count"
        );
        let new_sum = &sums[n - 1];
        let mut last_row = Vec::with_capacity(n);
        for (i, row) in self.rows.iter_mut().enumerate() {
            let coherent = sums[i] == *new_sum;
            row.push(coherent);
            last_row.push(coherent);
        }
        last_row.push(true);
        self.rows.push(last_row);
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn is_coherent(&self, i: usize, j: usize) -> bool {
        self.rows[i][j]
    }
}

/// The complex production coefficient `V_i` of one term.
///
/// Three states: *default* (an owned value), *bound* (reads through an external cell, e.g. the
/// minimizer's parameter block), and *reset* (the binding is revoked and the owned default is
/// restored).
#[derive(Clone, Debug)]
pub struct ProductionFactor {
    default: Complex64,
    cell: Option<Arc<RwLock<Complex64>>>,
}

impl ProductionFactor {
    fn new(default: Complex64) -> Self {
        Self {
            default,
            cell: None,
        }
    }

    /// The current value, read through the external cell if one is bound.
    pub fn value(&self) -> Complex64 {
        match &self.cell {
            Some(cell) => *cell.read(),
            None => self.default,
        }
    }

    fn set_default(&mut self, value: Complex64) {
        self.default = value;
    }

    fn bind(&mut self, cell: Arc<RwLock<Complex64>>) {
        self.cell = Some(cell);
    }

    fn reset(&mut self) {
        self.cell = None;
    }
}

/// One addend in the coherent sum: an ordered factor list evaluated over a permutation list.
struct Term {
    name: String,
    sum: String,
    factors: Vec<FactorInstance>,
    permutations: Vec<Permutation>,
    production: ProductionFactor,
    scale: FactorParameter,
    fixed: bool,
}

/// The model owner and evaluation engine.
///
/// An [`AmplitudeManager`] maps term names to ordered factor lists and permutation lists,
/// tracks coherent-sum membership, production factors, and per-factor parameter epochs, and
/// schedules the evaluation pipeline over [`EventBuffer`]s: user variables → factors →
/// symmetrized assembly → intensities → sum-log-intensity → normalization integrals. Change
/// detection keyed on parameter epochs skips every stage whose inputs have not changed since
/// the buffer was last evaluated.
pub struct AmplitudeManager {
    reaction_name: String,
    particles: Vec<String>,
    symm_combos: Vec<Permutation>,
    terms: IndexMap<String, Term>,
    coherence: CoherenceMatrix,
    iterations: HashMap<u64, u64>,
    executor: Box<dyn Executor>,
    scaling: Scaling,
    norm_count: Option<f64>,
    optimize_par_iteration: bool,
    flush_four_vecs_if_possible: bool,
    force_user_var_recalc: bool,
    needs_user_vars_only: bool,
}

impl AmplitudeManager {
    /// Create a manager for a reaction given its ordered final-state particle labels.
    ///
    /// Orderings arising from identical labels are enumerated here and attached to every term
    /// as its default permutation list.
    pub fn new<S: AsRef<str>>(reaction_name: &str, particles: &[S]) -> Self {
        log::info!("creating AmplitudeManager for the reaction: {reaction_name}");
        for (i, particle) in particles.iter().enumerate() {
            log::info!("  particle index assignment: {} -> {i}", particle.as_ref());
        }
        let symm_combos = symmetric_combinations(particles);
        if symm_combos.len() > 1 {
            log::info!(
                "the following {} orderings of the particles are indistinguishable and will be permuted when computing amplitudes:",
                symm_combos.len()
            );
            for combo in &symm_combos {
                log::info!("  {combo}");
            }
        }
        Self {
            reaction_name: reaction_name.to_string(),
            particles: particles.iter().map(|p| p.as_ref().to_string()).collect(),
            symm_combos,
            terms: IndexMap::new(),
            coherence: CoherenceMatrix::default(),
            iterations: HashMap::new(),
            executor: Box::new(HostExecutor),
            scaling: Scaling::default(),
            norm_count: None,
            optimize_par_iteration: true,
            flush_four_vecs_if_possible: false,
            force_user_var_recalc: false,
            needs_user_vars_only: true,
        }
    }

    pub fn reaction_name(&self) -> &str {
        &self.reaction_name
    }

    pub fn particles(&self) -> &[String] {
        &self.particles
    }

    /// The permutation list implied by identical final-state particles.
    pub fn symmetric_permutations(&self) -> &[Permutation] {
        &self.symm_combos
    }

    pub fn n_terms(&self) -> usize {
        self.terms.len()
    }

    /// The ordered term names. A term's position in this list is its index.
    pub fn term_names(&self) -> Vec<String> {
        self.terms.keys().cloned().collect()
    }

    pub fn has_term(&self, name: &str) -> bool {
        self.terms.contains_key(name)
    }

    pub fn term_index(&self, name: &str) -> ModakResult<usize> {
        self.terms
            .get_index_of(name)
            .ok_or_else(|| ModakError::TermNotFoundError {
                name: name.to_string(),
            })
    }

    fn term(&self, name: &str) -> ModakResult<&Term> {
        self.terms
            .get(name)
            .ok_or_else(|| ModakError::TermNotFoundError {
                name: name.to_string(),
            })
    }

    fn term_mut(&mut self, name: &str) -> ModakResult<&mut Term> {
        self.terms
            .get_mut(name)
            .ok_or_else(|| ModakError::TermNotFoundError {
                name: name.to_string(),
            })
    }

    /// The permutation list of a term.
    pub fn permutations(&self, name: &str) -> ModakResult<&[Permutation]> {
        Ok(&self.term(name)?.permutations)
    }

    /// The ordered factor instances of a term.
    pub fn factors(&self, name: &str) -> ModakResult<&[FactorInstance]> {
        Ok(&self.term(name)?.factors)
    }

    pub fn coherence(&self) -> &CoherenceMatrix {
        &self.coherence
    }

    /// Whether every factor in the model can be evaluated from user variables alone.
    pub fn needs_user_vars_only(&self) -> bool {
        self.needs_user_vars_only
    }

    /// Replace the evaluation back-end. The host back-end is installed by default.
    pub fn set_executor(&mut self, executor: Box<dyn Executor>) {
        self.executor = executor;
    }

    pub fn scaling(&self) -> Scaling {
        self.scaling
    }

    /// Select the intensity-scaling convention.
    pub fn set_scaling(&mut self, scaling: Scaling) {
        self.scaling = scaling;
    }

    /// Override the event count used by [`Scaling::Normalized`].
    ///
    /// A distributed evaluation sets this to the total data-sample size on every worker so
    /// that partitioned buffers reproduce the single-process likelihood exactly.
    pub fn set_norm_count(&mut self, count: Option<f64>) {
        self.norm_count = count;
    }

    /// Enable or disable parameter-epoch change detection (enabled by default).
    pub fn set_optimize_par_iteration(&mut self, flag: bool) {
        self.optimize_par_iteration = flag;
    }

    /// Allow buffers to drop their four-vector blocks once every factor can run from user
    /// variables.
    pub fn set_flush_four_vecs_if_possible(&mut self, flag: bool) {
        self.flush_four_vecs_if_possible = flag;
    }

    /// Force the user-variable pass to overwrite existing regions on every evaluation. Needed
    /// when a buffer's kinematics are rewritten in place, as during event generation.
    pub fn set_force_user_var_recalc(&mut self, flag: bool) {
        self.force_user_var_recalc = flag;
        if flag {
            self.flush_four_vecs_if_possible = false;
        }
    }

    /// Append a cloned factor from the registered prototype `factor_name` to the term `name`,
    /// creating the term on first use.
    ///
    /// A new term joins the coherent sum `sum`, receives the identical-particle permutation
    /// list, and grows the coherence matrix by one row and column.
    pub fn add_factor(
        &mut self,
        name: &str,
        factor_name: &str,
        args: &[String],
        sum: &str,
        scale: Option<&str>,
    ) -> ModakResult<()> {
        let factor = factor_prototype(factor_name, args)?;
        if !self.terms.contains_key(name) {
            let mut sums: Vec<String> = self.terms.values().map(|t| t.sum.clone()).collect();
            sums.push(sum.to_string());
            self.coherence.push_term(&sums);
            self.terms.insert(
                name.to_string(),
                Term {
                    name: name.to_string(),
                    sum: sum.to_string(),
                    factors: Vec::new(),
                    permutations: self.symm_combos.clone(),
                    production: ProductionFactor::new(Complex64::ONE),
                    scale: FactorParameter::from_scale_spec(scale),
                    fixed: true,
                },
            );
        }
        self.needs_user_vars_only = self.needs_user_vars_only && factor.needs_user_vars_only();
        let instance = FactorInstance::new(factor);
        self.iterations.insert(instance.id(), 0);
        let term = self.terms.get_mut(name).unwrap();
        term.fixed = term.fixed && !instance.factor().contains_free_parameters();
        term.factors.push(instance);
        Ok(())
    }

    /// Append a custom permutation to a term. Re-adding an identical permutation is reported
    /// and ignored.
    pub fn add_permutation(&mut self, name: &str, permutation: Permutation) -> ModakResult<()> {
        let n_particles = self.particles.len();
        if permutation.len() != n_particles {
            return Err(ModakError::PermutationLengthError {
                permutation: permutation.as_slice().to_vec(),
                len: permutation.len(),
                expected: n_particles,
            });
        }
        let term = self.term_mut(name)?;
        if term.permutations.contains(&permutation) {
            log::info!("the permutation {permutation} already exists for {name}");
            return Ok(());
        }
        log::info!("adding a new permutation for {name}: {permutation}");
        term.permutations.push(permutation);
        Ok(())
    }

    /// Build the model from a list of opaque term descriptors, as produced by an external
    /// configuration layer.
    pub fn configure(&mut self, descriptors: &[TermDescriptor]) -> ModakResult<()> {
        for descriptor in descriptors {
            for factor in &descriptor.factors {
                self.add_factor(
                    &descriptor.full_name,
                    &factor.name,
                    &factor.args,
                    &descriptor.sum,
                    descriptor.scale.as_deref(),
                )?;
            }
            for permutation in &descriptor.permutations {
                self.add_permutation(
                    &descriptor.full_name,
                    Permutation::new(permutation.clone()),
                )?;
            }
            self.set_default_production(&descriptor.full_name, descriptor.production)?;
            for (parameter, value) in &descriptor.parameters {
                self.set_par_value(&descriptor.full_name, parameter, *value)?;
            }
        }
        Ok(())
    }

    /// Set the owned default production factor of a term.
    pub fn set_default_production(&mut self, name: &str, value: Complex64) -> ModakResult<()> {
        self.term_mut(name)?.production.set_default(value);
        Ok(())
    }

    /// Point a term's production factor at external storage. The manager does not own the
    /// cell; [`reset_productions`](Self::reset_productions) revokes the borrow.
    pub fn bind_production(
        &mut self,
        name: &str,
        cell: Arc<RwLock<Complex64>>,
    ) -> ModakResult<()> {
        self.term_mut(name)?.production.bind(cell);
        Ok(())
    }

    /// Revoke every external production-factor binding, reverting to the owned defaults.
    pub fn reset_productions(&mut self) {
        for term in self.terms.values_mut() {
            term.production.reset();
        }
    }

    /// The effective production factor of the term at `index`: the bound or default value
    /// times the current value of the term's scale parameter.
    pub fn production_factor(&self, index: usize) -> Complex64 {
        let (_, term) = self
            .terms
            .get_index(index)
            .expect("term index out of range");
        term.production.value() * term.scale.value()
    }

    /// The effective production factor of a term looked up by name.
    pub fn production_factor_named(&self, name: &str) -> ModakResult<Complex64> {
        let term = self.term(name)?;
        Ok(term.production.value() * term.scale.value())
    }

    /// The raw production value of the term at `index`, without the scale parameter applied.
    pub fn production_value(&self, index: usize) -> Complex64 {
        let (_, term) = self
            .terms
            .get_index(index)
            .expect("term index out of range");
        term.production.value()
    }

    /// Set the owned value of a parameter inside a term's factors (or its scale parameter),
    /// revoking any external binding it held.
    pub fn set_par_value(&mut self, name: &str, parameter: &str, value: f64) -> ModakResult<()> {
        let term = self.term_mut(name)?;
        if term.scale.matches(parameter) {
            term.scale.set_value(value);
        }
        term.fixed = true;
        for instance in term.factors.iter_mut() {
            instance.factor.set_par_value(parameter, value);
            term.fixed = term.fixed && !instance.factor.contains_free_parameters();
        }
        Ok(())
    }

    /// Bind a parameter inside a term's factors (or its scale parameter) to an external cell.
    pub fn set_par_ptr(
        &mut self,
        name: &str,
        parameter: &str,
        cell: &Arc<RwLock<f64>>,
    ) -> ModakResult<()> {
        let term = self.term_mut(name)?;
        if term.scale.matches(parameter) {
            term.scale.bind(cell.clone());
        }
        for instance in term.factors.iter_mut() {
            if instance.factor.set_par_ptr(parameter, cell) {
                term.fixed = false;
            }
        }
        Ok(())
    }

    /// Signal that the named parameter's value changed. Every factor influenced by the
    /// parameter has its epoch advanced so the next evaluation recomputes it; names used by no
    /// factor are silently ignored since other managers may consume them.
    pub fn update_par(&mut self, parameter: &str) {
        log::debug!("received signal that {parameter} changed");
        for term in self.terms.values() {
            for instance in &term.factors {
                if instance.factor().update_par(parameter) {
                    *self.iterations.entry(instance.id()).or_insert(0) += 1;
                }
            }
        }
    }

    /// Whether any term contains a factor with a free parameter. Used to trigger integral
    /// recomputation on each fit iteration.
    pub fn has_free_parameters(&self) -> bool {
        self.terms.values().any(|term| !term.fixed)
    }

    fn iteration_of(&self, id: u64) -> u64 {
        self.iterations.get(&id).copied().unwrap_or(0)
    }

    /// The maximum number of doubles needed to store all factor values of any single term for
    /// one event. Sizes the shared factor scratch block.
    pub fn max_factor_storage_per_event(&self) -> usize {
        self.terms
            .values()
            .map(|term| {
                let cells = term.factors.len() * term.permutations.len();
                assert!(cells > 0, "term {} has no factors or permutations", term.name);
                2 * cells
            })
            .max()
            .unwrap_or(0)
    }

    /// The number of doubles needed to store every assembled term for one event.
    pub fn term_storage_per_event(&self) -> usize {
        2 * self.terms.len()
    }

    /// The number of doubles needed to store all user variables for one event, de-duplicated
    /// by storage key.
    pub fn user_vars_per_event(&self) -> usize {
        let mut counted: HashSet<String> = HashSet::new();
        let mut storage = 0;
        for term in self.terms.values() {
            for instance in &term.factors {
                let factor = instance.factor();
                if factor.num_user_vars() == 0 {
                    continue;
                }
                if counted.insert(user_var_key(factor)) {
                    storage += term.permutations.len() * factor.num_user_vars();
                }
            }
        }
        storage
    }

    /// Load events into a buffer sized for this model.
    pub fn load_events(&self, events: &[Event]) -> EventBuffer {
        let mut buffer = EventBuffer::from_events(events);
        buffer.allocate(self);
        buffer
    }

    /// Compute the user-variable regions of a buffer.
    ///
    /// Regions are keyed by factor name (static user variables) or identifier, allocated at
    /// most once per key, and skipped thereafter unless the force-recalculation flag is set.
    /// When the installed back-end prefers event-major access, each region is transposed in
    /// place after computation.
    pub fn calc_user_vars(&self, buffer: &mut EventBuffer) {
        for term in self.terms.values() {
            let n_perms = term.permutations.len();
            for instance in &term.factors {
                let factor = instance.factor();
                let n_vars = factor.num_user_vars();
                if n_vars == 0 {
                    continue;
                }
                let key = user_var_key(factor);
                let length = n_vars * buffer.n_padded * n_perms;
                let offset = match buffer.user_var_offsets.get(&key) {
                    Some(&offset) => {
                        if !self.force_user_var_recalc {
                            continue;
                        }
                        offset
                    }
                    None => {
                        let offset = buffer.user_vars.len();
                        buffer.user_vars.resize(offset + length, 0.0);
                        buffer.user_var_offsets.insert(key, offset);
                        offset
                    }
                };
                let kin = Kinematics {
                    p4s: &buffer.p4s,
                    n_events: buffer.n_padded,
                    n_particles: buffer.n_particles,
                };
                let region = &mut buffer.user_vars[offset..offset + length];
                factor.calc_user_vars(&kin, region, &term.permutations);
                if self.executor.user_vars_event_major() {
                    transpose_user_vars(region, n_vars, buffer.n_padded, n_perms);
                }
            }
        }
    }

    /// Compute the factor blocks and assemble the symmetrized term amplitudes of a buffer.
    ///
    /// Returns a mask of the terms that were actually reassembled: a term is recomputed iff
    /// one of its factors' parameter epochs advanced since this buffer was last evaluated, or
    /// the buffer has never been evaluated. Fixed terms are assembled exactly once per buffer
    /// lifetime.
    pub fn calc_terms(&self, buffer: &mut EventBuffer) -> Vec<bool> {
        log::debug!(
            "calculating terms for {} (terms_valid = {})",
            self.reaction_name,
            buffer.terms_valid
        );
        assert!(
            buffer.n_terms == self.terms.len() && !buffer.terms.is_empty(),
            "buffer term storage was not allocated for this model"
        );
        if !buffer.terms_valid && self.user_vars_per_event() > 0 {
            self.calc_user_vars(buffer);
            if self.needs_user_vars_only
                && !self.force_user_var_recalc
                && self.flush_four_vecs_if_possible
            {
                buffer.clear_four_vecs();
            }
        }
        let mut modified = vec![false; self.terms.len()];
        for (index, term) in self.terms.values().enumerate() {
            let n_perms = term.permutations.len();
            let n_factors = term.factors.len();
            assert!(
                n_factors * n_perms > 0,
                "term {} has no factors or permutations",
                term.name
            );
            // a fixed term never changes after its first assembly
            if buffer.terms_valid && term.fixed {
                continue;
            }
            let recalculate = term.factors.iter().any(|instance| {
                !(buffer.terms_valid
                    && self.optimize_par_iteration
                    && buffer.last_iteration.get(&instance.id()).copied()
                        == Some(self.iteration_of(instance.id())))
            });
            if !recalculate {
                continue;
            }
            log::debug!("factors changed for term {} -- recalculating", term.name);
            modified[index] = true;
            let slab = 2 * buffer.n_padded * n_perms;
            for (factor_index, instance) in term.factors.iter().enumerate() {
                let factor = instance.factor();
                let user_vars: &[f64] = if factor.num_user_vars() > 0 {
                    let offset = *buffer
                        .user_var_offsets
                        .get(&user_var_key(factor))
                        .expect("user variables were not computed for this buffer");
                    let length = factor.num_user_vars() * buffer.n_padded * n_perms;
                    &buffer.user_vars[offset..offset + length]
                } else {
                    &[]
                };
                let kin = Kinematics {
                    p4s: &buffer.p4s,
                    n_events: buffer.n_padded,
                    n_particles: buffer.n_particles,
                };
                let out = &mut buffer.factor_scratch[factor_index * slab..(factor_index + 1) * slab];
                factor.calc_factor_all(&kin, out, &term.permutations, user_vars);
            }
            let base = 2 * buffer.n_padded * index;
            self.executor.assemble_term(
                &buffer.factor_scratch,
                &mut buffer.terms[base..base + 2 * buffer.n_padded],
                buffer.n_true,
                buffer.n_padded,
                n_factors,
                n_perms,
            );
        }
        buffer.terms_valid = true;
        // record the parameter epochs used for this pass so the next call can detect change;
        // done in a separate loop since an epoch may be shared by several terms
        for term in self.terms.values() {
            for instance in &term.factors {
                buffer
                    .last_iteration
                    .insert(instance.id(), self.iteration_of(instance.id()));
            }
        }
        modified
    }

    /// The upper-triangular table of `V_i·V_j*` products with the off-diagonal factor of two
    /// and the scaling convention applied.
    fn pair_table(&self, n_true: usize) -> Vec<Complex64> {
        let n = self.terms.len();
        assert_eq!(
            self.coherence.len(),
            n,
            "coherence matrix size does not match the term count"
        );
        let divisor = match self.scaling {
            Scaling::Legacy => 1.0,
            Scaling::Normalized => self.norm_count.unwrap_or(n_true as f64),
        };
        let mut table = Vec::with_capacity(n * (n + 1) / 2);
        for i in 0..n {
            let v_i = self.production_factor(i);
            for j in 0..=i {
                let v_j = self.production_factor(j);
                let mut pair = v_i * v_j.conj() / divisor;
                if i != j {
                    pair *= 2.0;
                }
                table.push(pair);
            }
        }
        table
    }

    /// Compute the weighted intensity of every true event in a buffer. Returns the maximum
    /// intensity found, which accept/reject generators use.
    pub fn calc_intensities(&self, buffer: &mut EventBuffer) -> f64 {
        assert!(
            !buffer.intensities.is_empty(),
            "intensity storage has not been allocated for this buffer"
        );
        self.calc_terms(buffer);
        let pair_table = self.pair_table(buffer.n_true);
        self.executor.calc_intensities(
            &buffer.terms,
            &buffer.weights,
            &mut buffer.intensities,
            &pair_table,
            &self.coherence,
            buffer.n_true,
            buffer.n_padded,
        )
    }

    /// Compute `Σ_e w(e)·ln(I(e)/w(e))` over a buffer's true events.
    pub fn calc_sum_log_intensity(&self, buffer: &mut EventBuffer) -> f64 {
        self.calc_intensities(buffer);
        self.executor
            .sum_log_intensity(&buffer.intensities, &buffer.weights, buffer.n_true)
    }

    /// Compute the normalization-integral matrix over an acceptance buffer, normalized by the
    /// generated event count.
    ///
    /// Non-coherent pairs are explicitly zeroed; an element is recomputed only when one of its
    /// terms was reassembled or the matrix was never valid, and its Hermitian conjugate is
    /// written simultaneously.
    pub fn calc_integrals(&self, buffer: &mut EventBuffer, n_gen: usize) {
        assert!(n_gen > 0, "the generated event count must be nonzero");
        let modified = self.calc_terms(buffer);
        if !modified.iter().any(|&m| m) && buffer.integrals_valid {
            return;
        }
        let n = self.terms.len();
        assert_eq!(
            self.coherence.len(),
            n,
            "coherence matrix size does not match the term count"
        );
        let integrals = buffer
            .integrals
            .as_mut()
            .expect("integral storage has not been allocated for this buffer");
        assert_eq!(integrals.n_terms(), n);
        for i in 0..n {
            for j in 0..=i {
                if !self.coherence.is_coherent(i, j) {
                    integrals.zero_pair(i, j);
                    continue;
                }
                if buffer.integrals_valid && !modified[i] && !modified[j] {
                    continue;
                }
                log::debug!("recomputing normalization integral ({i}, {j})");
                let value = self.executor.integral_pair(
                    &buffer.terms,
                    &buffer.weights,
                    i,
                    j,
                    buffer.n_true,
                    buffer.n_padded,
                ) / n_gen as f64;
                integrals.set_pair(i, j, value);
            }
        }
        buffer.integrals_valid = true;
    }

    /// Evaluate the intensity of a single kinematic record through a synthesized one-event
    /// buffer. Diagnostics only; this path rebuilds the buffer on every call and therefore
    /// bypasses the change-detection cache.
    pub fn calc_intensity(&self, event: &Event) -> f64 {
        let mut buffer = EventBuffer::single(event);
        buffer.allocate(self);
        self.calc_intensities(&mut buffer);
        buffer.intensities()[0]
    }
}

/// Transpose one user-variable region from variable-major to event-major order within each
/// permutation block, giving device back-ends stride-1 access over events.
fn transpose_user_vars(region: &mut [f64], n_vars: usize, n_events: usize, n_perms: usize) {
    let mut transposed = vec![0.0; region.len()];
    for perm in 0..n_perms {
        let block = perm * n_events * n_vars;
        for event in 0..n_events {
            for var in 0..n_vars {
                transposed[block + var * n_events + event] = region[block + event * n_vars + var];
            }
        }
    }
    region.copy_from_slice(&transposed);
}
