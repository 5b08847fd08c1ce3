use modak_core::data::{Event, EventBuffer};
use modak_core::integrals::NormIntegrals;
use modak_core::manager::AmplitudeManager;
use serde::{Deserialize, Serialize};

/// The per-partition scalar sums reduced by the distributed protocol.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LikelihoodParts {
    /// The data term `Σ_e w(e)·ln(I(e)/w(e))`, with any background contribution subtracted.
    pub ln_l: f64,
    /// The summed weights of the background sample.
    pub sum_bkg_weights: f64,
    /// The number of background events.
    pub n_bkg: f64,
    /// The number of data events.
    pub n_data: f64,
}

impl LikelihoodParts {
    /// Sum partial results from disjoint partitions.
    pub fn reduce<I: IntoIterator<Item = LikelihoodParts>>(parts: I) -> Self {
        parts
            .into_iter()
            .fold(Self::default(), |acc, part| LikelihoodParts {
                ln_l: acc.ln_l + part.ln_l,
                sum_bkg_weights: acc.sum_bkg_weights + part.sum_bkg_weights,
                n_bkg: acc.n_bkg + part.n_bkg,
                n_data: acc.n_data + part.n_data,
            })
    }

    /// Pack into the wire order used by the reduction protocol.
    pub fn to_array(self) -> [f64; 4] {
        [self.ln_l, self.sum_bkg_weights, self.n_bkg, self.n_data]
    }

    /// Unpack from the wire order used by the reduction protocol.
    pub fn from_slice(values: &[f64]) -> Self {
        Self {
            ln_l: values[0],
            sum_bkg_weights: values[1],
            n_bkg: values[2],
            n_data: values[3],
        }
    }
}

/// The normalization term `Σ_{i,j} Re(V_i·V_j*·NI[i][j])` over coherent pairs.
///
/// The integrals argument allows the caller to substitute a reduced matrix collected from
/// partitioned acceptance samples.
pub fn norm_int_term(manager: &AmplitudeManager, integrals: &NormIntegrals) -> f64 {
    let n = manager.n_terms();
    assert_eq!(
        integrals.n_terms(),
        n,
        "integral matrix size does not match the term count"
    );
    let mut total = 0.0;
    for i in 0..n {
        let v_i = manager.production_factor(i);
        for j in 0..n {
            if !manager.coherence().is_coherent(i, j) {
                continue;
            }
            total += (v_i * manager.production_factor(j).conj() * integrals.get(i, j)).re;
        }
    }
    total
}

/// An extended, unbinned negative log-likelihood evaluator.
///
/// Owns the model and the per-dataset buffers (data, optional background, acceptance MC) and
/// combines the manager's pipeline into
/// `−2·lnL = −2·(Σ_e w(e)·ln(I(e)/w(e)) − Σ_{i,j} Re(V_i·V_j*·NI[i][j]))`.
/// Normalization integrals are recomputed only while some factor carries a free parameter (or
/// on the first evaluation); a model whose parameters enter solely through the production
/// factors integrates once per fit.
pub struct LikelihoodCalculator {
    manager: AmplitudeManager,
    data: EventBuffer,
    background: Option<EventBuffer>,
    accmc: EventBuffer,
    n_gen: usize,
    first_pass: bool,
}

impl LikelihoodCalculator {
    /// Load the data and acceptance-MC samples against the given model. `n_gen` is the
    /// generated event count used to normalize the integrals (at least the accepted count).
    pub fn new(
        manager: AmplitudeManager,
        data: &[Event],
        accmc: &[Event],
        n_gen: usize,
    ) -> Self {
        let data = manager.load_events(data);
        let accmc = manager.load_events(accmc);
        Self {
            manager,
            data,
            background: None,
            accmc,
            n_gen,
            first_pass: true,
        }
    }

    /// Attach a background sample whose weighted log-intensity sum is subtracted from the
    /// data term.
    pub fn with_background(mut self, background: &[Event]) -> Self {
        self.background = Some(self.manager.load_events(background));
        self
    }

    pub fn manager(&self) -> &AmplitudeManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut AmplitudeManager {
        &mut self.manager
    }

    pub fn data(&self) -> &EventBuffer {
        &self.data
    }

    /// Evaluate the data term and the bookkeeping counters for this partition.
    pub fn data_term(&mut self) -> LikelihoodParts {
        let mut ln_l = self.manager.calc_sum_log_intensity(&mut self.data);
        let (sum_bkg_weights, n_bkg) = match &mut self.background {
            Some(background) => {
                ln_l -= self.manager.calc_sum_log_intensity(background);
                (background.weighted_len(), background.n_true() as f64)
            }
            None => (0.0, 0.0),
        };
        LikelihoodParts {
            ln_l,
            sum_bkg_weights,
            n_bkg,
            n_data: self.data.n_true() as f64,
        }
    }

    /// The unnormalized integral sums of this partition's acceptance sample, for reduction by
    /// a coordinator which divides by the total generated count. Exclusive with
    /// [`evaluate`](Self::evaluate), which normalizes locally.
    pub fn integral_partials(&mut self) -> NormIntegrals {
        self.manager.calc_integrals(&mut self.accmc, 1);
        self.accmc.integrals().clone()
    }

    /// The normalization term, recomputing the integrals if any factor has a free parameter
    /// or this is the first evaluation.
    pub fn norm_int_term(&mut self) -> f64 {
        if self.manager.has_free_parameters() || self.first_pass {
            self.manager.calc_integrals(&mut self.accmc, self.n_gen);
        }
        self.first_pass = false;
        norm_int_term(&self.manager, self.accmc.integrals())
    }

    /// Evaluate `−2·lnL` over the owned samples.
    pub fn evaluate(&mut self) -> f64 {
        let parts = self.data_term();
        let norm = self.norm_int_term();
        -2.0 * (parts.ln_l - norm)
    }
}
