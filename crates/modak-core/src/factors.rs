use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, OnceLock,
};

use dyn_clone::DynClone;
use num::complex::Complex64;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::data::Kinematics;
use crate::permute::Permutation;
use crate::{ModakError, ModakResult};

static FACTOR_INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_factor_id() -> u64 {
    FACTOR_INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A named scalar parameter carried by a [`Factor`].
///
/// The parameter owns a default value and may additionally be bound to an external storage
/// cell, typically one managed by a minimizer. While bound, [`value`](Self::value) reads
/// through the cell; [`reset`](Self::reset) revokes the binding and reverts to the owned
/// default. A bound parameter is a *free* parameter for the purposes of change detection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FactorParameter {
    name: String,
    default: f64,
    #[serde(skip)]
    cell: Option<Arc<RwLock<f64>>>,
}

impl FactorParameter {
    /// A named parameter with the given default value.
    pub fn named(name: &str, default: f64) -> Self {
        Self {
            name: name.to_string(),
            default,
            cell: None,
        }
    }

    /// An anonymous fixed value which no parameter name can address.
    pub fn fixed(value: f64) -> Self {
        Self {
            name: String::new(),
            default: value,
            cell: None,
        }
    }

    /// Parse a scale specification: `None` means unit scale, a numeric string is a fixed
    /// value, and anything else names a parameter with default 1.0.
    pub fn from_scale_spec(spec: Option<&str>) -> Self {
        match spec {
            None => Self::fixed(1.0),
            Some(s) => match s.parse::<f64>() {
                Ok(value) => Self::fixed(value),
                Err(_) => Self::named(s, 1.0),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `name` addresses this parameter.
    pub fn matches(&self, name: &str) -> bool {
        !self.name.is_empty() && self.name == name
    }

    /// The current value, read through the external cell if one is bound.
    pub fn value(&self) -> f64 {
        match &self.cell {
            Some(cell) => *cell.read(),
            None => self.default,
        }
    }

    /// Overwrite the owned default, revoking any external binding.
    pub fn set_value(&mut self, value: f64) {
        self.default = value;
        self.cell = None;
    }

    /// Bind to an external storage cell.
    pub fn bind(&mut self, cell: Arc<RwLock<f64>>) {
        self.cell = Some(cell);
    }

    /// Revoke the external binding, reverting to the owned default.
    pub fn reset(&mut self) {
        self.cell = None;
    }

    /// Whether the parameter is bound to an external cell (i.e. free in the fit).
    pub fn is_bound(&self) -> bool {
        self.cell.is_some()
    }

    /// The specification string this parameter reproduces from: its name if named, the owned
    /// default value otherwise. Used when a parameter appears in a factor's argument tuple.
    pub fn spec(&self) -> String {
        if self.name.is_empty() {
            self.default.to_string()
        } else {
            self.name.clone()
        }
    }
}

/// One multiplicative piece of a term.
///
/// A [`Factor`] computes one complex number per event per permutation from the four-vectors
/// and, optionally, a block of precomputed *user variables*. Implementors provide the two
/// bulk entry points and expose their [`FactorParameter`]s through
/// [`parameters`](Factor::parameters)/[`parameters_mut`](Factor::parameters_mut); parameter
/// binding, change signalling, and free-parameter detection are then handled by the provided
/// methods.
///
/// Buffer layouts seen by implementors (all sized by the padded event count `N`):
/// - user variables: `out[(perm · N + event) · num_user_vars + var]`
/// - factor values: `out[2 · (perm · N + event)]` and `+ 1` for the imaginary part
#[typetag::serde(tag = "type")]
pub trait Factor: DynClone + Send + Sync {
    /// The factor's registered name.
    fn name(&self) -> &str;

    /// The constructor arguments this instance was built with.
    fn args(&self) -> Vec<String> {
        Vec::new()
    }

    /// A key unique to the factor's behavior: the name plus the argument tuple. Two instances
    /// with equal identifiers compute identical values and may share non-static user-variable
    /// storage.
    fn identifier(&self) -> String {
        let args = self.args();
        if args.is_empty() {
            self.name().to_string()
        } else {
            format!("{} {}", self.name(), args.join(" "))
        }
    }

    /// Build a new instance of this factor from an argument list. Called on registered
    /// prototypes when a model references the factor by name.
    fn with_args(&self, args: &[String]) -> ModakResult<Box<dyn Factor>>;

    /// The number of user variables this factor wants per event per permutation. Zero skips
    /// the user-variable pass entirely.
    fn num_user_vars(&self) -> usize {
        0
    }

    /// Whether the user variables depend only on the kinematics (and not on the argument
    /// tuple). Static user variables are shared between all instances with the same name;
    /// non-static ones are shared by identifier.
    fn user_vars_static(&self) -> bool {
        false
    }

    /// Whether [`calc_factor_all`](Factor::calc_factor_all) reads only user variables. When
    /// every factor in a model reports true, the four-vector block can be dropped after the
    /// user-variable pass.
    fn needs_user_vars_only(&self) -> bool {
        false
    }

    /// The parameters carried by this factor.
    fn parameters(&self) -> Vec<&FactorParameter> {
        Vec::new()
    }

    /// Mutable access to the parameters carried by this factor.
    fn parameters_mut(&mut self) -> Vec<&mut FactorParameter> {
        Vec::new()
    }

    /// Whether any parameter is bound to external storage and may change between fit
    /// iterations.
    fn contains_free_parameters(&self) -> bool {
        self.parameters().iter().any(|p| p.is_bound())
    }

    /// Set the owned value of the named parameter, revoking any binding. Parameters this
    /// factor does not carry are ignored.
    fn set_par_value(&mut self, name: &str, value: f64) {
        for par in self.parameters_mut() {
            if par.matches(name) {
                par.set_value(value);
            }
        }
    }

    /// Bind the named parameter to an external cell. Returns true if this factor carries the
    /// parameter.
    fn set_par_ptr(&mut self, name: &str, cell: &Arc<RwLock<f64>>) -> bool {
        let mut found = false;
        for par in self.parameters_mut() {
            if par.matches(name) {
                par.bind(cell.clone());
                found = true;
            }
        }
        found
    }

    /// Whether the named parameter influences this factor. Used to advance the factor's
    /// parameter epoch when the minimizer reports a change.
    fn update_par(&self, name: &str) -> bool {
        self.parameters().iter().any(|p| p.matches(name))
    }

    /// Populate the user-variable block for every event and permutation. Called at most once
    /// per (buffer, storage key, parameter epoch); the default is a no-op for factors which
    /// report zero user variables.
    #[allow(unused_variables)]
    fn calc_user_vars(&self, kin: &Kinematics, out: &mut [f64], perms: &[Permutation]) {}

    /// Populate the interleaved `(re, im)` factor block for every event and permutation.
    fn calc_factor_all(
        &self,
        kin: &Kinematics,
        out: &mut [f64],
        perms: &[Permutation],
        user_vars: &[f64],
    );
}

dyn_clone::clone_trait_object!(Factor);

/// The storage key a factor's user-variable region is allocated under: the bare name for
/// static user variables, the full identifier otherwise.
pub fn user_var_key(factor: &dyn Factor) -> String {
    if factor.user_vars_static() {
        factor.name().to_string()
    } else {
        factor.identifier()
    }
}

/// A cloned factor bound into a term, tagged with a process-unique id.
///
/// The id keys the parameter-epoch bookkeeping: the manager tracks the current epoch per
/// instance, and each [`EventBuffer`](crate::data::EventBuffer) records the epoch at which the
/// instance's block was last computed.
#[derive(Clone)]
pub struct FactorInstance {
    pub(crate) id: u64,
    pub(crate) factor: Box<dyn Factor>,
}

impl FactorInstance {
    pub(crate) fn new(factor: Box<dyn Factor>) -> Self {
        Self {
            id: next_factor_id(),
            factor,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn factor(&self) -> &dyn Factor {
        &*self.factor
    }
}

static FACTOR_REGISTRY: OnceLock<RwLock<HashMap<String, Box<dyn Factor>>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, Box<dyn Factor>>> {
    FACTOR_REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a factor prototype under its name in the process-wide registry.
///
/// Registering a second prototype under an existing name replaces the first.
pub fn register_factor_prototype(prototype: Box<dyn Factor>) {
    let name = prototype.name().to_string();
    let mut map = registry().write();
    if map.insert(name.clone(), prototype).is_some() {
        log::warn!("replacing registered factor prototype \"{name}\"");
    }
}

/// Clone a new factor instance from the registered prototype with the given name.
pub fn factor_prototype(name: &str, args: &[String]) -> ModakResult<Box<dyn Factor>> {
    let map = registry().read();
    let prototype = map
        .get(name)
        .ok_or_else(|| ModakError::FactorNotFoundError {
            name: name.to_string(),
        })?;
    prototype.with_args(args)
}

fn unit_production() -> Complex64 {
    Complex64::ONE
}

/// One factor reference inside a [`TermDescriptor`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FactorDescriptor {
    /// The registered prototype name.
    pub name: String,
    /// The argument tuple handed to the prototype.
    #[serde(default)]
    pub args: Vec<String>,
}

/// An opaque model descriptor for one term, as produced by an external configuration layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TermDescriptor {
    /// The term's full name.
    pub full_name: String,
    /// The coherent sum this term belongs to.
    pub sum: String,
    /// An optional scale specification (a number or a parameter name).
    #[serde(default)]
    pub scale: Option<String>,
    /// The ordered factor list.
    pub factors: Vec<FactorDescriptor>,
    /// Custom permutations beyond the identical-particle set.
    #[serde(default)]
    pub permutations: Vec<Vec<usize>>,
    /// The initial production factor `V_i`.
    #[serde(default = "unit_production")]
    pub production: Complex64,
    /// Initial `(parameter name, value)` bindings.
    #[serde(default)]
    pub parameters: Vec<(String, f64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Serialize, Deserialize)]
    struct Phase {
        phi: FactorParameter,
    }

    #[typetag::serde]
    impl Factor for Phase {
        fn name(&self) -> &str {
            "Phase"
        }

        fn with_args(&self, _args: &[String]) -> ModakResult<Box<dyn Factor>> {
            Ok(Box::new(self.clone()))
        }

        fn parameters(&self) -> Vec<&FactorParameter> {
            vec![&self.phi]
        }

        fn parameters_mut(&mut self) -> Vec<&mut FactorParameter> {
            vec![&mut self.phi]
        }

        fn calc_factor_all(
            &self,
            kin: &Kinematics,
            out: &mut [f64],
            perms: &[Permutation],
            _user_vars: &[f64],
        ) {
            let value = Complex64::cis(self.phi.value());
            for perm in 0..perms.len() {
                for event in 0..kin.n_events() {
                    let base = 2 * (perm * kin.n_events() + event);
                    out[base] = value.re;
                    out[base + 1] = value.im;
                }
            }
        }
    }

    #[test]
    fn test_parameter_bind_and_reset() {
        let mut par = FactorParameter::named("phi", 0.5);
        assert!(!par.is_bound());
        assert_eq!(par.value(), 0.5);

        let cell = Arc::new(RwLock::new(1.25));
        par.bind(cell.clone());
        assert!(par.is_bound());
        assert_eq!(par.value(), 1.25);
        *cell.write() = -0.75;
        assert_eq!(par.value(), -0.75);

        par.reset();
        assert!(!par.is_bound());
        assert_eq!(par.value(), 0.5);
    }

    #[test]
    fn test_set_value_revokes_binding() {
        let mut par = FactorParameter::named("phi", 0.5);
        par.bind(Arc::new(RwLock::new(9.0)));
        par.set_value(2.0);
        assert!(!par.is_bound());
        assert_eq!(par.value(), 2.0);
    }

    #[test]
    fn test_fixed_parameter_matches_nothing() {
        let par = FactorParameter::fixed(3.0);
        assert!(!par.matches(""));
        assert!(!par.matches("anything"));
        assert_eq!(par.value(), 3.0);
    }

    #[test]
    fn test_scale_spec_parsing() {
        assert_eq!(FactorParameter::from_scale_spec(None).value(), 1.0);
        assert_eq!(FactorParameter::from_scale_spec(Some("0.25")).value(), 0.25);
        let named = FactorParameter::from_scale_spec(Some("scaleD"));
        assert_eq!(named.name(), "scaleD");
        assert_eq!(named.value(), 1.0);
    }

    #[test]
    fn test_trait_parameter_plumbing() {
        let mut factor = Phase {
            phi: FactorParameter::named("phi", 0.0),
        };
        assert!(!factor.contains_free_parameters());
        assert!(factor.update_par("phi"));
        assert!(!factor.update_par("other"));

        let cell = Arc::new(RwLock::new(0.1));
        assert!(factor.set_par_ptr("phi", &cell));
        assert!(!factor.set_par_ptr("other", &cell));
        assert!(factor.contains_free_parameters());

        factor.set_par_value("phi", 0.3);
        assert!(!factor.contains_free_parameters());
        assert_eq!(factor.parameters()[0].value(), 0.3);
    }

    #[test]
    fn test_registry_lookup() {
        register_factor_prototype(Box::new(Phase {
            phi: FactorParameter::named("phi", 0.0),
        }));
        let instance = factor_prototype("Phase", &[]).unwrap();
        assert_eq!(instance.name(), "Phase");
        assert_eq!(instance.identifier(), "Phase");
        assert!(matches!(
            factor_prototype("NoSuchFactor", &[]),
            Err(crate::ModakError::FactorNotFoundError { .. })
        ));
    }
}
