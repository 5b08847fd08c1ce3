use modak_core::data::Kinematics;
use modak_core::factors::{Factor, FactorParameter};
use modak_core::permute::Permutation;
use modak_core::{ModakError, ModakResult};
use num::complex::Complex64;
use serde::{Deserialize, Serialize};

#[inline]
fn write_all(value: Complex64, kin: &Kinematics, out: &mut [f64], n_perms: usize) {
    for perm in 0..n_perms {
        for event in 0..kin.n_events() {
            let base = 2 * (perm * kin.n_events() + event);
            out[base] = value.re;
            out[base + 1] = value.im;
        }
    }
}

fn parse_parameter(
    factor: &str,
    args: &[String],
    index: usize,
    default: f64,
) -> ModakResult<FactorParameter> {
    match args.get(index) {
        None => Err(ModakError::FactorArgumentError {
            name: factor.to_string(),
            args: args.to_vec(),
            reason: format!("expected at least {} arguments", index + 1),
        }),
        Some(s) => match s.parse::<f64>() {
            Ok(value) => Ok(FactorParameter::fixed(value)),
            Err(_) => Ok(FactorParameter::named(s, default)),
        },
    }
}

fn parse_index(factor: &str, args: &[String], index: usize) -> ModakResult<usize> {
    args.get(index)
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| ModakError::FactorArgumentError {
            name: factor.to_string(),
            args: args.to_vec(),
            reason: format!("argument {index} must be a particle index"),
        })
}

/// The multiplicative identity: `1 + 0i` for every event and permutation.
#[derive(Clone, Copy, Default, Serialize, Deserialize)]
pub struct Unit;

#[typetag::serde]
impl Factor for Unit {
    fn name(&self) -> &str {
        "Unit"
    }

    fn with_args(&self, _args: &[String]) -> ModakResult<Box<dyn Factor>> {
        Ok(Box::new(*self))
    }

    fn needs_user_vars_only(&self) -> bool {
        true
    }

    fn calc_factor_all(
        &self,
        kin: &Kinematics,
        out: &mut [f64],
        perms: &[Permutation],
        _user_vars: &[f64],
    ) {
        write_all(Complex64::ONE, kin, out, perms.len());
    }
}

/// A real scalar coefficient carried as a single parameter.
///
/// The one argument is either a literal value or a parameter name (default 1.0).
#[derive(Clone, Serialize, Deserialize)]
pub struct Scalar {
    value: FactorParameter,
}

impl Scalar {
    pub fn new(value: FactorParameter) -> Box<Self> {
        Box::new(Self { value })
    }
}

impl Default for Scalar {
    fn default() -> Self {
        Self {
            value: FactorParameter::fixed(1.0),
        }
    }
}

#[typetag::serde]
impl Factor for Scalar {
    fn name(&self) -> &str {
        "Scalar"
    }

    fn args(&self) -> Vec<String> {
        vec![self.value.spec()]
    }

    fn with_args(&self, args: &[String]) -> ModakResult<Box<dyn Factor>> {
        Ok(Scalar::new(parse_parameter("Scalar", args, 0, 1.0)?))
    }

    fn needs_user_vars_only(&self) -> bool {
        true
    }

    fn parameters(&self) -> Vec<&FactorParameter> {
        vec![&self.value]
    }

    fn parameters_mut(&mut self) -> Vec<&mut FactorParameter> {
        vec![&mut self.value]
    }

    fn calc_factor_all(
        &self,
        kin: &Kinematics,
        out: &mut [f64],
        perms: &[Permutation],
        _user_vars: &[f64],
    ) {
        write_all(Complex64::from(self.value.value()), kin, out, perms.len());
    }
}

/// A complex coefficient carried as a real and an imaginary parameter.
///
/// The two arguments are each either a literal value or a parameter name (defaults 1.0 and
/// 0.0).
#[derive(Clone, Serialize, Deserialize)]
pub struct ComplexScalar {
    re: FactorParameter,
    im: FactorParameter,
}

impl ComplexScalar {
    pub fn new(re: FactorParameter, im: FactorParameter) -> Box<Self> {
        Box::new(Self { re, im })
    }
}

impl Default for ComplexScalar {
    fn default() -> Self {
        Self {
            re: FactorParameter::fixed(1.0),
            im: FactorParameter::fixed(0.0),
        }
    }
}

#[typetag::serde]
impl Factor for ComplexScalar {
    fn name(&self) -> &str {
        "ComplexScalar"
    }

    fn args(&self) -> Vec<String> {
        vec![self.re.spec(), self.im.spec()]
    }

    fn with_args(&self, args: &[String]) -> ModakResult<Box<dyn Factor>> {
        Ok(ComplexScalar::new(
            parse_parameter("ComplexScalar", args, 0, 1.0)?,
            parse_parameter("ComplexScalar", args, 1, 0.0)?,
        ))
    }

    fn needs_user_vars_only(&self) -> bool {
        true
    }

    fn parameters(&self) -> Vec<&FactorParameter> {
        vec![&self.re, &self.im]
    }

    fn parameters_mut(&mut self) -> Vec<&mut FactorParameter> {
        vec![&mut self.re, &mut self.im]
    }

    fn calc_factor_all(
        &self,
        kin: &Kinematics,
        out: &mut [f64],
        perms: &[Permutation],
        _user_vars: &[f64],
    ) {
        write_all(
            Complex64::new(self.re.value(), self.im.value()),
            kin,
            out,
            perms.len(),
        );
    }
}

/// The energy of one particle slot, symmetrized over the permutation list.
#[derive(Clone, Copy, Default, Serialize, Deserialize)]
pub struct ParticleEnergy {
    slot: usize,
}

impl ParticleEnergy {
    pub fn new(slot: usize) -> Box<Self> {
        Box::new(Self { slot })
    }
}

#[typetag::serde]
impl Factor for ParticleEnergy {
    fn name(&self) -> &str {
        "ParticleEnergy"
    }

    fn args(&self) -> Vec<String> {
        vec![self.slot.to_string()]
    }

    fn with_args(&self, args: &[String]) -> ModakResult<Box<dyn Factor>> {
        Ok(ParticleEnergy::new(parse_index("ParticleEnergy", args, 0)?))
    }

    fn calc_factor_all(
        &self,
        kin: &Kinematics,
        out: &mut [f64],
        perms: &[Permutation],
        _user_vars: &[f64],
    ) {
        for (p, perm) in perms.iter().enumerate() {
            let particle = perm.map(self.slot);
            for event in 0..kin.n_events() {
                let base = 2 * (p * kin.n_events() + event);
                out[base] = kin.p4(event, particle).e();
                out[base + 1] = 0.0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use modak_core::data::{test_event, TEST_PARTICLES};
    use modak_core::factors::register_factor_prototype;
    use modak_core::manager::{AmplitudeManager, Scaling};

    #[test]
    fn test_complex_scalar_arguments() {
        let prototype = ComplexScalar::default();
        let fixed = prototype
            .with_args(&["0.5".to_string(), "-0.25".to_string()])
            .unwrap();
        assert!(!fixed.contains_free_parameters());
        assert_eq!(fixed.identifier(), "ComplexScalar 0.5 -0.25");

        let named = prototype
            .with_args(&["c_re".to_string(), "c_im".to_string()])
            .unwrap();
        assert!(named.update_par("c_re"));
        assert!(named.update_par("c_im"));
        assert!(!named.update_par("c"));
    }

    #[test]
    fn test_missing_arguments_rejected() {
        assert!(ComplexScalar::default().with_args(&[]).is_err());
        assert!(ParticleEnergy::default()
            .with_args(&["not_an_index".to_string()])
            .is_err());
    }

    #[test]
    fn test_particle_energy_model() {
        register_factor_prototype(Box::new(ParticleEnergy::default()));
        let mut manager = AmplitudeManager::new("kin", TEST_PARTICLES);
        manager.set_scaling(Scaling::Legacy);
        manager
            .add_factor("S::beam_e", "ParticleEnergy", &["0".to_string()], "S", None)
            .unwrap();
        let mut event = test_event();
        event.weight = 1.0;
        // the kshort pair doubles the permutation list; slot 0 is unaffected by the swap
        let amplitude = 2.0 * event.p4s[0].e / f64::sqrt(2.0);
        assert_relative_eq!(
            manager.calc_intensity(&event),
            amplitude * amplitude,
            epsilon = 1e-10
        );
    }
}
