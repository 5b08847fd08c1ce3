use modak_core::data::Kinematics;
use modak_core::factors::{Factor, FactorParameter};
use modak_core::permute::Permutation;
use modak_core::{ModakError, ModakResult};
use num::complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// The breakup momentum of a particle with mass `m0` decaying into two particles with masses
/// `m1` and `m2`.
pub fn breakup_momentum(m0: f64, m1: f64, m2: f64) -> f64 {
    f64::sqrt(f64::abs(
        (m0 * m0 - (m1 + m2).powi(2)) * (m0 * m0 - (m1 - m2).powi(2)),
    )) / (2.0 * m0)
}

/// The Blatt-Weisskopf barrier factor for a decay with orbital angular momentum `l`, using a
/// hadron-scale interaction radius of `(197.3 MeV)⁻¹`.
pub fn blatt_weisskopf(m0: f64, m1: f64, m2: f64, l: usize) -> f64 {
    let q = breakup_momentum(m0, m1, m2);
    let z = q * q / (0.1973 * 0.1973);
    match l {
        0 => 1.0,
        1 => f64::sqrt(2.0 * z / (z + 1.0)),
        2 => f64::sqrt(13.0 * z.powi(2) / ((z - 3.0).powi(2) + 9.0 * z)),
        3 => f64::sqrt(
            277.0 * z.powi(3) / (z * (z - 15.0).powi(2) + 9.0 * (2.0 * z - 5.0).powi(2)),
        ),
        4 => f64::sqrt(
            12746.0 * z.powi(4)
                / ((z.powi(2) - 45.0 * z + 105.0).powi(2)
                    + 25.0 * z * (2.0 * z - 21.0).powi(2)),
        ),
        l => panic!("barrier factors are only implemented through l = 4 (got l = {l})"),
    }
}

/// A relativistic Breit-Wigner factor over the invariant mass of two daughter particles:
/// ```math
/// f(m; m_0, \Gamma_0) = B_{\ell}(m) \frac{\sqrt{m_0 \Gamma_0 / \pi}}{(m_0^2 - m^2) - i m_0 \Gamma(m)}
/// ```
/// with the mass-dependent width
/// ```math
/// \Gamma(m) = \Gamma_0 \frac{m_0}{m} \frac{q(m)}{q(m_0)} \left(\frac{B_{\ell}(m)}{B_{\ell}(m_0)}\right)^2
/// ```
///
/// Arguments: `mass width l daughter1 daughter2`, where `mass` and `width` are literal values
/// or parameter names (defaults 1.0 and 0.1) and the daughters are particle indices.
///
/// The daughter invariant masses are precomputed as user variables per permutation, so the
/// factor never touches the four-vectors after the user-variable pass.
#[derive(Clone, Serialize, Deserialize)]
pub struct BreitWigner {
    mass: FactorParameter,
    width: FactorParameter,
    l: usize,
    daughters: (usize, usize),
}

impl BreitWigner {
    pub fn new(
        mass: FactorParameter,
        width: FactorParameter,
        l: usize,
        daughters: (usize, usize),
    ) -> Box<Self> {
        Box::new(Self {
            mass,
            width,
            l,
            daughters,
        })
    }
}

impl Default for BreitWigner {
    fn default() -> Self {
        Self {
            mass: FactorParameter::named("mass", 1.0),
            width: FactorParameter::named("width", 0.1),
            l: 0,
            daughters: (0, 1),
        }
    }
}

// user variable slots per (event, permutation)
const UV_PAIR_MASS: usize = 0;
const UV_DAUGHTER_1: usize = 1;
const UV_DAUGHTER_2: usize = 2;
const UV_COUNT: usize = 3;

#[typetag::serde]
impl Factor for BreitWigner {
    fn name(&self) -> &str {
        "BreitWigner"
    }

    fn args(&self) -> Vec<String> {
        vec![
            self.mass.spec(),
            self.width.spec(),
            self.l.to_string(),
            self.daughters.0.to_string(),
            self.daughters.1.to_string(),
        ]
    }

    fn with_args(&self, args: &[String]) -> ModakResult<Box<dyn Factor>> {
        let argument_error = |reason: &str| ModakError::FactorArgumentError {
            name: "BreitWigner".to_string(),
            args: args.to_vec(),
            reason: reason.to_string(),
        };
        if args.len() != 5 {
            return Err(argument_error("expected: mass width l daughter1 daughter2"));
        }
        let parameter = |index: usize, default: f64| match args[index].parse::<f64>() {
            Ok(value) => FactorParameter::fixed(value),
            Err(_) => FactorParameter::named(&args[index], default),
        };
        let index = |i: usize, what: &str| {
            args[i]
                .parse::<usize>()
                .map_err(|_| argument_error(&format!("{what} must be an integer")))
        };
        Ok(BreitWigner::new(
            parameter(0, 1.0),
            parameter(1, 0.1),
            index(2, "l")?,
            (index(3, "daughter1")?, index(4, "daughter2")?),
        ))
    }

    fn num_user_vars(&self) -> usize {
        UV_COUNT
    }

    fn needs_user_vars_only(&self) -> bool {
        true
    }

    fn parameters(&self) -> Vec<&FactorParameter> {
        vec![&self.mass, &self.width]
    }

    fn parameters_mut(&mut self) -> Vec<&mut FactorParameter> {
        vec![&mut self.mass, &mut self.width]
    }

    fn calc_user_vars(&self, kin: &Kinematics, out: &mut [f64], perms: &[Permutation]) {
        for (p, perm) in perms.iter().enumerate() {
            let d1 = perm.map(self.daughters.0);
            let d2 = perm.map(self.daughters.1);
            for event in 0..kin.n_events() {
                let p4_1 = kin.p4(event, d1);
                let p4_2 = kin.p4(event, d2);
                let base = (p * kin.n_events() + event) * UV_COUNT;
                out[base + UV_PAIR_MASS] = (p4_1 + p4_2).m();
                out[base + UV_DAUGHTER_1] = p4_1.m();
                out[base + UV_DAUGHTER_2] = p4_2.m();
            }
        }
    }

    fn calc_factor_all(
        &self,
        kin: &Kinematics,
        out: &mut [f64],
        perms: &[Permutation],
        user_vars: &[f64],
    ) {
        let mass0 = self.mass.value().abs();
        let width0 = self.width.value().abs();
        let norm = f64::sqrt(mass0 * width0 / PI);
        for perm in 0..perms.len() {
            for event in 0..kin.n_events() {
                let uv = (perm * kin.n_events() + event) * UV_COUNT;
                let mass = user_vars[uv + UV_PAIR_MASS];
                let mass1 = user_vars[uv + UV_DAUGHTER_1];
                let mass2 = user_vars[uv + UV_DAUGHTER_2];
                let q0 = breakup_momentum(mass0, mass1, mass2);
                let q = breakup_momentum(mass, mass1, mass2);
                let barrier0 = blatt_weisskopf(mass0, mass1, mass2, self.l);
                let barrier = blatt_weisskopf(mass, mass1, mass2, self.l);
                let width =
                    width0 * (mass0 / mass) * (q / q0) * (barrier / barrier0).powi(2);
                let denominator =
                    Complex64::new(mass0.powi(2) - mass.powi(2), -(mass0 * width));
                let value = Complex64::from(barrier * norm) / denominator;
                let base = 2 * (perm * kin.n_events() + event);
                out[base] = value.re;
                out[base + 1] = value.im;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use modak_core::data::Event;
    use modak_core::factors::register_factor_prototype;
    use modak_core::manager::{AmplitudeManager, Scaling};
    use modak_core::utils::vectors::Vec3;
    use std::f64::consts::FRAC_PI_2;

    fn two_kaon_event() -> Event {
        Event {
            p4s: vec![
                Vec3::new(-0.112, 0.293, 3.081).with_mass(0.498),
                Vec3::new(-0.007, -0.667, 5.446).with_mass(0.498),
            ],
            weight: 1.0,
        }
    }

    fn bw_manager(mass_arg: &str) -> AmplitudeManager {
        register_factor_prototype(Box::new(BreitWigner::default()));
        let mut manager = AmplitudeManager::new("kk", &["k1", "k2"]);
        manager.set_scaling(Scaling::Legacy);
        let args: Vec<String> = [mass_arg, "0.2", "0", "0", "1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        manager
            .add_factor("S::bw", "BreitWigner", &args, "S", None)
            .unwrap();
        manager
    }

    #[test]
    fn test_on_resonance_value() {
        let event = two_kaon_event();
        let pair_mass = event.p4_sum([0, 1]).m();
        let manager = bw_manager(&pair_mass.to_string());
        let mut buffer = manager.load_events(std::slice::from_ref(&event));
        manager.calc_terms(&mut buffer);
        let amplitude = buffer.term_amplitude(0, 0);
        // on resonance with l = 0 the denominator is -i·m₀·Γ₀, so the phase is +π/2 and the
        // magnitude is 1/√(π·m₀·Γ₀)
        assert_relative_eq!(amplitude.arg(), FRAC_PI_2, epsilon = 1e-10);
        assert_relative_eq!(
            amplitude.norm(),
            1.0 / f64::sqrt(PI * pair_mass * 0.2),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_off_resonance_suppression() {
        let event = two_kaon_event();
        let pair_mass = event.p4_sum([0, 1]).m();
        let on = bw_manager(&pair_mass.to_string()).calc_intensity(&event);
        let off = bw_manager(&(pair_mass + 0.5).to_string()).calc_intensity(&event);
        assert!(off < on);
    }

    #[test]
    fn test_user_vars_shared_by_identifier() {
        register_factor_prototype(Box::new(BreitWigner::default()));
        let mut manager = AmplitudeManager::new("kk", &["k1", "k2"]);
        let args: Vec<String> = ["m0", "0.2", "0", "0", "1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        manager
            .add_factor("S::bw1", "BreitWigner", &args, "S", None)
            .unwrap();
        manager
            .add_factor("S::bw2", "BreitWigner", &args, "S", None)
            .unwrap();
        // identical identifiers share one region
        assert_eq!(manager.user_vars_per_event(), UV_COUNT);

        let mut other_args = args.clone();
        other_args[3] = "1".to_string();
        other_args[4] = "0".to_string();
        manager
            .add_factor("S::bw3", "BreitWigner", &other_args, "S", None)
            .unwrap();
        assert_eq!(manager.user_vars_per_event(), 2 * UV_COUNT);
    }

    #[test]
    fn test_four_vectors_flushed_after_user_vars() {
        let event = two_kaon_event();
        let mut manager = bw_manager("1.1");
        assert!(manager.needs_user_vars_only());
        manager.set_flush_four_vecs_if_possible(true);
        let mut buffer = manager.load_events(std::slice::from_ref(&event));
        manager.calc_terms(&mut buffer);
        assert!(!buffer.has_four_vecs());
        // subsequent evaluations run entirely from user variables
        let intensity = manager.calc_intensities(&mut buffer);
        assert!(intensity > 0.0);
    }

    #[test]
    fn test_blatt_weisskopf_limits() {
        assert_eq!(blatt_weisskopf(1.5, 0.498, 0.498, 0), 1.0);
        // barrier factors vanish at threshold for l > 0
        let at_threshold = blatt_weisskopf(0.996, 0.498, 0.498, 2);
        assert_relative_eq!(at_threshold, 0.0, epsilon = 1e-6);
        assert!(blatt_weisskopf(1.5, 0.498, 0.498, 1) > 0.0);
    }
}
