use std::fmt::Display;

use auto_ops::impl_op_ex;
use serde::{Deserialize, Serialize};

/// A three-momentum.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Display for Vec3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:6.3}, {:6.3}, {:6.3}]", self.x, self.y, self.z)
    }
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Vec3 { x, y, z }
    }

    pub const fn zero() -> Self {
        Vec3 {
            x: 0.0,
            y: 0.0,
            z: 0.0,
        }
    }

    /// Attach a mass to form an on-shell four-momentum.
    pub fn with_mass(&self, mass: f64) -> Vec4 {
        let e = f64::sqrt(mass.powi(2) + self.mag2());
        Vec4::new(self.x, self.y, self.z, e)
    }

    /// Attach an energy to form a four-momentum.
    pub fn with_energy(&self, energy: f64) -> Vec4 {
        Vec4::new(self.x, self.y, self.z, energy)
    }

    pub fn dot(&self, other: &Vec3) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(&self, other: &Vec3) -> Vec3 {
        Vec3::new(
            self.y * other.z - other.y * self.z,
            self.z * other.x - other.z * self.x,
            self.x * other.y - other.x * self.y,
        )
    }

    pub fn mag(&self) -> f64 {
        f64::sqrt(self.mag2())
    }

    pub fn mag2(&self) -> f64 {
        self.dot(self)
    }

    pub fn costheta(&self) -> f64 {
        self.z / self.mag()
    }

    pub fn theta(&self) -> f64 {
        f64::acos(self.costheta())
    }

    pub fn phi(&self) -> f64 {
        f64::atan2(self.y, self.x)
    }

    pub fn unit(&self) -> Vec3 {
        let mag = self.mag();
        Vec3::new(self.x / mag, self.y / mag, self.z / mag)
    }
}

impl_op_ex!(+ |a: &Vec3, b: &Vec3| -> Vec3 { Vec3::new(a.x + b.x, a.y + b.y, a.z + b.z) });
impl_op_ex!(-|a: &Vec3, b: &Vec3| -> Vec3 { Vec3::new(a.x - b.x, a.y - b.y, a.z - b.z) });
impl_op_ex!(-|a: &Vec3| -> Vec3 { Vec3::new(-a.x, -a.y, -a.z) });
impl_op_ex!(*|a: &Vec3, b: &f64| -> Vec3 { Vec3::new(a.x * b, a.y * b, a.z * b) });

impl std::iter::Sum<Vec3> for Vec3 {
    fn sum<I: Iterator<Item = Vec3>>(iter: I) -> Self {
        iter.fold(Self::zero(), |a, b| a + b)
    }
}

/// A four-momentum with components `(px, py, pz, e)`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec4 {
    pub px: f64,
    pub py: f64,
    pub pz: f64,
    pub e: f64,
}

impl Display for Vec4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[e = {:6.3}; p = ({:6.3}, {:6.3}, {:6.3}); m = {:6.3}]",
            self.e,
            self.px,
            self.py,
            self.pz,
            self.m()
        )
    }
}

impl Vec4 {
    pub fn new(px: f64, py: f64, pz: f64, e: f64) -> Self {
        Vec4 { px, py, pz, e }
    }

    pub const fn zero() -> Self {
        Vec4 {
            px: 0.0,
            py: 0.0,
            pz: 0.0,
            e: 0.0,
        }
    }

    pub fn e(&self) -> f64 {
        self.e
    }

    pub fn px(&self) -> f64 {
        self.px
    }

    pub fn py(&self) -> f64 {
        self.py
    }

    pub fn pz(&self) -> f64 {
        self.pz
    }

    /// The spatial part of the four-momentum.
    pub fn momentum(&self) -> Vec3 {
        Vec3::new(self.px, self.py, self.pz)
    }

    /// The invariant mass squared. May be negative for spacelike vectors.
    pub fn m2(&self) -> f64 {
        self.e * self.e - self.momentum().mag2()
    }

    /// The invariant mass, defined as `sign(m²)·√|m²|` so that roundoff below threshold does
    /// not produce NaN.
    pub fn m(&self) -> f64 {
        let m2 = self.m2();
        m2.signum() * f64::sqrt(m2.abs())
    }

    /// The velocity of the rest frame of this four-momentum.
    pub fn beta(&self) -> Vec3 {
        self.momentum() * (1.0 / self.e)
    }

    /// Boost this four-momentum by the given velocity.
    pub fn boost(&self, beta: &Vec3) -> Vec4 {
        let b2 = beta.mag2();
        if b2 == 0.0 {
            return *self;
        }
        let gamma = 1.0 / f64::sqrt(1.0 - b2);
        let p = self.momentum();
        let bp = beta.dot(&p);
        let coef = (gamma - 1.0) * bp / b2 + gamma * self.e;
        let boosted = p + *beta * coef;
        Vec4::new(boosted.x, boosted.y, boosted.z, gamma * (self.e + bp))
    }

    /// Pack the components in storage order.
    pub fn to_array(&self) -> [f64; 4] {
        [self.px, self.py, self.pz, self.e]
    }

    /// Unpack from storage order.
    pub fn from_slice(slice: &[f64]) -> Self {
        Vec4::new(slice[0], slice[1], slice[2], slice[3])
    }
}

impl_op_ex!(+ |a: &Vec4, b: &Vec4| -> Vec4 {
    Vec4::new(a.px + b.px, a.py + b.py, a.pz + b.pz, a.e + b.e)
});
impl_op_ex!(-|a: &Vec4, b: &Vec4| -> Vec4 {
    Vec4::new(a.px - b.px, a.py - b.py, a.pz - b.pz, a.e - b.e)
});

impl std::iter::Sum<Vec4> for Vec4 {
    fn sum<I: Iterator<Item = Vec4>>(iter: I) -> Self {
        iter.fold(Self::zero(), |a, b| a + b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_invariant_mass() {
        let p = Vec3::new(0.1, -0.2, 0.3).with_mass(0.498);
        assert_relative_eq!(p.m(), 0.498, epsilon = 1e-12);
        assert_relative_eq!(p.m2(), 0.498 * 0.498, epsilon = 1e-12);
    }

    #[test]
    fn test_pair_mass() {
        let a = Vec3::new(0.0, 0.0, 1.0).with_mass(0.139);
        let b = Vec3::new(0.0, 0.0, -1.0).with_mass(0.139);
        let pair = a + b;
        assert_relative_eq!(pair.momentum().mag(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(pair.m(), a.e + b.e, epsilon = 1e-12);
    }

    #[test]
    fn test_boost_to_rest_frame() {
        let p = Vec3::new(0.2, 0.4, 1.5).with_mass(1.007);
        let rest = p.boost(&(-p.beta()));
        assert_relative_eq!(rest.momentum().mag(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(rest.e, p.m(), epsilon = 1e-12);
    }

    #[test]
    fn test_storage_round_trip() {
        let p = Vec4::new(0.1, 0.2, 0.3, 1.4);
        assert_eq!(Vec4::from_slice(&p.to_array()), p);
    }
}
