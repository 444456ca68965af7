//! Uniform gravity field.

use nalgebra::Vector3;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Gravitational acceleration applied to every body not flagged
/// [`gravity_exempt`](crate::BodyFlags::gravity_exempt).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Gravity {
    /// Acceleration in m/s², world frame.
    pub acceleration: Vector3<f64>,
}

impl Default for Gravity {
    fn default() -> Self {
        Self::earth()
    }
}

impl Gravity {
    /// 9.81 m/s² along -Z.
    #[must_use]
    pub fn earth() -> Self {
        Self::custom(Vector3::new(0.0, 0.0, -9.81))
    }

    /// No gravity.
    #[must_use]
    pub fn zero() -> Self {
        Self::custom(Vector3::zeros())
    }

    /// Arbitrary acceleration vector.
    #[must_use]
    pub fn custom(acceleration: Vector3<f64>) -> Self {
        Self { acceleration }
    }

    /// Force the field exerts on `mass`: `mass · g`.
    #[must_use]
    pub fn force_on_mass(&self, mass: f64) -> Vector3<f64> {
        self.acceleration * mass
    }

    /// Whether the stepper can skip the gravity pass.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.acceleration.iter().all(|&a| a == 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_force_scales_with_mass() {
        let force = Gravity::earth().force_on_mass(2.0);
        assert_relative_eq!(force, Vector3::new(0.0, 0.0, -19.62), epsilon = 1e-12);
    }

    #[test]
    fn test_zero_field() {
        assert!(Gravity::zero().is_zero());
        assert!(!Gravity::custom(Vector3::new(0.0, 1e-9, 0.0)).is_zero());
        assert_eq!(Gravity::default(), Gravity::earth());
    }
}
