//! Unit newtypes for power-system quantities.
//!
//! Raw `f64` values make it easy to hand a solver megavars where it expects
//! megawatts, or degrees where it expects radians. These wrappers are
//! `#[repr(transparent)]`, so they cost nothing at runtime while catching
//! unit mix-ups at compile time.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Div, Mul, Neg, Sub};

macro_rules! impl_unit_ops {
    ($type:ty, $unit_name:literal) => {
        impl Add for $type {
            type Output = Self;
            fn add(self, rhs: Self) -> Self::Output {
                Self(self.0 + rhs.0)
            }
        }

        impl Sub for $type {
            type Output = Self;
            fn sub(self, rhs: Self) -> Self::Output {
                Self(self.0 - rhs.0)
            }
        }

        impl Neg for $type {
            type Output = Self;
            fn neg(self) -> Self::Output {
                Self(-self.0)
            }
        }

        impl Mul<f64> for $type {
            type Output = Self;
            fn mul(self, rhs: f64) -> Self::Output {
                Self(self.0 * rhs)
            }
        }

        impl Div<f64> for $type {
            type Output = Self;
            fn div(self, rhs: f64) -> Self::Output {
                Self(self.0 / rhs)
            }
        }

        impl Div<$type> for $type {
            type Output = f64;
            fn div(self, rhs: $type) -> Self::Output {
                self.0 / rhs.0
            }
        }

        impl std::fmt::Display for $type {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{:.4} {}", self.0, $unit_name)
            }
        }

        impl $type {
            /// Create a new value
            #[inline]
            pub const fn new(value: f64) -> Self {
                Self(value)
            }

            /// Get the raw numeric value
            #[inline]
            pub const fn value(self) -> f64 {
                self.0
            }

            /// Absolute value
            #[inline]
            pub fn abs(self) -> Self {
                Self(self.0.abs())
            }
        }
    };
}

/// Active power in megawatts.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Megawatts(pub f64);
impl_unit_ops!(Megawatts, "MW");

/// Reactive power in megavars.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Megavars(pub f64);
impl_unit_ops!(Megavars, "Mvar");

/// Apparent power in megavolt-amperes.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct MegavoltAmperes(pub f64);
impl_unit_ops!(MegavoltAmperes, "MVA");

/// Voltage level in kilovolts.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Kilovolts(pub f64);
impl_unit_ops!(Kilovolts, "kV");

/// Dimensionless per-unit quantity (voltage magnitude, susceptance, ...).
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct PerUnit(pub f64);
impl_unit_ops!(PerUnit, "p.u.");

/// Angle in radians.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Radians(pub f64);
impl_unit_ops!(Radians, "rad");

/// Angle in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Degrees(pub f64);
impl_unit_ops!(Degrees, "deg");

impl Radians {
    /// Convert to degrees.
    pub fn to_degrees(self) -> Degrees {
        Degrees(self.0.to_degrees())
    }
}

impl Degrees {
    /// Convert to radians.
    pub fn to_radians(self) -> Radians {
        Radians(self.0.to_radians())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic() {
        let p = Megawatts(100.0) + Megawatts(20.0);
        assert_eq!(p.value(), 120.0);
        assert_eq!((p * 0.5).value(), 60.0);
        assert_eq!((-p).value(), -120.0);
        assert_eq!(Megawatts(50.0) / Megawatts(100.0), 0.5);
    }

    #[test]
    fn test_angle_conversion() {
        let deg = Degrees(180.0);
        assert!((deg.to_radians().value() - std::f64::consts::PI).abs() < 1e-12);
        let rad = Radians(std::f64::consts::FRAC_PI_2);
        assert!((rad.to_degrees().value() - 90.0).abs() < 1e-12);
    }

    #[test]
    fn test_serde_transparent() {
        let v: PerUnit = serde_json::from_str("1.05").unwrap();
        assert_eq!(v.value(), 1.05);
        assert_eq!(serde_json::to_string(&Megawatts(2.5)).unwrap(), "2.5");
    }
}
