//! Two-level gain medium and pump configuration.
//!
//! The gain response enters the lasing equations twice: as the complex
//! unsaturated response `gamma(k)` of the below-threshold problem, and as the
//! real Lorentzian weight `G(k)` that builds the spatial-hole-burning sum of
//! the multimode problem.

use anyhow::Result;
use nalgebra::DVector;
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Gain center frequency `ka` and linewidth `gt` of the two-level medium.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GainMedium {
    pub ka: f64,
    pub gt: f64,
}

impl GainMedium {
    pub fn new(ka: f64, gt: f64) -> Self {
        debug_assert!(gt > 0.0, "gain linewidth must be positive");
        Self { ka, gt }
    }

    /// Unsaturated gain response `gamma(k) = gt / (k - ka + i*gt)`.
    pub fn gamma(&self, k: Complex<f64>) -> Complex<f64> {
        self.gt / (k - self.ka + Complex::new(0.0, self.gt))
    }

    /// `d gamma / dk = -gt / (k - ka + i*gt)^2`.
    pub fn dgamma_dk(&self, k: Complex<f64>) -> Complex<f64> {
        let denom = k - self.ka + Complex::new(0.0, self.gt);
        -self.gt / (denom * denom)
    }

    /// Saturation weight `G(k) = gt^2 / ((k - ka)^2 + gt^2)` for real `k`.
    ///
    /// Coincides with `|gamma(k)|^2` on the real axis.
    pub fn lorentzian(&self, k: f64) -> f64 {
        let d = k - self.ka;
        self.gt * self.gt / (d * d + self.gt * self.gt)
    }

    /// `dG/dk = -2 (k - ka) / ((k - ka)^2 + gt^2) * G(k)`.
    pub fn dlorentzian_dk(&self, k: f64) -> f64 {
        let d = k - self.ka;
        -2.0 * d / (d * d + self.gt * self.gt) * self.lorentzian(k)
    }

    /// Scaled detuning `(k - ka) / gt`, the real part of `gamma / G`.
    pub fn detuning(&self, k: f64) -> f64 {
        (k - self.ka) / self.gt
    }
}

/// Pump strength with an optional spatial profile, passed immutably into
/// every assembly call so that no hidden pump state survives between
/// continuation steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pump {
    pub d0: f64,
    /// Nodal pump profile; `None` means spatially uniform.
    pub profile: Option<Vec<f64>>,
}

impl Pump {
    pub fn uniform(d0: f64) -> Self {
        Self { d0, profile: None }
    }

    pub fn profiled(d0: f64, profile: Vec<f64>) -> Self {
        Self {
            d0,
            profile: Some(profile),
        }
    }

    /// Write the nodal pump values `d0 * profile(x)` into `out`.
    pub fn nodal_into(&self, out: &mut DVector<f64>) -> Result<()> {
        if let Some(profile) = &self.profile {
            if profile.len() != out.len() {
                return Err(ConfigError::DimensionMismatch {
                    what: "pump profile",
                    expected: out.len(),
                    actual: profile.len(),
                }
                .into());
            }
            for (o, &p) in out.iter_mut().zip(profile.iter()) {
                *o = self.d0 * p;
            }
        } else {
            out.fill(self.d0);
        }
        Ok(())
    }
}
