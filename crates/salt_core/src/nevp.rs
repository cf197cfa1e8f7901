//! Candidate-mode search over a real wavenumber window.
//!
//! The continuation driver needs the below-threshold spectrum of the
//! (possibly saturated) cavity: every resonance whose imaginary part has
//! crossed the real axis is a mode about to lase. This module finds those
//! resonances by multi-start Newton refinement of the single-mode problem
//! from a grid of real starting wavenumbers, then deduplicates the
//! converged pairs.

use std::cmp::Ordering;

use anyhow::Result;
use log::debug;
use nalgebra::DVector;
use num_complex::Complex;

use crate::cavity::CavityDiscretization;
use crate::gain::{GainMedium, Pump};
use crate::newton::NewtonSettings;
use crate::single_mode::SingleModeProblem;
use crate::ConfigError;

/// One resonance of the linearized problem: complex wavenumber and the
/// gauge-normalized field.
#[derive(Debug, Clone)]
pub struct EigenPair {
    pub k: Complex<f64>,
    pub field: DVector<Complex<f64>>,
}

/// Spectrum-search seam. Implementations return converged eigenpairs inside
/// the window, ordered by descending `Im k` (most amplified first).
pub trait NevpSolver {
    fn solve(
        &self,
        pump: &Pump,
        saturation: Option<&DVector<f64>>,
        window: (f64, f64),
    ) -> Result<Vec<EigenPair>>;
}

/// Multi-start Newton scan across the window.
pub struct ScanningNevp<'a> {
    cavity: &'a dyn CavityDiscretization,
    problem: SingleModeProblem<'a>,
    pub nscan: usize,
    pub settings: NewtonSettings,
}

impl<'a> ScanningNevp<'a> {
    pub fn new(cavity: &'a dyn CavityDiscretization, gain: GainMedium) -> Self {
        Self {
            cavity,
            problem: SingleModeProblem::new(cavity, gain),
            nscan: 12,
            settings: NewtonSettings::default(),
        }
    }

    fn seed_field(&self) -> DVector<Complex<f64>> {
        let n = self.cavity.ndofs();
        let mut b = DVector::from_element(n, Complex::new(1.0, 0.0));
        for &d in self.cavity.dirichlet_dofs() {
            b[d] = Complex::new(0.0, 0.0);
        }
        let pin = b[self.cavity.normalization_dof()];
        b / pin
    }
}

impl NevpSolver for ScanningNevp<'_> {
    fn solve(
        &self,
        pump: &Pump,
        saturation: Option<&DVector<f64>>,
        window: (f64, f64),
    ) -> Result<Vec<EigenPair>> {
        let (kmin, kmax) = window;
        if !(kmax > kmin) {
            return Err(ConfigError::Empty("wavenumber window must be non-empty").into());
        }

        let seed = self.seed_field();
        let margin = 0.05 * (kmax - kmin);
        let mut pairs: Vec<EigenPair> = Vec::new();

        for m in 0..self.nscan {
            let frac = (m as f64 + 0.5) / self.nscan as f64;
            let k0 = Complex::new(kmin + frac * (kmax - kmin), 0.0);
            let result = match self.problem.refine(pump, saturation, k0, &seed, &self.settings) {
                Ok(r) => r,
                Err(err) => {
                    debug!("scan start k0={k0} failed: {err:#}");
                    continue;
                }
            };
            if !result.converged {
                continue;
            }
            if result.k.re < kmin - margin || result.k.re > kmax + margin {
                continue;
            }
            if pairs.iter().any(|p| (p.k - result.k).norm() < 1e-6) {
                continue;
            }
            debug!("scan found resonance k={}", result.k);
            pairs.push(EigenPair {
                k: result.k,
                field: result.field,
            });
        }

        pairs.sort_by(|a, b| b.k.im.partial_cmp(&a.k.im).unwrap_or(Ordering::Equal));
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::IntervalCavity;

    #[test]
    fn empty_window_is_rejected() {
        let cavity = IntervalCavity::builder(0.0, 1.0, 16)
            .dirichlet_left()
            .outgoing_right()
            .build();
        let nevp = ScanningNevp::new(&cavity, GainMedium::new(10.0, 4.0));
        assert!(nevp.solve(&Pump::uniform(0.1), None, (12.0, 9.0)).is_err());
    }

    #[test]
    fn scan_finds_distinct_slab_resonances() {
        let cavity = IntervalCavity::builder(0.0, 1.0, 200)
            .dielec(1.2 * 1.2)
            .dirichlet_left()
            .outgoing_right()
            .build();
        let nevp = ScanningNevp::new(&cavity, GainMedium::new(10.0, 4.0));

        // Above the first threshold (~0.267): the k ~ 11.5 resonance has
        // crossed the real axis and leads the amplification ordering.
        let pairs = nevp
            .solve(&Pump::uniform(0.35), None, (8.5, 13.0))
            .unwrap();
        assert!(pairs.len() >= 2, "found {} resonances", pairs.len());
        for (a, b) in pairs.iter().zip(pairs.iter().skip(1)) {
            assert!((a.k - b.k).norm() > 1e-3, "duplicate resonances survived");
        }

        // Ordered by descending Im k, so the lasing candidate comes first.
        assert!(pairs[0].k.im > 0.0);
        assert!(pairs[0].k.re > 11.2 && pairs[0].k.re < 11.9);
        let second = pairs
            .iter()
            .find(|p| p.k.re > 9.2 && p.k.re < 9.7)
            .expect("second slab resonance in window");
        assert!(second.k.im < pairs[0].k.im);
        for pair in pairs.iter().skip(1) {
            assert!(pair.k.im <= pairs[0].k.im);
        }
    }
}
