//! Newton refinement of a coupled active mode set.
//!
//! Each iteration assembles the multimode residual and Jacobian, solves for
//! the correction, and applies it to every mode's field, wavenumber, and
//! amplitude at once. Convergence is judged on the correction norm, the same
//! criterion the below-threshold refinement uses.

use anyhow::{Context, Result};
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;
use serde::{Deserialize, Serialize};

use crate::gain::Pump;
use crate::modes::{IterationRecord, Mode, UnknownLayout};
use crate::multimode::MultimodeProblem;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NewtonSettings {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            tolerance: 1e-10,
        }
    }
}

/// Correction-equation solver seam. The reference implementation is a dense
/// LU factorization; larger discretizations can plug in a sparse solver
/// without touching the Newton loop.
pub trait LinearSolver {
    fn solve(&mut self, jac: &CsrMatrix<f64>, rhs: &DVector<f64>) -> Result<DVector<f64>>;
}

#[derive(Debug, Default)]
pub struct DenseLu;

impl LinearSolver for DenseLu {
    fn solve(&mut self, jac: &CsrMatrix<f64>, rhs: &DVector<f64>) -> Result<DVector<f64>> {
        let mut dense = DMatrix::zeros(jac.nrows(), jac.ncols());
        for (i, j, &v) in jac.triplet_iter() {
            dense[(i, j)] = v;
        }
        dense
            .lu()
            .solve(rhs)
            .context("Newton correction solve failed: singular Jacobian")
    }
}

/// Joint convergence report of one multimode refinement.
#[derive(Debug, Clone)]
pub struct MultimodeOutcome {
    pub converged: bool,
    pub iterations: usize,
    pub correction_norm: f64,
    pub residual_norm: f64,
    pub history: Vec<IterationRecord>,
}

/// Newton-refine the active set in place. Non-convergence within the
/// iteration budget is reported through the outcome, never as an error.
pub fn refine_modes(
    problem: &mut MultimodeProblem,
    pump: &Pump,
    modes: &mut [Mode],
    solver: &mut dyn LinearSolver,
    settings: &NewtonSettings,
) -> Result<MultimodeOutcome> {
    let mut history = Vec::new();
    let mut converged = false;
    let mut correction_norm = f64::NAN;
    let mut residual_norm = f64::NAN;
    let mut iterations = 0;

    while iterations < settings.max_iterations {
        let (delta, fnorm) = {
            let sys = problem.assemble(pump, modes)?;
            let rhs = -sys.residual;
            (solver.solve(sys.jacobian, &rhs)?, sys.residual.norm())
        };
        residual_norm = fnorm;

        let layout = UnknownLayout::new(modes[0].ndofs(), modes.len());
        layout.apply_correction(&delta, modes)?;
        correction_norm = delta.norm();
        iterations += 1;

        history.push(IterationRecord {
            iteration: iterations,
            correction_norm,
            residual_norm,
            ks: modes.iter().map(|m| m.k).collect(),
            ss: modes.iter().map(|m| m.s).collect(),
        });
        debug!(
            "multimode Newton it={iterations} corrnorm={correction_norm:.3e} fnorm={residual_norm:.3e}"
        );

        if correction_norm < settings.tolerance {
            converged = true;
            break;
        }
        if !correction_norm.is_finite() {
            break;
        }
    }

    if converged {
        let e = problem.cavity().normalization_dof();
        for mode in modes.iter_mut() {
            if (mode.v[e] - 1.0).abs() > 1e-8 || mode.w[e].abs() > 1e-8 {
                warn!(
                    "normalization drift after convergence: v[e]={} w[e]={}",
                    mode.v[e], mode.w[e]
                );
            }
            // The amplitude enters the equations only quadratically; fold
            // the sign away so callers see s >= 0.
            mode.s = mode.s.abs();
        }
    }

    Ok(MultimodeOutcome {
        converged,
        iterations,
        correction_norm,
        residual_norm,
        history,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cavity::CavityDiscretization;
    use crate::gain::GainMedium;
    use crate::interval::IntervalCavity;
    use crate::single_mode::SingleModeProblem;
    use num_complex::Complex;

    #[test]
    fn default_settings_are_tight() {
        let settings = NewtonSettings::default();
        assert_eq!(settings.max_iterations, 30);
        assert_eq!(settings.tolerance, 1e-10);
    }

    #[test]
    fn dense_lu_solves_a_sparse_system() {
        use nalgebra_sparse::CooMatrix;
        let mut coo = CooMatrix::new(2, 2);
        coo.push(0, 0, 2.0);
        coo.push(1, 1, 4.0);
        let jac = CsrMatrix::from(&coo);
        let rhs = DVector::from_vec(vec![2.0, 8.0]);
        let x = DenseLu.solve(&jac, &rhs).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-14);
        assert!((x[1] - 2.0).abs() < 1e-14);
    }

    #[test]
    fn first_mode_refines_just_above_threshold() {
        let _ = env_logger::builder().is_test(true).try_init();
        // 1-D slab, dielec 1.2^2, ka=10, gt=4: the first lasing mode sits
        // near k ~ 11.53 with threshold pump ~ 0.267.
        let cavity = IntervalCavity::builder(0.0, 1.0, 120)
            .dielec(1.2 * 1.2)
            .dirichlet_left()
            .outgoing_right()
            .build();
        let gain = GainMedium::new(10.0, 4.0);
        let settings = NewtonSettings::default();

        // Seed field and wavenumber from the below-threshold resonance.
        let pump = Pump::uniform(0.32);
        let single = SingleModeProblem::new(&cavity, gain);
        let n = cavity.ndofs();
        let mut b0 = DVector::from_element(n, Complex::new(1.0, 0.0));
        for &d in cavity.dirichlet_dofs() {
            b0[d] = Complex::new(0.0, 0.0);
        }
        let b0 = &b0 / b0[cavity.normalization_dof()];
        let seed = single
            .refine(&pump, None, Complex::new(11.5, 0.0), &b0, &settings)
            .unwrap();
        assert!(seed.converged && seed.k.im > 0.0);

        let mut modes = vec![Mode::from_eigenfield(
            seed.k.re,
            0.2,
            &seed.field,
            cavity.normalization_dof(),
        )
        .unwrap()];

        let mut problem = MultimodeProblem::new(&cavity, gain).unwrap();
        let outcome = refine_modes(
            &mut problem,
            &pump,
            &mut modes,
            &mut DenseLu,
            &NewtonSettings {
                max_iterations: 60,
                tolerance: 1e-10,
            },
        )
        .unwrap();

        assert!(outcome.converged, "history: {:?}", outcome.history);
        // Quadratic convergence from a resonance-quality seed.
        assert!(
            outcome.iterations <= 6,
            "took {} iterations: {:?}",
            outcome.iterations,
            outcome.history
        );
        assert!(outcome.correction_norm < 1e-10);
        let mode = &modes[0];
        assert!(mode.k > 11.2 && mode.k < 11.9, "k = {}", mode.k);
        assert!(mode.s > 0.0, "s = {}", mode.s);
        let e = cavity.normalization_dof();
        assert!((mode.v[e] - 1.0).abs() < 1e-9);
        assert!(mode.w[e].abs() < 1e-9);
    }
}
