//! Below-threshold single-mode problem.
//!
//! One mode with a complex wavenumber satisfies the linear (unsaturated)
//! lasing equation `F(b, k) = -L b + i k R b + i k N b + k^2 M b +
//! k^2 gamma(k) Q b = 0` together with the gauge constraint `e^T b = 1`.
//! Newton refinement of `(b, k)` locates cavity resonances and lasing
//! thresholds: a resonance crosses threshold when `Im k` changes sign.
//!
//! The pump form `Q` may carry a frozen saturation weight, which is how the
//! continuation driver re-examines the spectrum under the hole-burning
//! pattern of already-lasing modes.

use anyhow::{Context, Result};
use log::debug;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;
use num_complex::Complex;
use num_traits::Zero;

use crate::cavity::CavityDiscretization;
use crate::gain::{GainMedium, Pump};
use crate::newton::NewtonSettings;
use crate::ConfigError;

/// Converged (or not) below-threshold eigenpair.
#[derive(Debug, Clone)]
pub struct SingleModeResult {
    pub k: Complex<f64>,
    pub field: DVector<Complex<f64>>,
    pub converged: bool,
    pub iterations: usize,
    pub correction_norm: f64,
    pub residual_norm: f64,
}

pub struct SingleModeProblem<'a> {
    cavity: &'a dyn CavityDiscretization,
    gain: GainMedium,
}

impl<'a> SingleModeProblem<'a> {
    pub fn new(cavity: &'a dyn CavityDiscretization, gain: GainMedium) -> Self {
        Self { cavity, gain }
    }

    /// Newton-refine `(b, k)` from the given guess. `saturation`, if
    /// present, multiplies the pump weight pointwise (the SHT-corrected
    /// gain of the constant-pump algorithm).
    pub fn refine(
        &self,
        pump: &Pump,
        saturation: Option<&DVector<f64>>,
        k0: Complex<f64>,
        b0: &DVector<Complex<f64>>,
        settings: &NewtonSettings,
    ) -> Result<SingleModeResult> {
        let cavity = self.cavity;
        let n = cavity.ndofs();
        if b0.len() != n {
            return Err(ConfigError::DimensionMismatch {
                what: "initial field",
                expected: n,
                actual: b0.len(),
            }
            .into());
        }
        if let Some(sat) = saturation {
            if sat.len() != n {
                return Err(ConfigError::DimensionMismatch {
                    what: "saturation weight",
                    expected: n,
                    actual: sat.len(),
                }
                .into());
            }
        }

        // Pump weight is frozen for the whole refinement.
        let mut q_weight = DVector::zeros(n);
        pump.nodal_into(&mut q_weight)?;
        if let Some(sat) = saturation {
            q_weight.component_mul_assign(sat);
        }
        let mut q_vals = vec![0.0; cavity.mass_pattern().nnz()];
        cavity.weighted_mass_values(&q_weight, &mut q_vals);

        let e_dof = cavity.normalization_dof();
        let mut b = b0.clone();
        let mut k = k0;
        let mut jac = DMatrix::<Complex<f64>>::zeros(n + 1, n + 1);
        let mut residual_norm = f64::NAN;
        let mut correction_norm = f64::NAN;
        let mut converged = false;
        let mut iterations = 0;

        while iterations < settings.max_iterations {
            self.field_operator(k, &q_vals, &mut jac);

            // Residual from the pre-boundary-condition operator rows.
            let mut rhs = DVector::<Complex<f64>>::zeros(n + 1);
            for i in 0..n {
                let mut acc = Complex::zero();
                for j in 0..n {
                    acc += jac[(i, j)] * b[j];
                }
                rhs[i] = -acc;
            }
            residual_norm = rhs.rows(0, n).norm();
            rhs[n] = -(b[e_dof] - Complex::new(1.0, 0.0));

            self.wavenumber_column(k, &q_weight, &b, &mut jac);
            for j in 0..=n {
                jac[(n, j)] = Complex::zero();
            }
            jac[(n, e_dof)] = Complex::new(1.0, 0.0);

            for &d in cavity.dirichlet_dofs() {
                for j in 0..=n {
                    jac[(d, j)] = Complex::zero();
                }
                jac[(d, d)] = Complex::new(1.0, 0.0);
                rhs[d] = -b[d];
            }

            let delta = jac
                .clone()
                .lu()
                .solve(&rhs)
                .context("single-mode Newton correction solve failed")?;

            for i in 0..n {
                b[i] += delta[i];
            }
            k += delta[n];
            correction_norm = delta.norm();
            iterations += 1;
            debug!(
                "single-mode Newton it={iterations} k={k} corrnorm={correction_norm:.3e} fnorm={residual_norm:.3e}"
            );

            if correction_norm < settings.tolerance {
                converged = true;
                break;
            }
            if !correction_norm.is_finite() {
                break;
            }
        }

        Ok(SingleModeResult {
            k,
            field: b,
            converged,
            iterations,
            correction_norm,
            residual_norm,
        })
    }

    /// Fill `jac`'s field rows with `S(k) = -L + i k R + i k N + k^2 M +
    /// k^2 gamma(k) Q`.
    fn field_operator(&self, k: Complex<f64>, q_vals: &[f64], jac: &mut DMatrix<Complex<f64>>) {
        let cavity = self.cavity;
        jac.fill(Complex::zero());

        let k2 = k * k;
        let ik = Complex::new(0.0, 1.0) * k;
        add_real_csr(jac, cavity.stiffness_re(), Complex::new(-1.0, 0.0));
        if let Some(lim) = cavity.stiffness_im() {
            add_real_csr(jac, lim, Complex::new(0.0, -1.0));
        }
        add_real_csr(jac, cavity.mass_re(), k2);
        if let Some(mim) = cavity.mass_im() {
            add_real_csr(jac, mim, k2 * Complex::new(0.0, 1.0));
        }
        if let Some(r) = cavity.boundary() {
            add_real_csr(jac, r, ik);
        }
        if let Some(nmat) = cavity.conduction() {
            add_real_csr(jac, nmat, ik);
        }

        let gk2 = k2 * self.gain.gamma(k);
        let pattern = cavity.mass_pattern();
        let offsets = pattern.major_offsets();
        for i in 0..pattern.major_dim() {
            for (pos, &j) in pattern.lane(i).iter().enumerate() {
                jac[(i, j)] += gk2 * q_vals[offsets[i] + pos];
            }
        }
    }

    /// Fill the last column of `jac` with `dF/dk`.
    fn wavenumber_column(
        &self,
        k: Complex<f64>,
        q_weight: &DVector<f64>,
        b: &DVector<Complex<f64>>,
        jac: &mut DMatrix<Complex<f64>>,
    ) {
        let cavity = self.cavity;
        let n = cavity.ndofs();
        let mut col = DVector::<Complex<f64>>::zeros(n);

        spmv_real(&mut col, cavity.mass_re(), b, 2.0 * k);
        if let Some(mim) = cavity.mass_im() {
            spmv_real(&mut col, mim, b, 2.0 * k * Complex::new(0.0, 1.0));
        }
        if let Some(r) = cavity.boundary() {
            spmv_real(&mut col, r, b, Complex::new(0.0, 1.0));
        }
        if let Some(nmat) = cavity.conduction() {
            spmv_real(&mut col, nmat, b, Complex::new(0.0, 1.0));
        }

        // d/dk of k^2 gamma(k) Q b.
        let gain_coef = 2.0 * k * self.gain.gamma(k) + k * k * self.gain.dgamma_dk(k);
        let (vre, vim) = split_complex(b);
        let mut out_re = DVector::zeros(n);
        let mut out_im = DVector::zeros(n);
        cavity.weighted_mass_apply(q_weight, &vre, &mut out_re);
        cavity.weighted_mass_apply(q_weight, &vim, &mut out_im);
        for i in 0..n {
            col[i] += gain_coef * Complex::new(out_re[i], out_im[i]);
        }

        for i in 0..n {
            jac[(i, n)] = col[i];
        }
    }
}

fn add_real_csr(dst: &mut DMatrix<Complex<f64>>, mat: &CsrMatrix<f64>, coef: Complex<f64>) {
    for (i, j, &v) in mat.triplet_iter() {
        dst[(i, j)] += coef * v;
    }
}

fn spmv_real(
    out: &mut DVector<Complex<f64>>,
    mat: &CsrMatrix<f64>,
    b: &DVector<Complex<f64>>,
    coef: Complex<f64>,
) {
    for (i, row) in mat.row_iter().enumerate() {
        let mut acc = Complex::zero();
        for (&j, &v) in row.col_indices().iter().zip(row.values()) {
            acc += v * b[j];
        }
        out[i] += coef * acc;
    }
}

fn split_complex(b: &DVector<Complex<f64>>) -> (DVector<f64>, DVector<f64>) {
    let n = b.len();
    let mut re = DVector::zeros(n);
    let mut im = DVector::zeros(n);
    for i in 0..n {
        re[i] = b[i].re;
        im[i] = b[i].im;
    }
    (re, im)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::IntervalCavity;

    fn ones_guess(cavity: &dyn CavityDiscretization) -> DVector<Complex<f64>> {
        let n = cavity.ndofs();
        let mut b = DVector::from_element(n, Complex::new(1.0, 0.0));
        for &d in cavity.dirichlet_dofs() {
            b[d] = Complex::zero();
        }
        let pin = b[cavity.normalization_dof()];
        b / pin
    }

    #[test]
    fn closed_cavity_resonance_is_real() {
        // Lossless closed cavity without pump: resonances sit on the real
        // axis at k ~ m*pi/sqrt(dielec).
        let dielec = 4.0;
        let cavity = IntervalCavity::builder(0.0, 1.0, 64)
            .dielec(dielec)
            .dirichlet_left()
            .dirichlet_right()
            .build();
        let gain = GainMedium::new(2.0, 1.0);
        let problem = SingleModeProblem::new(&cavity, gain);
        let settings = NewtonSettings {
            max_iterations: 30,
            tolerance: 1e-11,
        };

        let k_exact = std::f64::consts::PI / dielec.sqrt();
        let result = problem
            .refine(
                &Pump::uniform(0.0),
                None,
                Complex::new(k_exact * 1.02, 0.0),
                &ones_guess(&cavity),
                &settings,
            )
            .unwrap();
        assert!(result.converged);
        assert!((result.k.re - k_exact).abs() < 0.01, "k = {}", result.k);
        assert!(result.k.im.abs() < 1e-9);
        assert!((result.field[cavity.normalization_dof()] - Complex::new(1.0, 0.0)).norm() < 1e-10);
    }

    #[test]
    fn resonance_crosses_the_real_axis_at_threshold() {
        // 1-D slab from the SALT reference systems: dielec 1.2^2, ka=10,
        // gt=4, Dirichlet wall on the left, outgoing lead on the right.
        // The first mode (k ~ 11.53) has its threshold near D0 ~ 0.267.
        let cavity = IntervalCavity::builder(0.0, 1.0, 200)
            .dielec(1.2 * 1.2)
            .dirichlet_left()
            .outgoing_right()
            .build();
        let gain = GainMedium::new(10.0, 4.0);
        let problem = SingleModeProblem::new(&cavity, gain);
        let settings = NewtonSettings {
            max_iterations: 40,
            tolerance: 1e-10,
        };

        let mut ims = Vec::new();
        for d0 in [0.2, 0.35] {
            let result = problem
                .refine(
                    &Pump::uniform(d0),
                    None,
                    Complex::new(11.5, 0.0),
                    &ones_guess(&cavity),
                    &settings,
                )
                .unwrap();
            assert!(result.converged, "D0={d0} did not converge");
            assert!(
                result.k.re > 11.2 && result.k.re < 11.9,
                "unexpected branch k={}",
                result.k
            );
            ims.push(result.k.im);
        }
        assert!(ims[0] < 0.0, "below threshold Im k = {}", ims[0]);
        assert!(ims[1] > 0.0, "above threshold Im k = {}", ims[1]);
    }
}
