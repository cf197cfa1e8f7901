//! Coupled multimode lasing problem.
//!
//! Above threshold every active mode `i` satisfies the real-split field
//! equation `F_i = -L b_i + i k_i R b_i + i k_i N b_i + k_i^2 M b_i +
//! k_i^2 gamma(k_i) W(q) b_i = 0` with the saturated pump weight
//! `q(x) = d(x) / (1 + sht(x))` and the spatial-hole-burning sum
//! `sht(x) = sum_j G(k_j) s_j^2 |b_j(x)|^2`. The modes couple only through
//! `sht`, which is what fills the off-diagonal Jacobian blocks.
//!
//! The unknowns are real: each mode contributes its field split `(v_i, w_i)`
//! plus the real wavenumber `k_i` and amplitude scale `s_i`, closed by the
//! complex normalization constraint `e^T b_i = 1`.

use anyhow::Result;
use log::trace;
use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;
use num_complex::Complex;

use crate::assembly::{BlockAssembly, Operator};
use crate::cavity::CavityDiscretization;
use crate::gain::{GainMedium, Pump};
use crate::modes::{Mode, UnknownLayout};
use crate::ConfigError;

/// Borrowed view of one assembled Newton system.
pub struct AssembledSystem<'w> {
    pub jacobian: &'w CsrMatrix<f64>,
    pub residual: &'w DVector<f64>,
    pub layout: UnknownLayout,
}

pub struct MultimodeProblem<'a> {
    cavity: &'a dyn CavityDiscretization,
    gain: GainMedium,
    assembly: BlockAssembly<'a>,
}

impl<'a> MultimodeProblem<'a> {
    pub fn new(cavity: &'a dyn CavityDiscretization, gain: GainMedium) -> Result<Self> {
        Ok(Self {
            assembly: BlockAssembly::new(cavity)?,
            cavity,
            gain,
        })
    }

    pub fn cavity(&self) -> &'a dyn CavityDiscretization {
        self.cavity
    }

    pub fn gain(&self) -> GainMedium {
        self.gain
    }

    /// Rebuild cached structures after a boundary-condition change.
    pub fn invalidate(&mut self) -> Result<()> {
        self.assembly.invalidate()
    }

    /// Spatial-hole-burning sum `sht(x)` of the given active set.
    pub fn hole_burning(&self, modes: &[Mode]) -> DVector<f64> {
        let n = self.cavity.ndofs();
        let mut sht = DVector::zeros(n);
        for mode in modes {
            let c = self.gain.lorentzian(mode.k) * mode.s * mode.s;
            sht.axpy(c, &mode.intensity(), 1.0);
        }
        sht
    }

    /// Pointwise gain saturation factor `1 / (1 + sht(x))`, the weight a
    /// frozen active set imposes on the below-threshold spectrum.
    pub fn saturation(&self, modes: &[Mode]) -> DVector<f64> {
        self.hole_burning(modes).map(|s| 1.0 / (1.0 + s))
    }

    /// Assemble residual and Jacobian of the coupled system at the current
    /// mode iterates. Dirichlet rows are replaced by identity rows whose
    /// residual entries pin the constrained field values.
    pub fn assemble(&mut self, pump: &Pump, modes: &[Mode]) -> Result<AssembledSystem<'_>> {
        let cavity = self.cavity;
        let gain = self.gain;
        let n = cavity.ndofs();
        let nmodes = modes.len();
        if nmodes == 0 {
            return Err(ConfigError::Empty("multimode assembly needs an active mode").into());
        }
        for mode in modes {
            if mode.ndofs() != n {
                return Err(ConfigError::DimensionMismatch {
                    what: "mode field",
                    expected: n,
                    actual: mode.ndofs(),
                }
                .into());
            }
        }

        let mut pump_vals = DVector::zeros(n);
        pump.nodal_into(&mut pump_vals)?;

        // Hole burning and its pump-weight derivatives.
        let gs: Vec<f64> = modes.iter().map(|m| gain.lorentzian(m.k)).collect();
        let dgs: Vec<f64> = modes.iter().map(|m| gain.dlorentzian_dk(m.k)).collect();
        let intensities: Vec<DVector<f64>> = modes.iter().map(Mode::intensity).collect();
        let mut sht = DVector::zeros(n);
        for (j, mode) in modes.iter().enumerate() {
            sht.axpy(gs[j] * mode.s * mode.s, &intensities[j], 1.0);
        }
        let mut q = DVector::zeros(n);
        let mut dsat = DVector::zeros(n);
        for p in 0..n {
            let denom = 1.0 + sht[p];
            q[p] = pump_vals[p] / denom;
            dsat[p] = -pump_vals[p] / (denom * denom);
        }

        // dq/dk_j, dq/ds_j and the nodal column scalings dq/dv_j, dq/dw_j.
        let mut wk = Vec::with_capacity(nmodes);
        let mut wsc = Vec::with_capacity(nmodes);
        let mut cv = Vec::with_capacity(nmodes);
        let mut cw = Vec::with_capacity(nmodes);
        for (j, mode) in modes.iter().enumerate() {
            let s2 = mode.s * mode.s;
            wk.push(DVector::from_fn(n, |p, _| {
                dsat[p] * dgs[j] * s2 * intensities[j][p]
            }));
            wsc.push(DVector::from_fn(n, |p, _| {
                dsat[p] * 2.0 * mode.s * gs[j] * intensities[j][p]
            }));
            cv.push(DVector::from_fn(n, |p, _| {
                dsat[p] * 2.0 * s2 * gs[j] * mode.v[p]
            }));
            cw.push(DVector::from_fn(n, |p, _| {
                dsat[p] * 2.0 * s2 * gs[j] * mode.w[p]
            }));
        }

        let nnz = cavity.mass_pattern().nnz();
        let mut q_vals = vec![0.0; nnz];
        cavity.weighted_mass_values(&q, &mut q_vals);

        let (base, ws) = self.assembly.parts_mut(nmodes)?;
        let layout = *ws.layout();

        let mut wv_vals = vec![0.0; nnz];
        let mut ww_vals = vec![0.0; nnz];
        let mut qb_re = DVector::zeros(n);
        let mut qb_im = DVector::zeros(n);
        let mut tmp_re = DVector::zeros(n);
        let mut tmp_im = DVector::zeros(n);
        let mut col_re = DVector::zeros(n);
        let mut col_im = DVector::zeros(n);

        for (i, mode) in modes.iter().enumerate() {
            let k = mode.k;
            let k2 = k * k;
            let gamma = gain.gamma(Complex::new(k, 0.0));
            // Complex pump prefactor and its k-derivative.
            let a = k2 * gamma;
            let da = 2.0 * k * gamma + k2 * gain.dgamma_dk(Complex::new(k, 0.0));
            let row_re = 2 * i;
            let row_im = 2 * i + 1;

            // Constant operator blocks of the diagonal.
            ws.add_operator_block(base, row_re, row_re, Operator::StiffnessRe, -1.0);
            ws.add_operator_block(base, row_re, row_re, Operator::MassRe, k2);
            ws.add_operator_block(base, row_re, row_im, Operator::StiffnessIm, 1.0);
            ws.add_operator_block(base, row_re, row_im, Operator::MassIm, -k2);
            ws.add_operator_block(base, row_re, row_im, Operator::Boundary, -k);
            ws.add_operator_block(base, row_re, row_im, Operator::Conduction, -k);
            ws.add_operator_block(base, row_im, row_re, Operator::StiffnessIm, -1.0);
            ws.add_operator_block(base, row_im, row_re, Operator::MassIm, k2);
            ws.add_operator_block(base, row_im, row_re, Operator::Boundary, k);
            ws.add_operator_block(base, row_im, row_re, Operator::Conduction, k);
            ws.add_operator_block(base, row_im, row_im, Operator::StiffnessRe, -1.0);
            ws.add_operator_block(base, row_im, row_im, Operator::MassRe, k2);

            // Saturated pump block `a * W(q)` of the diagonal.
            ws.add_mass_block(base, row_re, row_re, &q_vals, None, a.re);
            ws.add_mass_block(base, row_re, row_im, &q_vals, None, -a.im);
            ws.add_mass_block(base, row_im, row_re, &q_vals, None, a.im);
            ws.add_mass_block(base, row_im, row_im, &q_vals, None, a.re);

            // Residual rows of mode i.
            cavity.weighted_mass_apply(&q, &mode.v, &mut qb_re);
            cavity.weighted_mass_apply(&q, &mode.w, &mut qb_im);
            let mut fre = DVector::zeros(n);
            let mut fim = DVector::zeros(n);
            spmv_add(&mut fre, cavity.stiffness_re(), &mode.v, -1.0);
            spmv_add(&mut fim, cavity.stiffness_re(), &mode.w, -1.0);
            if let Some(lim) = cavity.stiffness_im() {
                spmv_add(&mut fre, lim, &mode.w, 1.0);
                spmv_add(&mut fim, lim, &mode.v, -1.0);
            }
            spmv_add(&mut fre, cavity.mass_re(), &mode.v, k2);
            spmv_add(&mut fim, cavity.mass_re(), &mode.w, k2);
            if let Some(mim) = cavity.mass_im() {
                spmv_add(&mut fre, mim, &mode.w, -k2);
                spmv_add(&mut fim, mim, &mode.v, k2);
            }
            for m in [cavity.boundary(), cavity.conduction()]
                .into_iter()
                .flatten()
            {
                spmv_add(&mut fre, m, &mode.w, -k);
                spmv_add(&mut fim, m, &mode.v, k);
            }
            for p in 0..n {
                fre[p] += a.re * qb_re[p] - a.im * qb_im[p];
                fim[p] += a.im * qb_re[p] + a.re * qb_im[p];
            }
            ws.residual_mut()
                .rows_mut(layout.v_offset(i), n)
                .copy_from(&fre);
            ws.residual_mut()
                .rows_mut(layout.w_offset(i), n)
                .copy_from(&fim);

            // Direct k_i dependence of the constant operators and the pump
            // prefactor (hole-burning chain terms come in the j-loop below).
            col_re.fill(0.0);
            col_im.fill(0.0);
            for m in [cavity.boundary(), cavity.conduction()]
                .into_iter()
                .flatten()
            {
                spmv_add(&mut col_re, m, &mode.w, -1.0);
                spmv_add(&mut col_im, m, &mode.v, 1.0);
            }
            spmv_add(&mut col_re, cavity.mass_re(), &mode.v, 2.0 * k);
            spmv_add(&mut col_im, cavity.mass_re(), &mode.w, 2.0 * k);
            if let Some(mim) = cavity.mass_im() {
                spmv_add(&mut col_re, mim, &mode.w, -2.0 * k);
                spmv_add(&mut col_im, mim, &mode.v, 2.0 * k);
            }
            for p in 0..n {
                col_re[p] += da.re * qb_re[p] - da.im * qb_im[p];
                col_im[p] += da.im * qb_re[p] + da.re * qb_im[p];
            }
            ws.add_scalar_column(base, row_re, 2 * i, &col_re, 1.0);
            ws.add_scalar_column(base, row_im, 2 * i, &col_im, 1.0);

            // Hole-burning coupling to every mode j (including j = i).
            cavity.weighted_mass_values(&mode.v, &mut wv_vals);
            cavity.weighted_mass_values(&mode.w, &mut ww_vals);
            for j in 0..nmodes {
                for (colscale, bj) in [(&cv[j], 2 * j), (&cw[j], 2 * j + 1)] {
                    ws.add_mass_block(base, row_re, bj, &wv_vals, Some(colscale), a.re);
                    ws.add_mass_block(base, row_re, bj, &ww_vals, Some(colscale), -a.im);
                    ws.add_mass_block(base, row_im, bj, &wv_vals, Some(colscale), a.im);
                    ws.add_mass_block(base, row_im, bj, &ww_vals, Some(colscale), a.re);
                }
                for (weight, c) in [(&wk[j], 2 * j), (&wsc[j], 2 * j + 1)] {
                    cavity.weighted_mass_apply(weight, &mode.v, &mut tmp_re);
                    cavity.weighted_mass_apply(weight, &mode.w, &mut tmp_im);
                    for p in 0..n {
                        col_re[p] = a.re * tmp_re[p] - a.im * tmp_im[p];
                        col_im[p] = a.im * tmp_re[p] + a.re * tmp_im[p];
                    }
                    ws.add_scalar_column(base, row_re, c, &col_re, 1.0);
                    ws.add_scalar_column(base, row_im, c, &col_im, 1.0);
                }
            }
        }

        // Normalization constraint rows Re(e^T b_i - 1), Im(e^T b_i).
        let e = cavity.normalization_dof();
        for (i, mode) in modes.iter().enumerate() {
            ws.residual_mut()[layout.k_index(i)] = mode.v[e] - 1.0;
            ws.residual_mut()[layout.s_index(i)] = mode.w[e];
        }
        ws.apply_dirichlet(base, cavity, modes);

        trace!(
            "assembled multimode system: nmodes={nmodes} residual_norm={:.3e}",
            ws.residual().norm()
        );

        Ok(AssembledSystem {
            jacobian: ws.jacobian(),
            residual: ws.residual(),
            layout,
        })
    }
}

fn spmv_add(out: &mut DVector<f64>, mat: &CsrMatrix<f64>, x: &DVector<f64>, coef: f64) {
    for (i, row) in mat.row_iter().enumerate() {
        let mut acc = 0.0;
        for (&j, &v) in row.col_indices().iter().zip(row.values()) {
            acc += v * x[j];
        }
        out[i] += coef * acc;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::IntervalCavity;
    use nalgebra::DMatrix;

    fn dense(jac: &CsrMatrix<f64>) -> DMatrix<f64> {
        let mut d = DMatrix::zeros(jac.nrows(), jac.ncols());
        for (i, j, &v) in jac.triplet_iter() {
            d[(i, j)] = v;
        }
        d
    }

    fn test_cavity(nx: usize) -> IntervalCavity {
        IntervalCavity::builder(0.0, 1.0, nx)
            .dielec(1.44)
            .conduction(0.1)
            .dirichlet_left()
            .outgoing_right()
            .build()
    }

    fn sample_modes(n: usize) -> Vec<Mode> {
        let mode = |k: f64, s: f64, a: f64| {
            let v = DVector::from_fn(n, |i, _| (a * (i as f64 + 1.0)).sin() + 0.2);
            let w = DVector::from_fn(n, |i, _| 0.5 * (a * (i as f64 + 2.0)).cos());
            Mode::new(k, s, v, w)
        };
        vec![mode(10.8, 0.3, 0.6), mode(9.4, 0.2, 0.9)]
    }

    #[test]
    fn jacobian_matches_finite_differences() {
        let cavity = test_cavity(8);
        let n = cavity.ndofs();
        let gain = GainMedium::new(10.0, 4.0);
        let mut problem = MultimodeProblem::new(&cavity, gain).unwrap();
        let pump = Pump::uniform(0.7);
        let modes = sample_modes(n);
        let layout = UnknownLayout::new(n, modes.len());

        let jac = {
            let sys = problem.assemble(&pump, &modes).unwrap();
            dense(sys.jacobian)
        };

        let mut x0 = DVector::zeros(layout.total());
        layout.pack(&modes, &mut x0).unwrap();

        let eps = 1e-6;
        let total = layout.total();
        for idx in 0..total {
            let mut residual_at = |shift: f64| {
                let mut x = x0.clone();
                x[idx] += shift;
                let mut perturbed = modes.clone();
                layout.unpack(&x, &mut perturbed).unwrap();
                problem.assemble(&pump, &perturbed).unwrap().residual.clone()
            };
            let rp = residual_at(eps);
            let rm = residual_at(-eps);
            for row in 0..total {
                let fd = (rp[row] - rm[row]) / (2.0 * eps);
                let j = jac[(row, idx)];
                assert!(
                    (fd - j).abs() < 1e-5 * j.abs().max(1.0),
                    "row {row} col {idx}: analytic {j} vs fd {fd}"
                );
            }
        }
    }

    #[test]
    fn zero_amplitude_mode_decouples() {
        let cavity = test_cavity(8);
        let n = cavity.ndofs();
        let gain = GainMedium::new(10.0, 4.0);
        let mut problem = MultimodeProblem::new(&cavity, gain).unwrap();
        let pump = Pump::uniform(0.7);
        let mut modes = sample_modes(n);
        modes[1].s = 0.0;
        let layout = UnknownLayout::new(n, 2);

        let sys = problem.assemble(&pump, &modes).unwrap();
        let jac = dense(sys.jacobian);

        // With s_2 = 0 mode 2 burns no holes: mode 1's rows cannot depend
        // on mode 2's field, wavenumber, or amplitude.
        for row in 0..2 * n {
            for col in layout.v_offset(1)..layout.v_offset(1) + 2 * n {
                assert_eq!(jac[(row, col)], 0.0);
            }
            assert_eq!(jac[(row, layout.k_index(1))], 0.0);
            assert_eq!(jac[(row, layout.s_index(1))], 0.0);
        }
    }

    #[test]
    fn reassembly_reuses_the_cached_pattern() {
        let cavity = test_cavity(8);
        let gain = GainMedium::new(10.0, 4.0);
        let mut problem = MultimodeProblem::new(&cavity, gain).unwrap();
        let pump = Pump::uniform(0.5);
        let modes = sample_modes(cavity.ndofs());

        let ptr1 = {
            let sys = problem.assemble(&pump, &modes).unwrap();
            sys.jacobian.pattern().major_offsets().as_ptr()
        };
        let ptr2 = {
            let sys = problem.assemble(&pump, &modes).unwrap();
            sys.jacobian.pattern().major_offsets().as_ptr()
        };
        assert_eq!(ptr1, ptr2);
    }

    #[test]
    fn single_mode_rows_match_the_complex_residual() {
        // With one active mode the real-split rows must reproduce the
        // complex residual F = -L b + i k (R + N) b + k^2 M b
        // + k^2 gamma(k) W(q) b computed with complex arithmetic.
        let cavity = test_cavity(8);
        let n = cavity.ndofs();
        let gain = GainMedium::new(10.0, 4.0);
        let mut problem = MultimodeProblem::new(&cavity, gain).unwrap();
        let pump = Pump::uniform(0.6);
        let mode = sample_modes(n).remove(0);

        let sys = problem.assemble(&pump, std::slice::from_ref(&mode)).unwrap();
        let layout = sys.layout;
        let residual = sys.residual.clone();

        let k = mode.k;
        let b = DVector::from_fn(n, |i, _| Complex::new(mode.v[i], mode.w[i]));
        let sht = gain.lorentzian(k) * mode.s * mode.s;
        let q = DVector::from_fn(n, |i, _| {
            pump.d0 / (1.0 + sht * (mode.v[i] * mode.v[i] + mode.w[i] * mode.w[i]))
        });
        let mut qv = DVector::zeros(n);
        let mut qw = DVector::zeros(n);
        cavity.weighted_mass_apply(&q, &mode.v, &mut qv);
        cavity.weighted_mass_apply(&q, &mode.w, &mut qw);

        let spmv = |mat: &CsrMatrix<f64>| {
            DVector::from_fn(n, |i, _| {
                let row = mat.row(i);
                let mut acc = Complex::new(0.0, 0.0);
                for (&j, &v) in row.col_indices().iter().zip(row.values()) {
                    acc += v * b[j];
                }
                acc
            })
        };
        let k2 = Complex::new(k * k, 0.0);
        let ik = Complex::new(0.0, k);
        let a = k * k * gain.gamma(Complex::new(k, 0.0));
        let mut expected = -spmv(cavity.stiffness_re()) + spmv(cavity.mass_re()) * k2;
        expected += spmv(cavity.boundary().unwrap()) * ik;
        expected += spmv(cavity.conduction().unwrap()) * ik;
        for i in 0..n {
            expected[i] += a * Complex::new(qv[i], qw[i]);
        }

        for i in 0..n {
            if cavity.dirichlet_dofs().contains(&i) {
                continue;
            }
            assert!(
                (residual[layout.v_offset(0) + i] - expected[i].re).abs() < 1e-12,
                "re row {i}"
            );
            assert!(
                (residual[layout.w_offset(0) + i] - expected[i].im).abs() < 1e-12,
                "im row {i}"
            );
        }
    }

    #[test]
    fn mirrored_detunings_burn_identical_holes() {
        // G(2 ka - k) = G(k): two modes mirrored about the gain center with
        // the same field and amplitude saturate the medium identically.
        let cavity = test_cavity(8);
        let n = cavity.ndofs();
        let gain = GainMedium::new(10.0, 4.0);
        let problem = MultimodeProblem::new(&cavity, gain).unwrap();

        let mut lo = sample_modes(n).remove(0);
        let mut hi = lo.clone();
        lo.k = gain.ka - 1.7;
        hi.k = gain.ka + 1.7;

        let sht_lo = problem.hole_burning(std::slice::from_ref(&lo));
        let sht_hi = problem.hole_burning(std::slice::from_ref(&hi));
        for p in 0..n {
            assert!((sht_lo[p] - sht_hi[p]).abs() < 1e-14);
        }
    }

    #[test]
    fn hole_burning_saturates_the_pump() {
        let cavity = test_cavity(8);
        let gain = GainMedium::new(10.0, 4.0);
        let problem = MultimodeProblem::new(&cavity, gain).unwrap();
        let modes = sample_modes(cavity.ndofs());

        let sht = problem.hole_burning(&modes);
        let sat = problem.saturation(&modes);
        for p in 0..cavity.ndofs() {
            assert!(sht[p] > 0.0);
            assert!(sat[p] < 1.0 && sat[p] > 0.0);
            assert!((sat[p] * (1.0 + sht[p]) - 1.0).abs() < 1e-14);
        }
    }
}
