//! Mode descriptors and the flat unknown-vector layout of the coupled
//! multimode Newton system.
//!
//! For `N` active modes on `n` degrees of freedom the unknown vector is
//! `[v_1, w_1, ..., v_N, w_N, k_1, s_1, ..., k_N, s_N]` where `v_i`/`w_i`
//! are the real/imaginary parts of mode `i`'s field. The matching residual
//! rows are the `2Nn` field equations followed, per mode, by the real and
//! imaginary parts of the normalization constraint `e^T b_i - 1`.

use anyhow::Result;
use nalgebra::DVector;
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// One lasing (or candidate) mode: real wavenumber `k`, real positive
/// amplitude scale `s`, and the gauge-normalized complex field split into
/// real part `v` and imaginary part `w`.
#[derive(Debug, Clone)]
pub struct Mode {
    pub k: f64,
    pub s: f64,
    pub v: DVector<f64>,
    pub w: DVector<f64>,
}

impl Mode {
    pub fn new(k: f64, s: f64, v: DVector<f64>, w: DVector<f64>) -> Self {
        debug_assert_eq!(v.len(), w.len());
        Self { k, s, v, w }
    }

    /// Build a mode guess from a complex eigenfield, re-normalizing the
    /// field so that `field[norm_dof] = 1` (the gauge the Newton system
    /// pins through its constraint rows).
    pub fn from_eigenfield(
        k: f64,
        s: f64,
        field: &DVector<Complex<f64>>,
        norm_dof: usize,
    ) -> Result<Self> {
        let pin = field[norm_dof];
        if pin.norm() == 0.0 {
            anyhow::bail!("eigenfield vanishes at the normalization DOF; cannot fix the gauge");
        }
        let scaled = field / pin;
        let n = field.len();
        let mut v = DVector::zeros(n);
        let mut w = DVector::zeros(n);
        for i in 0..n {
            v[i] = scaled[i].re;
            w[i] = scaled[i].im;
        }
        Ok(Self { k, s, v, w })
    }

    pub fn ndofs(&self) -> usize {
        self.v.len()
    }

    /// Nodal intensity `|b|^2 = v^2 + w^2`.
    pub fn intensity(&self) -> DVector<f64> {
        let mut out = DVector::zeros(self.v.len());
        for i in 0..self.v.len() {
            out[i] = self.v[i] * self.v[i] + self.w[i] * self.w[i];
        }
        out
    }

    /// The physical field `s * (v + i w)`, with the amplitude scale folded
    /// back in. This is the array intensity evaluations should use.
    pub fn scaled_field(&self) -> DVector<Complex<f64>> {
        DVector::from_fn(self.v.len(), |i, _| {
            Complex::new(self.s * self.v[i], self.s * self.w[i])
        })
    }
}

/// Per-iteration Newton diagnostics, retained for every refinement run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub correction_norm: f64,
    pub residual_norm: f64,
    pub ks: Vec<f64>,
    pub ss: Vec<f64>,
}

/// Outcome of refining one mode within an active set. Non-convergence is
/// reported here, never raised as an error.
#[derive(Debug, Clone)]
pub struct ModeResult {
    pub mode: Mode,
    pub converged: bool,
    pub history: Vec<IterationRecord>,
}

impl ModeResult {
    pub fn scaled_field(&self) -> DVector<Complex<f64>> {
        self.mode.scaled_field()
    }
}

/// Index bookkeeping for the flat unknown vector of `nmodes` coupled modes.
///
/// The field blocks occupy the first `2 * nmodes * n` entries; the scalar
/// unknowns `k_i`, `s_i` (columns) and the two normalization rows per mode
/// share the trailing `2 * nmodes` indices, keeping the system square.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownLayout {
    pub n: usize,
    pub nmodes: usize,
}

impl UnknownLayout {
    pub fn new(n: usize, nmodes: usize) -> Self {
        Self { n, nmodes }
    }

    pub fn total(&self) -> usize {
        2 * self.n * self.nmodes + 2 * self.nmodes
    }

    pub fn field_len(&self) -> usize {
        2 * self.n * self.nmodes
    }

    pub fn v_offset(&self, mode: usize) -> usize {
        2 * mode * self.n
    }

    pub fn w_offset(&self, mode: usize) -> usize {
        2 * mode * self.n + self.n
    }

    /// Column of the wavenumber unknown `k_i`; also the row of the real
    /// normalization constraint of mode `i`.
    pub fn k_index(&self, mode: usize) -> usize {
        self.field_len() + 2 * mode
    }

    /// Column of the scale unknown `s_i`; also the row of the imaginary
    /// normalization constraint of mode `i`.
    pub fn s_index(&self, mode: usize) -> usize {
        self.field_len() + 2 * mode + 1
    }

    /// Pack mode descriptors into the flat unknown vector.
    pub fn pack(&self, modes: &[Mode], x: &mut DVector<f64>) -> Result<()> {
        self.check(modes, x.len())?;
        for (m, mode) in modes.iter().enumerate() {
            x.rows_mut(self.v_offset(m), self.n).copy_from(&mode.v);
            x.rows_mut(self.w_offset(m), self.n).copy_from(&mode.w);
            x[self.k_index(m)] = mode.k;
            x[self.s_index(m)] = mode.s;
        }
        Ok(())
    }

    /// Unpack the flat unknown vector back into the mode descriptors.
    pub fn unpack(&self, x: &DVector<f64>, modes: &mut [Mode]) -> Result<()> {
        self.check(modes, x.len())?;
        for (m, mode) in modes.iter_mut().enumerate() {
            mode.v.copy_from(&x.rows(self.v_offset(m), self.n));
            mode.w.copy_from(&x.rows(self.w_offset(m), self.n));
            mode.k = x[self.k_index(m)];
            mode.s = x[self.s_index(m)];
        }
        Ok(())
    }

    /// Apply a Newton correction to the mode descriptors in place.
    pub fn apply_correction(&self, delta: &DVector<f64>, modes: &mut [Mode]) -> Result<()> {
        self.check(modes, delta.len())?;
        for (m, mode) in modes.iter_mut().enumerate() {
            mode.v += delta.rows(self.v_offset(m), self.n);
            mode.w += delta.rows(self.w_offset(m), self.n);
            mode.k += delta[self.k_index(m)];
            mode.s += delta[self.s_index(m)];
        }
        Ok(())
    }

    fn check(&self, modes: &[Mode], len: usize) -> Result<()> {
        if modes.len() != self.nmodes {
            return Err(ConfigError::DimensionMismatch {
                what: "active mode count",
                expected: self.nmodes,
                actual: modes.len(),
            }
            .into());
        }
        if len != self.total() {
            return Err(ConfigError::DimensionMismatch {
                what: "unknown vector",
                expected: self.total(),
                actual: len,
            }
            .into());
        }
        for mode in modes {
            if mode.ndofs() != self.n {
                return Err(ConfigError::DimensionMismatch {
                    what: "mode field",
                    expected: self.n,
                    actual: mode.ndofs(),
                }
                .into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_mode(n: usize, seed: f64) -> Mode {
        let v = DVector::from_fn(n, |i, _| (seed + i as f64).sin());
        let w = DVector::from_fn(n, |i, _| (seed * 0.5 + i as f64).cos());
        Mode::new(10.0 + seed, 0.1 * seed + 0.2, v, w)
    }

    #[test]
    fn pack_unpack_round_trip() {
        let layout = UnknownLayout::new(7, 3);
        let modes = vec![sample_mode(7, 1.0), sample_mode(7, 2.0), sample_mode(7, 3.0)];
        let mut x = DVector::zeros(layout.total());
        layout.pack(&modes, &mut x).unwrap();

        let mut recovered = modes.clone();
        for mode in &mut recovered {
            mode.v.fill(0.0);
            mode.w.fill(0.0);
            mode.k = 0.0;
            mode.s = 0.0;
        }
        layout.unpack(&x, &mut recovered).unwrap();
        for (a, b) in modes.iter().zip(recovered.iter()) {
            assert_eq!(a.k, b.k);
            assert_eq!(a.s, b.s);
            assert_eq!(a.v, b.v);
            assert_eq!(a.w, b.w);
        }
    }

    #[test]
    fn block_offsets_follow_mode_index() {
        let layout = UnknownLayout::new(5, 2);
        assert_eq!(layout.v_offset(0), 0);
        assert_eq!(layout.w_offset(0), 5);
        assert_eq!(layout.v_offset(1), 10);
        assert_eq!(layout.w_offset(1), 15);
        assert_eq!(layout.k_index(0), 20);
        assert_eq!(layout.s_index(0), 21);
        assert_eq!(layout.k_index(1), 22);
        assert_eq!(layout.s_index(1), 23);
        assert_eq!(layout.total(), 24);
    }

    #[test]
    fn dimension_mismatch_is_fatal() {
        let layout = UnknownLayout::new(5, 2);
        let modes = vec![sample_mode(5, 1.0)];
        let mut x = DVector::zeros(layout.total());
        assert!(layout.pack(&modes, &mut x).is_err());

        let modes = vec![sample_mode(5, 1.0), sample_mode(4, 2.0)];
        assert!(layout.pack(&modes, &mut x).is_err());
    }

    #[test]
    fn scaled_field_folds_in_the_amplitude() {
        let mode = sample_mode(4, 1.0);
        let field = mode.scaled_field();
        let intensity = mode.intensity();
        for i in 0..4 {
            assert!((field[i].re - mode.s * mode.v[i]).abs() < 1e-15);
            assert!((field[i].im - mode.s * mode.w[i]).abs() < 1e-15);
            assert!((field[i].norm_sqr() - mode.s * mode.s * intensity[i]).abs() < 1e-14);
        }
    }

    #[test]
    fn eigenfield_gauge_is_pinned() {
        let field = DVector::from_fn(4, |i, _| Complex::new(1.0 + i as f64, 0.5 * i as f64));
        let mode = Mode::from_eigenfield(9.5, 0.1, &field, 2).unwrap();
        assert!((mode.v[2] - 1.0).abs() < 1e-14);
        assert!(mode.w[2].abs() < 1e-14);
    }
}
