//! Interface to the finite-element substrate.
//!
//! The core never assembles weak forms itself; it consumes pre-assembled
//! sparse operators through [`CavityDiscretization`] and asks the substrate
//! for mass matrices weighted by arbitrary nodal coefficient fields. Every
//! gain and saturation term of the lasing equations is such a weighted mass
//! form, so this one capability covers the whole nonlinear part.

use anyhow::Result;
use nalgebra::DVector;
use nalgebra_sparse::pattern::SparsityPattern;
use nalgebra_sparse::CsrMatrix;

use crate::ConfigError;

/// Discretized electromagnetic cavity, as supplied by an external
/// finite-element layer.
///
/// Matrix conventions: the stiffness form is the positive curl-curl (1-D
/// Laplacian) operator weighted by the inverse permeability; the mass form
/// is weighted by the dielectric permittivity; `boundary` is the outgoing
/// boundary form `R` and `conduction` the cold-cavity loss form `N`. The
/// residual applies the signs (`-L`, `+i k R`, `+i k N`, `+k^2 M`) itself.
pub trait CavityDiscretization {
    fn ndofs(&self) -> usize;

    fn stiffness_re(&self) -> &CsrMatrix<f64>;
    fn stiffness_im(&self) -> Option<&CsrMatrix<f64>>;
    fn mass_re(&self) -> &CsrMatrix<f64>;
    fn mass_im(&self) -> Option<&CsrMatrix<f64>>;
    fn boundary(&self) -> Option<&CsrMatrix<f64>>;
    fn conduction(&self) -> Option<&CsrMatrix<f64>>;

    /// Sparsity pattern shared by every weighted-mass assembly.
    fn mass_pattern(&self) -> &SparsityPattern;

    /// Assemble `inner(weight * u, v)` values into `out`, aligned with
    /// [`CavityDiscretization::mass_pattern`]. `weight` is a nodal field.
    fn weighted_mass_values(&self, weight: &DVector<f64>, out: &mut [f64]);

    /// Apply the weighted mass form to `x` without materializing the matrix,
    /// accumulating nothing: `out = W(weight) * x`.
    fn weighted_mass_apply(&self, weight: &DVector<f64>, x: &DVector<f64>, out: &mut DVector<f64>);

    /// Degrees of freedom pinned to zero by Dirichlet conditions.
    fn dirichlet_dofs(&self) -> &[usize];

    /// The single DOF selected by the normalization functional `e`.
    fn normalization_dof(&self) -> usize;
}

/// Union of sparsity patterns with identical dimensions, rows kept sorted.
pub fn pattern_union(patterns: &[&SparsityPattern]) -> Result<SparsityPattern> {
    let first = patterns
        .first()
        .ok_or(ConfigError::Empty("pattern union needs at least one pattern"))?;
    let nrows = first.major_dim();
    let ncols = first.minor_dim();
    for p in patterns {
        if p.major_dim() != nrows || p.minor_dim() != ncols {
            return Err(ConfigError::DimensionMismatch {
                what: "sparsity pattern",
                expected: nrows,
                actual: p.major_dim(),
            }
            .into());
        }
    }

    let mut offsets = Vec::with_capacity(nrows + 1);
    let mut indices = Vec::new();
    offsets.push(0);
    let mut row: Vec<usize> = Vec::new();
    for i in 0..nrows {
        row.clear();
        for p in patterns {
            row.extend_from_slice(p.lane(i));
        }
        row.sort_unstable();
        row.dedup();
        indices.extend_from_slice(&row);
        offsets.push(indices.len());
    }

    SparsityPattern::try_from_offsets_and_indices(nrows, ncols, offsets, indices)
        .map_err(|e| anyhow::anyhow!("invalid union pattern: {e:?}"))
}

/// Re-express `mat`'s values on `pattern` (a superset of `mat`'s pattern),
/// zero-filling entries `mat` does not carry.
pub fn align_values(mat: &CsrMatrix<f64>, pattern: &SparsityPattern) -> Result<Vec<f64>> {
    let mut out = vec![0.0; pattern.nnz()];
    let offsets = pattern.major_offsets();
    for (i, row) in mat.row_iter().enumerate() {
        let lane = pattern.lane(i);
        for (&j, &val) in row.col_indices().iter().zip(row.values()) {
            let pos = lane
                .binary_search(&j)
                .map_err(|_| ConfigError::PatternMismatch { row: i, col: j })?;
            out[offsets[i] + pos] = val;
        }
    }
    Ok(out)
}

/// Map each entry of `sub` to its flat value index within `pattern`.
pub fn slot_map(sub: &SparsityPattern, pattern: &SparsityPattern) -> Result<Vec<usize>> {
    let mut map = Vec::with_capacity(sub.nnz());
    let offsets = pattern.major_offsets();
    for i in 0..sub.major_dim() {
        let lane = pattern.lane(i);
        for &j in sub.lane(i) {
            let pos = lane
                .binary_search(&j)
                .map_err(|_| ConfigError::PatternMismatch { row: i, col: j })?;
            map.push(offsets[i] + pos);
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra_sparse::CooMatrix;

    fn pattern_of(entries: &[(usize, usize)], dim: usize) -> SparsityPattern {
        let mut coo = CooMatrix::new(dim, dim);
        for &(i, j) in entries {
            coo.push(i, j, 1.0);
        }
        CsrMatrix::from(&coo).pattern().clone()
    }

    #[test]
    fn union_merges_and_sorts_rows() {
        let a = pattern_of(&[(0, 0), (1, 2)], 3);
        let b = pattern_of(&[(0, 2), (1, 0), (1, 2)], 3);
        let u = pattern_union(&[&a, &b]).unwrap();
        assert_eq!(u.lane(0), &[0, 2]);
        assert_eq!(u.lane(1), &[0, 2]);
        assert_eq!(u.lane(2), &[] as &[usize]);
    }

    #[test]
    fn align_values_preserves_entries() {
        let mut coo = CooMatrix::new(2, 2);
        coo.push(0, 1, 3.5);
        coo.push(1, 1, -1.0);
        let mat = CsrMatrix::from(&coo);
        let full = pattern_of(&[(0, 0), (0, 1), (1, 1)], 2);
        let vals = align_values(&mat, &full).unwrap();
        assert_eq!(vals, vec![0.0, 3.5, -1.0]);
    }

    #[test]
    fn slot_map_locates_subpattern_entries() {
        let sub = pattern_of(&[(0, 1), (1, 1)], 2);
        let full = pattern_of(&[(0, 0), (0, 1), (1, 0), (1, 1)], 2);
        assert_eq!(slot_map(&sub, &full).unwrap(), vec![1, 3]);
    }
}
