//! Block assembly engine for the coupled multimode Newton system.
//!
//! For `N` active modes the Jacobian is a `2N x 2N` grid of `n x n` field
//! blocks, bordered by `2N` scalar columns (`dF/dk_i`, `dF/ds_i`) and `2N`
//! normalization rows. Every field block shares one *base* sparsity pattern
//! (the union of all operator patterns plus the diagonal), which makes the
//! value slot of any entry a closed-form function of its block coordinates.
//! The full CSR structure is therefore built once per mode count, cached,
//! and only its values are zeroed and refilled on every Newton iteration.
//!
//! Boundary-condition changes invalidate the cache: callers bump the
//! generation token via [`BlockAssembly::invalidate`], which drops all
//! cached workspaces.

use std::collections::BTreeMap;

use anyhow::Result;
use log::debug;
use nalgebra::DVector;
use nalgebra_sparse::pattern::SparsityPattern;
use nalgebra_sparse::CsrMatrix;

use crate::cavity::{align_values, pattern_union, slot_map, CavityDiscretization};
use crate::modes::{Mode, UnknownLayout};

/// Constant operator forms aligned to the base pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    StiffnessRe,
    StiffnessIm,
    MassRe,
    MassIm,
    Boundary,
    Conduction,
}

/// Cavity operators re-expressed on the shared base pattern.
pub struct BaseOperators {
    pattern: SparsityPattern,
    row_nnz: Vec<usize>,
    diag_pos: Vec<usize>,
    stiff_re: Vec<f64>,
    stiff_im: Option<Vec<f64>>,
    mass_re: Vec<f64>,
    mass_im: Option<Vec<f64>>,
    boundary: Option<Vec<f64>>,
    conduction: Option<Vec<f64>>,
    /// Flat value index within the base pattern for each mass-pattern entry.
    mass_slots: Vec<usize>,
    mass_offsets: Vec<usize>,
    mass_cols: Vec<usize>,
}

impl BaseOperators {
    fn build(cavity: &dyn CavityDiscretization) -> Result<Self> {
        let n = cavity.ndofs();
        let identity = identity_pattern(n);
        let mut patterns = vec![
            cavity.stiffness_re().pattern(),
            cavity.mass_re().pattern(),
            cavity.mass_pattern(),
            &identity,
        ];
        if let Some(m) = cavity.stiffness_im() {
            patterns.push(m.pattern());
        }
        if let Some(m) = cavity.mass_im() {
            patterns.push(m.pattern());
        }
        if let Some(m) = cavity.boundary() {
            patterns.push(m.pattern());
        }
        if let Some(m) = cavity.conduction() {
            patterns.push(m.pattern());
        }
        let pattern = pattern_union(&patterns)?;

        let row_nnz: Vec<usize> = (0..n).map(|i| pattern.lane(i).len()).collect();
        let diag_pos: Vec<usize> = (0..n)
            .map(|i| {
                pattern
                    .lane(i)
                    .binary_search(&i)
                    .expect("diagonal entry unioned into base pattern")
            })
            .collect();

        Ok(Self {
            row_nnz,
            diag_pos,
            stiff_re: align_values(cavity.stiffness_re(), &pattern)?,
            stiff_im: cavity
                .stiffness_im()
                .map(|m| align_values(m, &pattern))
                .transpose()?,
            mass_re: align_values(cavity.mass_re(), &pattern)?,
            mass_im: cavity
                .mass_im()
                .map(|m| align_values(m, &pattern))
                .transpose()?,
            boundary: cavity
                .boundary()
                .map(|m| align_values(m, &pattern))
                .transpose()?,
            conduction: cavity
                .conduction()
                .map(|m| align_values(m, &pattern))
                .transpose()?,
            mass_slots: slot_map(cavity.mass_pattern(), &pattern)?,
            mass_offsets: cavity.mass_pattern().major_offsets().to_vec(),
            mass_cols: cavity.mass_pattern().minor_indices().to_vec(),
            pattern,
        })
    }

    fn aligned(&self, op: Operator) -> Option<&[f64]> {
        match op {
            Operator::StiffnessRe => Some(&self.stiff_re),
            Operator::StiffnessIm => self.stiff_im.as_deref(),
            Operator::MassRe => Some(&self.mass_re),
            Operator::MassIm => self.mass_im.as_deref(),
            Operator::Boundary => self.boundary.as_deref(),
            Operator::Conduction => self.conduction.as_deref(),
        }
    }
}

/// Pre-allocated Jacobian/residual for one mode count.
pub struct NewtonWorkspace {
    layout: UnknownLayout,
    jac: CsrMatrix<f64>,
    residual: DVector<f64>,
    constraint_slots: Vec<usize>,
    generation: u64,
}

impl NewtonWorkspace {
    fn build(
        base: &BaseOperators,
        cavity: &dyn CavityDiscretization,
        nmodes: usize,
        generation: u64,
    ) -> Result<Self> {
        let n = cavity.ndofs();
        let layout = UnknownLayout::new(n, nmodes);
        let total = layout.total();
        let nblocks = 2 * nmodes;
        let field_len = layout.field_len();
        let e_dof = cavity.normalization_dof();

        let mut offsets = Vec::with_capacity(total + 1);
        let mut indices = Vec::new();
        offsets.push(0);
        for _bi in 0..nblocks {
            for li in 0..n {
                for bj in 0..nblocks {
                    for &j in base.pattern.lane(li) {
                        indices.push(bj * n + j);
                    }
                }
                for c in 0..nblocks {
                    indices.push(field_len + c);
                }
                offsets.push(indices.len());
            }
        }
        let mut constraint_slots = Vec::with_capacity(nblocks);
        for m in 0..nmodes {
            // Row k_index(m): Re(e^T b_m - 1); row s_index(m): Im(e^T b_m).
            constraint_slots.push(indices.len());
            indices.push(layout.v_offset(m) + e_dof);
            offsets.push(indices.len());
            constraint_slots.push(indices.len());
            indices.push(layout.w_offset(m) + e_dof);
            offsets.push(indices.len());
        }

        let nnz = indices.len();
        let pattern = SparsityPattern::try_from_offsets_and_indices(total, total, offsets, indices)
            .map_err(|e| anyhow::anyhow!("invalid block pattern: {e:?}"))?;
        let jac = CsrMatrix::try_from_pattern_and_values(pattern, vec![0.0; nnz])
            .map_err(|e| anyhow::anyhow!("invalid block matrix: {e:?}"))?;

        debug!("built block workspace: nmodes={nmodes} total={total} nnz={nnz}");

        Ok(Self {
            layout,
            jac,
            residual: DVector::zeros(total),
            constraint_slots,
            generation,
        })
    }

    pub fn layout(&self) -> &UnknownLayout {
        &self.layout
    }

    pub fn jacobian(&self) -> &CsrMatrix<f64> {
        &self.jac
    }

    pub fn residual(&self) -> &DVector<f64> {
        &self.residual
    }

    pub fn residual_mut(&mut self) -> &mut DVector<f64> {
        &mut self.residual
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Zero all values and re-seat the constant normalization rows.
    pub fn reset(&mut self) {
        let (_, _, values) = self.jac.csr_data_mut();
        values.fill(0.0);
        for &slot in &self.constraint_slots {
            values[slot] = 1.0;
        }
        self.residual.fill(0.0);
    }

    /// Add `coef * op` into field block `(bi, bj)`; no-op when the cavity
    /// does not carry the operator.
    pub fn add_operator_block(
        &mut self,
        base: &BaseOperators,
        bi: usize,
        bj: usize,
        op: Operator,
        coef: f64,
    ) {
        let Some(aligned) = base.aligned(op) else {
            return;
        };
        if coef == 0.0 {
            return;
        }
        let n = self.layout.n;
        let base_offsets = base.pattern.major_offsets();
        let (offsets, _, values) = self.jac.csr_data_mut();
        for li in 0..n {
            let row_start = offsets[bi * n + li];
            let slot0 = row_start + bj * base.row_nnz[li];
            let base0 = base_offsets[li];
            for p in 0..base.row_nnz[li] {
                values[slot0 + p] += coef * aligned[base0 + p];
            }
        }
    }

    /// Add `coef` times pre-assembled mass-pattern values into field block
    /// `(bi, bj)`, optionally scaling column `j` by `colscale[j]` first.
    /// The column scaling is how the hole-burning chain rule enters: the
    /// saturation derivative with respect to a nodal field value scales the
    /// trilinear mass form column belonging to that node.
    pub fn add_mass_block(
        &mut self,
        base: &BaseOperators,
        bi: usize,
        bj: usize,
        vals: &[f64],
        colscale: Option<&DVector<f64>>,
        coef: f64,
    ) {
        let n = self.layout.n;
        let base_offsets = base.pattern.major_offsets();
        let (offsets, _, values) = self.jac.csr_data_mut();
        for li in 0..n {
            let row_start = offsets[bi * n + li];
            let slot0 = row_start + bj * base.row_nnz[li];
            let base0 = base_offsets[li];
            for idx in base.mass_offsets[li]..base.mass_offsets[li + 1] {
                let pos_in_row = base.mass_slots[idx] - base0;
                let scale = match colscale {
                    Some(c) => c[base.mass_cols[idx]],
                    None => 1.0,
                };
                values[slot0 + pos_in_row] += coef * scale * vals[idx];
            }
        }
    }

    /// Add `coef * vec` into scalar column `c` (0-based within the 2N
    /// trailing columns) of block row `bi`.
    pub fn add_scalar_column(
        &mut self,
        base: &BaseOperators,
        bi: usize,
        c: usize,
        vec: &DVector<f64>,
        coef: f64,
    ) {
        let n = self.layout.n;
        let nblocks = 2 * self.layout.nmodes;
        let (offsets, _, values) = self.jac.csr_data_mut();
        for li in 0..n {
            let row_start = offsets[bi * n + li];
            let slot = row_start + nblocks * base.row_nnz[li] + c;
            values[slot] += coef * vec[li];
        }
    }

    /// Replace every Dirichlet row with an identity row and pin its
    /// residual entry to the current field value, so the correction drives
    /// constrained DOFs to zero exactly.
    pub fn apply_dirichlet(
        &mut self,
        base: &BaseOperators,
        cavity: &dyn CavityDiscretization,
        modes: &[Mode],
    ) {
        let n = self.layout.n;
        let dofs = cavity.dirichlet_dofs();
        for (m, mode) in modes.iter().enumerate() {
            for (bi, field) in [(2 * m, &mode.v), (2 * m + 1, &mode.w)] {
                for &d in dofs {
                    let row = bi * n + d;
                    let (offsets, _, values) = self.jac.csr_data_mut();
                    let row_start = offsets[row];
                    let row_end = offsets[row + 1];
                    values[row_start..row_end].fill(0.0);
                    let diag = row_start + bi * base.row_nnz[d] + base.diag_pos[d];
                    values[diag] = 1.0;
                    self.residual[row] = field[d];
                }
            }
        }
    }
}

/// Cache of Newton workspaces keyed by active-mode count.
pub struct BlockAssembly<'a> {
    cavity: &'a dyn CavityDiscretization,
    base: BaseOperators,
    workspaces: BTreeMap<usize, NewtonWorkspace>,
    generation: u64,
}

impl<'a> BlockAssembly<'a> {
    pub fn new(cavity: &'a dyn CavityDiscretization) -> Result<Self> {
        Ok(Self {
            base: BaseOperators::build(cavity)?,
            cavity,
            workspaces: BTreeMap::new(),
            generation: 0,
        })
    }

    /// Drop all cached structures. Must be called after any change to the
    /// discretization's boundary-condition sets; patterns are not revalidated
    /// automatically.
    pub fn invalidate(&mut self) -> Result<()> {
        self.generation += 1;
        self.workspaces.clear();
        self.base = BaseOperators::build(self.cavity)?;
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Base operators plus the (possibly freshly built) workspace for
    /// `nmodes`, reset and ready for assembly.
    pub fn parts_mut(&mut self, nmodes: usize) -> Result<(&BaseOperators, &mut NewtonWorkspace)> {
        if !self.workspaces.contains_key(&nmodes) {
            let ws = NewtonWorkspace::build(&self.base, self.cavity, nmodes, self.generation)?;
            self.workspaces.insert(nmodes, ws);
        }
        let ws = self.workspaces.get_mut(&nmodes).expect("just inserted");
        ws.reset();
        Ok((&self.base, ws))
    }

    pub fn cavity(&self) -> &'a dyn CavityDiscretization {
        self.cavity
    }
}

fn identity_pattern(n: usize) -> SparsityPattern {
    let offsets: Vec<usize> = (0..=n).collect();
    let indices: Vec<usize> = (0..n).collect();
    SparsityPattern::try_from_offsets_and_indices(n, n, offsets, indices).expect("pattern")
}
