//! Reference 1-D cavity discretization (linear Lagrange elements on a
//! uniform interval mesh).
//!
//! This stands in for the external finite-element layer so the solver can be
//! exercised end to end on the 1-D slab systems from the SALT literature.
//! Everything the core consumes goes through the [`CavityDiscretization`]
//! trait; nothing else in the crate depends on this module.

use nalgebra::DVector;
use nalgebra_sparse::pattern::SparsityPattern;
use nalgebra_sparse::{CooMatrix, CsrMatrix};

use crate::cavity::CavityDiscretization;

#[derive(Debug, Clone)]
enum Dielec {
    Uniform(f64),
    Profile(Vec<f64>),
}

/// Builder for [`IntervalCavity`]. Boundary configuration mirrors the usual
/// 1-D slab setups: Dirichlet walls, outgoing leads, or both.
#[derive(Debug, Clone)]
pub struct IntervalCavityBuilder {
    x0: f64,
    x1: f64,
    nx: usize,
    dielec: Dielec,
    invperm: f64,
    sigma_c: Option<f64>,
    obc_left: bool,
    obc_right: bool,
    dbc_left: bool,
    dbc_right: bool,
    norm_x: Option<f64>,
}

impl IntervalCavityBuilder {
    pub fn dielec(mut self, dielec: f64) -> Self {
        self.dielec = Dielec::Uniform(dielec);
        self
    }

    /// Nodal permittivity profile; length must be `nx + 1`.
    pub fn dielec_profile(mut self, profile: Vec<f64>) -> Self {
        self.dielec = Dielec::Profile(profile);
        self
    }

    pub fn invperm(mut self, invperm: f64) -> Self {
        self.invperm = invperm;
        self
    }

    /// Cold-cavity conduction loss `sigma_c`.
    pub fn conduction(mut self, sigma_c: f64) -> Self {
        self.sigma_c = Some(sigma_c);
        self
    }

    pub fn dirichlet_left(mut self) -> Self {
        self.dbc_left = true;
        self
    }

    pub fn dirichlet_right(mut self) -> Self {
        self.dbc_right = true;
        self
    }

    pub fn outgoing_left(mut self) -> Self {
        self.obc_left = true;
        self
    }

    pub fn outgoing_right(mut self) -> Self {
        self.obc_right = true;
        self
    }

    /// Pin the normalization gauge at the node closest to `x`.
    pub fn normalization_at(mut self, x: f64) -> Self {
        self.norm_x = Some(x);
        self
    }

    pub fn build(self) -> IntervalCavity {
        let n = self.nx + 1;
        let h = (self.x1 - self.x0) / self.nx as f64;
        assert!(self.nx >= 2, "interval mesh needs at least two elements");

        let dielec = match self.dielec {
            Dielec::Uniform(d) => DVector::from_element(n, d),
            Dielec::Profile(p) => {
                assert_eq!(p.len(), n, "dielectric profile must be nodal");
                DVector::from_vec(p)
            }
        };

        let pattern = tridiagonal_pattern(n);

        // Stiffness \int invperm u' v'; constant coefficient on each element.
        let mut stiff_vals = vec![0.0; pattern.nnz()];
        for e in 0..self.nx {
            let c = self.invperm / h;
            add_entry(&pattern, &mut stiff_vals, e, e, c);
            add_entry(&pattern, &mut stiff_vals, e, e + 1, -c);
            add_entry(&pattern, &mut stiff_vals, e + 1, e, -c);
            add_entry(&pattern, &mut stiff_vals, e + 1, e + 1, c);
        }
        let stiffness =
            CsrMatrix::try_from_pattern_and_values(pattern.clone(), stiff_vals).expect("csr");

        let mut mass_vals = vec![0.0; pattern.nnz()];
        weighted_mass_into(&pattern, self.nx, h, &dielec, &mut mass_vals);
        let mass = CsrMatrix::try_from_pattern_and_values(pattern.clone(), mass_vals).expect("csr");

        let conduction = self.sigma_c.map(|sigma| {
            let weight = DVector::from_element(n, sigma);
            let mut vals = vec![0.0; pattern.nnz()];
            weighted_mass_into(&pattern, self.nx, h, &weight, &mut vals);
            CsrMatrix::try_from_pattern_and_values(pattern.clone(), vals).expect("csr")
        });

        // Outgoing-boundary form: point evaluation at the selected leads.
        let boundary = if self.obc_left || self.obc_right {
            let mut coo = CooMatrix::new(n, n);
            if self.obc_left {
                coo.push(0, 0, 1.0);
            }
            if self.obc_right {
                coo.push(n - 1, n - 1, 1.0);
            }
            Some(CsrMatrix::from(&coo))
        } else {
            None
        };

        let mut dirichlet = Vec::new();
        if self.dbc_left {
            dirichlet.push(0);
        }
        if self.dbc_right {
            dirichlet.push(n - 1);
        }

        let norm_x = self
            .norm_x
            .unwrap_or(self.x0 + 0.75 * (self.x1 - self.x0));
        let norm_dof = ((norm_x - self.x0) / h).round().clamp(0.0, (n - 1) as f64) as usize;
        debug_assert!(
            !dirichlet.contains(&norm_dof),
            "normalization DOF coincides with a Dirichlet DOF"
        );

        IntervalCavity {
            n,
            nx: self.nx,
            h,
            stiffness,
            mass,
            boundary,
            conduction,
            pattern,
            dirichlet,
            norm_dof,
        }
    }
}

/// Uniform 1-D interval mesh with P1 Lagrange elements.
#[derive(Debug, Clone)]
pub struct IntervalCavity {
    n: usize,
    nx: usize,
    h: f64,
    stiffness: CsrMatrix<f64>,
    mass: CsrMatrix<f64>,
    boundary: Option<CsrMatrix<f64>>,
    conduction: Option<CsrMatrix<f64>>,
    pattern: SparsityPattern,
    dirichlet: Vec<usize>,
    norm_dof: usize,
}

impl IntervalCavity {
    pub fn builder(x0: f64, x1: f64, nx: usize) -> IntervalCavityBuilder {
        IntervalCavityBuilder {
            x0,
            x1,
            nx,
            dielec: Dielec::Uniform(1.0),
            invperm: 1.0,
            sigma_c: None,
            obc_left: false,
            obc_right: false,
            dbc_left: false,
            dbc_right: false,
            norm_x: None,
        }
    }
}

impl CavityDiscretization for IntervalCavity {
    fn ndofs(&self) -> usize {
        self.n
    }

    fn stiffness_re(&self) -> &CsrMatrix<f64> {
        &self.stiffness
    }

    fn stiffness_im(&self) -> Option<&CsrMatrix<f64>> {
        None
    }

    fn mass_re(&self) -> &CsrMatrix<f64> {
        &self.mass
    }

    fn mass_im(&self) -> Option<&CsrMatrix<f64>> {
        None
    }

    fn boundary(&self) -> Option<&CsrMatrix<f64>> {
        self.boundary.as_ref()
    }

    fn conduction(&self) -> Option<&CsrMatrix<f64>> {
        self.conduction.as_ref()
    }

    fn mass_pattern(&self) -> &SparsityPattern {
        &self.pattern
    }

    fn weighted_mass_values(&self, weight: &DVector<f64>, out: &mut [f64]) {
        debug_assert_eq!(weight.len(), self.n);
        debug_assert_eq!(out.len(), self.pattern.nnz());
        out.fill(0.0);
        weighted_mass_into(&self.pattern, self.nx, self.h, weight, out);
    }

    fn weighted_mass_apply(&self, weight: &DVector<f64>, x: &DVector<f64>, out: &mut DVector<f64>) {
        debug_assert_eq!(weight.len(), self.n);
        debug_assert_eq!(x.len(), self.n);
        out.fill(0.0);
        let scale = self.h / 12.0;
        for e in 0..self.nx {
            let (c0, c1) = (weight[e], weight[e + 1]);
            let (x0, x1) = (x[e], x[e + 1]);
            out[e] += scale * ((3.0 * c0 + c1) * x0 + (c0 + c1) * x1);
            out[e + 1] += scale * ((c0 + c1) * x0 + (c0 + 3.0 * c1) * x1);
        }
    }

    fn dirichlet_dofs(&self) -> &[usize] {
        &self.dirichlet
    }

    fn normalization_dof(&self) -> usize {
        self.norm_dof
    }
}

fn tridiagonal_pattern(n: usize) -> SparsityPattern {
    let mut offsets = Vec::with_capacity(n + 1);
    let mut indices = Vec::new();
    offsets.push(0);
    for i in 0..n {
        if i > 0 {
            indices.push(i - 1);
        }
        indices.push(i);
        if i + 1 < n {
            indices.push(i + 1);
        }
        offsets.push(indices.len());
    }
    SparsityPattern::try_from_offsets_and_indices(n, n, offsets, indices).expect("pattern")
}

/// Accumulate `inner(weight * u, v)` with the nodal `weight` interpolated
/// linearly on each element (exact for P1 test/trial pairs).
fn weighted_mass_into(
    pattern: &SparsityPattern,
    nx: usize,
    h: f64,
    weight: &DVector<f64>,
    out: &mut [f64],
) {
    let scale = h / 12.0;
    for e in 0..nx {
        let (c0, c1) = (weight[e], weight[e + 1]);
        add_entry(pattern, out, e, e, scale * (3.0 * c0 + c1));
        add_entry(pattern, out, e, e + 1, scale * (c0 + c1));
        add_entry(pattern, out, e + 1, e, scale * (c0 + c1));
        add_entry(pattern, out, e + 1, e + 1, scale * (c0 + 3.0 * c1));
    }
}

fn add_entry(pattern: &SparsityPattern, values: &mut [f64], i: usize, j: usize, v: f64) {
    let pos = pattern.lane(i).binary_search(&j).expect("entry in pattern");
    values[pattern.major_offsets()[i] + pos] += v;
}
