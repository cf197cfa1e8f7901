//! Constant-pump fixed point and pump sweeps.
//!
//! At a fixed pump the algorithm alternates two steps until the spectrum is
//! clean: refine the active set jointly, then re-examine the saturated
//! below-threshold spectrum for resonances still above the real axis. Each
//! resonance found is activated with a small amplitude seed and the loop
//! repeats; when no resonance remains above the axis the active set is the
//! self-consistent lasing solution.
//!
//! Pump sweeps reuse the converged active set as the warm start of the next
//! pump value, which is what keeps mode identities stable across the sweep.

use anyhow::{bail, Result};
use log::{info, warn};

use crate::gain::Pump;
use crate::modes::{IterationRecord, Mode, ModeResult};
use crate::multimode::MultimodeProblem;
use crate::newton::{refine_modes, LinearSolver, NewtonSettings};
use crate::nevp::NevpSolver;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ContinuationSettings {
    /// Hard cap on simultaneously active modes.
    pub max_modes: usize,
    /// A resonance counts as above the real axis when `Im k` exceeds this.
    /// Active modes re-appear in the saturated spectrum at `Im k ~ 0`, so
    /// the tolerance also keeps them from being activated twice.
    pub above_axis_tol: f64,
    /// Minimum `|k|` distance between a candidate and every active mode.
    pub distinct_tol: f64,
    /// Amplitude seed for a freshly activated mode.
    pub initial_scale: f64,
    /// Modes whose amplitude falls below this are switched off.
    pub shutoff_tol: f64,
    pub newton: NewtonSettings,
}

impl Default for ContinuationSettings {
    fn default() -> Self {
        Self {
            max_modes: 8,
            above_axis_tol: 1e-9,
            distinct_tol: 1e-4,
            initial_scale: 0.1,
            shutoff_tol: 1e-8,
            newton: NewtonSettings::default(),
        }
    }
}

/// One mode of the active set, with an identity that survives re-refinement
/// and pump sweeps.
#[derive(Debug, Clone)]
pub struct ActiveEntry {
    pub id: usize,
    pub mode: Mode,
    pub converged: bool,
    pub history: Vec<IterationRecord>,
}

/// Currently lasing modes, in activation order.
#[derive(Debug, Clone, Default)]
pub struct ActiveSet {
    next_id: usize,
    entries: Vec<ActiveEntry>,
}

impl ActiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ActiveEntry] {
        &self.entries
    }

    pub fn modes(&self) -> Vec<Mode> {
        self.entries.iter().map(|e| e.mode.clone()).collect()
    }

    pub fn results(&self) -> Vec<ModeResult> {
        self.entries
            .iter()
            .map(|e| ModeResult {
                mode: e.mode.clone(),
                converged: e.converged,
                history: e.history.clone(),
            })
            .collect()
    }

    fn activate(&mut self, mode: Mode) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(ActiveEntry {
            id,
            mode,
            converged: false,
            history: Vec::new(),
        });
        id
    }
}

/// Solve the fixed pump `pump` self-consistently, warm-starting from (and
/// updating) `active`.
pub fn constant_pump_solve(
    problem: &mut MultimodeProblem,
    nevp: &dyn NevpSolver,
    solver: &mut dyn LinearSolver,
    pump: &Pump,
    window: (f64, f64),
    settings: &ContinuationSettings,
    active: &mut ActiveSet,
) -> Result<()> {
    let norm_dof = problem.cavity().normalization_dof();

    for _round in 0..settings.max_modes + 2 {
        if !active.is_empty() {
            let mut modes = active.modes();
            let outcome = refine_modes(problem, pump, &mut modes, solver, &settings.newton)?;
            for (entry, mode) in active.entries.iter_mut().zip(modes) {
                entry.mode = mode;
                entry.converged = outcome.converged;
                entry.history = outcome.history.clone();
            }
            if !outcome.converged {
                // Non-convergence is a reported state: stop the fixed point
                // here and let the caller inspect the partial active set.
                warn!(
                    "active set of {} modes did not converge at d0={} (last correction {:.3e})",
                    active.len(),
                    pump.d0,
                    outcome.correction_norm
                );
                return Ok(());
            }
            active.entries.retain(|e| {
                if e.mode.s < settings.shutoff_tol {
                    info!("mode {} switched off at d0={}", e.id, pump.d0);
                    false
                } else {
                    true
                }
            });
        }

        let modes = active.modes();
        let saturation = if modes.is_empty() {
            None
        } else {
            Some(problem.saturation(&modes))
        };
        let pairs = nevp.solve(pump, saturation.as_ref(), window)?;
        let candidate = pairs.into_iter().find(|p| {
            p.k.im > settings.above_axis_tol
                && active
                    .entries
                    .iter()
                    .all(|e| (e.mode.k - p.k.re).abs() > settings.distinct_tol)
        });

        let Some(pair) = candidate else {
            return Ok(());
        };
        if active.len() >= settings.max_modes {
            warn!(
                "resonance at k={} still above the axis but the active set is full",
                pair.k
            );
            return Ok(());
        }
        let mode = Mode::from_eigenfield(pair.k.re, settings.initial_scale, &pair.field, norm_dof)?;
        let id = active.activate(mode);
        info!("activated mode {id} at k={:.6} (Im k was {:.3e})", pair.k.re, pair.k.im);
    }

    bail!("activation loop did not settle at d0={}", pump.d0)
}

/// Solution at one pump value of a sweep.
#[derive(Debug, Clone)]
pub struct SweepPoint {
    pub d0: f64,
    pub ids: Vec<usize>,
    pub modes: Vec<ModeResult>,
}

/// Solve an ascending list of pump strengths, carrying the active set from
/// one value to the next.
pub fn pump_sweep(
    problem: &mut MultimodeProblem,
    nevp: &dyn NevpSolver,
    solver: &mut dyn LinearSolver,
    base: &Pump,
    d0s: &[f64],
    window: (f64, f64),
    settings: &ContinuationSettings,
) -> Result<Vec<SweepPoint>> {
    let mut active = ActiveSet::new();
    let mut points = Vec::with_capacity(d0s.len());
    for &d0 in d0s {
        let pump = Pump {
            d0,
            profile: base.profile.clone(),
        };
        constant_pump_solve(problem, nevp, solver, &pump, window, settings, &mut active)?;
        info!("pump d0={d0}: {} active modes", active.len());
        points.push(SweepPoint {
            d0,
            ids: active.entries().iter().map(|e| e.id).collect(),
            modes: active.results(),
        });
    }
    Ok(points)
}
