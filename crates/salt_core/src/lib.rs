//! Steady-state multimode laser solver on finite-element cavities.
//!
//! The crate takes a discretized electromagnetic cavity (sparse stiffness,
//! mass, boundary, and conduction forms plus a weighted-mass capability,
//! behind [`cavity::CavityDiscretization`]) and a two-level gain medium,
//! and computes the steady lasing state as a function of pump strength:
//! which modes lase, at which real wavenumbers, with which amplitudes and
//! spatial profiles.
//!
//! The pieces compose bottom-up:
//! - [`single_mode`] refines one below-threshold resonance `(b, k)` with
//!   complex `k`; thresholds are where `Im k` crosses zero.
//! - [`nevp`] scans a wavenumber window with multi-start refinement to
//!   enumerate the (possibly saturated) spectrum.
//! - [`multimode`] assembles the coupled above-threshold system in which
//!   active modes interact through spatial hole burning, and [`newton`]
//!   drives it to convergence.
//! - [`continuation`] alternates refinement and spectrum checks at fixed
//!   pump, and sweeps the pump while keeping mode identities stable.
//!
//! A reference 1-D discretization lives in [`interval`] so the solver can
//! be exercised without an external finite-element layer.

pub mod assembly;
pub mod cavity;
pub mod continuation;
pub mod gain;
pub mod interval;
pub mod modes;
pub mod multimode;
pub mod nevp;
pub mod newton;
pub mod single_mode;

pub use cavity::CavityDiscretization;
pub use continuation::{constant_pump_solve, pump_sweep, ActiveSet, ContinuationSettings};
pub use gain::{GainMedium, Pump};
pub use modes::{Mode, ModeResult, UnknownLayout};
pub use multimode::MultimodeProblem;
pub use nevp::{NevpSolver, ScanningNevp};
pub use newton::{refine_modes, DenseLu, LinearSolver, NewtonSettings};
pub use single_mode::SingleModeProblem;

/// Structural misuse of the solver inputs. These are programmer errors at
/// the call site, reported as typed errors rather than panics so library
/// consumers can surface them.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{what}: expected dimension {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{0}")]
    Empty(&'static str),
    #[error("sparse entry ({row}, {col}) missing from the target pattern")]
    PatternMismatch { row: usize, col: usize },
}
