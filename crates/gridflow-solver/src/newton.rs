//! Newton iteration over the equation system.
//!
//! Each iteration solves `J(x_k)·Δx = −F(x_k)` through the injected
//! [`LinearSolver`] backend and accepts `x_{k+1} = x_k + scale·Δx`, where
//! `scale` comes from the configured step-scaling strategy. The raw full
//! step is the fastest path on well-conditioned networks but can jump into
//! unphysical regions on stressed ones; clipping and line search trade
//! iterations for robustness.
//!
//! Non-convergence is a terminal [`IterationStatus`], never an error: the
//! engine maps it to a per-component result and moves on.

use crate::backend::LinearSolver;
use crate::config::{NormKind, ScalingConfig, ScalingMode};
use crate::equations::{EquationSystem, StateVector, VariableKind};
use crate::model::PfNetwork;
use tracing::{debug, trace};

/// Terminal state of a nonlinear solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationStatus {
    Converged,
    MaxIterationReached,
    /// The linear system was singular or near-singular
    SolverFailed,
    /// The residual converged, but some bus voltage sits outside the
    /// plausible bounds; reported as non-convergence, never accepted
    UnrealisticState,
}

/// Outcome of one nonlinear solve.
#[derive(Debug, Clone, Copy)]
pub struct IterationReport {
    pub status: IterationStatus,
    pub iterations: usize,
    pub final_norm: f64,
}

/// Pluggable convergence test.
pub trait StoppingCriterion: Send + Sync {
    /// Scalar residual summary, used for logging and line search.
    fn norm(&self, residual: &[f64]) -> f64;
    fn satisfied(&self, residual: &[f64]) -> bool;
}

/// Single tolerance under a configured norm.
#[derive(Debug, Clone, Copy)]
pub struct UniformCriterion {
    pub kind: NormKind,
    pub tolerance: f64,
}

impl StoppingCriterion for UniformCriterion {
    fn norm(&self, residual: &[f64]) -> f64 {
        match self.kind {
            NormKind::Max => residual.iter().fold(0.0_f64, |m, r| m.max(r.abs())),
            NormKind::L2 => residual.iter().map(|r| r * r).sum::<f64>().sqrt(),
        }
    }

    fn satisfied(&self, residual: &[f64]) -> bool {
        self.norm(residual) < self.tolerance
    }
}

/// Per-equation absolute tolerances; equation `i` must satisfy its own
/// bound before the solve counts as converged.
#[derive(Debug, Clone)]
pub struct PerEquationCriterion {
    pub tolerances: Vec<f64>,
}

impl StoppingCriterion for PerEquationCriterion {
    fn norm(&self, residual: &[f64]) -> f64 {
        residual.iter().fold(0.0_f64, |m, r| m.max(r.abs()))
    }

    fn satisfied(&self, residual: &[f64]) -> bool {
        residual.len() == self.tolerances.len()
            && residual
                .iter()
                .zip(&self.tolerances)
                .all(|(r, tol)| r.abs() < *tol)
    }
}

/// Largest per-slot magnitude of a step, split into voltage-like slots
/// (bus V, branch ratio) and angle-like slots (bus angle, branch phase).
fn step_extremes(system: &EquationSystem, delta: &[f64]) -> (f64, f64) {
    let layout = system.layout();
    let mut max_v = 0.0_f64;
    let mut max_phi = 0.0_f64;
    for (slot, d) in delta.iter().enumerate() {
        match layout.kind(slot) {
            VariableKind::BusV(_) | VariableKind::BranchRho(_) => max_v = max_v.max(d.abs()),
            VariableKind::BusAngle(_) | VariableKind::BranchAlpha(_) => {
                max_phi = max_phi.max(d.abs())
            }
        }
    }
    (max_v, max_phi)
}

fn stepped(x: &StateVector, delta: &[f64], scale: f64) -> StateVector {
    let values = x
        .values
        .iter()
        .zip(delta)
        .map(|(v, d)| v + scale * d)
        .collect();
    StateVector { values }
}

/// Pick the accepted fraction of the raw Newton step.
///
/// `MaxVoltageChange` shrinks the whole step uniformly so the direction is
/// preserved while the largest voltage/angle move stays bounded.
/// `LineSearch` folds the step until the residual norm is no worse than
/// before, giving up after the configured number of attempts (the smallest
/// tried step is then accepted as-is).
pub(crate) fn step_scale(
    model: &PfNetwork,
    system: &EquationSystem,
    x: &StateVector,
    delta: &[f64],
    scaling: &ScalingConfig,
    criterion: &dyn StoppingCriterion,
    current_norm: f64,
) -> f64 {
    match scaling.mode {
        ScalingMode::None => 1.0,
        ScalingMode::MaxVoltageChange => {
            let (max_v, max_phi) = step_extremes(system, delta);
            let mut scale = 1.0_f64;
            if max_v > scaling.max_dv {
                scale = scale.min(scaling.max_dv / max_v);
            }
            if max_phi > scaling.max_dphi {
                scale = scale.min(scaling.max_dphi / max_phi);
            }
            scale
        }
        ScalingMode::LineSearch => {
            let mut scale = 1.0_f64;
            for attempt in 0..scaling.max_steps {
                let trial = system.residual(model, &stepped(x, delta, scale));
                if criterion.norm(&trial) <= current_norm {
                    break;
                }
                trace!(attempt, scale, "step worsens residual, folding");
                scale /= scaling.fold;
            }
            scale
        }
    }
}

/// All bus voltage magnitudes inside the plausible band?
pub(crate) fn state_is_realistic(
    model: &PfNetwork,
    system: &EquationSystem,
    x: &StateVector,
    bounds: (f64, f64),
) -> bool {
    let layout = system.layout();
    model.buses.iter().all(|bus| {
        let v = x.values[layout.v(bus.num)];
        v >= bounds.0 && v <= bounds.1
    })
}

fn converged_status(
    model: &PfNetwork,
    system: &EquationSystem,
    x: &StateVector,
    bounds: (f64, f64),
) -> IterationStatus {
    if state_is_realistic(model, system, x, bounds) {
        IterationStatus::Converged
    } else {
        IterationStatus::UnrealisticState
    }
}

/// Drive the residual to the stopping criterion from the given start
/// state, mutating `x` in place. The model itself is never touched.
#[allow(clippy::too_many_arguments)]
pub fn newton_solve(
    model: &PfNetwork,
    system: &EquationSystem,
    x: &mut StateVector,
    backend: &mut dyn LinearSolver,
    criterion: &dyn StoppingCriterion,
    scaling: &ScalingConfig,
    max_iterations: usize,
    realistic_v: (f64, f64),
) -> IterationReport {
    let mut residual = system.residual(model, x);
    let mut norm = criterion.norm(&residual);
    if criterion.satisfied(&residual) {
        return IterationReport {
            status: converged_status(model, system, x, realistic_v),
            iterations: 0,
            final_norm: norm,
        };
    }

    for iteration in 1..=max_iterations {
        let jacobian = system.jacobian(model, x);
        let rhs: Vec<f64> = residual.iter().map(|r| -r).collect();
        let delta = match backend.solve(&jacobian, &rhs) {
            Ok(delta) => delta,
            Err(err) => {
                debug!(iteration, %err, "linear solve failed");
                return IterationReport {
                    status: IterationStatus::SolverFailed,
                    iterations: iteration,
                    final_norm: norm,
                };
            }
        };

        let scale = step_scale(model, system, x, &delta, scaling, criterion, norm);
        for (value, d) in x.values.iter_mut().zip(&delta) {
            *value += scale * d;
        }

        residual = system.residual(model, x);
        norm = criterion.norm(&residual);
        debug!(iteration, norm, scale, "newton step");
        if !norm.is_finite() {
            return IterationReport {
                status: IterationStatus::SolverFailed,
                iterations: iteration,
                final_norm: norm,
            };
        }
        if criterion.satisfied(&residual) {
            return IterationReport {
                status: converged_status(model, system, x, realistic_v),
                iterations: iteration,
                final_norm: norm,
            };
        }
    }

    IterationReport {
        status: IterationStatus::MaxIterationReached,
        iterations: max_iterations,
        final_norm: norm,
    }
}
