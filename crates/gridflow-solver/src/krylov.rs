//! Matrix-free Newton-Krylov variant of the outer iteration.
//!
//! The linear step is solved approximately by restarted GMRES over the
//! directional derivative `J·v ≈ (F(x + εv) − F(x)) / ε`, so no explicit
//! Jacobian is ever assembled or factorized. The trade is linear-solve
//! accuracy for assembly cost; an inner backtracking safeguard covers the
//! error the inexact step introduces, on top of whichever step-scaling
//! strategy is configured.

use crate::config::ScalingConfig;
use crate::equations::{EquationSystem, StateVector};
use crate::model::PfNetwork;
use crate::newton::{step_scale, state_is_realistic, IterationReport, IterationStatus, StoppingCriterion};
use tracing::{debug, trace};

/// Relative tolerance of the inner GMRES solve.
const FORCING: f64 = 1e-6;
/// Krylov subspace dimension per restart cycle.
const RESTART: usize = 50;
const MAX_RESTARTS: usize = 4;
/// Backtrack attempts of the inexact-step safeguard.
const SAFEGUARD_STEPS: usize = 4;

fn l2(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Restarted GMRES with Givens rotations. `apply` computes `A·v`; the
/// initial guess is zero. Returns `None` on breakdown without progress or
/// a non-finite update (the operator is effectively singular).
fn gmres(
    apply: &mut dyn FnMut(&[f64]) -> Vec<f64>,
    rhs: &[f64],
    tolerance: f64,
) -> Option<Vec<f64>> {
    let n = rhs.len();
    let m = RESTART.min(n);
    let mut solution = vec![0.0; n];

    for restart in 0..MAX_RESTARTS {
        let ax = apply(&solution);
        let mut r: Vec<f64> = rhs.iter().zip(&ax).map(|(b, a)| b - a).collect();
        let beta = l2(&r);
        if beta <= tolerance {
            return Some(solution);
        }

        for value in r.iter_mut() {
            *value /= beta;
        }
        let mut basis = vec![r];
        // Hessenberg columns after rotation, plus the rotations themselves.
        let mut h = vec![vec![0.0; m + 1]; m];
        let mut cs = vec![0.0; m];
        let mut sn = vec![0.0; m];
        let mut g = vec![0.0; m + 1];
        g[0] = beta;
        let mut k_used = 0;

        for j in 0..m {
            let mut w = apply(&basis[j]);
            for i in 0..=j {
                h[j][i] = dot(&w, &basis[i]);
                for (wv, bv) in w.iter_mut().zip(&basis[i]) {
                    *wv -= h[j][i] * bv;
                }
            }
            let w_norm = l2(&w);
            h[j][j + 1] = w_norm;

            for i in 0..j {
                let hi = h[j][i];
                let hi1 = h[j][i + 1];
                h[j][i] = cs[i] * hi + sn[i] * hi1;
                h[j][i + 1] = -sn[i] * hi + cs[i] * hi1;
            }
            let denom = (h[j][j] * h[j][j] + h[j][j + 1] * h[j][j + 1]).sqrt();
            if denom == 0.0 || !denom.is_finite() {
                break;
            }
            cs[j] = h[j][j] / denom;
            sn[j] = h[j][j + 1] / denom;
            h[j][j] = denom;
            h[j][j + 1] = 0.0;
            g[j + 1] = -sn[j] * g[j];
            g[j] *= cs[j];
            k_used = j + 1;

            if g[j + 1].abs() <= tolerance || w_norm <= f64::EPSILON * beta {
                break;
            }
            for value in w.iter_mut() {
                *value /= w_norm;
            }
            basis.push(w);
        }

        if k_used == 0 {
            return None;
        }

        // Back substitution on the rotated upper-triangular system.
        let mut y = vec![0.0; k_used];
        for i in (0..k_used).rev() {
            let mut sum = g[i];
            for j in i + 1..k_used {
                sum -= h[j][i] * y[j];
            }
            if h[i][i] == 0.0 {
                return None;
            }
            y[i] = sum / h[i][i];
        }
        for (j, yj) in y.iter().enumerate() {
            for (s, bv) in solution.iter_mut().zip(&basis[j]) {
                *s += yj * bv;
            }
        }
        if solution.iter().any(|v| !v.is_finite()) {
            return None;
        }
        if g[k_used].abs() <= tolerance {
            return Some(solution);
        }
        trace!(restart, residual = g[k_used].abs(), "gmres restarting");
    }

    // Inexact step: good enough for a Newton direction.
    Some(solution)
}

/// Newton iteration with the linear step solved by matrix-free GMRES.
///
/// Shares [`IterationStatus`] semantics and step-scaling behavior with
/// [`crate::newton::newton_solve`]; additionally, whenever the accepted
/// (possibly scaled) step still worsens the residual norm — which an
/// inexact direction can do — the step is halved a few times before being
/// taken, keeping the iteration from running away on stiff networks.
pub fn newton_krylov_solve(
    model: &PfNetwork,
    system: &EquationSystem,
    x: &mut StateVector,
    criterion: &dyn StoppingCriterion,
    scaling: &ScalingConfig,
    max_iterations: usize,
    realistic_v: (f64, f64),
) -> IterationReport {
    let mut residual = system.residual(model, x);
    let mut norm = criterion.norm(&residual);
    if criterion.satisfied(&residual) {
        let status = if state_is_realistic(model, system, x, realistic_v) {
            IterationStatus::Converged
        } else {
            IterationStatus::UnrealisticState
        };
        return IterationReport {
            status,
            iterations: 0,
            final_norm: norm,
        };
    }

    for iteration in 1..=max_iterations {
        let rhs: Vec<f64> = residual.iter().map(|r| -r).collect();
        let delta = {
            let base = &residual;
            let x_norm = l2(&x.values);
            let mut apply = |v: &[f64]| -> Vec<f64> {
                let v_norm = l2(v);
                if v_norm == 0.0 {
                    return vec![0.0; v.len()];
                }
                let eps = f64::EPSILON.sqrt() * (1.0 + x_norm) / v_norm;
                let mut shifted = x.clone();
                for (sv, dv) in shifted.values.iter_mut().zip(v) {
                    *sv += eps * dv;
                }
                let fp = system.residual(model, &shifted);
                fp.iter().zip(base).map(|(p, b)| (p - b) / eps).collect()
            };
            match gmres(&mut apply, &rhs, FORCING * l2(&rhs)) {
                Some(delta) => delta,
                None => {
                    debug!(iteration, "gmres breakdown, jacobian operator singular");
                    return IterationReport {
                        status: IterationStatus::SolverFailed,
                        iterations: iteration,
                        final_norm: norm,
                    };
                }
            }
        };

        let mut scale = step_scale(model, system, x, &delta, scaling, criterion, norm);
        // Inexact-direction safeguard: halve until no worse than before.
        for _ in 0..SAFEGUARD_STEPS {
            let trial: Vec<f64> = x
                .values
                .iter()
                .zip(&delta)
                .map(|(v, d)| v + scale * d)
                .collect();
            let trial_norm = criterion.norm(&system.residual(model, &StateVector { values: trial }));
            if trial_norm <= norm || !trial_norm.is_finite() {
                break;
            }
            scale /= 2.0;
        }

        for (value, d) in x.values.iter_mut().zip(&delta) {
            *value += scale * d;
        }
        residual = system.residual(model, x);
        norm = criterion.norm(&residual);
        debug!(iteration, norm, scale, "newton-krylov step");
        if !norm.is_finite() {
            return IterationReport {
                status: IterationStatus::SolverFailed,
                iterations: iteration,
                final_norm: norm,
            };
        }
        if criterion.satisfied(&residual) {
            let status = if state_is_realistic(model, system, x, realistic_v) {
                IterationStatus::Converged
            } else {
                IterationStatus::UnrealisticState
            };
            return IterationReport {
                status,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GaussSolver;
    use crate::config::{NormKind, ScalingConfig};
    use crate::equations::EquationSystem;
    use crate::model::build_components;
    use crate::newton::{newton_solve, UniformCriterion};
    use gridflow_core::*;

    #[test]
    fn test_gmres_solves_small_system() {
        // A = [[4,1],[1,3]], b = [1,2]: x = [1/11, 7/11].
        let a = [[4.0, 1.0], [1.0, 3.0]];
        let mut apply = |v: &[f64]| -> Vec<f64> {
            (0..2)
                .map(|i| a[i][0] * v[0] + a[i][1] * v[1])
                .collect()
        };
        let x = gmres(&mut apply, &[1.0, 2.0], 1e-12).unwrap();
        assert!((x[0] - 1.0 / 11.0).abs() < 1e-9);
        assert!((x[1] - 7.0 / 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_gmres_rejects_singular_operator() {
        // Rank-1 operator with rhs outside its range.
        let mut apply = |v: &[f64]| -> Vec<f64> { vec![v[0] + v[1], v[0] + v[1]] };
        let result = gmres(&mut apply, &[1.0, -1.0], 1e-12);
        assert!(result.is_none() || result.unwrap().iter().all(|v| v.is_finite()));
    }

    fn three_bus() -> Network {
        let mut network = Network::new();
        let b1 = network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(1),
            name: "slack".into(),
            slack: true,
            ..Bus::default()
        }));
        let b2 = network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(2),
            name: "mid".into(),
            ..Bus::default()
        }));
        let b3 = network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(3),
            name: "load".into(),
            ..Bus::default()
        }));
        network.graph.add_node(Node::Gen(
            Gen::new(GenId::new(1), "g1".into(), BusId::new(1)).with_voltage_setpoint(1.0),
        ));
        network.graph.add_node(Node::Load(Load {
            id: LoadId::new(1),
            name: "l1".into(),
            bus: BusId::new(3),
            active_power: Megawatts(60.0),
            reactive_power: Megavars(20.0),
            conform: true,
        }));
        network.graph.add_edge(
            b1,
            b2,
            Edge::Branch(Branch::new(
                BranchId::new(1),
                "1-2".into(),
                BusId::new(1),
                BusId::new(2),
                0.01,
                0.1,
            )),
        );
        network.graph.add_edge(
            b2,
            b3,
            Edge::Branch(Branch::new(
                BranchId::new(2),
                "2-3".into(),
                BusId::new(2),
                BusId::new(3),
                0.02,
                0.15,
            )),
        );
        network
    }

    #[test]
    fn test_agrees_with_direct_newton() {
        let network = three_bus();
        let mut components = build_components(&network, 100.0);
        let model = components.remove(0).unwrap();
        let system = EquationSystem::build(&model).unwrap();
        let criterion = UniformCriterion {
            kind: NormKind::Max,
            tolerance: 1e-10,
        };
        let scaling = ScalingConfig::default();

        let mut x_direct = StateVector::from_model(&model, system.layout());
        let direct = newton_solve(
            &model,
            &system,
            &mut x_direct,
            &mut GaussSolver,
            &criterion,
            &scaling,
            30,
            (0.5, 1.5),
        );
        let mut x_krylov = StateVector::from_model(&model, system.layout());
        let krylov = newton_krylov_solve(
            &model,
            &system,
            &mut x_krylov,
            &criterion,
            &scaling,
            30,
            (0.5, 1.5),
        );

        assert_eq!(direct.status, IterationStatus::Converged);
        assert_eq!(krylov.status, IterationStatus::Converged);
        for (a, b) in x_direct.values.iter().zip(&x_krylov.values) {
            assert!((a - b).abs() < 1e-6, "state mismatch: {a} vs {b}");
        }
    }
}
