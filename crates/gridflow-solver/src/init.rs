//! Voltage initializers: produce the start state for the first Newton pass.
//!
//! A good x₀ is most of the battle on stressed networks. Four strategies,
//! selected by configuration (`Auto` picks the DC approximation when large
//! phase-shifting elements are present, since flat start converges poorly
//! through them):
//!
//! - flat: magnitudes at their targets (1 p.u. elsewhere), angles zero;
//! - DC approximation: angles from one linearized active-power solve;
//! - magnitude-only: magnitudes from one linearized reactive solve;
//! - previous: carry over the last solved state of the same network,
//!   giving 0–1-iteration re-solves after a small perturbation.
//!
//! Initializers read the model and never mutate it.

use crate::backend::LinearSolver;
use crate::cache::CachedState;
use crate::config::InitMode;
use crate::equations::{EquationSystem, StateVector};
use crate::model::PfNetwork;
use sprs::TriMat;
use tracing::{debug, warn};

/// Phase shift (rad) beyond which `Auto` prefers the DC approximation.
const LARGE_PHASE_SHIFT: f64 = 0.1;

fn has_large_phase_shift(model: &PfNetwork) -> bool {
    model
        .branches
        .iter()
        .any(|br| br.enabled() && br.a1.abs() > LARGE_PHASE_SHIFT)
}

/// Magnitudes at voltage targets (or 1 p.u.), angles at zero, auxiliary
/// control variables at their branch constants.
fn flat_state(model: &PfNetwork, system: &EquationSystem) -> StateVector {
    let layout = system.layout();
    let mut x = StateVector::from_model(model, layout);
    for bus in &model.buses {
        x.values[layout.angle(bus.num)] = 0.0;
        x.values[layout.v(bus.num)] = model.voltage_target(bus.num).unwrap_or(1.0);
    }
    x
}

/// One linearized active-power solve for the angles: for every non-reference
/// bus, `Σ_j (θ_i − θ_j)/x_ij = p_i`, with fixed phase shifts moved to the
/// right-hand side. Falls back to the flat angles if the linear system
/// cannot be solved (e.g. a zero-reactance pathological case).
fn dc_angles(
    model: &PfNetwork,
    system: &EquationSystem,
    x: &mut StateVector,
    backend: &mut dyn LinearSolver,
) {
    let layout = system.layout();
    let reference = model.reference;
    // Row/column index per non-reference bus.
    let slot_of = |bus: usize| -> Option<usize> {
        if bus == reference {
            None
        } else if bus < reference {
            Some(bus)
        } else {
            Some(bus - 1)
        }
    };
    let n = model.buses.len().saturating_sub(1);
    if n == 0 {
        return;
    }

    let mut tri = TriMat::new((n, n));
    let mut rhs: Vec<f64> = model
        .buses
        .iter()
        .filter(|b| b.num != reference)
        .map(|b| b.p_target())
        .collect();

    for branch in &model.branches {
        if !branch.enabled() {
            continue;
        }
        let (b1, b2) = (branch.bus1.unwrap(), branch.bus2.unwrap());
        // Susceptance of the series element alone; |b| guards r-only lines.
        let b_series = branch.b.abs();
        if b_series == 0.0 {
            continue;
        }
        let (s1, s2) = (slot_of(b1), slot_of(b2));
        if let Some(i) = s1 {
            tri.add_triplet(i, i, b_series);
            rhs[i] -= b_series * branch.a1;
        }
        if let Some(j) = s2 {
            tri.add_triplet(j, j, b_series);
            rhs[j] += b_series * branch.a1;
        }
        if let (Some(i), Some(j)) = (s1, s2) {
            tri.add_triplet(i, j, -b_series);
            tri.add_triplet(j, i, -b_series);
        }
    }

    match backend.solve(&tri.to_csc(), &rhs) {
        Ok(angles) => {
            for bus in &model.buses {
                if let Some(slot) = slot_of(bus.num) {
                    x.values[layout.angle(bus.num)] = angles[slot];
                }
            }
        }
        Err(err) => warn!(%err, "dc angle estimate failed, keeping flat angles"),
    }
}

/// One linearized reactive solve for the magnitudes: voltage-controlled
/// buses are pinned at their targets, the rest satisfy
/// `Σ_j (v_i − v_j)/x_ij = q_i` around the 1 p.u. operating point.
fn magnitude_estimate(
    model: &PfNetwork,
    system: &EquationSystem,
    x: &mut StateVector,
    backend: &mut dyn LinearSolver,
) {
    let layout = system.layout();
    let free: Vec<usize> = model
        .buses
        .iter()
        .filter(|b| model.voltage_target(b.num).is_none())
        .map(|b| b.num)
        .collect();
    if free.is_empty() {
        return;
    }
    let slot_of = |bus: usize| free.iter().position(|&f| f == bus);

    let n = free.len();
    let mut tri = TriMat::new((n, n));
    let mut rhs: Vec<f64> = free.iter().map(|&b| model.buses[b].q_target()).collect();

    for branch in &model.branches {
        if !branch.enabled() {
            continue;
        }
        let (b1, b2) = (branch.bus1.unwrap(), branch.bus2.unwrap());
        let b_series = branch.b.abs();
        if b_series == 0.0 {
            continue;
        }
        for (this, other) in [(b1, b2), (b2, b1)] {
            let Some(i) = slot_of(this) else { continue };
            tri.add_triplet(i, i, b_series);
            match slot_of(other) {
                Some(j) => tri.add_triplet(i, j, -b_series),
                // Pinned neighbor moves to the right-hand side.
                None => rhs[i] += b_series * x.values[layout.v(other)],
            }
        }
    }

    match backend.solve(&tri.to_csc(), &rhs) {
        Ok(mags) => {
            for (slot, &bus) in free.iter().enumerate() {
                // A linear estimate far from 1 p.u. is worse than flat.
                if (0.5..=1.5).contains(&mags[slot]) {
                    x.values[layout.v(bus)] = mags[slot];
                }
            }
        }
        Err(err) => warn!(%err, "magnitude estimate failed, keeping flat magnitudes"),
    }
}

/// Produce x₀ for a component under the configured strategy.
///
/// `previous` is the cached last-solved state of the same network; buses
/// absent from it (or an absent cache) fall back to flat values.
pub fn initial_state(
    model: &PfNetwork,
    system: &EquationSystem,
    mode: InitMode,
    backend: &mut dyn LinearSolver,
    previous: Option<&CachedState>,
) -> StateVector {
    let mode = match mode {
        InitMode::Auto => {
            if has_large_phase_shift(model) {
                debug!(
                    component = model.component,
                    "large phase shifts present, starting from dc approximation"
                );
                InitMode::DcApprox
            } else {
                InitMode::Flat
            }
        }
        other => other,
    };

    let mut x = flat_state(model, system);
    match mode {
        InitMode::Flat => {}
        InitMode::DcApprox => dc_angles(model, system, &mut x, backend),
        InitMode::MagnitudeOnly => magnitude_estimate(model, system, &mut x, backend),
        InitMode::Previous => {
            let layout = system.layout();
            let mut hits = 0usize;
            if let Some(cached) = previous {
                for &(id, v, angle) in &cached.bus_states {
                    if let Some(bus) = model.bus_index(id) {
                        x.values[layout.v(bus)] = v;
                        x.values[layout.angle(bus)] = angle;
                        hits += 1;
                    }
                }
            }
            if hits == 0 {
                debug!(
                    component = model.component,
                    "no previous state available, falling back to flat start"
                );
            }
        }
        InitMode::Auto => unreachable!("auto resolved above"),
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GaussSolver;
    use crate::equations::EquationSystem;
    use crate::model::build_components;
    use gridflow_core::*;

    fn network(phase_shift: f64) -> Network {
        let mut network = Network::new();
        let b1 = network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(1),
            name: "slack".into(),
            slack: true,
            ..Bus::default()
        }));
        let b2 = network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(2),
            name: "load".into(),
            ..Bus::default()
        }));
        let b3 = network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(3),
            name: "far".into(),
            ..Bus::default()
        }));
        network.graph.add_node(Node::Gen(
            Gen::new(GenId::new(1), "g1".into(), BusId::new(1)).with_voltage_setpoint(1.05),
        ));
        network.graph.add_node(Node::Load(Load {
            id: LoadId::new(1),
            name: "l1".into(),
            bus: BusId::new(3),
            active_power: Megawatts(40.0),
            reactive_power: Megavars(15.0),
            conform: true,
        }));
        network.graph.add_edge(
            b1,
            b2,
            Edge::Branch(
                Branch::new(
                    BranchId::new(1),
                    "1-2".into(),
                    BusId::new(1),
                    BusId::new(2),
                    0.0,
                    0.2,
                )
                .with_tap(1.0, Radians(phase_shift)),
            ),
        );
        network.graph.add_edge(
            b2,
            b3,
            Edge::Branch(Branch::new(
                BranchId::new(2),
                "2-3".into(),
                BusId::new(2),
                BusId::new(3),
                0.0,
                0.25,
            )),
        );
        network
    }

    fn model_and_system(net: &Network) -> (crate::model::PfNetwork, EquationSystem) {
        let mut components = build_components(net, 100.0);
        let model = components.remove(0).unwrap();
        let system = EquationSystem::build(&model).unwrap();
        (model, system)
    }

    #[test]
    fn test_flat_start_uses_targets() {
        let net = network(0.0);
        let (model, system) = model_and_system(&net);
        let x = initial_state(&model, &system, InitMode::Flat, &mut GaussSolver, None);
        let slack = model.bus_index(BusId::new(1)).unwrap();
        let load = model.bus_index(BusId::new(3)).unwrap();
        assert_eq!(x.values[system.layout().v(slack)], 1.05);
        assert_eq!(x.values[system.layout().v(load)], 1.0);
        assert!(x.values.iter().take(model.buses.len()).all(|a| *a == 0.0));
    }

    #[test]
    fn test_auto_picks_dc_for_large_phase_shifts() {
        let net = network(0.3);
        let (model, system) = model_and_system(&net);
        let x = initial_state(&model, &system, InitMode::Auto, &mut GaussSolver, None);
        let far = model.bus_index(BusId::new(3)).unwrap();
        assert!(
            x.values[system.layout().angle(far)] != 0.0,
            "dc estimate should move the angles"
        );
    }

    #[test]
    fn test_dc_angles_satisfy_linear_balance() {
        let net = network(0.0);
        let (model, system) = model_and_system(&net);
        let x = initial_state(&model, &system, InitMode::DcApprox, &mut GaussSolver, None);
        let layout = system.layout();
        // Linearized balance at every non-reference bus: flows equal target.
        for bus in &model.buses {
            if bus.num == model.reference {
                continue;
            }
            let mut flow = 0.0;
            for &br in &bus.branches {
                let branch = &model.branches[br];
                let (b1, b2) = (branch.bus1.unwrap(), branch.bus2.unwrap());
                let psi = x.values[layout.angle(b1)] - x.values[layout.angle(b2)] + branch.a1;
                let sign = if b1 == bus.num { 1.0 } else { -1.0 };
                flow += sign * branch.b.abs() * psi;
            }
            assert!(
                (flow - bus.p_target()).abs() < 1e-9,
                "bus {} linear mismatch {}",
                bus.num,
                flow - bus.p_target()
            );
        }
    }

    #[test]
    fn test_magnitude_only_dips_load_bus() {
        let net = network(0.0);
        let (model, system) = model_and_system(&net);
        let x = initial_state(
            &model,
            &system,
            InitMode::MagnitudeOnly,
            &mut GaussSolver,
            None,
        );
        let load = model.bus_index(BusId::new(3)).unwrap();
        let v = x.values[system.layout().v(load)];
        assert!(v < 1.05 && v > 0.5, "estimate {v} should dip below target");
    }

    #[test]
    fn test_previous_state_applied_per_bus() {
        let net = network(0.0);
        let (model, system) = model_and_system(&net);
        let cached = CachedState {
            bus_states: vec![
                (BusId::new(3), 0.97, -0.08),
                (BusId::new(99), 1.2, 0.5), // unknown bus ignored
            ],
        };
        let x = initial_state(
            &model,
            &system,
            InitMode::Previous,
            &mut GaussSolver,
            Some(&cached),
        );
        let load = model.bus_index(BusId::new(3)).unwrap();
        assert_eq!(x.values[system.layout().v(load)], 0.97);
        assert_eq!(x.values[system.layout().angle(load)], -0.08);
        // Buses absent from the cache keep flat values.
        let slack = model.bus_index(BusId::new(1)).unwrap();
        assert_eq!(x.values[system.layout().v(slack)], 1.05);
    }
}
