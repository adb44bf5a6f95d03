//! Equation system: physical and control laws as residuals and partials.
//!
//! For every active state variable there is exactly one equation, kept in
//! slot order (row `i` of the Jacobian belongs to the equation sitting on
//! variable slot `i`). Structural changes — a generator losing voltage
//! control, a tap changer being frozen — replace the equation at a slot
//! through [`EquationSystem::swap_equation`], which re-validates the size
//! invariant. Losing that invariant means the configuration is structurally
//! singular and the component must be skipped, not solved.
//!
//! Equations are sums of small tagged terms ([`EquationTerm`]); a term is
//! owned by exactly one equation but may read shared state such as a
//! remotely controlled bus voltage.

pub mod terms;

use crate::model::{ControlMode, PfNetwork, StructuralError};
use sprs::{CsMat, TriMat};
use std::collections::{HashMap, HashSet};
use terms::{branch_flow_with, flow_derivatives};

/// One unknown of the state vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableKind {
    /// Voltage angle of a bus (rad)
    BusAngle(usize),
    /// Voltage magnitude of a bus (p.u.)
    BusV(usize),
    /// Phase shift of a phase-controlling branch (rad)
    BranchAlpha(usize),
    /// Voltage ratio of a ratio-controlling branch
    BranchRho(usize),
}

/// Ordered variable layout: bus angles, then bus magnitudes, then auxiliary
/// branch control variables.
#[derive(Debug, Clone)]
pub struct VarLayout {
    n_bus: usize,
    vars: Vec<VariableKind>,
    index: HashMap<VariableKind, usize>,
}

impl VarLayout {
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    #[inline]
    pub fn angle(&self, bus: usize) -> usize {
        bus
    }

    #[inline]
    pub fn v(&self, bus: usize) -> usize {
        self.n_bus + bus
    }

    pub fn alpha(&self, branch: usize) -> Option<usize> {
        self.index.get(&VariableKind::BranchAlpha(branch)).copied()
    }

    pub fn rho(&self, branch: usize) -> Option<usize> {
        self.index.get(&VariableKind::BranchRho(branch)).copied()
    }

    pub fn kind(&self, slot: usize) -> VariableKind {
        self.vars[slot]
    }

    pub fn n_bus(&self) -> usize {
        self.n_bus
    }
}

/// Dense vector of unknowns, laid out per [`VarLayout`].
#[derive(Debug, Clone)]
pub struct StateVector {
    pub values: Vec<f64>,
}

impl StateVector {
    /// Snapshot the model's current state.
    pub fn from_model(model: &PfNetwork, layout: &VarLayout) -> Self {
        let mut values = vec![0.0; layout.len()];
        for bus in &model.buses {
            values[layout.angle(bus.num)] = bus.angle;
            values[layout.v(bus.num)] = bus.v;
        }
        for branch in &model.branches {
            if let Some(col) = layout.alpha(branch.num) {
                values[col] = branch.a1;
            }
            if let Some(col) = layout.rho(branch.num) {
                values[col] = branch.r1;
            }
        }
        Self { values }
    }

    /// Write the solved state back onto the model.
    pub fn apply_to_model(&self, model: &mut PfNetwork, layout: &VarLayout) {
        for bus in &mut model.buses {
            bus.angle = self.values[layout.angle(bus.num)];
            bus.v = self.values[layout.v(bus.num)];
        }
        for branch in &mut model.branches {
            if let Some(col) = layout.alpha(branch.num) {
                branch.a1 = self.values[col];
            }
            if let Some(col) = layout.rho(branch.num) {
                branch.r1 = self.values[col];
            }
        }
    }
}

/// Law instance attached to a variable slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EquationKind {
    /// Nodal active power balance of a bus
    BusP(usize),
    /// Nodal reactive power balance of a bus
    BusQ(usize),
    /// A bus voltage magnitude equals its target (local or remote control)
    BusV { controlled: usize },
    /// The reference bus angle is zero
    RefAngle(usize),
    /// Side-1 active flow of a phase-controlling branch equals its target
    BranchP(usize),
    /// The branch voltage ratio is frozen at the model's value (a discrete
    /// tap snapped to its step keeps its variable slot but stops moving)
    TapPosition(usize),
}

/// Atomic contribution to an equation's residual.
#[derive(Debug, Clone, Copy)]
pub enum EquationTerm {
    BranchP1(usize),
    BranchQ1(usize),
    BranchP2(usize),
    BranchQ2(usize),
    ShuntP(usize),
    ShuntQ(usize),
    Voltage(usize),
    Angle(usize),
    Rho(usize),
}

impl EquationTerm {
    fn eval(&self, model: &PfNetwork, x: &StateVector, layout: &VarLayout) -> f64 {
        match *self {
            EquationTerm::BranchP1(br)
            | EquationTerm::BranchQ1(br)
            | EquationTerm::BranchP2(br)
            | EquationTerm::BranchQ2(br) => {
                let branch = &model.branches[br];
                if !branch.enabled() {
                    return 0.0;
                }
                let (b1, b2) = (branch.bus1.unwrap(), branch.bus2.unwrap());
                let r1 = layout
                    .rho(br)
                    .map(|c| x.values[c])
                    .unwrap_or(branch.r1);
                let a1 = layout
                    .alpha(br)
                    .map(|c| x.values[c])
                    .unwrap_or(branch.a1);
                let flow = branch_flow_with(
                    branch,
                    x.values[layout.v(b1)],
                    x.values[layout.angle(b1)],
                    x.values[layout.v(b2)],
                    x.values[layout.angle(b2)],
                    r1,
                    a1,
                );
                match self {
                    EquationTerm::BranchP1(_) => flow.p1,
                    EquationTerm::BranchQ1(_) => flow.q1,
                    EquationTerm::BranchP2(_) => flow.p2,
                    EquationTerm::BranchQ2(_) => flow.q2,
                    _ => unreachable!(),
                }
            }
            EquationTerm::ShuntP(bus) => {
                let v = x.values[layout.v(bus)];
                model.buses[bus].g_shunt * v * v
            }
            EquationTerm::ShuntQ(bus) => {
                let v = x.values[layout.v(bus)];
                -model.buses[bus].b_shunt * v * v
            }
            EquationTerm::Voltage(bus) => x.values[layout.v(bus)],
            EquationTerm::Angle(bus) => x.values[layout.angle(bus)],
            EquationTerm::Rho(br) => layout
                .rho(br)
                .map(|c| x.values[c])
                .unwrap_or(model.branches[br].r1),
        }
    }

    fn derivatives(
        &self,
        model: &PfNetwork,
        x: &StateVector,
        layout: &VarLayout,
        out: &mut Vec<(usize, f64)>,
    ) {
        match *self {
            EquationTerm::BranchP1(br)
            | EquationTerm::BranchQ1(br)
            | EquationTerm::BranchP2(br)
            | EquationTerm::BranchQ2(br) => {
                let branch = &model.branches[br];
                if !branch.enabled() {
                    return;
                }
                let (b1, b2) = (branch.bus1.unwrap(), branch.bus2.unwrap());
                let rho_col = layout.rho(br);
                let alpha_col = layout.alpha(br);
                let r1 = rho_col.map(|c| x.values[c]).unwrap_or(branch.r1);
                let a1 = alpha_col.map(|c| x.values[c]).unwrap_or(branch.a1);
                let d = flow_derivatives(
                    branch,
                    x.values[layout.v(b1)],
                    x.values[layout.angle(b1)],
                    x.values[layout.v(b2)],
                    x.values[layout.angle(b2)],
                    r1,
                    a1,
                );
                let (dv1, dv2, dpsi, dr1) = match self {
                    EquationTerm::BranchP1(_) => (d.dp1_dv1, d.dp1_dv2, d.dp1_dpsi, d.dp1_dr1),
                    EquationTerm::BranchQ1(_) => (d.dq1_dv1, d.dq1_dv2, d.dq1_dpsi, d.dq1_dr1),
                    EquationTerm::BranchP2(_) => (d.dp2_dv1, d.dp2_dv2, d.dp2_dpsi, d.dp2_dr1),
                    EquationTerm::BranchQ2(_) => (d.dq2_dv1, d.dq2_dv2, d.dq2_dpsi, d.dq2_dr1),
                    _ => unreachable!(),
                };
                out.push((layout.v(b1), dv1));
                out.push((layout.v(b2), dv2));
                out.push((layout.angle(b1), dpsi));
                out.push((layout.angle(b2), -dpsi));
                if let Some(col) = alpha_col {
                    out.push((col, dpsi));
                }
                if let Some(col) = rho_col {
                    out.push((col, dr1));
                }
            }
            EquationTerm::ShuntP(bus) => {
                let v = x.values[layout.v(bus)];
                out.push((layout.v(bus), 2.0 * model.buses[bus].g_shunt * v));
            }
            EquationTerm::ShuntQ(bus) => {
                let v = x.values[layout.v(bus)];
                out.push((layout.v(bus), -2.0 * model.buses[bus].b_shunt * v));
            }
            EquationTerm::Voltage(bus) => out.push((layout.v(bus), 1.0)),
            EquationTerm::Angle(bus) => out.push((layout.angle(bus), 1.0)),
            EquationTerm::Rho(br) => {
                if let Some(col) = layout.rho(br) {
                    out.push((col, 1.0));
                }
            }
        }
    }
}

/// One equation: a law instance plus the terms summed into its residual.
#[derive(Debug, Clone)]
pub struct Equation {
    pub kind: EquationKind,
    pub terms: Vec<EquationTerm>,
}

/// The full square system over a component.
#[derive(Debug, Clone)]
pub struct EquationSystem {
    layout: VarLayout,
    equations: Vec<Equation>,
}

fn bus_p_terms(model: &PfNetwork, bus: usize) -> Vec<EquationTerm> {
    let mut out = Vec::new();
    for &br in &model.buses[bus].branches {
        let branch = &model.branches[br];
        if branch.bus1 == Some(bus) {
            out.push(EquationTerm::BranchP1(br));
        }
        if branch.bus2 == Some(bus) {
            out.push(EquationTerm::BranchP2(br));
        }
    }
    if model.buses[bus].g_shunt != 0.0 {
        out.push(EquationTerm::ShuntP(bus));
    }
    out
}

fn bus_q_terms(model: &PfNetwork, bus: usize) -> Vec<EquationTerm> {
    let mut out = Vec::new();
    for &br in &model.buses[bus].branches {
        let branch = &model.branches[br];
        if branch.bus1 == Some(bus) {
            out.push(EquationTerm::BranchQ1(br));
        }
        if branch.bus2 == Some(bus) {
            out.push(EquationTerm::BranchQ2(br));
        }
    }
    if model.buses[bus].b_shunt != 0.0 {
        out.push(EquationTerm::ShuntQ(bus));
    }
    out
}

fn make_equation(kind: EquationKind, model: &PfNetwork) -> Equation {
    let terms = match kind {
        EquationKind::BusP(b) => bus_p_terms(model, b),
        EquationKind::BusQ(b) => bus_q_terms(model, b),
        EquationKind::BusV { controlled } => vec![EquationTerm::Voltage(controlled)],
        EquationKind::RefAngle(b) => vec![EquationTerm::Angle(b)],
        EquationKind::BranchP(br) => vec![EquationTerm::BranchP1(br)],
        EquationKind::TapPosition(br) => vec![EquationTerm::Rho(br)],
    };
    Equation { kind, terms }
}

impl EquationSystem {
    /// Assemble the system for a component model, failing fast on any
    /// structurally singular configuration.
    pub fn build(model: &PfNetwork) -> Result<Self, StructuralError> {
        let n_bus = model.buses.len();
        let mut vars = Vec::with_capacity(2 * n_bus);
        for b in 0..n_bus {
            vars.push(VariableKind::BusAngle(b));
        }
        for b in 0..n_bus {
            vars.push(VariableKind::BusV(b));
        }
        for branch in &model.branches {
            if branch.phase_control.is_some() && branch.enabled() {
                vars.push(VariableKind::BranchAlpha(branch.num));
            }
        }
        for branch in &model.branches {
            if branch.ratio_control.is_some() && branch.enabled() {
                vars.push(VariableKind::BranchRho(branch.num));
            }
        }
        let index = vars
            .iter()
            .enumerate()
            .map(|(i, &k)| (k, i))
            .collect::<HashMap<_, _>>();
        let layout = VarLayout {
            n_bus,
            vars,
            index,
        };

        let mut equations = Vec::with_capacity(layout.len());
        for b in 0..n_bus {
            let kind = if b == model.reference {
                EquationKind::RefAngle(b)
            } else {
                EquationKind::BusP(b)
            };
            equations.push(make_equation(kind, model));
        }
        for b in 0..n_bus {
            let controlled = model.buses[b].injections.iter().find_map(|i| match i.control {
                ControlMode::Voltage { controlled_bus, .. } => Some(controlled_bus),
                ControlMode::ReactivePower { .. } => None,
            });
            let kind = match controlled {
                Some(c) => EquationKind::BusV { controlled: c },
                None => EquationKind::BusQ(b),
            };
            equations.push(make_equation(kind, model));
        }
        for slot in 2 * n_bus..layout.len() {
            let kind = match layout.kind(slot) {
                VariableKind::BranchAlpha(br) => EquationKind::BranchP(br),
                VariableKind::BranchRho(br) => {
                    let (controlled, _) = model.branches[br]
                        .ratio_control
                        .expect("rho variable implies ratio control");
                    EquationKind::BusV { controlled }
                }
                _ => unreachable!("auxiliary slots start after bus slots"),
            };
            equations.push(make_equation(kind, model));
        }

        let system = Self { layout, equations };
        system.validate()?;
        Ok(system)
    }

    /// Check the one-equation-per-variable invariant and reject duplicate
    /// voltage-target rows (identical rows make the Jacobian singular).
    pub fn validate(&self) -> Result<(), StructuralError> {
        if self.equations.len() != self.layout.len() {
            return Err(StructuralError::CountMismatch {
                equations: self.equations.len(),
                variables: self.layout.len(),
            });
        }
        let mut controlled_seen = HashSet::new();
        let mut references = 0usize;
        for eq in &self.equations {
            match eq.kind {
                EquationKind::BusV { controlled } => {
                    if !controlled_seen.insert(controlled) {
                        return Err(StructuralError::Other(format!(
                            "bus {controlled} is targeted by more than one voltage equation"
                        )));
                    }
                }
                EquationKind::RefAngle(_) => references += 1,
                _ => {}
            }
        }
        if references != 1 {
            return Err(StructuralError::Other(format!(
                "expected exactly one angle-reference equation, found {references}"
            )));
        }
        Ok(())
    }

    /// Replace the equation at a slot (control-mode switching), preserving
    /// the size invariant or failing.
    pub fn swap_equation(
        &mut self,
        slot: usize,
        kind: EquationKind,
        model: &PfNetwork,
    ) -> Result<(), StructuralError> {
        self.equations[slot] = make_equation(kind, model);
        self.validate()
    }

    pub fn layout(&self) -> &VarLayout {
        &self.layout
    }

    pub fn equations(&self) -> &[Equation] {
        &self.equations
    }

    /// Slot index of a bus's voltage-magnitude equation/variable.
    pub fn v_slot(&self, bus: usize) -> usize {
        self.layout.v(bus)
    }

    fn target(&self, kind: EquationKind, model: &PfNetwork) -> f64 {
        match kind {
            EquationKind::BusP(b) => model.buses[b].p_target(),
            EquationKind::BusQ(b) => model.buses[b].q_target(),
            EquationKind::BusV { controlled } => {
                debug_assert!(model.voltage_target(controlled).is_some());
                model.voltage_target(controlled).unwrap_or(1.0)
            }
            EquationKind::RefAngle(_) => 0.0,
            EquationKind::BranchP(br) => model.branches[br].phase_control.unwrap_or(0.0),
            EquationKind::TapPosition(br) => model.branches[br].r1,
        }
    }

    /// Residual vector F(x); targets are read live from the model so outer
    /// loops can move setpoints without a structural rebuild.
    pub fn residual(&self, model: &PfNetwork, x: &StateVector) -> Vec<f64> {
        self.equations
            .iter()
            .map(|eq| {
                let sum: f64 = eq
                    .terms
                    .iter()
                    .map(|t| t.eval(model, x, &self.layout))
                    .sum();
                sum - self.target(eq.kind, model)
            })
            .collect()
    }

    /// Sparse Jacobian dF/dx in column-compressed storage.
    pub fn jacobian(&self, model: &PfNetwork, x: &StateVector) -> CsMat<f64> {
        let n = self.layout.len();
        let mut tri = TriMat::new((n, n));
        let mut derivs = Vec::new();
        for (row, eq) in self.equations.iter().enumerate() {
            for term in &eq.terms {
                derivs.clear();
                term.derivatives(model, x, &self.layout, &mut derivs);
                for &(col, val) in &derivs {
                    if val != 0.0 {
                        tri.add_triplet(row, col, val);
                    }
                }
            }
        }
        tri.to_csc()
    }
}

/// Active-power mismatch at a bus for the current state (used for the
/// slack residual, which has no equation of its own).
pub fn bus_p_mismatch(model: &PfNetwork, x: &StateVector, layout: &VarLayout, bus: usize) -> f64 {
    let calc: f64 = bus_p_terms(model, bus)
        .iter()
        .map(|t| t.eval(model, x, layout))
        .sum();
    calc - model.buses[bus].p_target()
}

/// Reactive power flowing out of a bus into the network (flows + shunt)
/// for the current state; used to recover generator reactive outputs.
pub fn bus_q_calc(model: &PfNetwork, x: &StateVector, layout: &VarLayout, bus: usize) -> f64 {
    bus_q_terms(model, bus)
        .iter()
        .map(|t| t.eval(model, x, layout))
        .sum()
}

/// Flow on a branch for the given state, honoring any control variables
/// that override the branch's ratio/phase constants. `None` for disabled
/// or dangling branches, which carry no flow.
pub fn branch_flow_at(
    model: &PfNetwork,
    x: &StateVector,
    layout: &VarLayout,
    br: usize,
) -> Option<terms::BranchFlow> {
    let branch = &model.branches[br];
    if !branch.enabled() {
        return None;
    }
    let (b1, b2) = (branch.bus1?, branch.bus2?);
    let r1 = layout.rho(br).map(|c| x.values[c]).unwrap_or(branch.r1);
    let a1 = layout.alpha(br).map(|c| x.values[c]).unwrap_or(branch.a1);
    Some(branch_flow_with(
        branch,
        x.values[layout.v(b1)],
        x.values[layout.angle(b1)],
        x.values[layout.v(b2)],
        x.values[layout.angle(b2)],
        r1,
        a1,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::build_components;
    use gridflow_core::*;

    fn three_bus_network() -> Network {
        let mut network = Network::new();
        let b1 = network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(1),
            name: "slack".into(),
            slack: true,
            ..Bus::default()
        }));
        let b2 = network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(2),
            name: "pv".into(),
            ..Bus::default()
        }));
        let b3 = network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(3),
            name: "pq".into(),
            ..Bus::default()
        }));
        network.graph.add_node(Node::Gen(
            Gen::new(GenId::new(1), "g1".into(), BusId::new(1)).with_voltage_setpoint(1.0),
        ));
        network.graph.add_node(Node::Gen(
            Gen::new(GenId::new(2), "g2".into(), BusId::new(2))
                .with_voltage_setpoint(1.02)
                .with_target_p(40.0),
        ));
        network.graph.add_node(Node::Load(Load {
            id: LoadId::new(1),
            name: "l1".into(),
            bus: BusId::new(3),
            active_power: Megawatts(90.0),
            reactive_power: Megavars(30.0),
            conform: true,
        }));
        network.graph.add_node(Node::Shunt(Shunt {
            id: ShuntId::new(1),
            name: "sh".into(),
            bus: BusId::new(3),
            gs_pu: 0.0,
            bs_pu: 0.05,
            status: true,
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
                    0.01,
                    0.1,
                )
                .with_charging(0.02),
            ),
        );
        network.graph.add_edge(
            b2,
            b3,
            Edge::Branch(
                Branch::new(
                    BranchId::new(2),
                    "2-3".into(),
                    BusId::new(2),
                    BusId::new(3),
                    0.02,
                    0.2,
                )
                .with_tap(1.05, Radians(0.05)),
            ),
        );
        network.graph.add_edge(
            b1,
            b3,
            Edge::Branch(Branch::new(
                BranchId::new(3),
                "1-3".into(),
                BusId::new(1),
                BusId::new(3),
                0.015,
                0.15,
            )),
        );
        network
    }

    fn system_for(network: &Network) -> (crate::model::PfNetwork, EquationSystem) {
        let mut components = build_components(network, 100.0);
        let model = components.remove(0).unwrap();
        let system = EquationSystem::build(&model).unwrap();
        (model, system)
    }

    #[test]
    fn test_build_structure() {
        let network = three_bus_network();
        let (model, system) = system_for(&network);
        assert_eq!(system.layout().len(), 6);
        assert_eq!(system.equations().len(), 6);
        // Reference bus angle slot carries the reference equation.
        assert!(matches!(
            system.equations()[model.reference].kind,
            EquationKind::RefAngle(_)
        ));
        // Both generator buses hold voltage equations; the load bus holds
        // a reactive balance.
        let v_kinds: Vec<_> = (0..3)
            .map(|b| system.equations()[system.v_slot(b)].kind)
            .collect();
        assert!(matches!(v_kinds[0], EquationKind::BusV { controlled: 0 }));
        assert!(matches!(v_kinds[1], EquationKind::BusV { controlled: 1 }));
        assert!(matches!(v_kinds[2], EquationKind::BusQ(2)));
    }

    #[test]
    fn test_residual_at_flat_start() {
        let network = three_bus_network();
        let (model, system) = system_for(&network);
        let x = StateVector::from_model(&model, system.layout());
        let residual = system.residual(&model, &x);
        // Voltage equations: flat start is 1.0 p.u. everywhere, so the PV
        // bus target of 1.02 leaves a -0.02 residual.
        assert!((residual[system.v_slot(1)] - (1.0 - 1.02)).abs() < 1e-12);
        // The load bus reactive equation sees the full load plus shunt.
        let load_bus_row = system.v_slot(2);
        assert!(residual[load_bus_row].is_finite());
        // Reference angle residual is zero at angle zero.
        assert_eq!(residual[model.reference], 0.0);
    }

    #[test]
    fn test_jacobian_matches_finite_differences() {
        let network = three_bus_network();
        let (model, system) = system_for(&network);
        let mut x = StateVector::from_model(&model, system.layout());
        // Move off the flat start so no derivative vanishes by symmetry.
        for (i, v) in x.values.iter_mut().enumerate() {
            *v += 0.01 * (i as f64 + 1.0) * if i % 2 == 0 { 1.0 } else { -1.0 };
        }
        let jac = system.jacobian(&model, &x);
        let base = system.residual(&model, &x);
        let eps = 1e-7;
        for col in 0..system.layout().len() {
            let mut xp = x.clone();
            xp.values[col] += eps;
            let shifted = system.residual(&model, &xp);
            for row in 0..system.layout().len() {
                let numeric = (shifted[row] - base[row]) / eps;
                let analytic = jac.get(row, col).copied().unwrap_or(0.0);
                assert!(
                    (analytic - numeric).abs() < 1e-5,
                    "J[{row},{col}]: analytic {analytic} vs numeric {numeric}"
                );
            }
        }
    }

    #[test]
    fn test_swap_preserves_invariant() {
        let network = three_bus_network();
        let (model, mut system) = system_for(&network);
        let slot = system.v_slot(1);
        system
            .swap_equation(slot, EquationKind::BusQ(1), &model)
            .unwrap();
        assert!(matches!(
            system.equations()[slot].kind,
            EquationKind::BusQ(1)
        ));
        assert!(system.validate().is_ok());
    }

    #[test]
    fn test_duplicate_voltage_target_rejected() {
        let network = three_bus_network();
        let (model, mut system) = system_for(&network);
        // Point the PV bus equation at the slack's controlled bus: two rows
        // now target bus 0, which is structurally singular.
        let result = system.swap_equation(
            system.v_slot(1),
            EquationKind::BusV { controlled: 0 },
            &model,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_aux_variables_for_controlled_branches() {
        let mut network = three_bus_network();
        {
            let branch = network.branch_mut(BranchId::new(3)).unwrap();
            branch.phase_control = Some(PhaseControl {
                target_p: Megawatts(20.0),
            });
        }
        let (model, system) = system_for(&network);
        assert_eq!(system.layout().len(), 7);
        let br = model.branch_index(BranchId::new(3)).unwrap();
        let col = system.layout().alpha(br).unwrap();
        assert!(matches!(
            system.equations()[col].kind,
            EquationKind::BranchP(_)
        ));
    }

    #[test]
    fn test_disabled_branch_contributes_nothing() {
        let network = three_bus_network();
        let (mut model, system) = system_for(&network);
        let x = StateVector::from_model(&model, system.layout());
        let br = model.branch_index(BranchId::new(3)).unwrap();
        model.branches[br].connected1 = false;
        let jac = system.jacobian(&model, &x);
        // Row of bus 3's P equation no longer couples to bus 1 through
        // branch 1-3 (their only direct link).
        let bus1 = model.bus_index(BusId::new(1)).unwrap();
        let bus3 = model.bus_index(BusId::new(3)).unwrap();
        let coupling = jac
            .get(bus3, system.layout().angle(bus1))
            .copied()
            .unwrap_or(0.0);
        assert_eq!(coupling, 0.0);
    }
}
