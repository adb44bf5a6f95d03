//! Internal per-unit solving model.
//!
//! Built once per connected component from the external
//! [`gridflow_core::Network`]; the numerical layer only ever touches these
//! arena-indexed structures. Buses and branches carry stable `usize`
//! handles so connectivity structures and the equation system can refer to
//! them cheaply across repeated edge toggles.
//!
//! All quantities are per-unit on the configured MVA base. Control modes
//! are explicit enumerated states; an injection moves between them through
//! [`PfInjection::switch_to_reactive_power`]-style transitions driven by the
//! outer loops, never through ad hoc flags.

use gridflow_core::{Branch, BranchId, BusId, ConverterId, Edge, GenId, Network, Node};
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

/// Structural problem detected while assembling a component model.
///
/// These skip the affected component; they never abort the whole run.
#[derive(Debug, Error, Clone)]
pub enum StructuralError {
    #[error("component has no usable slack/reference bus")]
    NoSlackBus,
    #[error("bus {bus} is voltage-controlled to incompatible targets {a} and {b}")]
    ConflictingVoltageTargets { bus: usize, a: f64, b: f64 },
    #[error("equation count {equations} does not match variable count {variables}")]
    CountMismatch { equations: usize, variables: usize },
    #[error("{0}")]
    Other(String),
}

/// Identity of an injection in the external model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InjectionId {
    Gen(GenId),
    Converter(ConverterId),
}

/// Which reactive limit pinned an injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QLimit {
    Min,
    Max,
}

/// Enumerated control state of an injection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlMode {
    /// Holds the voltage magnitude of `controlled_bus` (own or remote) at
    /// `target_v`; reactive output is an implicit unknown.
    Voltage { controlled_bus: usize, target_v: f64 },
    /// Holds a fixed reactive output.
    ReactivePower { target_q: f64 },
}

/// Generator or converter attached to a bus. Owned by its bus; outer loops
/// hold indices, never references.
#[derive(Debug, Clone)]
pub struct PfInjection {
    pub id: InjectionId,
    pub name: String,
    /// Active setpoint (p.u.); mutated by slack distribution/interchange
    pub target_p: f64,
    pub min_p: f64,
    pub max_p: f64,
    pub min_q: f64,
    pub max_q: f64,
    /// Explicit slack-distribution weight; headroom-derived when `None`
    pub participation_factor: Option<f64>,
    pub control: ControlMode,
    /// Set when reactive-limit enforcement pinned this injection
    pub limited_at: Option<QLimit>,
    /// Converters hold their P on the DC side and never absorb slack
    pub dispatchable: bool,
}

impl PfInjection {
    pub fn is_voltage_controlling(&self) -> bool {
        matches!(self.control, ControlMode::Voltage { .. })
    }

    /// Demote to fixed reactive power; records the pinning limit if any.
    /// The caller must re-validate the equation system afterwards.
    pub fn switch_to_reactive_power(&mut self, target_q: f64, limit: Option<QLimit>) {
        self.control = ControlMode::ReactivePower { target_q };
        self.limited_at = limit;
    }
}

/// An electrical node of the internal model.
#[derive(Debug, Clone)]
pub struct PfBus {
    pub num: usize,
    pub id: BusId,
    pub name: String,
    /// Voltage magnitude (p.u., solver state)
    pub v: f64,
    /// Voltage angle (rad, solver state)
    pub angle: f64,
    pub p_load: f64,
    pub q_load: f64,
    /// Portion of `p_load` flagged as conform
    pub conform_p_load: f64,
    pub g_shunt: f64,
    pub b_shunt: f64,
    pub injections: Vec<PfInjection>,
    /// Incident branch handles
    pub branches: Vec<usize>,
    pub area: Option<i64>,
    pub slack_candidate: bool,
}

impl PfBus {
    /// Net specified active injection (p.u.).
    pub fn p_target(&self) -> f64 {
        let gen: f64 = self.injections.iter().map(|i| i.target_p).sum();
        gen - self.p_load
    }

    /// Net specified reactive injection (p.u.), counting only fixed-Q
    /// injections. Only meaningful when no injection controls voltage.
    pub fn q_target(&self) -> f64 {
        let fixed: f64 = self
            .injections
            .iter()
            .map(|i| match i.control {
                ControlMode::ReactivePower { target_q } => target_q,
                ControlMode::Voltage { .. } => 0.0,
            })
            .sum();
        fixed - self.q_load
    }

    /// Fixed reactive output of non-controlling injections (p.u.).
    pub fn fixed_q(&self) -> f64 {
        self.injections
            .iter()
            .filter_map(|i| match i.control {
                ControlMode::ReactivePower { target_q } => Some(target_q),
                ControlMode::Voltage { .. } => None,
            })
            .sum()
    }

    /// Target the bus's own voltage is held at, when some injection
    /// (anywhere) declared it a controlled bus — resolved by the model.
    pub fn has_voltage_controller(&self) -> bool {
        self.injections.iter().any(|i| i.is_voltage_controlling())
    }
}

/// A branch of the internal model, as a two-port on arena handles.
///
/// `r1` is the voltage ratio applied on side 1 (1/tap), `a1` the phase
/// shift. Series admittance is immutable after build; `r1` moves only when
/// a ratio-control variable or a discrete tap step drives it.
#[derive(Debug, Clone)]
pub struct PfBranch {
    pub num: usize,
    pub id: BranchId,
    pub name: String,
    pub bus1: Option<usize>,
    pub bus2: Option<usize>,
    /// Series conductance (p.u.)
    pub g: f64,
    /// Series susceptance (p.u.)
    pub b: f64,
    pub g1: f64,
    pub b1: f64,
    pub g2: f64,
    pub b2: f64,
    /// Voltage ratio on side 1 (1 / tap magnitude)
    pub r1: f64,
    /// Phase shift on side 1 (rad)
    pub a1: f64,
    pub connected1: bool,
    pub connected2: bool,
    pub disconnection_allowed: bool,
    /// Allowed discrete tap magnitudes, if the changer is stepped
    pub tap_steps: Option<Vec<f64>>,
    /// (controlled bus handle, voltage target) for continuous ratio control
    pub ratio_control: Option<(usize, f64)>,
    /// Side-1 active-power target for continuous phase control
    pub phase_control: Option<f64>,
}

impl PfBranch {
    /// A branch participates in the flow equations only when both terminals
    /// exist and are in service. A half-disconnected or dangling branch
    /// contributes nothing, matching structural removal.
    pub fn enabled(&self) -> bool {
        self.connected1 && self.connected2 && self.bus1.is_some() && self.bus2.is_some()
    }
}

/// Independent solving unit: one connected component of the network.
#[derive(Debug, Clone)]
pub struct PfNetwork {
    /// Component ordinal within the parent network
    pub component: usize,
    pub base_mva: f64,
    pub buses: Vec<PfBus>,
    pub branches: Vec<PfBranch>,
    /// Angle-reference and slack bus handle
    pub reference: usize,
    bus_index: HashMap<BusId, usize>,
}

impl PfNetwork {
    pub fn bus_index(&self, id: BusId) -> Option<usize> {
        self.bus_index.get(&id).copied()
    }

    pub fn branch_index(&self, id: BranchId) -> Option<usize> {
        self.branches.iter().position(|b| b.id == id)
    }

    /// Voltage target a bus is held at, if any enabled controller (local
    /// injection, remote injection or ratio-controlling branch) targets it.
    pub fn voltage_target(&self, bus: usize) -> Option<f64> {
        for b in &self.buses {
            for inj in &b.injections {
                if let ControlMode::Voltage {
                    controlled_bus,
                    target_v,
                } = inj.control
                {
                    if controlled_bus == bus {
                        return Some(target_v);
                    }
                }
            }
        }
        for br in &self.branches {
            if let Some((controlled, target)) = br.ratio_control {
                if controlled == bus {
                    return Some(target);
                }
            }
        }
        None
    }

    /// Count of voltage-controlling injections still active in the
    /// component (reactive-limit enforcement may drive this to zero).
    pub fn voltage_controller_count(&self) -> usize {
        self.buses
            .iter()
            .flat_map(|b| b.injections.iter())
            .filter(|i| i.is_voltage_controlling())
            .count()
    }
}

fn branch_from_core(
    num: usize,
    branch: &Branch,
    bus1: Option<usize>,
    bus2: Option<usize>,
) -> PfBranch {
    let r = branch.resistance;
    let x = branch.reactance;
    let d = r * r + x * x;
    // y = 1/(r + jx); zero-impedance branches are rejected by validation
    let (g, b) = if d > 0.0 { (r / d, -x / d) } else { (0.0, 0.0) };
    let b_half = branch.charging_b.value() / 2.0;
    PfBranch {
        num,
        id: branch.id,
        name: branch.name.clone(),
        bus1,
        bus2,
        g,
        b,
        g1: 0.0,
        b1: b_half,
        g2: 0.0,
        b2: b_half,
        r1: if branch.tap_ratio > 0.0 {
            1.0 / branch.tap_ratio
        } else {
            1.0
        },
        a1: branch.phase_shift.value(),
        connected1: branch.connected_from,
        connected2: branch.connected_to,
        disconnection_allowed: branch.disconnection_allowed,
        tap_steps: branch.tap_steps.clone(),
        ratio_control: None,
        phase_control: None,
    }
}

/// Split the external network into independently solvable per-unit
/// components. Components that cannot be assembled (no slack, conflicting
/// local targets) come back as errors, to be skipped by the engine.
pub fn build_components(
    network: &Network,
    base_mva: f64,
) -> Vec<Result<PfNetwork, StructuralError>> {
    // Global bus indexing, in appearance order.
    let mut global_ids: Vec<BusId> = Vec::new();
    let mut global_index: HashMap<BusId, usize> = HashMap::new();
    let mut core_buses = Vec::new();
    for node in network.graph.node_weights() {
        if let Node::Bus(bus) = node {
            global_index.insert(bus.id, global_ids.len());
            global_ids.push(bus.id);
            core_buses.push(bus);
        }
    }
    let n = global_ids.len();

    // Branch endpoints resolved against the global indexing.
    let mut core_branches = Vec::new();
    for edge in network.graph.edge_weights() {
        let Edge::Branch(branch) = edge;
        let b1 = global_index.get(&branch.from_bus).copied();
        let b2 = global_index.get(&branch.to_bus).copied();
        core_branches.push((branch, b1, b2));
    }

    // Connected components over enabled branches (BFS labelling).
    let mut component_of = vec![usize::MAX; n];
    let mut n_components = 0;
    for start in 0..n {
        if component_of[start] != usize::MAX {
            continue;
        }
        let label = n_components;
        n_components += 1;
        let mut stack = vec![start];
        component_of[start] = label;
        while let Some(bus) = stack.pop() {
            for (branch, b1, b2) in &core_branches {
                if !(branch.connected_from && branch.connected_to) {
                    continue;
                }
                if let (Some(i), Some(j)) = (b1, b2) {
                    let other = if *i == bus {
                        *j
                    } else if *j == bus {
                        *i
                    } else {
                        continue;
                    };
                    if component_of[other] == usize::MAX {
                        component_of[other] = label;
                        stack.push(other);
                    }
                }
            }
        }
    }

    (0..n_components)
        .map(|component| {
            build_component(
                network,
                base_mva,
                component,
                &component_of,
                &core_buses,
                &core_branches,
            )
        })
        .collect()
}

fn build_component(
    network: &Network,
    base_mva: f64,
    component: usize,
    component_of: &[usize],
    core_buses: &[&gridflow_core::Bus],
    core_branches: &[(&Branch, Option<usize>, Option<usize>)],
) -> Result<PfNetwork, StructuralError> {
    let sb = base_mva;

    // Local bus arena.
    let mut buses = Vec::new();
    let mut bus_index = HashMap::new();
    let mut local_of_global: HashMap<usize, usize> = HashMap::new();
    for (global, bus) in core_buses.iter().enumerate() {
        if component_of[global] != component {
            continue;
        }
        let num = buses.len();
        local_of_global.insert(global, num);
        bus_index.insert(bus.id, num);
        buses.push(PfBus {
            num,
            id: bus.id,
            name: bus.name.clone(),
            v: bus.voltage_pu.value(),
            angle: bus.angle_rad.value(),
            p_load: 0.0,
            q_load: 0.0,
            conform_p_load: 0.0,
            g_shunt: 0.0,
            b_shunt: 0.0,
            injections: Vec::new(),
            branches: Vec::new(),
            area: bus.area_id,
            slack_candidate: bus.slack,
        });
    }

    // Loads and shunts aggregate onto their bus.
    for node in network.graph.node_weights() {
        match node {
            Node::Load(load) => {
                if let Some(&b) = bus_index.get(&load.bus) {
                    let p = load.active_power.value() / sb;
                    buses[b].p_load += p;
                    buses[b].q_load += load.reactive_power.value() / sb;
                    if load.conform {
                        buses[b].conform_p_load += p;
                    }
                }
            }
            Node::Shunt(shunt) if shunt.status => {
                if let Some(&b) = bus_index.get(&shunt.bus) {
                    buses[b].g_shunt += shunt.gs_pu;
                    buses[b].b_shunt += shunt.bs_pu;
                }
            }
            _ => {}
        }
    }

    // Injections: generators and converter terminals share one shape.
    for node in network.graph.node_weights() {
        let (id, name, bus_id, target_p, min_p, max_p, min_q, max_q, setpoint, regulated, target_q, factor, dispatchable) =
            match node {
                Node::Gen(g) if g.status => (
                    InjectionId::Gen(g.id),
                    g.name.clone(),
                    g.bus,
                    g.target_p.value() / sb,
                    g.pmin.value() / sb,
                    g.pmax.value() / sb,
                    g.qmin.value() / sb,
                    g.qmax.value() / sb,
                    g.voltage_setpoint,
                    g.regulated_bus,
                    g.target_q,
                    g.participation_factor,
                    true,
                ),
                Node::Converter(c) if c.status => (
                    InjectionId::Converter(c.id),
                    c.name.clone(),
                    c.bus,
                    c.target_p.value() / sb,
                    f64::NEG_INFINITY,
                    f64::INFINITY,
                    c.qmin.value() / sb,
                    c.qmax.value() / sb,
                    c.voltage_setpoint,
                    None,
                    c.target_q,
                    None,
                    false,
                ),
                _ => continue,
            };
        let Some(&b) = bus_index.get(&bus_id) else {
            continue;
        };
        let fallback_q = target_q.map(|q| q.value() / sb).unwrap_or(0.0);
        let control = match setpoint {
            Some(v) => {
                let controlled = regulated.and_then(|r| bus_index.get(&r).copied());
                match (regulated, controlled) {
                    (Some(r), None) => {
                        warn!(
                            injection = %name,
                            regulated_bus = r.value(),
                            "regulated bus outside component, falling back to fixed reactive power"
                        );
                        ControlMode::ReactivePower {
                            target_q: fallback_q,
                        }
                    }
                    (_, controlled) => ControlMode::Voltage {
                        controlled_bus: controlled.unwrap_or(b),
                        target_v: v.value(),
                    },
                }
            }
            None => ControlMode::ReactivePower {
                target_q: fallback_q,
            },
        };
        buses[b].injections.push(PfInjection {
            id,
            name,
            target_p,
            min_p,
            max_p,
            min_q,
            max_q,
            participation_factor: factor,
            control,
            limited_at: None,
            dispatchable,
        });
    }

    // Local controllers of one bus must agree on the target: two injections
    // solely holding a bus at different voltages is structurally singular.
    for bus in &buses {
        let mut target: Option<f64> = None;
        for inj in &bus.injections {
            if let ControlMode::Voltage {
                controlled_bus,
                target_v,
            } = inj.control
            {
                if controlled_bus == bus.num {
                    match target {
                        None => target = Some(target_v),
                        Some(t) if (t - target_v).abs() > 1e-9 => {
                            return Err(StructuralError::ConflictingVoltageTargets {
                                bus: bus.num,
                                a: t,
                                b: target_v,
                            });
                        }
                        Some(_) => {}
                    }
                }
            }
        }
    }

    // One voltage equation per controlled bus, and one controlled bus per
    // controller bus (a controller bus carries a single voltage-equation
    // slot): claims beyond the first are demoted here and reported by the
    // voltage-control feasibility pass.
    let mut claimed: HashMap<usize, usize> = HashMap::new(); // controlled -> controller bus
    for b in 0..buses.len() {
        let mut first_controlled: Option<usize> = None;
        for i in 0..buses[b].injections.len() {
            if let ControlMode::Voltage { controlled_bus, .. } = buses[b].injections[i].control {
                if first_controlled.is_some_and(|c| c != controlled_bus) {
                    warn!(
                        injection = %buses[b].injections[i].name,
                        controlled_bus,
                        "controller bus already regulates another bus, demoting to fixed reactive power"
                    );
                    buses[b].injections[i].switch_to_reactive_power(0.0, None);
                    continue;
                }
                match claimed.get(&controlled_bus) {
                    None => {
                        claimed.insert(controlled_bus, b);
                        first_controlled = Some(controlled_bus);
                    }
                    Some(&owner) if owner == b => {
                        first_controlled = Some(controlled_bus);
                    }
                    Some(&owner) => {
                        warn!(
                            injection = %buses[b].injections[i].name,
                            controlled_bus,
                            owner_bus = owner,
                            "bus already voltage-controlled from another bus, demoting to fixed reactive power"
                        );
                        buses[b].injections[i].switch_to_reactive_power(0.0, None);
                    }
                }
            }
        }
    }

    // Branch arena, endpoints re-mapped to local handles.
    let mut branches = Vec::new();
    for (branch, gb1, gb2) in core_branches {
        let b1 = gb1.and_then(|g| local_of_global.get(&g).copied());
        let b2 = gb2.and_then(|g| local_of_global.get(&g).copied());
        if b1.is_none() && b2.is_none() {
            continue;
        }
        let num = branches.len();
        let mut pf = branch_from_core(num, branch, b1, b2);
        if let Some(rc) = &branch.ratio_control {
            if let Some(&controlled) = bus_index.get(&rc.controlled_bus) {
                if !claimed.contains_key(&controlled) {
                    pf.ratio_control = Some((controlled, rc.target_v.value()));
                }
            }
        }
        if let Some(pc) = &branch.phase_control {
            pf.phase_control = Some(pc.target_p.value() / sb);
        }
        if let Some(b) = b1 {
            buses[b].branches.push(num);
        }
        if let Some(b) = b2 {
            buses[b].branches.push(num);
        }
        branches.push(pf);
    }

    // Reference/slack selection: explicit designation first, then the first
    // voltage-controlled bus. A component with neither is not solvable.
    let reference = buses
        .iter()
        .position(|b| b.slack_candidate)
        .or_else(|| buses.iter().position(|b| b.has_voltage_controller()))
        .ok_or(StructuralError::NoSlackBus)?;

    Ok(PfNetwork {
        component,
        base_mva,
        buses,
        branches,
        reference,
        bus_index,
    })
}
