//! # gridflow-core: Transmission Network Model
//!
//! Data structures for the external description of a transmission network,
//! consumed (and written back to) by the `gridflow-solver` crate.
//!
//! Networks are **undirected multigraphs**:
//! - **Nodes**: buses, and the injections attached to them (generators,
//!   loads, shunts, HVDC converter terminals)
//! - **Edges**: branches (lines and transformers, including controllable
//!   ratio/phase devices)
//!
//! The graph keeps topology explicit for island detection and lets parallel
//! branches between the same pair of buses coexist. Solved voltage
//! magnitude/angle live on [`Bus`] and are updated by the solver through
//! [`Network::apply_bus_state`] after a successful solve; the numerical
//! layer never stores results anywhere else in this crate.
//!
//! ## Quick start
//!
//! ```rust
//! use gridflow_core::*;
//!
//! let mut network = Network::new();
//! let b1 = network.graph.add_node(Node::Bus(Bus {
//!     id: BusId::new(1),
//!     name: "Bus 1".to_string(),
//!     base_kv: Kilovolts(400.0),
//!     slack: true,
//!     ..Bus::default()
//! }));
//! let b2 = network.graph.add_node(Node::Bus(Bus {
//!     id: BusId::new(2),
//!     name: "Bus 2".to_string(),
//!     base_kv: Kilovolts(400.0),
//!     ..Bus::default()
//! }));
//! network.graph.add_node(Node::Gen(
//!     Gen::new(GenId::new(1), "Gen 1".to_string(), BusId::new(1))
//!         .with_voltage_setpoint(1.0),
//! ));
//! network.graph.add_node(Node::Load(Load {
//!     id: LoadId::new(1),
//!     name: "Load 1".to_string(),
//!     bus: BusId::new(2),
//!     active_power: Megawatts(50.0),
//!     reactive_power: Megavars(10.0),
//!     conform: true,
//! }));
//! network.graph.add_edge(
//!     b1,
//!     b2,
//!     Edge::Branch(Branch::new(
//!         BranchId::new(1),
//!         "Line 1-2".to_string(),
//!         BusId::new(1),
//!         BusId::new(2),
//!         0.01,
//!         0.1,
//!     )),
//! );
//! ```

use petgraph::{prelude::*, Undirected};
use serde::{Deserialize, Serialize};

pub mod diagnostics;
pub mod error;
pub mod topology;
pub mod units;

pub use diagnostics::{DiagnosticIssue, Diagnostics, Severity};
pub use error::{GridError, GridResult};
pub use petgraph::graph::NodeIndex;
pub use topology::*;
pub use units::{Degrees, Kilovolts, Megavars, MegavoltAmperes, Megawatts, PerUnit, Radians};

// Newtype wrappers for IDs for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusId(usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchId(usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenId(usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoadId(usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShuntId(usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConverterId(usize);

macro_rules! impl_id {
    ($type:ty) => {
        impl $type {
            #[inline]
            pub fn new(value: usize) -> Self {
                Self(value)
            }
            #[inline]
            pub fn value(&self) -> usize {
                self.0
            }
        }
    };
}

impl_id!(BusId);
impl_id!(BranchId);
impl_id!(GenId);
impl_id!(LoadId);
impl_id!(ShuntId);
impl_id!(ConverterId);

/// An electrical node.
///
/// `voltage_pu` and `angle_rad` hold the solved operating point; they are
/// initial guesses before a solve and results after one.
#[derive(Debug, Clone)]
pub struct Bus {
    pub id: BusId,
    pub name: String,
    /// Nominal voltage (for per-unit conversions)
    pub base_kv: Kilovolts,
    /// Voltage magnitude in per-unit (solver state)
    pub voltage_pu: PerUnit,
    /// Voltage angle in radians (solver state)
    pub angle_rad: Radians,
    /// Minimum plausible/permitted voltage
    pub vmin_pu: Option<PerUnit>,
    /// Maximum plausible/permitted voltage
    pub vmax_pu: Option<PerUnit>,
    /// Interchange-control area membership
    pub area_id: Option<i64>,
    /// Preferred slack/angle-reference designation
    pub slack: bool,
}

impl Default for Bus {
    fn default() -> Self {
        Self {
            id: BusId(0),
            name: String::new(),
            base_kv: Kilovolts(0.0),
            voltage_pu: PerUnit(1.0),
            angle_rad: Radians(0.0),
            vmin_pu: None,
            vmax_pu: None,
            area_id: None,
            slack: false,
        }
    }
}

/// Continuous ratio (voltage) control on a branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatioControl {
    /// Bus whose voltage magnitude the tap regulates
    pub controlled_bus: BusId,
    pub target_v: PerUnit,
}

/// Continuous phase (active power) control on a branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseControl {
    /// Active-power target for the flow at the `from` side
    pub target_p: Megawatts,
}

/// A line or transformer between two buses.
///
/// Each side carries its own in-service flag so that a breaker opening
/// disconnects one terminal without removing the element from the graph.
/// Series impedance is immutable after construction; the tap ratio is the
/// one quantity outer loops may step discretely.
#[derive(Debug, Clone)]
pub struct Branch {
    pub id: BranchId,
    pub name: String,
    pub from_bus: BusId,
    pub to_bus: BusId,
    /// Series resistance (per-unit)
    pub resistance: f64,
    /// Series reactance (per-unit)
    pub reactance: f64,
    /// Tap magnitude applied on the `from` side
    pub tap_ratio: f64,
    /// Phase shift applied on the `from` side
    pub phase_shift: Radians,
    /// Total line charging susceptance (per-unit, split half/half)
    pub charging_b: PerUnit,
    /// In-service flag of the `from` terminal
    pub connected_from: bool,
    /// In-service flag of the `to` terminal
    pub connected_to: bool,
    /// Whether automation/contingency logic may open this branch
    pub disconnection_allowed: bool,
    /// Allowed discrete tap positions (ratio values), if the tap is stepped
    pub tap_steps: Option<Vec<f64>>,
    pub ratio_control: Option<RatioControl>,
    pub phase_control: Option<PhaseControl>,
}

impl Default for Branch {
    fn default() -> Self {
        Self {
            id: BranchId(0),
            name: String::new(),
            from_bus: BusId(0),
            to_bus: BusId(0),
            resistance: 0.0,
            reactance: 0.0,
            tap_ratio: 1.0,
            phase_shift: Radians(0.0),
            charging_b: PerUnit(0.0),
            connected_from: true,
            connected_to: true,
            disconnection_allowed: false,
            tap_steps: None,
            ratio_control: None,
            phase_control: None,
        }
    }
}

impl Branch {
    pub fn new(
        id: BranchId,
        name: String,
        from_bus: BusId,
        to_bus: BusId,
        resistance: f64,
        reactance: f64,
    ) -> Self {
        Self {
            id,
            name,
            from_bus,
            to_bus,
            resistance,
            reactance,
            ..Self::default()
        }
    }

    /// Set the fixed tap ratio and phase shift.
    pub fn with_tap(mut self, ratio: f64, phase_shift: Radians) -> Self {
        self.tap_ratio = ratio;
        self.phase_shift = phase_shift;
        self
    }

    /// Attach line charging susceptance (total, split half/half).
    pub fn with_charging(mut self, b_pu: f64) -> Self {
        self.charging_b = PerUnit(b_pu);
        self
    }

    /// Allow automation/contingency logic to open this branch.
    pub fn allow_disconnection(mut self) -> Self {
        self.disconnection_allowed = true;
        self
    }

    /// Regulate a bus voltage with the tap (continuous, snapped to
    /// `tap_steps` afterwards when present).
    pub fn with_ratio_control(mut self, controlled_bus: BusId, target_v: f64) -> Self {
        self.ratio_control = Some(RatioControl {
            controlled_bus,
            target_v: PerUnit(target_v),
        });
        self
    }

    /// Regulate the `from`-side active flow with the phase shift.
    pub fn with_phase_control(mut self, target_p: f64) -> Self {
        self.phase_control = Some(PhaseControl {
            target_p: Megawatts(target_p),
        });
        self
    }

    /// Both terminals in service?
    pub fn is_connected(&self) -> bool {
        self.connected_from && self.connected_to
    }
}

/// A generating unit.
///
/// Control mode is derived from the targets: a `voltage_setpoint` makes the
/// unit voltage-controlling (at `regulated_bus` when remote); otherwise it
/// holds `target_q` (defaulting to zero). The solver switches a unit to
/// fixed-Q when a reactive limit is hit; that transition lives in the
/// solver's internal model, never here.
#[derive(Debug, Clone)]
pub struct Gen {
    pub id: GenId,
    pub name: String,
    pub bus: BusId,
    /// Active power setpoint
    pub target_p: Megawatts,
    pub pmin: Megawatts,
    pub pmax: Megawatts,
    pub qmin: Megavars,
    pub qmax: Megavars,
    pub status: bool,
    /// Voltage target (per-unit); present = voltage-controlling
    pub voltage_setpoint: Option<PerUnit>,
    /// Remotely regulated bus; `None` = own bus
    pub regulated_bus: Option<BusId>,
    /// Reactive target used when not voltage-controlling
    pub target_q: Option<Megavars>,
    /// Weight for slack-mismatch distribution; `None` = derive from headroom
    pub participation_factor: Option<f64>,
}

impl Gen {
    pub fn new(id: GenId, name: String, bus: BusId) -> Self {
        Self {
            id,
            name,
            bus,
            target_p: Megawatts(0.0),
            pmin: Megawatts(0.0),
            pmax: Megawatts(f64::INFINITY),
            qmin: Megavars(f64::NEG_INFINITY),
            qmax: Megavars(f64::INFINITY),
            status: true,
            voltage_setpoint: None,
            regulated_bus: None,
            target_q: None,
            participation_factor: None,
        }
    }

    pub fn with_target_p(mut self, p_mw: f64) -> Self {
        self.target_p = Megawatts(p_mw);
        self
    }

    pub fn with_p_limits(mut self, pmin: f64, pmax: f64) -> Self {
        self.pmin = Megawatts(pmin);
        self.pmax = Megawatts(pmax);
        self
    }

    pub fn with_q_limits(mut self, qmin: f64, qmax: f64) -> Self {
        self.qmin = Megavars(qmin);
        self.qmax = Megavars(qmax);
        self
    }

    pub fn with_voltage_setpoint(mut self, v_pu: f64) -> Self {
        self.voltage_setpoint = Some(PerUnit(v_pu));
        self
    }

    /// Regulate a bus other than the connection bus.
    pub fn with_remote_regulation(mut self, bus: BusId) -> Self {
        self.regulated_bus = Some(bus);
        self
    }

    pub fn with_target_q(mut self, q_mvar: f64) -> Self {
        self.target_q = Some(Megavars(q_mvar));
        self
    }

    pub fn with_participation_factor(mut self, factor: f64) -> Self {
        self.participation_factor = Some(factor);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Load {
    pub id: LoadId,
    pub name: String,
    pub bus: BusId,
    pub active_power: Megawatts,
    pub reactive_power: Megavars,
    /// Participates in the conform-load slack-distribution basis
    pub conform: bool,
}

/// Shunt element (capacitor or reactor) connected to a bus.
#[derive(Debug, Clone)]
pub struct Shunt {
    pub id: ShuntId,
    pub name: String,
    pub bus: BusId,
    /// Conductance in per-unit
    pub gs_pu: f64,
    /// Susceptance in per-unit (positive = capacitor, negative = reactor)
    pub bs_pu: f64,
    pub status: bool,
}

impl Default for Shunt {
    fn default() -> Self {
        Self {
            id: ShuntId(0),
            name: String::new(),
            bus: BusId(0),
            gs_pu: 0.0,
            bs_pu: 0.0,
            status: true,
        }
    }
}

/// HVDC voltage-source converter terminal, seen from the AC network as an
/// injection with a fixed active-power setpoint and either voltage or
/// reactive-power control. Participates in reactive-limit enforcement like
/// a generator; never in slack distribution (the DC side holds its P).
#[derive(Debug, Clone)]
pub struct VscConverter {
    pub id: ConverterId,
    pub name: String,
    pub bus: BusId,
    /// Active power injected into the AC side (negative = rectifier)
    pub target_p: Megawatts,
    pub qmin: Megavars,
    pub qmax: Megavars,
    pub status: bool,
    pub voltage_setpoint: Option<PerUnit>,
    pub target_q: Option<Megavars>,
}

impl VscConverter {
    pub fn new(id: ConverterId, name: String, bus: BusId) -> Self {
        Self {
            id,
            name,
            bus,
            target_p: Megawatts(0.0),
            qmin: Megavars(f64::NEG_INFINITY),
            qmax: Megavars(f64::INFINITY),
            status: true,
            voltage_setpoint: None,
            target_q: None,
        }
    }

    pub fn with_target_p(mut self, p_mw: f64) -> Self {
        self.target_p = Megawatts(p_mw);
        self
    }

    pub fn with_q_limits(mut self, qmin: f64, qmax: f64) -> Self {
        self.qmin = Megavars(qmin);
        self.qmax = Megavars(qmax);
        self
    }

    pub fn with_voltage_setpoint(mut self, v_pu: f64) -> Self {
        self.voltage_setpoint = Some(PerUnit(v_pu));
        self
    }
}

/// Node kinds of the network graph.
#[derive(Debug, Clone)]
pub enum Node {
    Bus(Bus),
    Gen(Gen),
    Load(Load),
    Shunt(Shunt),
    Converter(VscConverter),
}

/// Edge kinds of the network graph.
#[derive(Debug, Clone)]
pub enum Edge {
    Branch(Branch),
}

/// The transmission network container.
#[derive(Debug, Default)]
pub struct Network {
    pub graph: Graph<Node, Edge, Undirected>,
}

impl Network {
    pub fn new() -> Self {
        Self {
            graph: Graph::new_undirected(),
        }
    }

    /// Compute basic statistics about the network.
    pub fn stats(&self) -> NetworkStats {
        let mut stats = NetworkStats::default();
        for node in self.graph.node_weights() {
            match node {
                Node::Bus(_) => stats.num_buses += 1,
                Node::Gen(g) => {
                    stats.num_gens += 1;
                    stats.total_gen_target_mw += g.target_p.value();
                }
                Node::Load(l) => {
                    stats.num_loads += 1;
                    stats.total_load_mw += l.active_power.value();
                    stats.total_load_mvar += l.reactive_power.value();
                }
                Node::Shunt(_) => stats.num_shunts += 1,
                Node::Converter(_) => stats.num_converters += 1,
            }
        }
        stats.num_branches = self.graph.edge_count();
        stats
    }

    /// Validate network data for common issues that cause solver failures.
    pub fn validate_into(&self, diag: &mut Diagnostics) {
        let stats = self.stats();

        if stats.num_buses == 0 {
            diag.add_error("structure", "Network has no buses");
            return;
        }
        if stats.num_gens == 0 && stats.num_converters == 0 {
            diag.add_error("structure", "Network has no injections able to balance load");
        }
        if stats.num_loads == 0 {
            diag.add_warning("structure", "Network has no loads");
        }
        if stats.num_branches == 0 && stats.num_buses > 1 {
            diag.add_error("structure", "Network has multiple buses but no branches");
        }

        for gen in self.generators() {
            if gen.qmin.value() > gen.qmax.value() {
                diag.add_error_with_entity(
                    "limits",
                    "qmin above qmax",
                    &format!("Gen {}", gen.id.value()),
                );
            }
            if gen.pmin.value() > gen.pmax.value() {
                diag.add_error_with_entity(
                    "limits",
                    "pmin above pmax",
                    &format!("Gen {}", gen.id.value()),
                );
            }
        }
        for branch in self.branches() {
            if branch.resistance == 0.0 && branch.reactance == 0.0 {
                diag.add_error_with_entity(
                    "structure",
                    "zero series impedance",
                    &format!("Branch {}", branch.id.value()),
                );
            }
        }
    }

    /// Find generators at a specific bus.
    pub fn generators_at_bus(&self, bus_id: BusId) -> Vec<&Gen> {
        self.graph
            .node_weights()
            .filter_map(|n| match n {
                Node::Gen(g) if g.bus == bus_id => Some(g),
                _ => None,
            })
            .collect()
    }

    /// Find loads at a specific bus.
    pub fn loads_at_bus(&self, bus_id: BusId) -> Vec<&Load> {
        self.graph
            .node_weights()
            .filter_map(|n| match n {
                Node::Load(l) if l.bus == bus_id => Some(l),
                _ => None,
            })
            .collect()
    }

    pub fn buses(&self) -> Vec<&Bus> {
        self.graph
            .node_weights()
            .filter_map(|n| match n {
                Node::Bus(b) => Some(b),
                _ => None,
            })
            .collect()
    }

    pub fn generators(&self) -> Vec<&Gen> {
        self.graph
            .node_weights()
            .filter_map(|n| match n {
                Node::Gen(g) => Some(g),
                _ => None,
            })
            .collect()
    }

    pub fn loads(&self) -> Vec<&Load> {
        self.graph
            .node_weights()
            .filter_map(|n| match n {
                Node::Load(l) => Some(l),
                _ => None,
            })
            .collect()
    }

    pub fn shunts(&self) -> Vec<&Shunt> {
        self.graph
            .node_weights()
            .filter_map(|n| match n {
                Node::Shunt(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn converters(&self) -> Vec<&VscConverter> {
        self.graph
            .node_weights()
            .filter_map(|n| match n {
                Node::Converter(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn branches(&self) -> Vec<&Branch> {
        self.graph
            .edge_weights()
            .map(|e| match e {
                Edge::Branch(b) => b,
            })
            .collect()
    }

    pub fn bus(&self, id: BusId) -> Option<&Bus> {
        self.graph.node_weights().find_map(|n| match n {
            Node::Bus(b) if b.id == id => Some(b),
            _ => None,
        })
    }

    pub fn bus_mut(&mut self, id: BusId) -> Option<&mut Bus> {
        self.graph.node_weights_mut().find_map(|n| match n {
            Node::Bus(b) if b.id == id => Some(b),
            _ => None,
        })
    }

    pub fn branch_mut(&mut self, id: BranchId) -> Option<&mut Branch> {
        self.graph.edge_weights_mut().find_map(|e| match e {
            Edge::Branch(b) if b.id == id => Some(b),
            _ => None,
        })
    }

    /// Write a solved operating point back onto a bus.
    pub fn apply_bus_state(&mut self, id: BusId, v: PerUnit, angle: Radians) -> GridResult<()> {
        match self.bus_mut(id) {
            Some(bus) => {
                bus.voltage_pu = v;
                bus.angle_rad = angle;
                Ok(())
            }
            None => Err(GridError::Network(format!(
                "unknown bus {} in state write-back",
                id.value()
            ))),
        }
    }
}

/// Statistics about a network's size and injections.
#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub num_buses: usize,
    pub num_gens: usize,
    pub num_loads: usize,
    pub num_shunts: usize,
    pub num_converters: usize,
    pub num_branches: usize,
    pub total_load_mw: f64,
    pub total_load_mvar: f64,
    pub total_gen_target_mw: f64,
}

impl std::fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} buses, {} branches, {} gens ({:.0} MW), {} loads ({:.0} MW)",
            self.num_buses,
            self.num_branches,
            self.num_gens,
            self.total_gen_target_mw,
            self.num_loads,
            self.total_load_mw
        )
    }
}

impl Node {
    /// Human-readable label for the node.
    pub fn label(&self) -> &str {
        match self {
            Node::Bus(bus) => &bus.name,
            Node::Gen(gen) => &gen.name,
            Node::Load(load) => &load.name,
            Node::Shunt(shunt) => &shunt.name,
            Node::Converter(conv) => &conv.name,
        }
    }
}

impl Edge {
    /// Human-readable label for the edge.
    pub fn label(&self) -> &str {
        match self {
            Edge::Branch(branch) => &branch.name,
        }
    }
}
