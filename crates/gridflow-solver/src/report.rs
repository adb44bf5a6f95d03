//! Write-only diagnostic artifacts.
//!
//! The assembled equation system can be emitted as a structured JSON
//! document and the internal component graph as DOT, for offline
//! inspection of a misbehaving case. Neither artifact participates in the
//! solving contract; they describe state, they never change it.

use crate::equations::{EquationKind, EquationSystem, VariableKind};
use crate::model::PfNetwork;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct EquationRow {
    slot: usize,
    variable: String,
    equation: String,
    terms: usize,
}

#[derive(Debug, Serialize)]
struct EquationSystemDocument {
    component: usize,
    variables: usize,
    equations: Vec<EquationRow>,
}

fn variable_label(kind: VariableKind, model: &PfNetwork) -> String {
    match kind {
        VariableKind::BusAngle(b) => format!("angle({})", model.buses[b].name),
        VariableKind::BusV(b) => format!("v({})", model.buses[b].name),
        VariableKind::BranchAlpha(br) => format!("alpha({})", model.branches[br].name),
        VariableKind::BranchRho(br) => format!("rho({})", model.branches[br].name),
    }
}

fn equation_label(kind: EquationKind, model: &PfNetwork) -> String {
    match kind {
        EquationKind::BusP(b) => format!("bus_p({})", model.buses[b].name),
        EquationKind::BusQ(b) => format!("bus_q({})", model.buses[b].name),
        EquationKind::BusV { controlled } => format!("bus_v({})", model.buses[controlled].name),
        EquationKind::RefAngle(b) => format!("ref_angle({})", model.buses[b].name),
        EquationKind::BranchP(br) => format!("branch_p({})", model.branches[br].name),
        EquationKind::TapPosition(br) => format!("tap_position({})", model.branches[br].name),
    }
}

/// Serialize the equation system of a component as a JSON document: one
/// row per slot, pairing the variable with the equation occupying it.
pub fn equation_system_json(
    model: &PfNetwork,
    system: &EquationSystem,
) -> serde_json::Result<String> {
    let layout = system.layout();
    let equations = system
        .equations()
        .iter()
        .enumerate()
        .map(|(slot, eq)| EquationRow {
            slot,
            variable: variable_label(layout.kind(slot), model),
            equation: equation_label(eq.kind, model),
            terms: eq.terms.len(),
        })
        .collect();
    serde_json::to_string_pretty(&EquationSystemDocument {
        component: model.component,
        variables: layout.len(),
        equations,
    })
}

/// Render the internal component graph as DOT, with the solved state on
/// the bus labels and disabled branches dashed.
pub fn network_dot(model: &PfNetwork) -> String {
    let mut buffer = String::new();
    buffer.push_str(&format!("graph component_{} {{\n", model.component));
    for bus in &model.buses {
        let marker = if bus.num == model.reference { " *" } else { "" };
        buffer.push_str(&format!(
            "  n{} [label=\"{}{}\\n{:.4} pu / {:.4} rad\"];\n",
            bus.num,
            sanitize_label(&bus.name),
            marker,
            bus.v,
            bus.angle
        ));
    }
    for branch in &model.branches {
        let (Some(b1), Some(b2)) = (branch.bus1, branch.bus2) else {
            continue;
        };
        let style = if branch.enabled() { "" } else { " [style=dashed]" };
        buffer.push_str(&format!(
            "  n{} -- n{} [label=\"{}\"]{};\n",
            b1,
            b2,
            sanitize_label(&branch.name),
            style
        ));
    }
    buffer.push('}');
    buffer
}

fn sanitize_label(label: &str) -> String {
    label.replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::build_components;
    use gridflow_core::*;

    fn model() -> PfNetwork {
        let mut network = Network::new();
        let b1 = network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(1),
            name: "alpha".into(),
            slack: true,
            ..Bus::default()
        }));
        let b2 = network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(2),
            name: "beta".into(),
            ..Bus::default()
        }));
        network.graph.add_node(Node::Gen(
            Gen::new(GenId::new(1), "g1".into(), BusId::new(1)).with_voltage_setpoint(1.0),
        ));
        network.graph.add_node(Node::Load(Load {
            id: LoadId::new(1),
            name: "l1".into(),
            bus: BusId::new(2),
            active_power: Megawatts(30.0),
            reactive_power: Megavars(10.0),
            conform: true,
        }));
        network.graph.add_edge(
            b1,
            b2,
            Edge::Branch(Branch::new(
                BranchId::new(1),
                "alpha-beta".into(),
                BusId::new(1),
                BusId::new(2),
                0.01,
                0.1,
            )),
        );
        build_components(&network, 100.0).remove(0).unwrap()
    }

    #[test]
    fn test_equation_system_document() {
        let model = model();
        let system = EquationSystem::build(&model).unwrap();
        let json = equation_system_json(&model, &system).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(doc["variables"], 4);
        assert_eq!(doc["equations"].as_array().unwrap().len(), 4);
        assert!(json.contains("ref_angle(alpha)"));
        assert!(json.contains("bus_q(beta)"));
    }

    #[test]
    fn test_network_dot() {
        let model = model();
        let dot = network_dot(&model);
        assert!(dot.starts_with("graph component_0 {"));
        assert!(dot.contains("alpha *"));
        assert!(dot.contains("n0 -- n1"));
    }
}
