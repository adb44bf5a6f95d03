//! Behavior of the correction passes around the core solve.

use gridflow_core::*;
use gridflow_solver::{
    AutomationRule, AutomationTrigger, ComponentStatus, PilotPoint, PowerFlowConfig,
    PowerFlowEngine,
};

fn bus(id: usize, name: &str, slack: bool, area: Option<i64>) -> Node {
    Node::Bus(Bus {
        id: BusId::new(id),
        name: name.into(),
        slack,
        area_id: area,
        ..Bus::default()
    })
}

fn load(id: usize, bus: usize, p_mw: f64, q_mvar: f64) -> Node {
    Node::Load(Load {
        id: LoadId::new(id),
        name: format!("l{id}"),
        bus: BusId::new(bus),
        active_power: Megawatts(p_mw),
        reactive_power: Megavars(q_mvar),
        conform: true,
    })
}

fn line(id: usize, from: usize, to: usize, r: f64, x: f64) -> Branch {
    Branch::new(
        BranchId::new(id),
        format!("{from}-{to}"),
        BusId::new(from),
        BusId::new(to),
        r,
        x,
    )
}

#[test]
fn test_slack_distribution_respects_factors_and_limits() {
    let mut network = Network::new();
    let b1 = network.graph.add_node(bus(1, "b1", true, None));
    let b2 = network.graph.add_node(bus(2, "b2", false, None));
    let b3 = network.graph.add_node(bus(3, "b3", false, None));
    network.graph.add_node(Node::Gen(
        Gen::new(GenId::new(1), "g1".into(), BusId::new(1))
            .with_voltage_setpoint(1.0)
            .with_target_p(40.0)
            .with_p_limits(0.0, 200.0)
            .with_participation_factor(0.7),
    ));
    network.graph.add_node(Node::Gen(
        Gen::new(GenId::new(2), "g2".into(), BusId::new(2))
            .with_voltage_setpoint(1.0)
            .with_target_p(40.0)
            .with_p_limits(0.0, 45.0)
            .with_participation_factor(0.3),
    ));
    network.graph.add_node(load(1, 3, 100.0, 20.0));
    network
        .graph
        .add_edge(b1, b2, Edge::Branch(line(1, 1, 2, 0.01, 0.1)));
    network
        .graph
        .add_edge(b2, b3, Edge::Branch(line(2, 2, 3, 0.01, 0.1)));
    network
        .graph
        .add_edge(b1, b3, Edge::Branch(line(3, 1, 3, 0.01, 0.1)));

    let engine = PowerFlowEngine::new(PowerFlowConfig::default()).unwrap();
    let results = engine.solve(&mut network);
    assert!(results.fully_converged());
    let component = &results.components[0];

    // The residual slack mismatch has been distributed away.
    assert!(component.slack_mismatch_mw.abs() < 0.01);

    // g2 pins at its 45 MW ceiling: it absorbs at most its 5 MW of
    // headroom and receives no further positive delta once pinned (later
    // cycles may back it off marginally as losses settle).
    let adj_g2 = component.notes.slack_adjustments["g2"];
    assert!(adj_g2 <= 5.0 + 1e-9 && adj_g2 > 4.5, "g2 delta = {adj_g2}");
    let g2 = component.injections.iter().find(|i| i.name == "g2").unwrap();
    assert!(g2.p_mw <= 45.0 + 1e-9 && g2.p_mw > 44.5);

    // The applied deltas add up to the shortfall: 20 MW plus the losses.
    let total: f64 = component.notes.slack_adjustments.values().sum();
    assert!(
        total > 20.0 && total < 22.0,
        "total distributed = {total} MW"
    );
}

#[test]
fn test_slack_distribution_fails_without_headroom() {
    let mut network = Network::new();
    let b1 = network.graph.add_node(bus(1, "b1", true, None));
    let b2 = network.graph.add_node(bus(2, "b2", false, None));
    network.graph.add_node(Node::Gen(
        Gen::new(GenId::new(1), "g1".into(), BusId::new(1))
            .with_voltage_setpoint(1.0)
            .with_target_p(40.0)
            .with_p_limits(0.0, 41.0),
    ));
    network.graph.add_node(load(1, 2, 100.0, 10.0));
    network
        .graph
        .add_edge(b1, b2, Edge::Branch(line(1, 1, 2, 0.01, 0.1)));

    let engine = PowerFlowEngine::new(PowerFlowConfig::default()).unwrap();
    let results = engine.solve(&mut network);
    match &results.components[0].status {
        ComponentStatus::OuterLoopFailed(reason) => {
            assert!(reason.contains("distributed-slack"), "reason: {reason}");
        }
        other => panic!("expected slack failure, got {other:?}"),
    }
}

#[test]
fn test_reactive_limit_switches_controller_to_band_edge() {
    let mut network = Network::new();
    let b1 = network.graph.add_node(bus(1, "b1", true, None));
    let b2 = network.graph.add_node(bus(2, "b2", false, None));
    let b3 = network.graph.add_node(bus(3, "b3", false, None));
    network.graph.add_node(Node::Gen(
        Gen::new(GenId::new(1), "g1".into(), BusId::new(1))
            .with_voltage_setpoint(1.0)
            .with_target_p(30.0)
            .with_p_limits(0.0, 200.0),
    ));
    // Holding 1.05 against a 1.0 neighbor over x = 0.1 would take roughly
    // 50 Mvar; the 5 Mvar band cannot do it.
    network.graph.add_node(Node::Gen(
        Gen::new(GenId::new(2), "g2".into(), BusId::new(2))
            .with_voltage_setpoint(1.05)
            .with_target_p(30.0)
            .with_p_limits(0.0, 200.0)
            .with_q_limits(-5.0, 5.0),
    ));
    network.graph.add_node(load(1, 3, 60.0, 30.0));
    network
        .graph
        .add_edge(b1, b2, Edge::Branch(line(1, 1, 2, 0.01, 0.1)));
    network
        .graph
        .add_edge(b2, b3, Edge::Branch(line(2, 2, 3, 0.02, 0.15)));

    let engine = PowerFlowEngine::new(PowerFlowConfig::default()).unwrap();
    let results = engine.solve(&mut network);
    assert!(results.fully_converged());
    let component = &results.components[0];

    assert!(component
        .notes
        .limited_injections
        .contains(&"g2".to_string()));
    let g2 = component.injections.iter().find(|i| i.name == "g2").unwrap();
    assert_eq!(g2.limited.as_deref(), Some("max"));
    assert!((g2.q_mvar - 5.0).abs() < 1e-6);

    // No limited unit ends up outside its band.
    for inj in &component.injections {
        if inj.limited.is_some() {
            assert!(inj.q_mvar >= -5.0 - 1e-6 && inj.q_mvar <= 5.0 + 1e-6);
        }
    }

    // The bus lost voltage control and settled below the old target.
    let b2 = network.bus(BusId::new(2)).unwrap();
    assert!(b2.voltage_pu.value() < 1.05);
}

#[test]
fn test_all_controllers_limited_is_fatal() {
    let mut network = Network::new();
    let b1 = network.graph.add_node(bus(1, "b1", true, None));
    let b2 = network.graph.add_node(bus(2, "b2", false, None));
    network.graph.add_node(Node::Gen(
        Gen::new(GenId::new(1), "g1".into(), BusId::new(1))
            .with_voltage_setpoint(1.0)
            .with_target_p(30.0)
            .with_p_limits(0.0, 200.0)
            .with_q_limits(-1.0, 1.0),
    ));
    network.graph.add_node(load(1, 2, 30.0, 20.0));
    network
        .graph
        .add_edge(b1, b2, Edge::Branch(line(1, 1, 2, 0.01, 0.1)));

    let engine = PowerFlowEngine::new(PowerFlowConfig::default()).unwrap();
    let results = engine.solve(&mut network);
    match &results.components[0].status {
        ComponentStatus::OuterLoopFailed(reason) => {
            assert!(reason.contains("voltage controllers"), "reason: {reason}");
        }
        other => panic!("expected reactive-limit failure, got {other:?}"),
    }
}

#[test]
fn test_converter_enforced_like_generator_but_never_absorbs_slack() {
    let mut network = Network::new();
    let b1 = network.graph.add_node(bus(1, "b1", true, None));
    let b2 = network.graph.add_node(bus(2, "b2", false, None));
    network.graph.add_node(Node::Gen(
        Gen::new(GenId::new(1), "g1".into(), BusId::new(1))
            .with_voltage_setpoint(1.0)
            .with_target_p(30.0)
            .with_p_limits(0.0, 200.0),
    ));
    // HVDC terminal trying to hold 1.04 with a 3 Mvar band: it hits the
    // limit and is demoted exactly like a generator would be.
    network.graph.add_node(Node::Converter(
        VscConverter::new(ConverterId::new(1), "vsc".into(), BusId::new(2))
            .with_target_p(10.0)
            .with_voltage_setpoint(1.04)
            .with_q_limits(-3.0, 3.0),
    ));
    network.graph.add_node(load(1, 2, 40.0, 10.0));
    network
        .graph
        .add_edge(b1, b2, Edge::Branch(line(1, 1, 2, 0.01, 0.1)));

    let engine = PowerFlowEngine::new(PowerFlowConfig::default()).unwrap();
    let results = engine.solve(&mut network);
    assert!(results.fully_converged());
    let component = &results.components[0];

    assert!(component
        .notes
        .limited_injections
        .contains(&"vsc".to_string()));
    let vsc = component
        .injections
        .iter()
        .find(|i| i.name == "vsc")
        .unwrap();
    assert_eq!(vsc.limited.as_deref(), Some("max"));
    assert!((vsc.q_mvar - 3.0).abs() < 1e-6);

    // The DC side holds its active power: slack lands on the generator.
    assert!((vsc.p_mw - 10.0).abs() < 1e-9);
    assert!(!component.notes.slack_adjustments.contains_key("vsc"));
    assert!(component.notes.slack_adjustments.contains_key("g1"));
}

#[test]
fn test_stable_network_needs_zero_outer_cycles() {
    let mut network = Network::new();
    let b1 = network.graph.add_node(bus(1, "b1", true, None));
    let b2 = network.graph.add_node(bus(2, "b2", false, None));
    network.graph.add_node(Node::Gen(
        Gen::new(GenId::new(1), "g1".into(), BusId::new(1))
            .with_voltage_setpoint(1.0)
            .with_target_p(30.0),
    ));
    network.graph.add_node(load(1, 2, 30.0, 5.0));
    network
        .graph
        .add_edge(b1, b2, Edge::Branch(line(1, 1, 2, 0.01, 0.1)));

    // No slack distribution: every pass finds nothing to do on the first
    // inspection, so the outer-loop process is stable immediately.
    let config = PowerFlowConfig {
        distributed_slack: false,
        ..PowerFlowConfig::default()
    };
    let engine = PowerFlowEngine::new(config).unwrap();
    let results = engine.solve(&mut network);
    assert!(results.fully_converged());
    let component = &results.components[0];
    assert_eq!(component.outer_loop_cycles, 0);
    assert!(component.notes.slack_adjustments.is_empty());
    assert!(component.notes.limited_injections.is_empty());
    assert!(component.notes.opened_branches.is_empty());
    assert!(component.notes.tap_ratios.is_empty());
}

#[test]
fn test_interchange_target_met() {
    let mut network = Network::new();
    let b1 = network.graph.add_node(bus(1, "b1", true, Some(1)));
    let b2 = network.graph.add_node(bus(2, "b2", false, Some(1)));
    let b3 = network.graph.add_node(bus(3, "b3", false, Some(2)));
    let b4 = network.graph.add_node(bus(4, "b4", false, Some(2)));
    network.graph.add_node(Node::Gen(
        Gen::new(GenId::new(1), "g1".into(), BusId::new(1))
            .with_voltage_setpoint(1.0)
            .with_target_p(50.0)
            .with_p_limits(0.0, 200.0),
    ));
    network.graph.add_node(Node::Gen(
        Gen::new(GenId::new(3), "g3".into(), BusId::new(3))
            .with_voltage_setpoint(1.0)
            .with_target_p(50.0)
            .with_p_limits(0.0, 150.0),
    ));
    network.graph.add_node(load(1, 2, 30.0, 5.0));
    network.graph.add_node(load(2, 4, 70.0, 10.0));
    network
        .graph
        .add_edge(b1, b2, Edge::Branch(line(1, 1, 2, 0.01, 0.1)));
    network
        .graph
        .add_edge(b2, b3, Edge::Branch(line(2, 2, 3, 0.01, 0.1)));
    network
        .graph
        .add_edge(b3, b4, Edge::Branch(line(3, 3, 4, 0.01, 0.1)));

    let mut config = PowerFlowConfig {
        max_outer_loop_cycles: 40,
        ..PowerFlowConfig::default()
    };
    config.interchange_targets.insert(1, 30.0);
    let engine = PowerFlowEngine::new(config).unwrap();
    let results = engine.solve(&mut network);
    assert!(results.fully_converged());
    let component = &results.components[0];

    // Area 1's export is the tie-line flow leaving bus 2.
    let tie = component
        .branch_flows
        .iter()
        .find(|f| f.branch == BranchId::new(2))
        .unwrap();
    assert!(
        (tie.p1_mw - 30.0).abs() < 1.5,
        "area 1 exports {} MW",
        tie.p1_mw
    );
}

#[test]
fn test_infeasible_interchange_is_fatal() {
    let mut network = Network::new();
    let b1 = network.graph.add_node(bus(1, "b1", true, Some(1)));
    let b2 = network.graph.add_node(bus(2, "b2", false, Some(2)));
    network.graph.add_node(Node::Gen(
        Gen::new(GenId::new(1), "g1".into(), BusId::new(1))
            .with_voltage_setpoint(1.0)
            .with_target_p(50.0)
            .with_p_limits(0.0, 60.0),
    ));
    network.graph.add_node(Node::Gen(
        Gen::new(GenId::new(2), "g2".into(), BusId::new(2))
            .with_voltage_setpoint(1.0)
            .with_target_p(30.0)
            .with_p_limits(0.0, 150.0),
    ));
    network.graph.add_node(load(1, 2, 80.0, 10.0));
    network
        .graph
        .add_edge(b1, b2, Edge::Branch(line(1, 1, 2, 0.01, 0.1)));

    let mut config = PowerFlowConfig {
        max_outer_loop_cycles: 40,
        ..PowerFlowConfig::default()
    };
    config.interchange_targets.insert(1, 500.0);
    let engine = PowerFlowEngine::new(config).unwrap();
    let results = engine.solve(&mut network);
    match &results.components[0].status {
        ComponentStatus::OuterLoopFailed(reason) => {
            assert!(reason.contains("interchange"), "reason: {reason}");
        }
        other => panic!("expected interchange failure, got {other:?}"),
    }
}

#[test]
fn test_automation_opens_parallel_branch() {
    let mut network = Network::new();
    let b1 = network.graph.add_node(bus(1, "b1", true, None));
    let b2 = network.graph.add_node(bus(2, "b2", false, None));
    network.graph.add_node(Node::Gen(
        Gen::new(GenId::new(1), "g1".into(), BusId::new(1))
            .with_voltage_setpoint(1.0)
            .with_target_p(50.0)
            .with_p_limits(0.0, 200.0),
    ));
    network.graph.add_node(load(1, 2, 50.0, 10.0));
    network
        .graph
        .add_edge(b1, b2, Edge::Branch(line(1, 1, 2, 0.01, 0.1)));
    network.graph.add_edge(
        b1,
        b2,
        Edge::Branch(line(2, 1, 2, 0.01, 0.1).allow_disconnection()),
    );

    let config = PowerFlowConfig {
        automation_rules: vec![AutomationRule {
            monitored_branch: BranchId::new(1),
            trigger: AutomationTrigger::CurrentAbovePu(0.1),
            open_branch: BranchId::new(2),
        }],
        ..PowerFlowConfig::default()
    };
    let engine = PowerFlowEngine::new(config).unwrap();
    let results = engine.solve(&mut network);
    assert!(results.fully_converged());
    let component = &results.components[0];

    assert_eq!(component.notes.opened_branches, vec![BranchId::new(2)]);
    // The opened branch carries no flow; the survivor carries the full load.
    assert!(component
        .branch_flows
        .iter()
        .all(|f| f.branch != BranchId::new(2)));
    let survivor = component
        .branch_flows
        .iter()
        .find(|f| f.branch == BranchId::new(1))
        .unwrap();
    assert!(survivor.p1_mw > 50.0);
}

#[test]
fn test_automation_refuses_to_split_component() {
    let mut network = Network::new();
    let b1 = network.graph.add_node(bus(1, "b1", true, None));
    let b2 = network.graph.add_node(bus(2, "b2", false, None));
    let b3 = network.graph.add_node(bus(3, "b3", false, None));
    network.graph.add_node(Node::Gen(
        Gen::new(GenId::new(1), "g1".into(), BusId::new(1))
            .with_voltage_setpoint(1.0)
            .with_target_p(60.0)
            .with_p_limits(0.0, 200.0),
    ));
    network.graph.add_node(load(1, 2, 40.0, 5.0));
    network.graph.add_node(load(2, 3, 20.0, 5.0));
    network
        .graph
        .add_edge(b1, b2, Edge::Branch(line(1, 1, 2, 0.01, 0.1)));
    // The only path to bus 3: opening it would strand the load there.
    network.graph.add_edge(
        b2,
        b3,
        Edge::Branch(line(2, 2, 3, 0.01, 0.1).allow_disconnection()),
    );

    let config = PowerFlowConfig {
        automation_rules: vec![AutomationRule {
            monitored_branch: BranchId::new(1),
            trigger: AutomationTrigger::CurrentAbovePu(0.1),
            open_branch: BranchId::new(2),
        }],
        ..PowerFlowConfig::default()
    };
    let engine = PowerFlowEngine::new(config).unwrap();
    let results = engine.solve(&mut network);
    assert!(results.fully_converged());
    let component = &results.components[0];
    assert!(component.notes.opened_branches.is_empty());
    assert!(component
        .branch_flows
        .iter()
        .any(|f| f.branch == BranchId::new(2)));
}

#[test]
fn test_discrete_tap_snaps_to_step() {
    let mut network = Network::new();
    let b1 = network.graph.add_node(bus(1, "b1", true, None));
    let b2 = network.graph.add_node(bus(2, "b2", false, None));
    network.graph.add_node(Node::Gen(
        Gen::new(GenId::new(1), "g1".into(), BusId::new(1))
            .with_voltage_setpoint(1.0)
            .with_target_p(20.0)
            .with_p_limits(0.0, 200.0),
    ));
    network.graph.add_node(load(1, 2, 20.0, 5.0));
    let mut transformer = line(1, 1, 2, 0.01, 0.1).with_ratio_control(BusId::new(2), 1.0);
    transformer.tap_steps = Some(vec![0.95, 1.0, 1.05]);
    network.graph.add_edge(b1, b2, Edge::Branch(transformer));

    let engine = PowerFlowEngine::new(PowerFlowConfig::default()).unwrap();
    let results = engine.solve(&mut network);
    assert!(results.fully_converged());
    let component = &results.components[0];

    assert_eq!(component.notes.tap_ratios.len(), 1);
    let (branch, tap) = component.notes.tap_ratios[0];
    assert_eq!(branch, BranchId::new(1));
    assert!([0.95, 1.0, 1.05].contains(&tap), "snapped tap = {tap}");
}

#[test]
fn test_pilot_point_pulls_bus_to_target() {
    let mut network = Network::new();
    let b1 = network.graph.add_node(bus(1, "b1", true, None));
    let b2 = network.graph.add_node(bus(2, "b2", false, None));
    network.graph.add_node(Node::Gen(
        Gen::new(GenId::new(1), "g1".into(), BusId::new(1))
            .with_voltage_setpoint(1.0)
            .with_target_p(25.0)
            .with_p_limits(0.0, 200.0),
    ));
    network.graph.add_node(load(1, 2, 25.0, 8.0));
    network
        .graph
        .add_edge(b1, b2, Edge::Branch(line(1, 1, 2, 0.01, 0.1)));

    let config = PowerFlowConfig {
        pilot_points: vec![PilotPoint {
            bus: BusId::new(2),
            target_v: 1.0,
            gain: 0.8,
        }],
        ..PowerFlowConfig::default()
    };
    let engine = PowerFlowEngine::new(config).unwrap();
    let results = engine.solve(&mut network);
    assert!(results.fully_converged());
    let pilot_bus = network.bus(BusId::new(2)).unwrap();
    assert!(
        (pilot_bus.voltage_pu.value() - 1.0).abs() < 1.5e-3,
        "pilot bus at {}",
        pilot_bus.voltage_pu.value()
    );
}
