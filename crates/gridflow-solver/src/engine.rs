//! Solve orchestration across connected components.
//!
//! The engine validates configuration once, splits the network into
//! components, and solves each component on the rayon pool with nothing
//! shared but the read-only network view. A component failing — whether
//! structurally, numerically, or in an outer loop — never aborts the run;
//! it lands in the per-component result and the rest of the network is
//! still solved. Solved voltages are written back to the external model
//! serially afterwards, and the optional keyed state cache is updated so
//! the next solve of the same variant can carry the state over.

use crate::backend::backend_for;
use crate::cache::{CachedState, StateCache};
use crate::config::{ConfigError, PowerFlowConfig, SolveMethod};
use crate::connectivity::analyzer_for;
use crate::equations::{
    branch_flow_at, bus_p_mismatch, bus_q_calc, EquationSystem, StateVector, VarLayout,
};
use crate::init::initial_state;
use crate::krylov::newton_krylov_solve;
use crate::model::{build_components, ControlMode, PfNetwork, QLimit, StructuralError};
use crate::newton::{newton_solve, IterationStatus, UniformCriterion};
use crate::outer::reactive_limits::controller_q_shares;
use crate::outer::{standard_loops, OuterLoopContext, OuterLoopStatus, SolveNotes};
use crate::report;
use gridflow_core::{BranchId, BusId, Network, PerUnit, Radians};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Terminal status of one component's solve.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Converged,
    MaxIterationReached,
    SolverFailed,
    UnrealisticState,
    /// The component could not be assembled; it was skipped, the run went on
    Structural(String),
    /// An outer loop reported an unrecoverable condition
    OuterLoopFailed(String),
    /// The outer-loop cycle budget ran out before a stable fixed point
    OuterLoopUnstable,
}

/// Solved voltage of one bus.
#[derive(Debug, Clone, Serialize)]
pub struct BusVoltage {
    pub bus: BusId,
    pub v_pu: f64,
    pub angle_rad: f64,
}

/// Power entering a branch at each terminal (positive leaves the bus).
#[derive(Debug, Clone, Serialize)]
pub struct BranchFlowResult {
    pub branch: BranchId,
    pub p1_mw: f64,
    pub q1_mvar: f64,
    pub p2_mw: f64,
    pub q2_mvar: f64,
}

/// Operating point of one injection at the solved state. Active power is
/// the (possibly redistributed) setpoint; the residual slack mismatch of
/// the component is reported separately, not folded in here.
#[derive(Debug, Clone, Serialize)]
pub struct InjectionResult {
    pub name: String,
    pub p_mw: f64,
    pub q_mvar: f64,
    /// "min"/"max" when reactive-limit enforcement pinned the unit
    pub limited: Option<String>,
}

/// Everything the solve produced for one connected component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentResult {
    pub component: usize,
    pub status: ComponentStatus,
    /// Newton iterations summed over all outer-loop cycles
    pub iterations: usize,
    pub outer_loop_cycles: usize,
    /// Residual specified-minus-calculated active power at the reference
    /// bus (MW); near zero when distributed slack is enabled
    pub slack_mismatch_mw: f64,
    pub bus_states: Vec<BusVoltage>,
    pub branch_flows: Vec<BranchFlowResult>,
    pub injections: Vec<InjectionResult>,
    pub notes: SolveNotes,
}

impl ComponentResult {
    fn structural(component: usize, err: &StructuralError) -> Self {
        Self {
            component,
            status: ComponentStatus::Structural(err.to_string()),
            iterations: 0,
            outer_loop_cycles: 0,
            slack_mismatch_mw: 0.0,
            bus_states: Vec::new(),
            branch_flows: Vec::new(),
            injections: Vec::new(),
            notes: SolveNotes::default(),
        }
    }
}

/// Per-component results of one solve.
#[derive(Debug, Clone, Serialize)]
pub struct PowerFlowResults {
    pub components: Vec<ComponentResult>,
}

impl PowerFlowResults {
    pub fn fully_converged(&self) -> bool {
        self.components
            .iter()
            .all(|c| c.status == ComponentStatus::Converged)
    }

    pub fn total_iterations(&self) -> usize {
        self.components.iter().map(|c| c.iterations).sum()
    }

    pub fn component_result(&self, component: usize) -> Option<&ComponentResult> {
        self.components.iter().find(|c| c.component == component)
    }
}

/// Debug artifacts of one component (spec'd as write-only documents).
#[derive(Debug, Clone)]
pub struct ComponentDiagnostics {
    pub component: usize,
    pub equation_system_json: String,
    pub graph_dot: String,
}

/// The power-flow engine: validated configuration plus an optional state
/// cache for carry-over initialization.
pub struct PowerFlowEngine {
    config: PowerFlowConfig,
    cache: Option<(Arc<StateCache>, String)>,
}

impl PowerFlowEngine {
    /// Build an engine, rejecting out-of-range configuration eagerly.
    pub fn new(config: PowerFlowConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            cache: None,
        })
    }

    /// Seed solves from `cache[variant]` and keep the entry updated. The
    /// slot is locked for each solve's whole duration, so two engines
    /// sharing a variant never solve it concurrently.
    pub fn with_cache(mut self, cache: Arc<StateCache>, variant: impl Into<String>) -> Self {
        self.cache = Some((cache, variant.into()));
        self
    }

    pub fn config(&self) -> &PowerFlowConfig {
        &self.config
    }

    /// Solve every connected component and write converged voltages back.
    pub fn solve(&self, network: &mut Network) -> PowerFlowResults {
        let slot = self
            .cache
            .as_ref()
            .map(|(cache, variant)| cache.slot(variant));
        let mut guard = slot
            .as_ref()
            .map(|slot| slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
        let previous: Option<CachedState> = guard.as_ref().and_then(|state| (**state).clone());

        let components = build_components(network, self.config.base_mva);
        info!(components = components.len(), "solving power flow");
        let results: Vec<ComponentResult> = components
            .into_par_iter()
            .enumerate()
            .map(|(i, component)| match component {
                Ok(mut model) => solve_component(&mut model, &self.config, previous.as_ref()),
                Err(err) => {
                    warn!(component = i, %err, "skipping component");
                    ComponentResult::structural(i, &err)
                }
            })
            .collect();

        for result in &results {
            if result.status != ComponentStatus::Converged {
                continue;
            }
            for bus in &result.bus_states {
                if let Err(err) =
                    network.apply_bus_state(bus.bus, PerUnit(bus.v_pu), Radians(bus.angle_rad))
                {
                    warn!(%err, "state write-back failed");
                }
            }
        }

        if let Some(state) = guard.as_deref_mut() {
            let bus_states: Vec<(BusId, f64, f64)> = results
                .iter()
                .filter(|r| r.status == ComponentStatus::Converged)
                .flat_map(|r| r.bus_states.iter().map(|b| (b.bus, b.v_pu, b.angle_rad)))
                .collect();
            if !bus_states.is_empty() {
                *state = Some(CachedState { bus_states });
            }
        }

        PowerFlowResults {
            components: results,
        }
    }

    /// Assemble (without solving) and emit the equation-system and graph
    /// documents per component, for offline inspection.
    pub fn diagnostics(&self, network: &Network) -> Vec<ComponentDiagnostics> {
        build_components(network, self.config.base_mva)
            .into_iter()
            .filter_map(|component| {
                let model = component.ok()?;
                let system = EquationSystem::build(&model).ok()?;
                let equation_system_json = report::equation_system_json(&model, &system).ok()?;
                Some(ComponentDiagnostics {
                    component: model.component,
                    equation_system_json,
                    graph_dot: report::network_dot(&model),
                })
            })
            .collect()
    }
}

fn solve_component(
    model: &mut PfNetwork,
    config: &PowerFlowConfig,
    previous: Option<&CachedState>,
) -> ComponentResult {
    let mut system = match EquationSystem::build(model) {
        Ok(system) => system,
        Err(err) => {
            warn!(component = model.component, %err, "component structurally unsolvable");
            return ComponentResult::structural(model.component, &err);
        }
    };
    let mut backend = backend_for(config.backend);
    let criterion = UniformCriterion {
        kind: config.norm,
        tolerance: config.tolerance,
    };
    let mut x = initial_state(model, &system, config.initializer, backend.as_mut(), previous);

    // Connectivity edge handles align with branch arena indices so outer
    // loops can toggle by branch number; dangling branches become
    // self-loops, which never affect connectivity.
    let endpoints: Vec<(usize, usize)> = model
        .branches
        .iter()
        .map(|br| match (br.bus1, br.bus2) {
            (Some(a), Some(b)) => (a, b),
            (Some(a), None) | (None, Some(a)) => (a, a),
            (None, None) => (0, 0),
        })
        .collect();
    let mut connectivity = analyzer_for(model.buses.len(), endpoints, config.connectivity);
    for branch in &model.branches {
        if !branch.enabled() {
            connectivity.remove_edge(branch.num);
        }
    }

    let mut loops = standard_loops(config);
    let mut notes = SolveNotes::default();
    let realistic = (config.min_realistic_voltage, config.max_realistic_voltage);
    let mut iterations = 0usize;
    let mut cycles = 0usize;

    let status = loop {
        let report = match config.method {
            SolveMethod::NewtonRaphson => newton_solve(
                model,
                &system,
                &mut x,
                backend.as_mut(),
                &criterion,
                &config.scaling,
                config.max_iterations,
                realistic,
            ),
            SolveMethod::NewtonKrylov => newton_krylov_solve(
                model,
                &system,
                &mut x,
                &criterion,
                &config.scaling,
                config.max_iterations,
                realistic,
            ),
        };
        iterations += report.iterations;
        match report.status {
            IterationStatus::Converged => {}
            IterationStatus::MaxIterationReached => break ComponentStatus::MaxIterationReached,
            IterationStatus::SolverFailed => break ComponentStatus::SolverFailed,
            IterationStatus::UnrealisticState => break ComponentStatus::UnrealisticState,
        }

        let mut unstable = false;
        let mut failure: Option<String> = None;
        for pass in loops.iter_mut() {
            let mut context = OuterLoopContext {
                model: &mut *model,
                system: &mut system,
                x: &mut x,
                config,
                connectivity: connectivity.as_mut(),
                notes: &mut notes,
            };
            match pass.check(&mut context) {
                OuterLoopStatus::Stable => {}
                OuterLoopStatus::Unstable => {
                    debug!(pass = pass.name(), "outer loop requests another solve");
                    unstable = true;
                }
                OuterLoopStatus::Failed(reason) => {
                    failure = Some(format!("{}: {reason}", pass.name()));
                    break;
                }
            }
        }
        if let Some(reason) = failure {
            warn!(component = model.component, %reason, "outer loop failed");
            break ComponentStatus::OuterLoopFailed(reason);
        }
        if !unstable {
            break ComponentStatus::Converged;
        }
        cycles += 1;
        if cycles >= config.max_outer_loop_cycles {
            warn!(
                component = model.component,
                cycles, "outer loops did not stabilize within the cycle budget"
            );
            break ComponentStatus::OuterLoopUnstable;
        }
    };

    if status == ComponentStatus::Converged {
        x.apply_to_model(model, system.layout());
        info!(
            component = model.component,
            iterations, cycles, "component converged"
        );
    }

    let layout = system.layout();
    let base = model.base_mva;
    let slack_mismatch_mw = -bus_p_mismatch(model, &x, layout, model.reference) * base;
    let bus_states = model
        .buses
        .iter()
        .map(|b| BusVoltage {
            bus: b.id,
            v_pu: x.values[layout.v(b.num)],
            angle_rad: x.values[layout.angle(b.num)],
        })
        .collect();
    let branch_flows = model
        .branches
        .iter()
        .filter_map(|br| {
            let flow = branch_flow_at(model, &x, layout, br.num)?;
            Some(BranchFlowResult {
                branch: br.id,
                p1_mw: flow.p1 * base,
                q1_mvar: flow.q1 * base,
                p2_mw: flow.p2 * base,
                q2_mvar: flow.q2 * base,
            })
        })
        .collect();
    let injections = injection_outputs(model, &x, layout);

    ComponentResult {
        component: model.component,
        status,
        iterations,
        outer_loop_cycles: cycles,
        slack_mismatch_mw,
        bus_states,
        branch_flows,
        injections,
        notes,
    }
}

/// Recover per-injection operating points: fixed units report their
/// setpoint, voltage controllers split the reactive power the solved
/// state requires of their bus.
fn injection_outputs(model: &PfNetwork, x: &StateVector, layout: &VarLayout) -> Vec<InjectionResult> {
    let base = model.base_mva;
    let mut out = Vec::new();
    for bus in &model.buses {
        if bus.injections.is_empty() {
            continue;
        }
        let q_required = bus_q_calc(model, x, layout, bus.num) + bus.q_load - bus.fixed_q();
        let shares: HashMap<usize, f64> = controller_q_shares(bus, q_required).into_iter().collect();
        for (i, inj) in bus.injections.iter().enumerate() {
            let q = match inj.control {
                ControlMode::ReactivePower { target_q } => target_q,
                ControlMode::Voltage { .. } => shares.get(&i).copied().unwrap_or(0.0),
            };
            out.push(InjectionResult {
                name: inj.name.clone(),
                p_mw: inj.target_p * base,
                q_mvar: q * base,
                limited: inj.limited_at.map(|limit| {
                    match limit {
                        QLimit::Min => "min",
                        QLimit::Max => "max",
                    }
                    .to_string()
                }),
            });
        }
    }
    out
}
