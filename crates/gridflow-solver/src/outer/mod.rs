//! Outer-loop correction framework.
//!
//! A fixed, ordered list of passes runs after every Newton convergence.
//! Each pass inspects the solved state and either leaves it alone
//! (`Stable`), mutates the equation system or network and requests another
//! solve (`Unstable`), or reports an unrecoverable condition (`Failed`)
//! that aborts the component. The engine repeats the solve-then-all-passes
//! cycle until one full cycle is stable everywhere or the cycle budget is
//! exhausted.
//!
//! Passes hold indices into the model, never references; a pass that
//! changes an injection's control mode must also swap the corresponding
//! equation so the one-equation-per-variable invariant is re-validated on
//! the spot.

pub mod automation;
pub mod interchange;
pub mod reactive_limits;
pub mod secondary_voltage;
pub mod slack;
pub mod taps;
pub mod voltage_control;

use crate::config::PowerFlowConfig;
use crate::connectivity::ConnectivityAnalyzer;
use crate::equations::{EquationSystem, StateVector};
use crate::model::PfNetwork;
use gridflow_core::BranchId;
use serde::Serialize;
use std::collections::HashMap;

/// Verdict of one pass over a solved state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OuterLoopStatus {
    /// No change needed
    Stable,
    /// The pass mutated the system or network; another solve is required
    Unstable,
    /// Unrecoverable condition; aborts the component with the reason
    Failed(String),
}

/// Everything a pass may inspect or mutate during one check.
pub struct OuterLoopContext<'a> {
    pub model: &'a mut PfNetwork,
    pub system: &'a mut EquationSystem,
    pub x: &'a mut StateVector,
    pub config: &'a PowerFlowConfig,
    pub connectivity: &'a mut dyn ConnectivityAnalyzer,
    pub notes: &'a mut SolveNotes,
}

/// Record of what the outer loops did to a component, carried into the
/// per-component result for reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SolveNotes {
    /// Cumulative active-power delta applied per injection (MW)
    pub slack_adjustments: HashMap<String, f64>,
    /// Injections demoted to fixed reactive power at a limit
    pub limited_injections: Vec<String>,
    /// Injections demoted because their remote target was already claimed
    pub demoted_controllers: Vec<String>,
    /// Branches opened by automation rules
    pub opened_branches: Vec<BranchId>,
    /// Final tap ratio per discrete-controlled branch after snapping
    pub tap_ratios: Vec<(BranchId, f64)>,
}

/// One correction pass.
pub trait OuterLoop: Send {
    fn name(&self) -> &'static str;
    /// Inspect the solved state, correct it if needed, report the verdict.
    fn check(&mut self, ctx: &mut OuterLoopContext<'_>) -> OuterLoopStatus;
}

/// Build the ordered pass list for a configuration. Order matters: slack
/// distribution settles active power before reactive limits are judged,
/// and discrete corrections (automation, tap snapping) come after the
/// continuous ones so they act on a consistent operating point.
pub fn standard_loops(config: &PowerFlowConfig) -> Vec<Box<dyn OuterLoop>> {
    let mut loops: Vec<Box<dyn OuterLoop>> = Vec::new();
    if config.distributed_slack {
        loops.push(Box::new(slack::DistributedSlack::default()));
    }
    if config.enforce_reactive_limits {
        loops.push(Box::new(reactive_limits::ReactiveLimits::default()));
    }
    loops.push(Box::new(voltage_control::VoltageControlFeasibility));
    if !config.interchange_targets.is_empty() {
        loops.push(Box::new(interchange::AreaInterchange));
    }
    if !config.automation_rules.is_empty() {
        loops.push(Box::new(automation::Automation::default()));
    }
    loops.push(Box::new(taps::DiscreteTaps::default()));
    if !config.pilot_points.is_empty() {
        loops.push(Box::new(secondary_voltage::SecondaryVoltage));
    }
    loops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutomationRule, AutomationTrigger, PilotPoint, PowerFlowConfig};
    use gridflow_core::{BranchId, BusId};

    #[test]
    fn test_standard_loop_order() {
        let mut config = PowerFlowConfig::default();
        config.interchange_targets.insert(1, 100.0);
        config.automation_rules.push(AutomationRule {
            monitored_branch: BranchId::new(1),
            trigger: AutomationTrigger::CurrentAbovePu(1.0),
            open_branch: BranchId::new(2),
        });
        config.pilot_points.push(PilotPoint {
            bus: BusId::new(1),
            target_v: 1.0,
            gain: 0.5,
        });
        let names: Vec<&str> = standard_loops(&config).iter().map(|l| l.name()).collect();
        assert_eq!(
            names,
            vec![
                "distributed-slack",
                "reactive-limits",
                "voltage-control-feasibility",
                "area-interchange",
                "automation",
                "discrete-taps",
                "secondary-voltage",
            ]
        );
    }

    #[test]
    fn test_optional_passes_skipped() {
        let config = PowerFlowConfig {
            distributed_slack: false,
            enforce_reactive_limits: false,
            ..PowerFlowConfig::default()
        };
        let names: Vec<&str> = standard_loops(&config).iter().map(|l| l.name()).collect();
        assert_eq!(names, vec!["voltage-control-feasibility", "discrete-taps"]);
    }
}
