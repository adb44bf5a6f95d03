//! Voltage-control feasibility pass.
//!
//! Re-validates, after each solve, that every controlled bus has exactly
//! one owner: a controlled bus claimed from two different controller buses
//! would put two identical voltage rows in the Jacobian, which is
//! structurally singular. Model assembly already resolves the initial
//! configuration; this pass catches claims that re-emerge through control
//! mode changes during the outer-loop process, demoting every claimant
//! after the first to fixed reactive power.

use super::{OuterLoop, OuterLoopContext, OuterLoopStatus};
use crate::equations::EquationKind;
use crate::model::ControlMode;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug)]
pub struct VoltageControlFeasibility;

impl OuterLoop for VoltageControlFeasibility {
    fn name(&self) -> &'static str {
        "voltage-control-feasibility"
    }

    fn check(&mut self, ctx: &mut OuterLoopContext<'_>) -> OuterLoopStatus {
        // The size invariant must already hold; a violation here means an
        // earlier pass left the system inconsistent.
        if let Err(err) = ctx.system.validate() {
            return OuterLoopStatus::Failed(err.to_string());
        }

        // controlled bus -> first controller bus seen
        let mut owner: HashMap<usize, usize> = HashMap::new();
        let mut demotions: Vec<(usize, usize)> = Vec::new();
        for bus in &ctx.model.buses {
            for (i, inj) in bus.injections.iter().enumerate() {
                if let ControlMode::Voltage { controlled_bus, .. } = inj.control {
                    match owner.get(&controlled_bus) {
                        None => {
                            owner.insert(controlled_bus, bus.num);
                        }
                        Some(&first) if first == bus.num => {}
                        Some(&first) => {
                            warn!(
                                injection = %inj.name,
                                controlled_bus,
                                kept_controller_bus = first,
                                "simultaneous remote voltage targets, demoting later claimant"
                            );
                            demotions.push((bus.num, i));
                        }
                    }
                }
            }
        }
        if demotions.is_empty() {
            return OuterLoopStatus::Stable;
        }

        let mut affected = Vec::new();
        for (bus, i) in demotions {
            let inj = &mut ctx.model.buses[bus].injections[i];
            ctx.notes.demoted_controllers.push(inj.name.clone());
            inj.switch_to_reactive_power(0.0, None);
            if !affected.contains(&bus) {
                affected.push(bus);
            }
        }
        for bus in affected {
            if ctx.model.buses[bus].has_voltage_controller() {
                continue;
            }
            let slot = ctx.system.v_slot(bus);
            if let Err(err) = ctx
                .system
                .swap_equation(slot, EquationKind::BusQ(bus), ctx.model)
            {
                return OuterLoopStatus::Failed(err.to_string());
            }
        }
        OuterLoopStatus::Unstable
    }
}
