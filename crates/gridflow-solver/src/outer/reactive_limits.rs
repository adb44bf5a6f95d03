//! Reactive-limit enforcement pass.
//!
//! At a converged operating point the reactive output of every
//! voltage-controlling injection is implied, not specified: it is whatever
//! holds the controlled voltage. When that implied output leaves the
//! unit's [min, max] band, the unit cannot actually hold the voltage; it
//! is switched to fixed reactive power at the violated limit, its voltage
//! equation is swapped for the bus's reactive balance, and the component
//! is re-solved. Losing every controller network-wide leaves nothing
//! holding voltage anywhere and is a fatal condition.

use super::{OuterLoop, OuterLoopContext, OuterLoopStatus};
use crate::equations::{bus_q_calc, EquationKind};
use crate::model::{PfBus, QLimit};
use tracing::warn;

/// Violation (p.u.) tolerated before a switch; keeps borderline units from
/// flapping between cycles.
const VIOLATION_EPSILON: f64 = 1e-6;

#[derive(Debug, Default)]
pub struct ReactiveLimits;

/// Split a bus's required controller output across its voltage-controlling
/// injections: proportional to reactive range when every range is finite,
/// evenly otherwise. Returns `(injection index, share)` pairs.
pub(crate) fn controller_q_shares(bus: &PfBus, q_required: f64) -> Vec<(usize, f64)> {
    let controllers: Vec<usize> = bus
        .injections
        .iter()
        .enumerate()
        .filter(|(_, inj)| inj.is_voltage_controlling())
        .map(|(i, _)| i)
        .collect();
    if controllers.is_empty() {
        return Vec::new();
    }
    let ranges: Vec<f64> = controllers
        .iter()
        .map(|&i| bus.injections[i].max_q - bus.injections[i].min_q)
        .collect();
    let proportional = ranges.iter().all(|r| r.is_finite() && *r > 0.0);
    let total: f64 = if proportional {
        ranges.iter().sum()
    } else {
        controllers.len() as f64
    };
    controllers
        .iter()
        .zip(&ranges)
        .map(|(&i, &range)| {
            let weight = if proportional { range } else { 1.0 };
            (i, q_required * weight / total)
        })
        .collect()
}

impl OuterLoop for ReactiveLimits {
    fn name(&self) -> &'static str {
        "reactive-limits"
    }

    fn check(&mut self, ctx: &mut OuterLoopContext<'_>) -> OuterLoopStatus {
        // Decide first, mutate after: shares are computed against the
        // solved state, not a half-switched one.
        let mut to_switch: Vec<(usize, usize, f64, QLimit)> = Vec::new();
        {
            let layout = ctx.system.layout();
            for bus in &ctx.model.buses {
                if !bus.has_voltage_controller() {
                    continue;
                }
                let q_required =
                    bus_q_calc(ctx.model, ctx.x, layout, bus.num) + bus.q_load - bus.fixed_q();
                for (i, share) in controller_q_shares(bus, q_required) {
                    let inj = &bus.injections[i];
                    if share < inj.min_q - VIOLATION_EPSILON {
                        to_switch.push((bus.num, i, inj.min_q, QLimit::Min));
                    } else if share > inj.max_q + VIOLATION_EPSILON {
                        to_switch.push((bus.num, i, inj.max_q, QLimit::Max));
                    }
                }
            }
        }
        if to_switch.is_empty() {
            return OuterLoopStatus::Stable;
        }

        let base = ctx.model.base_mva;
        let mut affected_buses = Vec::new();
        for (bus, i, q_limit, limit) in to_switch {
            let inj = &mut ctx.model.buses[bus].injections[i];
            warn!(
                injection = %inj.name,
                q_mvar = q_limit * base,
                "reactive limit reached, switching to fixed reactive power"
            );
            ctx.notes.limited_injections.push(inj.name.clone());
            inj.switch_to_reactive_power(q_limit, Some(limit));
            if !affected_buses.contains(&bus) {
                affected_buses.push(bus);
            }
        }

        // A bus whose controllers are all gone reverts to reactive balance.
        for bus in affected_buses {
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

        if ctx.model.voltage_controller_count() == 0 {
            return OuterLoopStatus::Failed(
                "all voltage controllers reached their reactive limits".to_string(),
            );
        }
        OuterLoopStatus::Unstable
    }
}
