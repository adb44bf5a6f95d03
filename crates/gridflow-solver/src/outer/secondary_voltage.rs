//! Secondary (pilot-point) voltage control pass.
//!
//! Primary control holds individual controller targets; secondary control
//! watches a few pilot buses that stand in for the voltage profile of a
//! zone and trims every controller target by a fraction of the pilot
//! error each cycle. The gain stays in (0, 1] so consecutive cycles
//! contract toward the pilot target instead of oscillating around it.

use super::{OuterLoop, OuterLoopContext, OuterLoopStatus};
use crate::model::ControlMode;
use tracing::{debug, warn};

/// Pilot error (p.u.) considered close enough.
const PILOT_DEADBAND: f64 = 1e-3;

#[derive(Debug)]
pub struct SecondaryVoltage;

impl OuterLoop for SecondaryVoltage {
    fn name(&self) -> &'static str {
        "secondary-voltage"
    }

    fn check(&mut self, ctx: &mut OuterLoopContext<'_>) -> OuterLoopStatus {
        let mut changed = false;
        for pilot in &ctx.config.pilot_points {
            let Some(bus) = ctx.model.bus_index(pilot.bus) else {
                continue; // pilot lives in another component
            };
            let v = ctx.x.values[ctx.system.layout().v(bus)];
            let error = pilot.target_v - v;
            if error.abs() <= PILOT_DEADBAND {
                continue;
            }

            let mut adjusted = 0usize;
            for model_bus in ctx.model.buses.iter_mut() {
                for inj in model_bus.injections.iter_mut() {
                    if let ControlMode::Voltage { target_v, .. } = &mut inj.control {
                        *target_v = (*target_v + pilot.gain * error).clamp(
                            ctx.config.min_realistic_voltage,
                            ctx.config.max_realistic_voltage,
                        );
                        adjusted += 1;
                    }
                }
            }
            if adjusted == 0 {
                // Nothing left to steer with; the pilot target is simply
                // not attainable, which is worth reporting but not fatal.
                warn!(
                    pilot_bus = pilot.bus.value(),
                    "no voltage controller available for pilot point"
                );
                continue;
            }
            debug!(
                pilot_bus = pilot.bus.value(),
                error_pu = error,
                controllers = adjusted,
                "trimming controller targets toward pilot voltage"
            );
            changed = true;
        }

        if changed {
            OuterLoopStatus::Unstable
        } else {
            OuterLoopStatus::Stable
        }
    }
}
