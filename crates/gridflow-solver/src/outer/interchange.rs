//! Area-interchange control pass.
//!
//! Each area with a configured target must export its target net power
//! over the tie branches that cross its boundary. The pass measures the
//! solved tie flows and shifts the area's dispatchable generation by the
//! shortfall, within limits; the distributed-slack pass then rebalances
//! the rest of the system around the shifted dispatch. An area whose
//! dispatchable units are all pinned cannot meet its target, which is
//! fatal for the component.

use super::{OuterLoop, OuterLoopContext, OuterLoopStatus};
use crate::equations::branch_flow_at;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug)]
pub struct AreaInterchange;

impl OuterLoop for AreaInterchange {
    fn name(&self) -> &'static str {
        "area-interchange"
    }

    fn check(&mut self, ctx: &mut OuterLoopContext<'_>) -> OuterLoopStatus {
        let base = ctx.model.base_mva;
        // Net export per area: power entering tie branches from its buses.
        let mut export: HashMap<i64, f64> = HashMap::new();
        {
            let layout = ctx.system.layout();
            for br in 0..ctx.model.branches.len() {
                let branch = &ctx.model.branches[br];
                let (Some(b1), Some(b2)) = (branch.bus1, branch.bus2) else {
                    continue;
                };
                let (a1, a2) = (ctx.model.buses[b1].area, ctx.model.buses[b2].area);
                if a1 == a2 {
                    continue;
                }
                let Some(flow) = branch_flow_at(ctx.model, ctx.x, layout, br) else {
                    continue;
                };
                if let Some(area) = a1 {
                    *export.entry(area).or_insert(0.0) += flow.p1;
                }
                if let Some(area) = a2 {
                    *export.entry(area).or_insert(0.0) += flow.p2;
                }
            }
        }

        let mut changed = false;
        for (&area, &target_mw) in &ctx.config.interchange_targets {
            // Areas absent from this component are someone else's problem.
            let Some(&actual) = export.get(&area) else {
                continue;
            };
            let error = target_mw / base - actual;
            if error.abs() * base <= ctx.config.interchange_tolerance_mw {
                continue;
            }
            debug!(
                area,
                target_mw,
                actual_mw = actual * base,
                "shifting area generation toward interchange target"
            );

            // Shift area generation by the shortfall, proportional to
            // headroom, clamping at limits.
            let mut participants = Vec::new();
            let mut total_weight = 0.0;
            for bus in &ctx.model.buses {
                if bus.area != Some(area) {
                    continue;
                }
                for (i, inj) in bus.injections.iter().enumerate() {
                    if !inj.dispatchable {
                        continue;
                    }
                    let headroom = if error > 0.0 {
                        inj.max_p - inj.target_p
                    } else {
                        inj.target_p - inj.min_p
                    };
                    if headroom > 1e-9 && headroom.is_finite() {
                        participants.push((bus.num, i, headroom));
                        total_weight += headroom;
                    }
                }
            }
            if participants.is_empty() || total_weight <= 0.0 {
                return OuterLoopStatus::Failed(format!(
                    "interchange target of {target_mw} MW for area {area} infeasible: no dispatchable capacity left"
                ));
            }
            for (bus, i, weight) in participants {
                let inj = &mut ctx.model.buses[bus].injections[i];
                let share = error * weight / total_weight;
                let updated = (inj.target_p + share).clamp(inj.min_p, inj.max_p);
                let applied = updated - inj.target_p;
                inj.target_p = updated;
                *ctx.notes
                    .slack_adjustments
                    .entry(inj.name.clone())
                    .or_insert(0.0) += applied * base;
            }
            changed = true;
        }

        if changed {
            OuterLoopStatus::Unstable
        } else {
            OuterLoopStatus::Stable
        }
    }
}
