//! Threshold-triggered automation pass.
//!
//! Configured rules monitor a branch quantity (current magnitude or
//! terminal angle difference) at the solved state and open a designated
//! branch when the threshold is crossed, the way a protection relay or a
//! system-integrity scheme would. Opening goes through the incremental
//! connectivity analyzer: an action that would split the component is
//! refused with a warning, since each component must stay independently
//! solvable. Every rule fires at most once per solve.

use super::{OuterLoop, OuterLoopContext, OuterLoopStatus};
use crate::config::AutomationTrigger;
use crate::equations::branch_flow_at;
use std::collections::HashSet;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct Automation {
    fired: HashSet<usize>,
}

impl OuterLoop for Automation {
    fn name(&self) -> &'static str {
        "automation"
    }

    fn check(&mut self, ctx: &mut OuterLoopContext<'_>) -> OuterLoopStatus {
        let mut changed = false;
        for (idx, rule) in ctx.config.automation_rules.iter().enumerate() {
            if self.fired.contains(&idx) {
                continue;
            }
            let Some(monitored) = ctx.model.branch_index(rule.monitored_branch) else {
                continue; // monitored branch lives in another component
            };
            let layout = ctx.system.layout();
            let Some(flow) = branch_flow_at(ctx.model, ctx.x, layout, monitored) else {
                continue;
            };
            let branch = &ctx.model.branches[monitored];
            let triggered = match &rule.trigger {
                AutomationTrigger::CurrentAbovePu(limit) => {
                    let v1 = branch
                        .bus1
                        .map(|b| ctx.x.values[layout.v(b)])
                        .unwrap_or(1.0);
                    flow.i1(v1) > *limit
                }
                AutomationTrigger::AngleDifferenceAbove(threshold) => {
                    let (Some(b1), Some(b2)) = (branch.bus1, branch.bus2) else {
                        continue;
                    };
                    let diff = ctx.x.values[layout.angle(b1)] - ctx.x.values[layout.angle(b2)];
                    diff.abs().to_degrees() > threshold.value()
                }
            };
            if !triggered {
                continue;
            }

            let Some(open) = ctx.model.branch_index(rule.open_branch) else {
                warn!(
                    branch = rule.open_branch.value(),
                    "automation target branch not in this component"
                );
                continue;
            };
            if !ctx.model.branches[open].enabled() {
                continue;
            }
            if !ctx.model.branches[open].disconnection_allowed {
                warn!(
                    branch = %ctx.model.branches[open].name,
                    "automation refused: branch disconnection not allowed"
                );
                continue;
            }
            if layout.alpha(open).is_some() || layout.rho(open).is_some() {
                warn!(
                    branch = %ctx.model.branches[open].name,
                    "automation refused: branch carries an active control variable"
                );
                continue;
            }
            if ctx.connectivity.splits(open) {
                warn!(
                    branch = %ctx.model.branches[open].name,
                    "automation refused: opening would split the component"
                );
                continue;
            }

            ctx.connectivity.remove_edge(open);
            ctx.model.branches[open].connected1 = false;
            info!(
                branch = %ctx.model.branches[open].name,
                rule = idx,
                "automation opened branch"
            );
            ctx.notes.opened_branches.push(ctx.model.branches[open].id);
            self.fired.insert(idx);
            changed = true;
        }

        if changed {
            OuterLoopStatus::Unstable
        } else {
            OuterLoopStatus::Stable
        }
    }
}
