//! Discrete-tap snapping pass.
//!
//! Ratio-controlled branches solve with a continuous tap variable, but a
//! physical changer only offers discrete positions. After the continuous
//! solution settles, this pass snaps each stepped changer to its nearest
//! allowed position and freezes it there by swapping the branch's voltage
//! equation for a tap-position pin, then requests one more solve so the
//! rest of the state adjusts to the quantized ratio. Each changer is
//! snapped once per solve.

use super::{OuterLoop, OuterLoopContext, OuterLoopStatus};
use crate::equations::EquationKind;
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::info;

#[derive(Debug, Default)]
pub struct DiscreteTaps {
    snapped: HashSet<usize>,
}

impl OuterLoop for DiscreteTaps {
    fn name(&self) -> &'static str {
        "discrete-taps"
    }

    fn check(&mut self, ctx: &mut OuterLoopContext<'_>) -> OuterLoopStatus {
        let mut changed = false;
        for br in 0..ctx.model.branches.len() {
            if self.snapped.contains(&br) {
                continue;
            }
            let Some(col) = ctx.system.layout().rho(br) else {
                continue; // not under continuous control
            };
            let Some(steps) = ctx.model.branches[br].tap_steps.clone() else {
                continue; // continuous changer, nothing to quantize
            };
            let rho = ctx.x.values[col];
            if rho == 0.0 {
                continue;
            }
            let tap = 1.0 / rho;
            let Some(nearest) = steps.iter().copied().min_by(|a, b| {
                (a - tap)
                    .abs()
                    .partial_cmp(&(b - tap).abs())
                    .unwrap_or(Ordering::Equal)
            }) else {
                continue;
            };

            let frozen_rho = 1.0 / nearest;
            ctx.model.branches[br].r1 = frozen_rho;
            ctx.x.values[col] = frozen_rho;
            if let Err(err) =
                ctx.system
                    .swap_equation(col, EquationKind::TapPosition(br), ctx.model)
            {
                return OuterLoopStatus::Failed(err.to_string());
            }
            info!(
                branch = %ctx.model.branches[br].name,
                continuous_tap = tap,
                snapped_tap = nearest,
                "tap snapped to nearest step"
            );
            ctx.notes
                .tap_ratios
                .push((ctx.model.branches[br].id, nearest));
            self.snapped.insert(br);
            changed = true;
        }

        if changed {
            OuterLoopStatus::Unstable
        } else {
            OuterLoopStatus::Stable
        }
    }
}
