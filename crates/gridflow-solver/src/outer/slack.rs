//! Distributed-slack pass.
//!
//! After a converged solve, the reference bus carries the gap between
//! specified injections and the power the flows actually require (losses
//! plus any generation/load imbalance). This pass spreads that gap across
//! participating units under the configured balance basis, honoring
//! active-power limits: a unit pinned at a limit stops participating, and
//! the leftover is re-spread over the rest. Nothing left with spare
//! capacity is a fatal condition, not a silent stop.

use super::{OuterLoop, OuterLoopContext, OuterLoopStatus};
use crate::config::BalanceType;
use crate::equations::bus_p_mismatch;
use tracing::{debug, warn};

/// Residual mismatch (p.u.) below which distribution is not worth another
/// solve.
const SLACK_DEADBAND: f64 = 1e-6;
/// Headroom (p.u.) below which a unit counts as pinned.
const PINNED_EPSILON: f64 = 1e-9;

#[derive(Debug, Default)]
pub struct DistributedSlack;

impl OuterLoop for DistributedSlack {
    fn name(&self) -> &'static str {
        "distributed-slack"
    }

    fn check(&mut self, ctx: &mut OuterLoopContext<'_>) -> OuterLoopStatus {
        let reference = ctx.model.reference;
        // Specified minus calculated at the reference bus: the power the
        // slack is implicitly providing on top of its setpoint is -mismatch.
        let mismatch = -bus_p_mismatch(ctx.model, ctx.x, ctx.system.layout(), reference);
        if mismatch.abs() < SLACK_DEADBAND {
            return OuterLoopStatus::Stable;
        }
        debug!(
            component = ctx.model.component,
            mismatch_mw = -mismatch * ctx.model.base_mva,
            "distributing slack mismatch"
        );

        match ctx.config.balance_type {
            BalanceType::GenerationHeadroom => distribute_to_generation(ctx, -mismatch),
            BalanceType::Load => distribute_to_load(ctx, -mismatch, false),
            BalanceType::ConformLoad => distribute_to_load(ctx, -mismatch, true),
        }
    }
}

/// Spread `needed` (p.u. of extra injection, signed) across dispatchable
/// units, proportional to explicit participation factors where set and to
/// remaining headroom otherwise. Iterates so that a unit clamped at its
/// limit drops out and the remainder is re-spread.
fn distribute_to_generation(ctx: &mut OuterLoopContext<'_>, needed: f64) -> OuterLoopStatus {
    let base = ctx.model.base_mva;
    let n_injections: usize = ctx.model.buses.iter().map(|b| b.injections.len()).sum();
    let mut remaining = needed;

    for _round in 0..=n_injections {
        if remaining.abs() < SLACK_DEADBAND {
            break;
        }
        // (bus, injection, weight) of every unit with headroom in the
        // needed direction.
        let mut participants = Vec::new();
        let mut total_weight = 0.0;
        for bus in &ctx.model.buses {
            for (i, inj) in bus.injections.iter().enumerate() {
                if !inj.dispatchable {
                    continue;
                }
                let headroom = if remaining > 0.0 {
                    inj.max_p - inj.target_p
                } else {
                    inj.target_p - inj.min_p
                };
                if headroom <= PINNED_EPSILON {
                    continue;
                }
                let weight = inj.participation_factor.unwrap_or(headroom);
                if weight > 0.0 && weight.is_finite() {
                    participants.push((bus.num, i, weight));
                    total_weight += weight;
                }
            }
        }
        if participants.is_empty() || total_weight <= 0.0 {
            return OuterLoopStatus::Failed(format!(
                "no remaining injection with active-power headroom to absorb {:.3} MW",
                remaining * base
            ));
        }

        let mut applied_total = 0.0;
        for (bus, i, weight) in participants {
            let inj = &mut ctx.model.buses[bus].injections[i];
            let share = remaining * weight / total_weight;
            let updated = (inj.target_p + share).clamp(inj.min_p, inj.max_p);
            let applied = updated - inj.target_p;
            if applied == 0.0 {
                continue;
            }
            inj.target_p = updated;
            applied_total += applied;
            *ctx.notes
                .slack_adjustments
                .entry(inj.name.clone())
                .or_insert(0.0) += applied * base;
        }
        remaining -= applied_total;
    }

    if remaining.abs() >= SLACK_DEADBAND {
        return OuterLoopStatus::Failed(format!(
            "slack distribution stalled with {:.3} MW unplaced",
            remaining * base
        ));
    }
    OuterLoopStatus::Unstable
}

/// Reduce (or raise) load in proportion to each bus's demand, the conform
/// part only when `conform_only`. Loads carry no limits, so one round
/// settles the full amount.
fn distribute_to_load(
    ctx: &mut OuterLoopContext<'_>,
    needed: f64,
    conform_only: bool,
) -> OuterLoopStatus {
    let base = ctx.model.base_mva;
    let weight_of = |p_load: f64, conform: f64| if conform_only { conform } else { p_load };
    let total: f64 = ctx
        .model
        .buses
        .iter()
        .map(|b| weight_of(b.p_load, b.conform_p_load))
        .sum();
    if total <= 0.0 {
        let basis = if conform_only { "conform load" } else { "load" };
        return OuterLoopStatus::Failed(format!(
            "no {basis} available to absorb {:.3} MW of slack mismatch",
            needed * base
        ));
    }

    for bus in ctx.model.buses.iter_mut() {
        let weight = weight_of(bus.p_load, bus.conform_p_load);
        if weight <= 0.0 {
            continue;
        }
        // Extra injection needed means less load, and vice versa.
        let delta = needed * weight / total;
        let conform_fraction = if bus.p_load > 0.0 {
            bus.conform_p_load / bus.p_load
        } else {
            0.0
        };
        bus.p_load -= delta;
        bus.conform_p_load -= delta * if conform_only { 1.0 } else { conform_fraction };
        *ctx.notes
            .slack_adjustments
            .entry(format!("loads@{}", bus.name))
            .or_insert(0.0) += delta * base;
    }
    if needed.abs() * base > 1.0 {
        warn!(
            adjusted_mw = needed * base,
            "slack mismatch absorbed by load scaling"
        );
    }
    OuterLoopStatus::Unstable
}
