//! Closed-form branch flow expressions and their partial derivatives.
//!
//! A branch is a two-port with series admittance `g + jb`, per-side shunt
//! `g1 + jb1` / `g2 + jb2`, voltage ratio `r1` and phase shift `a1` applied
//! on side 1. With `psi = ph1 - ph2 + a1`:
//!
//! ```text
//! p1 =  r1^2 v1^2 (g + g1) - r1 v1 v2 (g cos psi + b sin psi)
//! q1 = -r1^2 v1^2 (b + b1) - r1 v1 v2 (g sin psi - b cos psi)
//! p2 =       v2^2 (g + g2) - r1 v1 v2 (g cos psi - b sin psi)
//! q2 =      -v2^2 (b + b2) + r1 v1 v2 (g sin psi + b cos psi)
//! ```
//!
//! The same expressions back both the residual evaluation and the Jacobian
//! assembly, with `psi` and `r1` optionally promoted to state variables for
//! phase- and ratio-controlled branches.

use crate::model::PfBranch;

/// Power entering the branch at each side (p.u., load convention: positive
/// leaves the bus).
#[derive(Debug, Clone, Copy, Default)]
pub struct BranchFlow {
    pub p1: f64,
    pub q1: f64,
    pub p2: f64,
    pub q2: f64,
}

impl BranchFlow {
    /// Current magnitude at side 1 (p.u.).
    pub fn i1(&self, v1: f64) -> f64 {
        if v1 > 0.0 {
            (self.p1 * self.p1 + self.q1 * self.q1).sqrt() / v1
        } else {
            0.0
        }
    }
}

/// Evaluate the closed-form flows for the given terminal state. `r1` and
/// `a1` are passed explicitly so control variables can override the branch
/// constants.
pub fn branch_flow_with(
    branch: &PfBranch,
    v1: f64,
    ph1: f64,
    v2: f64,
    ph2: f64,
    r1: f64,
    a1: f64,
) -> BranchFlow {
    let (g, b) = (branch.g, branch.b);
    let psi = ph1 - ph2 + a1;
    let (sin, cos) = psi.sin_cos();
    let v1v2 = r1 * v1 * v2;
    BranchFlow {
        p1: r1 * r1 * v1 * v1 * (g + branch.g1) - v1v2 * (g * cos + b * sin),
        q1: -r1 * r1 * v1 * v1 * (b + branch.b1) - v1v2 * (g * sin - b * cos),
        p2: v2 * v2 * (g + branch.g2) - v1v2 * (g * cos - b * sin),
        q2: -v2 * v2 * (b + branch.b2) + v1v2 * (g * sin + b * cos),
    }
}

/// Evaluate flows using the branch's own ratio and phase constants.
pub fn branch_flow(branch: &PfBranch, v1: f64, ph1: f64, v2: f64, ph2: f64) -> BranchFlow {
    branch_flow_with(branch, v1, ph1, v2, ph2, branch.r1, branch.a1)
}

/// All first-order partials of the four flow expressions.
///
/// `d*_dpsi` is the derivative with respect to `psi = ph1 - ph2 + a1`; the
/// caller maps it onto the angle columns (`+` for ph1 and a1, `-` for ph2).
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowDerivatives {
    pub dp1_dv1: f64,
    pub dp1_dv2: f64,
    pub dp1_dpsi: f64,
    pub dp1_dr1: f64,
    pub dq1_dv1: f64,
    pub dq1_dv2: f64,
    pub dq1_dpsi: f64,
    pub dq1_dr1: f64,
    pub dp2_dv1: f64,
    pub dp2_dv2: f64,
    pub dp2_dpsi: f64,
    pub dp2_dr1: f64,
    pub dq2_dv1: f64,
    pub dq2_dv2: f64,
    pub dq2_dpsi: f64,
    pub dq2_dr1: f64,
}

pub fn flow_derivatives(
    branch: &PfBranch,
    v1: f64,
    ph1: f64,
    v2: f64,
    ph2: f64,
    r1: f64,
    a1: f64,
) -> FlowDerivatives {
    let (g, b) = (branch.g, branch.b);
    let (gg1, bb1) = (g + branch.g1, b + branch.b1);
    let (gg2, bb2) = (g + branch.g2, b + branch.b2);
    let psi = ph1 - ph2 + a1;
    let (sin, cos) = psi.sin_cos();
    let gc_bs = g * cos + b * sin;
    let gs_bc = g * sin - b * cos;
    let gc_mbs = g * cos - b * sin;
    let gs_pbc = g * sin + b * cos;
    FlowDerivatives {
        dp1_dv1: 2.0 * r1 * r1 * v1 * gg1 - r1 * v2 * gc_bs,
        dp1_dv2: -r1 * v1 * gc_bs,
        dp1_dpsi: r1 * v1 * v2 * gs_bc,
        dp1_dr1: 2.0 * r1 * v1 * v1 * gg1 - v1 * v2 * gc_bs,
        dq1_dv1: -2.0 * r1 * r1 * v1 * bb1 - r1 * v2 * gs_bc,
        dq1_dv2: -r1 * v1 * gs_bc,
        dq1_dpsi: -r1 * v1 * v2 * gc_bs,
        dq1_dr1: -2.0 * r1 * v1 * v1 * bb1 - v1 * v2 * gs_bc,
        dp2_dv1: -r1 * v2 * gc_mbs,
        dp2_dv2: 2.0 * v2 * gg2 - r1 * v1 * gc_mbs,
        dp2_dpsi: r1 * v1 * v2 * gs_pbc,
        dp2_dr1: -v1 * v2 * gc_mbs,
        dq2_dv1: r1 * v2 * gs_pbc,
        dq2_dv2: -2.0 * v2 * bb2 + r1 * v1 * gs_pbc,
        dq2_dpsi: r1 * v1 * v2 * gc_mbs,
        dq2_dr1: v1 * v2 * gs_pbc,
    }
}
