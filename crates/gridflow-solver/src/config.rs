//! Power-flow configuration.
//!
//! Every recognized option is validated eagerly by [`PowerFlowConfig::validate`]
//! before any solve starts; an out-of-range parameter is a configuration
//! error, never a mid-solve surprise.

use gridflow_core::{BranchId, BusId, Degrees};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Linear-solver backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Dense Gaussian elimination with partial pivoting (fallback)
    Gauss,
    /// Dense LU via faer
    FaerLu,
    /// Sparse LU via rsparse
    RsparseLu,
}

/// Outer nonlinear method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveMethod {
    /// Newton with an exact sparse/dense factorization per iteration
    NewtonRaphson,
    /// Matrix-free Newton-Krylov (inner GMRES on directional derivatives)
    NewtonKrylov,
}

/// Incremental-connectivity strategy for mid-solve topology changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityKind {
    /// Full BFS recompute per change (small networks, reference behavior)
    Naive,
    /// Union-find spanning forest with rebuild on forest-edge loss
    Decremental,
}

/// Residual norm used by the convergence test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormKind {
    /// Largest absolute component
    Max,
    /// Euclidean norm
    L2,
}

/// State-vector step scaling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMode {
    /// Accept the full Newton step
    None,
    /// Clip the step so per-iteration voltage/angle changes stay bounded
    MaxVoltageChange,
    /// Backtrack by a fold factor until the residual norm stops worsening
    LineSearch,
}

/// Parameters for the step-scaling strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    pub mode: ScalingMode,
    /// Largest per-iteration voltage magnitude change (p.u.)
    pub max_dv: f64,
    /// Largest per-iteration angle change (rad)
    pub max_dphi: f64,
    /// Step divisor per backtrack attempt (> 1)
    pub fold: f64,
    /// Maximum backtrack attempts
    pub max_steps: usize,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            mode: ScalingMode::None,
            max_dv: 0.1,
            max_dphi: 0.2,
            fold: 2.0,
            max_steps: 8,
        }
    }
}

/// Voltage initializer selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitMode {
    /// Flat start, or DC approximation when large phase shifts are present
    Auto,
    /// All magnitudes at targets/1 p.u., all angles zero
    Flat,
    /// Angles from a linearized active-power solve
    DcApprox,
    /// Magnitudes from a linearized reactive solve, angles zero
    MagnitudeOnly,
    /// Carry over the last solved state from the cache
    Previous,
}

/// Basis for distributing the slack active-power mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceType {
    /// Across generators, proportional to remaining headroom (or explicit
    /// participation factors where set)
    GenerationHeadroom,
    /// Across loads, proportional to their active power
    Load,
    /// Across loads flagged as conform, proportional to active power
    ConformLoad,
}

/// Condition that fires an automation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationTrigger {
    /// Current magnitude on the monitored branch above a per-unit threshold
    CurrentAbovePu(f64),
    /// Terminal angle difference above a threshold; must lie in [0, 360)
    AngleDifferenceAbove(Degrees),
}

/// A threshold-triggered topology action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRule {
    pub monitored_branch: BranchId,
    pub trigger: AutomationTrigger,
    /// Branch to open when the trigger fires
    pub open_branch: BranchId,
}

/// A pilot point for secondary voltage control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PilotPoint {
    pub bus: BusId,
    pub target_v: f64,
    /// Fraction of the pilot error applied to controller targets per cycle
    pub gain: f64,
}

/// Configuration error, rejected before any solve starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("base MVA must be positive, got {0}")]
    BadBaseMva(f64),
    #[error("max iterations must be at least 1")]
    BadMaxIterations,
    #[error("convergence tolerance must be positive and finite, got {0}")]
    BadTolerance(f64),
    #[error("scaling parameter {name} must be positive, got {value}")]
    BadScalingParameter { name: &'static str, value: f64 },
    #[error("line-search fold factor must be greater than 1, got {0}")]
    BadFoldFactor(f64),
    #[error("line-search attempts must be at least 1")]
    BadLineSearchSteps,
    #[error("max outer-loop cycles must be at least 1")]
    BadOuterLoopCycles,
    #[error("realistic voltage bounds must satisfy 0 < min < max, got [{0}, {1}]")]
    BadRealisticVoltageBounds(f64, f64),
    #[error("automation current threshold must be non-negative, got {0}")]
    BadCurrentThreshold(f64),
    #[error("automation angle threshold must lie in [0, 360) degrees, got {0}")]
    BadAngleThreshold(f64),
    #[error("interchange tolerance must be positive, got {0}")]
    BadInterchangeTolerance(f64),
    #[error("pilot point target voltage must be positive, got {0}")]
    BadPilotTarget(f64),
    #[error("pilot point gain must lie in (0, 1], got {0}")]
    BadPilotGain(f64),
}

/// Structured configuration of the whole solve.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerFlowConfig {
    pub base_mva: f64,
    pub backend: BackendKind,
    pub method: SolveMethod,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub norm: NormKind,
    pub scaling: ScalingConfig,
    pub initializer: InitMode,
    pub connectivity: ConnectivityKind,
    pub balance_type: BalanceType,
    /// Distribute slack mismatch across participating injections
    pub distributed_slack: bool,
    pub enforce_reactive_limits: bool,
    pub max_outer_loop_cycles: usize,
    pub min_realistic_voltage: f64,
    pub max_realistic_voltage: f64,
    /// Net interchange target per area (MW, positive = export)
    pub interchange_targets: HashMap<i64, f64>,
    pub interchange_tolerance_mw: f64,
    pub automation_rules: Vec<AutomationRule>,
    pub pilot_points: Vec<PilotPoint>,
}

impl Default for PowerFlowConfig {
    fn default() -> Self {
        Self {
            base_mva: 100.0,
            backend: BackendKind::FaerLu,
            method: SolveMethod::NewtonRaphson,
            max_iterations: 30,
            tolerance: 1e-8,
            norm: NormKind::Max,
            scaling: ScalingConfig::default(),
            initializer: InitMode::Auto,
            connectivity: ConnectivityKind::Decremental,
            balance_type: BalanceType::GenerationHeadroom,
            distributed_slack: true,
            enforce_reactive_limits: true,
            max_outer_loop_cycles: 20,
            min_realistic_voltage: 0.5,
            max_realistic_voltage: 1.5,
            interchange_targets: HashMap::new(),
            interchange_tolerance_mw: 1.0,
            automation_rules: Vec::new(),
            pilot_points: Vec::new(),
        }
    }
}

impl PowerFlowConfig {
    /// Check every recognized option, rejecting out-of-range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_mva > 0.0) {
            return Err(ConfigError::BadBaseMva(self.base_mva));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::BadMaxIterations);
        }
        if !(self.tolerance > 0.0 && self.tolerance.is_finite()) {
            return Err(ConfigError::BadTolerance(self.tolerance));
        }
        if !(self.scaling.max_dv > 0.0) {
            return Err(ConfigError::BadScalingParameter {
                name: "max_dv",
                value: self.scaling.max_dv,
            });
        }
        if !(self.scaling.max_dphi > 0.0) {
            return Err(ConfigError::BadScalingParameter {
                name: "max_dphi",
                value: self.scaling.max_dphi,
            });
        }
        if !(self.scaling.fold > 1.0) {
            return Err(ConfigError::BadFoldFactor(self.scaling.fold));
        }
        if self.scaling.max_steps == 0 {
            return Err(ConfigError::BadLineSearchSteps);
        }
        if self.max_outer_loop_cycles == 0 {
            return Err(ConfigError::BadOuterLoopCycles);
        }
        if !(self.min_realistic_voltage > 0.0
            && self.min_realistic_voltage < self.max_realistic_voltage)
        {
            return Err(ConfigError::BadRealisticVoltageBounds(
                self.min_realistic_voltage,
                self.max_realistic_voltage,
            ));
        }
        if !(self.interchange_tolerance_mw > 0.0) {
            return Err(ConfigError::BadInterchangeTolerance(
                self.interchange_tolerance_mw,
            ));
        }
        for rule in &self.automation_rules {
            match &rule.trigger {
                AutomationTrigger::CurrentAbovePu(i) => {
                    if !(*i >= 0.0) {
                        return Err(ConfigError::BadCurrentThreshold(*i));
                    }
                }
                AutomationTrigger::AngleDifferenceAbove(deg) => {
                    let d = deg.value();
                    if !(0.0..360.0).contains(&d) {
                        return Err(ConfigError::BadAngleThreshold(d));
                    }
                }
            }
        }
        for pilot in &self.pilot_points {
            if !(pilot.target_v > 0.0) {
                return Err(ConfigError::BadPilotTarget(pilot.target_v));
            }
            if !(pilot.gain > 0.0 && pilot.gain <= 1.0) {
                return Err(ConfigError::BadPilotGain(pilot.gain));
            }
        }
        Ok(())
    }
}
