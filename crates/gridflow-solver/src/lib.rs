//! # gridflow-solver: AC Power-Flow Solving Engine
//!
//! Computes the steady-state operating point (voltage magnitude and angle
//! at every bus, power flow on every branch) of a transmission network
//! described by [`gridflow_core::Network`], given injections and
//! regulation objectives.
//!
//! The crate is organized the way the solve proceeds:
//!
//! - [`model`]: the internal per-unit arena model, built once per
//!   connected component; the numerical layer never touches the external
//!   network directly.
//! - [`connectivity`]: incremental connectivity over arena handles, for
//!   mid-solve topology changes.
//! - [`equations`]: physical/control laws as a square residual/Jacobian
//!   system, one equation per state variable.
//! - [`newton`] / [`krylov`]: the Newton-type iterations (exact
//!   factorization and matrix-free GMRES) with step-scaling safeguards.
//! - [`init`]: start-state strategies, including carry-over from the
//!   keyed [`cache`].
//! - [`outer`]: the correction framework that alternates constraint
//!   enforcement (slack distribution, reactive limits, interchange,
//!   automation, taps) with re-solves.
//! - [`engine`]: orchestration over components, in parallel, with
//!   per-component failure scoping.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use gridflow_core::Network;
//! use gridflow_solver::{PowerFlowConfig, PowerFlowEngine};
//!
//! # fn build_network() -> Network { Network::new() }
//! let mut network = build_network();
//! let engine = PowerFlowEngine::new(PowerFlowConfig::default())?;
//! let results = engine.solve(&mut network);
//! for component in &results.components {
//!     println!("component {}: {:?}", component.component, component.status);
//! }
//! # Ok::<(), gridflow_solver::ConfigError>(())
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod equations;
pub mod init;
pub mod krylov;
pub mod model;
pub mod newton;
pub mod outer;
pub mod report;

pub use backend::{LinearSolveError, LinearSolver};
pub use cache::{CachedState, StateCache};
pub use config::{
    AutomationRule, AutomationTrigger, BackendKind, BalanceType, ConfigError, ConnectivityKind,
    InitMode, NormKind, PilotPoint, PowerFlowConfig, ScalingConfig, ScalingMode, SolveMethod,
};
pub use engine::{
    BranchFlowResult, BusVoltage, ComponentDiagnostics, ComponentResult, ComponentStatus,
    InjectionResult, PowerFlowEngine, PowerFlowResults,
};
pub use newton::{IterationReport, IterationStatus, StoppingCriterion};
pub use outer::{OuterLoop, OuterLoopStatus, SolveNotes};
