//! Mode-aware permission resolution.
//!
//! Resolution consults, in order: per-tool overrides, the active user mode,
//! the global simulation flag.  Two hard rules sit above everything else:
//! `safe`/`simulation`/`training` modes always yield `simulation_only`, and
//! `beginner` always requires approval for tools with write/network/
//! destructive side effects.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{ToolDescriptor, ToolError, ToolResult};

/// Coarse safety profile for the active user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Beginner,
    Pro,
    Safe,
    Simulation,
    Training,
}

impl Mode {
    /// Modes in which no tool may ever touch an external system.
    fn forces_simulation(self) -> bool {
        matches!(self, Mode::Safe | Mode::Simulation | Mode::Training)
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "beginner" => Ok(Mode::Beginner),
            "pro" => Ok(Mode::Pro),
            "safe" => Ok(Mode::Safe),
            "simulation" => Ok(Mode::Simulation),
            "training" => Ok(Mode::Training),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

/// Per-tool permission override; unset fields defer to the mode rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolOverride {
    pub allow: Option<bool>,
    pub require_approval: Option<bool>,
    pub simulation_only: Option<bool>,
}

/// Explicit runtime posture passed to the planner — there is no global
/// mutable mode state.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub mode: Mode,
    pub simulate_all: bool,
    pub overrides: HashMap<String, ToolOverride>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Safe,
            simulate_all: false,
            overrides: HashMap::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionDecision {
    pub allow: bool,
    pub require_approval: bool,
    pub simulation_only: bool,
}

/// How an authorized tool step must execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Real,
    Simulated,
}

/// Resolve the permission decision for `descriptor` under `config`.
pub fn resolve(descriptor: &ToolDescriptor, config: &RuntimeConfig) -> PermissionDecision {
    let override_entry = config.overrides.get(&descriptor.name);

    let mode_requires_approval = config.mode == Mode::Beginner && descriptor.is_risky();

    let allow = override_entry.and_then(|o| o.allow).unwrap_or(true);
    let require_approval = override_entry
        .and_then(|o| o.require_approval)
        .unwrap_or(mode_requires_approval)
        // Beginner approval for risky tools is a floor, not a default.
        || mode_requires_approval;
    let simulation_only = override_entry
        .and_then(|o| o.simulation_only)
        .unwrap_or(false)
        || config.mode.forces_simulation()
        || config.simulate_all;

    let decision = PermissionDecision {
        allow,
        require_approval,
        simulation_only,
    };
    trace!(tool = %descriptor.name, mode = ?config.mode, ?decision, "permission resolved");
    decision
}

/// Turn a decision into an execution mode, enforcing approval tokens.
///
/// A denied tool is [`ToolError::NotPermitted`]; a tool that needs approval
/// without a token is [`ToolError::ApprovalRequired`] — the two are distinct
/// so callers can prompt instead of aborting.
pub fn authorize(
    descriptor: &ToolDescriptor,
    decision: PermissionDecision,
    approval_token: Option<&str>,
) -> ToolResult<ExecutionMode> {
    if !decision.allow {
        return Err(ToolError::NotPermitted(descriptor.name.clone()));
    }
    if decision.require_approval && approval_token.map(str::trim).filter(|t| !t.is_empty()).is_none()
    {
        return Err(ToolError::ApprovalRequired(descriptor.name.clone()));
    }
    Ok(if decision.simulation_only {
        ExecutionMode::Simulated
    } else {
        ExecutionMode::Real
    })
}
