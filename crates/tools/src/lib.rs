use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Tool trait and registry ──────────────────────────────────────────────────

/// Side-effect classes a tool may declare.  The permission gate keys its
/// approval rules off these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideEffect {
    Read,
    Write,
    Network,
    Destructive,
}

/// Static metadata about a tool: identity, argument schema, declared
/// side effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub category: String,
    /// JSON Schema for the argument object.
    pub args_schema: serde_json::Value,
    pub side_effects: Vec<SideEffect>,
}

impl ToolDescriptor {
    pub fn has_side_effect(&self, effect: SideEffect) -> bool {
        self.side_effects.contains(&effect)
    }

    /// True when the tool does anything beyond reading.
    pub fn is_risky(&self) -> bool {
        self.side_effects.iter().any(|e| {
            matches!(e, SideEffect::Write | SideEffect::Network | SideEffect::Destructive)
        })
    }
}

/// The result returned after a tool runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool '{0}' is not permitted in the current mode")]
    NotPermitted(String),

    #[error("tool '{0}' requires approval and no approval token was supplied")]
    ApprovalRequired(String),

    #[error("tool '{0}' is rate limited")]
    RateLimited(String),

    #[error("tool execution failed: {0}")]
    Failed(String),
}

pub type ToolResult<T> = Result<T, ToolError>;

/// Trait implemented by every pluggable executor behind the registry.
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;
    async fn run(&self, args: &HashMap<String, String>) -> ToolResult<ToolOutput>;
}

/// Canonical output of a simulated tool step.  Simulated runs never touch
/// external systems.
pub fn simulated_output(tool: &str) -> String {
    format!("[SIMULATED OUTPUT for {tool}]")
}

/// Central registry for all available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.descriptor().name == name)
            .map(|t| t.as_ref())
    }

    /// All descriptors, optionally restricted to one category.
    pub fn list(&self, category: Option<&str>) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .map(|t| t.descriptor())
            .filter(|d| category.map(|c| d.category == c).unwrap_or(true))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ── Permission gate ──────────────────────────────────────────────────────────

pub mod permission;
pub use permission::{
    ExecutionMode, Mode, PermissionDecision, RuntimeConfig, ToolOverride, authorize, resolve,
};

// ── Tests ────────────────────────────────────────────────────────────────────
