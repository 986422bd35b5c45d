//! Reasoning planner and executor.
//!
//! A plan is an ordered list of steps — reason, tool, retrieve, verify —
//! produced by one of three strategies and executed serially with a scoped
//! environment, a hard step cap, and an end-to-end timeout.  Tool steps
//! pass the permission gate before anything runs.

pub mod evolve;
pub mod executor;
pub mod plan;
pub mod strategy;

pub use evolve::{EvolutionParams, evolutionary_plan};
pub use executor::{Executor, StepHost};
pub use plan::{Plan, PlanResult, Step, StepMode, StepOutcome, VerifyOnFail, plan_from_recipe};
pub use strategy::{Planner, StrategyKind, first_principles_plan, zero_shot_plan};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReasonError {
    #[error(transparent)]
    Tool(#[from] sentra_tools::ToolError),

    #[error("reasoning backend failed: {0}")]
    Host(String),

    #[error("verification failed: {0}")]
    VerifyFailed(String),

    #[error("plan execution timed out")]
    Timeout,

    #[error("invalid plan: {0}")]
    InvalidPlan(String),
}

pub type ReasonResult<T> = Result<T, ReasonError>;
