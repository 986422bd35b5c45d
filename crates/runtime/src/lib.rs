//! The agent orchestration runtime: composition of memory, pipeline,
//! reasoning, tools, health, learning, and auth behind the public
//! request/response surface.

mod error;
mod missions;
mod runtime;

pub use error::{AgentError, StartupError};
pub use missions::{Mission, MissionStep};
pub use runtime::{
    AgentRuntime, KnowledgeAnswer, ProcessOptions, ProcessOutcome, ToolCallSummary,
};
