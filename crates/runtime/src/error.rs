//! The public error taxonomy.
//!
//! Library crates carry their own typed errors; everything crossing the
//! runtime boundary converts into [`AgentError`] with a stable string code
//! and a request id correlating to audit entries.

use thiserror::Error;
use uuid::Uuid;

use sentra_auth::AuthError;
use sentra_llm::LlmError;
use sentra_memory::MemoryError;
use sentra_pipeline::PipelineError;
use sentra_reasoning::ReasonError;
use sentra_tools::ToolError;
use sentra_vault::VaultError;

/// Startup failures map directly to process exit codes.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Exit code 64.
    #[error("configuration error: {0}")]
    Config(String),

    /// Exit code 70.
    #[error("unrecoverable persistence failure: {0}")]
    PersistenceCorrupt(String),

    /// Exit code 74.
    #[error("backend unavailable at startup: {0}")]
    BackendUnavailable(String),
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Config(_) => 64,
            StartupError::PersistenceCorrupt(_) => 70,
            StartupError::BackendUnavailable(_) => 74,
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {message}")]
    Config { message: String, request_id: Uuid },

    #[error("validation error: {message}")]
    Validation { message: String, request_id: Uuid },

    #[error("authentication failed: {message}")]
    Authentication { message: String, request_id: Uuid },

    #[error("not authorized: {message}")]
    Authorization { message: String, request_id: Uuid },

    #[error("tool not permitted: {message}")]
    ToolNotPermitted { message: String, request_id: Uuid },

    #[error("approval required: {message}")]
    ApprovalRequired { message: String, request_id: Uuid },

    #[error("backend unavailable: {message}")]
    BackendUnavailable { message: String, request_id: Uuid },

    #[error("timed out: {message}")]
    Timeout { message: String, request_id: Uuid },

    #[error("rate limited: {message}")]
    RateLimited { message: String, request_id: Uuid },

    #[error("circuit open: {message}")]
    CircuitOpen { message: String, request_id: Uuid },

    #[error("persistent store corrupt: {message}")]
    PersistenceCorrupt { message: String, request_id: Uuid },

    #[error("generation unavailable: {message}")]
    GenerationUnavailable { message: String, request_id: Uuid },

    #[error("not found: {message}")]
    NotFound { message: String, request_id: Uuid },

    #[error("conflicting state: {message}")]
    ConflictingState { message: String, request_id: Uuid },

    /// Details stay server-side; callers get the code and the request id.
    #[error("internal error (request {request_id})")]
    Internal { message: String, request_id: Uuid },
}

impl AgentError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Config { .. } => "ConfigError",
            AgentError::Validation { .. } => "ValidationError",
            AgentError::Authentication { .. } => "AuthenticationError",
            AgentError::Authorization { .. } => "AuthorizationError",
            AgentError::ToolNotPermitted { .. } => "ToolNotPermitted",
            AgentError::ApprovalRequired { .. } => "ApprovalRequired",
            AgentError::BackendUnavailable { .. } => "BackendUnavailable",
            AgentError::Timeout { .. } => "Timeout",
            AgentError::RateLimited { .. } => "RateLimited",
            AgentError::CircuitOpen { .. } => "CircuitOpen",
            AgentError::PersistenceCorrupt { .. } => "PersistenceCorrupt",
            AgentError::GenerationUnavailable { .. } => "GenerationUnavailable",
            AgentError::NotFound { .. } => "NotFound",
            AgentError::ConflictingState { .. } => "ConflictingState",
            AgentError::Internal { .. } => "Internal",
        }
    }

    /// Correlates with audit entries for this request.
    pub fn request_id(&self) -> Uuid {
        match self {
            AgentError::Config { request_id, .. }
            | AgentError::Validation { request_id, .. }
            | AgentError::Authentication { request_id, .. }
            | AgentError::Authorization { request_id, .. }
            | AgentError::ToolNotPermitted { request_id, .. }
            | AgentError::ApprovalRequired { request_id, .. }
            | AgentError::BackendUnavailable { request_id, .. }
            | AgentError::Timeout { request_id, .. }
            | AgentError::RateLimited { request_id, .. }
            | AgentError::CircuitOpen { request_id, .. }
            | AgentError::PersistenceCorrupt { request_id, .. }
            | AgentError::GenerationUnavailable { request_id, .. }
            | AgentError::NotFound { request_id, .. }
            | AgentError::ConflictingState { request_id, .. }
            | AgentError::Internal { request_id, .. } => *request_id,
        }
    }

    pub fn from_reason(err: ReasonError, request_id: Uuid) -> Self {
        match err {
            ReasonError::Tool(ToolError::NotPermitted(tool)) => AgentError::ToolNotPermitted {
                message: tool,
                request_id,
            },
            ReasonError::Tool(ToolError::ApprovalRequired(tool)) => AgentError::ApprovalRequired {
                message: tool,
                request_id,
            },
            ReasonError::Tool(ToolError::UnknownTool(tool)) => AgentError::NotFound {
                message: format!("tool '{tool}'"),
                request_id,
            },
            ReasonError::Tool(ToolError::RateLimited(tool)) => AgentError::RateLimited {
                message: format!("tool '{tool}'"),
                request_id,
            },
            ReasonError::Tool(ToolError::Failed(message)) => AgentError::Internal {
                message,
                request_id,
            },
            ReasonError::VerifyFailed(predicate) => AgentError::Validation {
                message: format!("verification failed: {predicate}"),
                request_id,
            },
            ReasonError::Timeout => AgentError::Timeout {
                message: "plan execution".to_string(),
                request_id,
            },
            ReasonError::InvalidPlan(message) => AgentError::Validation {
                message,
                request_id,
            },
            ReasonError::Host(message) => AgentError::GenerationUnavailable {
                message,
                request_id,
            },
        }
    }

    pub fn from_pipeline(err: PipelineError, request_id: Uuid) -> Self {
        match err {
            PipelineError::GenerationUnavailable(message) => AgentError::GenerationUnavailable {
                message,
                request_id,
            },
        }
    }

    pub fn from_memory(err: MemoryError, request_id: Uuid) -> Self {
        match err {
            MemoryError::Persistence(VaultError::Corrupt(message)) => {
                AgentError::PersistenceCorrupt {
                    message,
                    request_id,
                }
            }
            MemoryError::NotFound(message) => AgentError::NotFound {
                message,
                request_id,
            },
            MemoryError::DuplicateKey(message) => AgentError::ConflictingState {
                message,
                request_id,
            },
            other => AgentError::Internal {
                message: other.to_string(),
                request_id,
            },
        }
    }

    pub fn from_auth(err: AuthError, request_id: Uuid) -> Self {
        match err {
            AuthError::InvalidCredentials
            | AuthError::Locked(_)
            | AuthError::Inactive
            | AuthError::InvalidToken => AgentError::Authentication {
                message: err.to_string(),
                request_id,
            },
            AuthError::NotFound => AgentError::NotFound {
                message: "user".to_string(),
                request_id,
            },
            AuthError::WeakPassword(message) => AgentError::Validation {
                message,
                request_id,
            },
            AuthError::Persistence(VaultError::Corrupt(message)) => {
                AgentError::PersistenceCorrupt {
                    message,
                    request_id,
                }
            }
            other => AgentError::Internal {
                message: other.to_string(),
                request_id,
            },
        }
    }

    pub fn from_llm(err: LlmError, request_id: Uuid) -> Self {
        match err {
            LlmError::BackendUnavailable(message) => AgentError::BackendUnavailable {
                message,
                request_id,
            },
            LlmError::Timeout(ms) => AgentError::Timeout {
                message: format!("LLM call after {ms} ms"),
                request_id,
            },
            LlmError::Malformed(message) => AgentError::Internal {
                message,
                request_id,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_strings() {
        let id = Uuid::new_v4();
        let err = AgentError::GenerationUnavailable {
            message: "down".to_string(),
            request_id: id,
        };
        assert_eq!(err.code(), "GenerationUnavailable");
        assert_eq!(err.request_id(), id);
    }

    #[test]
    fn internal_message_is_not_displayed() {
        let err = AgentError::Internal {
            message: "stack trace with secrets".to_string(),
            request_id: Uuid::new_v4(),
        };
        assert!(!err.to_string().contains("secrets"));
    }

    #[test]
    fn reason_errors_map_to_distinct_kinds() {
        let id = Uuid::new_v4();
        let denied = AgentError::from_reason(
            ReasonError::Tool(ToolError::NotPermitted("nmap".to_string())),
            id,
        );
        assert_eq!(denied.code(), "ToolNotPermitted");

        let unapproved = AgentError::from_reason(
            ReasonError::Tool(ToolError::ApprovalRequired("nmap".to_string())),
            id,
        );
        assert_eq!(unapproved.code(), "ApprovalRequired");
    }

    #[test]
    fn startup_errors_carry_exit_codes() {
        assert_eq!(StartupError::Config("x".into()).exit_code(), 64);
        assert_eq!(StartupError::PersistenceCorrupt("x".into()).exit_code(), 70);
        assert_eq!(StartupError::BackendUnavailable("x".into()).exit_code(), 74);
    }
}
