//! Authentication, authorization, and the append-only audit log.

pub mod audit;
pub mod authorize;
pub mod password;
pub mod service;
pub mod session;
pub mod user;

pub use audit::{AuditLog, AuditQuery, AuditRecord};
pub use authorize::{Permission, permission_matches};
pub use password::{hash_password, verify_password};
pub use service::{AuthOutcome, AuthService};
pub use session::{Session, SessionManager};
pub use user::{User, UserStore};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Deliberately vague: callers never learn whether the username or the
    /// password was wrong.
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("account locked until {0}")]
    Locked(chrono::DateTime<chrono::Utc>),

    #[error("account is inactive")]
    Inactive,

    #[error("user not found")]
    NotFound,

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("password does not meet policy: {0}")]
    WeakPassword(String),

    #[error("password hashing failed: {0}")]
    Hashing(String),

    #[error(transparent)]
    Persistence(#[from] sentra_vault::VaultError),
}

pub type AuthResult<T> = Result<T, AuthError>;
