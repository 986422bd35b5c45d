//! The authentication service: credential checks with lockout, session
//! issuance, and audit emission for every attempt.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditLog, AuditRecord};
use crate::authorize::any_permission_matches;
use crate::password::{hash_password, verify_password};
use crate::session::{Session, SessionManager};
use crate::user::UserStore;
use crate::{AuthError, AuthResult};

#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub token: String,
    pub session_id: Uuid,
    pub user_id: Uuid,
    /// Set for accounts carrying a migrated legacy password.
    pub must_rotate: bool,
}

pub struct AuthService {
    users: Mutex<UserStore>,
    sessions: SessionManager,
    audit: Arc<AuditLog>,
    max_failed_attempts: u32,
    lockout: Duration,
    password_min_length: usize,
}

impl AuthService {
    pub fn new(
        users: UserStore,
        sessions: SessionManager,
        audit: Arc<AuditLog>,
        config: &sentra_config::AuthConfig,
    ) -> Self {
        Self {
            users: Mutex::new(users),
            sessions,
            audit,
            max_failed_attempts: config.max_failed_attempts,
            lockout: Duration::minutes(config.lockout_minutes),
            password_min_length: config.password_min_length,
        }
    }

    pub async fn load(&self) -> AuthResult<()> {
        self.users.lock().await.load(self.password_min_length).await?;
        self.sessions.load().await?;
        self.audit.load().await?;
        Ok(())
    }

    pub async fn persist(&self) -> AuthResult<()> {
        self.users.lock().await.save().await?;
        self.sessions.save().await?;
        Ok(())
    }

    /// Authenticate and open a session.  Every attempt (success, bad
    /// password, locked, unknown user) emits an audit record with outcome
    /// and timing.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
        ip: &str,
        user_agent: &str,
    ) -> AuthResult<AuthOutcome> {
        let started = Instant::now();
        let now = Utc::now();

        let result = self.authenticate_inner(username, password, now).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let record = AuditRecord::new(username, "auth.login", "auth", result.is_ok())
            .with_duration(duration_ms)
            .with_details(match &result {
                Ok(_) => "login succeeded".to_string(),
                Err(err) => format!("login failed: {err}"),
            })
            .with_metadata(serde_json::json!({ "ip": ip, "user_agent": user_agent }));
        let record = match &result {
            Ok(outcome) => record.with_session(outcome.session_id.to_string()),
            Err(_) => record,
        };
        self.audit.try_append(record).await;

        result
    }

    async fn authenticate_inner(
        &self,
        username: &str,
        password: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> AuthResult<AuthOutcome> {
        // Gather what we need under the lock, verify outside it.  Argon2
        // takes long enough that holding the store across it would serialize
        // every login behind the slowest one.
        let (user_id, stored_hash, permissions, must_rotate) = {
            let users = self.users.lock().await;
            let Some(user) = users.get(username) else {
                warn!(username, "login attempt for unknown user");
                return Err(AuthError::InvalidCredentials);
            };
            if !user.active {
                return Err(AuthError::Inactive);
            }
            if user.is_locked(now) {
                return Err(AuthError::Locked(user.locked_until.expect("locked implies until")));
            }
            let Some(hash) = user.password_hash.clone() else {
                // No hash and no legacy migration ran: the account cannot
                // log in.
                return Err(AuthError::InvalidCredentials);
            };
            (user.id, hash, user.permissions.clone(), user.must_rotate)
        };

        let password_owned = password.to_string();
        let verified = tokio::task::spawn_blocking(move || {
            verify_password(&password_owned, &stored_hash)
        })
        .await
        .map_err(|e| AuthError::Hashing(e.to_string()))??;

        if !verified {
            let mut users = self.users.lock().await;
            if let Some(user) = users.get_mut(username) {
                user.failed_attempts += 1;
                if user.failed_attempts >= self.max_failed_attempts {
                    user.locked_until = Some(now + self.lockout);
                    user.failed_attempts = 0;
                    warn!(username, "account locked after repeated failures");
                }
            }
            users.save().await?;
            return Err(AuthError::InvalidCredentials);
        }

        {
            let mut users = self.users.lock().await;
            if let Some(user) = users.get_mut(username) {
                user.failed_attempts = 0;
                user.locked_until = None;
                user.last_login = Some(now);
            }
            users.save().await?;
        }

        let (session, token) = self.sessions.open(user_id, permissions).await?;
        info!(username, session = %session.id, "login succeeded");
        Ok(AuthOutcome {
            token,
            session_id: session.id,
            user_id,
            must_rotate,
        })
    }

    /// Resolve a bearer token to its live session.
    pub async fn validate_token(&self, token: &str) -> AuthResult<Session> {
        self.sessions.validate(token).await
    }

    pub async fn logout(&self, session_id: Uuid) -> bool {
        let closed = self.sessions.close(session_id).await;
        if closed {
            self.audit
                .try_append(
                    AuditRecord::new("system", "auth.logout", "auth", true)
                        .with_session(session_id.to_string()),
                )
                .await;
        }
        closed
    }

    /// Permission check over the user's grants.  `*` matches anything;
    /// permission conditions must be a subset of `context`.
    pub async fn check_permission(
        &self,
        user_id: Uuid,
        resource: &str,
        action: &str,
        context: &BTreeMap<String, String>,
    ) -> AuthResult<bool> {
        let users = self.users.lock().await;
        let user = users.by_id(user_id).ok_or(AuthError::NotFound)?;
        Ok(any_permission_matches(&user.permissions, resource, action, context))
    }

    /// Rotate a password (clears the migration flag).  The new password
    /// must meet the configured minimum length.
    pub async fn change_password(&self, username: &str, new_password: &str) -> AuthResult<()> {
        if new_password.len() < self.password_min_length {
            return Err(AuthError::WeakPassword(format!(
                "minimum length is {}",
                self.password_min_length
            )));
        }

        let new_owned = new_password.to_string();
        let hash = tokio::task::spawn_blocking(move || hash_password(&new_owned))
            .await
            .map_err(|e| AuthError::Hashing(e.to_string()))??;

        let mut users = self.users.lock().await;
        let user = users.get_mut(username).ok_or(AuthError::NotFound)?;
        user.password_hash = Some(hash);
        user.must_rotate = false;
        users.save().await?;

        self.audit
            .try_append(AuditRecord::new(username, "auth.password.rotate", "auth", true))
            .await;
        Ok(())
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }
}
