//! Server-side sessions with JWT bearer tokens.
//!
//! The token only references a session; revocation and inactivity timeout
//! are enforced server-side, so a stolen token dies with its session.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use sentra_vault::EncryptedFile;

use crate::authorize::Permission;
use crate::{AuthError, AuthResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub permissions: Vec<Permission>,
    pub active: bool,
}

impl Session {
    fn is_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_activity > timeout
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// Session id.
    sub: String,
    /// User id.
    uid: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionImage {
    sessions: Vec<Session>,
}

pub struct SessionManager {
    sessions: Mutex<HashMap<Uuid, Session>>,
    file: EncryptedFile,
    timeout: Duration,
    jwt_expiration: Duration,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl SessionManager {
    /// `jwt_key` is a vault-derived subkey; the master key itself never
    /// signs tokens.
    pub fn new(
        file: EncryptedFile,
        jwt_key: &[u8; 32],
        timeout_minutes: i64,
        jwt_expiration_secs: i64,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            file,
            timeout: Duration::minutes(timeout_minutes),
            jwt_expiration: Duration::seconds(jwt_expiration_secs),
            encoding_key: EncodingKey::from_secret(jwt_key),
            decoding_key: DecodingKey::from_secret(jwt_key),
        }
    }

    pub async fn load(&self) -> AuthResult<()> {
        if let Some(image) = self.file.load::<SessionImage>().await? {
            let now = Utc::now();
            let mut sessions = self.sessions.lock().await;
            *sessions = image
                .sessions
                .into_iter()
                .filter(|s| s.active && !s.is_expired(now, self.timeout))
                .map(|s| (s.id, s))
                .collect();
        }
        Ok(())
    }

    pub async fn save(&self) -> AuthResult<()> {
        let image = {
            let sessions = self.sessions.lock().await;
            SessionImage {
                sessions: sessions.values().cloned().collect(),
            }
        };
        self.file.save(&image).await?;
        Ok(())
    }

    /// Open a session and issue its bearer token.
    pub async fn open(&self, user_id: Uuid, permissions: Vec<Permission>) -> AuthResult<(Session, String)> {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            user_id,
            created_at: now,
            last_activity: now,
            permissions,
            active: true,
        };

        let claims = Claims {
            sub: session.id.to_string(),
            uid: user_id.to_string(),
            iat: now.timestamp(),
            exp: (now + self.jwt_expiration).timestamp(),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Hashing(e.to_string()))?;

        self.sessions.lock().await.insert(session.id, session.clone());
        Ok((session, token))
    }

    /// Validate a bearer token: signature, expiry, then the server-side
    /// session it references.  Touches `last_activity` on success.
    pub async fn validate(&self, token: &str) -> AuthResult<Session> {
        let validation = Validation::new(Algorithm::HS256);
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|_| AuthError::InvalidToken)?;
        let session_id: Uuid = data.claims.sub.parse().map_err(|_| AuthError::InvalidToken)?;

        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&session_id) else {
            return Err(AuthError::InvalidToken);
        };

        if !session.active || session.is_expired(now, self.timeout) {
            session.active = false;
            return Err(AuthError::InvalidToken);
        }

        session.last_activity = now;
        Ok(session.clone())
    }

    /// Explicitly close a session; its tokens stop validating immediately.
    pub async fn close(&self, session_id: Uuid) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&session_id) {
            Some(session) => {
                session.active = false;
                true
            }
            None => false,
        }
    }

    /// Drop inactive and expired sessions.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.active && !s.is_expired(now, self.timeout));
        before - sessions.len()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &std::path::Path, timeout_minutes: i64) -> SessionManager {
        SessionManager::new(
            EncryptedFile::new(dir.join("auth/sessions.json"), [8u8; 32]),
            &[42u8; 32],
            timeout_minutes,
            3600,
        )
    }

    #[tokio::test]
    async fn open_validate_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 60);
        let user_id = Uuid::new_v4();

        let (session, token) = manager
            .open(user_id, vec![Permission::new("memory", "read")])
            .await
            .unwrap();

        let validated = manager.validate(&token).await.unwrap();
        assert_eq!(validated.id, session.id);
        assert_eq!(validated.user_id, user_id);
        assert!(validated.last_activity >= session.last_activity);
    }

    #[tokio::test]
    async fn closed_session_rejects_valid_token() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 60);

        let (session, token) = manager.open(Uuid::new_v4(), vec![]).await.unwrap();
        assert!(manager.close(session.id).await);

        // The JWT itself is still signature-valid; the session is not.
        assert!(matches!(
            manager.validate(&token).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn tampered_token_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 60);
        let (_, token) = manager.open(Uuid::new_v4(), vec![]).await.unwrap();

        let mut tampered = token.clone();
        tampered.pop();
        tampered.push(if token.ends_with('A') { 'B' } else { 'A' });
        assert!(manager.validate(&tampered).await.is_err());

        let wrong_key = SessionManager::new(
            EncryptedFile::new(dir.path().join("other.json"), [8u8; 32]),
            &[43u8; 32],
            60,
            3600,
        );
        assert!(wrong_key.validate(&token).await.is_err());
    }

    #[tokio::test]
    async fn inactivity_timeout_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        // Zero-minute timeout: any measurable idle gap expires the session.
        let manager = manager(dir.path(), 0);
        let (_, token) = manager.open(Uuid::new_v4(), vec![]).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(manager.validate(&token).await.is_err());
    }

    #[tokio::test]
    async fn sweep_drops_dead_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 60);
        let (alive, _) = manager.open(Uuid::new_v4(), vec![]).await.unwrap();
        let (dead, _) = manager.open(Uuid::new_v4(), vec![]).await.unwrap();
        manager.close(dead.id).await;

        assert_eq!(manager.sweep().await, 1);
        assert_eq!(manager.active_count().await, 1);
        let _ = alive;
    }

    #[tokio::test]
    async fn persisted_sessions_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let token = {
            let manager = manager(dir.path(), 60);
            let (_, token) = manager.open(Uuid::new_v4(), vec![]).await.unwrap();
            manager.save().await.unwrap();
            token
        };

        let reloaded = manager(dir.path(), 60);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.active_count().await, 1);
        assert!(reloaded.validate(&token).await.is_ok());
    }
}
