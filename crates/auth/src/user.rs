//! User records and the encrypted user store, including legacy plaintext
//! password migration.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use sentra_vault::EncryptedFile;

use crate::authorize::Permission;
use crate::password::hash_password;
use crate::{AuthError, AuthResult};

/// Environment prefix for legacy plaintext passwords awaiting migration.
pub const LEGACY_PASSWORD_PREFIX: &str = "LEGACY_PASSWORD_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub role: String,
    pub permissions: Vec<Permission>,
    /// Argon2id PHC string.  Never plaintext; `None` only for records
    /// awaiting legacy migration.
    pub password_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub failed_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<DateTime<Utc>>,
    pub active: bool,
    /// Set by legacy migration: the password works but must be rotated.
    #[serde(default)]
    pub must_rotate: bool,
}

impl User {
    pub fn new(username: &str, role: &str, password_hash: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.to_string(),
            role: role.to_string(),
            permissions: Vec::new(),
            password_hash: Some(password_hash),
            created_at: Utc::now(),
            last_login: None,
            failed_attempts: 0,
            locked_until: None,
            active: true,
            must_rotate: false,
        }
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.map(|until| now < until).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UserImage {
    users: Vec<User>,
}

/// Encrypted user store keyed by username.
pub struct UserStore {
    users: HashMap<String, User>,
    file: EncryptedFile,
    /// Usernames already warned about during legacy migration, so the
    /// warning fires once per process.
    warned_legacy: Mutex<HashSet<String>>,
}

impl UserStore {
    pub fn new(file: EncryptedFile) -> Self {
        Self {
            users: HashMap::new(),
            file,
            warned_legacy: Mutex::new(HashSet::new()),
        }
    }

    /// Load users from disk, then run legacy migration against the
    /// environment.  An empty store bootstraps an admin from
    /// `ADMIN_PASSWORD` when present.
    pub async fn load(&mut self, min_password_len: usize) -> AuthResult<()> {
        if let Some(image) = self.file.load::<UserImage>().await? {
            self.users = image
                .users
                .into_iter()
                .map(|u| (u.username.clone(), u))
                .collect();
        }

        if self.users.is_empty() {
            if let Ok(admin_password) = std::env::var("ADMIN_PASSWORD") {
                if admin_password.len() < min_password_len {
                    return Err(AuthError::WeakPassword(format!(
                        "ADMIN_PASSWORD must be at least {min_password_len} characters"
                    )));
                }
                let hash = hash_password(&admin_password)?;
                let mut admin = User::new("admin", "admin", hash);
                admin.permissions = vec![Permission::wildcard()];
                info!("bootstrapped admin user from ADMIN_PASSWORD");
                self.users.insert("admin".to_string(), admin);
                self.save().await?;
            }
        }

        self.migrate_legacy_passwords().await?;
        Ok(())
    }

    /// Hash-and-rotate records that lack a password hash but have a legacy
    /// plaintext under `LEGACY_PASSWORD_<USERNAME>`.
    async fn migrate_legacy_passwords(&mut self) -> AuthResult<()> {
        let mut migrated = false;
        for user in self.users.values_mut() {
            if user.password_hash.is_some() {
                continue;
            }
            let var = format!("{LEGACY_PASSWORD_PREFIX}{}", user.username.to_uppercase());
            let Ok(plaintext) = std::env::var(&var) else {
                continue;
            };

            user.password_hash = Some(hash_password(&plaintext)?);
            user.must_rotate = true;
            migrated = true;

            let mut warned = self.warned_legacy.lock().unwrap_or_else(|p| p.into_inner());
            if warned.insert(user.username.clone()) {
                warn!(
                    username = %user.username,
                    "migrated legacy plaintext password; rotation is mandatory"
                );
            }
        }

        if migrated {
            self.save().await?;
        }
        Ok(())
    }

    pub async fn save(&self) -> AuthResult<()> {
        let image = UserImage {
            users: self.users.values().cloned().collect(),
        };
        self.file.save(&image).await?;
        Ok(())
    }

    pub fn get(&self, username: &str) -> Option<&User> {
        self.users.get(username)
    }

    pub fn get_mut(&mut self, username: &str) -> Option<&mut User> {
        self.users.get_mut(username)
    }

    pub fn by_id(&self, id: Uuid) -> Option<&User> {
        self.users.values().find(|u| u.id == id)
    }

    pub fn insert(&mut self, user: User) -> AuthResult<()> {
        if self.users.contains_key(&user.username) {
            return Err(AuthError::InvalidCredentials);
        }
        self.users.insert(user.username.clone(), user);
        Ok(())
    }

    pub fn remove(&mut self, username: &str) -> bool {
        self.users.remove(username).is_some()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::password::{hash_password_with, test_params};

    fn store(dir: &std::path::Path) -> UserStore {
        UserStore::new(EncryptedFile::new(dir.join("auth/users.json"), [6u8; 32]))
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut users = store(dir.path());
            let hash = hash_password_with("a sufficiently long pw", test_params()).unwrap();
            users.insert(User::new("analyst", "analyst", hash)).unwrap();
            users.save().await.unwrap();
        }

        let mut reloaded = store(dir.path());
        reloaded.load(12).await.unwrap();
        let user = reloaded.get("analyst").unwrap();
        assert_eq!(user.role, "analyst");
        assert!(user.active);
        assert!(!user.must_rotate);
    }

    #[tokio::test]
    async fn plaintext_never_reaches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut users = store(dir.path());
        let hash = hash_password_with("super secret phrase", test_params()).unwrap();
        users.insert(User::new("analyst", "analyst", hash)).unwrap();
        users.save().await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("auth/users.json")).unwrap();
        assert!(!raw.contains("super secret phrase"));
        assert!(raw.contains("authTag"), "user store must be enveloped");
    }

    #[tokio::test]
    async fn legacy_password_migrates_with_rotation_flag() {
        let dir = tempfile::tempdir().unwrap();

        // A record without a hash, as an imported legacy store would have.
        {
            let mut users = store(dir.path());
            let mut legacy = User::new("operator", "analyst", String::new());
            legacy.password_hash = None;
            users.insert(legacy).unwrap();
            users.save().await.unwrap();
        }

        // Unique variable name per test process avoids cross-test bleed.
        unsafe { std::env::set_var("LEGACY_PASSWORD_OPERATOR", "legacy plaintext pw") };
        let mut users = store(dir.path());
        users.load(12).await.unwrap();
        unsafe { std::env::remove_var("LEGACY_PASSWORD_OPERATOR") };

        let user = users.get("operator").unwrap();
        assert!(user.password_hash.is_some());
        assert!(user.must_rotate, "migrated accounts must rotate");
        assert!(
            crate::password::verify_password(
                "legacy plaintext pw",
                user.password_hash.as_ref().unwrap()
            )
            .unwrap()
        );
    }

    #[test]
    fn lock_expiry_is_time_based() {
        let hash = hash_password_with("pw pw pw pw pw", test_params()).unwrap();
        let mut user = User::new("u", "analyst", hash);
        let now = Utc::now();

        user.locked_until = Some(now + chrono::Duration::minutes(30));
        assert!(user.is_locked(now));
        assert!(!user.is_locked(now + chrono::Duration::minutes(31)));

        user.locked_until = None;
        assert!(!user.is_locked(now));
    }
}
