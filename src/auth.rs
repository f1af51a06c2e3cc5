use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::ApiError;

pub const SESSION_EXPIRY_HOURS: i64 = 24;
pub const MAX_LOGIN_ATTEMPTS: u32 = 5;
pub const LOCKOUT_DURATION_MINUTES: i64 = 15;

const MIN_PASSWORD_LENGTH: usize = 6;
const MIN_USERNAME_LENGTH: usize = 3;
const DEFAULT_ADMIN_USERNAME: &str = "admin";
const DEFAULT_ADMIN_PASSWORD: &str = "admin123";

/// Login failures never reveal whether the username or the password was
/// wrong, to avoid account enumeration.
const GENERIC_LOGIN_ERROR: &str = "Invalid username or password";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password_hash: String,
    pub salt: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub must_change_password: bool,
    pub login_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub username: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    users: HashMap<String, User>,
    sessions: HashMap<String, Session>,
}

/// Issued on successful login.
#[derive(Debug)]
pub struct LoginGrant {
    pub token: String,
    pub username: String,
    pub role: Role,
    pub must_change_password: bool,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub username: String,
    pub role: Role,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct UserSummary {
    pub username: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub is_locked: bool,
}

#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub username: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub token_preview: String,
}

/// User and session records behind a single writer lock. Every mutation is a
/// load-mutate-persist cycle executed while the lock is held; the whole store
/// is rewritten to disk as one JSON document on each change.
pub struct AuthStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl AuthStore {
    pub async fn load(path: PathBuf) -> Result<Self, ApiError> {
        let mut data = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents).map_err(|error| {
                ApiError::internal(format!("Could not read the user store: {error}"))
            })?,
            Err(error) if error.kind() == ErrorKind::NotFound => StoreData::default(),
            Err(error) => {
                return Err(ApiError::internal(format!(
                    "Could not open the user store: {error}"
                )));
            }
        };

        let store = Self {
            path,
            data: Mutex::new(StoreData::default()),
        };

        if !data.users.contains_key(DEFAULT_ADMIN_USERNAME) {
            data.users.insert(
                DEFAULT_ADMIN_USERNAME.to_string(),
                new_user(DEFAULT_ADMIN_USERNAME, DEFAULT_ADMIN_PASSWORD, Role::Admin, true),
            );
            store.persist(&data).await?;
            info!("Default admin account created (password must be changed on first login)");
        }

        *store.data.lock().await = data;
        Ok(store)
    }

    async fn persist(&self, data: &StoreData) -> Result<(), ApiError> {
        let payload = serde_json::to_string_pretty(data).map_err(|error| {
            ApiError::internal(format!("Could not serialize the user store: {error}"))
        })?;

        tokio::fs::write(&self.path, payload).await.map_err(|error| {
            ApiError::internal(format!("Could not save the user store: {error}"))
        })
    }

    /// Authenticates the user and issues a fresh session, invalidating every
    /// prior session of that user.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        ip_address: Option<String>,
    ) -> Result<LoginGrant, ApiError> {
        let mut data = self.data.lock().await;
        let now = Utc::now();

        let Some(user) = data.users.get_mut(username) else {
            warn!("Login failed: unknown user '{username}'");
            return Err(ApiError::unauthorized(GENERIC_LOGIN_ERROR));
        };

        if let Some(locked_until) = user.locked_until {
            if now < locked_until {
                let remaining = (locked_until - now).num_minutes().max(1);
                warn!("Login rejected: account '{username}' is locked");
                return Err(ApiError::forbidden(format!(
                    "Account is locked. Try again in {remaining} minutes."
                )));
            }
            // Lockout window elapsed; evaluate this attempt fresh.
            user.locked_until = None;
            user.login_attempts = 0;
        }

        if hash_password(password, &user.salt) != user.password_hash {
            user.login_attempts += 1;
            let attempts = user.login_attempts;
            if attempts >= MAX_LOGIN_ATTEMPTS {
                user.locked_until = Some(now + Duration::minutes(LOCKOUT_DURATION_MINUTES));
                warn!("Account '{username}' locked after {attempts} failed attempts");
            } else {
                warn!("Login failed for '{username}' (attempt {attempts})");
            }
            self.persist(&data).await?;
            return Err(ApiError::unauthorized(GENERIC_LOGIN_ERROR));
        }

        user.login_attempts = 0;
        user.locked_until = None;
        user.last_login = Some(now);
        let role = user.role;
        let must_change_password = user.must_change_password;

        // At most one active session per user: the new login wins.
        data.sessions.retain(|_, session| session.username != username);

        let token = generate_token();
        let expires_at = now + Duration::hours(SESSION_EXPIRY_HOURS);
        data.sessions.insert(
            token.clone(),
            Session {
                username: username.to_string(),
                role,
                created_at: now,
                expires_at,
                ip_address,
            },
        );
        self.persist(&data).await?;

        info!("User '{username}' logged in");
        Ok(LoginGrant {
            token,
            username: username.to_string(),
            role,
            must_change_password,
            expires_at,
        })
    }

    /// Looks up a presented token. Expired records are deleted on first
    /// access past their expiry.
    pub async fn verify_session(&self, token: &str) -> Option<SessionInfo> {
        let mut data = self.data.lock().await;
        let now = Utc::now();

        let expired = match data.sessions.get(token) {
            None => return None,
            Some(session) => now > session.expires_at,
        };

        if expired {
            if let Some(session) = data.sessions.remove(token) {
                info!("Session expired for user '{}'", session.username);
            }
            if let Err(error) = self.persist(&data).await {
                warn!("Could not persist expired-session removal: {error}");
            }
            return None;
        }

        data.sessions.get(token).map(|session| SessionInfo {
            username: session.username.clone(),
            role: session.role,
            expires_at: session.expires_at,
        })
    }

    pub async fn logout(&self, token: &str) -> bool {
        let mut data = self.data.lock().await;
        let removed = data.sessions.remove(token);
        let Some(session) = removed else {
            return false;
        };

        if let Err(error) = self.persist(&data).await {
            warn!("Could not persist logout: {error}");
        }
        info!("User '{}' logged out", session.username);
        true
    }

    pub async fn change_password(
        &self,
        username: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), ApiError> {
        validate_password(new_password)?;

        let mut data = self.data.lock().await;
        let Some(user) = data.users.get_mut(username) else {
            return Err(ApiError::bad_request("User not found"));
        };

        if hash_password(old_password, &user.salt) != user.password_hash {
            return Err(ApiError::bad_request("Current password is incorrect"));
        }

        let salt = generate_salt();
        user.password_hash = hash_password(new_password, &salt);
        user.salt = salt;
        user.must_change_password = false;

        self.persist(&data).await?;
        info!("Password changed for user '{username}'");
        Ok(())
    }

    pub async fn create_user(
        &self,
        username: &str,
        password: &str,
        role: Role,
    ) -> Result<(), ApiError> {
        validate_username(username)?;
        validate_password(password)?;

        let mut data = self.data.lock().await;
        if data.users.contains_key(username) {
            return Err(ApiError::bad_request("Username already exists"));
        }

        data.users
            .insert(username.to_string(), new_user(username, password, role, false));
        self.persist(&data).await?;

        info!("User '{username}' created");
        Ok(())
    }

    pub async fn list_users(&self) -> Vec<UserSummary> {
        let data = self.data.lock().await;
        let now = Utc::now();
        let mut users: Vec<UserSummary> = data
            .users
            .values()
            .map(|user| UserSummary {
                username: user.username.clone(),
                role: user.role,
                created_at: user.created_at,
                last_login: user.last_login,
                is_locked: user.locked_until.is_some_and(|until| until > now),
            })
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    /// Deletes a user and all of their sessions. The acting admin cannot
    /// delete their own account, and the last admin account cannot be
    /// deleted.
    pub async fn delete_user(&self, username: &str, acting: &str) -> Result<(), ApiError> {
        let mut data = self.data.lock().await;
        let Some(target) = data.users.get(username) else {
            return Err(ApiError::bad_request("User not found"));
        };

        if username == acting {
            return Err(ApiError::bad_request("Cannot delete your own account"));
        }

        let admin_count = data.users.values().filter(|u| u.role == Role::Admin).count();
        if target.role == Role::Admin && admin_count <= 1 {
            return Err(
                ApiError::bad_request("Cannot delete the last admin account")
                    .with_code("LAST_ADMIN"),
            );
        }

        data.users.remove(username);
        data.sessions.retain(|_, session| session.username != username);
        self.persist(&data).await?;

        info!("User '{username}' deleted by '{acting}'");
        Ok(())
    }

    /// Admin password reset: no old password required. All of the target's
    /// sessions are dropped, except the acting admin's own current session
    /// when they reset their own password.
    pub async fn reset_password(
        &self,
        username: &str,
        new_password: &str,
        acting: &str,
        current_token: Option<&str>,
    ) -> Result<(), ApiError> {
        validate_password(new_password)?;

        let mut data = self.data.lock().await;
        let Some(user) = data.users.get_mut(username) else {
            return Err(ApiError::bad_request("User not found"));
        };

        let salt = generate_salt();
        user.password_hash = hash_password(new_password, &salt);
        user.salt = salt;
        user.must_change_password = false;

        let is_self_reset = username == acting;
        data.sessions.retain(|token, session| {
            session.username != username
                || (is_self_reset && Some(token.as_str()) == current_token)
        });

        self.persist(&data).await?;
        info!("Password reset for '{username}' by '{acting}'");
        Ok(())
    }

    /// Renames a user and rewrites the username on every session record that
    /// referenced the old name. Blocked for the acting admin's own account.
    pub async fn rename_user(
        &self,
        old_username: &str,
        new_username: &str,
        acting: &str,
    ) -> Result<(), ApiError> {
        validate_username(new_username)?;

        let mut data = self.data.lock().await;
        if !data.users.contains_key(old_username) {
            return Err(ApiError::bad_request("User not found"));
        }
        if data.users.contains_key(new_username) {
            return Err(ApiError::bad_request("Username already exists"));
        }
        if old_username == acting {
            return Err(ApiError::bad_request("Cannot change your own username"));
        }

        let Some(mut user) = data.users.remove(old_username) else {
            return Err(ApiError::bad_request("User not found"));
        };
        user.username = new_username.to_string();
        data.users.insert(new_username.to_string(), user);

        for session in data.sessions.values_mut() {
            if session.username == old_username {
                session.username = new_username.to_string();
            }
        }

        self.persist(&data).await?;
        info!("User '{old_username}' renamed to '{new_username}' by '{acting}'");
        Ok(())
    }

    /// Drops every session of one user. Returns the number removed.
    pub async fn delete_user_sessions(&self, username: &str) -> Result<usize, ApiError> {
        let mut data = self.data.lock().await;
        if !data.users.contains_key(username) {
            return Err(ApiError::bad_request("User not found"));
        }

        let before = data.sessions.len();
        data.sessions.retain(|_, session| session.username != username);
        let removed = before - data.sessions.len();

        if removed > 0 {
            self.persist(&data).await?;
        }
        Ok(removed)
    }

    /// Removes every session whose expiry has passed. Safe to call at any
    /// time; unexpired sessions are untouched.
    pub async fn cleanup_expired_sessions(&self) -> Result<usize, ApiError> {
        let mut data = self.data.lock().await;
        let now = Utc::now();

        let before = data.sessions.len();
        data.sessions.retain(|_, session| now <= session.expires_at);
        let removed = before - data.sessions.len();

        if removed > 0 {
            self.persist(&data).await?;
            info!("Removed {removed} expired sessions");
        }
        Ok(removed)
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let data = self.data.lock().await;
        let now = Utc::now();
        data.sessions
            .iter()
            .filter(|(_, session)| now <= session.expires_at)
            .map(|(token, session)| SessionSummary {
                username: session.username.clone(),
                role: session.role,
                created_at: session.created_at,
                expires_at: session.expires_at,
                ip_address: session.ip_address.clone(),
                token_preview: format!("{}...", token.chars().take(20).collect::<String>()),
            })
            .collect()
    }
}

fn new_user(username: &str, password: &str, role: Role, must_change_password: bool) -> User {
    let salt = generate_salt();
    User {
        username: username.to_string(),
        password_hash: hash_password(password, &salt),
        salt,
        role,
        created_at: Utc::now(),
        must_change_password,
        login_attempts: 0,
        locked_until: None,
        last_login: None,
    }
}

fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    let digest = hasher.finalize();
    format!("{digest:x}")
}

fn generate_salt() -> String {
    random_hex(32)
}

fn generate_token() -> String {
    random_hex(48)
}

fn random_hex(bytes: usize) -> String {
    let mut buffer = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buffer);
    buffer.iter().map(|b| format!("{b:02x}")).collect()
}

fn validate_password(password: &str) -> Result<(), ApiError> {
    if password.len() < MIN_PASSWORD_LENGTH {
        return Err(ApiError::bad_request(format!(
            "Password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }
    Ok(())
}

fn validate_username(username: &str) -> Result<(), ApiError> {
    if username.len() < MIN_USERNAME_LENGTH {
        return Err(ApiError::bad_request(format!(
            "Username must be at least {MIN_USERNAME_LENGTH} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> (AuthStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthStore::load(dir.path().join("users.json")).await.unwrap();
        (store, dir)
    }

    async fn login_attempts(store: &AuthStore, username: &str) -> u32 {
        store.data.lock().await.users[username].login_attempts
    }

    #[tokio::test]
    async fn default_admin_is_bootstrapped() {
        let (store, _dir) = test_store().await;
        let grant = store
            .login(DEFAULT_ADMIN_USERNAME, DEFAULT_ADMIN_PASSWORD, None)
            .await
            .unwrap();
        assert_eq!(grant.role, Role::Admin);
        assert!(grant.must_change_password);
    }

    #[tokio::test]
    async fn login_failure_is_generic() {
        let (store, _dir) = test_store().await;

        let unknown = store.login("ghost", "whatever123", None).await.unwrap_err();
        let wrong = store.login("admin", "not-the-password", None).await.unwrap_err();
        assert_eq!(unknown.message, wrong.message);
    }

    #[tokio::test]
    async fn five_failures_lock_the_account() {
        let (store, _dir) = test_store().await;
        store.create_user("carol", "secret99", Role::User).await.unwrap();

        for _ in 0..MAX_LOGIN_ATTEMPTS {
            store.login("carol", "wrong-pass", None).await.unwrap_err();
        }
        assert!(store.data.lock().await.users["carol"].locked_until.is_some());

        // A further attempt while locked is rejected without consuming an
        // attempt, even with the correct password.
        let error = store.login("carol", "secret99", None).await.unwrap_err();
        assert!(error.message.contains("locked"));
        assert_eq!(login_attempts(&store, "carol").await, MAX_LOGIN_ATTEMPTS);
    }

    #[tokio::test]
    async fn lockout_expires_and_attempts_reset() {
        let (store, _dir) = test_store().await;
        store.create_user("dave", "secret99", Role::User).await.unwrap();

        for _ in 0..MAX_LOGIN_ATTEMPTS {
            store.login("dave", "wrong-pass", None).await.unwrap_err();
        }

        // Simulate the lockout window elapsing.
        store
            .data
            .lock()
            .await
            .users
            .get_mut("dave")
            .unwrap()
            .locked_until = Some(Utc::now() - Duration::minutes(1));

        // The next attempt is evaluated fresh: one new failed attempt.
        let error = store.login("dave", "wrong-pass", None).await.unwrap_err();
        assert_eq!(error.message, GENERIC_LOGIN_ERROR);
        assert_eq!(login_attempts(&store, "dave").await, 1);

        // And a correct password now succeeds and resets the counter.
        store.login("dave", "secret99", None).await.unwrap();
        assert_eq!(login_attempts(&store, "dave").await, 0);
    }

    #[tokio::test]
    async fn second_login_invalidates_the_first_session() {
        let (store, _dir) = test_store().await;
        store.create_user("erin", "secret99", Role::User).await.unwrap();

        let first = store.login("erin", "secret99", None).await.unwrap();
        let second = store.login("erin", "secret99", None).await.unwrap();

        assert!(store.verify_session(&first.token).await.is_none());
        assert!(store.verify_session(&second.token).await.is_some());

        let sessions = store.data.lock().await.sessions.len();
        assert_eq!(sessions, 1);
    }

    #[tokio::test]
    async fn expired_session_is_lazily_removed() {
        let (store, _dir) = test_store().await;
        let grant = store.login("admin", "admin123", None).await.unwrap();

        store
            .data
            .lock()
            .await
            .sessions
            .get_mut(&grant.token)
            .unwrap()
            .expires_at = Utc::now() - Duration::minutes(1);

        assert!(store.verify_session(&grant.token).await.is_none());
        assert!(store.data.lock().await.sessions.is_empty());
    }

    #[tokio::test]
    async fn session_sweep_is_idempotent() {
        let (store, _dir) = test_store().await;
        let grant = store.login("admin", "admin123", None).await.unwrap();

        store
            .data
            .lock()
            .await
            .sessions
            .get_mut(&grant.token)
            .unwrap()
            .expires_at = Utc::now() - Duration::minutes(1);

        assert_eq!(store.cleanup_expired_sessions().await.unwrap(), 1);
        assert_eq!(store.cleanup_expired_sessions().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn last_admin_cannot_be_deleted() {
        let (store, _dir) = test_store().await;
        store.create_user("frank", "secret99", Role::User).await.unwrap();

        let error = store.delete_user("admin", "frank").await.unwrap_err();
        assert_eq!(error.code, Some("LAST_ADMIN"));
        assert!(store.data.lock().await.users.contains_key("admin"));

        // With a second admin the deletion goes through.
        store.create_user("grace", "secret99", Role::Admin).await.unwrap();
        store.delete_user("admin", "grace").await.unwrap();
        assert!(!store.data.lock().await.users.contains_key("admin"));
    }

    #[tokio::test]
    async fn self_delete_is_blocked() {
        let (store, _dir) = test_store().await;
        let error = store.delete_user("admin", "admin").await.unwrap_err();
        assert!(error.message.contains("own account"));
    }

    #[tokio::test]
    async fn deleting_a_user_drops_their_sessions() {
        let (store, _dir) = test_store().await;
        store.create_user("henry", "secret99", Role::User).await.unwrap();
        let grant = store.login("henry", "secret99", None).await.unwrap();

        store.delete_user("henry", "admin").await.unwrap();
        assert!(store.verify_session(&grant.token).await.is_none());
    }

    #[tokio::test]
    async fn self_password_reset_keeps_the_acting_session() {
        let (store, _dir) = test_store().await;
        let grant = store.login("admin", "admin123", None).await.unwrap();

        // A stale extra session for the same user, as if left by an old bug.
        store.data.lock().await.sessions.insert(
            "stale-token".to_string(),
            Session {
                username: "admin".to_string(),
                role: Role::Admin,
                created_at: Utc::now(),
                expires_at: Utc::now() + Duration::hours(1),
                ip_address: None,
            },
        );

        store
            .reset_password("admin", "newpass99", "admin", Some(&grant.token))
            .await
            .unwrap();

        assert!(store.verify_session(&grant.token).await.is_some());
        assert!(store.verify_session("stale-token").await.is_none());
        store.login("admin", "newpass99", None).await.unwrap();
    }

    #[tokio::test]
    async fn reset_for_another_user_drops_all_their_sessions() {
        let (store, _dir) = test_store().await;
        store.create_user("ivy", "secret99", Role::User).await.unwrap();
        let grant = store.login("ivy", "secret99", None).await.unwrap();

        store
            .reset_password("ivy", "changed99", "admin", Some("admin-token"))
            .await
            .unwrap();

        assert!(store.verify_session(&grant.token).await.is_none());
        store.login("ivy", "changed99", None).await.unwrap();
    }

    #[tokio::test]
    async fn rename_rewrites_sessions_and_blocks_self() {
        let (store, _dir) = test_store().await;
        store.create_user("june", "secret99", Role::User).await.unwrap();
        let grant = store.login("june", "secret99", None).await.unwrap();

        store.rename_user("june", "juniper", "admin").await.unwrap();
        let info = store.verify_session(&grant.token).await.unwrap();
        assert_eq!(info.username, "juniper");
        store.login("juniper", "secret99", None).await.unwrap();

        let error = store.rename_user("admin", "root", "admin").await.unwrap_err();
        assert!(error.message.contains("own username"));
    }

    #[tokio::test]
    async fn change_password_requires_the_old_one() {
        let (store, _dir) = test_store().await;
        store.create_user("kate", "secret99", Role::User).await.unwrap();

        let error = store
            .change_password("kate", "wrong-old", "newpass99")
            .await
            .unwrap_err();
        assert!(error.message.contains("incorrect"));

        store
            .change_password("kate", "secret99", "newpass99")
            .await
            .unwrap();
        store.login("kate", "newpass99", None).await.unwrap();
    }

    #[tokio::test]
    async fn validation_failures_are_specific() {
        let (store, _dir) = test_store().await;

        let short_pass = store.create_user("liam", "abc", Role::User).await.unwrap_err();
        assert!(short_pass.message.contains("at least 6"));

        store.create_user("liam", "secret99", Role::User).await.unwrap();
        let duplicate = store.create_user("liam", "secret99", Role::User).await.unwrap_err();
        assert!(duplicate.message.contains("already exists"));

        let short_name = store.create_user("ab", "secret99", Role::User).await.unwrap_err();
        assert!(short_name.message.contains("at least 3"));
    }

    #[tokio::test]
    async fn store_survives_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");

        {
            let store = AuthStore::load(path.clone()).await.unwrap();
            store.create_user("mona", "secret99", Role::User).await.unwrap();
        }

        let reloaded = AuthStore::load(path).await.unwrap();
        reloaded.login("mona", "secret99", None).await.unwrap();
    }
}
