use chrono::{DateTime, SecondsFormat, Utc};
use facegate_core::auth::{LoginRecord, UserProfile};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("user already exists with that email or username")]
    UserExists,
    #[error("invalid timestamp in database: {0}")]
    InvalidTimestamp(String),
    #[error("token lifetime out of range")]
    InvalidTtl,
}

/// A user row, including the password digest.
#[derive(Debug, Clone)]
pub struct StoredUser {
    pub id: String,
    pub name: String,
    pub email: String,
    pub username: String,
    pub password_hash: String,
}

impl StoredUser {
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
            username: self.username.clone(),
        }
    }
}

/// New user fields; the password is already hashed.
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub username: String,
    pub password_hash: String,
}

/// One login attempt, recorded whether or not it succeeded.
pub struct LoginAttempt {
    pub user_id: Option<String>,
    pub username: String,
    pub success: bool,
    pub face_detected: bool,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// SQLite-backed users, login history and session tokens.
#[derive(Clone)]
pub struct AuthStore {
    conn: Connection,
}

impl AuthStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if db_path != Path::new(":memory:") {
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
        }

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS users (
                     id TEXT PRIMARY KEY,
                     name TEXT NOT NULL,
                     email TEXT NOT NULL UNIQUE,
                     username TEXT NOT NULL UNIQUE,
                     password_hash TEXT NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS login_history (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     user_id TEXT,
                     username TEXT NOT NULL,
                     success INTEGER NOT NULL,
                     face_detected INTEGER NOT NULL,
                     ip_address TEXT,
                     user_agent TEXT,
                     timestamp TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_history_user ON login_history(user_id, timestamp);
                 CREATE TABLE IF NOT EXISTS sessions (
                     token TEXT PRIMARY KEY,
                     user_id TEXT NOT NULL,
                     expires_at TEXT NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Insert a user unless the email or username is already taken.
    pub async fn create_user(&self, user: NewUser) -> Result<StoredUser, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = now_rfc3339();
        let stored = StoredUser {
            id,
            name: user.name,
            email: user.email,
            username: user.username,
            password_hash: user.password_hash,
        };

        let row = stored.clone();
        let inserted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM users WHERE email = ?1 OR username = ?2)",
                    [&row.email, &row.username],
                    |r| r.get(0),
                )?;
                if exists {
                    return Ok(false);
                }
                tx.execute(
                    "INSERT INTO users (id, name, email, username, password_hash, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        row.id,
                        row.name,
                        row.email,
                        row.username,
                        row.password_hash,
                        created_at
                    ],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await?;

        if !inserted {
            return Err(StoreError::UserExists);
        }
        tracing::info!(user_id = %stored.id, username = %stored.username, "user registered");
        Ok(stored)
    }

    pub async fn find_by_username(&self, username: &str) -> Result<Option<StoredUser>, StoreError> {
        self.find_user("username", username.to_string()).await
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<StoredUser>, StoreError> {
        self.find_user("id", id.to_string()).await
    }

    async fn find_user(
        &self,
        column: &'static str,
        value: String,
    ) -> Result<Option<StoredUser>, StoreError> {
        self.conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT id, name, email, username, password_hash FROM users WHERE {column} = ?1"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query_map([&value], |row| {
                    Ok(StoredUser {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        email: row.get(2)?,
                        username: row.get(3)?,
                        password_hash: row.get(4)?,
                    })
                })?;
                Ok(rows.next().transpose()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Remove a user. Their sessions and history stay behind.
    pub async fn delete_user(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute("DELETE FROM users WHERE id = ?1", [&id])?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn record_attempt(&self, attempt: LoginAttempt) -> Result<(), StoreError> {
        let timestamp = now_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO login_history
                         (user_id, username, success, face_detected, ip_address, user_agent, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        attempt.user_id,
                        attempt.username,
                        attempt.success,
                        attempt.face_detected,
                        attempt.ip_address,
                        attempt.user_agent,
                        timestamp
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Most recent attempts for a user, newest first.
    pub async fn history_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<LoginRecord>, StoreError> {
        let user_id = user_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<(String, bool, bool, Option<String>, Option<String>)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT timestamp, success, face_detected, ip_address, user_agent
                     FROM login_history WHERE user_id = ?1
                     ORDER BY timestamp DESC, id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![user_id, limit], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        rows.into_iter()
            .map(|(timestamp, success, face_detected, ip_address, user_agent)| {
                Ok(LoginRecord {
                    timestamp: parse_timestamp(&timestamp)?,
                    success,
                    face_detected,
                    ip_address,
                    user_agent,
                })
            })
            .collect()
    }

    /// Issue a new session token for `user_id`. Expired sessions are removed
    /// in the same call.
    pub async fn create_session(
        &self,
        user_id: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|_| StoreError::InvalidTtl)?;
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .ok_or(StoreError::InvalidTtl)?
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        let user_id = user_id.to_string();
        let token = token.to_string();
        let now = now_rfc3339();
        let pruned = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let pruned = tx.execute("DELETE FROM sessions WHERE expires_at <= ?1", [&now])?;
                tx.execute(
                    "INSERT INTO sessions (token, user_id, expires_at) VALUES (?1, ?2, ?3)",
                    [&token, &user_id, &expires_at],
                )?;
                tx.commit()?;
                Ok(pruned)
            })
            .await?;
        if pruned > 0 {
            tracing::debug!(pruned, "expired sessions removed");
        }
        Ok(())
    }

    /// The user id a live token belongs to. Expired tokens resolve to `None`.
    pub async fn user_for_token(&self, token: &str) -> Result<Option<String>, StoreError> {
        let token = token.to_string();
        let now = now_rfc3339();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT user_id FROM sessions WHERE token = ?1 AND expires_at > ?2",
                )?;
                let mut rows = stmt.query_map([&token, &now], |row| row.get::<_, String>(0))?;
                Ok(rows.next().transpose()?)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn count_users(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> AuthStore {
        AuthStore::open(Path::new(":memory:")).await.unwrap()
    }

    fn new_user(username: &str, email: &str) -> NewUser {
        NewUser {
            name: "Test User".to_string(),
            email: email.to_string(),
            username: username.to_string(),
            password_hash: "sha256$1$00$00".to_string(),
        }
    }

    fn attempt(user_id: Option<&str>, success: bool) -> LoginAttempt {
        LoginAttempt {
            user_id: user_id.map(str::to_string),
            username: "alice".to_string(),
            success,
            face_detected: true,
            ip_address: Some("127.0.0.1".to_string()),
            user_agent: Some("test".to_string()),
        }
    }

    #[tokio::test]
    async fn test_create_and_find_user() {
        let store = memory_store().await;
        let user = store
            .create_user(new_user("alice", "alice@example.com"))
            .await
            .unwrap();

        let by_name = store.find_by_username("alice").await.unwrap().unwrap();
        assert_eq!(by_name.id, user.id);
        let by_id = store.find_by_id(&user.id).await.unwrap().unwrap();
        assert_eq!(by_id.email, "alice@example.com");
        assert!(store.find_by_username("bob").await.unwrap().is_none());
        assert_eq!(store.count_users().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_username_or_email_rejected() {
        let store = memory_store().await;
        store
            .create_user(new_user("alice", "alice@example.com"))
            .await
            .unwrap();

        let same_name = store.create_user(new_user("alice", "other@example.com")).await;
        assert!(matches!(same_name, Err(StoreError::UserExists)));
        let same_email = store.create_user(new_user("alice2", "alice@example.com")).await;
        assert!(matches!(same_email, Err(StoreError::UserExists)));
        assert_eq!(store.count_users().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_history_newest_first_and_limited() {
        let store = memory_store().await;
        let user = store
            .create_user(new_user("alice", "alice@example.com"))
            .await
            .unwrap();

        for i in 0..12 {
            store.record_attempt(attempt(Some(&user.id), i == 11)).await.unwrap();
        }
        store.record_attempt(attempt(None, false)).await.unwrap();

        let history = store.history_for_user(&user.id, 10).await.unwrap();
        assert_eq!(history.len(), 10);
        assert!(history[0].success);
        assert!(history.iter().skip(1).all(|r| !r.success));
        assert!(history.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_session_lookup_and_expiry() {
        let store = memory_store().await;
        store
            .create_session("user-1", "live", Duration::from_secs(3600))
            .await
            .unwrap();
        store
            .create_session("user-1", "dead", Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(
            store.user_for_token("live").await.unwrap().as_deref(),
            Some("user-1")
        );
        assert!(store.user_for_token("dead").await.unwrap().is_none());
        assert!(store.user_for_token("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_new_session_prunes_expired() {
        let store = memory_store().await;
        store
            .create_session("user-1", "old", Duration::ZERO)
            .await
            .unwrap();
        store
            .create_session("user-1", "new", Duration::from_secs(3600))
            .await
            .unwrap();

        let tokens: Vec<String> = store
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT token FROM sessions")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                Ok(rows.collect::<Result<Vec<String>, _>>()?)
            })
            .await
            .unwrap();
        assert_eq!(tokens, vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_user_keeps_sessions() {
        let store = memory_store().await;
        let user = store
            .create_user(new_user("alice", "alice@example.com"))
            .await
            .unwrap();
        store
            .create_session(&user.id, "tok", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(store.delete_user(&user.id).await.unwrap());
        assert!(!store.delete_user(&user.id).await.unwrap());
        assert_eq!(
            store.user_for_token("tok").await.unwrap().as_deref(),
            Some(user.id.as_str())
        );
        assert!(store.find_by_id(&user.id).await.unwrap().is_none());
    }
}
