use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::Sha256;
use std::path::Path;
use std::sync::{Arc, Mutex};

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub username: String,
    #[serde(skip)]
    pub password_hash: String,
    pub voice_model: Option<String>,
    pub agent_handle: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("username already taken")]
    UsernameTaken,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub struct AccountStore {
    conn: Mutex<Connection>,
    default_voice_model: Option<String>,
}

impl AccountStore {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the account database. Accounts registered without a
    /// voice model get `default_voice_model`.
    pub fn new<P: AsRef<Path>>(path: P, default_voice_model: Option<String>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open account database {:?}", path.as_ref()))?;
        let store = Self {
            conn: Mutex::new(conn),
            default_voice_model,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                voice_model TEXT,
                agent_handle TEXT,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;
        Ok(())
    }

    pub fn create(
        &self,
        username: &str,
        password: &str,
        voice_model: Option<&str>,
    ) -> Result<Account, AccountError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(AccountError::InvalidCredentials);
        }

        let voice_model = voice_model
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .or_else(|| self.default_voice_model.clone());
        let password_hash = hash_password(password);
        let created_at = Utc::now();

        let conn = self.lock_conn()?;
        let inserted = conn.execute(
            "INSERT INTO accounts (username, password_hash, voice_model, agent_handle, created_at)
             VALUES (?1, ?2, ?3, NULL, ?4)",
            params![
                username,
                password_hash,
                voice_model,
                created_at.to_rfc3339()
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(AccountError::UsernameTaken);
            }
            Err(e) => return Err(AccountError::Storage(e.into())),
        }

        tracing::info!("Registered account '{}'", username);
        Ok(Account {
            username: username.to_string(),
            password_hash,
            voice_model,
            agent_handle: None,
            created_at,
        })
    }

    pub fn get(&self, username: &str) -> Result<Option<Account>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT username, password_hash, voice_model, agent_handle, created_at
                 FROM accounts WHERE username = ?1",
                [username],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((username, password_hash, voice_model, agent_handle, created_at)) = row else {
            return Ok(None);
        };
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Ok(Some(Account {
            username,
            password_hash,
            voice_model,
            agent_handle,
            created_at,
        }))
    }

    /// The account for `username` if the password matches.
    pub fn verify_login(&self, username: &str, password: &str) -> Result<Account, AccountError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(AccountError::InvalidCredentials);
        }
        match self.get(username)? {
            Some(account) if verify_password(password, &account.password_hash) => Ok(account),
            _ => Err(AccountError::InvalidCredentials),
        }
    }

    pub fn set_agent_handle(&self, username: &str, handle: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE accounts SET agent_handle = ?1 WHERE username = ?2",
            params![handle, username],
        )?;
        Ok(())
    }

    pub fn set_voice_model(&self, username: &str, voice_model: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE accounts SET voice_model = ?1 WHERE username = ?2",
            params![voice_model, username],
        )?;
        Ok(())
    }
}

/// Async entry points for request handlers. Password hashing is CPU-bound,
/// so these run on the blocking pool.
pub async fn register_blocking(
    store: Arc<AccountStore>,
    username: String,
    password: String,
    voice_model: Option<String>,
) -> Result<Account, AccountError> {
    tokio::task::spawn_blocking(move || store.create(&username, &password, voice_model.as_deref()))
        .await
        .context("Account registration task failed")?
}

pub async fn login_blocking(
    store: Arc<AccountStore>,
    username: String,
    password: String,
) -> Result<Account, AccountError> {
    tokio::task::spawn_blocking(move || store.verify_login(&username, &password))
        .await
        .context("Login task failed")?
}

/// PBKDF2-HMAC-SHA256 with a random salt, encoded as `salt:hash` in base64.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let hash = derive(password, &salt);
    format!("{}:{}", BASE64.encode(salt), BASE64.encode(hash))
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Some((salt_b64, hash_b64)) = stored_hash.split_once(':') else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (BASE64.decode(salt_b64), BASE64.decode(hash_b64)) else {
        return false;
    };
    let candidate = derive(password, &salt);
    constant_time_eq(&candidate, &expected)
}

fn derive(password: &str, salt: &[u8]) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut out);
    out
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(default_voice: Option<&str>) -> (tempfile::TempDir, AccountStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AccountStore::new(
            dir.path().join("accounts.db"),
            default_voice.map(str::to_string),
        )
        .expect("db init");
        (dir, store)
    }

    #[test]
    fn password_hash_roundtrip_and_salted() {
        let first = hash_password("hunter2");
        let second = hash_password("hunter2");
        assert_ne!(first, second);
        assert!(verify_password("hunter2", &first));
        assert!(!verify_password("hunter3", &first));
        assert!(!verify_password("hunter2", "garbage"));
    }

    #[test]
    fn duplicate_registration_is_a_conflict() {
        let (_dir, store) = temp_store(None);
        store.create("ada", "pw", None).expect("first create");
        let err = store.create("ada", "other", None).unwrap_err();
        assert!(matches!(err, AccountError::UsernameTaken));
    }

    #[test]
    fn blank_credentials_are_rejected() {
        let (_dir, store) = temp_store(None);
        assert!(matches!(
            store.create("  ", "pw", None),
            Err(AccountError::InvalidCredentials)
        ));
        assert!(matches!(
            store.create("ada", "", None),
            Err(AccountError::InvalidCredentials)
        ));
    }

    #[test]
    fn registration_falls_back_to_default_voice() {
        let (_dir, store) = temp_store(Some("voice-default"));
        let account = store.create("ada", "pw", None).expect("create");
        assert_eq!(account.voice_model.as_deref(), Some("voice-default"));

        let custom = store.create("bob", "pw", Some("voice-bob")).expect("create");
        assert_eq!(custom.voice_model.as_deref(), Some("voice-bob"));
    }

    #[test]
    fn login_checks_password() {
        let (_dir, store) = temp_store(None);
        store.create("ada", "pw", None).expect("create");
        assert!(store.verify_login("ada", "pw").is_ok());
        assert!(matches!(
            store.verify_login("ada", "nope"),
            Err(AccountError::InvalidCredentials)
        ));
        assert!(matches!(
            store.verify_login("nobody", "pw"),
            Err(AccountError::InvalidCredentials)
        ));
    }

    #[test]
    fn agent_handle_and_voice_model_updates_persist() {
        let (_dir, store) = temp_store(None);
        store.create("ada", "pw", None).expect("create");
        assert!(store.get("ada").unwrap().unwrap().agent_handle.is_none());

        store.set_agent_handle("ada", "agent-123").expect("set handle");
        store.set_voice_model("ada", "voice-x").expect("set voice");

        let account = store.get("ada").expect("get").expect("exists");
        assert_eq!(account.agent_handle.as_deref(), Some("agent-123"));
        assert_eq!(account.voice_model.as_deref(), Some("voice-x"));
        assert!(store.get("missing").expect("get").is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn login_hashing_leaves_runtime_responsive() {
        let (_dir, store) = temp_store(None);
        let store = Arc::new(store);
        register_blocking(store.clone(), "ada".into(), "pw".into(), None)
            .await
            .expect("register");

        let ticked = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ticker = {
            let ticked = ticked.clone();
            async move {
                tokio::task::yield_now().await;
                ticked.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        };
        let login = async {
            let result = login_blocking(store.clone(), "ada".into(), "pw".into()).await;
            (result, ticked.load(std::sync::atomic::Ordering::SeqCst))
        };
        let ((result, ticked_during_login), ()) = tokio::join!(login, ticker);

        assert_eq!(result.expect("login").username, "ada");
        assert!(ticked_during_login);
        assert!(matches!(
            login_blocking(store, "ada".into(), "nope".into()).await,
            Err(AccountError::InvalidCredentials)
        ));
    }
}
