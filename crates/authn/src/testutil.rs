//! Shared test utilities for authentication testing.
//!
//! Provides cached RSA key pairs (generation is slow, so each process makes
//! two), an in-memory account and session store with Argon2 password hashes,
//! a ready-made [`TestHarness`], raw token crafting for attack tests, and the
//! [`assert_auth_error!`](crate::assert_auth_error) macro.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! touno-core-authn = { path = "../authn", features = ["testutil"] }
//! ```
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use touno_core_authn::testutil::{TestHarness, test_keypair};
//!
//! # async fn example() {
//! let harness = TestHarness::new();
//! let ann = harness.seed_account("ann@example.com", "pw", test_keypair()).await;
//! # }
//! ```

use std::{
    net::IpAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString,
};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand_core::{OsRng, RngCore};
use touno_core_storage::{
    AccountId, MemoryDatabase, MemoryTables, Outcome, Row, SqlValue, StorageError, StorageResult,
    testutil::ManualClock,
};
use uuid::Uuid;

use crate::{
    account::{LEVEL_ACTIVE, LEVEL_BANNED},
    config::AuthConfig,
    error::Result,
    keys::{KeyPair, PublicKey, generate_keypair},
    session::SessionAuthenticator,
    sql,
    token::{KeyResolver, TokenClaims},
};

/// Memory table holding account rows.
pub const ACCOUNT_TABLE: &str = "user_account";

/// Memory table holding session rows.
pub const SESSION_TABLE: &str = "user_session";

const ACCOUNT_SEQUENCE: &str = "user_account.id";

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// A key pair shared by all tests in the process.
///
/// # Panics
///
/// Panics if key generation fails.
pub fn test_keypair() -> &'static KeyPair {
    static PAIR: OnceLock<KeyPair> = OnceLock::new();
    PAIR.get_or_init(|| generate_keypair().expect("test key generation"))
}

/// A second shared key pair, distinct from [`test_keypair`].
///
/// # Panics
///
/// Panics if key generation fails.
pub fn test_keypair_alt() -> &'static KeyPair {
    static PAIR: OnceLock<KeyPair> = OnceLock::new();
    PAIR.get_or_init(|| generate_keypair().expect("test key generation"))
}

/// A [`KeyResolver`] that returns one fixed key and counts lookups.
#[derive(Debug)]
pub struct StaticResolver {
    key: PublicKey,
    calls: AtomicUsize,
}

impl StaticResolver {
    /// Creates a resolver answering every session with `key`.
    #[must_use]
    pub fn new(key: &PublicKey) -> Self {
        Self { key: key.clone(), calls: AtomicUsize::new(0) }
    }

    /// Number of lookups so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyResolver for StaticResolver {
    async fn resolve(&self, _session_id: Uuid) -> Result<PublicKey> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.key.clone())
    }
}

/// Builds `{header_b64}.{payload_b64}.` with an empty signature.
///
/// # Panics
///
/// Panics if JSON serialization fails.
pub fn craft_raw_token(header: &serde_json::Value, payload: &serde_json::Value) -> String {
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header).expect("header json"));
    let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload).expect("payload json"));
    format!("{header_b64}.{payload_b64}.")
}

// ---------------------------------------------------------------------------
// Passwords
// ---------------------------------------------------------------------------

/// Hashes `password` into a PHC string with a random salt.
///
/// # Panics
///
/// Panics if hashing fails.
pub fn hash_password(password: &str) -> String {
    let mut salt_bytes = [0u8; 16];
    OsRng.fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes).expect("salt encoding");
    // Minimum cost; these hashes only guard test fixtures.
    let params = argon2::Params::new(8, 1, 1, None).expect("argon2 params");
    Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params)
        .hash_password(password.as_bytes(), &salt)
        .expect("password hashing")
        .to_string()
}

fn password_matches(stored: &str, candidate: &str) -> bool {
    PasswordHash::new(stored)
        .is_ok_and(|hash| Argon2::default().verify_password(candidate.as_bytes(), &hash).is_ok())
}

// ---------------------------------------------------------------------------
// In-memory account and session store
// ---------------------------------------------------------------------------

fn param(params: &[SqlValue], idx: usize) -> StorageResult<&SqlValue> {
    params.get(idx).ok_or_else(|| StorageError::internal(format!("missing parameter ${}", idx + 1)))
}

fn text(params: &[SqlValue], idx: usize) -> StorageResult<&str> {
    param(params, idx)?
        .as_str()
        .ok_or_else(|| StorageError::internal(format!("parameter ${} must be text", idx + 1)))
}

fn int(params: &[SqlValue], idx: usize) -> StorageResult<i64> {
    param(params, idx)?
        .as_i64()
        .ok_or_else(|| StorageError::internal(format!("parameter ${} must be an integer", idx + 1)))
}

fn uuid(params: &[SqlValue], idx: usize) -> StorageResult<Uuid> {
    param(params, idx)?
        .as_uuid()
        .ok_or_else(|| StorageError::internal(format!("parameter ${} must be a uuid", idx + 1)))
}

fn project(row: &Row, columns: &[&str]) -> Row {
    let mut out = Row::new();
    for column in columns {
        if let Some(value) = row.get(column) {
            out.insert(*column, value.clone());
        }
    }
    out
}

fn matches_i64(row: &Row, column: &str, expected: i64) -> bool {
    row.get_i64(column).is_ok_and(|v| v == expected)
}

/// Registers handlers for the account and session statements on `db`.
///
/// Password checks use Argon2 PHC strings in `s_pwd`, standing in for
/// PostgreSQL's `crypt()`.
pub fn register_memory_statements(db: &MemoryDatabase) {
    for stmt in &sql::SCHEMA {
        db.register(stmt.name(), |tables: &mut MemoryTables, _: &[SqlValue]| {
            tables.table_mut(ACCOUNT_TABLE);
            tables.table_mut(SESSION_TABLE);
            Ok(Outcome::default())
        });
    }

    db.register(sql::ACCOUNT_BY_CREDENTIALS.name(), |tables, params| {
        let email = text(params, 0)?;
        let password = text(params, 1)?;
        let row = tables
            .find(ACCOUNT_TABLE, |row| {
                row.get_str("s_email").is_ok_and(|e| e == email)
                    && row.get_str("s_pwd").is_ok_and(|stored| password_matches(stored, password))
            })
            .map(|(_, row)| {
                project(
                    row,
                    &[
                        "id",
                        "n_uid",
                        "s_display_name",
                        "s_email",
                        "n_level",
                        "a_private_key",
                        "a_public_key",
                    ],
                )
            });
        Ok(Outcome::rows(row.into_iter().collect()))
    });

    db.register(sql::ACCOUNT_BY_EXTERNAL_ID.name(), |tables, params| {
        let external = uuid(params, 0)?;
        let row = tables
            .find(ACCOUNT_TABLE, |row| row.get_uuid("n_uid").is_ok_and(|id| id == external))
            .map(|(_, row)| project(row, &["s_display_name", "s_email", "n_level"]));
        Ok(Outcome::rows(row.into_iter().collect()))
    });

    db.register(sql::ACCOUNT_UPDATE_KEYS.name(), |tables, params| {
        let id = int(params, 0)?;
        let private = param(params, 1)?.clone();
        let public = param(params, 2)?.clone();
        let Some(row) = tables.table_mut(ACCOUNT_TABLE).get_mut(&id.to_string()) else {
            return Ok(Outcome::affected(0));
        };
        row.insert("a_private_key", private);
        row.insert("a_public_key", public);
        Ok(Outcome::affected(1))
    });

    db.register(sql::SESSION_CLAIM.name(), |tables, params| {
        let session = uuid(params, 0)?;
        let account = int(params, 1)?;
        let origin = text(params, 2)?.to_owned();
        let created = param(params, 3)?.clone();

        let existing = tables
            .find(SESSION_TABLE, |row| {
                matches_i64(row, "user_id", account)
                    && row.get_str("s_ipaddr").is_ok_and(|ip| ip == origin)
            })
            .map(|(_, row)| project(row, &["n_session", "t_created"]));
        if let Some(row) = existing {
            return Ok(Outcome::rows(vec![row]));
        }

        let row = Row::new()
            .with("n_session", session)
            .with("user_id", account)
            .with("s_ipaddr", origin)
            .with("t_created", created);
        let returned = project(&row, &["n_session", "t_created"]);
        tables.table_mut(SESSION_TABLE).insert(session.to_string(), row);
        Ok(Outcome::rows(vec![returned]))
    });

    db.register(sql::SESSION_REPLACE.name(), |tables, params| {
        let old = uuid(params, 0)?;
        let session = uuid(params, 1)?;
        let created = param(params, 2)?.clone();

        let table = tables.table_mut(SESSION_TABLE);
        let Some(row) = table.remove(&old.to_string()) else {
            return Ok(Outcome::rows(Vec::new()));
        };
        let row = row.with("n_session", session).with("t_created", created);
        table.insert(session.to_string(), row);
        Ok(Outcome::rows(vec![Row::new().with("n_session", session)]))
    });

    db.register(sql::SESSION_DELETE.name(), |tables, params| {
        let session = uuid(params, 0)?;
        let removed = tables.table_mut(SESSION_TABLE).remove(&session.to_string()).is_some();
        Ok(Outcome::affected(u64::from(removed)))
    });

    db.register(sql::SESSION_DELETE_BY_ACCOUNT.name(), |tables, params| {
        let account = int(params, 0)?;
        let removed =
            tables.remove_where(SESSION_TABLE, |row| matches_i64(row, "user_id", account));
        let returned = removed.iter().map(|row| project(row, &["n_session"])).collect();
        Ok(Outcome::rows(returned))
    });
}

/// Identifiers of an account created by [`TestHarness::seed_account`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeededAccount {
    /// Internal id.
    pub id: AccountId,
    /// External id.
    pub external_id: Uuid,
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// An authenticator over a fresh in-memory database and a manual clock.
#[derive(Debug, Clone)]
pub struct TestHarness {
    /// The database; inspect with [`MemoryDatabase::snapshot`].
    pub db: MemoryDatabase,
    /// Clock shared with the authenticator and its cache.
    pub clock: ManualClock,
    /// The authenticator under test.
    pub auth: SessionAuthenticator,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    /// Creates a harness with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(AuthConfig::default())
    }

    /// Creates a harness with `config`.
    ///
    /// # Panics
    ///
    /// Panics if the configured cache table is invalid.
    #[must_use]
    pub fn with_config(config: AuthConfig) -> Self {
        let db = MemoryDatabase::new();
        let clock = ManualClock::default();
        let auth = SessionAuthenticator::new(Arc::new(db.clone()), config, clock.shared())
            .expect("valid test configuration");
        auth.cache().register_memory_statements(&db);
        register_memory_statements(&db);
        Self { db, clock, auth }
    }

    /// Inserts an active account with `keys`.
    pub async fn seed_account(&self, email: &str, password: &str, keys: &KeyPair) -> SeededAccount {
        self.seed_account_with(email, password, LEVEL_ACTIVE, Some(keys)).await
    }

    /// Inserts a banned account with `keys`.
    pub async fn seed_banned_account(
        &self,
        email: &str,
        password: &str,
        keys: &KeyPair,
    ) -> SeededAccount {
        self.seed_account_with(email, password, LEVEL_BANNED, Some(keys)).await
    }

    /// Inserts an account with an explicit level and optional keys.
    ///
    /// The display name is the part of `email` before `@`.
    ///
    /// # Panics
    ///
    /// Panics if the database rejects the insert.
    pub async fn seed_account_with(
        &self,
        email: &str,
        password: &str,
        level: &str,
        keys: Option<&KeyPair>,
    ) -> SeededAccount {
        use touno_core_storage::{Database, IsolationLevel};

        let email = email.to_owned();
        let display_name = email.split('@').next().unwrap_or_default().to_owned();
        let hash = hash_password(password);
        let level = level.to_owned();
        let private: Option<Vec<u8>> = keys.map(|k| k.private().der().to_vec());
        let public: Option<Vec<u8>> = keys.map(|k| k.public().as_bytes().to_vec());
        let external_id = Uuid::new_v4();

        let name = format!("test.seed_account.{external_id}");
        self.db.register(name.clone(), move |tables, _| {
            let id = tables.next_id(ACCOUNT_SEQUENCE);
            let row = Row::new()
                .with("id", id)
                .with("n_uid", external_id)
                .with("s_display_name", display_name.clone())
                .with("s_email", email.clone())
                .with("s_pwd", hash.clone())
                .with("n_level", level.clone())
                .with("a_private_key", private.clone())
                .with("a_public_key", public.clone());
            tables.table_mut(ACCOUNT_TABLE).insert(id.to_string(), row);
            Ok(Outcome::rows(vec![Row::new().with("id", id)]))
        });

        let stmt = touno_core_storage::Statement::new(name, "");
        let mut tx = self.db.begin(IsolationLevel::Default).await.expect("begin");
        let row = tx.query_one(&stmt, &[]).await.expect("seed account");
        tx.commit().await.expect("commit");

        SeededAccount { id: AccountId(row.get_i64("id").expect("id")), external_id }
    }

    /// Signs in `email` from `origin`.
    ///
    /// # Errors
    ///
    /// Whatever [`SessionAuthenticator::sign_in`] returns.
    pub async fn sign_in(&self, email: &str, password: &str, origin: IpAddr) -> Result<String> {
        self.auth.sign_in(&crate::Credentials::new(email, password), origin).await
    }

    /// Signs `claims` with the private half of `keys`, bypassing sign-in.
    ///
    /// # Panics
    ///
    /// Panics if signing fails.
    #[must_use]
    pub fn sign_with(&self, claims: &TokenClaims, keys: &KeyPair) -> String {
        self.auth.codec().sign(claims, keys.private()).expect("test signing")
    }

    /// Number of committed session rows.
    pub async fn session_rows(&self) -> usize {
        self.db.snapshot().await.table(SESSION_TABLE).map_or(0, |t| t.len())
    }

    /// Returns `true` if a committed cache row exists for `session`,
    /// expired or not.
    pub async fn cache_row_exists(&self, session: Uuid) -> bool {
        let table = format!("cache.{}", self.auth.cache().table());
        self.db
            .snapshot()
            .await
            .table(&table)
            .is_some_and(|rows| rows.contains_key(&session.to_string()))
    }
}

/// Asserts that a [`Result<T, AuthError>`] is an `Err` matching the given
/// [`AuthError`](crate::error::AuthError) variant.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use touno_core_authn::{assert_auth_error, error::AuthError};
///
/// let result: Result<(), AuthError> = Err(AuthError::token_expired());
/// assert_auth_error!(result, TokenExpired);
/// ```
#[macro_export]
macro_rules! assert_auth_error {
    ($result:expr, $variant:ident) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "expected AuthError::{}, got: {:?}",
            stringify!($variant),
            $result,
        );
    };
    ($result:expr, $variant:ident, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "{}: expected AuthError::{}, got: {:?}",
            $msg,
            stringify!($variant),
            $result,
        );
    };
}
