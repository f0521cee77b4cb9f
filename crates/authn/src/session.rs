//! Session authenticator: sign-in, token authentication and revocation.
//!
//! A session binds an account to one client origin. Its public key lives in
//! the expiring cache under the session id, and a token is only accepted
//! while that entry exists. Deleting the entry revokes every token of the
//! session at once, whatever their nominal expiry.
//!
//! Every mutating operation runs in a single transaction. On any error the
//! transaction is rolled back, so a failed sign-in never leaves a session
//! row or cache entry behind and a failed sign-out never removes only one of
//! them.

use std::{net::IpAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fail::fail_point;
use touno_core_storage::{
    AccountId, Database, ExpiringCache, GcTask, IsolationLevel, SharedClock, SqlTransaction,
    StorageError,
};
use uuid::Uuid;

use crate::{
    account::{Account, AccountSummary, Credentials},
    config::AuthConfig,
    error::{AuthError, Result},
    keys::{self, PublicKey},
    sql,
    token::{KeyResolver, TokenClaims, TokenCodec},
};

/// A session row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Session id, carried in tokens as `jti`.
    pub id: Uuid,
    /// Owning account.
    pub account: AccountId,
    /// Client origin the session is bound to.
    pub origin: IpAddr,
    /// When the session id was issued.
    pub created_at: DateTime<Utc>,
}

/// Resolves verification keys from the session cache.
///
/// A missing or expired entry, or one that does not decode as a public key,
/// means the session is revoked.
#[derive(Debug, Clone)]
pub struct CacheKeyResolver {
    cache: ExpiringCache,
}

impl CacheKeyResolver {
    /// Creates a resolver over `cache`.
    #[must_use]
    pub fn new(cache: ExpiringCache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl KeyResolver for CacheKeyResolver {
    async fn resolve(&self, session_id: Uuid) -> Result<PublicKey> {
        let Some(bytes) = self.cache.get(&session_id.to_string()).await? else {
            tracing::debug!(%session_id, "session cache miss");
            return Err(AuthError::unauthorized("session not found or revoked"));
        };
        tracing::debug!(%session_id, "session cache hit");
        keys::decode_public_key(&bytes).map_err(|e| {
            tracing::warn!(%session_id, error = %e, "cached session key does not decode");
            AuthError::unauthorized("session key unusable")
        })
    }
}

/// Issues, verifies and revokes session tokens.
///
/// # Cloning
///
/// Cheap; clones share the database, cache and clock.
#[derive(Clone)]
pub struct SessionAuthenticator {
    db: Arc<dyn Database>,
    cache: ExpiringCache,
    codec: TokenCodec,
    resolver: CacheKeyResolver,
    clock: SharedClock,
    config: AuthConfig,
}

impl std::fmt::Debug for SessionAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAuthenticator")
            .field("cache_table", &self.cache.table())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Rolls back `tx`, logging instead of masking the original error.
async fn rollback(tx: Box<dyn SqlTransaction>, operation: &'static str) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!(operation, error = %e, "rollback failed");
    }
}

impl SessionAuthenticator {
    /// Creates an authenticator.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`](touno_core_storage::ConfigError) if `config`
    /// fails [`AuthConfig::validate`], which a deserialized config has not
    /// been through.
    pub fn new(
        db: Arc<dyn Database>,
        config: AuthConfig,
        clock: SharedClock,
    ) -> std::result::Result<Self, touno_core_storage::ConfigError> {
        config.validate()?;
        let cache = ExpiringCache::new(Arc::clone(&db), config.cache_table(), Arc::clone(&clock))?;
        Ok(Self {
            db,
            resolver: CacheKeyResolver::new(cache.clone()),
            cache,
            codec: TokenCodec::new(Arc::clone(&clock)),
            clock,
            config,
        })
    }

    /// The session cache.
    #[must_use]
    pub fn cache(&self) -> &ExpiringCache {
        &self.cache
    }

    /// The token codec.
    #[must_use]
    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Creates the account, session and cache tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Storage`] if any statement fails.
    #[tracing::instrument(skip(self))]
    pub async fn init_schema(&self) -> Result<()> {
        let mut tx = self.db.begin(IsolationLevel::Default).await?;
        for stmt in &sql::SCHEMA {
            if let Err(e) = tx.execute(stmt, &[]).await {
                rollback(tx, "init_schema").await;
                return Err(e.into());
            }
        }
        tx.commit().await?;
        self.cache.init_schema().await?;
        Ok(())
    }

    /// Starts the background sweep of expired cache entries.
    ///
    /// # Errors
    ///
    /// See [`ExpiringCache::spawn_gc`].
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    pub fn spawn_cache_gc(&self) -> std::result::Result<GcTask, touno_core_storage::ConfigError> {
        self.cache.spawn_gc(self.config.gc_interval())
    }

    /// Verifies credentials, establishes or reuses the session for `origin`,
    /// and returns a signed token.
    ///
    /// A session for the same account and origin created within the reuse
    /// window keeps its id, so earlier tokens for it stay valid. Otherwise a
    /// fresh id replaces it and the superseded session's cache entry is
    /// deleted. Either way the cache entry is rewritten with a TTL equal to
    /// the token lifetime, and the transaction commits only after signing.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Unauthorized`] for unknown users or wrong passwords
    /// - [`AuthError::AccountBanned`] for banned accounts
    /// - [`AuthError::KeyDecode`] if the account's stored key is unusable
    /// - [`AuthError::SigningFailed`] or [`AuthError::Storage`] for server faults
    #[tracing::instrument(skip(self, credentials), fields(username = %credentials.username()))]
    pub async fn sign_in(&self, credentials: &Credentials, origin: IpAddr) -> Result<String> {
        let mut tx = self.db.begin(IsolationLevel::Default).await?;
        match self.sign_in_in(tx.as_mut(), credentials, origin).await {
            Ok((token, session)) => {
                fail_point!("sign-in-before-commit", |_| {
                    Err(AuthError::from(StorageError::internal("injected failure before commit")))
                });
                tx.commit().await?;
                tracing::info!(
                    audit.action = "sign_in",
                    audit.resource = %session.id,
                    audit.result = "success",
                    account = %session.account,
                    "audit_event"
                );
                Ok(token)
            },
            Err(e) => {
                rollback(tx, "sign_in").await;
                tracing::warn!(error = %e, "sign-in rejected");
                tracing::info!(
                    audit.action = "sign_in",
                    audit.result = "failure",
                    audit.reason = e.public_message(),
                    "audit_event"
                );
                Err(e)
            },
        }
    }

    async fn sign_in_in(
        &self,
        tx: &mut dyn SqlTransaction,
        credentials: &Credentials,
        origin: IpAddr,
    ) -> Result<(String, Session)> {
        let row = tx
            .query_opt(
                &sql::ACCOUNT_BY_CREDENTIALS,
                &[credentials.username().into(), credentials.password().into()],
            )
            .await?
            .ok_or_else(|| AuthError::unauthorized("credentials did not match"))?;
        let account = Account::from_row(&row)?;
        if account.level.is_banned() {
            return Err(AuthError::AccountBanned);
        }

        let session = self.establish_session(tx, account.id, origin).await?;

        let public = account
            .public_key_bytes()
            .ok_or_else(|| AuthError::key_decode("account has no public key"))?;
        self.cache
            .set_in(tx, &session.id.to_string(), public, self.config.token_lifetime())
            .await?;

        let private = account.private_key()?;
        let claims = TokenClaims::new(
            account.display_name.as_str(),
            account.external_id,
            session.id,
            credentials.username(),
            self.clock.now_millis(),
            self.config.token_lifetime(),
        );
        let token = self.codec.sign(&claims, &private)?;
        Ok((token, session))
    }

    async fn establish_session(
        &self,
        tx: &mut dyn SqlTransaction,
        account: AccountId,
        origin: IpAddr,
    ) -> Result<Session> {
        let now = self.clock.now();
        let origin_text = origin.to_string();

        let candidate = Uuid::new_v4();
        let row = tx
            .query_one(
                &sql::SESSION_CLAIM,
                &[candidate.into(), account.into(), origin_text.into(), now.into()],
            )
            .await?;
        let id = row.get_uuid("n_session")?;
        if id == candidate {
            return Ok(Session { id, account, origin, created_at: now });
        }

        let created_at = row.get_timestamp("t_created")?;
        if within(created_at, now, self.config.session_reuse_window()) {
            tracing::debug!(session_id = %id, %created_at, "reusing session");
            return Ok(Session { id, account, origin, created_at });
        }

        tracing::debug!(session_id = %id, %created_at, "replacing session past reuse window");
        self.cache.delete_in(tx, &id.to_string()).await?;
        let row = tx
            .query_one(&sql::SESSION_REPLACE, &[id.into(), Uuid::new_v4().into(), now.into()])
            .await?;
        let id = row.get_uuid("n_session")?;
        Ok(Session { id, account, origin, created_at: now })
    }

    /// Verifies `token` against the session cache.
    ///
    /// # Errors
    ///
    /// Any [`TokenCodec::verify`] error; [`AuthError::Unauthorized`] if the
    /// session is revoked or expired in the cache.
    #[tracing::instrument(skip_all)]
    pub async fn authenticate(&self, token: &str) -> Result<TokenClaims> {
        self.codec.verify(token, &self.resolver).await.inspect_err(|e| {
            tracing::warn!(error = %e, "token authentication failed");
        })
    }

    /// Revokes a session by deleting its row and cache entry together.
    ///
    /// Signing out an unknown or already revoked session succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Storage`] if either delete or the commit fails;
    /// neither is then applied.
    #[tracing::instrument(skip(self))]
    pub async fn sign_out(&self, session_id: Uuid) -> Result<()> {
        let mut tx = self.db.begin(IsolationLevel::Default).await?;
        match self.sign_out_in(tx.as_mut(), session_id).await {
            Ok(removed) => {
                tx.commit().await?;
                tracing::info!(
                    audit.action = "sign_out",
                    audit.resource = %session_id,
                    audit.result = "success",
                    removed,
                    "audit_event"
                );
                Ok(())
            },
            Err(e) => {
                rollback(tx, "sign_out").await;
                tracing::warn!(%session_id, error = %e, "sign-out failed");
                Err(e)
            },
        }
    }

    async fn sign_out_in(&self, tx: &mut dyn SqlTransaction, session_id: Uuid) -> Result<bool> {
        let removed = tx.execute(&sql::SESSION_DELETE, &[session_id.into()]).await?;
        fail_point!("sign-out-after-row-delete", |_| {
            Err(AuthError::from(StorageError::internal("injected failure after row delete")))
        });
        self.cache.delete_in(tx, &session_id.to_string()).await?;
        Ok(removed > 0)
    }

    /// Returns the public profile of an account.
    ///
    /// # Errors
    ///
    /// [`AuthError::AccountNotFound`] for unknown ids, [`AuthError::Storage`]
    /// on store failures.
    #[tracing::instrument(skip(self))]
    pub async fn get_account_info(&self, external_id: Uuid) -> Result<AccountSummary> {
        let mut tx = self.db.begin(IsolationLevel::ReadCommitted).await?;
        let row = tx.query_opt(&sql::ACCOUNT_BY_EXTERNAL_ID, &[external_id.into()]).await;
        rollback(tx, "get_account_info").await;
        let row = row?.ok_or(AuthError::AccountNotFound)?;
        Ok(AccountSummary::from_row(&row)?)
    }

    /// Replaces an account's key pair and revokes all of its sessions.
    ///
    /// The new pair is generated before the transaction opens. Returns the
    /// number of sessions revoked.
    ///
    /// # Errors
    ///
    /// [`AuthError::KeyGeneration`] if generation fails;
    /// [`AuthError::Storage`] wrapping [`StorageError::NoRows`] for unknown
    /// accounts, or any other store failure.
    #[tracing::instrument(skip(self))]
    pub async fn rotate_account_keys(&self, account: AccountId) -> Result<u64> {
        let pair = keys::generate_keypair_async().await?;

        let mut tx = self.db.begin(IsolationLevel::Default).await?;
        let result = async {
            keys::persist_keypair(tx.as_mut(), account, &pair).await?;
            let rows = tx.query(&sql::SESSION_DELETE_BY_ACCOUNT, &[account.into()]).await?;
            for row in &rows {
                let id = row.get_uuid("n_session")?;
                self.cache.delete_in(tx.as_mut(), &id.to_string()).await?;
            }
            Ok::<_, AuthError>(rows.len() as u64)
        }
        .await;

        match result {
            Ok(revoked) => {
                tx.commit().await?;
                tracing::info!(
                    audit.action = "rotate_keys",
                    audit.resource = %account,
                    audit.result = "success",
                    revoked,
                    "audit_event"
                );
                Ok(revoked)
            },
            Err(e) => {
                rollback(tx, "rotate_account_keys").await;
                Err(e)
            },
        }
    }
}

fn within(created_at: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    let Ok(window) = chrono::Duration::from_std(window) else {
        return true;
    };
    now.signed_duration_since(created_at) < window
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_within_window() {
        let created = DateTime::<Utc>::UNIX_EPOCH;
        let hour = Duration::from_secs(3600);
        assert!(within(created, created, hour));
        assert!(within(created, created + chrono::Duration::minutes(59), hour));
        assert!(!within(created, created + chrono::Duration::hours(1), hour));
    }

    #[test]
    fn test_clock_skew_counts_as_within_window() {
        let created = DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::hours(2);
        let now = DateTime::<Utc>::UNIX_EPOCH;
        assert!(within(created, now, Duration::from_secs(60)));
    }
}
