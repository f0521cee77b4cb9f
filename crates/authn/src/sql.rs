//! SQL statements for account and session rows.
//!
//! The names are stable identifiers; the in-memory test database dispatches
//! on them, PostgreSQL executes the text.

use touno_core_storage::Statement;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

pub(crate) const INIT_EXTENSION: Statement =
    Statement::new_static("authn.init.extension", "CREATE EXTENSION IF NOT EXISTS pgcrypto");

pub(crate) const INIT_ACCOUNT_TABLE: Statement = Statement::new_static(
    "authn.init.account",
    "CREATE TABLE IF NOT EXISTS user_account (
        id             BIGSERIAL PRIMARY KEY,
        n_uid          UUID NOT NULL UNIQUE DEFAULT gen_random_uuid(),
        s_display_name VARCHAR(255) NOT NULL DEFAULT '',
        s_email        VARCHAR(255) NOT NULL UNIQUE,
        s_pwd          TEXT NULL,
        n_level        VARCHAR(16) NOT NULL DEFAULT 'ACTIVE',
        a_private_key  BYTEA NULL,
        a_public_key   BYTEA NULL,
        t_created      TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
);

pub(crate) const INIT_SESSION_TABLE: Statement = Statement::new_static(
    "authn.init.session",
    "CREATE TABLE IF NOT EXISTS user_session (
        n_session UUID PRIMARY KEY,
        user_id   BIGINT NOT NULL REFERENCES user_account (id) ON DELETE CASCADE,
        s_ipaddr  VARCHAR(45) NOT NULL,
        t_created TIMESTAMPTZ NOT NULL DEFAULT now(),
        CONSTRAINT uq_user_ip UNIQUE (user_id, s_ipaddr)
    )",
);

pub(crate) const SCHEMA: [Statement; 3] = [INIT_EXTENSION, INIT_ACCOUNT_TABLE, INIT_SESSION_TABLE];

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// `$1` email, `$2` plaintext password; the store compares hashes.
pub(crate) const ACCOUNT_BY_CREDENTIALS: Statement = Statement::new_static(
    "authn.account.by_credentials",
    "SELECT id, n_uid, s_display_name, s_email, n_level, a_private_key, a_public_key
       FROM user_account
      WHERE s_email = $1 AND s_pwd IS NOT NULL AND s_pwd = crypt($2, s_pwd)",
);

pub(crate) const ACCOUNT_BY_EXTERNAL_ID: Statement = Statement::new_static(
    "authn.account.by_external_id",
    "SELECT s_display_name, s_email, n_level FROM user_account WHERE n_uid = $1",
);

pub(crate) const ACCOUNT_UPDATE_KEYS: Statement = Statement::new_static(
    "authn.account.update_keys",
    "UPDATE user_account SET a_private_key = $2, a_public_key = $3 WHERE id = $1",
);

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Inserts a session for (account, origin) unless one exists, returning
/// whichever row holds the slot. The no-op update locks an existing row, so
/// concurrent sign-ins for the same origin all resolve to the first writer.
pub(crate) const SESSION_CLAIM: Statement = Statement::new_static(
    "authn.session.claim",
    "INSERT INTO user_session (n_session, user_id, s_ipaddr, t_created) VALUES ($1, $2, $3, $4)
     ON CONFLICT ON CONSTRAINT uq_user_ip
     DO UPDATE SET n_session = user_session.n_session
     RETURNING n_session, t_created",
);

/// Gives the session `$1` a fresh id `$2` issued at `$3`.
pub(crate) const SESSION_REPLACE: Statement = Statement::new_static(
    "authn.session.replace",
    "UPDATE user_session SET n_session = $2, t_created = $3
      WHERE n_session = $1
     RETURNING n_session",
);

pub(crate) const SESSION_DELETE: Statement =
    Statement::new_static("authn.session.delete", "DELETE FROM user_session WHERE n_session = $1");

pub(crate) const SESSION_DELETE_BY_ACCOUNT: Statement = Statement::new_static(
    "authn.session.delete_by_account",
    "DELETE FROM user_session WHERE user_id = $1 RETURNING n_session",
);
