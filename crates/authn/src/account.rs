//! Account records and sign-in credentials.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use touno_core_storage::{AccountId, Row, StorageResult};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::{
    error::{AuthError, Result},
    keys::{self, PrivateKey},
};

/// Stored value of an active account's level.
pub const LEVEL_ACTIVE: &str = "ACTIVE";

/// Stored value of a banned account's level.
pub const LEVEL_BANNED: &str = "BANED";

/// Account status level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AccountLevel {
    /// May sign in.
    Active,
    /// Sign-in is refused.
    Banned,
    /// Any other stored level; may sign in.
    Other(String),
}

impl AccountLevel {
    /// The stored representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Active => LEVEL_ACTIVE,
            Self::Banned => LEVEL_BANNED,
            Self::Other(level) => level,
        }
    }

    /// Returns `true` for the banned sentinel.
    #[must_use]
    pub fn is_banned(&self) -> bool {
        matches!(self, Self::Banned)
    }
}

impl From<String> for AccountLevel {
    fn from(level: String) -> Self {
        match level.as_str() {
            LEVEL_ACTIVE => Self::Active,
            // Older rows spell it correctly.
            LEVEL_BANNED | "BANNED" => Self::Banned,
            _ => Self::Other(level),
        }
    }
}

impl From<AccountLevel> for String {
    fn from(level: AccountLevel) -> Self {
        match level {
            AccountLevel::Other(level) => level,
            other => other.as_str().to_owned(),
        }
    }
}

impl fmt::Display for AccountLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An account row as read during sign-in.
pub struct Account {
    /// Internal row id.
    pub id: AccountId,
    /// Public identifier, carried in tokens as `sub`.
    pub external_id: Uuid,
    /// Display name, carried in tokens as `dat`.
    pub display_name: String,
    /// Sign-in email.
    pub email: String,
    /// Status level.
    pub level: AccountLevel,
    private_key: Option<Zeroizing<Vec<u8>>>,
    public_key: Option<Bytes>,
}

impl Account {
    pub(crate) fn from_row(row: &Row) -> StorageResult<Self> {
        Ok(Self {
            id: AccountId(row.get_i64("id")?),
            external_id: row.get_uuid("n_uid")?,
            display_name: row.get_str("s_display_name")?.to_owned(),
            email: row.get_str("s_email")?.to_owned(),
            level: AccountLevel::from(row.get_str("n_level")?.to_owned()),
            private_key: row.get_opt_bytes("a_private_key")?.map(|b| Zeroizing::new(b.to_vec())),
            public_key: row.get_opt_bytes("a_public_key")?,
        })
    }

    /// Returns `true` if both key halves are present.
    #[must_use]
    pub fn has_keys(&self) -> bool {
        self.private_key.is_some() && self.public_key.is_some()
    }

    /// The stored public key bytes, if any.
    #[must_use]
    pub fn public_key_bytes(&self) -> Option<&[u8]> {
        self.public_key.as_deref()
    }

    pub(crate) fn private_key(&self) -> Result<PrivateKey> {
        let der = self
            .private_key
            .as_ref()
            .ok_or_else(|| AuthError::key_decode("account has no private key"))?;
        keys::load_private_key(der)
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("external_id", &self.external_id)
            .field("display_name", &self.display_name)
            .field("email", &self.email)
            .field("level", &self.level)
            .field("has_keys", &self.has_keys())
            .finish_non_exhaustive()
    }
}

/// Read-only projection returned by
/// [`SessionAuthenticator::get_account_info`](crate::SessionAuthenticator::get_account_info).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSummary {
    /// Display name.
    pub display_name: String,
    /// Email.
    pub email: String,
    /// Status level.
    pub level: AccountLevel,
}

impl AccountSummary {
    pub(crate) fn from_row(row: &Row) -> StorageResult<Self> {
        Ok(Self {
            display_name: row.get_str("s_display_name")?.to_owned(),
            email: row.get_str("s_email")?.to_owned(),
            level: AccountLevel::from(row.get_str("n_level")?.to_owned()),
        })
    }
}

/// Username and password presented at sign-in.
///
/// The password is zeroized on drop and never printed.
pub struct Credentials {
    username: String,
    password: Zeroizing<String>,
}

impl Credentials {
    /// Creates credentials from a username (the account email) and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: Zeroizing::new(password.into()) }
    }

    /// The username.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        assert_eq!(AccountLevel::from("ACTIVE".to_owned()), AccountLevel::Active);
        assert_eq!(AccountLevel::from("BANED".to_owned()), AccountLevel::Banned);
        assert_eq!(AccountLevel::from("BANNED".to_owned()), AccountLevel::Banned);
        assert_eq!(AccountLevel::from("ADMIN".to_owned()), AccountLevel::Other("ADMIN".into()));
        assert!(AccountLevel::Banned.is_banned());
        assert!(!AccountLevel::Other("ADMIN".into()).is_banned());
    }

    #[test]
    fn test_level_serializes_as_stored_string() {
        let summary = AccountSummary {
            display_name: "Ann".into(),
            email: "ann@example.com".into(),
            level: AccountLevel::Banned,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["level"], "BANED");
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("ann@example.com", "hunter2");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("ann@example.com"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_account_from_row_without_keys() {
        let row = Row::new()
            .with("id", 3_i64)
            .with("n_uid", Uuid::nil())
            .with("s_display_name", "Ann")
            .with("s_email", "ann@example.com")
            .with("n_level", "ACTIVE")
            .with("a_private_key", Option::<Bytes>::None)
            .with("a_public_key", Option::<Bytes>::None);

        let account = Account::from_row(&row).unwrap();
        assert_eq!(account.id, AccountId(3));
        assert!(!account.has_keys());
        assert!(matches!(account.private_key(), Err(AuthError::KeyDecode { .. })));
        assert!(!format!("{account:?}").contains("private_key"));
    }
}
