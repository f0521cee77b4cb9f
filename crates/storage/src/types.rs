//! Row, value and statement types shared by every database adapter.
//!
//! Adapters speak in [`SqlValue`] parameters and return [`Row`]s, a
//! column-name keyed map. Typed accessors on [`Row`] turn absent columns
//! and type mismatches into [`StorageError`]s instead of silently
//! defaulting.

use std::{borrow::Cow, collections::BTreeMap, fmt};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};

/// Macro to define a newtype wrapper around `i64` with standard trait
/// implementations.
///
/// Each generated type derives the usual comparison traits plus transparent
/// serde, converts to and from `i64`, and displays as the inner value.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl From<$name> for SqlValue {
            fn from(id: $name) -> Self {
                SqlValue::Int(id.0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Internal (database) identifier of a user account.
    ///
    /// Never leaves the service; tokens carry the external UUID instead.
    ///
    /// # Examples
    ///
    /// ```
    /// use touno_core_storage::AccountId;
    ///
    /// let id = AccountId::from(42);
    /// assert_eq!(i64::from(id), 42);
    /// assert_eq!(id.to_string(), "42");
    /// ```
    AccountId
);

/// A single SQL parameter or column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL `NULL`.
    Null,
    /// `BOOLEAN`.
    Bool(bool),
    /// Any integer column, widened to `i64`.
    Int(i64),
    /// `TEXT` / `VARCHAR`.
    Text(String),
    /// `BYTEA`.
    Bytes(Bytes),
    /// `TIMESTAMPTZ`.
    Timestamp(DateTime<Utc>),
    /// `UUID`.
    Uuid(Uuid),
}

impl SqlValue {
    fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Bool(_) => "a boolean",
            SqlValue::Int(_) => "an integer",
            SqlValue::Text(_) => "text",
            SqlValue::Bytes(_) => "bytes",
            SqlValue::Timestamp(_) => "a timestamp",
            SqlValue::Uuid(_) => "a uuid",
        }
    }

    /// Returns the text value, if this is [`SqlValue::Text`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer value, if this is [`SqlValue::Int`].
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the byte value, if this is [`SqlValue::Bytes`].
    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            SqlValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the UUID value, parsing text columns when needed.
    #[must_use]
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            SqlValue::Uuid(u) => Some(*u),
            SqlValue::Text(s) => Uuid::parse_str(s).ok(),
            _ => None,
        }
    }

    /// Returns the timestamp value, if this is [`SqlValue::Timestamp`].
    #[must_use]
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            SqlValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_owned())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Bytes> for SqlValue {
    fn from(v: Bytes) -> Self {
        SqlValue::Bytes(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(Bytes::from(v))
    }
}

impl From<&[u8]> for SqlValue {
    fn from(v: &[u8]) -> Self {
        SqlValue::Bytes(Bytes::copy_from_slice(v))
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

/// One result row, keyed by column name.
///
/// # Examples
///
/// ```
/// use touno_core_storage::{Row, SqlValue};
///
/// let row = Row::new().with("id", 7_i64).with("s_email", "a@example.com");
/// assert_eq!(row.get_i64("id").unwrap(), 7);
/// assert!(row.get_str("missing").is_err());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: BTreeMap<String, SqlValue>,
}

impl Row {
    /// Creates an empty row.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.insert(column, value);
        self
    }

    /// Sets a column, replacing any previous value.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<SqlValue>) {
        self.columns.insert(column.into(), value.into());
    }

    /// Returns the raw value of a column.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns.get(column)
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns `true` if the row has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterates over `(column, value)` pairs in column-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn require(&self, column: &str) -> StorageResult<&SqlValue> {
        self.columns.get(column).ok_or_else(|| StorageError::missing_column(column))
    }

    fn typed<'a, T>(
        &'a self,
        column: &str,
        expected: &'static str,
        pick: impl FnOnce(&'a SqlValue) -> Option<T>,
    ) -> StorageResult<T> {
        let value = self.require(column)?;
        pick(value).ok_or_else(|| {
            tracing::trace!(column, actual = value.type_name(), expected, "row type mismatch");
            StorageError::type_mismatch(column, expected)
        })
    }

    /// Reads a text column.
    pub fn get_str(&self, column: &str) -> StorageResult<&str> {
        self.typed(column, "text", SqlValue::as_str)
    }

    /// Reads an integer column.
    pub fn get_i64(&self, column: &str) -> StorageResult<i64> {
        self.typed(column, "an integer", SqlValue::as_i64)
    }

    /// Reads a boolean column.
    pub fn get_bool(&self, column: &str) -> StorageResult<bool> {
        self.typed(column, "a boolean", |v| match v {
            SqlValue::Bool(b) => Some(*b),
            _ => None,
        })
    }

    /// Reads a non-null byte column.
    pub fn get_bytes(&self, column: &str) -> StorageResult<Bytes> {
        self.typed(column, "bytes", |v| v.as_bytes().cloned())
    }

    /// Reads a nullable byte column.
    pub fn get_opt_bytes(&self, column: &str) -> StorageResult<Option<Bytes>> {
        match self.require(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::Bytes(b) => Ok(Some(b.clone())),
            _ => Err(StorageError::type_mismatch(column, "bytes")),
        }
    }

    /// Reads a timestamp column.
    pub fn get_timestamp(&self, column: &str) -> StorageResult<DateTime<Utc>> {
        self.typed(column, "a timestamp", SqlValue::as_timestamp)
    }

    /// Reads a UUID column, accepting its canonical text form as well.
    pub fn get_uuid(&self, column: &str) -> StorageResult<Uuid> {
        self.typed(column, "a uuid", SqlValue::as_uuid)
    }
}

/// Transaction isolation levels.
///
/// The set mirrors the levels exposed by common SQL drivers. PostgreSQL
/// implements four of them; the others map onto the nearest stronger level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    /// Use the server's configured default.
    #[default]
    Default,
    /// Dirty reads allowed (PostgreSQL treats this as read committed).
    ReadUncommitted,
    /// Only committed data is visible.
    ReadCommitted,
    /// Alias of read committed for drivers that distinguish write visibility.
    WriteCommitted,
    /// Repeatable reads.
    RepeatableRead,
    /// Snapshot isolation (PostgreSQL repeatable read).
    Snapshot,
    /// Full serializability.
    Serializable,
    /// Linearizable (PostgreSQL serializable).
    Linearizable,
}

impl IsolationLevel {
    /// The PostgreSQL `BEGIN` statement for this level.
    #[must_use]
    pub fn begin_statement(self) -> &'static str {
        match self {
            IsolationLevel::Default => "BEGIN",
            IsolationLevel::ReadUncommitted => "BEGIN ISOLATION LEVEL READ UNCOMMITTED",
            IsolationLevel::ReadCommitted | IsolationLevel::WriteCommitted => {
                "BEGIN ISOLATION LEVEL READ COMMITTED"
            },
            IsolationLevel::RepeatableRead | IsolationLevel::Snapshot => {
                "BEGIN ISOLATION LEVEL REPEATABLE READ"
            },
            IsolationLevel::Serializable | IsolationLevel::Linearizable => {
                "BEGIN ISOLATION LEVEL SERIALIZABLE"
            },
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A named SQL statement.
///
/// `sql` is what a real database executes; `name` identifies the statement
/// to [`MemoryDatabase`](crate::MemoryDatabase), which dispatches on it
/// instead of parsing SQL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Statement {
    name: Cow<'static, str>,
    sql: Cow<'static, str>,
}

impl Statement {
    /// Creates a statement from static strings.
    #[must_use]
    pub const fn new_static(name: &'static str, sql: &'static str) -> Self {
        Self { name: Cow::Borrowed(name), sql: Cow::Borrowed(sql) }
    }

    /// Creates a statement from owned or borrowed strings.
    #[must_use]
    pub fn new(name: impl Into<Cow<'static, str>>, sql: impl Into<Cow<'static, str>>) -> Self {
        Self { name: name.into(), sql: sql.into() }
    }

    /// Statement name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// SQL text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_row_typed_accessors() {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let row = Row::new()
            .with("id", 1_i64)
            .with("s_name", "alice")
            .with("b_flag", true)
            .with("a_key", vec![1_u8, 2, 3])
            .with("a_missing_key", SqlValue::Null)
            .with("t_created", now)
            .with("n_session", id);

        assert_eq!(row.get_i64("id").unwrap(), 1);
        assert_eq!(row.get_str("s_name").unwrap(), "alice");
        assert!(row.get_bool("b_flag").unwrap());
        assert_eq!(row.get_bytes("a_key").unwrap().as_ref(), &[1, 2, 3]);
        assert_eq!(row.get_opt_bytes("a_missing_key").unwrap(), None);
        assert_eq!(row.get_timestamp("t_created").unwrap(), now);
        assert_eq!(row.get_uuid("n_session").unwrap(), id);
    }

    #[test]
    fn test_row_missing_column() {
        let row = Row::new();
        assert!(matches!(row.get_i64("id"), Err(StorageError::MissingColumn { .. })));
    }

    #[test]
    fn test_row_type_mismatch() {
        let row = Row::new().with("id", "not a number");
        assert!(matches!(
            row.get_i64("id"),
            Err(StorageError::TypeMismatch { expected: "an integer", .. })
        ));
    }

    #[test]
    fn test_uuid_parsed_from_text() {
        let id = Uuid::new_v4();
        let row = Row::new().with("n_session", id.to_string());
        assert_eq!(row.get_uuid("n_session").unwrap(), id);
    }

    #[test]
    fn test_option_maps_to_null() {
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some(3_i64)), SqlValue::Int(3));
    }

    #[test]
    fn test_isolation_begin_statement() {
        assert_eq!(IsolationLevel::Default.begin_statement(), "BEGIN");
        assert_eq!(
            IsolationLevel::Snapshot.begin_statement(),
            "BEGIN ISOLATION LEVEL REPEATABLE READ"
        );
        assert_eq!(
            IsolationLevel::Linearizable.begin_statement(),
            "BEGIN ISOLATION LEVEL SERIALIZABLE"
        );
    }

    #[test]
    fn test_account_id_conversions() {
        let id = AccountId::from(9);
        assert_eq!(SqlValue::from(id), SqlValue::Int(9));
        assert_eq!(id.to_string(), "9");
    }
}
