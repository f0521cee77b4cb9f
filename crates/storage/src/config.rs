//! Connection and pool configuration for the PostgreSQL adapter.
//!
//! [`PostgresConfig`] can be built in code, deserialized (durations use
//! `humantime` strings such as `"30m"`), or read from the process
//! environment with [`PostgresConfig::from_env`]:
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `PG_HOST` | `host` | required |
//! | `PG_PORT` | `port` | `5432` |
//! | `PG_USER` | `user` | required |
//! | `PG_PASS` | `password` | empty |
//! | `PG_DBNAME` | `dbname` | required |
//! | `PG_SSLMODE` | `ssl_mode` | `disable` |
//! | `PG_LIFETIME` | `max_lifetime` (seconds) | 30 minutes |
//! | `PG_MAXIDLE` | `max_idle` | `2` |
//! | `PG_MAXCONN` | `max_connections` | `10` |

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default PostgreSQL port.
pub const DEFAULT_PORT: u16 = 5432;

/// Default upper bound on open connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// Default number of idle connections kept in the pool.
pub const DEFAULT_MAX_IDLE: usize = 2;

/// Default maximum age of a pooled connection.
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Default time allowed to establish a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time a caller waits for a free connection.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// TLS negotiation mode.
///
/// Only plaintext connections are supported; `prefer` falls back to
/// plaintext against servers that offer TLS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    /// Never use TLS.
    #[default]
    Disable,
    /// Use TLS if available, otherwise plaintext.
    Prefer,
}

impl FromStr for SslMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "disable" => Ok(SslMode::Disable),
            "prefer" | "allow" => Ok(SslMode::Prefer),
            other => Err(ConfigError::Invalid {
                field: "ssl_mode",
                reason: format!("unsupported mode '{other}' (expected disable or prefer)"),
            }),
        }
    }
}

/// PostgreSQL connection and pool settings.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use touno_core_storage::PostgresConfig;
///
/// let config = PostgresConfig::builder()
///     .host("localhost")
///     .user("touno")
///     .dbname("core")
///     .max_connections(20)
///     .max_lifetime(Duration::from_secs(600))
///     .build()?;
/// assert_eq!(config.port(), 5432);
/// # Ok::<(), touno_core_storage::ConfigError>(())
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostgresConfig {
    pub(crate) host: String,
    #[serde(default = "default_port")]
    pub(crate) port: u16,
    pub(crate) user: String,
    #[serde(default)]
    pub(crate) password: String,
    pub(crate) dbname: String,
    #[serde(default = "default_application_name")]
    pub(crate) application_name: String,
    #[serde(default)]
    pub(crate) ssl_mode: SslMode,
    #[serde(default = "default_max_connections")]
    pub(crate) max_connections: usize,
    #[serde(default = "default_max_idle")]
    pub(crate) max_idle: usize,
    #[serde(with = "humantime_serde", default = "default_max_lifetime")]
    pub(crate) max_lifetime: Duration,
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub(crate) connect_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_acquire_timeout")]
    pub(crate) acquire_timeout: Duration,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_application_name() -> String {
    "touno-core".to_owned()
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_max_idle() -> usize {
    DEFAULT_MAX_IDLE
}

fn default_max_lifetime() -> Duration {
    DEFAULT_MAX_LIFETIME
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_acquire_timeout() -> Duration {
    DEFAULT_ACQUIRE_TIMEOUT
}

impl fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("dbname", &self.dbname)
            .field("application_name", &self.application_name)
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .field("max_idle", &self.max_idle)
            .field("max_lifetime", &self.max_lifetime)
            .field("connect_timeout", &self.connect_timeout)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

#[bon::bon]
impl PostgresConfig {
    /// Creates a new configuration, validating pool bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - `host`, `user` or `dbname` is empty
    /// - `max_connections` is zero
    /// - `max_idle` exceeds `max_connections`
    /// - `max_lifetime`, `connect_timeout` or `acquire_timeout` is zero
    #[builder]
    pub fn new(
        #[builder(into)] host: String,
        #[builder(default = DEFAULT_PORT)] port: u16,
        #[builder(into)] user: String,
        #[builder(into, default)] password: String,
        #[builder(into)] dbname: String,
        #[builder(into, default = default_application_name())] application_name: String,
        #[builder(default)] ssl_mode: SslMode,
        #[builder(default = DEFAULT_MAX_CONNECTIONS)] max_connections: usize,
        #[builder(default = DEFAULT_MAX_IDLE)] max_idle: usize,
        #[builder(default = DEFAULT_MAX_LIFETIME)] max_lifetime: Duration,
        #[builder(default = DEFAULT_CONNECT_TIMEOUT)] connect_timeout: Duration,
        #[builder(default = DEFAULT_ACQUIRE_TIMEOUT)] acquire_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            host,
            port,
            user,
            password,
            dbname,
            application_name,
            ssl_mode,
            max_connections,
            max_idle,
            max_lifetime,
            connect_timeout,
            acquire_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reads the configuration from `PG_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] for absent required variables and
    /// [`ConfigError::Invalid`] for unparsable values.
    pub fn from_env(application_name: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(application_name, |key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup(
        application_name: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));
        fn parse<T: FromStr>(field: &'static str, value: &str) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::Invalid {
                field,
                reason: format!("'{value}' is not a valid number"),
            })
        }

        let port = get("PG_PORT").map(|v| parse("PG_PORT", &v)).transpose()?;
        let ssl_mode = get("PG_SSLMODE").map(|v| v.parse()).transpose()?;
        let max_lifetime = get("PG_LIFETIME")
            .map(|v| parse::<u64>("PG_LIFETIME", &v).map(Duration::from_secs))
            .transpose()?;
        let max_idle = get("PG_MAXIDLE").map(|v| parse("PG_MAXIDLE", &v)).transpose()?;
        let max_connections = get("PG_MAXCONN").map(|v| parse("PG_MAXCONN", &v)).transpose()?;

        Self::builder()
            .host(require("PG_HOST")?)
            .maybe_port(port)
            .user(require("PG_USER")?)
            .maybe_password(get("PG_PASS"))
            .dbname(require("PG_DBNAME")?)
            .application_name(application_name)
            .maybe_ssl_mode(ssl_mode)
            .maybe_max_connections(max_connections)
            .maybe_max_idle(max_idle)
            .maybe_max_lifetime(max_lifetime)
            .build()
    }

    /// Checks invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("host", &self.host), ("user", &self.user), ("dbname", &self.dbname)]
        {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid { field, reason: "must not be empty".into() });
            }
        }
        if self.max_connections == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_connections",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if self.max_idle > self.max_connections {
            return Err(ConfigError::Invalid {
                field: "max_idle",
                reason: format!(
                    "{} exceeds max_connections ({})",
                    self.max_idle, self.max_connections
                ),
            });
        }
        for (field, value) in [
            ("max_lifetime", self.max_lifetime),
            ("connect_timeout", self.connect_timeout),
            ("acquire_timeout", self.acquire_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::BelowMinimum {
                    field,
                    min: "1ms".into(),
                    value: "0s".into(),
                });
            }
        }
        Ok(())
    }

    /// Server host name.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Server port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Database name.
    #[must_use]
    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    /// Maximum number of open connections.
    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Maximum number of idle connections kept for reuse.
    #[must_use]
    pub fn max_idle(&self) -> usize {
        self.max_idle
    }

    /// Maximum age of a connection before it is closed.
    #[must_use]
    pub fn max_lifetime(&self) -> Duration {
        self.max_lifetime
    }

    /// Maximum time to wait for a free connection.
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Builds the driver configuration.
    #[cfg(feature = "postgres")]
    pub(crate) fn to_driver_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(&self.dbname)
            .application_name(&self.application_name)
            .connect_timeout(self.connect_timeout)
            .ssl_mode(match self.ssl_mode {
                SslMode::Disable => tokio_postgres::config::SslMode::Disable,
                SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
            });
        if !self.password.is_empty() {
            config.password(&self.password);
        }
        config
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_builder_defaults() {
        let config =
            PostgresConfig::builder().host("db").user("app").dbname("core").build().unwrap();

        assert_eq!(config.port(), DEFAULT_PORT);
        assert_eq!(config.max_connections(), DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.max_idle(), DEFAULT_MAX_IDLE);
        assert_eq!(config.max_lifetime(), DEFAULT_MAX_LIFETIME);
        assert_eq!(config.ssl_mode, SslMode::Disable);
    }

    #[test]
    fn test_zero_connections_rejected() {
        let err = PostgresConfig::builder()
            .host("db")
            .user("app")
            .dbname("core")
            .max_connections(0)
            .max_idle(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { field: "max_connections", .. }));
    }

    #[test]
    fn test_idle_above_max_rejected() {
        let err = PostgresConfig::builder()
            .host("db")
            .user("app")
            .dbname("core")
            .max_connections(2)
            .max_idle(3)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "max_idle", .. }));
    }

    #[test]
    fn test_from_env() {
        let config = PostgresConfig::from_lookup(
            "core-api",
            env(&[
                ("PG_HOST", "db.internal"),
                ("PG_PORT", "6432"),
                ("PG_USER", "app"),
                ("PG_PASS", "hunter2"),
                ("PG_DBNAME", "core"),
                ("PG_LIFETIME", "120"),
                ("PG_MAXIDLE", "4"),
                ("PG_MAXCONN", "16"),
            ]),
        )
        .unwrap();

        assert_eq!(config.host(), "db.internal");
        assert_eq!(config.port(), 6432);
        assert_eq!(config.max_lifetime(), Duration::from_secs(120));
        assert_eq!(config.max_idle(), 4);
        assert_eq!(config.max_connections(), 16);
        assert_eq!(config.application_name, "core-api");
    }

    #[test]
    fn test_from_env_missing_host() {
        let err = PostgresConfig::from_lookup("x", env(&[("PG_USER", "a"), ("PG_DBNAME", "b")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::Missing("PG_HOST"));
    }

    #[test]
    fn test_from_env_bad_number() {
        let err = PostgresConfig::from_lookup(
            "x",
            env(&[("PG_HOST", "h"), ("PG_USER", "a"), ("PG_DBNAME", "b"), ("PG_MAXCONN", "lots")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "PG_MAXCONN", .. }));
    }

    #[test]
    fn test_ssl_mode_parsing() {
        assert_eq!("".parse::<SslMode>().unwrap(), SslMode::Disable);
        assert_eq!("Prefer".parse::<SslMode>().unwrap(), SslMode::Prefer);
        assert!("verify-full".parse::<SslMode>().is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = PostgresConfig::builder()
            .host("db")
            .user("app")
            .password("hunter2")
            .dbname("core")
            .build()
            .unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_deserialize_humantime() {
        let json = r#"{
            "host": "db", "user": "app", "dbname": "core",
            "max_lifetime": "10m", "acquire_timeout": "2s"
        }"#;
        let config: PostgresConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_lifetime(), Duration::from_secs(600));
        assert_eq!(config.acquire_timeout(), Duration::from_secs(2));
        config.validate().unwrap();
    }
}
