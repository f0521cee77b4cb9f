//! Session authenticator settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use touno_core_storage::{ConfigError, DEFAULT_GC_INTERVAL, cache::validate_table_name};

use crate::token::DEFAULT_TOKEN_LIFETIME;

/// Default window in which a sign-in from the same origin reuses its session.
pub const DEFAULT_SESSION_REUSE_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Default cache table holding per-session public keys.
pub const DEFAULT_CACHE_TABLE: &str = "session";

/// Settings for [`SessionAuthenticator`](crate::SessionAuthenticator).
///
/// Durations deserialize from `humantime` strings:
///
/// ```
/// use std::time::Duration;
///
/// use touno_core_authn::AuthConfig;
///
/// let config: AuthConfig =
///     serde_json::from_str(r#"{ "token_lifetime": "12h", "cache_table": "web_session" }"#)
///         .unwrap();
/// assert_eq!(config.token_lifetime(), Duration::from_secs(12 * 3600));
/// assert_eq!(config.cache_table(), "web_session");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(with = "humantime_serde", default = "default_token_lifetime")]
    token_lifetime: Duration,
    #[serde(with = "humantime_serde", default = "default_session_reuse_window")]
    session_reuse_window: Duration,
    #[serde(default = "default_cache_table")]
    cache_table: String,
    #[serde(with = "humantime_serde", default = "default_gc_interval")]
    gc_interval: Duration,
}

fn default_token_lifetime() -> Duration {
    DEFAULT_TOKEN_LIFETIME
}

fn default_session_reuse_window() -> Duration {
    DEFAULT_SESSION_REUSE_WINDOW
}

fn default_cache_table() -> String {
    DEFAULT_CACHE_TABLE.to_owned()
}

fn default_gc_interval() -> Duration {
    DEFAULT_GC_INTERVAL
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_lifetime: DEFAULT_TOKEN_LIFETIME,
            session_reuse_window: DEFAULT_SESSION_REUSE_WINDOW,
            cache_table: default_cache_table(),
            gc_interval: DEFAULT_GC_INTERVAL,
        }
    }
}

#[bon::bon]
impl AuthConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a duration is zero or `cache_table` is not
    /// a plain lower-case SQL identifier.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_TOKEN_LIFETIME)] token_lifetime: Duration,
        #[builder(default = DEFAULT_SESSION_REUSE_WINDOW)] session_reuse_window: Duration,
        #[builder(into, default = default_cache_table())] cache_table: String,
        #[builder(default = DEFAULT_GC_INTERVAL)] gc_interval: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { token_lifetime, session_reuse_window, cache_table, gc_interval };
        config.validate()?;
        Ok(config)
    }

    /// Checks invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("token_lifetime", self.token_lifetime),
            ("session_reuse_window", self.session_reuse_window),
            ("gc_interval", self.gc_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::BelowMinimum {
                    field,
                    min: "1ms".into(),
                    value: "0s".into(),
                });
            }
        }
        validate_table_name(&self.cache_table)
    }

    /// Lifetime of issued tokens and of their cache entries.
    #[must_use]
    pub fn token_lifetime(&self) -> Duration {
        self.token_lifetime
    }

    /// How long after creation a session is reused for the same origin.
    #[must_use]
    pub fn session_reuse_window(&self) -> Duration {
        self.session_reuse_window
    }

    /// Cache table name.
    #[must_use]
    pub fn cache_table(&self) -> &str {
        &self.cache_table
    }

    /// Interval of the background cache sweep.
    #[must_use]
    pub fn gc_interval(&self) -> Duration {
        self.gc_interval
    }
}
