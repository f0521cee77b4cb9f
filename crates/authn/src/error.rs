//! Authentication error types.
//!
//! [`AuthError`] carries full detail for logs. What a client may see is
//! limited to [`AuthError::status_code`] and [`AuthError::public_message`],
//! which never distinguish an unknown user from a wrong password or one
//! token check from another.

use thiserror::Error;
use touno_core_storage::StorageError;

/// Authentication and session errors.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`. New variants may be added in
/// minor releases; downstream match expressions must include a wildcard arm.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// Credentials did not match, or a token's session could not be resolved.
    #[error("Unauthorized: {reason}")]
    Unauthorized {
        /// Server-side detail, never sent to the client.
        reason: String,
    },

    /// The account exists but is banned.
    #[error("Account is banned")]
    AccountBanned,

    /// No account has the requested external id.
    #[error("Account not found")]
    AccountNotFound,

    /// Token structure, encoding or claim set is invalid.
    #[error("Malformed token: {message}")]
    MalformedToken {
        /// What was wrong with the token.
        message: String,
    },

    /// The token header declares an algorithm other than the pinned one.
    #[error("Unsupported algorithm: {message}")]
    UnsupportedAlgorithm {
        /// The rejected algorithm and why.
        message: String,
    },

    /// Signature verification failed.
    #[error("Invalid signature")]
    InvalidSignature,

    /// Current time is at or past the token's `exp`.
    #[error("Token expired")]
    TokenExpired,

    /// Current time is before the token's `nbf`.
    #[error("Token not yet valid")]
    TokenNotYetValid,

    /// Key pair generation failed.
    #[error("Key generation failed: {message}")]
    KeyGeneration {
        /// Underlying failure.
        message: String,
    },

    /// Stored key material could not be decoded.
    #[error("Key decode failed: {message}")]
    KeyDecode {
        /// Underlying failure.
        message: String,
    },

    /// Producing a token signature failed.
    #[error("Signing failed: {message}")]
    SigningFailed {
        /// Underlying failure.
        message: String,
    },

    /// The row store or cache failed.
    #[error("Storage error: {0}")]
    Storage(#[source] StorageError),
}

impl AuthError {
    /// Creates an [`AuthError::Unauthorized`].
    #[must_use]
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized { reason: reason.into() }
    }

    /// Creates an [`AuthError::MalformedToken`].
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedToken { message: message.into() }
    }

    /// Creates an [`AuthError::UnsupportedAlgorithm`].
    #[must_use]
    pub fn unsupported_algorithm(message: impl Into<String>) -> Self {
        Self::UnsupportedAlgorithm { message: message.into() }
    }

    /// Creates an [`AuthError::InvalidSignature`].
    #[must_use]
    pub fn invalid_signature() -> Self {
        Self::InvalidSignature
    }

    /// Creates an [`AuthError::TokenExpired`].
    #[must_use]
    pub fn token_expired() -> Self {
        Self::TokenExpired
    }

    /// Creates an [`AuthError::TokenNotYetValid`].
    #[must_use]
    pub fn token_not_yet_valid() -> Self {
        Self::TokenNotYetValid
    }

    /// Creates an [`AuthError::KeyGeneration`].
    #[must_use]
    pub fn key_generation(message: impl Into<String>) -> Self {
        Self::KeyGeneration { message: message.into() }
    }

    /// Creates an [`AuthError::KeyDecode`].
    #[must_use]
    pub fn key_decode(message: impl Into<String>) -> Self {
        Self::KeyDecode { message: message.into() }
    }

    /// Creates an [`AuthError::SigningFailed`].
    #[must_use]
    pub fn signing_failed(message: impl Into<String>) -> Self {
        Self::SigningFailed { message: message.into() }
    }

    /// HTTP status class for this error.
    ///
    /// Storage, key generation and signing failures are server faults (500);
    /// an unknown account is 404; every other kind is 401.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Storage(_) | Self::KeyGeneration { .. } | Self::SigningFailed { .. } => 500,
            Self::AccountNotFound => 404,
            _ => 401,
        }
    }

    /// The only text that may be returned to a client.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::AccountBanned => "Banned",
            Self::AccountNotFound => "Not found",
            _ if self.status_code() == 500 => "Internal server error",
            _ => "Unauthorized",
        }
    }

    /// Returns `true` for errors that mean the caller is not authenticated.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        self.status_code() < 500
    }
}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        AuthError::Storage(err)
    }
}

/// Result type alias for authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;
