//! # touno core authentication
//!
//! Session-bound, asymmetric-key authentication.
//!
//! This crate provides:
//! - **Key lifecycle**: per-account RSA-2048 key generation, persistence and decoding
//! - **Token codec**: PS256-signed tokens with a pinned algorithm and staged verification
//! - **Session authenticator**: sign-in, authentication, sign-out and key rotation over a
//!   transactional store, with revocation through the expiring session cache
//!
//! ## Flow
//!
//! ```text
//! sign_in:      credentials ─► session establish/reuse ─► cache public key ─► sign ─► commit
//! authenticate: parse ─► resolve key from cache ─► verify signature ─► check window
//! sign_out:     delete session row + cache entry in one transaction
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use touno_core_authn::{AuthConfig, Credentials, SessionAuthenticator};
//! use touno_core_storage::{Database, clock::system_clock};
//!
//! # async fn example(db: Arc<dyn Database>) -> Result<(), Box<dyn std::error::Error>> {
//! let auth = SessionAuthenticator::new(db, AuthConfig::default(), system_clock())?;
//! let _gc = auth.spawn_cache_gc()?;
//!
//! let token = auth
//!     .sign_in(&Credentials::new("ann@example.com", "secret"), "10.0.0.7".parse()?)
//!     .await?;
//! let claims = auth.authenticate(&token).await?;
//! auth.sign_out(claims.session_id()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **`postgres`**: enables the PostgreSQL adapter in `touno-core-storage`
//! - **`testutil`**: in-memory account store, shared test keys and [`TestHarness`](testutil::TestHarness)
//! - **`failpoints`**: activates `fail` injection points in sign-in and sign-out

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Account records and credentials.
pub mod account;
/// Authenticator configuration.
pub mod config;
/// Authentication error types.
pub mod error;
/// Key pair lifecycle.
pub mod keys;
/// Session authenticator.
pub mod session;
mod sql;
/// Shared test utilities.
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;
/// Signed session tokens.
pub mod token;
/// Algorithm pinning.
pub mod validation;

// Re-export key types for convenience
pub use account::{Account, AccountLevel, AccountSummary, Credentials};
pub use config::AuthConfig;
pub use error::{AuthError, Result};
pub use keys::{KeyPair, PrivateKey, PublicKey};
pub use session::{CacheKeyResolver, Session, SessionAuthenticator};
pub use token::{KeyResolver, TokenClaims, TokenCodec, VerifyStage};
pub use validation::{FORBIDDEN_ALGORITHMS, PINNED_ALGORITHM, validate_algorithm};
