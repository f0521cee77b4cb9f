//! Token algorithm pinning.
//!
//! Tokens are accepted only when their header declares exactly the algorithm
//! the server signs with. The header's own claim is never used to choose a
//! verification method.
//!
//! # Security
//!
//! - `none` and the symmetric `HS*` family are always rejected
//! - every other algorithm, including other RSA variants such as `RS256`, is
//!   rejected unless it is the pinned one

use jsonwebtoken::Algorithm;

use crate::error::AuthError;

/// The single algorithm used for signing and accepted for verification.
///
/// RSASSA-PSS with SHA-256 and a salt as long as the hash.
pub const PINNED_ALGORITHM: Algorithm = Algorithm::PS256;

/// Header name of [`PINNED_ALGORITHM`].
pub const PINNED_ALGORITHM_NAME: &str = "PS256";

/// Algorithms that are never accepted.
///
/// - `none`: no signature at all
/// - `HS256`, `HS384`, `HS512`: shared-secret MACs, which would let a
///   public key be used as an HMAC secret
pub const FORBIDDEN_ALGORITHMS: &[&str] = &["none", "HS256", "HS384", "HS512"];

/// Validates a header algorithm against the pinned algorithm.
///
/// Matching is exact and case-sensitive, so `"None"` and `"ps256"` are
/// rejected as well.
///
/// # Errors
///
/// Returns [`AuthError::UnsupportedAlgorithm`] if `alg` is forbidden or is
/// not [`PINNED_ALGORITHM_NAME`].
///
/// # Examples
///
/// ```
/// use touno_core_authn::validation::validate_algorithm;
///
/// assert!(validate_algorithm("PS256").is_ok());
/// assert!(validate_algorithm("RS256").is_err());
/// assert!(validate_algorithm("none").is_err());
/// ```
pub fn validate_algorithm(alg: &str) -> Result<(), AuthError> {
    if FORBIDDEN_ALGORITHMS.iter().any(|f| f.eq_ignore_ascii_case(alg)) {
        return Err(AuthError::unsupported_algorithm(format!(
            "algorithm '{alg}' is not allowed for security reasons"
        )));
    }

    if alg != PINNED_ALGORITHM_NAME {
        return Err(AuthError::unsupported_algorithm(format!(
            "algorithm '{alg}' does not match pinned algorithm {PINNED_ALGORITHM_NAME}"
        )));
    }

    Ok(())
}
